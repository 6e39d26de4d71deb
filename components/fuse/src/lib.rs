// Copyright 2024 tessera
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod config;
mod err;
pub mod null;

use std::{
    ffi::OsStr,
    fmt::Display,
    sync::Arc,
    time::SystemTime,
};

pub use config::FuseConfig;
pub use err::FuseError;
use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use snafu::{ensure, OptionExt, ResultExt, Whatever};
use tessera_common::{DOT, DOT_DOT, MAX_NAME_LENGTH};
use tessera_types::{
    entry::{DirEntry, Entry},
    ino::Ino,
    ToErrno,
};
use tessera_vfs::TesseraVFS;
use tokio::runtime;
use tracing::{debug, field, info, instrument, warn, Instrument};

use crate::err::{FilenameTooLongSnafu, InvalidFileNameSnafu, UnsupportedRenameSnafu};

/// Names are checked here so the VFS only ever sees valid UTF-8 names that
/// fit in a directory entry.
fn check_name(name: &OsStr) -> err::Result<&str> {
    let valid = name.to_str().context(InvalidFileNameSnafu { name })?;
    ensure!(valid.len() <= MAX_NAME_LENGTH, FilenameTooLongSnafu { name });
    Ok(valid)
}

/// `.` and `..` followed by the backend listing, in kernel offset order.
/// Every entry carries the kernel id, never the backend inode.
fn dir_listing(
    ino: Ino,
    parent: Ino,
    entries: Vec<(Ino, DirEntry)>,
) -> Vec<(u64, FileType, String)> {
    let mut listing = Vec::with_capacity(entries.len() + 2);
    listing.push((ino.0, FileType::Directory, DOT.to_string()));
    listing.push((parent.0, FileType::Directory, DOT_DOT.to_string()));
    listing.extend(
        entries
            .into_iter()
            .map(|(id, e)| (id.0, e.file_type(), e.name)),
    );
    listing
}

/// Missing entries are routine, everything else is worth a warning.
fn log_errno<E: ToErrno + Display>(op: &str, e: E) -> c_int {
    let errno = e.to_errno();
    if errno == libc::ENOENT {
        debug!("{op}: {e}");
    } else {
        warn!("{op} failed with errno {errno}: {e}");
    }
    errno
}

macro_rules! valid_name {
    ($name:expr, $reply:expr) => {
        match check_name($name) {
            Ok(n) => n,
            Err(e) => {
                $reply.error(log_errno("check name", e));
                return;
            }
        }
    };
}

#[derive(Debug)]
pub struct TesseraFuse {
    config:  FuseConfig,
    vfs:     Arc<TesseraVFS>,
    runtime: runtime::Runtime,
}

impl TesseraFuse {
    pub fn create(fuse_config: FuseConfig, vfs: TesseraVFS) -> Result<Self, Whatever> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(fuse_config.async_work_threads)
            .thread_name("tessera-fuse-async-runtime")
            .enable_all()
            .build()
            .with_whatever_context(|e| format!("unable to build tokio runtime {e}"))?;
        info!(
            "build tokio runtime with {} working threads",
            fuse_config.async_work_threads
        );
        Ok(Self {
            config: fuse_config,
            vfs: Arc::new(vfs),
            runtime,
        })
    }

    fn reply_entry(&self, reply: ReplyEntry, entry: Entry) {
        reply.entry(
            &self.vfs.get_entry_ttl(entry.attr.kind),
            &entry.attr.to_fuse_attr(entry.ino),
            1,
        );
    }
}

impl Filesystem for TesseraFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if let Err(nearest) = config.set_max_readahead(self.config.max_readahead) {
            warn!(
                "max readahead {} rejected, use {nearest}",
                self.config.max_readahead
            );
            let _ = config.set_max_readahead(nearest);
        }
        if let Err(nearest) = config.set_max_write(self.config.max_write) {
            warn!("max write {} rejected, use {nearest}", self.config.max_write);
            let _ = config.set_max_write(nearest);
        }
        info!(
            "tessera serves {}, buffer size {} readahead {}",
            self.config.mount_point.display(),
            self.config.max_write,
            self.config.max_readahead
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "tessera on {} stopped, {} nodes known, {} handles open",
            self.config.mount_point.display(),
            self.vfs.known_nodes(),
            self.vfs.open_handles()
        );
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=parent, name=?name))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = valid_name!(name, reply);
        match self
            .runtime
            .block_on(self.vfs.lookup(Ino(parent), name).in_current_span())
        {
            Ok(entry) => self.reply_entry(reply, entry),
            Err(e) => reply.error(log_errno("lookup", e)),
        }
    }

    #[instrument(level="debug", skip_all, fields(req=_req.unique(), ino=ino, nlookup=nlookup))]
    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.runtime
            .block_on(self.vfs.forget(Ino(ino), nlookup).in_current_span());
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=ino))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self
            .runtime
            .block_on(self.vfs.get_attr(Ino(ino)).in_current_span())
        {
            Ok(attr) => reply.attr(&self.vfs.get_attr_ttl(), &attr.to_fuse_attr(ino)),
            Err(e) => reply.error(log_errno("getattr", e)),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=_req.unique(), ino=ino, size=?size))]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self
            .runtime
            .block_on(self.vfs.set_attr(Ino(ino)).in_current_span())
        {
            Ok(attr) => reply.attr(&self.vfs.get_attr_ttl(), &attr.to_fuse_attr(ino)),
            Err(e) => reply.error(log_errno("setattr", e)),
        }
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=ino, offset=offset))]
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ino = Ino(ino);
        let vfs = self.vfs.clone();
        let listing = self.runtime.block_on(
            async move {
                let entries = vfs.read_dir_with_ids(ino).await?;
                let parent = match vfs.node(ino) {
                    Some(node) => node.parent().await.map_or(ino, |p| p.id()),
                    None => ino,
                };
                Ok::<_, tessera_vfs::Error>(dir_listing(ino, parent, entries))
            }
            .in_current_span(),
        );
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(log_errno("readdir", e));
                return;
            }
        };

        debug!("{} entries in {ino}", listing.len());
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    #[instrument(level="warn", skip_all, fields(req=_req.unique(), parent=parent, name=?name))]
    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = valid_name!(name, reply);
        match self
            .runtime
            .block_on(self.vfs.mkdir(Ino(parent), name).in_current_span())
        {
            Ok(entry) => self.reply_entry(reply, entry),
            Err(e) => reply.error(log_errno("mkdir", e)),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=_req.unique(), parent=parent, name=?name))]
    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = valid_name!(name, reply);
        match self
            .runtime
            .block_on(self.vfs.unlink(Ino(parent), name).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_errno("unlink", e)),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=_req.unique(), parent=parent, name=?name))]
    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = valid_name!(name, reply);
        match self
            .runtime
            .block_on(self.vfs.rmdir(Ino(parent), name).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_errno("rmdir", e)),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=_req.unique(), parent=parent, name=?name, newparent=newparent, newname=?newname))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // overwriting is refused anyway, so only NOREPLACE is meaningful.
        if flags & !libc::RENAME_NOREPLACE != 0 {
            let e = UnsupportedRenameSnafu { flags }.build();
            reply.error(log_errno("rename", e));
            return;
        }
        let name = valid_name!(name, reply);
        let newname = valid_name!(newname, reply);
        match self.runtime.block_on(
            self.vfs
                .rename(Ino(parent), name, Ino(newparent), newname)
                .in_current_span(),
        ) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_errno("rename", e)),
        }
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=ino, pid=_req.pid(), fh=field::Empty))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self
            .runtime
            .block_on(self.vfs.open(Ino(ino), flags).in_current_span())
        {
            Ok(opened) => {
                tracing::Span::current().record("fh", opened.fh);
                reply.opened(opened.fh, opened.flags)
            }
            Err(e) => reply.error(log_errno("open", e)),
        }
    }

    #[instrument(level="debug", skip_all, fields(req=_req.unique(), ino=ino, fh=fh, offset=offset, size=size))]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self
            .runtime
            .block_on(self.vfs.read(Ino(ino), fh, offset, size).in_current_span())
        {
            Ok(data) => {
                debug!("read {} bytes", data.len());
                reply.data(&data)
            }
            Err(e) => reply.error(log_errno("read", e)),
        }
    }

    #[instrument(level="debug", skip_all, fields(req=_req.unique(), ino=ino, fh=fh, offset=offset, length=data.len()))]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self
            .runtime
            .block_on(self.vfs.write(Ino(ino), fh, offset, data).in_current_span())
        {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(log_errno("write", e)),
        }
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=ino, fh=fh))]
    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self
            .runtime
            .block_on(self.vfs.flush(Ino(ino), fh).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_errno("flush", e)),
        }
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=ino, fh=fh, flush=flush))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let released = self
            .runtime
            .block_on(self.vfs.close(Ino(ino), fh, flush).in_current_span());
        match released {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_errno("release", e)),
        }
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique(), ino=ino, fh=fh, datasync=datasync))]
    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self
            .runtime
            .block_on(self.vfs.fsync(Ino(ino), fh, datasync).in_current_span())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_errno("fsync", e)),
        }
    }

    #[instrument(level="info", skip_all, fields(req=_req.unique()))]
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.runtime.block_on(self.vfs.stat_fs().in_current_span()) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                // the backend does not count files.
                0,
                0,
                st.block_size,
                st.name_len,
                st.block_size,
            ),
            Err(e) => reply.error(log_errno("statfs", e)),
        }
    }

    #[instrument(level="warn", skip_all, fields(req=_req.unique(), parent=parent, name=?name, fh=field::Empty))]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = valid_name!(name, reply);
        match self
            .runtime
            .block_on(self.vfs.create(Ino(parent), name, flags).in_current_span())
        {
            Ok((entry, opened)) => {
                tracing::Span::current().record("fh", opened.fh);
                reply.created(
                    &self.vfs.get_entry_ttl(entry.attr.kind),
                    &entry.attr.to_fuse_attr(entry.ino),
                    1,
                    opened.fh,
                    opened.flags,
                )
            }
            Err(e) => reply.error(log_errno("create", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use rstest::rstest;
    use tessera_types::ino::UNKNOWN_INO;

    use super::*;

    #[rstest]
    #[case::plain("a.txt".to_string(), None)]
    #[case::longest("x".repeat(MAX_NAME_LENGTH), None)]
    #[case::too_long("x".repeat(MAX_NAME_LENGTH + 1), Some(libc::ENAMETOOLONG))]
    fn name_checks(#[case] name: String, #[case] errno: Option<c_int>) {
        let got = check_name(OsStr::new(&name)).err().map(|e| e.to_errno());
        assert_eq!(got, errno);
    }

    #[test]
    fn non_utf8_name() {
        use std::os::unix::ffi::OsStringExt;

        let name = OsString::from_vec(vec![b'a', 0xff, b'b']);
        assert_eq!(check_name(&name).unwrap_err().to_errno(), libc::EINVAL);
    }

    #[test]
    fn listing_starts_with_dots() {
        let listing = dir_listing(Ino(5), Ino(1), vec![
            (Ino(7), DirEntry::new("d", 9, false)),
            (UNKNOWN_INO, DirEntry::new("f", 10, true)),
        ]);
        let names: Vec<_> = listing.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, [".", "..", "d", "f"]);
        let ids: Vec<_> = listing.iter().map(|(id, ..)| *id).collect();
        assert_eq!(ids, [5, 1, 7, UNKNOWN_INO.0]);
        assert_eq!(listing[2].1, FileType::Directory);
        assert_eq!(listing[3].1, FileType::RegularFile);
    }
}
