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

use std::{fmt::Debug, sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use fuser::{consts::FOPEN_DIRECT_IO, FileType};
use snafu::{ensure, OptionExt};
use tessera_common::FH;
use tessera_meta::{BackendOp, MetaClientRef};
use tessera_types::{
    attr::NodeAttr,
    entry::{DirEntry, Entry},
    ino::{Ino, ROOT_INO},
    stat::FSStat,
};
use tracing::{debug, instrument};

use crate::{
    config::Config,
    dir::DirNode,
    err::{
        backend_error, IsDirectorySnafu, LibcSnafu, NotDirectorySnafu, Result, UnknownNodeSnafu,
    },
    file::{wants_write, FileNode},
    handle::HandleTable,
    node::{Node, NodeCtx, NodeCtxRef},
};

/// The reply to open and create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub fh:    FH,
    /// FUSE open flags, always direct I/O.
    pub flags: u32,
    pub inode: Ino,
}

/// The operation dispatcher. It owns the node tree, the table of nodes the
/// kernel knows by id and the table of open file handles.
pub struct TesseraVFS {
    config:  Config,
    ctx:     NodeCtxRef,
    root:    Arc<DirNode>,
    nodes:   DashMap<Ino, Node>,
    handles: HandleTable,
}

impl Debug for TesseraVFS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesseraVFS")
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl TesseraVFS {
    pub fn new(config: Config, client: MetaClientRef) -> Self {
        let ctx = NodeCtx::new(client);
        let root = DirNode::new_root(ctx.clone());
        let nodes = DashMap::new();
        nodes.insert(ROOT_INO, Node::Dir(root.clone()));
        Self {
            config,
            ctx,
            root,
            nodes,
            handles: HandleTable::new(),
        }
    }

    pub fn root(&self) -> Arc<DirNode> { self.root.clone() }

    /// The node the kernel knows as `ino`.
    pub fn node(&self, ino: Ino) -> Option<Node> { self.nodes.get(&ino).map(|n| n.value().clone()) }

    pub fn known_nodes(&self) -> usize { self.nodes.len() }

    pub fn open_handles(&self) -> usize { self.handles.len() }

    pub fn get_entry_ttl(&self, kind: FileType) -> Duration {
        if kind == FileType::Directory {
            self.config.dir_entry_timeout
        } else {
            self.config.file_entry_timeout
        }
    }

    pub fn get_attr_ttl(&self) -> Duration { self.config.attr_timeout }

    fn find_node(&self, ino: Ino) -> Result<Node> { self.node(ino).context(UnknownNodeSnafu { ino }) }

    fn find_dir(&self, ino: Ino) -> Result<Arc<DirNode>> {
        match self.find_node(ino)? {
            Node::Dir(d) => Ok(d),
            Node::File(_) => NotDirectorySnafu { ino }.fail(),
        }
    }

    fn find_file(&self, ino: Ino) -> Result<Arc<FileNode>> {
        match self.find_node(ino)? {
            Node::File(f) => Ok(f),
            Node::Dir(_) => IsDirectorySnafu { ino }.fail(),
        }
    }

    /// Registers `node` as known to the kernel, then drops the pending
    /// reference its directory handed out. The lookup count goes up before
    /// the table insert so a racing forget never removes a node that is
    /// being handed out.
    async fn hand_to_kernel(&self, parent: &Arc<DirNode>, node: Node) -> Entry {
        node.lookups().inc();
        self.nodes.insert(node.id(), node.clone());
        parent.settle(&node).await;
        Entry {
            ino:  node.id(),
            attr: node.attr().await,
        }
    }

    pub async fn get_attr(&self, ino: Ino) -> Result<NodeAttr> {
        Ok(self.find_node(ino)?.attr().await)
    }

    /// Attribute changes are accepted and ignored.
    pub async fn set_attr(&self, ino: Ino) -> Result<NodeAttr> {
        debug!("setattr on {ino} is ignored");
        self.get_attr(ino).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn lookup(&self, parent: Ino, name: &str) -> Result<Entry> {
        let dir = self.find_dir(parent)?;
        let node = dir.lookup(name).await?;
        Ok(self.hand_to_kernel(&dir, node).await)
    }

    pub async fn read_dir(&self, ino: Ino) -> Result<Vec<DirEntry>> {
        self.find_dir(ino)?.read_dir_all().await
    }

    /// The listing of `ino`, each entry paired with the id the kernel sees
    /// for it, so `d_ino` agrees with lookup and getattr.
    pub async fn read_dir_with_ids(&self, ino: Ino) -> Result<Vec<(Ino, DirEntry)>> {
        let dir = self.find_dir(ino)?;
        let entries = dir.read_dir_all().await?;
        let ids = dir.listed_ids(&entries).await;
        Ok(ids.into_iter().zip(entries).collect())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn create(&self, parent: Ino, name: &str, flags: i32) -> Result<(Entry, Opened)> {
        let dir = self.find_dir(parent)?;
        let file = dir.create(name, flags).await?;
        // the creator is the writer whatever its access mode.
        let fh = self.handles.new_file_handle(file.clone(), flags, true);
        let entry = self.hand_to_kernel(&dir, Node::File(file)).await;
        Ok((entry, Opened {
            fh,
            flags: FOPEN_DIRECT_IO,
            inode: entry.ino,
        }))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn mkdir(&self, parent: Ino, name: &str) -> Result<Entry> {
        let dir = self.find_dir(parent)?;
        let child = dir.mkdir(name).await?;
        Ok(self.hand_to_kernel(&dir, Node::Dir(child)).await)
    }

    pub async fn unlink(&self, parent: Ino, name: &str) -> Result<()> {
        self.remove(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: Ino, name: &str) -> Result<()> {
        self.remove(parent, name, true).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&self, parent: Ino, name: &str, is_dir: bool) -> Result<()> {
        self.find_dir(parent)?.remove(name, is_dir).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn rename(
        &self,
        parent: Ino,
        name: &str,
        new_parent: Ino,
        new_name: &str,
    ) -> Result<()> {
        let dir = self.find_dir(parent)?;
        let new_dir = self.find_dir(new_parent)?;
        dir.rename(name, &new_dir, new_name).await
    }

    pub async fn open(&self, ino: Ino, flags: i32) -> Result<Opened> {
        let file = self.find_file(ino)?;
        file.open(flags).await?;
        let fh = self
            .handles
            .new_file_handle(file, flags, wants_write(flags));
        Ok(Opened {
            fh,
            flags: FOPEN_DIRECT_IO,
            inode: ino,
        })
    }

    pub async fn release(&self, ino: Ino, fh: FH) -> Result<()> {
        let h = self.handles.release_file_handle(ino, fh)?;
        debug!("release {} of {ino}, open flags {:#o}", h.fh, h.flags);
        h.node.release(fh, h.write).await;
        Ok(())
    }

    /// The kernel's RELEASE, flushing first when asked. The handle is
    /// dropped even when the flush fails; that error is returned after.
    pub async fn close(&self, ino: Ino, fh: FH, flush: bool) -> Result<()> {
        let flushed = if flush {
            self.flush(ino, fh).await
        } else {
            Ok(())
        };
        self.release(ino, fh).await?;
        flushed
    }

    pub async fn read(&self, ino: Ino, fh: FH, offset: i64, size: u32) -> Result<Bytes> {
        ensure!(offset >= 0, LibcSnafu {
            errno: libc::EINVAL
        });
        let h = self.handles.find_handle(ino, fh)?;
        h.node.read(fh, offset as u64, size).await
    }

    /// Appends `data` through the session of `fh`. The backend writes
    /// sequentially, `offset` is informational.
    pub async fn write(&self, ino: Ino, fh: FH, offset: i64, data: &[u8]) -> Result<u32> {
        let h = self.handles.find_handle(ino, fh)?;
        ensure!(h.write, LibcSnafu {
            errno: libc::EBADF
        });
        debug!("write {} bytes at {offset} to {ino}", data.len());
        h.node.write(fh, data).await
    }

    pub async fn flush(&self, ino: Ino, fh: FH) -> Result<()> {
        self.handles.find_handle(ino, fh)?.node.flush().await
    }

    pub async fn fsync(&self, ino: Ino, fh: FH, datasync: bool) -> Result<()> {
        debug!("fsync {ino} datasync: {datasync}");
        self.handles.find_handle(ino, fh)?.node.flush().await
    }

    /// The kernel dropped `nlookup` references to `ino`. At zero the node
    /// leaves its directory's cache (unless a lookup holds it) and the
    /// node table.
    pub async fn forget(&self, ino: Ino, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(node) = self.node(ino) else {
            debug!("forget of unknown node {ino}");
            return;
        };
        if node.lookups().sub(nlookup) > 0 {
            return;
        }

        let ident = node.identity().await;
        if let Some(parent) = ident.parent() {
            if !ident.is_detached() {
                parent.forget_child(&ident.name, &node).await;
            }
        }
        if self
            .nodes
            .remove_if(&ino, |_, n| n.lookups().get() == 0)
            .is_some()
        {
            debug!("forgot {ino} ({:?})", ident.name);
        }
    }

    pub async fn stat_fs(&self) -> Result<FSStat> {
        let info = self
            .ctx
            .client
            .volume_info(&self.config.volume_id)
            .await
            .map_err(|code| backend_error(BackendOp::VolumeInfo, code))?;
        Ok(FSStat::from_space(info.total_space, info.free_space))
    }
}

#[cfg(test)]
mod tests {
    use tessera_common::ROOT_BACKEND_INODE;
    use tessera_meta::{MemoryClient, MetaClient, ResultCode};
    use tessera_types::ToErrno;

    use super::*;

    mod test_utils {
        use rstest::fixture;

        use super::*;

        pub const VOLUME: &str = "vol-test";

        pub struct VfsTestEnv {
            pub vfs:    Arc<TesseraVFS>,
            /// The backend, also used to play "another client".
            pub client: Arc<MemoryClient>,
        }

        pub fn make_env(capacity: u64) -> VfsTestEnv {
            tessera_utils::logger::install_fmt_log();
            let client = Arc::new(MemoryClient::new(VOLUME, capacity));
            let vfs = TesseraVFS::new(Config::default().with_volume(VOLUME), client.clone());
            VfsTestEnv {
                vfs: Arc::new(vfs),
                client,
            }
        }

        #[fixture]
        pub async fn vfs_env() -> VfsTestEnv { make_env(1 << 30) }

        pub fn errno<T: Debug>(r: Result<T>) -> i32 {
            r.expect_err("expected an error").to_errno()
        }

        pub async fn file_of(vfs: &TesseraVFS, ino: Ino) -> Arc<FileNode> {
            vfs.node(ino).unwrap().as_file().unwrap().clone()
        }
    }

    mod identity {
        use rstest::rstest;

        use super::{test_utils::*, *};

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn repeated_lookup_returns_same_node(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            env.client
                .create_file(ROOT_BACKEND_INODE, "a", libc::O_RDWR)
                .await
                .unwrap();

            let first = env.vfs.lookup(ROOT_INO, "a").await?;
            let second = env.vfs.lookup(ROOT_INO, "a").await?;
            assert_eq!(first.ino, second.ino);
            // the second lookup is answered from memory.
            assert_eq!(env.client.calls(BackendOp::StatByName), 1);

            let child = env.vfs.root().child("a").await.unwrap();
            assert!(child.node.ptr_eq(&env.vfs.node(first.ino).unwrap()));
            assert!(child.kernel);
            assert_eq!(child.refs, 0);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn lookup_missing_name(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            assert_eq!(errno(env.vfs.lookup(ROOT_INO, "nope").await), libc::ENOENT);
            assert!(env.vfs.root().child("nope").await.is_none());

            env.client.fail_next(BackendOp::StatByName, ResultCode(5));
            assert_eq!(errno(env.vfs.lookup(ROOT_INO, "nope").await), libc::EIO);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn lookup_in_subdirectory(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let d = env.vfs.mkdir(ROOT_INO, "d").await?;
            assert!(d.attr.is_dir());
            let (f, opened) = env.vfs.create(d.ino, "f", libc::O_WRONLY).await?;
            env.vfs.release(f.ino, opened.fh).await?;

            let found = env.vfs.lookup(d.ino, "f").await?;
            assert_eq!(found.ino, f.ino);
            assert_eq!(errno(env.vfs.lookup(f.ino, "x").await), libc::ENOTDIR);
            assert_eq!(errno(env.vfs.lookup(Ino(999), "x").await), libc::ENOENT);
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_lookups_share_one_node() -> Result<()> {
            use tokio::task::JoinSet;

            let env = make_env(1 << 20);
            env.client
                .create_file(ROOT_BACKEND_INODE, "a", 0)
                .await
                .unwrap();

            let mut tasks: JoinSet<Result<Ino>> = JoinSet::new();
            for _ in 0..16 {
                let vfs = env.vfs.clone();
                tasks.spawn(async move { Ok(vfs.lookup(ROOT_INO, "a").await?.ino) });
            }
            let mut ids = vec![];
            while let Some(r) = tasks.join_next().await {
                ids.push(r.unwrap()?);
            }
            ids.dedup();
            assert_eq!(ids.len(), 1);

            let node = env.vfs.node(ids[0]).unwrap();
            assert_eq!(node.lookups().get(), 16);
            assert_eq!(env.vfs.root().child("a").await.unwrap().refs, 0);
            assert_eq!(env.client.calls(BackendOp::StatByName), 1);
            Ok(())
        }
    }

    mod handles {
        use proptest::prelude::*;
        use rstest::rstest;

        use super::{test_utils::*, *};

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn release_after_failed_flush(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (entry, created) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;

            env.client.fail_next(BackendOp::Flush, ResultCode::FAILED);
            assert_eq!(
                errno(env.vfs.close(entry.ino, created.fh, true).await),
                libc::EIO
            );
            assert_eq!(env.vfs.open_handles(), 0);
            let counters = file_of(&env.vfs, entry.ino).await.counters().await;
            assert_eq!(counters.handles, 0);
            assert_eq!(counters.writers, 0);
            assert!(!counters.has_session);

            let writer = env.vfs.open(entry.ino, libc::O_WRONLY).await?;
            env.vfs.close(entry.ino, writer.fh, true).await?;
            assert_eq!(env.vfs.open_handles(), 0);
            assert_eq!(
                errno(env.vfs.close(entry.ino, writer.fh, false).await),
                libc::EBADF
            );
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_writers_only_one_wins() -> Result<()> {
            use tokio::task::JoinSet;

            let env = make_env(1 << 20);
            let (entry, created) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            env.vfs.release(entry.ino, created.fh).await?;

            let mut tasks: JoinSet<Result<Opened>> = JoinSet::new();
            for _ in 0..8 {
                let vfs = env.vfs.clone();
                tasks.spawn(async move { vfs.open(entry.ino, libc::O_WRONLY).await });
            }
            let (mut won, mut refused) = (0, 0);
            while let Some(r) = tasks.join_next().await {
                match r.unwrap() {
                    Ok(_) => won += 1,
                    Err(e) => {
                        assert_eq!(e.to_errno(), libc::EPERM);
                        refused += 1;
                    }
                }
            }
            assert_eq!((won, refused), (1, 7));

            let counters = file_of(&env.vfs, entry.ino).await.counters().await;
            assert_eq!(counters.handles, 1);
            assert_eq!(counters.writers, 1);
            assert_eq!(env.vfs.open_handles(), 1);
            assert_eq!(env.client.calls(BackendOp::OpenFile), 1);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn create_opens_for_write(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (entry, opened) = env
                .vfs
                .create(ROOT_INO, "a", libc::O_CREAT | libc::O_RDWR)
                .await?;
            assert_eq!(opened.flags, FOPEN_DIRECT_IO);
            assert_eq!(opened.inode, entry.ino);

            let child = env.vfs.root().child("a").await.unwrap();
            assert_eq!(child.node.id(), entry.ino);
            let counters = file_of(&env.vfs, entry.ino).await.counters().await;
            assert_eq!(counters.handles, 1);
            assert_eq!(counters.writers, 1);
            assert!(counters.has_session);

            assert_eq!(
                errno(env.vfs.create(ROOT_INO, "a", libc::O_RDWR).await),
                libc::EEXIST
            );
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn second_writer_is_refused(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (entry, created) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;

            assert_eq!(
                errno(env.vfs.open(entry.ino, libc::O_WRONLY).await),
                libc::EPERM
            );
            assert_eq!(
                errno(env.vfs.open(entry.ino, libc::O_RDWR).await),
                libc::EPERM
            );

            // readers are fine and share the session.
            let reader = env.vfs.open(entry.ino, libc::O_RDONLY).await?;
            assert_eq!(env.client.calls(BackendOp::OpenFile), 0);
            assert_eq!(env.client.calls(BackendOp::NotifyAdditionalOpen), 1);

            env.vfs.release(entry.ino, created.fh).await?;
            assert_eq!(env.client.calls(BackendOp::CloseConnections), 1);
            let writer = env.vfs.open(entry.ino, libc::O_WRONLY).await?;

            let counters = file_of(&env.vfs, entry.ino).await.counters().await;
            assert_eq!(counters.handles, 2);
            assert_eq!(counters.writers, 1);

            env.vfs.release(entry.ino, writer.fh).await?;
            env.vfs.release(entry.ino, reader.fh).await?;
            let counters = file_of(&env.vfs, entry.ino).await.counters().await;
            assert_eq!(counters.handles, 0);
            assert!(!counters.has_session);
            assert_eq!(env.vfs.open_handles(), 0);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn open_rules(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (entry, created) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            env.vfs.release(entry.ino, created.fh).await?;

            assert_eq!(
                errno(env.vfs.open(entry.ino, libc::O_WRONLY | libc::O_TRUNC).await),
                libc::EPERM
            );

            env.client.fail_next(BackendOp::OpenFile, ResultCode::NOT_FOUND);
            assert_eq!(
                errno(env.vfs.open(entry.ino, libc::O_RDONLY).await),
                libc::EIO
            );
            let counters = file_of(&env.vfs, entry.ino).await.counters().await;
            assert_eq!(counters.handles, 0);

            assert_eq!(
                errno(env.vfs.open(ROOT_INO, libc::O_RDONLY).await),
                libc::EISDIR
            );
            assert_eq!(
                errno(env.vfs.release(entry.ino, 4242).await),
                libc::EBADF
            );
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn read_at_end_of_file(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (entry, opened) = env.vfs.create(ROOT_INO, "a", libc::O_RDWR).await?;
            assert_eq!(env.vfs.write(entry.ino, opened.fh, 0, b"hello").await?, 5);

            for size in [0, 1, 4096] {
                let data = env.vfs.read(entry.ino, opened.fh, 5, size).await?;
                assert!(data.is_empty());
            }
            assert_eq!(env.client.calls(BackendOp::Read), 0);

            let data = env.vfs.read(entry.ino, opened.fh, 1, 100).await?;
            assert_eq!(data.as_ref(), b"ello");
            let file = file_of(&env.vfs, entry.ino).await;
            assert_eq!(file.cursor(opened.fh).await.unwrap().last_offset, 5);

            env.client.fail_next(BackendOp::Read, ResultCode::FAILED);
            assert_eq!(
                errno(env.vfs.read(entry.ino, opened.fh, 0, 10).await),
                libc::EIO
            );
            assert_eq!(
                errno(env.vfs.read(entry.ino, opened.fh, -1, 10).await),
                libc::EINVAL
            );

            let attr = env.vfs.get_attr(entry.ino).await?;
            assert_eq!(attr.size, 5);
            assert_eq!(env.vfs.set_attr(entry.ino).await?, attr);
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn write_errors() -> Result<()> {
            let env = make_env(8);
            let (entry, opened) = env.vfs.create(ROOT_INO, "a", libc::O_RDWR).await?;
            assert_eq!(env.vfs.write(entry.ino, opened.fh, 0, b"1234").await?, 4);
            assert_eq!(
                errno(env.vfs.write(entry.ino, opened.fh, 4, b"56789").await),
                libc::ENOSPC
            );
            env.client.fail_next(BackendOp::Write, ResultCode(-5));
            assert_eq!(
                errno(env.vfs.write(entry.ino, opened.fh, 4, b"5").await),
                libc::EIO
            );

            env.vfs.flush(entry.ino, opened.fh).await?;
            env.vfs.fsync(entry.ino, opened.fh, true).await?;
            assert_eq!(env.client.calls(BackendOp::Flush), 2);
            env.client.fail_next(BackendOp::Flush, ResultCode::FAILED);
            assert_eq!(errno(env.vfs.flush(entry.ino, opened.fh).await), libc::EIO);

            env.vfs.release(entry.ino, opened.fh).await?;
            let reader = env.vfs.open(entry.ino, libc::O_RDONLY).await?;
            assert_eq!(
                errno(env.vfs.write(entry.ino, reader.fh, 0, b"x").await),
                libc::EBADF
            );
            Ok(())
        }

        #[derive(Debug, Clone)]
        enum Step {
            Open { write: bool },
            Release(usize),
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![
                any::<bool>().prop_map(|write| Step::Open { write }),
                any::<usize>().prop_map(Step::Release),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn handle_accounting(steps in prop::collection::vec(step(), 1..40)) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async move {
                    let env = make_env(1 << 20);
                    let (entry, created) = env.vfs.create(ROOT_INO, "f", libc::O_RDWR).await.unwrap();
                    env.vfs.release(entry.ino, created.fh).await.unwrap();
                    let file = file_of(&env.vfs, entry.ino).await;

                    let mut open: Vec<(FH, bool)> = vec![];
                    for step in steps {
                        match step {
                            Step::Open { write } => {
                                let flags = if write { libc::O_WRONLY } else { libc::O_RDONLY };
                                let writer_open = open.iter().any(|(_, w)| *w);
                                match env.vfs.open(entry.ino, flags).await {
                                    Ok(opened) => {
                                        assert!(!(write && writer_open));
                                        open.push((opened.fh, write));
                                    }
                                    Err(e) => {
                                        assert!(write && writer_open);
                                        assert_eq!(e.to_errno(), libc::EPERM);
                                    }
                                }
                            }
                            Step::Release(i) => {
                                if open.is_empty() {
                                    continue;
                                }
                                let (fh, _) = open.remove(i % open.len());
                                env.vfs.release(entry.ino, fh).await.unwrap();
                            }
                        }
                        let counters = file.counters().await;
                        assert_eq!(counters.handles as usize, open.len());
                        assert_eq!(counters.writers as usize, open.iter().filter(|(_, w)| *w).count());
                        assert_eq!(counters.has_session, !open.is_empty());
                        assert!(counters.writers <= 1);
                    }
                });
            }
        }
    }

    mod namespace {
        use rstest::rstest;

        use super::{test_utils::*, *};

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn unlink_detaches_open_file(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (entry, opened) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            let node = env.vfs.node(entry.ino).unwrap();

            env.vfs.unlink(ROOT_INO, "a").await?;
            assert!(env.vfs.root().child("a").await.is_none());
            assert_eq!(node.name().await, "");

            // the handle still writes into the unlinked file.
            assert_eq!(env.vfs.write(entry.ino, opened.fh, 0, b"late").await?, 4);
            env.vfs.flush(entry.ino, opened.fh).await?;

            assert_eq!(errno(env.vfs.lookup(ROOT_INO, "a").await), libc::ENOENT);

            // a new file under the old name is a new node.
            let (again, again_fh) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            assert_ne!(again.ino, entry.ino);
            assert_eq!(node.name().await, "");

            env.vfs.release(entry.ino, opened.fh).await?;
            env.vfs.release(again.ino, again_fh.fh).await?;
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn remove_errors(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let d = env.vfs.mkdir(ROOT_INO, "d").await?;
            let (f, opened) = env.vfs.create(d.ino, "f", libc::O_WRONLY).await?;
            env.vfs.release(f.ino, opened.fh).await?;

            assert_eq!(errno(env.vfs.rmdir(ROOT_INO, "d").await), libc::EPERM);
            assert_eq!(errno(env.vfs.unlink(ROOT_INO, "none").await), libc::EPERM);
            env.client.fail_next(BackendOp::DeleteFile, ResultCode::FAILED);
            assert_eq!(errno(env.vfs.unlink(d.ino, "f").await), libc::EIO);
            // a failed remove keeps the node resident.
            assert!(env.vfs.node(d.ino).unwrap().as_dir().unwrap().child("f").await.is_some());

            env.vfs.unlink(d.ino, "f").await?;
            env.vfs.rmdir(ROOT_INO, "d").await?;
            assert_eq!(errno(env.vfs.read_dir(d.ino).await), libc::ENOENT);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn mkdir_codes(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            for (code, expected) in [
                (ResultCode::FAILED, libc::EIO),
                (ResultCode::NOT_PERMITTED, libc::EPERM),
                (ResultCode::NOT_FOUND, libc::ENOENT),
                (ResultCode::EXISTS, libc::EEXIST),
            ] {
                env.client.fail_next(BackendOp::CreateDir, code);
                assert_eq!(errno(env.vfs.mkdir(ROOT_INO, "d").await), expected);
            }
            assert_eq!(env.vfs.root().resident_count().await, 0);

            let d = env.vfs.mkdir(ROOT_INO, "d").await?;
            let child = env.vfs.root().child("d").await.unwrap();
            assert!(child.kernel);
            assert_eq!(child.node.id(), d.ino);
            assert_eq!(errno(env.vfs.mkdir(ROOT_INO, "d").await), libc::EEXIST);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn read_dir_is_backend_listing(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            env.vfs.mkdir(ROOT_INO, "d").await?;
            env.client
                .create_file(ROOT_BACKEND_INODE, "other", 0)
                .await
                .unwrap();

            let names: Vec<_> = env
                .vfs
                .read_dir(ROOT_INO)
                .await?
                .into_iter()
                .map(|e| (e.name, e.is_file))
                .collect();
            assert_eq!(names, vec![
                ("d".to_string(), false),
                ("other".to_string(), true)
            ]);
            // listing does not populate the cache.
            assert!(env.vfs.root().child("other").await.is_none());

            env.client.fail_next(BackendOp::ListChildren, ResultCode::FAILED);
            assert_eq!(errno(env.vfs.read_dir(ROOT_INO).await), libc::EIO);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn listing_reports_kernel_ids(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            use tessera_types::ino::UNKNOWN_INO;

            let env = vfs_env.await;
            let d = env.vfs.mkdir(ROOT_INO, "d").await?;
            env.client
                .create_file(ROOT_BACKEND_INODE, "other", 0)
                .await
                .unwrap();

            let listed: Vec<_> = env
                .vfs
                .read_dir_with_ids(ROOT_INO)
                .await?
                .into_iter()
                .map(|(id, e)| (id, e.name))
                .collect();
            assert_eq!(listed, vec![
                (d.ino, "d".to_string()),
                (UNKNOWN_INO, "other".to_string())
            ]);

            let other = env.vfs.lookup(ROOT_INO, "other").await?;
            let ids: Vec<_> = env
                .vfs
                .read_dir_with_ids(ROOT_INO)
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            assert_eq!(ids, vec![d.ino, other.ino]);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn rename_within_directory(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            for name in ["a", "b"] {
                env.client
                    .create_file(ROOT_BACKEND_INODE, name, 0)
                    .await
                    .unwrap();
            }
            let a = env.vfs.lookup(ROOT_INO, "a").await?;
            let b = env.vfs.lookup(ROOT_INO, "b").await?;
            let a_node = env.vfs.node(a.ino).unwrap();
            let b_node = env.vfs.node(b.ino).unwrap();

            // "b" exists, overwriting is refused.
            assert_eq!(errno(env.vfs.rename(ROOT_INO, "a", ROOT_INO, "b").await), libc::EPERM);

            // another client removes "b" behind our back, "b" stays resident.
            env.client.delete_file(ROOT_BACKEND_INODE, "b").await.unwrap();
            env.vfs.rename(ROOT_INO, "a", ROOT_INO, "b").await?;

            assert_eq!(b_node.name().await, "");
            assert_eq!(a_node.name().await, "b");
            assert!(env.vfs.root().child("a").await.is_none());
            let moved = env.vfs.root().child("b").await.unwrap();
            assert!(moved.node.ptr_eq(&a_node));

            assert_eq!(env.vfs.lookup(ROOT_INO, "b").await?.ino, a.ino);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn rename_to_free_name(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (a, opened) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            env.vfs.release(a.ino, opened.fh).await?;

            env.vfs.rename(ROOT_INO, "a", ROOT_INO, "b").await?;
            assert!(env.vfs.root().child("a").await.is_none());
            assert_eq!(errno(env.vfs.lookup(ROOT_INO, "a").await), libc::ENOENT);
            let b = env.vfs.lookup(ROOT_INO, "b").await?;
            assert_eq!(env.vfs.node(b.ino).unwrap().name().await, "b");

            assert_eq!(errno(env.vfs.rename(ROOT_INO, "zz", ROOT_INO, "c").await), libc::ENOENT);
            env.client.fail_next(BackendOp::Rename, ResultCode::NOT_PERMITTED);
            assert_eq!(errno(env.vfs.rename(ROOT_INO, "b", ROOT_INO, "c").await), libc::EPERM);
            env.client.fail_next(BackendOp::Rename, ResultCode(5));
            assert_eq!(errno(env.vfs.rename(ROOT_INO, "b", ROOT_INO, "c").await), libc::EIO);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn rename_across_directories(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let d = env.vfs.mkdir(ROOT_INO, "d").await?;
            let (a, opened) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            let a_node = env.vfs.node(a.ino).unwrap();

            env.vfs.rename(ROOT_INO, "a", d.ino, "b").await?;
            assert!(env.vfs.root().child("a").await.is_none());
            let dir = env.vfs.node(d.ino).unwrap().as_dir().unwrap().clone();
            // the destination learns about it lazily.
            assert!(dir.child("b").await.is_none());
            assert_eq!(a_node.name().await, "b");
            assert_eq!(a_node.parent().await.unwrap().id(), d.ino);

            // the open handle is unaffected.
            assert_eq!(env.vfs.write(a.ino, opened.fh, 0, b"x").await?, 1);
            env.vfs.release(a.ino, opened.fh).await?;

            let found = env.vfs.lookup(d.ino, "b").await?;
            assert_ne!(found.ino, a.ino);
            assert_eq!(found.attr.size, 1);
            assert!(dir.child("b").await.is_some());

            // forgetting the moved node does not touch the new entry.
            env.vfs.forget(a.ino, 1).await;
            assert!(env.vfs.node(a.ino).is_none());
            assert!(dir.child("b").await.is_some());
            Ok(())
        }
    }

    mod forget {
        use rstest::rstest;

        use super::{test_utils::*, *};

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn forget_evicts_idle_entry(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            env.client
                .create_file(ROOT_BACKEND_INODE, "a", 0)
                .await
                .unwrap();
            let a = env.vfs.lookup(ROOT_INO, "a").await?;
            env.vfs.lookup(ROOT_INO, "a").await?;

            env.vfs.forget(a.ino, 1).await;
            assert!(env.vfs.root().child("a").await.is_some());
            assert!(env.vfs.node(a.ino).is_some());

            env.vfs.forget(a.ino, 1).await;
            assert!(env.vfs.root().child("a").await.is_none());
            assert!(env.vfs.node(a.ino).is_none());

            // the next lookup goes to the backend and builds a new node.
            let again = env.vfs.lookup(ROOT_INO, "a").await?;
            assert_ne!(again.ino, a.ino);
            assert_eq!(env.client.calls(BackendOp::StatByName), 2);

            env.vfs.forget(ROOT_INO, 1).await;
            env.vfs.forget(Ino(4242), 1).await;
            assert!(env.vfs.node(ROOT_INO).is_some());
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn forget_keeps_entry_with_pending_lookup(
            #[future] vfs_env: VfsTestEnv,
        ) -> Result<()> {
            let env = vfs_env.await;
            env.client
                .create_file(ROOT_BACKEND_INODE, "a", 0)
                .await
                .unwrap();
            let a = env.vfs.lookup(ROOT_INO, "a").await?;
            let root = env.vfs.root();

            // a lookup that has resolved the node but not yet handed it out.
            let pending = root.lookup("a").await?;
            assert_eq!(root.child("a").await.unwrap().refs, 1);

            env.vfs.forget(a.ino, 1).await;
            let child = root.child("a").await.unwrap();
            assert!(!child.kernel);
            assert_eq!(child.refs, 1);
            assert!(child.node.ptr_eq(&pending));

            root.settle(&pending).await;
            let child = root.child("a").await.unwrap();
            assert!(child.kernel);
            assert_eq!(child.refs, 0);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn forget_of_unlinked_node(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            let (a, opened) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            env.vfs.unlink(ROOT_INO, "a").await?;
            env.vfs.forget(a.ino, 1).await;
            assert!(env.vfs.node(a.ino).is_none());

            // the handle outlives the node table entry.
            assert_eq!(env.vfs.write(a.ino, opened.fh, 0, b"x").await?, 1);
            env.vfs.release(a.ino, opened.fh).await?;
            Ok(())
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn forget_racing_lookup() -> Result<()> {
            let env = make_env(1 << 20);
            env.client
                .create_file(ROOT_BACKEND_INODE, "a", 0)
                .await
                .unwrap();

            let mut ino = env.vfs.lookup(ROOT_INO, "a").await?.ino;
            for _ in 0..200 {
                let forget = {
                    let vfs = env.vfs.clone();
                    tokio::spawn(async move { vfs.forget(ino, 1).await })
                };
                let lookup = {
                    let vfs = env.vfs.clone();
                    tokio::spawn(async move { vfs.lookup(ROOT_INO, "a").await })
                };
                forget.await.unwrap();
                let entry = lookup.await.unwrap()?;

                // whatever the interleaving, the kernel's node is reachable
                // and is the one the directory resolves "a" to.
                let node = env.vfs.node(entry.ino).expect("handed out node is known");
                assert!(node.lookups().get() >= 1);
                let child = env.vfs.root().child("a").await.unwrap();
                assert!(child.node.ptr_eq(&node));
                assert_eq!(child.refs, 0);
                ino = entry.ino;
            }
            Ok(())
        }
    }

    mod statfs {
        use rstest::rstest;

        use super::{test_utils::*, *};

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn reports_4k_blocks() -> Result<()> {
            let env = make_env(1 << 20);
            let st = env.vfs.stat_fs().await?;
            assert_eq!(st.blocks, 256);
            assert_eq!(st.bfree, 256);
            assert_eq!(st.block_size, 4096);

            let (a, opened) = env.vfs.create(ROOT_INO, "a", libc::O_WRONLY).await?;
            env.vfs.write(a.ino, opened.fh, 0, &[7u8; 8192]).await?;
            let st = env.vfs.stat_fs().await?;
            assert_eq!(st.bfree, 254);
            assert_eq!(st.bavail, 254);
            Ok(())
        }

        #[rstest]
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn backend_failure(#[future] vfs_env: VfsTestEnv) -> Result<()> {
            let env = vfs_env.await;
            env.client.fail_next(BackendOp::VolumeInfo, ResultCode::NOT_FOUND);
            assert_eq!(errno(env.vfs.stat_fs().await), libc::EIO);
            Ok(())
        }
    }
}
