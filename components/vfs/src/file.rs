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

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};

use bytes::Bytes;
use snafu::{ensure, OptionExt};
use tessera_common::FH;
use tessera_meta::{BackendOp, FileSessionRef};
use tessera_types::{attr::NodeAttr, ino::Ino};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::{
    dir::DirNode,
    err::{
        backend_error, BadHandleSnafu, ParentGoneSnafu, PermissionDeniedSnafu, Result,
        ShortWriteSnafu,
    },
    node::{Identity, LookupCount, NodeCtxRef},
};

/// Whether open flags ask for write access.
pub fn wants_write(flags: i32) -> bool {
    matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderCursor {
    pub last_offset: u64,
}

/// A snapshot of the handle bookkeeping of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleCounters {
    pub handles:     u32,
    pub writers:     u32,
    pub has_session: bool,
    pub readers:     usize,
}

struct FileState {
    ident:   Identity,
    handles: u32,
    writers: u32,
    /// Present exactly while `handles > 0`.
    session: Option<FileSessionRef>,
    /// Per kernel handle, reset together with the session.
    readers: HashMap<FH, ReaderCursor>,
}

/// A file node and its open/read/write state machine.
///
/// Closed (no handles) -> open for reading (handles > 0) -> open for
/// writing (one writer). At most one handle may have write intent.
pub struct FileNode {
    pub(crate) id:      Ino,
    pub(crate) inode:   u64,
    pub(crate) lookups: LookupCount,
    ctx:                NodeCtxRef,
    state:              Mutex<FileState>,
}

impl Debug for FileNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode")
            .field("id", &self.id)
            .field("inode", &self.inode)
            .finish()
    }
}

impl FileNode {
    pub(crate) fn new(
        ctx: NodeCtxRef,
        inode: u64,
        name: &str,
        parent: &Arc<DirNode>,
    ) -> Arc<Self> {
        Self::build(ctx, inode, name, parent, None)
    }

    /// A node for a file that was just created: its creator holds the one
    /// handle and is the writer.
    pub(crate) fn created(
        ctx: NodeCtxRef,
        session: FileSessionRef,
        name: &str,
        parent: &Arc<DirNode>,
    ) -> Arc<Self> {
        let inode = session.inode();
        Self::build(ctx, inode, name, parent, Some(session))
    }

    fn build(
        ctx: NodeCtxRef,
        inode: u64,
        name: &str,
        parent: &Arc<DirNode>,
        session: Option<FileSessionRef>,
    ) -> Arc<Self> {
        let open = u32::from(session.is_some());
        Arc::new(Self {
            id: ctx.next_id(),
            inode,
            lookups: LookupCount::default(),
            ctx,
            state: Mutex::new(FileState {
                ident: Identity::new(name, Some(parent)),
                handles: open,
                writers: open,
                session,
                readers: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> Ino { self.id }

    pub fn inode(&self) -> u64 { self.inode }

    pub(crate) async fn identity(&self) -> Identity { self.state.lock().await.ident.clone() }

    pub(crate) async fn set_identity(&self, name: &str, parent: Option<&Arc<DirNode>>) {
        let mut state = self.state.lock().await;
        state.ident.name = name.to_string();
        if let Some(parent) = parent {
            state.ident.parent = Some(Arc::downgrade(parent));
        }
    }

    pub async fn counters(&self) -> HandleCounters {
        let state = self.state.lock().await;
        HandleCounters {
            handles:     state.handles,
            writers:     state.writers,
            has_session: state.session.is_some(),
            readers:     state.readers.len(),
        }
    }

    pub async fn cursor(&self, fh: FH) -> Option<ReaderCursor> {
        self.state.lock().await.readers.get(&fh).copied()
    }

    /// Attributes as the backend reports them. A failed query yields zeroed
    /// attributes instead of an error.
    pub async fn attr(&self) -> NodeAttr {
        let ident = self.identity().await;
        let Some(parent) = ident.parent() else {
            return NodeAttr::unknown_file();
        };
        match self
            .ctx
            .client
            .get_attributes(parent.inode, &ident.name)
            .await
        {
            Ok((_, info)) => NodeAttr::file(info.size, info.modify_time, info.access_time),
            Err(code) => {
                debug!(
                    "{} of {:?} in {} answered {code}",
                    BackendOp::GetAttributes,
                    ident.name,
                    parent.id
                );
                NodeAttr::unknown_file()
            }
        }
    }

    /// Admits one more handle. The first handle opens a backend session,
    /// later ones share it.
    pub async fn open(&self, flags: i32) -> Result<()> {
        ensure!(flags & libc::O_TRUNC == 0, PermissionDeniedSnafu {
            reason: "truncate on open is not supported",
        });
        let write = wants_write(flags);

        let mut state = self.state.lock().await;
        ensure!(!write || state.writers == 0, PermissionDeniedSnafu {
            reason: format!("node {} already has a writer", self.id),
        });

        let parent = state.ident.parent().context(ParentGoneSnafu {
            name: state.ident.name.clone(),
        })?;
        if let Some(session) = state.session.clone() {
            self.ctx
                .client
                .notify_additional_open(parent.inode, &state.ident.name, &session, flags)
                .await;
        } else {
            let session = self
                .ctx
                .client
                .open_file(parent.inode, &state.ident.name, flags)
                .await
                .map_err(|code| backend_error(BackendOp::OpenFile, code))?;
            state.session = Some(session);
        }

        state.handles += 1;
        if write {
            state.writers += 1;
        }
        Ok(())
    }

    /// Lets go of handle `fh`. The session is dropped with the last handle.
    pub async fn release(&self, fh: FH, write: bool) {
        let mut state = self.state.lock().await;
        if state.handles == 0 {
            error!("release of {fh} on node {} without open handles", self.id);
            return;
        }
        state.handles -= 1;
        if write {
            if let Some(session) = &state.session {
                session.close_conns().await;
            }
            state.writers = state.writers.saturating_sub(1);
        }
        state.readers.remove(&fh);
        if state.handles == 0 {
            state.session = None;
            state.readers.clear();
        }
    }

    /// Reads through the session. At end of file the result is empty and
    /// the backend is not asked; short reads are passed through.
    pub async fn read(&self, fh: FH, offset: u64, size: u32) -> Result<Bytes> {
        let mut state = self.state.lock().await;
        let session = state
            .session
            .clone()
            .context(BadHandleSnafu { ino: self.id, fh })?;
        state.readers.entry(fh).or_default();

        if offset == session.file_size() {
            return Ok(Bytes::new());
        }
        let data = session
            .read(fh, offset, size)
            .await
            .map_err(|code| backend_error(BackendOp::Read, code))?;
        if let Some(cursor) = state.readers.get_mut(&fh) {
            cursor.last_offset = offset + data.len() as u64;
        }
        Ok(data)
    }

    pub async fn write(&self, fh: FH, data: &[u8]) -> Result<u32> {
        let state = self.state.lock().await;
        let session = state
            .session
            .as_ref()
            .context(BadHandleSnafu { ino: self.id, fh })?;
        let written = session
            .write(data)
            .await
            .map_err(|code| backend_error(BackendOp::Write, code))?;
        ensure!(written == data.len(), ShortWriteSnafu {
            written,
            expected: data.len(),
        });
        Ok(written as u32)
    }

    /// Flush and fsync both land here.
    pub async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        match &state.session {
            Some(session) => session
                .flush()
                .await
                .map_err(|code| backend_error(BackendOp::Flush, code)),
            None => Ok(()),
        }
    }
}
