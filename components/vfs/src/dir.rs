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

use snafu::ensure;
use tessera_common::ROOT_BACKEND_INODE;
use tessera_meta::BackendOp;
use tessera_types::{
    entry::DirEntry,
    ino::{Ino, ROOT_INO, UNKNOWN_INO},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    err::{backend_error, PermissionDeniedSnafu, Result},
    file::FileNode,
    node::{Identity, LookupCount, Node, NodeCtxRef},
};

/// A cached child of a directory.
#[derive(Debug, Clone)]
pub struct ChildRef {
    pub node:   Node,
    /// The kernel holds a reference to `node`.
    pub kernel: bool,
    /// Lookups that returned `node` but have not registered it with the
    /// node table yet. The entry is not evicted while this is non-zero.
    pub refs:   u32,
}

struct DirState {
    ident:    Identity,
    children: HashMap<String, ChildRef>,
}

/// A directory node. Its `children` map decides whether a name already has
/// a node in memory; a name present there always resolves to that node.
pub struct DirNode {
    pub(crate) id:      Ino,
    pub(crate) inode:   u64,
    pub(crate) lookups: LookupCount,
    ctx:                NodeCtxRef,
    state:              Mutex<DirState>,
}

impl Debug for DirNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirNode")
            .field("id", &self.id)
            .field("inode", &self.inode)
            .finish()
    }
}

impl DirNode {
    pub(crate) fn new_root(ctx: NodeCtxRef) -> Arc<Self> {
        Arc::new(Self {
            id: ROOT_INO,
            inode: ROOT_BACKEND_INODE,
            lookups: LookupCount::default(),
            ctx,
            state: Mutex::new(DirState {
                ident:    Identity::default(),
                children: HashMap::new(),
            }),
        })
    }

    fn new(ctx: NodeCtxRef, inode: u64, name: &str, parent: &Arc<DirNode>) -> Arc<Self> {
        Arc::new(Self {
            id: ctx.next_id(),
            inode,
            lookups: LookupCount::default(),
            ctx,
            state: Mutex::new(DirState {
                ident:    Identity::new(name, Some(parent)),
                children: HashMap::new(),
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

    /// A copy of the cache entry for `name`, if one is resident.
    pub async fn child(&self, name: &str) -> Option<ChildRef> {
        self.state.lock().await.children.get(name).cloned()
    }

    pub async fn resident_count(&self) -> usize { self.state.lock().await.children.len() }

    fn materialize(self: &Arc<Self>, name: &str, is_file: bool, inode: u64) -> Node {
        if is_file {
            Node::File(FileNode::new(self.ctx.clone(), inode, name, self))
        } else {
            Node::Dir(DirNode::new(self.ctx.clone(), inode, name, self))
        }
    }

    /// Resolves `name`, reusing the resident node when there is one. The
    /// returned node carries one pending reference that the caller drops
    /// with [DirNode::settle] once the kernel knows about it.
    pub async fn lookup(self: &Arc<Self>, name: &str) -> Result<Node> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.children.get_mut(name) {
            entry.kernel = true;
            entry.refs += 1;
            return Ok(entry.node.clone());
        }

        let stat = self
            .ctx
            .client
            .stat_by_name(self.inode, name)
            .await
            .map_err(|code| backend_error(BackendOp::StatByName, code))?;
        let node = self.materialize(name, stat.is_file, stat.inode);
        debug!("materialized {name} in {} as {:?}", self.id, node);
        state.children.insert(name.to_string(), ChildRef {
            node:   node.clone(),
            kernel: true,
            refs:   1,
        });
        Ok(node)
    }

    /// The backend listing, never merged with the resident children.
    pub async fn read_dir_all(&self) -> Result<Vec<DirEntry>> {
        self.ctx
            .client
            .list_children(self.inode)
            .await
            .map_err(|code| backend_error(BackendOp::ListChildren, code))
    }

    /// The id each listed name is known by: its resident node's, or
    /// `UNKNOWN_INO` for a name that was never looked up.
    pub async fn listed_ids(&self, entries: &[DirEntry]) -> Vec<Ino> {
        let state = self.state.lock().await;
        entries
            .iter()
            .map(|e| {
                state
                    .children
                    .get(&e.name)
                    .map_or(UNKNOWN_INO, |c| c.node.id())
            })
            .collect()
    }

    /// Creates and opens a file in one backend call. The new node starts
    /// with one handle which is also the writer.
    pub async fn create(self: &Arc<Self>, name: &str, flags: i32) -> Result<Arc<FileNode>> {
        let mut state = self.state.lock().await;
        let session = self
            .ctx
            .client
            .create_file(self.inode, name, flags)
            .await
            .map_err(|code| backend_error(BackendOp::CreateFile, code))?;
        let file = FileNode::created(self.ctx.clone(), session, name, self);
        Self::install(&mut state, name, Node::File(file.clone())).await;
        Ok(file)
    }

    pub async fn mkdir(self: &Arc<Self>, name: &str) -> Result<Arc<DirNode>> {
        let mut state = self.state.lock().await;
        let inode = self
            .ctx
            .client
            .create_dir(self.inode, name)
            .await
            .map_err(|code| backend_error(BackendOp::CreateDir, code))?;
        let dir = DirNode::new(self.ctx.clone(), inode, name, self);
        Self::install(&mut state, name, Node::Dir(dir.clone())).await;
        Ok(dir)
    }

    /// Puts a freshly made node under `name`. A stale entry still sitting
    /// there is detached.
    async fn install(state: &mut DirState, name: &str, node: Node) {
        let stale = state.children.insert(name.to_string(), ChildRef {
            node,
            kernel: true,
            refs: 1,
        });
        if let Some(stale) = stale {
            warn!("{name} was still resident as {:?}, detach it", stale.node);
            stale.node.set_name("").await;
        }
    }

    /// Deletes `name` at the backend and detaches its node. Open handles
    /// on the node keep working against their backend session.
    pub async fn remove(&self, name: &str, is_dir: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let client = &self.ctx.client;
        if is_dir {
            client
                .delete_dir(self.inode, name)
                .await
                .map_err(|code| backend_error(BackendOp::DeleteDir, code))?;
        } else {
            client
                .delete_file(self.inode, name)
                .await
                .map_err(|code| backend_error(BackendOp::DeleteFile, code))?;
        }
        if let Some(entry) = state.children.remove(name) {
            entry.node.set_name("").await;
        }
        Ok(())
    }

    /// Renames `old_name` to `new_name` under `new_dir`.
    ///
    /// Overwriting is refused. After a move to another directory the node is
    /// dropped from this map but not added to `new_dir`'s; the destination
    /// finds it again on its next lookup. Only this directory's lock is
    /// taken.
    pub async fn rename(
        self: &Arc<Self>,
        old_name: &str,
        new_dir: &Arc<DirNode>,
        new_name: &str,
    ) -> Result<()> {
        let target = self
            .ctx
            .client
            .stat_by_name(new_dir.inode, new_name)
            .await;
        ensure!(target.is_err(), PermissionDeniedSnafu {
            reason: format!("rename target {new_name} exists"),
        });

        let mut state = self.state.lock().await;
        self.ctx
            .client
            .rename(self.inode, old_name, new_dir.inode, new_name)
            .await
            .map_err(|code| backend_error(BackendOp::Rename, code))?;

        if Arc::ptr_eq(self, new_dir) {
            if let Some(displaced) = state.children.remove(new_name) {
                displaced.node.set_name("").await;
            }
            if let Some(entry) = state.children.remove(old_name) {
                entry.node.set_name(new_name).await;
                state.children.insert(new_name.to_string(), entry);
            }
        } else if let Some(entry) = state.children.remove(old_name) {
            entry.node.move_to(new_name, new_dir).await;
            debug!(
                "{:?} moved from {} to {}, not resident there until looked up",
                entry.node, self.id, new_dir.id
            );
        }
        Ok(())
    }

    /// The kernel dropped its last reference to `node`, known here as
    /// `name`. The entry goes away unless a lookup is still in flight.
    pub async fn forget_child(&self, name: &str, node: &Node) {
        if name.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(entry) = state.children.get_mut(name) else {
            return;
        };
        if !entry.node.ptr_eq(node) || node.lookups().get() > 0 {
            return;
        }
        entry.kernel = false;
        if entry.refs == 0 {
            state.children.remove(name);
            debug!("evicted {name} from {}", self.id);
        }
    }

    /// Drops the pending reference taken by lookup, create or mkdir.
    pub(crate) async fn settle(&self, node: &Node) {
        let mut state = self.state.lock().await;
        let name = node.name().await;
        if let Some(entry) = state.children.get_mut(&name) {
            if entry.node.ptr_eq(node) {
                entry.refs = entry.refs.saturating_sub(1);
                entry.kernel = true;
            }
        }
    }
}
