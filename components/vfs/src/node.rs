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
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use tessera_meta::MetaClientRef;
use tessera_types::{
    attr::NodeAttr,
    ino::{Ino, FIRST_CHILD_INO},
};

use crate::{dir::DirNode, file::FileNode};

/// State shared by every node of one mount.
pub(crate) struct NodeCtx {
    pub(crate) client: MetaClientRef,
    next_id:           AtomicU64,
}

pub(crate) type NodeCtxRef = Arc<NodeCtx>;

impl NodeCtx {
    pub(crate) fn new(client: MetaClientRef) -> NodeCtxRef {
        Arc::new(Self {
            client,
            next_id: AtomicU64::new(FIRST_CHILD_INO.0),
        })
    }

    pub(crate) fn next_id(&self) -> Ino { Ino(self.next_id.fetch_add(1, Ordering::Relaxed)) }
}

impl Debug for NodeCtx {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCtx")
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// Where a node sits in the namespace. Both fields live under the node's
/// own lock. An empty name means the node was unlinked or overwritten and
/// must never be linked into a directory again.
#[derive(Debug, Clone, Default)]
pub(crate) struct Identity {
    pub(crate) name:   String,
    pub(crate) parent: Option<Weak<DirNode>>,
}

impl Identity {
    pub(crate) fn new(name: &str, parent: Option<&Arc<DirNode>>) -> Self {
        Self {
            name:   name.to_string(),
            parent: parent.map(Arc::downgrade),
        }
    }

    pub(crate) fn parent(&self) -> Option<Arc<DirNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_detached(&self) -> bool { self.name.is_empty() }
}

/// Kernel lookup count of a node, bumped each time the node is handed to
/// the kernel and lowered by forget.
#[derive(Debug, Default)]
pub(crate) struct LookupCount(AtomicU64);

impl LookupCount {
    pub(crate) fn get(&self) -> u64 { self.0.load(Ordering::Acquire) }

    pub(crate) fn inc(&self) { self.0.fetch_add(1, Ordering::AcqRel); }

    /// Subtracts `n` without going below zero, returns what is left.
    pub(crate) fn sub(&self, n: u64) -> u64 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            })
            .unwrap_or_else(|c| c);
        prev.saturating_sub(n)
    }
}

/// An in-memory representative of one backend entry.
#[derive(Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Dir(d) => write!(f, "Dir({}, inode {})", d.id, d.inode),
            Node::File(n) => write!(f, "File({}, inode {})", n.id, n.inode),
        }
    }
}

impl Node {
    /// The kernel node id.
    pub fn id(&self) -> Ino {
        match self {
            Node::Dir(d) => d.id,
            Node::File(f) => f.id,
        }
    }

    /// The backend inode.
    pub fn inode(&self) -> u64 {
        match self {
            Node::Dir(d) => d.inode,
            Node::File(f) => f.inode,
        }
    }

    pub fn is_dir(&self) -> bool { matches!(self, Node::Dir(_)) }

    pub fn as_dir(&self) -> Option<&Arc<DirNode>> {
        match self {
            Node::Dir(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileNode>> {
        match self {
            Node::File(f) => Some(f),
            Node::Dir(_) => None,
        }
    }

    /// Same object, not merely the same backend entry.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Dir(a), Node::Dir(b)) => Arc::ptr_eq(a, b),
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub async fn name(&self) -> String { self.identity().await.name }

    pub async fn parent(&self) -> Option<Arc<DirNode>> { self.identity().await.parent() }

    pub async fn attr(&self) -> NodeAttr {
        match self {
            Node::Dir(_) => NodeAttr::dir(),
            Node::File(f) => f.attr().await,
        }
    }

    pub(crate) async fn identity(&self) -> Identity {
        match self {
            Node::Dir(d) => d.identity().await,
            Node::File(f) => f.identity().await,
        }
    }

    pub(crate) async fn set_name(&self, name: &str) {
        match self {
            Node::Dir(d) => d.set_identity(name, None).await,
            Node::File(f) => f.set_identity(name, None).await,
        }
    }

    /// Repoints name and parent in one step.
    pub(crate) async fn move_to(&self, name: &str, parent: &Arc<DirNode>) {
        match self {
            Node::Dir(d) => d.set_identity(name, Some(parent)).await,
            Node::File(f) => f.set_identity(name, Some(parent)).await,
        }
    }

    pub(crate) fn lookups(&self) -> &LookupCount {
        match self {
            Node::Dir(d) => &d.lookups,
            Node::File(f) => &f.lookups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_count_never_underflows() {
        let c = LookupCount::default();
        c.inc();
        c.inc();
        assert_eq!(c.sub(1), 1);
        assert_eq!(c.sub(5), 0);
        assert_eq!(c.get(), 0);
    }
}
