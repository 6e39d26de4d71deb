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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use snafu::OptionExt;
use tessera_common::FH;
use tessera_types::ino::Ino;

use crate::{
    err::{BadHandleSnafu, Result},
    file::FileNode,
};

/// Kernel file handles. A handle pins its node, so reads and writes keep
/// working after the node is unlinked or forgotten.
pub(crate) struct HandleTable {
    handles:  DashMap<FH, FileHandle>,
    _next_fh: AtomicU64,
}

#[derive(Debug, Clone)]
pub(crate) struct FileHandle {
    pub(crate) fh:    FH,
    pub(crate) node:  Arc<FileNode>,
    pub(crate) flags: i32,
    /// Counted as the writer of `node`.
    pub(crate) write: bool,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        HandleTable {
            handles:  DashMap::new(),
            _next_fh: AtomicU64::new(1),
        }
    }

    fn next_fh(&self) -> FH { self._next_fh.fetch_add(1, Ordering::SeqCst) }

    pub(crate) fn new_file_handle(&self, node: Arc<FileNode>, flags: i32, write: bool) -> FH {
        let fh = self.next_fh();
        self.handles.insert(fh, FileHandle {
            fh,
            node,
            flags,
            write,
        });
        fh
    }

    pub(crate) fn find_handle(&self, ino: Ino, fh: FH) -> Result<FileHandle> {
        self.handles
            .get(&fh)
            .filter(|h| h.node.id == ino)
            .map(|h| h.value().clone())
            .context(BadHandleSnafu { ino, fh })
    }

    pub(crate) fn release_file_handle(&self, ino: Ino, fh: FH) -> Result<FileHandle> {
        self.handles
            .remove_if(&fh, |_, h| h.node.id == ino)
            .map(|(_, h)| h)
            .context(BadHandleSnafu { ino, fh })
    }

    pub(crate) fn len(&self) -> usize { self.handles.len() }
}
