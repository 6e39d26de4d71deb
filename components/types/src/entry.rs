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

use fuser::FileType;
use serde::{Deserialize, Serialize};

use crate::{attr::NodeAttr, ino::Ino};

/// One row of a backend directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name:    String,
    /// backend inode of the child
    pub inode:   u64,
    pub is_file: bool,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, inode: u64, is_file: bool) -> Self {
        Self {
            name: name.into(),
            inode,
            is_file,
        }
    }

    pub fn file_type(&self) -> FileType {
        if self.is_file {
            FileType::RegularFile
        } else {
            FileType::Directory
        }
    }
}

/// A node handed to the kernel by lookup, create or mkdir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub ino:  Ino,
    pub attr: NodeAttr,
}
