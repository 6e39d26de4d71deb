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

use std::time::SystemTime;

use fuser::{FileAttr, FileType};
use serde::{Deserialize, Serialize};
use tessera_common::{STATFS_BLOCK_SIZE, STAT_BLOCK_UNIT};

use crate::ino::Ino;

const DIR_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o666;

/// Attributes reported to the kernel for a node.
///
/// Only a handful of fields come from the backend (size and timestamps of
/// files). Ownership is not tracked, everything belongs to uid/gid 0 and the
/// mount relies on the kernel not enforcing permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Kind of file (directory or regular file)
    pub kind:  FileType,
    /// permission bits
    pub perm:  u16,
    /// length of regular file
    pub size:  u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Number of hard links
    pub nlink: u32,
}

impl NodeAttr {
    pub fn dir() -> Self {
        Self {
            kind:  FileType::Directory,
            perm:  DIR_PERM,
            size:  0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            nlink: 2,
        }
    }

    /// Attributes of a regular file as returned by the backend. The backend
    /// has no separate change time, so ctime follows mtime.
    pub fn file(size: u64, mtime: SystemTime, atime: SystemTime) -> Self {
        Self {
            kind: FileType::RegularFile,
            perm: FILE_PERM,
            size,
            atime,
            mtime,
            ctime: mtime,
            nlink: 1,
        }
    }

    /// What a file reports when the backend could not be asked.
    pub fn unknown_file() -> Self {
        Self {
            kind:  FileType::RegularFile,
            perm:  0,
            size:  0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            nlink: 1,
        }
    }

    pub fn is_dir(&self) -> bool { self.kind == FileType::Directory }

    pub fn to_fuse_attr<I: Into<Ino>>(&self, ino: I) -> FileAttr {
        FileAttr {
            ino:     ino.into().0,
            size:    self.size,
            blocks:  self.size.div_ceil(STAT_BLOCK_UNIT),
            atime:   self.atime,
            mtime:   self.mtime,
            ctime:   self.ctime,
            crtime:  self.ctime,
            kind:    self.kind,
            perm:    self.perm,
            nlink:   self.nlink,
            uid:     0,
            gid:     0,
            rdev:    0,
            blksize: STATFS_BLOCK_SIZE as u32,
            flags:   0,
        }
    }
}
