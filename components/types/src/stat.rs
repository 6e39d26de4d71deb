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

use std::fmt::{Debug, Formatter};

use tessera_common::{MAX_NAME_LENGTH, STATFS_BLOCK_SIZE};

/// [FSStat] is the statfs view of a volume, counted in
/// [STATFS_BLOCK_SIZE] blocks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FSStat {
    pub blocks:     u64,
    pub bfree:      u64,
    pub bavail:     u64,
    pub block_size: u32,
    pub name_len:   u32,
}

impl FSStat {
    pub fn from_space(total_space: u64, free_space: u64) -> Self {
        let free = free_space / STATFS_BLOCK_SIZE;
        Self {
            blocks:     total_space / STATFS_BLOCK_SIZE,
            bfree:      free,
            bavail:     free,
            block_size: STATFS_BLOCK_SIZE as u32,
            name_len:   MAX_NAME_LENGTH as u32,
        }
    }
}

impl Debug for FSStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FSStat")
            .field("blocks", &self.blocks)
            .field("bfree", &self.bfree)
            .field("bavail", &self.bavail)
            .finish()
    }
}
