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

use std::time::Duration;

pub const MAX_NAME_LENGTH: usize = 255;
pub const DOT: &str = ".";
pub const DOT_DOT: &str = "..";

pub const TESSERA: &str = "tessera";
pub const TESSERA_DEBUG_META_ADDR: &str = "memory://:";
pub const TESSERA_DEBUG_VOLUME: &str = "tessera-local";

/// Backend inode of the volume root directory.
pub const ROOT_BACKEND_INODE: u64 = 0;

// statfs always reports 4 KiB blocks, whatever the backend uses internally.
pub const STATFS_BLOCK_SIZE: u64 = 4 << 10;
// st_blocks is counted in 512 byte units.
pub const STAT_BLOCK_UNIT: u64 = 512;

pub const BUFFER_SIZE_LARGE: usize = 512 << 10; // 512 KiB
pub const BUFFER_SIZE_MEDIUM: usize = 256 << 10; // 256 KiB
pub const BUFFER_SIZE_SMALL: usize = 128 << 10; // 128 KiB

pub const MAX_READAHEAD: u32 = 128 << 10; // 128 KiB

pub const LEADER_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Maps the `buffertype` tier of the client config to a write buffer size.
/// Unknown tiers fall back to the largest buffer.
pub fn buffer_size_for_tier(tier: i64) -> usize {
    match tier {
        1 => BUFFER_SIZE_MEDIUM,
        2 => BUFFER_SIZE_SMALL,
        _ => BUFFER_SIZE_LARGE,
    }
}

pub type FH = u64;
