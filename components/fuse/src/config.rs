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


use std::path::PathBuf;

use fuser::MountOption;
use tessera_common::{BUFFER_SIZE_LARGE, MAX_READAHEAD, TESSERA};

/// How the kernel session is set up.
#[derive(Debug, Clone)]
pub struct FuseConfig {
    pub mount_point:        PathBuf,
    pub mount_options:      Vec<MountOption>,
    /// Worker threads of the runtime that serves kernel requests.
    pub async_work_threads: usize,
    /// Largest write the kernel sends in one request, the buffer tier.
    pub max_write:          u32,
    pub max_readahead:      u32,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mount_point:        PathBuf::from("/tmp/tessera"),
            mount_options:      vec![
                MountOption::FSName(TESSERA.to_string()),
                MountOption::NoAtime,
                MountOption::Async,
            ],
            async_work_threads: 8,
            max_write:          BUFFER_SIZE_LARGE as u32,
            max_readahead:      MAX_READAHEAD,
        }
    }
}

impl FuseConfig {
    /// Mount options for a volume: fs name `tessera-<volume>` and the volume
    /// as subtype.
    pub fn volume_options(volume: &str, allow_other: bool, auto_unmount: bool) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(format!("{TESSERA}-{volume}")),
            MountOption::Subtype(volume.to_string()),
            MountOption::NoAtime,
            MountOption::Async,
        ];
        if allow_other {
            options.push(MountOption::AllowOther);
        }
        if auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}
