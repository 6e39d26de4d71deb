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

use serde::{Deserialize, Serialize};
use tessera_common::TESSERA_DEBUG_VOLUME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The volume answered by statfs.
    pub volume_id: String,

    // attributes cache timeout
    pub attr_timeout:       Duration,
    // dir entry cache timeout
    pub dir_entry_timeout:  Duration,
    // file entry cache timeout
    pub file_entry_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volume_id:          TESSERA_DEBUG_VOLUME.to_string(),
            attr_timeout:       Duration::from_secs(1),
            dir_entry_timeout:  Duration::from_secs(1),
            file_entry_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn with_volume(mut self, volume_id: &str) -> Self {
        self.volume_id = volume_id.to_string();
        self
    }
}
