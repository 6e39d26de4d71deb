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

use serde::{Deserialize, Serialize};
use tessera_common::{TESSERA_DEBUG_META_ADDR, TESSERA_DEBUG_VOLUME};

#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct MetaConfig {
    pub dsn:       String,
    /// The volume the client serves; it also names the cluster whose leader
    /// is resolved.
    pub volume_id: String,
    /// Capacity of an in-process volume when the dsn does not carry one.
    pub capacity:  u64,
}

impl MetaConfig {
    pub fn with_dsn(&mut self, dsn: &str) -> &mut Self {
        self.dsn = dsn.to_string();
        self
    }

    pub fn with_volume(&mut self, volume_id: &str) -> &mut Self {
        self.volume_id = volume_id.to_string();
        self
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            dsn:       TESSERA_DEBUG_META_ADDR.to_string(),
            volume_id: TESSERA_DEBUG_VOLUME.to_string(),
            capacity:  1 << 40,
        }
    }
}
