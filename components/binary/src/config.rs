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


use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{ensure_whatever, ResultExt, Whatever};
use tessera_common::{buffer_size_for_tier, TESSERA_DEBUG_META_ADDR, TESSERA_DEBUG_VOLUME};
use tessera_utils::logger::{DEFAULT_LOG_DIR, DEFAULT_LOG_LEVEL};

const VOLUME_ID_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";

/// The startup file of a client, one per mounted volume.
///
/// ```toml
/// uuid = "vol-1"
/// mountpoint = "/mnt/vol-1"
/// volmgr = "10.0.0.1:7703"
/// metanode = ["10.0.0.2:9903", "10.0.0.3:9903"]
/// buffertype = 1
/// log = "/var/log/tessera"
/// loglevel = "info"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Volume identifier.
    pub uuid:       String,
    pub mountpoint: PathBuf,
    /// Volume manager address.
    pub volmgr:     String,
    /// Metadata peers.
    pub metanode:   Vec<String>,
    /// Buffer size tier, see [buffer_size_for_tier].
    pub buffertype: i64,
    /// Log directory.
    pub log:        String,
    pub loglevel:   String,
    /// Backend selector.
    pub dsn:        String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uuid:       TESSERA_DEBUG_VOLUME.to_string(),
            mountpoint: PathBuf::from("/tmp/tessera"),
            volmgr:     String::new(),
            metanode:   vec![],
            buffertype: 0,
            log:        DEFAULT_LOG_DIR.to_string(),
            loglevel:   DEFAULT_LOG_LEVEL.to_string(),
            dsn:        TESSERA_DEBUG_META_ADDR.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, Whatever> {
        let text = std::fs::read_to_string(path)
            .with_whatever_context(|e| format!("failed to read {}: {e}", path.display()))?;
        let config: ClientConfig = toml::from_str(&text)
            .with_whatever_context(|e| format!("failed to parse {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Whatever> {
        let pattern = Regex::new(VOLUME_ID_PATTERN)
            .with_whatever_context(|e| format!("bad volume id pattern: {e}"))?;
        ensure_whatever!(
            pattern.is_match(&self.uuid),
            "invalid volume id {:?}",
            self.uuid
        );
        Ok(())
    }

    pub fn buffer_size(&self) -> usize { buffer_size_for_tier(self.buffertype) }

    /// Unknown levels fall back to `error`.
    pub fn log_level(&self) -> &'static str {
        match self.loglevel.as_str() {
            "debug" => "debug",
            "info" => "info",
            _ => "error",
        }
    }
}
