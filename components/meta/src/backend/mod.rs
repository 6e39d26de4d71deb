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

use std::{fmt::Debug, str::FromStr, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::{OptionExt, ResultExt};
use strum_macros::EnumString;
use tessera_common::FH;
use tessera_types::entry::DirEntry;
use tracing::debug;

use crate::{
    code::BackendResult,
    config::MetaConfig,
    err::{InvalidCapacitySnafu, Result, UnsupportedMetaDSNSnafu},
};

pub mod memory;

pub use memory::MemoryClient;

pub type MetaClientRef = Arc<dyn MetaClient>;
pub type FileSessionRef = Arc<dyn FileSession>;

/// What a name resolves to inside a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatReply {
    pub is_file: bool,
    pub inode:   u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub modify_time: SystemTime,
    pub access_time: SystemTime,
    pub size:        u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_space: u64,
    pub free_space:  u64,
}

/// The metadata side of the distributed filesystem. Every call names its
/// target by the parent directory's backend inode and a child name.
#[async_trait]
pub trait MetaClient: Debug + Send + Sync + 'static {
    async fn stat_by_name(&self, parent: u64, name: &str) -> BackendResult<StatReply>;

    async fn list_children(&self, parent: u64) -> BackendResult<Vec<DirEntry>>;

    /// Creates the file and opens a session on it in one round trip.
    async fn create_file(&self, parent: u64, name: &str, flags: i32)
        -> BackendResult<FileSessionRef>;

    async fn create_dir(&self, parent: u64, name: &str) -> BackendResult<u64>;

    async fn delete_dir(&self, parent: u64, name: &str) -> BackendResult<()>;

    async fn delete_file(&self, parent: u64, name: &str) -> BackendResult<()>;

    async fn rename(
        &self,
        src_parent: u64,
        src_name: &str,
        dst_parent: u64,
        dst_name: &str,
    ) -> BackendResult<()>;

    async fn get_attributes(&self, parent: u64, name: &str) -> BackendResult<(u64, InodeInfo)>;

    async fn open_file(&self, parent: u64, name: &str, flags: i32)
        -> BackendResult<FileSessionRef>;

    /// Tells the backend another handle now shares `session`.
    async fn notify_additional_open(
        &self,
        parent: u64,
        name: &str,
        session: &FileSessionRef,
        flags: i32,
    );

    async fn volume_info(&self, volume_id: &str) -> BackendResult<VolumeInfo>;

    async fn resolve_leader(&self, cluster_id: &str) -> BackendResult<String>;

    /// Sends later metadata calls to the leader at `addr`.
    fn follow_leader(&self, addr: &str);
}

/// An open backend file. Reads are positional, writes append.
#[async_trait]
pub trait FileSession: Debug + Send + Sync + 'static {
    fn inode(&self) -> u64;

    fn file_size(&self) -> u64;

    async fn read(&self, handle: FH, offset: u64, size: u32) -> BackendResult<Bytes>;

    /// Returns the number of bytes accepted; `Err(ResultCode::FAILED)` when
    /// the volume is out of space.
    async fn write(&self, data: &[u8]) -> BackendResult<usize>;

    async fn flush(&self) -> BackendResult<()>;

    async fn close_conns(&self);
}

/// Opens the backend named by `config.dsn`, written as `<kind>://:<arg>`.
pub fn open(config: MetaConfig) -> Result<MetaClientRef> {
    let (kind, arg) = config
        .dsn
        .split_once("://:")
        .context(UnsupportedMetaDSNSnafu { dsn: &config.dsn })?;
    let kind = BackendKinds::from_str(kind)
        .ok()
        .context(UnsupportedMetaDSNSnafu { dsn: &config.dsn })?;
    kind.build(&config, arg)
}

#[derive(Debug, EnumString)]
enum BackendKinds {
    #[strum(serialize = "memory", serialize = "Memory")]
    Memory,
}

impl BackendKinds {
    fn build(&self, config: &MetaConfig, arg: &str) -> Result<MetaClientRef> {
        match self {
            BackendKinds::Memory => {
                let capacity = if arg.is_empty() {
                    config.capacity
                } else {
                    arg.parse::<u64>()
                        .context(InvalidCapacitySnafu { dsn: &config.dsn })?
                };
                debug!(
                    "backend [memory] is built for volume {} with capacity {}",
                    config.volume_id, capacity
                );
                Ok(Arc::new(MemoryClient::new(&config.volume_id, capacity)))
            }
        }
    }
}
