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

//! An in-process backend. It keeps the whole namespace in memory, which makes
//! it useful for local mounts and for driving the client in tests: the test
//! can act as "another client" by calling it directly, inject result codes
//! and count calls.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::SystemTime,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tessera_common::{FH, ROOT_BACKEND_INODE};
use tessera_types::entry::DirEntry;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    backend::{FileSession, FileSessionRef, InodeInfo, MetaClient, StatReply, VolumeInfo},
    code::{BackendOp, BackendResult, ResultCode},
};

const DEFAULT_LEADER: &str = "127.0.0.1:9903";

#[derive(Debug)]
pub struct MemoryClient {
    volume_id: String,
    shared:    Arc<Shared>,
    ns:        RwLock<Namespace>,
    followed:  Mutex<Option<String>>,
}

#[derive(Debug)]
struct Shared {
    capacity: u64,
    used:     AtomicU64,
    injected: DashMap<BackendOp, ResultCode>,
    calls:    DashMap<BackendOp, usize>,
}

impl Shared {
    /// Counts the call and hands out an injected failure, if any.
    fn enter(&self, op: BackendOp) -> BackendResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.injected.remove(&op) {
            Some((_, code)) => {
                debug!("memory backend injects {code} into {op}");
                Err(code)
            }
            None => Ok(()),
        }
    }

    fn reserve(&self, len: u64) -> BackendResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|n| *n <= self.capacity)
            })
            .map(|_| ())
            .map_err(|_| ResultCode::FAILED)
    }

    fn release(&self, len: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(len))
            });
    }
}

#[derive(Debug)]
struct Namespace {
    next_inode: u64,
    nodes:      HashMap<u64, MemNode>,
    leader:     String,
}

#[derive(Debug)]
enum MemNode {
    Dir(BTreeMap<String, u64>),
    File(Arc<FileData>),
}

#[derive(Debug)]
struct FileData {
    inode:   u64,
    size:    AtomicU64,
    content: RwLock<FileContent>,
}

#[derive(Debug)]
struct FileContent {
    data:  Vec<u8>,
    mtime: SystemTime,
    atime: SystemTime,
}

impl FileData {
    fn new(inode: u64) -> Self {
        let now = SystemTime::now();
        Self {
            inode,
            size: AtomicU64::new(0),
            content: RwLock::new(FileContent {
                data:  Vec::new(),
                mtime: now,
                atime: now,
            }),
        }
    }
}

impl Namespace {
    fn dir(&self, inode: u64) -> BackendResult<&BTreeMap<String, u64>> {
        match self.nodes.get(&inode) {
            Some(MemNode::Dir(children)) => Ok(children),
            Some(MemNode::File(_)) => Err(ResultCode::NOT_DIR),
            None => Err(ResultCode::NOT_FOUND),
        }
    }

    fn dir_mut(&mut self, inode: u64) -> BackendResult<&mut BTreeMap<String, u64>> {
        match self.nodes.get_mut(&inode) {
            Some(MemNode::Dir(children)) => Ok(children),
            Some(MemNode::File(_)) => Err(ResultCode::NOT_DIR),
            None => Err(ResultCode::NOT_FOUND),
        }
    }

    fn child(&self, parent: u64, name: &str) -> BackendResult<u64> {
        self.dir(parent)?
            .get(name)
            .copied()
            .ok_or(ResultCode::NOT_FOUND)
    }

    fn file(&self, parent: u64, name: &str) -> BackendResult<Arc<FileData>> {
        match self.nodes.get(&self.child(parent, name)?) {
            Some(MemNode::File(data)) => Ok(data.clone()),
            Some(MemNode::Dir(_)) => Err(ResultCode::IS_DIR),
            None => Err(ResultCode::NOT_FOUND),
        }
    }

    /// Links a fresh node under `parent` and returns its inode.
    fn link(
        &mut self,
        parent: u64,
        name: &str,
        node: impl FnOnce(u64) -> MemNode,
    ) -> BackendResult<u64> {
        let inode = self.next_inode;
        let children = self.dir_mut(parent)?;
        if children.contains_key(name) {
            return Err(ResultCode::EXISTS);
        }
        children.insert(name.to_string(), inode);
        self.nodes.insert(inode, node(inode));
        self.next_inode += 1;
        Ok(inode)
    }
}

impl MemoryClient {
    pub fn new(volume_id: &str, capacity: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_BACKEND_INODE, MemNode::Dir(BTreeMap::new()));
        Self {
            volume_id: volume_id.to_string(),
            shared:    Arc::new(Shared {
                capacity,
                used: AtomicU64::new(0),
                injected: DashMap::new(),
                calls: DashMap::new(),
            }),
            ns:        RwLock::new(Namespace {
                next_inode: ROOT_BACKEND_INODE + 1,
                nodes,
                leader: DEFAULT_LEADER.to_string(),
            }),
            followed:  Mutex::new(None),
        }
    }

    /// Makes the next call of `op` answer `code` instead of running.
    pub fn fail_next(&self, op: BackendOp, code: ResultCode) {
        self.shared.injected.insert(op, code);
    }

    /// How many times `op` has been called, failed calls included.
    pub fn calls(&self, op: BackendOp) -> usize {
        self.shared.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    pub fn used_space(&self) -> u64 { self.shared.used.load(Ordering::Acquire) }

    pub async fn set_leader(&self, addr: &str) {
        let mut ns = self.ns.write().await;
        if ns.leader != addr {
            info!("memory backend leader moves from {} to {}", ns.leader, addr);
            ns.leader = addr.to_string();
        }
    }

    /// The leader this client was last told to follow.
    pub fn followed_leader(&self) -> Option<String> {
        self.followed.lock().ok().and_then(|f| f.clone())
    }

    fn session(&self, data: Arc<FileData>) -> FileSessionRef {
        Arc::new(MemorySession {
            data,
            shared: self.shared.clone(),
        })
    }

    fn check_volume(&self, volume_id: &str) -> BackendResult<()> {
        if volume_id == self.volume_id {
            Ok(())
        } else {
            Err(ResultCode::NOT_FOUND)
        }
    }
}

#[async_trait]
impl MetaClient for MemoryClient {
    async fn stat_by_name(&self, parent: u64, name: &str) -> BackendResult<StatReply> {
        self.shared.enter(BackendOp::StatByName)?;
        let ns = self.ns.read().await;
        let inode = ns.child(parent, name)?;
        Ok(StatReply {
            is_file: matches!(ns.nodes.get(&inode), Some(MemNode::File(_))),
            inode,
        })
    }

    async fn list_children(&self, parent: u64) -> BackendResult<Vec<DirEntry>> {
        self.shared.enter(BackendOp::ListChildren)?;
        let ns = self.ns.read().await;
        Ok(ns
            .dir(parent)?
            .iter()
            .map(|(name, inode)| {
                let is_file = matches!(ns.nodes.get(inode), Some(MemNode::File(_)));
                DirEntry::new(name.as_str(), *inode, is_file)
            })
            .collect())
    }

    async fn create_file(
        &self,
        parent: u64,
        name: &str,
        _flags: i32,
    ) -> BackendResult<FileSessionRef> {
        self.shared.enter(BackendOp::CreateFile)?;
        let mut ns = self.ns.write().await;
        let inode = ns.link(parent, name, |inode| {
            MemNode::File(Arc::new(FileData::new(inode)))
        })?;
        let data = ns.file(parent, name)?;
        debug!("memory backend created file {name} as {inode}");
        Ok(self.session(data))
    }

    async fn create_dir(&self, parent: u64, name: &str) -> BackendResult<u64> {
        self.shared.enter(BackendOp::CreateDir)?;
        let mut ns = self.ns.write().await;
        ns.link(parent, name, |_| MemNode::Dir(BTreeMap::new()))
    }

    async fn delete_dir(&self, parent: u64, name: &str) -> BackendResult<()> {
        self.shared.enter(BackendOp::DeleteDir)?;
        let mut ns = self.ns.write().await;
        let inode = ns.child(parent, name)?;
        match ns.nodes.get(&inode) {
            Some(MemNode::Dir(children)) if !children.is_empty() => {
                return Err(ResultCode::NOT_EMPTY)
            }
            Some(MemNode::File(_)) => return Err(ResultCode::NOT_DIR),
            _ => {}
        }
        ns.dir_mut(parent)?.remove(name);
        ns.nodes.remove(&inode);
        Ok(())
    }

    async fn delete_file(&self, parent: u64, name: &str) -> BackendResult<()> {
        self.shared.enter(BackendOp::DeleteFile)?;
        let mut ns = self.ns.write().await;
        let data = ns.file(parent, name)?;
        ns.dir_mut(parent)?.remove(name);
        ns.nodes.remove(&data.inode);
        // open sessions keep the content alive, the space is given back now.
        self.shared.release(data.size.load(Ordering::Acquire));
        Ok(())
    }

    async fn rename(
        &self,
        src_parent: u64,
        src_name: &str,
        dst_parent: u64,
        dst_name: &str,
    ) -> BackendResult<()> {
        self.shared.enter(BackendOp::Rename)?;
        let mut ns = self.ns.write().await;
        let inode = ns.child(src_parent, src_name)?;
        if ns.dir(dst_parent)?.contains_key(dst_name) {
            return Err(ResultCode::EXISTS);
        }
        ns.dir_mut(src_parent)?.remove(src_name);
        ns.dir_mut(dst_parent)?.insert(dst_name.to_string(), inode);
        Ok(())
    }

    async fn get_attributes(&self, parent: u64, name: &str) -> BackendResult<(u64, InodeInfo)> {
        self.shared.enter(BackendOp::GetAttributes)?;
        let data = self.ns.read().await.file(parent, name)?;
        let content = data.content.read().await;
        Ok((data.inode, InodeInfo {
            modify_time: content.mtime,
            access_time: content.atime,
            size:        data.size.load(Ordering::Acquire),
        }))
    }

    async fn open_file(
        &self,
        parent: u64,
        name: &str,
        _flags: i32,
    ) -> BackendResult<FileSessionRef> {
        self.shared.enter(BackendOp::OpenFile)?;
        let data = self.ns.read().await.file(parent, name)?;
        Ok(self.session(data))
    }

    async fn notify_additional_open(
        &self,
        _parent: u64,
        name: &str,
        session: &FileSessionRef,
        flags: i32,
    ) {
        if let Err(code) = self.shared.enter(BackendOp::NotifyAdditionalOpen) {
            debug!("ignore {code} for additional open of {name}");
            return;
        }
        debug!(
            "additional open of {name} ({}) with flags {flags:#o}",
            session.inode()
        );
    }

    async fn volume_info(&self, volume_id: &str) -> BackendResult<VolumeInfo> {
        self.shared.enter(BackendOp::VolumeInfo)?;
        self.check_volume(volume_id)?;
        let used = self.used_space();
        Ok(VolumeInfo {
            total_space: self.shared.capacity,
            free_space:  self.shared.capacity.saturating_sub(used),
        })
    }

    async fn resolve_leader(&self, cluster_id: &str) -> BackendResult<String> {
        self.shared.enter(BackendOp::ResolveLeader)?;
        self.check_volume(cluster_id)?;
        Ok(self.ns.read().await.leader.clone())
    }

    fn follow_leader(&self, addr: &str) {
        if let Ok(mut followed) = self.followed.lock() {
            debug!("memory backend follows {addr}");
            *followed = Some(addr.to_string());
        }
    }
}

#[derive(Debug)]
pub struct MemorySession {
    data:   Arc<FileData>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FileSession for MemorySession {
    fn inode(&self) -> u64 { self.data.inode }

    fn file_size(&self) -> u64 { self.data.size.load(Ordering::Acquire) }

    async fn read(&self, _handle: FH, offset: u64, size: u32) -> BackendResult<Bytes> {
        self.shared.enter(BackendOp::Read)?;
        let mut content = self.data.content.write().await;
        content.atime = SystemTime::now();
        let len = content.data.len();
        let start = usize::try_from(offset).map_or(len, |o| o.min(len));
        let end = start.saturating_add(size as usize).min(len);
        Ok(Bytes::copy_from_slice(&content.data[start..end]))
    }

    async fn write(&self, data: &[u8]) -> BackendResult<usize> {
        self.shared.enter(BackendOp::Write)?;
        self.shared.reserve(data.len() as u64)?;
        let mut content = self.data.content.write().await;
        content.data.extend_from_slice(data);
        content.mtime = SystemTime::now();
        self.data
            .size
            .store(content.data.len() as u64, Ordering::Release);
        Ok(data.len())
    }

    async fn flush(&self) -> BackendResult<()> { self.shared.enter(BackendOp::Flush) }

    async fn close_conns(&self) {
        let _ = self.shared.enter(BackendOp::CloseConnections);
    }
}
