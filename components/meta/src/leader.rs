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

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{backend::MetaClientRef, code::BackendResult, BackendOp};

/// Keeps the address of the metadata leader fresh by asking the backend
/// again every `interval`, and points the client at it whenever it moves.
/// A failed refresh keeps the last known address.
#[derive(Debug)]
pub struct LeaderWatcher {
    client:     MetaClientRef,
    cluster_id: String,
    interval:   Duration,
    leader:     Arc<RwLock<Option<String>>>,
}

impl LeaderWatcher {
    pub fn new(client: MetaClientRef, cluster_id: &str, interval: Duration) -> Self {
        Self {
            client,
            cluster_id: cluster_id.to_string(),
            interval,
            leader: Arc::new(RwLock::new(None)),
        }
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().ok().and_then(|l| l.clone())
    }

    pub async fn refresh(&self) -> BackendResult<String> {
        let addr = match self.client.resolve_leader(&self.cluster_id).await {
            Ok(addr) => addr,
            Err(code) => {
                warn!(
                    "{} for {} failed with {code}, keep {:?}",
                    BackendOp::ResolveLeader,
                    self.cluster_id,
                    self.leader()
                );
                return Err(code);
            }
        };
        if let Ok(mut leader) = self.leader.write() {
            if leader.as_deref() != Some(addr.as_str()) {
                info!("leader of {} is {addr}", self.cluster_id);
                *leader = Some(addr.clone());
                self.client.follow_leader(&addr);
            }
        }
        Ok(addr)
    }

    /// Refreshes right away, then on every tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("leader watcher for {} stopped", self.cluster_id);
                    return;
                }
                _ = ticker.tick() => {
                    let _ = self.refresh().await;
                }
            }
        }
    }
}
