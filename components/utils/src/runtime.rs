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

//! A small shared runtime for background jobs that live outside of the
//! FUSE request path, such as the leader poller.

use std::{future::Future, io};

use once_cell::sync::OnceCell;
use tokio::{runtime::Runtime, task::JoinHandle};
use tracing::debug;

static GLOBAL_RUNTIME: OnceCell<Runtime> = OnceCell::new();

fn runtime() -> io::Result<&'static Runtime> {
    GLOBAL_RUNTIME.get_or_try_init(|| {
        let threads = std::cmp::max(2, crate::num_cpus::get() / 4);
        debug!("start background tokio runtime with {threads} threads");
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("tessera-background")
            .enable_all()
            .build()
    })
}

pub fn spawn<F>(future: F) -> io::Result<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Ok(runtime()?.spawn(future))
}

pub fn block_on<F: Future>(future: F) -> io::Result<F::Output> { Ok(runtime()?.block_on(future)) }
