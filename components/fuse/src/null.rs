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


use std::path::Path;

use fuser::{spawn_mount2, Filesystem, MountOption};
use snafu::{ResultExt, Whatever};
use tessera_common::TESSERA;
use tracing::debug;

/// A filesystem that answers nothing. Mounting it first tells us whether
/// the real mount can succeed before any backend is opened.
struct NullFs;

impl Filesystem for NullFs {}

pub fn mount_check<P: AsRef<Path>>(mountpoint: P) -> Result<(), Whatever> {
    let mountpoint = mountpoint.as_ref();
    let options = [
        MountOption::FSName(format!("{TESSERA}-check")),
        MountOption::AllowRoot,
    ];
    let session = spawn_mount2(NullFs, mountpoint, &options).with_whatever_context(|e| {
        format!("failed to mount null fs on {}; {}", mountpoint.display(), e)
    })?;
    drop(session);
    debug!("null fs mount check on {} passed", mountpoint.display());
    Ok(())
}
