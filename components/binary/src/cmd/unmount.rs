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

use clap::Args;
use rustix::mount::{unmount, UnmountFlags};
use snafu::{ResultExt, Whatever};

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Unmount a tessera volume from the specified directory.
")]
pub struct UmountArgs {
    #[arg(
        help = "Directory the volume is mounted at",
        value_name = "MOUNT_POINT",
        default_value = "/tmp/tessera"
    )]
    pub mount_point: PathBuf,
    #[arg(long, short, help = "Force unmount even if the file system is busy")]
    pub force:       bool,
}

impl UmountArgs {
    fn flags(&self) -> UnmountFlags {
        if self.force {
            UnmountFlags::FORCE
        } else {
            UnmountFlags::empty()
        }
    }

    pub fn run(&self) -> Result<(), Whatever> {
        let path = &self.mount_point;
        unmount(path, self.flags())
            .with_whatever_context(|e| format!("could not umount {}: {e}", path.display()))?;
        println!("{} unmounted", path.display());
        Ok(())
    }
}
