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

use clap::Args;
use rustix::mount::{unmount, UnmountFlags};
use snafu::{whatever, ResultExt, Whatever};
use tessera_common::{LEADER_REFRESH_INTERVAL, MAX_READAHEAD};
use tessera_fuse::{null, FuseConfig, TesseraFuse};
use tessera_meta::{LeaderWatcher, MetaConfig};
use tessera_utils::{logger::LoggingOptions, runtime};
use tessera_vfs::{Config as VFSConfig, TesseraVFS};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;

const MOUNT_OPTIONS_HEADER: &str = "Mount options";
const LOGGING_OPTIONS_HEADER: &str = "Logging options";

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Mount the volume described by a client config file.
Examples:

# Mount with the settings of the file
tessera mount /etc/tessera/vol-1.toml

# Override the mount point
tessera mount /etc/tessera/vol-1.toml --mount-point /tmp/vol-1
")]
pub struct MountArgs {
    #[arg(help = "Client config file", value_name = "CONFIG")]
    pub config: PathBuf,

    #[arg(
    long,
    help = "Directory to mount the fs at [default: mountpoint of the config]",
    help_heading = MOUNT_OPTIONS_HEADER,
    value_name = "MOUNT_POINT",
    )]
    pub mount_point: Option<PathBuf>,

    #[arg(long, help = "Automatically unmount on exit", help_heading = MOUNT_OPTIONS_HEADER)]
    pub auto_unmount: bool,

    #[arg(
    long,
    help = "Allow other users, including root, to access file system",
    help_heading = MOUNT_OPTIONS_HEADER,
    )]
    pub allow_other: bool,

    #[arg(
    long,
    help = "Number of threads to use for tokio async runtime",
    help_heading = MOUNT_OPTIONS_HEADER,
    default_value = "8",
    )]
    pub async_work_threads: usize,

    #[clap(
    long,
    help = "Write log files to a directory [default: log of the config]",
    help_heading = LOGGING_OPTIONS_HEADER,
    value_name = "DIRECTORY",
    )]
    pub log_directory: Option<String>,

    #[clap(
    short,
    long,
    help = "Log level: error, info or debug [default: loglevel of the config]",
    help_heading = LOGGING_OPTIONS_HEADER,
    value_name = "LEVEL",
    )]
    pub level: Option<String>,

    #[clap(
    long,
    help = "Append stdout to log files",
    help_heading = LOGGING_OPTIONS_HEADER,
    )]
    pub append_stdout: bool,

    #[clap(
    long,
    help = "Disable all logging. You will still see stdout messages.",
    help_heading = LOGGING_OPTIONS_HEADER,
    conflicts_with_all(["log_directory", "level"])
    )]
    pub no_log: bool,
}

impl MountArgs {
    /// The config file with the command line overrides applied.
    fn client_config(&self) -> Result<ClientConfig, Whatever> {
        let mut config = ClientConfig::load(&self.config)?;
        if let Some(mount_point) = &self.mount_point {
            config.mountpoint = mount_point.clone();
        }
        if let Some(dir) = &self.log_directory {
            config.log = dir.clone();
        }
        if let Some(level) = &self.level {
            config.loglevel = level.clone();
        }
        Ok(config)
    }

    fn fuse_config(&self, config: &ClientConfig) -> FuseConfig {
        FuseConfig {
            mount_point:        config.mountpoint.clone(),
            mount_options:      FuseConfig::volume_options(
                &config.uuid,
                self.allow_other,
                self.auto_unmount,
            ),
            async_work_threads: self.async_work_threads,
            max_write:          config.buffer_size() as u32,
            max_readahead:      MAX_READAHEAD,
        }
    }

    fn meta_config(&self, config: &ClientConfig) -> MetaConfig {
        let mut mc = MetaConfig::default();
        mc.with_dsn(&config.dsn).with_volume(&config.uuid);
        mc
    }

    fn load_logging_opts(&self, config: &ClientConfig) -> Option<LoggingOptions> {
        if self.no_log {
            return None;
        }
        Some(LoggingOptions {
            dir:           config.log.clone(),
            level:         Some(config.log_level().to_string()),
            append_stdout: self.append_stdout,
        })
    }

    pub fn run(self) -> Result<(), Whatever> {
        let config = self.client_config()?;
        let _guards = match self.load_logging_opts(&config) {
            Some(opts) => tessera_utils::logger::init_global_logging("tessera-fuse", &opts),
            None => vec![],
        };
        mount(&self, config)
    }
}

fn log_env_flags() {
    info!("command line arguments");
    for argument in std::env::args() {
        info!("argument: {}", argument);
    }
}

/// Resolves the leader once, then keeps it fresh on the background runtime
/// until `cancel` fires. A failed first resolve is not fatal.
fn start_leader_watcher(
    watcher: LeaderWatcher,
    cancel: CancellationToken,
) -> Result<(), Whatever> {
    match runtime::block_on(watcher.refresh())
        .with_whatever_context(|e| format!("background runtime unavailable, {e}"))?
    {
        Ok(leader) => info!("leader: {leader}"),
        Err(code) => warn!("no leader yet ({code}), keep polling"),
    }
    runtime::spawn(async move { watcher.run(cancel).await })
        .with_whatever_context(|e| format!("failed to start leader watcher, {e}"))?;
    Ok(())
}

fn mount(args: &MountArgs, config: ClientConfig) -> Result<(), Whatever> {
    let mount_point = config.mountpoint.clone();
    info!(
        "try to mount tessera volume {} on {:?}",
        config.uuid, &mount_point
    );
    info!(
        "version: {}, volume manager: {:?}, meta nodes: {:?}",
        env!("CARGO_PKG_VERSION"),
        config.volmgr,
        config.metanode
    );
    log_env_flags();

    validate_mount_point(&mount_point)?;

    let fuse_config = args.fuse_config(&config);
    info!("buffer size {}", fuse_config.max_write);
    let client = tessera_meta::open(args.meta_config(&config))
        .with_whatever_context(|e| format!("failed to open meta, {:?}", e))?;

    let cancel = CancellationToken::new();
    let watcher = LeaderWatcher::new(client.clone(), &config.uuid, LEADER_REFRESH_INTERVAL);
    start_leader_watcher(watcher, cancel.clone())?;

    {
        let mount_point = mount_point.clone();
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            info!("interrupted, unmount {}", mount_point.display());
            cancel.cancel();
            if let Err(e) = unmount(&mount_point, UnmountFlags::DETACH) {
                warn!("failed to unmount {}: {e}", mount_point.display());
            }
        })
        .with_whatever_context(|e| format!("failed to install signal handler, {e}"))?;
    }

    let vfs = TesseraVFS::new(VFSConfig::default().with_volume(&config.uuid), client);
    let fs = TesseraFuse::create(fuse_config.clone(), vfs)?;
    let mounted = fuser::mount2(fs, &mount_point, &fuse_config.mount_options)
        .with_whatever_context(|e| {
            format!(
                "failed to mount tessera on {}; {}",
                mount_point.display(),
                e
            )
        });
    cancel.cancel();
    mounted?;
    info!("tessera on {} exited", mount_point.display());
    Ok(())
}

fn validate_mount_point(path: impl AsRef<Path>) -> Result<(), Whatever> {
    let mount_point = path.as_ref();
    if !mount_point.exists() {
        whatever!("mount point {} does not exist", mount_point.display());
    }

    if !mount_point.is_dir() {
        whatever!("mount point {} is not a directory", mount_point.display());
    }

    #[cfg(target_os = "linux")]
    {
        use procfs::process::Process;

        // /proc may be unreadable in containers, skip the check then.
        let mounts = match Process::myself().and_then(|me| me.mountinfo()) {
            Ok(mounts) => mounts,
            Err(e) => {
                tracing::debug!(
                    "failed to read mountinfo, not checking for existing mounts: {e:?}"
                );
                return Ok(());
            }
        };

        if mounts
            .into_iter()
            .any(|mount| mount.mount_point == mount_point)
        {
            whatever!("mount point {} is already mounted", mount_point.display());
        }
    }

    null::mount_check(mount_point)?;

    Ok(())
}
