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
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_DIR: &str = "/tmp/tessera.log";
pub const DEFAULT_LOG_LEVEL: &str = "error";
pub const LOG_FILE_NAME: &str = "fuse.log";
/// Overrides the configured level with a full filter directive.
pub const LOG_ENV: &str = "TESSERA_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory of the rolling log file, empty disables it.
    pub dir:           String,
    pub level:         Option<String>,
    pub append_stdout: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir:           DEFAULT_LOG_DIR.to_string(),
            level:         None,
            append_stdout: true,
        }
    }
}

impl LoggingOptions {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
            EnvFilter::new(self.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL))
        })
    }
}

/// Installs the process wide subscriber: an optional console layer and an
/// optional daily rolling `fuse.log` under `opts.dir`. The returned guards
/// flush the non-blocking writers and must outlive the mount.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    let mut guards = vec![];

    let stdout_layer = if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        Some(fmt::layer().with_writer(writer))
    } else {
        None
    };

    let file_layer = if !opts.dir.is_empty() {
        let appender = tracing_appender::rolling::daily(&opts.dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(fmt::layer().with_writer(writer).with_ansi(false))
    } else {
        None
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(opts.filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("logging for {app_name} is already initialized: {e}");
        return guards;
    }

    replace_panic_hook_with_tracing_panic_hook().forget();
    info!("{app_name} logging started, dir: {:?}, level: {:?}", opts.dir, opts.level);
    guards
}

/// A plain fmt subscriber for tests and short lived commands. Calling it
/// more than once is harmless.
pub fn install_fmt_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Routes panics through tracing so they land in the log file.
/// Dropping the guard puts the std hook back.
#[must_use]
pub fn replace_panic_hook_with_tracing_panic_hook() -> TracingPanicHookGuard {
    std::panic::set_hook(Box::new(tracing_panic_hook));
    TracingPanicHookGuard { act: true }
}

pub struct TracingPanicHookGuard {
    act: bool,
}

impl TracingPanicHookGuard {
    /// Keep the hook installed after the guard is dropped.
    pub fn forget(&mut self) { self.act = false; }
}

impl Drop for TracingPanicHookGuard {
    fn drop(&mut self) {
        if self.act {
            let _ = std::panic::take_hook();
        }
    }
}

fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let msg = if let Some(s) = info.payload().downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    };
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_default();

    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::capture();

    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        tracing::error!(%thread, %location, "panic: {msg}\n\nstack backtrace:\n{backtrace}");
    } else {
        tracing::error!(%thread, %location, "panic: {msg}");
    }

    // nothing is listening, do not lose the panic.
    tracing::dispatcher::get_default(|d| {
        if d.is::<tracing::subscriber::NoSubscriber>() {
            eprintln!("thread '{thread}' panicked at '{msg}', {location}\n{backtrace}");
        }
    });
}
