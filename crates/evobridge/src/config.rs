//! Bridge configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_RECORD_BYTES;
use crate::supervisor::{CommandSpawner, WorkerCommand, WorkerSpawner};

/// Configuration for a [`BridgeClient`](crate::BridgeClient).
///
/// Built with `new` plus `with_*` chaining.
#[derive(Clone)]
pub struct BridgeConfig {
    pub command: WorkerCommand,
    /// Ceiling on the spawn-to-handshake window.
    pub startup_timeout: Duration,
    /// Default per-request timeout; individual requests may override it.
    pub request_timeout: Duration,
    /// How long `stop()` waits after SIGTERM before SIGKILL.
    pub shutdown_grace: Duration,
    /// Inbound records larger than this are discarded, not buffered.
    pub max_record_bytes: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl BridgeConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            command: WorkerCommand::new(program),
            startup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.command.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.command.cwd = Some(cwd.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
