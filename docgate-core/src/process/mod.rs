//! Supervision of the external conversion engines.
//!
//! Every configured engine runs `instances` long-lived worker processes. The
//! [`Supervisor`] owns them on a dedicated thread, restarts crashed ones with
//! exponential backoff and hands out [`WorkerHandle`] leases to requests.
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod command;
mod launcher;
mod supervisor;

pub use command::{run, CommandOutcome};
pub use launcher::{ChildProcess, CommandLauncher, Exit, Launcher};
pub use supervisor::{InstanceSnapshot, Supervisor, WorkerHandle};

/// Placeholder replaced by the instance port in engine command lines.
pub const PORT_PLACEHOLDER: &str = "{port}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub name: String,
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// Command line of the long-lived worker.
    pub command: Vec<String>,
    /// Instance `i` listens on `base_port + i`.
    pub base_port: Option<u16>,
    /// Require a TCP connect to the instance port before it is healthy.
    #[serde(default)]
    pub probe: bool,
    /// Command template run for each conversion.
    #[serde(default)]
    pub convert: Vec<String>,
}

impl EngineConfig {
    pub fn port(&self, index: usize) -> u16 {
        self.base_port
            .map(|base| base.saturating_add(index as u16))
            .unwrap_or(0)
    }
}

fn default_instances() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Restarts allowed over an instance lifetime before it is given up.
    pub max_restarts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub poll_ms: u64,
    pub startup_grace_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff_ms: 200,
            max_backoff_ms: 5000,
            poll_ms: 100,
            startup_grace_ms: 500,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    #[inline]
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    #[inline]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Healthy,
    Crashed,
    Restarting,
    PermanentlyFailed,
}
