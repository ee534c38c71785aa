use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

// io_uring / epoll entries
const DEFAULT_ENTRIES: u32 = 32768;

/// Serving threads and the driver each of them runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: u16,
    #[serde(default = "default_entries")]
    pub entries: u32,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

/// `IoUring` falls back to `Legacy` where io_uring is missing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeType {
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: default_workers(),
            entries: default_entries(),
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

fn default_entries() -> u32 {
    DEFAULT_ENTRIES
}

fn default_workers() -> u16 {
    let num_cpus = std::thread::available_parallelism()
        .unwrap_or(NonZeroUsize::MIN)
        .get();
    num_cpus.min(u16::MAX as usize) as u16
}

fn default_cpu_affinity() -> bool {
    true
}
