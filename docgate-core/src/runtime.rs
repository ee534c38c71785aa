//! Runtimes for the serving threads and the supervision thread. All of them
//! have the timer enabled: deadlines and restart backoff need it.

use std::{future::Future, io};

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};
use tracing::warn;

use crate::config::{RuntimeConfig, RuntimeType};

/// The runtime one serving thread blocks on.
pub enum WorkerRuntime {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl WorkerRuntime {
    pub fn build(config: &RuntimeConfig) -> io::Result<Self> {
        match config.runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring if monoio::utils::detect_uring() => {
                let runtime = RuntimeBuilder::<IoUringDriver>::new()
                    .with_entries(config.entries)
                    .enable_timer()
                    .build()?;
                Ok(WorkerRuntime::IoUring(runtime))
            }
            RuntimeType::IoUring => {
                warn!("io_uring is not available, serving on the legacy driver");
                legacy_with_entries(config.entries).map(WorkerRuntime::Legacy)
            }
            RuntimeType::Legacy => legacy_with_entries(config.entries).map(WorkerRuntime::Legacy),
        }
    }

    #[inline]
    pub fn is_io_uring(&self) -> bool {
        !matches!(self, WorkerRuntime::Legacy(_))
    }

    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        match self {
            #[cfg(target_os = "linux")]
            WorkerRuntime::IoUring(runtime) => runtime.block_on(future),
            WorkerRuntime::Legacy(runtime) => runtime.block_on(future),
        }
    }
}

fn legacy_with_entries(entries: u32) -> io::Result<Runtime<TimeDriver<LegacyDriver>>> {
    RuntimeBuilder::<LegacyDriver>::new()
        .with_entries(entries)
        .enable_timer()
        .build()
}

/// Legacy driver runtime, used by the supervision thread and tests.
pub fn legacy() -> io::Result<Runtime<TimeDriver<LegacyDriver>>> {
    RuntimeBuilder::<LegacyDriver>::new().enable_timer().build()
}
