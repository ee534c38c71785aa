use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rand::Rng;

// Shared by every generator so traces never repeat inside the process even
// when the random half collides.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Per-request correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trace(Arc<str>);

impl Trace {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Trace {
    fn from(value: &str) -> Self {
        Trace(value.into())
    }
}

impl AsRef<std::path::Path> for Trace {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(self.as_str())
    }
}

/// Produces a 32 hex chars [`Trace`]: 64 random bits followed by a
/// process-wide sequence number.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceGenerator;

impl TraceGenerator {
    pub fn next(&self) -> Trace {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes[..8]);
        bytes[8..].copy_from_slice(&seq.to_be_bytes());
        Trace(hex::encode(bytes).into())
    }
}
