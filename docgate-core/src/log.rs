//! Per-request structured logging.
//!
//! A [`RequestLogger`] is built fresh for every request from the configured
//! [`LogLevel`] and the request [`Trace`]. Every event carries the `trace` and
//! `op` fields; the sink and formatting belong to the installed `tracing`
//! subscriber.
use std::{fmt::Display, time::Duration};

use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::trace::Trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

#[derive(Debug, Clone)]
pub struct RequestLogger {
    level: LogLevel,
    trace: Trace,
}

impl RequestLogger {
    pub fn new(level: LogLevel, trace: Trace) -> Self {
        Self { level, trace }
    }

    #[inline]
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    #[inline]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    pub fn error_op(&self, op: &str, err: &dyn Display) {
        if self.enabled(LogLevel::Error) {
            tracing::error!(trace = %self.trace, op = %op, "{err}");
        }
    }

    pub fn warn_op(&self, op: &str, message: impl Display) {
        if self.enabled(LogLevel::Warn) {
            tracing::warn!(trace = %self.trace, op = %op, "{message}");
        }
    }

    pub fn info_op(&self, op: &str, message: impl Display) {
        if self.enabled(LogLevel::Info) {
            tracing::info!(trace = %self.trace, op = %op, "{message}");
        }
    }

    pub fn debug_op(&self, op: &str, message: impl Display) {
        if self.enabled(LogLevel::Debug) {
            tracing::debug!(trace = %self.trace, op = %op, "{message}");
        }
    }

    /// Logs the outcome of a request. Debug-only outcomes (health checks)
    /// are dropped unless the logger runs at [`LogLevel::Debug`].
    pub fn request_result(
        &self,
        method: &Method,
        path: &str,
        status: StatusCode,
        latency: Duration,
        is_debug: bool,
    ) {
        const OP: &str = "pipeline.log";
        let line = format!(
            "{method} {path} {} {:.3}ms",
            status.as_u16(),
            latency.as_secs_f64() * 1000.0
        );
        if is_debug {
            self.debug_op(OP, line);
        } else {
            self.info_op(OP, line);
        }
    }
}
