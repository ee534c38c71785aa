//! The closed error taxonomy every request failure is normalized into.
//!
//! An [`Error`] carries exactly one [`ErrorKind`], and the kind alone decides
//! the HTTP status ([`ErrorKind::status`]). Errors also carry an operation
//! label (`op`) naming where they originated, so the single log line written
//! when an error is turned into a response can be traced back to its source.
use std::{borrow::Cow, fmt};

use http::StatusCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Message shown to clients for internal failures without an explicit message.
pub const INTERNAL_MESSAGE: &str =
    "An internal error has occurred. Please contact technical support.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or arguments.
    Invalid,
    /// Worker unavailable or conversion deadline exceeded.
    Timeout,
    /// Uncategorized failure.
    Internal,
    /// Transport-level outcome (not found, method not allowed...) which is
    /// passed through with its own status.
    Transport(StatusCode),
}

impl ErrorKind {
    pub const fn status(self) -> StatusCode {
        match self {
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Transport(status) => status,
        }
    }

    pub const fn is_transport(self) -> bool {
        matches!(self, ErrorKind::Transport(_))
    }
}

pub struct Error {
    op: &'static str,
    kind: ErrorKind,
    message: Option<String>,
    source: Option<BoxError>,
}

impl Error {
    pub fn new(op: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            message: Some(message.into()),
            source: None,
        }
    }

    pub fn invalid(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Invalid, message)
    }

    pub fn timeout(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Timeout, message)
    }

    /// An internal error; the cause is logged but never shown to clients.
    pub fn internal(op: &'static str, source: impl Into<BoxError>) -> Self {
        Self {
            op,
            kind: ErrorKind::Internal,
            message: None,
            source: Some(source.into()),
        }
    }

    pub fn transport(op: &'static str, status: StatusCode) -> Self {
        Self {
            op,
            kind: ErrorKind::Transport(status),
            message: None,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[inline]
    pub fn op(&self) -> &'static str {
        self.op
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// Human readable message safe to return to the client.
    pub fn user_message(&self) -> Cow<'_, str> {
        match (&self.message, self.kind) {
            (Some(message), _) => Cow::Borrowed(message),
            (None, ErrorKind::Transport(status)) => {
                Cow::Borrowed(status.canonical_reason().unwrap_or("Unknown"))
            }
            (None, _) => Cow::Borrowed(INTERNAL_MESSAGE),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("op", &self.op)
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        if self.message.is_none() && self.source.is_none() {
            write!(f, ": {}", self.user_message())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal("io", e)
    }
}
