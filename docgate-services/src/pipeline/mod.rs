//! Request lifecycle stages, outermost first:
//!
//! 1. [`TraceHandler`] assigns the trace and builds the request logger.
//! 2. [`CleanupHandler`] owns the [`ResourceSlot`](docgate_core::resource::ResourceSlot)
//!    and releases it once everything inside has returned, unwound or been
//!    cancelled.
//! 3. [`LogHandler`] logs the outcome of the request.
//! 4. [`ErrorHandler`] is the only place an error turns into a response.
//! 5. [`CatchPanicHandler`] turns a handler panic into an internal error.
//! 6. [`ResourceHandler`] decodes the form and acquires the workspace.
use http::Request;

mod cleanup;
mod error;
mod log;
mod panic;
mod resource;
mod trace;

pub use cleanup::CleanupHandler;
pub use error::{classify, ErrorHandler};
pub use log::LogHandler;
pub use panic::CatchPanicHandler;
pub use resource::{ResourceHandler, ResourceSettings};
pub use trace::TraceHandler;

/// Health check path: no workspace, debug-only logging.
pub const PING_PATH: &str = "/ping";

#[inline]
pub fn is_ping<B>(req: &Request<B>) -> bool {
    req.uri().path() == PING_PATH
}
