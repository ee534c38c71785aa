mod error;
pub use error::{Error, ErrorKind, Result};

pub type AnyError = anyhow::Error;

pub mod config;
pub mod context;
pub mod http;
pub mod log;
pub mod process;
pub mod resource;
pub mod runtime;
pub mod trace;

pub(crate) mod sealed {
    pub trait SealedT<T> {}
}
