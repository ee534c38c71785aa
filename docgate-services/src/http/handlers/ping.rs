use bytes::Bytes;
use docgate_core::{process::Supervisor, Error, ErrorKind};
use http::{Response, StatusCode};
use monoio_http::common::body::HttpBody;
use serde::Serialize;

use crate::http::{body_response, APPLICATION_JSON};

const OP: &str = "ping";

/// Health report of the engine pool.
#[derive(Debug, Clone)]
pub struct PingHandler {
    supervisor: Supervisor,
}

#[derive(Serialize)]
struct Report<'a, T> {
    status: &'a str,
    workers: T,
}

impl PingHandler {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// 200 with every instance state while each engine has a healthy
    /// instance, an internal error naming the unhealthy engines otherwise.
    pub fn report(&self) -> Result<Response<HttpBody>, Error> {
        let unhealthy: Vec<&str> = self
            .supervisor
            .engines()
            .iter()
            .map(|e| e.name.as_str())
            .filter(|name| !self.supervisor.healthy(name))
            .collect();
        if !unhealthy.is_empty() {
            return Err(Error::new(
                OP,
                ErrorKind::Internal,
                format!("unhealthy engines: {}", unhealthy.join(", ")),
            ));
        }
        let body = serde_json::to_vec(&Report {
            status: "up",
            workers: self.supervisor.snapshot(),
        })
        .map_err(|e| Error::internal(OP, e))?;
        Ok(body_response(
            StatusCode::OK,
            APPLICATION_JSON,
            Bytes::from(body),
        ))
    }
}
