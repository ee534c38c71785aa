//! Path routing for the gateway.
//!
//! [`RouteHandler`] is the innermost service of the chain. `/ping` goes to
//! the [`PingHandler`]; every configured [`RouteConfig`] path is a
//! conversion endpoint served by the [`ConvertHandler`] with the route's
//! engine. Paths are matched with a [`matchit::Router`].
//!
//! Unknown paths and wrong methods are transport errors (404, 405) that the
//! error stage passes through as they are.
use docgate_core::{
    http::ResponseWithContinue,
    log::RequestLogger,
    process::Supervisor,
    resource::ResourceSlot,
    Error,
};
use http::{Method, Request, StatusCode};
use monoio_http::common::body::HttpBody;
use serde::{Deserialize, Serialize};
use service_async::{MakeService, ParamRef, Service};

use super::{
    convert::{ConvertHandler, ConvertTimeouts},
    ping::PingHandler,
};
use crate::pipeline::PING_PATH;

const OP: &str = "route";

/// One conversion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    /// Name of the engine doing the conversion.
    pub engine: String,
    /// Accepted upload extensions, e.g. `["html"]`.
    #[serde(default)]
    pub extensions: Vec<String>,
}

pub struct RouteHandler {
    router: matchit::Router<RouteConfig>,
    ping: PingHandler,
    convert: ConvertHandler,
}

impl RouteHandler {
    pub fn factory(
        routes: Vec<RouteConfig>,
        supervisor: Supervisor,
        timeouts: ConvertTimeouts,
    ) -> RouteHandlerFactory {
        RouteHandlerFactory {
            routes,
            supervisor,
            timeouts,
        }
    }
}

impl<CX, B> Service<(Request<B>, CX)> for RouteHandler
where
    CX: ParamRef<ResourceSlot> + ParamRef<RequestLogger>,
{
    type Response = ResponseWithContinue<HttpBody>;
    type Error = Error;

    async fn call(&self, (req, ctx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        let path = req.uri().path();
        if path == PING_PATH {
            if req.method() != Method::GET && req.method() != Method::HEAD {
                return Err(Error::transport(OP, StatusCode::METHOD_NOT_ALLOWED));
            }
            return Ok((self.ping.report()?, true));
        }
        let Ok(matched) = self.router.at(path) else {
            return Err(Error::transport(OP, StatusCode::NOT_FOUND));
        };
        if req.method() != Method::POST {
            return Err(Error::transport(OP, StatusCode::METHOD_NOT_ALLOWED));
        }
        self.convert.convert(matched.value, &ctx).await
    }
}

pub struct RouteHandlerFactory {
    routes: Vec<RouteConfig>,
    supervisor: Supervisor,
    timeouts: ConvertTimeouts,
}

#[derive(thiserror::Error, Debug)]
pub enum RoutingFactoryError {
    #[error("router error: {0:?}")]
    Router(#[from] matchit::InsertError),
    #[error("route {path} uses unknown engine '{engine}'")]
    UnknownEngine { path: String, engine: String },
}

impl MakeService for RouteHandlerFactory {
    type Service = RouteHandler;
    type Error = RoutingFactoryError;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let mut router = matchit::Router::new();
        for route in self.routes.iter() {
            if self.supervisor.engine(&route.engine).is_none() {
                return Err(RoutingFactoryError::UnknownEngine {
                    path: route.path.clone(),
                    engine: route.engine.clone(),
                });
            }
            router.insert(route.path.clone(), route.clone())?;
        }
        Ok(RouteHandler {
            router,
            ping: PingHandler::new(self.supervisor.clone()),
            convert: ConvertHandler::new(self.supervisor.clone(), self.timeouts),
        })
    }
}
