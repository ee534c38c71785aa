//! Preconstructed factories.

use std::{fmt::Debug, net::SocketAddr};

use docgate_core::process::Supervisor;
use docgate_services::{
    http::{
        handlers::{ConvertTimeouts, RouteConfig, RouteHandler},
        ConnectionHandler, HttpCoreService,
    },
    pipeline::{
        CatchPanicHandler, CleanupHandler, ErrorHandler, LogHandler, ResourceHandler,
        TraceHandler,
    },
};
use monoio::net::TcpStream;
use service_async::{stack::FactoryStack, MakeService, Service};

use crate::{config::SiteConfig, context::EmptyContext};

/// Create the factory of the conversion service.
///
/// Outermost first: connection context, HTTP driver, trace and logger, cleanup, request log, error
/// classification, panic capture, workspace acquisition, routing.
pub fn docgate_factory(
    config: SiteConfig,
    routes: Vec<RouteConfig>,
    supervisor: Supervisor,
    timeouts: ConvertTimeouts,
) -> impl MakeService<
    Service = impl Service<(TcpStream, SocketAddr), Error = impl Debug>,
    Error = impl Debug,
> {
    FactoryStack::new(config)
        .replace(RouteHandler::factory(routes, supervisor, timeouts))
        .push(ResourceHandler::layer())
        .push(CatchPanicHandler::layer())
        .push(ErrorHandler::layer())
        .push(LogHandler::layer())
        .push(CleanupHandler::layer())
        .push(TraceHandler::layer())
        .push(HttpCoreService::layer())
        .push(ConnectionHandler::<EmptyContext, _>::layer())
        .into_inner()
}
