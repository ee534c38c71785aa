use std::time::Instant;

use docgate_core::{
    http::{HttpHandler, ResponseWithContinue},
    log::RequestLogger,
};
use http::{Request, StatusCode};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, ParamRef, Service,
};

use super::is_ping;

/// Logs method, path, status and latency of every request. Health checks are
/// only logged at debug level.
#[derive(Debug, Clone)]
pub struct LogHandler<H> {
    inner: H,
}

impl<H> LogHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H, CX, B> Service<(Request<B>, CX)> for LogHandler<H>
where
    CX: ParamRef<RequestLogger>,
    H: HttpHandler<CX, B>,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = H::Error;

    async fn call(&self, (req, ctx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        let logger = ParamRef::<RequestLogger>::param_ref(&ctx).clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let debug_only = is_ping(&req);
        let started = Instant::now();

        let res = self.inner.handle(req, ctx).await;
        let status = match &res {
            Ok((resp, _)) => resp.status(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        logger.request_result(&method, &path, status, started.elapsed(), debug_only);
        res
    }
}

impl<F> LogHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| Self::new(inner))
    }
}

impl<F: MakeService> MakeService for LogHandler<F> {
    type Service = LogHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(LogHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
