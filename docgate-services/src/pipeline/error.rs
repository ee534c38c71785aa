use std::convert::Infallible;

use docgate_core::{
    http::{HttpHandler, ResponseWithContinue},
    log::RequestLogger,
    Error,
};
use http::{Request, Response};
use monoio_http::common::body::FixedBody;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, ParamRef, Service,
};

use crate::http::error_response;

/// Converts handler errors into responses. Nothing below this stage writes
/// an error response itself.
#[derive(Debug, Clone)]
pub struct ErrorHandler<H> {
    inner: H,
}

impl<H> ErrorHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H, CX, B> Service<(Request<B>, CX)> for ErrorHandler<H>
where
    CX: ParamRef<RequestLogger>,
    H: HttpHandler<CX, B, Error = Error>,
    H::Body: FixedBody,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = Infallible;

    async fn call(&self, (req, ctx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        let logger = ParamRef::<RequestLogger>::param_ref(&ctx).clone();
        match self.inner.handle(req, ctx).await {
            Ok(resp) => Ok(resp),
            Err(err) => Ok((classify(&logger, &err), true)),
        }
    }
}

/// Maps an error to its response, a status and a JSON message. Transport
/// errors keep their own status and are not logged; every other error is
/// logged once under its own op.
pub fn classify<B: FixedBody>(logger: &RequestLogger, err: &Error) -> Response<B> {
    if !err.kind().is_transport() {
        logger.error_op(err.op(), err);
    }
    error_response(err.status(), &err.user_message())
}

impl<F> ErrorHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| Self::new(inner))
    }
}

impl<F: MakeService> MakeService for ErrorHandler<F> {
    type Service = ErrorHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ErrorHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
