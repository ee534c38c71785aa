use docgate_core::{
    http::{HttpHandler, ResponseWithContinue},
    log::{LogLevel, RequestLogger},
    trace::{Trace, TraceGenerator},
};
use http::Request;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, ParamSet, Service,
};

/// Context stage: a fresh trace and a logger bound to it for every request.
#[derive(Debug, Clone)]
pub struct TraceHandler<H> {
    inner: H,
    level: LogLevel,
    generator: TraceGenerator,
}

impl<H> TraceHandler<H> {
    pub fn new(inner: H, level: LogLevel) -> Self {
        Self {
            inner,
            level,
            generator: TraceGenerator,
        }
    }
}

impl<H, CX, B> Service<(Request<B>, CX)> for TraceHandler<H>
where
    CX: ParamSet<Trace>,
    CX::Transformed: ParamSet<RequestLogger>,
    H: HttpHandler<<CX::Transformed as ParamSet<RequestLogger>>::Transformed, B>,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = H::Error;

    async fn call(&self, (req, ctx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        let trace = self.generator.next();
        let logger = RequestLogger::new(self.level, trace.clone());
        let ctx = ctx.param_set(trace).param_set(logger);
        self.inner.handle(req, ctx).await
    }
}

impl<F> TraceHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<LogLevel>,
    {
        layer_fn(|c: &C, inner| Self::new(inner, c.param()))
    }
}

impl<F: MakeService> MakeService for TraceHandler<F> {
    type Service = TraceHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(TraceHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            level: self.level,
            generator: self.generator,
        })
    }
}
