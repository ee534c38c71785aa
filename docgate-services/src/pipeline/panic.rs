use std::{any::Any, panic::AssertUnwindSafe};

use docgate_core::Error;
use futures::FutureExt;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Service,
};

/// Converts a panic of the inner service into an internal error so the
/// request still gets a response and the outer stages still run.
///
/// The inner service must not leave shared state broken when it unwinds.
#[derive(Debug, Clone)]
pub struct CatchPanicHandler<S> {
    inner: S,
}

impl<S> CatchPanicHandler<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<R, S> Service<R> for CatchPanicHandler<S>
where
    S: Service<R, Error = Error>,
{
    type Response = S::Response;
    type Error = Error;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match AssertUnwindSafe(self.inner.call(req)).catch_unwind().await {
            Ok(res) => res,
            Err(panic) => Err(Error::internal(
                "handler.panic",
                format!("handler panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl<F> CatchPanicHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| CatchPanicHandler { inner })
    }
}

impl<F: MakeService> MakeService for CatchPanicHandler<F> {
    type Service = CatchPanicHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(CatchPanicHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
