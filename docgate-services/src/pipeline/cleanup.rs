use docgate_core::{
    http::{HttpHandler, ResponseWithContinue},
    log::RequestLogger,
    resource::{Release, ResourceSlot},
};
use http::Request;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, ParamRef, ParamSet, Service,
};

const OP: &str = "pipeline.cleanup";

/// Gives every request an empty [`ResourceSlot`] and releases it after the
/// inner stages are done with the request.
///
/// Release happens in a drop guard, so it also runs when the inner future
/// unwinds or the connection is dropped mid request.
///
/// A `webhookURL` workspace normally belongs to the delivery task once the
/// handler claims it. If the request fails before that, for example on an
/// unknown route, nobody claims it and this stage closes it. That is the only
/// case where the pipeline removes a webhook workspace.
#[derive(Debug, Clone)]
pub struct CleanupHandler<H> {
    inner: H,
}

impl<H> CleanupHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H, CX, B> Service<(Request<B>, CX)> for CleanupHandler<H>
where
    CX: ParamRef<RequestLogger> + ParamSet<ResourceSlot>,
    H: HttpHandler<CX::Transformed, B>,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = H::Error;

    async fn call(&self, (req, ctx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        let slot = ResourceSlot::new();
        let _guard = CleanupGuard {
            slot: slot.clone(),
            logger: ParamRef::<RequestLogger>::param_ref(&ctx).clone(),
        };
        self.inner.handle(req, ctx.param_set(slot)).await
    }
}

struct CleanupGuard {
    slot: ResourceSlot,
    logger: RequestLogger,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        match self.slot.release() {
            Release::Vacant | Release::Transferred => {}
            Release::Owned(mut resource) => {
                if let Err(e) = resource.close() {
                    self.logger.error_op(OP, &e);
                }
            }
            Release::Unclaimed(mut resource) => {
                if let Err(e) = resource.close() {
                    self.logger.error_op(OP, &e);
                }
            }
        }
    }
}

impl<F> CleanupHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| Self::new(inner))
    }
}

impl<F: MakeService> MakeService for CleanupHandler<F> {
    type Service = CleanupHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(CleanupHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
