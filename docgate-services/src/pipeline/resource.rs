use std::{fmt::Display, path::PathBuf};

use bytes::Bytes;
use docgate_core::{
    http::{HttpHandler, ResponseWithContinue},
    log::RequestLogger,
    resource::{Resource, ResourceSlot},
    Error,
};
use http::Request;
use monoio_http::common::body::{Body, FixedBody};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, ParamRef, Service,
};

use super::is_ping;
use crate::http::form::read_form;

#[derive(Debug, Clone)]
pub struct ResourceSettings {
    /// Workspaces are created as `root/<trace>`.
    pub root: PathBuf,
    pub max_body_bytes: usize,
}

/// Fallible half of context construction: decodes the request form into a
/// fresh workspace and stores it in the request slot. Skipped for the health
/// check. On failure the inner handler never runs.
#[derive(Debug, Clone)]
pub struct ResourceHandler<H> {
    inner: H,
    settings: ResourceSettings,
}

impl<H> ResourceHandler<H> {
    pub fn new(inner: H, settings: ResourceSettings) -> Self {
        Self { inner, settings }
    }
}

impl<H, CX, B> Service<(Request<B>, CX)> for ResourceHandler<H>
where
    CX: ParamRef<RequestLogger> + ParamRef<ResourceSlot>,
    B: Body<Data = Bytes> + FixedBody,
    B::Error: Display,
    H: HttpHandler<CX, B, Error = Error>,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = Error;

    async fn call(&self, (req, ctx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        if is_ping(&req) {
            return self.inner.handle(req, ctx).await;
        }
        let (parts, mut body) = req.into_parts();
        let form = read_form(&parts.headers, &mut body, self.settings.max_body_bytes).await?;
        let trace = ParamRef::<RequestLogger>::param_ref(&ctx).trace();
        let resource = Resource::acquire(&self.settings.root, trace, form)?;
        ParamRef::<ResourceSlot>::param_ref(&ctx).fill(resource)?;
        // the body now lives in the workspace
        self.inner
            .handle(Request::from_parts(parts, B::fixed_body(None)), ctx)
            .await
    }
}

impl<F> ResourceHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<ResourceSettings>,
    {
        layer_fn(|c: &C, inner| Self::new(inner, c.param()))
    }
}

impl<F: MakeService> MakeService for ResourceHandler<F> {
    type Service = ResourceHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ResourceHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            settings: self.settings.clone(),
        })
    }
}
