use std::{convert::Infallible, fmt::Debug, time::Duration};

use docgate_core::{context::PeerAddr, http::HttpHandler, AnyError};
use http::{header, StatusCode};
use monoio::io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_http::{
    common::body::HttpBody,
    h1::codec::{
        decoder::{FillPayload, RequestDecoder},
        encoder::GenericEncoder,
    },
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, ParamRef, Service,
};
use tracing::{debug, error, warn};

use super::{generate_response, CLOSE_VALUE};

/// HTTP/1.1 connection driver: decodes requests, runs the handler chain and
/// writes the responses back while the connection stays alive.
#[derive(Clone)]
pub struct HttpCoreService<H> {
    handler_chain: H,
    keepalive_timeout: Duration,
}

impl<H> HttpCoreService<H> {
    pub fn new(handler_chain: H, keepalive: Keepalive) -> Self {
        HttpCoreService {
            handler_chain,
            keepalive_timeout: keepalive.0,
        }
    }
}

impl<H, S, CX> Service<(S, CX)> for HttpCoreService<H>
where
    S: Split + AsyncReadRent + AsyncWriteRent,
    H: HttpHandler<CX, HttpBody, Body = HttpBody>,
    H::Error: Into<AnyError> + Debug,
    CX: ParamRef<PeerAddr> + Clone,
{
    type Response = ();
    type Error = Infallible;

    async fn call(&self, (stream, ctx): (S, CX)) -> Result<Self::Response, Self::Error> {
        let peer = ParamRef::<PeerAddr>::param_ref(&ctx).0;
        let (reader, writer) = stream.into_split();
        let mut decoder = RequestDecoder::new(reader);
        let mut encoder = GenericEncoder::new(writer);

        loop {
            // decode request with keepalive timeout
            let req = match monoio::time::timeout(self.keepalive_timeout, decoder.next()).await {
                Ok(Some(Ok(req))) => HttpBody::request(req),
                Ok(Some(Err(err))) => {
                    warn!("decode request header from {peer} failed: {err}");
                    break;
                }
                Ok(None) => {
                    debug!("connection {peer} closed");
                    break;
                }
                Err(_) => {
                    debug!("connection {peer} keepalive timed out");
                    break;
                }
            };
            let client_close = req
                .headers()
                .get(header::CONNECTION)
                .map(|v| v.as_bytes().eq_ignore_ascii_case(b"close"))
                .unwrap_or(false);

            // read the body while the handler consumes it
            let (res, filled) = futures::join!(
                self.handler_chain.handle(req, ctx.clone()),
                decoder.fill_payload()
            );
            match res {
                Ok((mut resp, should_cont)) => {
                    let keepalive = should_cont && !client_close && filled.is_ok();
                    if !keepalive {
                        resp.headers_mut().insert(header::CONNECTION, CLOSE_VALUE);
                    }
                    if let Err(e) = encoder.send_and_flush(resp).await {
                        warn!("error when encode and write response: {e}");
                        break;
                    }
                    if let Err(e) = filled {
                        warn!("error when decode request body: {e}");
                        break;
                    }
                    if !keepalive {
                        break;
                    }
                }
                Err(e) => {
                    // the chain could not produce any response
                    error!("error when processing request: {e:?}");
                    if let Err(e) = encoder
                        .send_and_flush(generate_response::<HttpBody>(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            true,
                        ))
                        .await
                    {
                        warn!("error when reply client: {e}");
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

// HttpCoreService is a Service and a MakeService.
impl<F> MakeService for HttpCoreService<F>
where
    F: MakeService,
{
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))?,
            keepalive_timeout: self.keepalive_timeout,
        })
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Keepalive(pub Duration);

impl Default for Keepalive {
    fn default() -> Self {
        const DEFAULT_KEEPALIVE_SEC: u64 = 75;
        Self(Duration::from_secs(DEFAULT_KEEPALIVE_SEC))
    }
}

impl<F> HttpCoreService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<Keepalive>,
    {
        layer_fn(|c: &C, inner| Self::new(inner, c.param()))
    }
}
