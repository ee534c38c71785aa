//! Entry stage of every accepted connection.

use std::{marker::PhantomData, net::SocketAddr};

use docgate_core::context::PeerAddr;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, ParamSet, Service,
};
use tracing::debug;

/// Starts each connection with a fresh `CX` that carries the peer address,
/// then hands the stream to the HTTP driver.
pub struct ConnectionHandler<CX, T> {
    inner: T,
    _context: PhantomData<fn() -> CX>,
}

impl<CX, T> ConnectionHandler<CX, T> {
    pub fn new(inner: T) -> Self {
        ConnectionHandler {
            inner,
            _context: PhantomData,
        }
    }
}

impl<S, T, CX> Service<(S, SocketAddr)> for ConnectionHandler<CX, T>
where
    CX: Default + ParamSet<PeerAddr>,
    T: Service<(S, CX::Transformed)>,
{
    type Response = T::Response;
    type Error = T::Error;

    async fn call(&self, (stream, peer): (S, SocketAddr)) -> Result<Self::Response, Self::Error> {
        debug!("accepted connection from {peer}");
        let ctx = CX::default().param_set(PeerAddr(peer));
        self.inner.call((stream, ctx)).await
    }
}

impl<CX, F> ConnectionHandler<CX, F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| ConnectionHandler::new(inner))
    }
}

impl<CX, F: MakeService> MakeService for ConnectionHandler<CX, F> {
    type Service = ConnectionHandler<CX, F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let inner = self.inner.make_via_ref(old.map(|o| &o.inner))?;
        Ok(ConnectionHandler::new(inner))
    }
}
