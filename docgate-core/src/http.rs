use std::future::Future;

use http::{Request, Response};
use service_async::Service;

use crate::sealed::SealedT;

/// A response plus whether the connection may be kept alive afterwards.
pub type ResponseWithContinue<B> = (Response<B>, bool);

/// Request handler as seen by the connection core. Implemented for every
/// [`Service`] mapping `(Request, CX)` to [`ResponseWithContinue`].
pub trait HttpHandler<CX, B>: SealedT<(CX, B)> {
    type Body;
    type Error;

    fn handle(
        &self,
        request: Request<B>,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue<Self::Body>, Self::Error>>;
}

impl<CX, IB, OB, T> SealedT<(CX, IB)> for T where
    T: Service<(Request<IB>, CX), Response = ResponseWithContinue<OB>>
{
}

impl<CX, IB, OB, T> HttpHandler<CX, IB> for T
where
    T: Service<(Request<IB>, CX), Response = ResponseWithContinue<OB>>,
{
    type Body = OB;
    type Error = T::Error;

    async fn handle(
        &self,
        req: Request<IB>,
        ctx: CX,
    ) -> Result<ResponseWithContinue<OB>, Self::Error> {
        self.call((req, ctx)).await
    }
}
