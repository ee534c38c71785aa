//! Deferred delivery: the conversion result is POSTed to the `webhookURL`
//! of the request by a background task, which also owns and finally closes
//! the request workspace.
use std::{
    net::{SocketAddr, ToSocketAddrs},
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use docgate_core::{
    log::RequestLogger,
    resource::{ArgKey, DeferredResource},
    Error,
};
use http::{header, uri::Scheme, HeaderValue, Request, StatusCode, Uri};
use monoio::net::TcpStream;
use monoio_http::common::body::{FixedBody, HttpBody};
use monoio_transports::{
    connectors::{Connector, TcpConnector},
    http::HttpConnector,
};

use super::convert::{ConversionJob, Converter};

const OP: &str = "webhook.deliver";

type PooledHttpConnector = HttpConnector<TcpConnector, SocketAddr, TcpStream>;

/// Where a webhook goes.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    uri: Uri,
    addr: SocketAddr,
}

#[derive(Clone)]
pub struct WebhookDelivery {
    connector: Rc<PooledHttpConnector>,
    converter: Converter,
}

impl WebhookDelivery {
    pub fn new(converter: Converter) -> Self {
        Self {
            connector: Rc::new(PooledHttpConnector::default()),
            converter,
        }
    }

    /// Validates and resolves a webhook url. Only plain http is delivered.
    pub fn target(url: &str) -> Result<WebhookTarget, Error> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::invalid(OP, format!("invalid '{}': {e}", ArgKey::WebhookUrl)))?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(Error::invalid(
                OP,
                format!("'{}' must be an http url", ArgKey::WebhookUrl),
            ));
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::invalid(OP, format!("'{}' has no host", ArgKey::WebhookUrl)))?;
        let port = uri.port_u16().unwrap_or(80);
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::invalid(OP, format!("unable to resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| Error::invalid(OP, format!("unable to resolve {host}")))?;
        Ok(WebhookTarget { uri, addr })
    }

    /// Converts and delivers in the background; the task closes `resource`
    /// exactly once, whatever the outcome.
    pub fn spawn(
        &self,
        target: WebhookTarget,
        job: ConversionJob,
        resource: DeferredResource,
        logger: RequestLogger,
    ) {
        let delivery = self.clone();
        monoio::spawn(async move { delivery.deliver(target, job, resource, logger).await });
    }

    async fn deliver(
        &self,
        target: WebhookTarget,
        job: ConversionJob,
        mut resource: DeferredResource,
        logger: RequestLogger,
    ) {
        let timeout = resource
            .duration_arg(ArgKey::WebhookUrlTimeout)
            .ok()
            .flatten()
            .unwrap_or(self.converter.timeouts().webhook);
        let delivered = match self.converter.run(&job).await {
            Ok(pdf) => self.post(&target, pdf, &job.filename, timeout).await,
            Err(e) => Err(e),
        };
        match delivered {
            Ok(status) => logger.info_op(OP, format_args!("delivered to {} ({status})", target.uri)),
            Err(e) => logger.error_op(e.op(), &e),
        }
        if let Err(e) = resource.close() {
            logger.error_op("webhook.cleanup", &e);
        }
    }

    async fn post(
        &self,
        target: &WebhookTarget,
        pdf: Bytes,
        filename: &str,
        timeout: Duration,
    ) -> Result<StatusCode, Error> {
        let path = target
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let mut builder = Request::post(path)
            .header(header::CONTENT_TYPE, "application/pdf")
            .header(header::CONTENT_LENGTH, pdf.len());
        if let Some(authority) = target.uri.authority() {
            builder = builder.header(header::HOST, authority.as_str());
        }
        if let Ok(disposition) =
            HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        {
            builder = builder.header(header::CONTENT_DISPOSITION, disposition);
        }
        let req = builder
            .body(HttpBody::fixed_body(Some(pdf)))
            .map_err(|e| Error::internal(OP, e))?;

        let send = async {
            let mut conn = self
                .connector
                .connect(target.addr)
                .await
                .map_err(|e| Error::internal(OP, format!("connect {}: {e:?}", target.addr)))?;
            match conn.send_request(req).await {
                (Ok(resp), _) => Ok(resp.status()),
                (Err(e), _) => Err(Error::internal(OP, format!("send to {}: {e:?}", target.uri))),
            }
        };
        let status = monoio::time::timeout(timeout, send)
            .await
            .map_err(|_| Error::timeout(OP, format!("webhook not answered within {timeout:?}")))??;
        if !status.is_success() {
            return Err(Error::internal(
                OP,
                format!("webhook {} answered {status}", target.uri),
            ));
        }
        Ok(status)
    }
}
