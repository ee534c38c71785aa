use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use monoio_http::common::body::FixedBody;

pub use self::{
    connection::ConnectionHandler,
    core::{HttpCoreService, Keepalive},
};

pub mod form;
pub mod handlers;

mod connection;
mod core;

pub const CLOSE: &str = "close";
#[allow(clippy::declare_interior_mutable_const)]
pub const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub const APPLICATION_JSON: HeaderValue = HeaderValue::from_static("application/json");

/// Empty bodied response.
pub fn generate_response<B: FixedBody>(status: StatusCode, close: bool) -> Response<B> {
    let mut resp = Response::new(B::fixed_body(None));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    if close {
        headers.insert(header::CONNECTION, CLOSE_VALUE);
    }
    // 204 must not carry a Content-Length
    if status != StatusCode::NO_CONTENT {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    }
    resp
}

/// Response with a fixed body and its length.
pub fn body_response<B: FixedBody>(
    status: StatusCode,
    content_type: HeaderValue,
    body: Bytes,
) -> Response<B> {
    let len = body.len();
    let mut resp = Response::new(B::fixed_body(Some(body)));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

/// `{"message": ...}` error body.
pub fn error_response<B: FixedBody>(status: StatusCode, message: &str) -> Response<B> {
    let body = serde_json::json!({ "message": message }).to_string();
    body_response(status, APPLICATION_JSON, Bytes::from(body))
}
