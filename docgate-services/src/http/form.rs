//! Request form decoding: `multipart/form-data` and
//! `application/x-www-form-urlencoded` bodies.
use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use docgate_core::{
    resource::{FormData, Upload},
    Error,
};
use http::{header, HeaderMap};
use monoio_http::common::body::Body;

const OP: &str = "form.read";

/// Reads the whole body, failing with an Invalid error past `limit` bytes.
pub async fn read_body<B>(body: &mut B, limit: usize) -> Result<Bytes, Error>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next_data().await {
        let chunk =
            chunk.map_err(|e| Error::invalid(OP, format!("unable to read request body: {e}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(Error::invalid(
                OP,
                format!("request body exceeds {limit} bytes"),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

pub async fn read_form<B>(headers: &HeaderMap, body: &mut B, limit: usize) -> Result<FormData, Error>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let body = read_body(body, limit).await?;
    parse_form(headers, body).await
}

pub async fn parse_form(headers: &HeaderMap, body: Bytes) -> Result<FormData, Error> {
    let Some(content_type) = headers.get(header::CONTENT_TYPE) else {
        if body.is_empty() {
            return Ok(FormData::default());
        }
        return Err(Error::invalid(OP, "missing Content-Type header"));
    };
    let content_type = content_type
        .to_str()
        .map_err(|_| Error::invalid(OP, "malformed Content-Type header"))?;
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "multipart/form-data" => multipart(content_type, body).await,
        "application/x-www-form-urlencoded" => {
            let values = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body)
                .map_err(|e| Error::invalid(OP, format!("malformed form: {e}")))?;
            Ok(FormData {
                values,
                files: Vec::new(),
            })
        }
        other => Err(Error::invalid(
            OP,
            format!("unsupported Content-Type '{other}'"),
        )),
    }
}

async fn multipart(content_type: &str, body: Bytes) -> Result<FormData, Error> {
    let invalid = |e: multer::Error| Error::invalid(OP, format!("malformed multipart form: {e}"));
    let boundary = multer::parse_boundary(content_type).map_err(invalid)?;
    let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut form = FormData::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let content = field.bytes().await.map_err(invalid)?;
        match (file_name, name) {
            (Some(file_name), _) => form.files.push(Upload { file_name, content }),
            (None, Some(name)) => {
                let value = String::from_utf8(content.to_vec()).map_err(|_| {
                    Error::invalid(OP, format!("form field '{name}' is not valid utf-8"))
                })?;
                form.values.push((name, value));
            }
            (None, None) => {}
        }
    }
    Ok(form)
}
