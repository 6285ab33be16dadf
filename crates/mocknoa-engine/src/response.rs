//! Helpers for building hyper responses.

use crate::model::MockResponse;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tracing::warn;

/// Build an HTTP response with the given status and body.
///
/// Falls back to a bare 500 if the builder rejects its input.
pub fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| internal_error())
}

/// Build an HTTP response with headers.
pub fn build_response_with_headers(
    status: StatusCode,
    headers: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (key, value) in headers {
        builder = builder.header(key.as_ref(), value.as_ref());
    }
    builder
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| internal_error())
}

/// Plain-text response.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    build_response_with_headers(status, [("Content-Type", "text/plain; charset=utf-8")], body)
}

/// Write a configured mock response to the wire.
///
/// The body is sent exactly as stored. Headers that are not valid HTTP are skipped
/// with a warning rather than failing the whole response.
pub fn mock_response(response: &MockResponse) -> Response<Full<Bytes>> {
    let Ok(status) = StatusCode::from_u16(response.status_code) else {
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Configured status code {} is not valid", response.status_code),
        );
    };

    let mut http_response = build_response(status, response.json_string.clone());
    let headers = http_response.headers_mut();
    for header in &response.headers {
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(
                "Skipping invalid header '{}: {}' on response {}",
                header.name, header.value, response.id
            ),
        }
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    http_response
}

fn internal_error() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from("Internal Server Error")));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
