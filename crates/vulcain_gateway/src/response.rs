// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{response, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Response, StatusCode};

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    let mut response = Response::new(full(content.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Return a response with an already collected body.
pub fn buffered(parts: response::Parts, body: impl Into<Bytes>) -> GenericResponse {
    Response::from_parts(parts, full(body))
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, anyhow::Error> {
    Full::new(body.into()).map_err(anyhow::Error::from).boxed()
}

/// Return an upstream response as is, streaming its body.
pub fn streamed(parts: response::Parts, body: Incoming) -> GenericResponse {
    Response::from_parts(parts, body.map_err(anyhow::Error::from).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_body(response: GenericResponse) -> Vec<u8> {
        let body = response.into_body().collect();
        futures::executor::block_on(body)
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[test]
    fn sanity_check_text_response() {
        let response = text(StatusCode::BAD_GATEWAY, format_args!("upstream {} failed", "api"));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(to_body(response), b"upstream api failed");
    }

    #[test]
    fn sanity_check_buffered_response() {
        let (mut parts, ()) = Response::new(()).into_parts();
        parts.status = StatusCode::CREATED;
        parts
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = buffered(parts, r#"{"title":"t"}"#);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(to_body(response), br#"{"title":"t"}"#);
    }
}
