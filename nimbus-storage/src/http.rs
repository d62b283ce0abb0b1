//! # HTTP Adapter
//!
//! Thin axum layer: every request funnels through a fallback handler into
//! the dispatcher, and the dispatcher's transport-independent response maps
//! back onto an HTTP response.

use crate::dispatch::{parse_query, GcsEmulator, GcsRequest, GcsResponse};
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tracing::debug;

/// Uploads are capped well above anything the emulator is used for.
const MAX_BODY_BYTES: usize = 1 << 30;

/// Build the HTTP router over an emulator.
pub fn router(emu: Arc<GcsEmulator>) -> Router {
    Router::new().fallback(handle).with_state(emu)
}

async fn handle(State(emu): State<Arc<GcsEmulator>>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    debug!("{} {}", parts.method, parts.uri);

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return plain_response(
                StatusCode::BAD_REQUEST,
                format!("could not read request body: {err}"),
            );
        }
    };

    let header_str = |name: header::HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    let gcs_request = GcsRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parse_query(parts.uri.query().unwrap_or_default()),
        content_type: header_str(header::CONTENT_TYPE),
        range: parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    };

    // The dispatcher does blocking file IO; keep it off the async workers.
    let result =
        tokio::task::spawn_blocking(move || emu.handle(&gcs_request)).await;
    match result {
        Ok(resp) => into_http(resp),
        Err(err) => plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("request handler panicked: {err}"),
        ),
    }
}

fn into_http(resp: GcsResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    if !resp.content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, resp.content_type);
    }
    for (name, value) in resp.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
}

fn plain_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut resp = Response::new(Body::from(message.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}
