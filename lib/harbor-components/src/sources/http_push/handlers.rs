use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use harbor_core::{
    ingest::{PushIngester, PushResponse},
    message::MessageContent,
};
use tracing::debug;

pub(super) const HEALTH_PATH: &str = "/health";

#[derive(Clone)]
pub(super) struct PushState {
    ingester: PushIngester,
    token: Option<Arc<str>>,
}

impl PushState {
    pub fn new(ingester: PushIngester, token: Option<Arc<str>>) -> Self {
        Self { ingester, token }
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };

        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Token ").or_else(|| value.strip_prefix("Bearer ")))
            .is_some_and(|provided| constant_time_eq(provided.trim().as_bytes(), expected.as_bytes()))
    }
}

pub(super) fn build_router(path: &str, body_limit: Option<usize>, state: PushState) -> Router {
    let body_limit = match body_limit {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route(path, post(handle_write))
        .route(HEALTH_PATH, get(handle_health))
        .layer(body_limit)
        .with_state(state)
}

async fn handle_write(State(state): State<PushState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    if !state.is_authorized(&headers) {
        debug!("Rejected push request with a missing or invalid token.");
        return StatusCode::UNAUTHORIZED;
    }

    let request = PushRequest {
        headers: &headers,
        body: &body,
    };
    let response = state.ingester.ingest(&request).await;
    debug!(?response, body_len = body.len(), "Handled push request.");

    status_for(response)
}

async fn handle_health(State(state): State<PushState>) -> StatusCode {
    if state.ingester.is_accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn status_for(response: PushResponse) -> StatusCode {
    match response {
        PushResponse::Delivered | PushResponse::Empty => StatusCode::NO_CONTENT,
        PushResponse::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        PushResponse::Malformed => StatusCode::BAD_REQUEST,
        PushResponse::Unavailable | PushResponse::Failed | PushResponse::Abandoned => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A push request, viewed as a message: the body is the payload and the request headers are its attributes.
struct PushRequest<'a> {
    headers: &'a HeaderMap,
    body: &'a [u8],
}

impl MessageContent for PushRequest<'_> {
    fn payload(&self) -> &[u8] {
        self.body
    }

    fn content_encoding(&self) -> Option<&str> {
        self.attribute(header::CONTENT_ENCODING.as_str())
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn retryable_responses_map_to_unavailable() {
        for response in [
            PushResponse::Delivered,
            PushResponse::Empty,
            PushResponse::TooLarge,
            PushResponse::Malformed,
            PushResponse::Unavailable,
            PushResponse::Failed,
            PushResponse::Abandoned,
        ] {
            let status = status_for(response);
            assert_eq!(
                response.is_retryable(),
                status == StatusCode::SERVICE_UNAVAILABLE,
                "{:?}",
                response
            );
        }
    }

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret2"));
    }

    #[test]
    fn headers_are_attributes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert("x-region", HeaderValue::from_static("eu"));

        let request = PushRequest {
            headers: &headers,
            body: b"",
        };
        assert_eq!(request.content_encoding(), Some("gzip"));
        assert_eq!(request.attribute("x-region"), Some("eu"));
        assert_eq!(request.attribute("x-missing"), None);
    }
}
