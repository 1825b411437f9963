use crate::constants::SEMANTIC_CACHE_THRESHOLD;
use crate::error::AppError;
use crate::proxy::state::AppState;
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const MAX_RETRY_ATTEMPTS: usize = 3;

/// Exponential backoff with jitter between proxy retry attempts.
pub fn backoff_delay(attempt: usize) -> Duration {
    let base_ms = 500u64 * 2u64.pow(attempt.saturating_sub(1) as u32);
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base_ms.min(8_000) + jitter)
}

/// What the retry loop does with a dispatch failure.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    // 429-shaped: cool the account down, then try the next one.
    RetryAfterCooldown,
    // Transient network shapes and empty streams: try again as-is.
    Retry,
    // Auth and protocol failures: stop immediately.
    Fail,
}

pub fn classify_dispatch_error(error: &AppError) -> Disposition {
    match error {
        AppError::RateLimited(_) => Disposition::RetryAfterCooldown,
        AppError::Transient(_) | AppError::Network(_) | AppError::EmptyStream => Disposition::Retry,
        _ => Disposition::Fail,
    }
}

pub fn error_status(error: &AppError) -> StatusCode {
    match error {
        AppError::NoAccount(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        AppError::Protocol(_) => StatusCode::BAD_REQUEST,
        AppError::UpstreamAuth(_) | AppError::Transient(_) | AppError::Network(_) | AppError::EmptyStream => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn openai_error(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({
        "error": {
            "message": message,
            "type": "server_error",
            "code": null
        }
    }));
    (status, body).into_response()
}

pub fn claude_error(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({
        "type": "error",
        "error": {
            "type": "api_error",
            "message": message
        }
    }));
    (status, body).into_response()
}

pub fn openai_error_from(error: &AppError) -> Response {
    openai_error(error_status(error), &error.to_string())
}

pub fn claude_error_from(error: &AppError) -> Response {
    claude_error(error_status(error), &error.to_string())
}

/// Wrap a translated event stream (first chunk already peeked) as an SSE
/// response.
pub fn sse_response(
    first: Bytes,
    rest: impl Stream<Item = Result<Bytes, AppError>> + Send + 'static,
) -> Response {
    let combined = futures::stream::once(async move { Ok::<Bytes, AppError>(first) }).chain(rest);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(combined))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Replay an already-materialised event sequence (cache hits).
pub fn sse_from_chunks(chunks: Vec<Bytes>) -> Response {
    let stream = futures::stream::iter(chunks.into_iter().map(Ok::<Bytes, AppError>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Forward an upstream SSE body untouched (local providers speak the
/// caller's protocol already).
pub fn sse_passthrough(response: reqwest::Response) -> Response {
    use futures::TryStreamExt;
    let stream = response.bytes_stream().map_err(AppError::Network);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Exact lookup first, then embedding + similarity. Embedding failures skip
/// the semantic step instead of failing the request.
pub async fn consult_cache(state: &AppState, access_token: &str, prompt: &str) -> Option<String> {
    match state.store.cache_find_exact(prompt) {
        Ok(Some(hit)) => {
            debug!("semantic cache: exact hit");
            return Some(hit);
        }
        Ok(None) => {}
        Err(e) => {
            debug!("semantic cache lookup skipped: {}", e);
            return None;
        }
    }

    let query = match state.upstream.embed_text(access_token, prompt).await {
        Ok(v) if !v.is_empty() => v,
        Ok(_) => return None,
        Err(e) => {
            debug!("cache embedding skipped: {}", e);
            return None;
        }
    };
    match state.store.cache_find_semantic(&query, SEMANTIC_CACHE_THRESHOLD) {
        Ok(Some(hit)) => {
            debug!("semantic cache: similarity hit");
            Some(hit)
        }
        Ok(None) => None,
        Err(e) => {
            debug!("semantic cache scan skipped: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(1);
        let third = backoff_delay(3);
        assert!(first >= Duration::from_millis(500));
        assert!(first < Duration::from_millis(800));
        assert!(third >= Duration::from_millis(2000));
        assert!(third < Duration::from_millis(2300));
    }

    #[test]
    fn dispositions_follow_error_kind() {
        assert_eq!(
            classify_dispatch_error(&AppError::RateLimited("429".into())),
            Disposition::RetryAfterCooldown
        );
        assert_eq!(
            classify_dispatch_error(&AppError::Transient("503".into())),
            Disposition::Retry
        );
        assert_eq!(classify_dispatch_error(&AppError::EmptyStream), Disposition::Retry);
        assert_eq!(
            classify_dispatch_error(&AppError::UpstreamAuth("401".into())),
            Disposition::Fail
        );
        assert_eq!(
            classify_dispatch_error(&AppError::Protocol("bad".into())),
            Disposition::Fail
        );
    }

    #[test]
    fn no_account_surfaces_as_five_hundred_class() {
        let status = error_status(&AppError::NoAccount("gpt-4".into()));
        assert!(status.is_server_error());
    }
}
