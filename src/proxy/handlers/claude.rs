use super::common::{
    backoff_delay, claude_error, claude_error_from, classify_dispatch_error, consult_cache,
    sse_from_chunks, sse_response, Disposition, MAX_RETRY_ATTEMPTS,
};
use crate::error::{AppError, AppResult};
use crate::models::AccountStatus;
use crate::proxy::mappers::claude::streaming::{
    cached_claude_sse, create_claude_sse_from_openai_stream, create_claude_sse_stream,
};
use crate::proxy::mappers::claude::{
    gemini_to_claude_response, last_user_text, local_openai_to_claude_response,
    synthetic_claude_message, to_gemini_request, to_local_openai_request, ClaudeRequest,
};
use crate::proxy::mappers::gemini::{parse_response, wrap_request};
use crate::proxy::mappers::CacheSink;
use crate::proxy::model_map::map_to_upstream_model;
use crate::proxy::state::AppState;
use crate::proxy::token::{fallback_project_id, RoutedAccount};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

pub async fn handle_messages(State(state): State<AppState>, Json(raw): Json<Value>) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            return claude_error(
                StatusCode::BAD_REQUEST,
                &format!("malformed messages request: {}", e),
            )
        }
    };
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let requested_model = request.model.clone();
    let upstream_model = map_to_upstream_model(&requested_model);
    debug!(
        "[{}] messages: {} -> {} (stream: {})",
        trace_id, requested_model, upstream_model, request.stream
    );

    let mut last_error = AppError::NoAccount(requested_model.clone());

    for attempt in 0..MAX_RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let Some(account) = state.token_manager.get_next(Some(&requested_model)).await else {
            return claude_error_from(&AppError::NoAccount(requested_model.clone()));
        };

        let outcome = if account.is_local() {
            dispatch_local(&state, &account, &request).await
        } else {
            dispatch_cloud(&state, &account, &request, &upstream_model).await
        };

        match outcome {
            Ok(response) => return response,
            Err(e) => {
                debug!("[{}] attempt {}/{} failed: {}", trace_id, attempt + 1, MAX_RETRY_ATTEMPTS, e);
                match classify_dispatch_error(&e) {
                    Disposition::RetryAfterCooldown => {
                        state.token_manager.mark_rate_limited(&account.email);
                        last_error = e;
                    }
                    Disposition::Retry => last_error = e,
                    Disposition::Fail => {
                        if matches!(e, AppError::UpstreamAuth(_)) {
                            let _ = state.store.update_status(&account.id, AccountStatus::Error);
                        }
                        return claude_error_from(&e);
                    }
                }
            }
        }
    }
    claude_error_from(&last_error)
}

async fn dispatch_cloud(
    state: &AppState,
    account: &RoutedAccount,
    request: &ClaudeRequest,
    upstream_model: &str,
) -> AppResult<Response> {
    let prompt = last_user_text(request);

    if let Some(p) = &prompt {
        if let Some(hit) = consult_cache(state, &account.token.access_token, p).await {
            return Ok(if request.stream {
                sse_from_chunks(cached_claude_sse(&request.model, &hit))
            } else {
                axum::Json(synthetic_claude_message(&hit, &request.model)).into_response()
            });
        }
    }

    let project = account
        .token
        .project_id
        .clone()
        .unwrap_or_else(|| fallback_project_id(&account.email));
    let wrapped = wrap_request(to_gemini_request(request), &project, upstream_model);
    let response = state
        .upstream
        .generate(&account.token.access_token, &wrapped, request.stream)
        .await?;

    if request.stream {
        let sink = prompt.map(|p| CacheSink {
            store: state.store.clone(),
            upstream: state.upstream.clone(),
            access_token: account.token.access_token.clone(),
            prompt: p,
            model: request.model.clone(),
        });
        let mut stream =
            create_claude_sse_stream(Box::pin(response.bytes_stream()), request.model.clone(), sink);
        match stream.next().await {
            Some(Ok(first)) => Ok(sse_response(first, stream)),
            Some(Err(e)) => Err(e),
            None => Err(AppError::EmptyStream),
        }
    } else {
        let body: Value = response.json().await?;
        let parsed = parse_response(&body);
        let claude = gemini_to_claude_response(&parsed, &request.model);

        if let Some(p) = prompt {
            let text: String = claude
                .get("content")
                .and_then(|c| c.as_array())
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            CacheSink {
                store: state.store.clone(),
                upstream: state.upstream.clone(),
                access_token: account.token.access_token.clone(),
                prompt: p,
                model: request.model.clone(),
            }
            .save(text);
        }
        Ok(axum::Json(claude).into_response())
    }
}

async fn dispatch_local(
    state: &AppState,
    account: &RoutedAccount,
    request: &ClaudeRequest,
) -> AppResult<Response> {
    let base = account.token.local_base_url().to_string();
    let model = account
        .token
        .local_model()
        .unwrap_or(request.model.as_str())
        .to_string();

    let body = to_local_openai_request(request, &model, request.stream);
    let response = state.local.chat(&base, &body, request.stream).await?;

    if request.stream {
        let mut stream =
            create_claude_sse_from_openai_stream(Box::pin(response.bytes_stream()), request.model.clone());
        match stream.next().await {
            Some(Ok(first)) => Ok(sse_response(first, stream)),
            Some(Err(e)) => Err(e),
            None => Err(AppError::EmptyStream),
        }
    } else {
        let v: Value = response.json().await?;
        Ok(axum::Json(local_openai_to_claude_response(&v, &request.model)).into_response())
    }
}
