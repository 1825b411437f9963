use super::common::{
    backoff_delay, classify_dispatch_error, consult_cache, openai_error, openai_error_from,
    sse_from_chunks, sse_passthrough, sse_response, Disposition, MAX_RETRY_ATTEMPTS,
};
use crate::error::{AppError, AppResult};
use crate::models::AccountStatus;
use crate::proxy::mappers::claude::{claude_to_openai_response, gemini_to_claude_response};
use crate::proxy::mappers::gemini::{parse_response, wrap_request};
use crate::proxy::mappers::openai::streaming::{cached_openai_sse, create_openai_sse_stream};
use crate::proxy::mappers::openai::{
    last_user_text, synthetic_openai_response, to_gemini_request, OpenAIRequest,
};
use crate::proxy::mappers::CacheSink;
use crate::proxy::model_map::{map_to_upstream_model, DEFAULT_MODELS};
use crate::proxy::state::AppState;
use crate::proxy::token::{fallback_project_id, RoutedAccount};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

pub async fn handle_completions(State(state): State<AppState>, Json(raw): Json<Value>) -> Response {
    let request: OpenAIRequest = match serde_json::from_value(raw.clone()) {
        Ok(r) => r,
        Err(e) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                &format!("malformed chat request: {}", e),
            )
        }
    };
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let requested_model = request.model.clone();
    let upstream_model = map_to_upstream_model(&requested_model);
    debug!(
        "[{}] chat completion: {} -> {} (stream: {})",
        trace_id, requested_model, upstream_model, request.stream
    );

    let mut last_error = AppError::NoAccount(requested_model.clone());

    for attempt in 0..MAX_RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let Some(account) = state.token_manager.get_next(Some(&requested_model)).await else {
            return openai_error_from(&AppError::NoAccount(requested_model.clone()));
        };

        let outcome = if account.is_local() {
            dispatch_local(&state, &account, &raw, &request).await
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
                        return openai_error_from(&e);
                    }
                }
            }
        }
    }
    openai_error_from(&last_error)
}

async fn dispatch_cloud(
    state: &AppState,
    account: &RoutedAccount,
    request: &OpenAIRequest,
    upstream_model: &str,
) -> AppResult<Response> {
    let prompt = last_user_text(request);

    if let Some(p) = &prompt {
        if let Some(hit) = consult_cache(state, &account.token.access_token, p).await {
            return Ok(if request.stream {
                sse_from_chunks(cached_openai_sse(&request.model, &hit))
            } else {
                axum::Json(synthetic_openai_response(&hit, &request.model)).into_response()
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
            create_openai_sse_stream(Box::pin(response.bytes_stream()), request.model.clone(), sink);
        // Peek the first chunk so an upstream that closes without data is
        // retried instead of committed as a 200.
        match stream.next().await {
            Some(Ok(first)) => Ok(sse_response(first, stream)),
            Some(Err(e)) => Err(e),
            None => Err(AppError::EmptyStream),
        }
    } else {
        let body: Value = response.json().await?;
        let parsed = parse_response(&body);
        let claude = gemini_to_claude_response(&parsed, &request.model);
        let openai_response = claude_to_openai_response(&claude, &request.model);

        if let Some(p) = prompt {
            let text = openai_response
                .pointer("/choices/0/message/content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            CacheSink {
                store: state.store.clone(),
                upstream: state.upstream.clone(),
                access_token: account.token.access_token.clone(),
                prompt: p,
                model: request.model.clone(),
            }
            .save(text);
        }
        Ok(axum::Json(openai_response).into_response())
    }
}

async fn dispatch_local(
    state: &AppState,
    account: &RoutedAccount,
    raw: &Value,
    request: &OpenAIRequest,
) -> AppResult<Response> {
    let base = account.token.local_base_url().to_string();
    let model = account
        .token
        .local_model()
        .unwrap_or(request.model.as_str())
        .to_string();

    let mut body = raw.clone();
    body["model"] = json!(model);
    let response = state.local.chat(&base, &body, request.stream).await?;

    if request.stream {
        // Local providers already speak OpenAI SSE.
        Ok(sse_passthrough(response))
    } else {
        let v: Value = response.json().await?;
        Ok(axum::Json(v).into_response())
    }
}

fn strip_models_prefix(id: &str) -> &str {
    id.strip_prefix("models/").unwrap_or(id)
}

/// Model catalogue: the active account's selection, else its quota keys,
/// else the built-in defaults; local models are always appended.
pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    let accounts = match state.store.list() {
        Ok(a) => a,
        Err(e) => return openai_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let now = chrono::Utc::now().timestamp();

    let active_cloud = accounts.iter().find(|a| a.is_active && !a.provider.is_local());
    let ids: Vec<String> = match active_cloud {
        Some(a) if !a.selected_models.is_empty() => a
            .selected_models
            .iter()
            .map(|m| strip_models_prefix(m).to_string())
            .collect(),
        Some(a)
            if a.quota
                .as_ref()
                .map(|q| !q.models.is_empty())
                .unwrap_or(false) =>
        {
            a.quota
                .as_ref()
                .map(|q| q.models.keys().cloned().collect())
                .unwrap_or_default()
        }
        _ => DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
    };

    let mut data: Vec<Value> = ids
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "created": now, "owned_by": "google"}))
        .collect();

    for account in accounts.iter().filter(|a| a.provider.is_local()) {
        if let Some(model) = account.token.local_model() {
            data.push(json!({
                "id": model,
                "object": "model",
                "created": now,
                "owned_by": account.provider.as_str(),
                "local": true
            }));
        }
    }

    axum::Json(json!({"object": "list", "data": data})).into_response()
}
