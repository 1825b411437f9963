use crate::proxy::handlers::{claude, masquerade, openai};
use crate::proxy::middleware::auth_middleware;
use crate::proxy::state::AppState;
use axum::{
    extract::State,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "accounts": state.token_manager.count()
    }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(openai::handle_list_models))
        .route("/v1/chat/completions", post(openai::handle_completions))
        .route("/v1/messages", post(claude::handle_messages))
        .route(
            "/v1internal:fetchAvailableModels",
            post(masquerade::fetch_available_models),
        )
        .route("/v1internal:loadCodeAssist", post(masquerade::load_code_assist))
        .route("/oauth2/v1/userinfo", get(masquerade::userinfo))
        .route("/oauth2/v2/userinfo", get(masquerade::userinfo))
        .route("/v1/people/me", get(masquerade::people_me))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
