use crate::models::AppConfig;
use crate::proxy::providers::LocalClient;
use crate::proxy::token::TokenManager;
use crate::proxy::upstream::UpstreamClient;
use crate::store::AccountStore;
use std::sync::Arc;

// Axum application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AccountStore>,
    pub token_manager: Arc<TokenManager>,
    pub upstream: Arc<UpstreamClient>,
    pub local: Arc<LocalClient>,
    pub config: Arc<AppConfig>,
}
