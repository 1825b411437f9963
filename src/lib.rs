pub mod constants;
pub mod error;
pub mod models;
pub mod monitor;
pub mod proxy;
pub mod store;
mod utils;

use crate::error::AppResult;
use crate::models::AppConfig;
use crate::monitor::{LogNotifier, QuotaMonitor};
use crate::proxy::providers::{sync_local_accounts, LocalClient};
use crate::proxy::upstream::UpstreamClient;
use crate::proxy::{AppState, ProxyServer, TokenManager};
use crate::store::crypto::MasterKeySource;
use crate::store::AccountStore;
use std::sync::Arc;
use tracing::warn;

/// Assemble the application state from a config and an opened store.
pub fn build_state(config: AppConfig, store: Arc<AccountStore>) -> AppResult<AppState> {
    let upstream = Arc::new(UpstreamClient::new(&config.proxy.upstream_proxy)?);
    Ok(AppState {
        token_manager: Arc::new(TokenManager::new(store.clone(), upstream.clone())),
        store,
        upstream,
        local: Arc::new(LocalClient::new()?),
        config: Arc::new(config),
    })
}

/// Full bootstrap: open + migrate the store, discover local models, load the
/// account pool, start the monitor, bind the listener. Returns the handles
/// the caller shuts down.
pub async fn run_gateway(
    config: AppConfig,
    key_source: &dyn MasterKeySource,
) -> AppResult<(ProxyServer, Arc<QuotaMonitor>, u16)> {
    let db_path = crate::models::config::data_dir()?.join("gantry.db");
    let store = Arc::new(AccountStore::open(&db_path, key_source)?);
    store.init()?;

    let state = build_state(config, store.clone())?;

    if let Err(e) = sync_local_accounts(&store, &state.config.local_ai, &state.local).await {
        warn!("[W-LOCAL-SYNC] local model discovery failed: {}", e);
    }
    if let Err(e) = state.token_manager.load() {
        warn!("[W-BOOTSTRAP-LOAD] account pool load failed: {}", e);
    }

    let monitor = QuotaMonitor::new(store, state.upstream.clone(), Arc::new(LogNotifier));
    monitor.spawn();

    let server = ProxyServer::new();
    let port = server.start(state).await?;
    Ok((server, monitor, port))
}
