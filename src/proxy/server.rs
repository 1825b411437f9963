use crate::error::{AppError, AppResult};
use crate::proxy::routes::build_router;
use crate::proxy::state::AppState;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct RunningServer {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    port: u16,
}

/// Bootstrap guard for the gateway listener. Only one instance may run at a
/// time; `shutdown` releases the slot on success and failure alike.
pub struct ProxyServer {
    inner: Mutex<Option<RunningServer>>,
}

impl ProxyServer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Bind `127.0.0.1:<port>` and serve. Binding any other interface would
    /// widen the security boundary, so the loopback address is not
    /// configurable. Returns the bound port (useful with port 0).
    pub async fn start(&self, state: AppState) -> AppResult<u16> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Err(AppError::Config(
                "proxy server already running; shut it down first".to_string(),
            ));
        }

        let requested_port = state.config.port;
        let listener = TcpListener::bind(("127.0.0.1", requested_port))
            .await
            .map_err(|e| {
                AppError::Config(format!("cannot bind 127.0.0.1:{}: {}", requested_port, e))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::Config(format!("listener has no local address: {}", e)))?
            .port();

        let router = build_router(state);
        let cancel = CancellationToken::new();
        let shutdown_signal = cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("proxy server exited with error: {}", e);
            }
        });

        info!("gateway listening on 127.0.0.1:{}", port);
        *guard = Some(RunningServer { cancel, task, port });
        Ok(port)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.inner.lock().await.as_ref().map(|r| r.port)
    }

    /// Stop the listener and drop the held instance. The slot is cleared
    /// even when the serve task ends with an error, so a failed shutdown
    /// never wedges future starts.
    pub async fn shutdown(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                error!("proxy server task join failed: {}", e);
            }
            info!("gateway stopped");
        }
    }
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppConfig, UpstreamProxyConfig};
    use crate::proxy::providers::LocalClient;
    use crate::proxy::token::TokenManager;
    use crate::proxy::upstream::UpstreamClient;
    use crate::store::test_support::memory_store;
    use std::sync::Arc;

    fn state_on_port(port: u16) -> AppState {
        let store = Arc::new(memory_store());
        let upstream = Arc::new(UpstreamClient::new(&UpstreamProxyConfig::default()).unwrap());
        let config = AppConfig {
            port,
            ..AppConfig::default()
        };
        AppState {
            token_manager: Arc::new(TokenManager::new(store.clone(), upstream.clone())),
            store,
            upstream,
            local: Arc::new(LocalClient::new().unwrap()),
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn binds_loopback_only_and_serves_health() {
        let server = ProxyServer::new();
        let port = server.start(state_on_port(0)).await.unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/health", port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        server.shutdown().await;
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn second_start_is_refused_until_shutdown() {
        let server = ProxyServer::new();
        server.start(state_on_port(0)).await.unwrap();
        assert!(matches!(
            server.start(state_on_port(0)).await,
            Err(AppError::Config(_))
        ));
        server.shutdown().await;
        // After teardown the slot is free again.
        server.start(state_on_port(0)).await.unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn busy_port_fails_with_config_error_and_no_listener() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let server = ProxyServer::new();
        let result = server.start(state_on_port(port)).await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert!(!server.is_running().await);

        // The failed bootstrap left nothing dangling; a later start works.
        drop(blocker);
        let port = server.start(state_on_port(port)).await.unwrap();
        assert!(port > 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn bearer_auth_gates_requests_when_configured() {
        let store = Arc::new(memory_store());
        let upstream = Arc::new(UpstreamClient::new(&UpstreamProxyConfig::default()).unwrap());
        let config = AppConfig {
            port: 0,
            auth_token: Some("sesame".to_string()),
            ..AppConfig::default()
        };
        let state = AppState {
            token_manager: Arc::new(TokenManager::new(store.clone(), upstream.clone())),
            store,
            upstream,
            local: Arc::new(LocalClient::new().unwrap()),
            config: Arc::new(config),
        };

        let server = ProxyServer::new();
        let port = server.start(state).await.unwrap();
        let client = reqwest::Client::new();

        let denied = client
            .get(format!("http://127.0.0.1:{}/v1/models", port))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 401);

        let allowed = client
            .get(format!("http://127.0.0.1:{}/v1/models", port))
            .bearer_auth("sesame")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);

        // Health stays reachable for liveness probes.
        let health = client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), 200);

        server.shutdown().await;
    }
}
