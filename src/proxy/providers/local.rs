use crate::error::{AppError, AppResult};
use crate::models::{Account, LocalAiConfig, Provider, TokenData};
use crate::store::AccountStore;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

// Local inference servers can chew on a prompt for a while; they get a wider
// budget than cloud calls.
const LOCAL_TIMEOUT_SECS: u64 = 120;

/// OpenAI-compatible client for user-run inference servers (Ollama,
/// LM Studio). Local traffic never goes through the upstream proxy.
pub struct LocalClient {
    client: Client,
    stream_client: Client,
}

impl LocalClient {
    pub fn new() -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(LOCAL_TIMEOUT_SECS))
            .build()?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, stream_client })
    }

    pub async fn list_models(&self, base_url: &str) -> AppResult<Vec<String>> {
        let url = format!("{}/models", base_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &body));
        }
        let data: Value = response.json().await?;
        Ok(data
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn chat(&self, base_url: &str, body: &Value, stream: bool) -> AppResult<reqwest::Response> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let client = if stream { &self.stream_client } else { &self.client };
        let response = client.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &text));
        }
        Ok(response)
    }
}

fn local_account(provider: Provider, base_url: &str, model: &str) -> Account {
    let label = match provider {
        Provider::LocalLmStudio => "lmstudio",
        _ => "ollama",
    };
    // Overloaded persisted shape: refresh_token carries the base URL,
    // project_id the model id.
    let mut token = TokenData::new(String::new(), base_url.to_string(), 0);
    token.project_id = Some(model.to_string());
    token.expiry_timestamp = i64::MAX / 2;
    Account::new(
        format!("{}:{}", provider.as_str(), model),
        provider,
        format!("{}@localhost", label),
        token,
    )
}

/// Discover models on the enabled local endpoints and upsert one account per
/// model. Unreachable endpoints are skipped, not fatal.
pub async fn sync_local_accounts(
    store: &AccountStore,
    config: &LocalAiConfig,
    client: &LocalClient,
) -> AppResult<usize> {
    let mut synced = 0usize;
    let endpoints = [
        (Provider::LocalOllama, &config.ollama),
        (Provider::LocalLmStudio, &config.lmstudio),
    ];

    for (provider, endpoint) in endpoints {
        if !endpoint.enabled {
            continue;
        }
        let models = match client.list_models(&endpoint.url).await {
            Ok(m) => m,
            Err(e) => {
                warn!("[W-LOCAL-DISCOVERY] {} unreachable: {}", endpoint.url, e);
                continue;
            }
        };
        for model in models {
            let account = local_account(provider.clone(), &endpoint.url, &model);
            let id = account.id.clone();
            // Keep an existing row's activation and filters.
            if let Ok(Some(_)) = store.get(&id) {
                debug!("local account {} already present", id);
                continue;
            }
            store.add(&account)?;
            synced += 1;
            info!("discovered local model {} at {}", id, endpoint.url);
        }
    }
    Ok(synced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocalEndpointConfig;
    use crate::store::test_support::memory_store;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve_models(models: Vec<&'static str>) -> String {
        let router = Router::new().route(
            "/v1/models",
            get(move || {
                let models = models.clone();
                async move {
                    let data: Vec<Value> = models.iter().map(|m| json!({"id": m})).collect();
                    Json(json!({"object": "list", "data": data}))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{}/v1", addr)
    }

    #[tokio::test]
    async fn discovery_creates_overloaded_accounts() {
        let base = serve_models(vec!["llama3:8b", "qwen2:7b"]).await;
        let store = memory_store();
        let config = LocalAiConfig {
            ollama: LocalEndpointConfig {
                enabled: true,
                url: base.clone(),
            },
            lmstudio: LocalEndpointConfig {
                enabled: false,
                url: String::new(),
            },
        };
        let client = LocalClient::new().unwrap();

        let synced = sync_local_accounts(&store, &config, &client).await.unwrap();
        assert_eq!(synced, 2);

        let account = store.get("local-ollama:llama3:8b").unwrap().unwrap();
        assert!(account.provider.is_local());
        assert_eq!(account.token.local_base_url(), base);
        assert_eq!(account.token.local_model(), Some("llama3:8b"));

        // Second sync is a no-op.
        let synced = sync_local_accounts(&store, &config, &client).await.unwrap();
        assert_eq!(synced, 0);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_not_fatal() {
        let store = memory_store();
        let config = LocalAiConfig {
            ollama: LocalEndpointConfig {
                enabled: true,
                url: "http://127.0.0.1:9/v1".to_string(),
            },
            lmstudio: LocalEndpointConfig {
                enabled: false,
                url: String::new(),
            },
        };
        let client = LocalClient::new().unwrap();
        assert_eq!(sync_local_accounts(&store, &config, &client).await.unwrap(), 0);
    }
}
