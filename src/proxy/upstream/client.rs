use crate::constants;
use crate::error::{AppError, AppResult};
use crate::models::{QuotaData, UpstreamProxyConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Upstream base URLs, overridable for tests and regional deployments.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub token_url: String,
    pub userinfo_url: String,
    pub cloud_code_base: String,
    pub genlang_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token_url: constants::OAUTH_TOKEN_URL.to_string(),
            userinfo_url: constants::USERINFO_URL.to_string(),
            cloud_code_base: constants::CLOUD_CODE_BASE_URL.to_string(),
            genlang_base: constants::GENLANG_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenRefresh {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

fn env_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

fn oauth_client_id() -> AppResult<String> {
    env_first(&["GANTRY_GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_ID"]).ok_or_else(|| {
        AppError::Config(
            "Missing Google OAuth client_id. Set GANTRY_GOOGLE_OAUTH_CLIENT_ID.".to_string(),
        )
    })
}

fn oauth_client_secret() -> Option<String> {
    env_first(&["GANTRY_GOOGLE_OAUTH_CLIENT_SECRET", "GOOGLE_OAUTH_CLIENT_SECRET"])
}

/// HTTP edge for every cloud upstream the gateway talks to: OAuth refresh,
/// project discovery, quota, embeddings, and generation.
pub struct UpstreamClient {
    client: Client,
    stream_client: Client,
    endpoints: Endpoints,
}

impl UpstreamClient {
    pub fn new(proxy: &UpstreamProxyConfig) -> AppResult<Self> {
        Self::with_endpoints(proxy, Endpoints::default())
    }

    pub fn with_endpoints(proxy: &UpstreamProxyConfig, endpoints: Endpoints) -> AppResult<Self> {
        Ok(Self {
            client: crate::utils::http::build_client(30, proxy)?,
            stream_client: crate::utils::http::build_stream_client(proxy)?,
            endpoints,
        })
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenRefresh> {
        let cid = oauth_client_id()?;
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", cid),
            ("refresh_token", refresh_token.to_string()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(secret) = oauth_client_secret() {
            params.push(("client_secret", secret));
        }

        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &body));
        }
        Ok(response.json().await?)
    }

    pub async fn fetch_user_info(&self, access_token: &str) -> AppResult<UserInfo> {
        let response = self
            .client
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &body));
        }
        Ok(response.json().await?)
    }

    /// Project-id discovery via loadCodeAssist. The caller applies the
    /// deterministic fallback when this fails.
    pub async fn fetch_project_id(&self, access_token: &str) -> AppResult<String> {
        let url = format!("{}/v1internal:loadCodeAssist", self.endpoints.cloud_code_base);
        let body = json!({"metadata": {"ideType": "ANTIGRAVITY"}});

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, constants::USER_AGENT.as_str())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &text));
        }

        let data: Value = response.json().await?;
        data.get("cloudaicompanionProject")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::Transient("loadCodeAssist returned no project".to_string()))
    }

    /// Quota is a composition: the telemetry endpoint supplies remaining
    /// fractions, the two catalogue endpoints enrich matching models with
    /// display names and token limits. Catalogue failures are non-fatal.
    pub async fn fetch_quota(
        &self,
        access_token: &str,
        project_id: Option<&str>,
    ) -> AppResult<QuotaData> {
        let url = format!(
            "{}/v1internal:fetchAvailableModels",
            self.endpoints.cloud_code_base
        );
        let payload = match project_id {
            Some(p) => json!({"project": p}),
            None => json!({}),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, constants::USER_AGENT.as_str())
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &body));
        }

        let data: Value = response.json().await?;
        let mut quota = QuotaData::new();
        if let Some(models) = data.get("models").and_then(|m| m.as_object()) {
            for (name, info) in models {
                let Some(quota_info) = info.get("quotaInfo") else {
                    continue;
                };
                let percentage = quota_info
                    .get("remainingFraction")
                    .and_then(|f| f.as_f64())
                    .map(|f| (f * 100.0) as i32)
                    .unwrap_or(0);
                let reset_time = quota_info
                    .get("resetTime")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let canonical = name.strip_prefix("models/").unwrap_or(name).to_string();
                quota.add_model(canonical, percentage, reset_time);
            }
        }

        for catalogue_path in ["/v1/models?pageSize=1000", "/v1beta/models?pageSize=1000"] {
            match self.fetch_catalogue(access_token, catalogue_path).await {
                Ok(entries) => {
                    for entry in entries {
                        if let Some(m) = quota.models.get_mut(&entry.name) {
                            if m.display_name.is_none() {
                                m.display_name = entry.display_name;
                            }
                            if m.max_token_allowed.is_none() {
                                m.max_token_allowed = entry.input_token_limit;
                            }
                            if m.max_completion_tokens.is_none() {
                                m.max_completion_tokens = entry.output_token_limit;
                            }
                        }
                    }
                }
                Err(e) => debug!("model catalogue fetch {} skipped: {}", catalogue_path, e),
            }
        }

        quota.last_updated = chrono::Utc::now().timestamp();
        Ok(quota)
    }

    async fn fetch_catalogue(
        &self,
        access_token: &str,
        path: &str,
    ) -> AppResult<Vec<CatalogueEntry>> {
        let url = format!("{}{}", self.endpoints.genlang_base, path);
        let response = self.client.get(&url).bearer_auth(access_token).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &body));
        }
        let data: Value = response.json().await?;
        let mut entries = Vec::new();
        if let Some(models) = data.get("models").and_then(|m| m.as_array()) {
            for m in models {
                let Some(name) = m.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                entries.push(CatalogueEntry {
                    name: name.strip_prefix("models/").unwrap_or(name).to_string(),
                    display_name: m
                        .get("displayName")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    input_token_limit: m
                        .get("inputTokenLimit")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32),
                    output_token_limit: m
                        .get("outputTokenLimit")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32),
                });
            }
        }
        Ok(entries)
    }

    /// Embedding for the semantic cache. Failures are reported, not fatal;
    /// the caller skips the similarity step.
    pub async fn embed_text(&self, access_token: &str, text: &str) -> AppResult<Vec<f32>> {
        let url = format!(
            "{}/v1beta/models/{}:embedContent",
            self.endpoints.genlang_base,
            constants::EMBEDDING_MODEL
        );
        let body = json!({
            "model": format!("models/{}", constants::EMBEDDING_MODEL),
            "content": {"parts": [{"text": text}]}
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &text));
        }

        let data: Value = response.json().await?;
        let values = data
            .get("embedding")
            .and_then(|e| e.get("values"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| AppError::Transient("embedContent returned no vector".to_string()))?;
        Ok(values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|f| f as f32)
            .collect())
    }

    /// Dispatch a translated request to the cloud-code generation endpoint.
    /// Streaming requests use the unbounded client so long generations are
    /// only cancelled by client disconnect.
    pub async fn generate(
        &self,
        access_token: &str,
        body: &Value,
        stream: bool,
    ) -> AppResult<reqwest::Response> {
        let url = if stream {
            format!(
                "{}/v1internal:streamGenerateContent?alt=sse",
                self.endpoints.cloud_code_base
            )
        } else {
            format!("{}/v1internal:generateContent", self.endpoints.cloud_code_base)
        };
        let client = if stream { &self.stream_client } else { &self.client };

        let response = client
            .post(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, constants::USER_AGENT.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::from_upstream(status, &text));
        }
        Ok(response)
    }
}

struct CatalogueEntry {
    name: String,
    display_name: Option<String>,
    input_token_limit: Option<u32>,
    output_token_limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, routing::post, Json, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{}", addr)
    }

    fn client_for(base: &str) -> UpstreamClient {
        UpstreamClient::with_endpoints(
            &UpstreamProxyConfig::default(),
            Endpoints {
                token_url: format!("{}/token", base),
                userinfo_url: format!("{}/userinfo", base),
                cloud_code_base: base.to_string(),
                genlang_base: base.to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn quota_fetch_merges_catalogue_metadata() {
        let router = Router::new()
            .route(
                "/v1internal:fetchAvailableModels",
                post(|| async {
                    Json(json!({
                        "models": {
                            "models/gemini-3-pro-preview": {
                                "quotaInfo": {"remainingFraction": 0.42, "resetTime": "2026-08-02T00:00:00Z"}
                            },
                            "models/no-quota-info": {}
                        }
                    }))
                }),
            )
            .route(
                "/v1/models",
                get(|| async {
                    Json(json!({
                        "models": [{
                            "name": "models/gemini-3-pro-preview",
                            "displayName": "Gemini 3 Pro Preview",
                            "inputTokenLimit": 1048576,
                            "outputTokenLimit": 65536
                        }]
                    }))
                }),
            )
            .route("/v1beta/models", get(|| async { Json(json!({"models": []})) }));

        let base = serve(router).await;
        let client = client_for(&base);
        let quota = client.fetch_quota("tok", Some("proj")).await.unwrap();

        let m = &quota.models["gemini-3-pro-preview"];
        assert_eq!(m.percentage, 42);
        assert_eq!(m.reset_time, "2026-08-02T00:00:00Z");
        assert_eq!(m.display_name.as_deref(), Some("Gemini 3 Pro Preview"));
        assert_eq!(m.max_token_allowed, Some(1_048_576));
        assert_eq!(m.max_completion_tokens, Some(65_536));
        assert!(!quota.models.contains_key("no-quota-info"));
    }

    #[tokio::test]
    async fn quota_429_maps_to_rate_limited() {
        let router = Router::new().route(
            "/v1internal:fetchAvailableModels",
            post(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    "RESOURCE_EXHAUSTED",
                )
            }),
        );
        let base = serve(router).await;
        let client = client_for(&base);
        assert!(matches!(
            client.fetch_quota("tok", None).await,
            Err(AppError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn project_discovery_reads_companion_project() {
        let router = Router::new().route(
            "/v1internal:loadCodeAssist",
            post(|| async { Json(json!({"cloudaicompanionProject": "bamboo-precept-lgxtn"})) }),
        );
        let base = serve(router).await;
        let client = client_for(&base);
        assert_eq!(
            client.fetch_project_id("tok").await.unwrap(),
            "bamboo-precept-lgxtn"
        );
    }

    #[tokio::test]
    async fn userinfo_maps_profile_fields() {
        let router = Router::new().route(
            "/userinfo",
            get(|| async {
                Json(json!({
                    "email": "dev@example.com",
                    "name": "Dev Example",
                    "picture": "https://example.com/p.png"
                }))
            }),
        );
        let base = serve(router).await;
        let client = client_for(&base);
        let info = client.fetch_user_info("tok").await.unwrap();
        assert_eq!(info.email, "dev@example.com");
        assert_eq!(info.name.as_deref(), Some("Dev Example"));
        assert!(info.given_name.is_none());
    }

    #[tokio::test]
    async fn embedding_parses_vector() {
        let path = format!("/v1beta/models/{}:embedContent", constants::EMBEDDING_MODEL);
        let router = Router::new().route(
            &path,
            post(|| async { Json(json!({"embedding": {"values": [0.1, 0.2, 0.3]}})) }),
        );
        let base = serve(router).await;
        let client = client_for(&base);
        let v = client.embed_text("tok", "hello").await.unwrap();
        assert_eq!(v.len(), 3);
        assert!((v[1] - 0.2).abs() < 1e-6);
    }
}
