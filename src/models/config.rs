use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

fn default_port() -> u16 {
    crate::constants::DEFAULT_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    // Optional shared bearer required on inbound requests. Loopback is the
    // security boundary when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub local_ai: LocalAiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAiConfig {
    #[serde(default = "LocalEndpointConfig::default_ollama")]
    pub ollama: LocalEndpointConfig,
    #[serde(default = "LocalEndpointConfig::default_lmstudio")]
    pub lmstudio: LocalEndpointConfig,
}

impl Default for LocalAiConfig {
    fn default() -> Self {
        Self {
            ollama: LocalEndpointConfig::default_ollama(),
            lmstudio: LocalEndpointConfig::default_lmstudio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEndpointConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
}

impl LocalEndpointConfig {
    fn default_ollama() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:11434/v1".to_string(),
        }
    }

    fn default_lmstudio() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:1234/v1".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            auth_token: None,
            proxy: ProxySection::default(),
            local_ai: LocalAiConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.port == 0 {
            return Err(AppError::Config("port must be non-zero".to_string()));
        }
        if self.proxy.upstream_proxy.enabled {
            url::Url::parse(&self.proxy.upstream_proxy.url)
                .map_err(|e| AppError::Config(format!("invalid upstream proxy url: {}", e)))?;
        }
        for (label, ep) in [("ollama", &self.local_ai.ollama), ("lmstudio", &self.local_ai.lmstudio)] {
            if ep.enabled {
                url::Url::parse(&ep.url)
                    .map_err(|e| AppError::Config(format!("invalid {} url: {}", label, e)))?;
            }
        }
        Ok(())
    }
}

pub fn data_dir() -> AppResult<PathBuf> {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| AppError::Config("cannot resolve a per-user data directory".to_string()))?;
    Ok(base.join("gantry"))
}

pub fn config_path() -> AppResult<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

pub fn load_config() -> AppResult<AppConfig> {
    let path = config_path()?;
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("malformed config {}: {}", path.display(), e)))?
    } else {
        AppConfig::default()
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("GANTRY_PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.port = p;
                    info!("Using gateway port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(token) = std::env::var("GANTRY_AUTH_TOKEN") {
        if !token.trim().is_empty() {
            info!("Using inbound auth token from environment");
            config.auth_token = Some(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let c = AppConfig::default();
        assert_eq!(c.port, 8045);
        assert!(c.auth_token.is_none());
        assert!(!c.proxy.upstream_proxy.enabled);
        assert!(!c.local_ai.ollama.enabled);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_bad_upstream_proxy_url() {
        let mut c = AppConfig::default();
        c.proxy.upstream_proxy.enabled = true;
        c.proxy.upstream_proxy.url = "not a url".to_string();
        assert!(matches!(c.validate(), Err(crate::error::AppError::Config(_))));
    }

    #[test]
    fn config_parses_nested_sections() {
        let raw = r#"{
            "port": 9100,
            "auth_token": "secret",
            "proxy": {"upstream_proxy": {"enabled": true, "url": "http://127.0.0.1:7890"}},
            "local_ai": {"ollama": {"enabled": true, "url": "http://127.0.0.1:11434/v1"}}
        }"#;
        let c: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(c.port, 9100);
        assert_eq!(c.auth_token.as_deref(), Some("secret"));
        assert!(c.proxy.upstream_proxy.enabled);
        assert!(c.local_ai.ollama.enabled);
        assert!(!c.local_ai.lmstudio.enabled);
        assert!(c.validate().is_ok());
    }
}
