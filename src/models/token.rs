use serde::{Deserialize, Serialize};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth token material for an account.
///
/// For local-provider accounts two fields are overloaded, and the persisted
/// shape must round-trip so existing databases keep working: `refresh_token`
/// carries the upstream base URL and `project_id` carries the model
/// identifier. The typed accessors below are the only sanctioned readers of
/// that overloading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    pub expiry_timestamp: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenData {
    pub fn new(access_token: String, refresh_token: String, expires_in: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            access_token,
            refresh_token,
            expires_in,
            expiry_timestamp: now + expires_in,
            token_type: default_token_type(),
            project_id: None,
            session_id: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn expires_within(&self, secs: i64) -> bool {
        self.expiry_timestamp < chrono::Utc::now().timestamp() + secs
    }

    // Overloaded field: base URL of the local inference server.
    pub fn local_base_url(&self) -> &str {
        &self.refresh_token
    }

    // Overloaded field: model identifier served by the local endpoint.
    pub fn local_model(&self) -> Option<&str> {
        self.project_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_fields_round_trip() {
        let mut token = TokenData::new(String::new(), "http://127.0.0.1:11434/v1".to_string(), 0);
        token.project_id = Some("llama3:8b".to_string());

        let json = serde_json::to_string(&token).unwrap();
        let back: TokenData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.local_base_url(), "http://127.0.0.1:11434/v1");
        assert_eq!(back.local_model(), Some("llama3:8b"));
    }

    #[test]
    fn provider_specific_overflow_survives() {
        let raw = r#"{
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600,
            "expiry_timestamp": 1700000000,
            "token_type": "Bearer",
            "scope": "cloud-platform",
            "id_token": "jwt"
        }"#;
        let token: TokenData = serde_json::from_str(raw).unwrap();
        assert_eq!(token.extra.get("scope").and_then(|v| v.as_str()), Some("cloud-platform"));
        let out = serde_json::to_value(&token).unwrap();
        assert_eq!(out.get("id_token").and_then(|v| v.as_str()), Some("jwt"));
    }

    #[test]
    fn expiry_window_check() {
        let fresh = TokenData::new("a".into(), "r".into(), 3600);
        assert!(!fresh.expires_within(300));
        assert!(fresh.expires_within(7200));
    }
}
