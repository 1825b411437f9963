use super::{quota::QuotaData, token::TokenData};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    Google,
    Anthropic,
    LocalOllama,
    LocalLmStudio,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::Google => "google",
            Provider::Anthropic => "anthropic",
            Provider::LocalOllama => "local-ollama",
            Provider::LocalLmStudio => "local-lmstudio",
            Provider::Other(s) => s.as_str(),
        }
    }

    // Local providers route to a user-run inference server instead of the cloud API.
    pub fn is_local(&self) -> bool {
        self.as_str().starts_with("local-")
    }
}

impl From<String> for Provider {
    fn from(s: String) -> Self {
        match s.as_str() {
            "google" => Provider::Google,
            "anthropic" => Provider::Anthropic,
            "local-ollama" => Provider::LocalOllama,
            "local-lmstudio" => Provider::LocalLmStudio,
            _ => Provider::Other(s),
        }
    }
}

impl From<Provider> for String {
    fn from(p: Provider) -> Self {
        p.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Refreshing,
    RateLimited,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Refreshing => "refreshing",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> AccountStatus {
        match s {
            "refreshing" => AccountStatus::Refreshing,
            "rate_limited" => AccountStatus::RateLimited,
            "error" => AccountStatus::Error,
            _ => AccountStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: Provider,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub token: TokenData,
    pub quota: Option<QuotaData>,
    pub created_at: i64,
    pub last_used: i64,
    pub status: AccountStatus,
    #[serde(default)]
    pub is_active: bool,
    // Empty list means the user opted out of filtering; a non-empty list
    // restricts which requested models this account may serve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_models: Vec<String>,
}

impl Account {
    pub fn new(id: String, provider: Provider, email: String, token: TokenData) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            provider,
            email,
            name: None,
            avatar_url: None,
            token,
            quota: None,
            created_at: now,
            last_used: now,
            status: AccountStatus::Active,
            is_active: false,
            selected_models: Vec::new(),
        }
    }

    pub fn update_last_used(&mut self) {
        self.last_used = chrono::Utc::now().timestamp();
    }

    pub fn update_quota(&mut self, quota: QuotaData) {
        self.quota = Some(quota);
    }
}
