use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Decrypt error: {0}")]
    Decrypt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Upstream auth error: {0}")]
    UpstreamAuth(String),

    #[error("Upstream rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream transient error: {0}")]
    Transient(String),

    #[error("Empty response stream")]
    EmptyStream,

    #[error("No available accounts for model {0}")]
    NoAccount(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AppResult<T> = Result<T, AppError>;

static RATE_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)429|quota|limit|resource_exhausted").expect("Invalid rate-limit regex")
});

// 429-shaped errors trigger cooldown + retry; everything else follows its own path.
pub fn is_rate_limit_shaped(message: &str) -> bool {
    RATE_LIMIT_PATTERN.is_match(message)
}

impl AppError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited(_)
                | AppError::Transient(_)
                | AppError::EmptyStream
                | AppError::Network(_)
        )
    }

    // Classify an upstream HTTP failure by status code and body text.
    pub fn from_upstream(status: u16, body: &str) -> AppError {
        match status {
            401 | 403 => AppError::UpstreamAuth(format!("HTTP {}: {}", status, body)),
            429 => AppError::RateLimited(format!("HTTP 429: {}", body)),
            s if s >= 500 => AppError::Transient(format!("HTTP {}: {}", s, body)),
            _ if is_rate_limit_shaped(body) => {
                AppError::RateLimited(format!("HTTP {}: {}", status, body))
            }
            s => AppError::Transient(format!("HTTP {}: {}", s, body)),
        }
    }
}
