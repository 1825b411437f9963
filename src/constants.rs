use once_cell::sync::Lazy;

pub const DEFAULT_PORT: u16 = 8045;

// Selection cooldown applied after a rate-limit signal.
pub const COOLDOWN_SECS: i64 = 300;
// A token expiring within this window is refreshed before it is handed out.
pub const REFRESH_WINDOW_SECS: i64 = 300;
// The quota monitor refreshes earlier so a poll never runs on a dying token.
pub const MONITOR_REFRESH_WINDOW_SECS: i64 = 600;
pub const MONITOR_POLL_INTERVAL_SECS: u64 = 300;
pub const MONITOR_MAX_CONCURRENT_POLLS: usize = 3;

pub const SEMANTIC_CACHE_THRESHOLD: f32 = 0.97;

pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
pub const CLOUD_CODE_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
pub const GENLANG_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const EMBEDDING_MODEL: &str = "text-embedding-004";

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "antigravity/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
