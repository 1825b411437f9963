use crate::error::{AppError, AppResult};
use crate::models::UpstreamProxyConfig;
use reqwest::{Client, Proxy};
use std::time::Duration;

#[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
compile_error!("one TLS backend feature must be enabled: `tls-native` or `tls-rustls`");

pub fn apply_tls_backend(builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
    #[cfg(all(feature = "tls-rustls", not(feature = "tls-native")))]
    {
        return builder.use_rustls_tls();
    }
    #[cfg(any(feature = "tls-native", not(feature = "tls-rustls")))]
    {
        builder
    }
}

fn apply_proxy(
    mut builder: reqwest::ClientBuilder,
    proxy: &UpstreamProxyConfig,
) -> AppResult<reqwest::ClientBuilder> {
    if proxy.enabled && !proxy.url.is_empty() {
        let p = Proxy::all(&proxy.url)
            .map_err(|e| AppError::Config(format!("invalid upstream proxy url {}: {}", proxy.url, e)))?;
        builder = builder.proxy(p);
        tracing::info!("Outbound HTTP routed through upstream proxy: {}", proxy.url);
    }
    Ok(builder)
}

/// Client for bounded upstream calls. `timeout_secs` caps the whole request.
pub fn build_client(timeout_secs: u64, proxy: &UpstreamProxyConfig) -> AppResult<Client> {
    let builder = apply_tls_backend(Client::builder())
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(20))
        .user_agent(crate::constants::USER_AGENT.as_str());
    apply_proxy(builder, proxy)?
        .build()
        .map_err(AppError::Network)
}

/// Client for SSE reads: no wall-clock timeout, cancellation comes from the
/// client disconnecting.
pub fn build_stream_client(proxy: &UpstreamProxyConfig) -> AppResult<Client> {
    let builder = apply_tls_backend(Client::builder())
        .connect_timeout(Duration::from_secs(20))
        .user_agent(crate::constants::USER_AGENT.as_str());
    apply_proxy(builder, proxy)?
        .build()
        .map_err(AppError::Network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_proxy_builds() {
        let proxy = UpstreamProxyConfig::default();
        assert!(build_client(30, &proxy).is_ok());
        assert!(build_stream_client(&proxy).is_ok());
    }

    #[test]
    fn invalid_proxy_url_is_a_config_error() {
        let proxy = UpstreamProxyConfig {
            enabled: true,
            url: "\u{0}".to_string(),
        };
        assert!(matches!(build_client(30, &proxy), Err(AppError::Config(_))));
    }
}
