use gantry::models::config::load_config;
use gantry::store::crypto::DeviceKeySource;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("startup aborted: {}", e);
            std::process::exit(1);
        }
    };

    let (server, monitor, port) = match gantry::run_gateway(config, &DeviceKeySource).await {
        Ok(handles) => handles,
        Err(e) => {
            error!("startup aborted: {}", e);
            std::process::exit(1);
        }
    };
    info!("gantry ready on 127.0.0.1:{}", port);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal listener failed: {}", e);
    }
    info!("shutting down");
    monitor.stop();
    server.shutdown().await;
}
