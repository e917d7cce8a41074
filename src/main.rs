//! `keyctld` daemon entry point.

use std::process::ExitCode;

use keyctld::config::ServerConfig;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "keyctld=info".into()))
        .json()
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "/etc/keyctld/keyctld.conf".into());

    let config = match ServerConfig::load(&config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load server configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "keyctld starting");

    if let Err(e) = keyctld::server::run(config).await {
        error!(error = %e, "keyctld exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
