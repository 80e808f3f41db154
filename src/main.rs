use anyhow::{Context, Result};
use tcp_tunnels::{DEFAULT_CONFIG_FILE, TunnelManager, load_config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = load_config(&config_file)?;
    info!(
        config_file = %config_file,
        tunnels = config.tunnels.len(),
        connect_timeout_ms = config.connect_timeout_ms,
        idle_timeout_secs = config.idle_timeout_secs,
        bind_address = %config.bind_address,
        "Configuration loaded"
    );

    let mut manager = TunnelManager::from_config(&config).await;
    for (descriptor, status) in manager.status() {
        info!(tunnel = %descriptor, status = %status, "Tunnel status");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;

    info!("Shutting down");
    manager.close_all().await;
    Ok(())
}
