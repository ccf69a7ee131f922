//! ELM327 Scanner - Main Entry Point
//!
//! Usage: `obd-scan [config.toml]`

use obd_scan::{init_logging, run, AppConfig, DEFAULT_CONFIG_PATH};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&path)?;
    init_logging(&config.logging)?;

    info!("=== ELM327 Scanner v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Adapter: {:?}", config.transport);

    run(config).await
}
