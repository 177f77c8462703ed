// =============================================================================
// Kraken Scalp Core — Main Entry Point
// =============================================================================
//
// Config always forces `trading_mode = Paused` on load; an operator must
// explicitly promote it externally. Credentials come from the environment,
// never from the config file on disk.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kraken_scalp_core::config::Config;
use kraken_scalp_core::orchestrator::Orchestrator;
use kraken_scalp_core::strategy::NoOpStrategy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("kraken-scalp-core starting up");

    let config_path = std::env::var("KRAKEN_CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        tier = ?config.tier,
        symbols = ?config.symbols,
        "engine starting in safe mode (trading paused until promoted externally)"
    );

    let config = Arc::new(config);

    // No external strategy is wired into this binary; `NoOpStrategy` only
    // exercises the orchestrator's plumbing. A deployment supplies its own
    // `Strategy` impl and builds its own binary around `Orchestrator`.
    let orchestrator = Orchestrator::build(config, Arc::new(NoOpStrategy)).await?;
    orchestrator.run().await?;

    info!("kraken-scalp-core shut down complete");
    Ok(())
}
