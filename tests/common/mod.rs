// Shared harness for integration tests: builds the real component stack
// (never mocks) against a throwaway state directory, the same way each
// module's own unit tests do. No test here dials out to the real exchange;
// scenarios that would require a live fill are driven by calling the same
// entry points the network layer itself would call back into (on_execution,
// apply_delta, record_rejection).

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as base64_std;
use base64::Engine;

use kraken_scalp_core::balance_ledger::BalanceLedger;
use kraken_scalp_core::circuit_breaker::CircuitBreaker;
use kraken_scalp_core::config::Config;
use kraken_scalp_core::min_size::MinSizeLearner;
use kraken_scalp_core::nonce::NonceAuthority;
use kraken_scalp_core::order_engine::OrderEngine;
use kraken_scalp_core::position_tracker::PositionTracker;
use kraken_scalp_core::rate_limiter::RateLimiter;
use kraken_scalp_core::rest_client::KrakenRestClient;
use kraken_scalp_core::signer::Signer;
use kraken_scalp_core::types::Tier;
use kraken_scalp_core::ws::session::SessionManager;

pub struct Harness {
    pub state_dir: PathBuf,
    pub rest_client: Arc<KrakenRestClient>,
    pub session_manager: Arc<SessionManager>,
    pub balance_ledger: Arc<BalanceLedger>,
    pub position_tracker: Arc<PositionTracker>,
    pub min_size: Arc<MinSizeLearner>,
    pub breaker: Arc<CircuitBreaker>,
    pub order_engine: Arc<OrderEngine>,
    pub config: Arc<Config>,
}

/// Build every component against a throwaway directory unique to `label`, so
/// parallel test binaries never race over the same nonce/position/min-size
/// file. Credentials are a fixed all-zero secret; nothing here ever signs a
/// request that actually reaches Kraken.
pub async fn build(label: &str) -> Harness {
    let state_dir = std::env::temp_dir().join(format!("kraken_scalp_core_it_{label}_{}", std::process::id()));
    let _ = std::fs::create_dir_all(&state_dir);

    let nonce = NonceAuthority::load(state_dir.join("nonce.json")).await;
    let signer = Arc::new(Signer::new("key", &base64_std.encode([0u8; 32])).unwrap());
    let rate_limiter = RateLimiter::new(Tier::Intermediate);
    let rest_client = Arc::new(KrakenRestClient::new("https://api.kraken.invalid", signer, nonce, rate_limiter));

    let session_manager = SessionManager::new("wss://example.invalid", "wss://example.invalid", rest_client.clone());

    let mut config = Config::default();
    config.state_dir = state_dir.clone();
    let config = Arc::new(config);

    let breaker = CircuitBreaker::new(config.clone());
    let min_size = MinSizeLearner::load(state_dir.join("min_size.json")).await;
    let position_tracker = PositionTracker::load(state_dir.join("positions.json")).await;
    let balance_ledger = BalanceLedger::new(rest_client.clone());

    let order_engine = OrderEngine::new(
        rest_client.clone(),
        session_manager.clone(),
        breaker.clone(),
        min_size.clone(),
        position_tracker.clone(),
        balance_ledger.clone(),
        config.clone(),
    );

    Harness {
        state_dir,
        rest_client,
        session_manager,
        balance_ledger,
        position_tracker,
        min_size,
        breaker,
        order_engine,
        config,
    }
}
