// =============================================================================
// Trading Orchestrator — wires every component together and supervises tasks
// =============================================================================
//
// Mirrors the startup shape of a long-running trading process: build every
// component once behind an `Arc`, spawn one supervised task per long-running
// concern (market data, strategy evaluation, reconciliation), and let each
// task own its own reconnect/retry loop rather than centralizing that logic
// here. `run` returns once `ctrl_c` fires; nothing here panics on a single
// stream's failure, since each spawned loop logs and retries instead of
// propagating.
//
// The strategy cycle is the one place cross-component decisions get made:
// pull the freshest ticker/balance/position snapshot, hand it to the
// strategy, then walk whatever signals come back through confidence
// normalization, per-symbol+side cooldown dedup, and notional sizing before
// ever calling `OrderEngine::submit`. Everything downstream of that call
// (balance/tick/lot validation, transport choice, retries) is the order
// engine's concern, not this one's.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::balance_ledger::BalanceLedger;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::data_feed::DataFeed;
use crate::min_size::MinSizeLearner;
use crate::nonce::NonceAuthority;
use crate::order_engine::{OrderEngine, OrderRequest};
use crate::position_tracker::PositionTracker;
use crate::rate_limiter::RateLimiter;
use crate::rest_client::{endpoints, KrakenRestClient};
use crate::signer::Signer;
use crate::strategy::{Signal, Strategy};
use crate::types::{OrderType, Side, Ticker, TimeInForce};
use crate::ws::router::RouterEvent;
use crate::ws::session::{backoff_delay, SessionManager};

pub struct Orchestrator {
    config: Arc<Config>,
    rest_client: Arc<KrakenRestClient>,
    session_manager: Arc<SessionManager>,
    data_feed: Arc<DataFeed>,
    balance_ledger: Arc<BalanceLedger>,
    position_tracker: Arc<PositionTracker>,
    min_size: Arc<MinSizeLearner>,
    breaker: Arc<CircuitBreaker>,
    order_engine: Arc<OrderEngine>,
    strategy: Arc<dyn Strategy>,
    /// Last accepted-signal timestamp (epoch millis) per `symbol:side`, used
    /// to enforce `config.signal_cooldown_secs` between two signals on the
    /// same symbol and side.
    last_signal_at: Mutex<HashMap<String, i64>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Assemble every component from `config`, loading persisted state
    /// (nonce floor, positions, learned minimums) from `config.state_dir`,
    /// and registering each configured symbol's tick/lot/minimum constraints
    /// fetched from `AssetPairs`.
    pub async fn build(config: Arc<Config>, strategy: Arc<dyn Strategy>) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.state_dir)?;

        let nonce = NonceAuthority::load(config.state_dir.join("nonce.json")).await;
        let signer = Arc::new(Signer::new(&config.api_key, &config.api_secret)?);
        let rate_limiter = RateLimiter::new(config.tier);
        let rest_client = Arc::new(KrakenRestClient::new(
            config.rest_base_url.clone(),
            signer,
            nonce,
            rate_limiter,
        ));

        let session_manager = SessionManager::new(
            config.ws_public_url.clone(),
            config.ws_private_url.clone(),
            rest_client.clone(),
        );
        let data_feed = DataFeed::new(rest_client.clone());
        let balance_ledger = BalanceLedger::new(rest_client.clone());
        let position_tracker = PositionTracker::load(config.state_dir.join("positions.json")).await;
        let min_size = MinSizeLearner::load(config.state_dir.join("min_size.json")).await;
        let breaker = CircuitBreaker::new(config.clone());
        let order_engine = OrderEngine::new(
            rest_client.clone(),
            session_manager.clone(),
            breaker.clone(),
            min_size.clone(),
            position_tracker.clone(),
            balance_ledger.clone(),
            config.clone(),
        );

        match rest_client.fetch_symbol_metadata(&config.symbols).await {
            Ok(symbols) => {
                for (pair, symbol) in symbols {
                    info!(pair, "registered symbol metadata for tick/lot/minimum validation");
                    order_engine.register_symbol(symbol);
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch symbol metadata at startup, tick/lot/minimum validation disabled"),
        }

        Ok(Arc::new(Self {
            config,
            rest_client,
            session_manager,
            data_feed,
            balance_ledger,
            position_tracker,
            min_size,
            breaker,
            order_engine,
            strategy,
            last_signal_at: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Spawn every supervised task and block until `ctrl_c`, then drain:
    /// cancel every loop and give in-flight work a grace period to persist
    /// state before returning.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(symbols = ?self.config.symbols, tier = ?self.config.tier, "orchestrator starting");

        self.spawn_public_stream();
        self.spawn_private_stream();
        self.spawn_tick_consumer();
        self.spawn_critical_consumer();
        self.spawn_strategy_loop();
        self.spawn_reconciliation_loop();

        info!("all subsystems running, awaiting shutdown signal");
        tokio::signal::ctrl_c().await?;
        warn!("shutdown signal received, draining");
        self.shutdown.cancel();

        // Nonce, position and min-size state already persist on every
        // mutation; this pause just lets an in-flight write finish before
        // the process exits.
        tokio::time::sleep(Duration::from_millis(500)).await;
        info!("drain complete");
        Ok(())
    }

    fn spawn_public_stream(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if this.shutdown.is_cancelled() {
                    return;
                }
                tokio::select! {
                    result = this.session_manager.run_public(&this.config.symbols) => {
                        match result {
                            Ok(()) => attempt = 0,
                            Err(e) => {
                                error!(error = %e, "public WebSocket stream failed");
                                attempt += 1;
                            }
                        }
                    }
                    _ = this.shutdown.cancelled() => return,
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        });
    }

    fn spawn_private_stream(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if this.shutdown.is_cancelled() {
                    return;
                }
                tokio::select! {
                    result = this.session_manager.run_private() => {
                        match result {
                            Ok(()) => attempt = 0,
                            Err(e) => {
                                error!(error = %e, "private WebSocket stream failed");
                                attempt += 1;
                            }
                        }
                    }
                    _ = this.shutdown.cancelled() => return,
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        });
    }

    /// Drains tick events into the data feed so strategy evaluation always
    /// sees the freshest WS-pushed price without polling REST.
    fn spawn_tick_consumer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = this.session_manager.subscribe_ticks();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(RouterEvent::Ticker(ticker)) => this.data_feed.ingest_ws_tick(ticker),
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "tick consumer lagged"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = this.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Drains executions and balance updates, feeding them to the order
    /// engine and balance ledger respectively. This channel is sized so lag
    /// should not happen in practice; a lag here means a missed execution.
    fn spawn_critical_consumer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = this.session_manager.subscribe_critical();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(RouterEvent::Execution(event)) => this.order_engine.on_execution(event).await,
                        Ok(RouterEvent::BalanceUpdate(event)) => {
                            this.balance_ledger.apply_delta(&event.asset, event.balance, event.hold_trade)
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => error!(skipped = n, "critical consumer lagged, balances/executions may be stale"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = this.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Evaluates the strategy against the freshest snapshot of tickers,
    /// balances and positions every `config.cycle_ms`, then walks each
    /// returned signal through confidence/cooldown/sizing before submission.
    fn spawn_strategy_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(this.config.cycle_ms.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = this.shutdown.cancelled() => return,
                }

                if !this.breaker.can_execute("orders") {
                    continue;
                }

                let mut snapshots = Vec::new();
                for symbol in &this.config.symbols {
                    match this.data_feed.get_ticker(symbol).await {
                        Ok(ticker) => snapshots.push(ticker),
                        Err(e) => warn!(symbol, error = %e, "strategy loop could not fetch ticker"),
                    }
                }
                if snapshots.is_empty() {
                    continue;
                }

                let prices: HashMap<String, Ticker> = snapshots.iter().map(|t| (t.symbol.clone(), t.clone())).collect();
                let balances = this.balance_ledger.get_all();
                let positions = this.position_tracker.get_all();
                let signals = this.strategy.evaluate(&snapshots, &balances, &positions);

                for signal in signals {
                    this.handle_signal(signal, &prices).await;
                }
            }
        });
    }

    /// Apply confidence normalization/acceptance and cooldown dedup to a raw
    /// strategy signal, then size and submit it. Symbols blacklisted for
    /// minimum-size rejections are skipped before consuming a cooldown slot.
    async fn handle_signal(self: &Arc<Self>, signal: Signal, prices: &HashMap<String, Ticker>) {
        let symbol = signal.symbol().to_string();

        if self.min_size.is_blacklisted(&symbol) {
            warn!(symbol, "skipping signal, symbol is blacklisted for minimum-size rejections");
            return;
        }

        let confidence = Config::normalize_confidence(signal.confidence());
        if confidence < self.config.min_confidence {
            return;
        }

        let side = match &signal {
            Signal::Enter { side, .. } => *side,
            Signal::Exit { .. } => Side::Sell,
        };
        let cooldown_key = format!("{symbol}:{side}");
        let now = chrono::Utc::now().timestamp_millis();
        let cooldown_ms = (self.config.signal_cooldown_secs as i64) * 1000;
        {
            let mut guard = self.last_signal_at.lock();
            if let Some(last) = guard.get(&cooldown_key) {
                if now - last < cooldown_ms {
                    return;
                }
            }
            guard.insert(cooldown_key, now);
        }

        let reference_price = match &signal {
            Signal::Enter { suggested_price, .. } | Signal::Exit { suggested_price, .. } => {
                suggested_price.or_else(|| prices.get(&symbol).map(|t| t.last))
            }
        };

        match signal {
            Signal::Enter { symbol, side, .. } => self.submit_entry(symbol, side, reference_price).await,
            Signal::Exit { symbol, .. } => self.submit_exit(symbol, reference_price).await,
        }
    }

    /// Size an entry off `config.position_size_usdt`, capped by
    /// `config.max_position_pct` of the quote asset's free balance, rounded
    /// up to the symbol's learned/documented minimum and lot step.
    async fn submit_entry(self: &Arc<Self>, symbol: String, side: Side, price: Option<Decimal>) {
        let symbol_info = self.order_engine.symbol_info(&symbol);
        let (min_quantity, min_notional, lot_step) = symbol_info
            .as_ref()
            .map(|s| (s.min_quantity, s.min_notional, s.lot_step))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO, Decimal::ZERO));

        let quote = symbol.split_once('/').map(|(_, q)| q).unwrap_or("USD");
        let quote_free = self.balance_ledger.get(quote).map(|e| e.free).unwrap_or(Decimal::ZERO);
        let cap = quote_free * (self.config.max_position_pct / dec!(100));
        let intended_notional = self.config.position_size_usdt.min(cap);
        if intended_notional <= Decimal::ZERO {
            warn!(symbol, quote_free = %quote_free, "skipping entry, sizing cap leaves no notional to trade");
            return;
        }

        let reference_price = price.unwrap_or(Decimal::ZERO);
        let quantity = self
            .min_size
            .suggest_quantity(&symbol, intended_notional, reference_price, min_quantity, min_notional, lot_step);

        let request = OrderRequest {
            symbol: symbol.clone(),
            side,
            order_type: if price.is_some() { OrderType::Limit } else { OrderType::Market },
            quantity,
            price,
            stop: None,
            time_in_force: TimeInForce::ImmediateOrCancel,
            post_only: false,
            reduce_only: false,
        };
        match self.order_engine.submit(request).await {
            Ok(order) => info!(symbol, client_order_id = %order.client_order_id, "entry submitted"),
            Err(e) => warn!(symbol, error = %e, "entry submission failed"),
        }
    }

    /// Exit closes the full tracked position; a strategy asking to exit a
    /// symbol with no tracked quantity is a no-op rather than an error.
    async fn submit_exit(self: &Arc<Self>, symbol: String, price: Option<Decimal>) {
        let Some(position) = self.position_tracker.get(&symbol) else {
            return;
        };
        if position.is_flat() {
            return;
        }

        let request = OrderRequest {
            symbol: symbol.clone(),
            side: Side::Sell,
            order_type: if price.is_some() { OrderType::Limit } else { OrderType::Market },
            quantity: position.quantity,
            price,
            stop: None,
            time_in_force: TimeInForce::ImmediateOrCancel,
            post_only: false,
            reduce_only: true,
        };
        match self.order_engine.submit(request).await {
            Ok(order) => info!(symbol, client_order_id = %order.client_order_id, "exit submitted"),
            Err(e) => warn!(symbol, error = %e, "exit submission failed"),
        }
    }

    /// Periodically force-refreshes the balance ledger and compares tracked
    /// open orders against the exchange's own open-orders view. Drift is
    /// always logged; `config.reconcile_log_only` (the only mode this core
    /// implements) means it is never silently corrected.
    fn spawn_reconciliation_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = this.shutdown.cancelled() => return,
                }

                if let Err(e) = this.balance_ledger.force_refresh().await {
                    warn!(error = %e, "balance reconciliation failed");
                } else {
                    info!("balance ledger reconciled");
                }

                this.reconcile_open_orders().await;
            }
        });
    }

    async fn reconcile_open_orders(self: &Arc<Self>) {
        let exchange_open: HashMap<String, Value> = match self
            .rest_client
            .post_private::<OpenOrdersResult>(endpoints::OPEN_ORDERS, Vec::new())
            .await
        {
            Ok(result) => result.open,
            Err(e) => {
                warn!(error = %e, "open-orders reconciliation fetch failed");
                return;
            }
        };

        let tracked_open = self.order_engine.open_orders();
        if exchange_open.len() != tracked_open.len() {
            warn!(
                tracked = tracked_open.len(),
                exchange = exchange_open.len(),
                "open order count drift between tracked state and exchange"
            );
        }
    }
}

#[derive(serde::Deserialize)]
struct OpenOrdersResult {
    #[serde(default)]
    open: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::NoOpStrategy;

    #[tokio::test]
    async fn build_assembles_every_component_with_state_dir() {
        let state_dir = std::env::temp_dir().join(format!("orchestrator_test_{}", std::process::id()));
        let mut config = Config::default();
        config.state_dir = state_dir.clone();
        config.api_key = "key".to_string();
        config.api_secret = base64_zero_secret();

        let orchestrator = Orchestrator::build(Arc::new(config), Arc::new(NoOpStrategy)).await;
        assert!(orchestrator.is_ok());

        let _ = std::fs::remove_dir_all(&state_dir);
    }

    #[test]
    fn cooldown_key_distinguishes_symbol_and_side() {
        let a = format!("{}:{}", "BTC/USD", Side::Buy);
        let b = format!("{}:{}", "BTC/USD", Side::Sell);
        assert_ne!(a, b);
    }

    fn base64_zero_secret() -> String {
        use base64::engine::general_purpose::STANDARD as base64_std;
        use base64::Engine;
        base64_std.encode([0u8; 32])
    }
}
