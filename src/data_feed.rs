// =============================================================================
// Unified Data Feed — merges WebSocket push and REST poll into one view
// =============================================================================
//
// Ticks land here from the WS tick broadcast channel via `ingest_ws_tick`,
// called by a task that drains `SessionManager::subscribe_ticks`. When a
// symbol's cached tick goes stale (no WS update within `staleness_ms`),
// `get_ticker` falls back to a REST `Ticker` call rather than serving data
// the strategy can no longer trust was live a moment ago.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::rest_client::{endpoints, KrakenRestClient};
use crate::types::Ticker;

const DEFAULT_STALENESS_MS: i64 = 5_000;

pub struct DataFeed {
    ticks: RwLock<HashMap<String, Ticker>>,
    rest_client: Arc<KrakenRestClient>,
    staleness_ms: i64,
}

impl DataFeed {
    pub fn new(rest_client: Arc<KrakenRestClient>) -> Arc<Self> {
        Arc::new(Self {
            ticks: RwLock::new(HashMap::new()),
            rest_client,
            staleness_ms: DEFAULT_STALENESS_MS,
        })
    }

    pub fn ingest_ws_tick(&self, ticker: Ticker) {
        self.ticks.write().insert(ticker.symbol.clone(), ticker);
    }

    /// Get the freshest known ticker for `symbol`. Serves the WS-pushed
    /// value if it's within the staleness window, otherwise falls back to a
    /// REST fetch and caches the result as if it were a push.
    pub async fn get_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
        let cached = self.ticks.read().get(symbol).cloned();
        let now = chrono::Utc::now().timestamp_millis();

        if let Some(ticker) = &cached {
            if now - ticker.updated_at_ms <= self.staleness_ms {
                return Ok(ticker.clone());
            }
            debug!(symbol, age_ms = now - ticker.updated_at_ms, "ws ticker stale, falling back to REST");
        } else {
            warn!(symbol, "no ws ticker cached yet, falling back to REST");
        }

        let fetched = self.fetch_rest_ticker(symbol).await?;
        self.ticks.write().insert(symbol.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn fetch_rest_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
        let pair = symbol.replace('/', "");
        let raw: HashMap<String, KrakenTickerEntry> = self
            .rest_client
            .get_public(endpoints::TICKER, &[("pair", pair.as_str())])
            .await
            .map_err(|e| anyhow::anyhow!("REST ticker fallback failed: {e}"))?;

        let entry = raw
            .into_values()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty ticker response for {symbol}"))?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            bid: entry.b.first().and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
            ask: entry.a.first().and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
            last: entry.c.first().and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.ticks.read().keys().cloned().collect()
    }
}

#[derive(serde::Deserialize)]
struct KrakenTickerEntry {
    #[serde(default)]
    a: Vec<String>,
    #[serde(default)]
    b: Vec<String>,
    #[serde(default)]
    c: Vec<String>,
}
