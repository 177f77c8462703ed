// =============================================================================
// Balance Ledger — authoritative view of per-asset balances
// =============================================================================
//
// Balances arrive from two sources: WS `balances` pushes (fast, can be
// missed on disconnect) and REST `Balance` snapshots (slow, authoritative).
// `apply_snapshot` replaces the whole ledger from a REST call; `apply_delta`
// is used for WS pushes that report a single asset's new total. A
// concurrent `force_refresh` call from multiple callers is coalesced into
// one in-flight REST call via `tokio::sync::Mutex<Option<...>>` acting as a
// singleflight gate, so a burst of staleness checks doesn't fan out into a
// burst of REST calls.
//
// SAFETY POLICY, carried over from the exchange-facing reconciliation this
// replaces: drift is logged, never auto-corrected by cancelling or closing
// anything.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::rest_client::{endpoints, KrakenRestClient};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    /// Available for new orders. `free + locked == total` always holds.
    pub free: Decimal,
    /// Held against open orders.
    pub locked: Decimal,
    pub updated_at_ms: i64,
}

impl BalanceEntry {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    fn new(asset: &str, free: Decimal, locked: Decimal, now: i64) -> Self {
        Self {
            asset: asset.to_string(),
            free,
            locked,
            updated_at_ms: now,
        }
    }
}

pub struct BalanceLedger {
    entries: RwLock<HashMap<String, BalanceEntry>>,
    rest_client: Arc<KrakenRestClient>,
    refresh_gate: Mutex<()>,
}

impl BalanceLedger {
    pub fn new(rest_client: Arc<KrakenRestClient>) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            rest_client,
            refresh_gate: Mutex::new(()),
        })
    }

    pub fn get(&self, asset: &str) -> Option<BalanceEntry> {
        self.entries.read().get(asset).cloned()
    }

    pub fn get_all(&self) -> Vec<BalanceEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Replace the entire ledger from a REST `Balance` response, which
    /// reports only a total per asset with no free/locked split. Any
    /// `locked` amount already tracked from WS pushes is preserved and
    /// clamped to the new total; `free` is derived as the remainder.
    pub fn apply_snapshot(&self, raw: HashMap<String, Decimal>) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut guard = self.entries.write();

        for (asset, total) in &raw {
            let total = clamp_non_negative(asset, *total);
            let locked = guard.get(asset).map(|e| e.locked.min(total)).unwrap_or(Decimal::ZERO);
            if let Some(prev) = guard.get(asset) {
                if prev.total() != total {
                    debug!(asset, old = %prev.total(), new = %total, "balance snapshot changed asset total");
                }
            }
            guard.insert(asset.clone(), BalanceEntry::new(asset, total - locked, locked, now));
        }

        let disappeared: Vec<String> = guard
            .keys()
            .filter(|k| !raw.contains_key(*k))
            .cloned()
            .collect();
        for asset in disappeared {
            if let Some(entry) = guard.get(&asset) {
                if !entry.total().is_zero() {
                    warn!(asset, prior_total = %entry.total(), "asset vanished from balance snapshot");
                }
            }
            guard.remove(&asset);
        }
    }

    /// Apply a single-asset update from a WS `balances` push. Kraken reports
    /// `balance` (the account total) and `hold_trade` (held against open
    /// orders); free/locked are derived as `free = balance - hold_trade`,
    /// `locked = hold_trade`.
    pub fn apply_delta(&self, asset: &str, balance: Decimal, hold_trade: Decimal) {
        let balance = clamp_non_negative(asset, balance);
        let locked = clamp_non_negative(asset, hold_trade).min(balance);
        let now = chrono::Utc::now().timestamp_millis();
        self.entries
            .write()
            .insert(asset.to_string(), BalanceEntry::new(asset, balance - locked, locked, now));
    }

    /// Force a REST refresh, coalescing concurrent callers into a single
    /// in-flight request.
    pub async fn force_refresh(&self) -> Result<(), CoreError> {
        let _guard = self.refresh_gate.lock().await;

        let result: HashMap<String, String> = self
            .rest_client
            .post_private(endpoints::BALANCE, Vec::new())
            .await?;

        let parsed: HashMap<String, Decimal> = result
            .into_iter()
            .filter_map(|(asset, raw)| raw.parse::<Decimal>().ok().map(|d| (asset, d)))
            .collect();

        self.apply_snapshot(parsed);
        Ok(())
    }
}

fn clamp_non_negative(asset: &str, value: Decimal) -> Decimal {
    if value.is_sign_negative() {
        warn!(asset, value = %value, "exchange reported negative balance, clamping to zero");
        Decimal::ZERO
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Tests below never call `force_refresh`, so the ledger only needs its
    /// in-memory map exercised; the REST client is built with throwaway
    /// credentials and never dialed out to.
    async fn test_ledger() -> BalanceLedger {
        use base64::engine::general_purpose::STANDARD as base64_std;
        use base64::Engine;

        let tmp = std::env::temp_dir().join(format!("balance_ledger_test_{}.json", std::process::id()));
        let nonce = crate::nonce::NonceAuthority::load(&tmp).await;
        let signer = crate::signer::Signer::new("key", &base64_std.encode([0u8; 32])).unwrap();
        let rate_limiter = crate::rate_limiter::RateLimiter::new(crate::types::Tier::Intermediate);
        let rest_client = Arc::new(KrakenRestClient::new("https://api.kraken.com", Arc::new(signer), nonce, rate_limiter));

        BalanceLedger {
            entries: RwLock::new(HashMap::new()),
            rest_client,
            refresh_gate: Mutex::new(()),
        }
    }

    #[tokio::test]
    async fn apply_snapshot_clamps_negative_balances() {
        let ledger = test_ledger().await;
        let mut raw = HashMap::new();
        raw.insert("USD".to_string(), dec!(-5));
        ledger.apply_snapshot(raw);
        assert_eq!(ledger.get("USD").unwrap().total(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn apply_delta_updates_single_asset() {
        let ledger = test_ledger().await;
        ledger.apply_delta("BTC", dec!(1.5), Decimal::ZERO);
        assert_eq!(ledger.get("BTC").unwrap().total(), dec!(1.5));
        ledger.apply_delta("BTC", dec!(2.0), Decimal::ZERO);
        assert_eq!(ledger.get("BTC").unwrap().total(), dec!(2.0));
    }

    #[tokio::test]
    async fn apply_delta_splits_free_and_locked_from_hold_trade() {
        let ledger = test_ledger().await;
        ledger.apply_delta("BTC", dec!(10), dec!(4));
        let entry = ledger.get("BTC").unwrap();
        assert_eq!(entry.free, dec!(6));
        assert_eq!(entry.locked, dec!(4));
        assert_eq!(entry.total(), dec!(10));
    }

    #[tokio::test]
    async fn get_all_returns_every_tracked_asset() {
        let ledger = test_ledger().await;
        ledger.apply_delta("BTC", dec!(1), Decimal::ZERO);
        ledger.apply_delta("ETH", dec!(2), Decimal::ZERO);
        let mut assets: Vec<String> = ledger.get_all().into_iter().map(|e| e.asset).collect();
        assets.sort();
        assert_eq!(assets, vec!["BTC".to_string(), "ETH".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_removes_assets_absent_from_new_snapshot() {
        let ledger = test_ledger().await;
        ledger.apply_delta("BTC", dec!(1), Decimal::ZERO);
        let mut raw = HashMap::new();
        raw.insert("ETH".to_string(), dec!(2));
        ledger.apply_snapshot(raw);
        assert!(ledger.get("BTC").is_none());
        assert!(ledger.get("ETH").is_some());
    }

    #[tokio::test]
    async fn snapshot_preserves_locked_amount_tracked_from_ws() {
        let ledger = test_ledger().await;
        ledger.apply_delta("BTC", dec!(10), dec!(3));
        let mut raw = HashMap::new();
        raw.insert("BTC".to_string(), dec!(12));
        ledger.apply_snapshot(raw);
        let entry = ledger.get("BTC").unwrap();
        assert_eq!(entry.locked, dec!(3));
        assert_eq!(entry.free, dec!(9));
    }
}
