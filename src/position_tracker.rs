// =============================================================================
// Position Tracker — spot-only inventory keyed by symbol
// =============================================================================
//
// Spot trading never goes short, so unlike the margin-style long/short
// position this replaces, quantity here is always >= 0 and there is at
// most one open position per symbol. Fills update a weighted-average cost
// basis on buys and realize P&L against that basis on sells; a sell that
// fully closes the position resets its average price so the next buy
// starts a fresh cost basis rather than averaging against a stale one.
//
// Every mutation is followed by an atomic disk write (tmp + rename) so a
// crash never loses more than the in-flight fill, and startup reconciles
// the persisted snapshot against a REST balance fetch before trading
// resumes.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub opened_at: String,
    pub last_update: String,
}

impl Position {
    fn flat(symbol: &str, now: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            opened_at: now.to_string(),
            last_update: now.to_string(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

pub struct PositionTracker {
    positions: RwLock<HashMap<String, Position>>,
    path: PathBuf,
}

impl PositionTracker {
    pub async fn load(path: impl AsRef<Path>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();
        let positions = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        Arc::new(Self {
            positions: RwLock::new(positions),
            path,
        })
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn get_all(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Apply a fill. Buys extend the weighted-average cost basis; sells
    /// realize P&L against it and reduce quantity. `fee`, when present, is
    /// subtracted from realized P&L on both sides (a buy's fee is a cost
    /// even though no P&L realizes on entry). Selling more than the tracked
    /// quantity is clamped to the position's size with a warning — the
    /// exchange is the source of truth and a caller-side fill could be
    /// duplicated or racing a reconciliation pass.
    pub async fn apply_fill(&self, symbol: &str, side: Side, fill_qty: Decimal, fill_price: Decimal, fee: Decimal) {
        let now = Utc::now().to_rfc3339();

        {
            let mut guard = self.positions.write();
            let pos = guard
                .entry(symbol.to_string())
                .or_insert_with(|| Position::flat(symbol, &now));

            match side {
                Side::Buy => {
                    let new_quantity = pos.quantity + fill_qty;
                    if new_quantity.is_zero() {
                        pos.avg_entry_price = Decimal::ZERO;
                    } else {
                        pos.avg_entry_price = (pos.quantity * pos.avg_entry_price + fill_qty * fill_price) / new_quantity;
                    }
                    pos.quantity = new_quantity;
                }
                Side::Sell => {
                    let mut qty = fill_qty;
                    if qty > pos.quantity {
                        warn!(symbol, requested = %qty, held = %pos.quantity, "sell fill exceeds tracked quantity, clamping");
                        qty = pos.quantity;
                    }
                    pos.realized_pnl += (fill_price - pos.avg_entry_price) * qty;
                    pos.quantity -= qty;
                    if pos.quantity.is_zero() {
                        pos.avg_entry_price = Decimal::ZERO;
                    }
                }
            }
            pos.realized_pnl -= fee;
            pos.last_update = now.clone();

            info!(
                symbol,
                side = %side,
                fill_qty = %fill_qty,
                fill_price = %fill_price,
                fee = %fee,
                quantity = %pos.quantity,
                avg_entry_price = %pos.avg_entry_price,
                realized_pnl = %pos.realized_pnl,
                "position updated from fill"
            );
        }

        self.persist().await;
    }

    /// Replace the tracked quantity for `symbol` from an authoritative
    /// source (startup reconciliation against a REST balance snapshot).
    /// Cost basis is not recomputed — only quantity is corrected, since the
    /// snapshot has no fill-price history to rebuild an average from.
    pub async fn reconcile_quantity(&self, symbol: &str, actual_quantity: Decimal) {
        let now = Utc::now().to_rfc3339();
        let mut changed = false;

        {
            let mut guard = self.positions.write();
            let pos = guard
                .entry(symbol.to_string())
                .or_insert_with(|| Position::flat(symbol, &now));

            if pos.quantity != actual_quantity {
                warn!(symbol, tracked = %pos.quantity, actual = %actual_quantity, "position reconciliation drift, correcting quantity");
                pos.quantity = actual_quantity;
                if actual_quantity.is_zero() {
                    pos.avg_entry_price = Decimal::ZERO;
                }
                pos.last_update = now;
                changed = true;
            }
        }

        if changed {
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let snapshot = self.positions.read().clone();
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || write_atomic(&path, &snapshot)).await;
        if matches!(result, Ok(Err(_)) | Err(_)) {
            warn!("position snapshot persistence failed, continuing in-memory");
        }
    }
}

fn write_atomic(path: &Path, snapshot: &HashMap<String, Position>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct TempPath(PathBuf);
    impl TempPath {
        fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!("position_tracker_test_{label}_{}.json", std::process::id()));
            let _ = std::fs::remove_file(&path);
            Self(path)
        }
    }
    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
            let _ = std::fs::remove_file(self.0.with_extension("json.tmp"));
        }
    }

    #[tokio::test]
    async fn buy_fills_compute_weighted_average_price() {
        let tmp = TempPath::new("buy_avg");
        let tracker = PositionTracker::load(&tmp.0).await;

        tracker.apply_fill("BTC/USD", Side::Buy, dec!(1), dec!(100), Decimal::ZERO).await;
        tracker.apply_fill("BTC/USD", Side::Buy, dec!(1), dec!(200), Decimal::ZERO).await;

        let pos = tracker.get("BTC/USD").unwrap();
        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.avg_entry_price, dec!(150));
    }

    #[tokio::test]
    async fn sell_fill_realizes_pnl_against_avg_price() {
        let tmp = TempPath::new("sell_pnl");
        let tracker = PositionTracker::load(&tmp.0).await;

        tracker.apply_fill("ETH/USD", Side::Buy, dec!(2), dec!(100), Decimal::ZERO).await;
        tracker.apply_fill("ETH/USD", Side::Sell, dec!(1), dec!(150), Decimal::ZERO).await;

        let pos = tracker.get("ETH/USD").unwrap();
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.realized_pnl, dec!(50));
        assert_eq!(pos.avg_entry_price, dec!(100));
    }

    #[tokio::test]
    async fn full_close_resets_avg_price() {
        let tmp = TempPath::new("full_close");
        let tracker = PositionTracker::load(&tmp.0).await;

        tracker.apply_fill("SOL/USD", Side::Buy, dec!(5), dec!(20), Decimal::ZERO).await;
        tracker.apply_fill("SOL/USD", Side::Sell, dec!(5), dec!(25), Decimal::ZERO).await;

        let pos = tracker.get("SOL/USD").unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.avg_entry_price, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec!(25));
    }

    #[tokio::test]
    async fn oversized_sell_is_clamped_not_negative() {
        let tmp = TempPath::new("oversell");
        let tracker = PositionTracker::load(&tmp.0).await;

        tracker.apply_fill("XRP/USD", Side::Buy, dec!(1), dec!(1), Decimal::ZERO).await;
        tracker.apply_fill("XRP/USD", Side::Sell, dec!(5), dec!(2), Decimal::ZERO).await;

        let pos = tracker.get("XRP/USD").unwrap();
        assert_eq!(pos.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn persisted_positions_survive_reload() {
        let tmp = TempPath::new("reload");
        let tracker = PositionTracker::load(&tmp.0).await;
        tracker.apply_fill("BTC/USD", Side::Buy, dec!(1), dec!(50000), Decimal::ZERO).await;

        let reloaded = PositionTracker::load(&tmp.0).await;
        let pos = reloaded.get("BTC/USD").unwrap();
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.avg_entry_price, dec!(50000));
    }

    #[tokio::test]
    async fn fee_is_subtracted_from_realized_pnl() {
        let tmp = TempPath::new("fee");
        let tracker = PositionTracker::load(&tmp.0).await;

        tracker.apply_fill("ETH/USD", Side::Buy, dec!(2), dec!(100), dec!(0.5)).await;
        tracker.apply_fill("ETH/USD", Side::Sell, dec!(2), dec!(150), dec!(0.3)).await;

        let pos = tracker.get("ETH/USD").unwrap();
        // gross pnl = (150 - 100) * 2 = 100, minus fees 0.5 + 0.3 = 0.8
        assert_eq!(pos.realized_pnl, dec!(99.2));
    }

    #[tokio::test]
    async fn reconcile_quantity_corrects_drift() {
        let tmp = TempPath::new("reconcile");
        let tracker = PositionTracker::load(&tmp.0).await;
        tracker.apply_fill("BTC/USD", Side::Buy, dec!(1), dec!(100), Decimal::ZERO).await;

        tracker.reconcile_quantity("BTC/USD", dec!(0.5)).await;
        let pos = tracker.get("BTC/USD").unwrap();
        assert_eq!(pos.quantity, dec!(0.5));
    }
}
