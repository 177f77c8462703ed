// =============================================================================
// Minimum-Size Learner — tracks the smallest order size Kraken will accept
// =============================================================================
//
// Kraken's documented minimums drift and occasionally a symbol rejects an
// order above the documented floor for reasons (price-dependent notional,
// temporary listing state) that aren't worth modeling precisely. Instead,
// every `EOrder:...minimum...` rejection nudges this symbol's learned floor
// upward; repeated rejections past a cap blacklist the symbol until an
// operator clears it, so the order engine stops burning rate-limit budget
// retrying a size that will never clear.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Multiplicative safety margin applied to the learned floor after each
/// rejection.
const LEARN_STEP: Decimal = dec!(1.02);
/// Consecutive rejections before a symbol is eligible for blacklisting.
const BLACKLIST_THRESHOLD: u32 = 10;
/// A symbol is only blacklisted once failures pass the threshold above *and*
/// the observed minimum notional is this many times the notional a caller
/// actually intended to trade — past that point the symbol's minimum isn't
/// something this position sizing will ever clear.
const BLACKLIST_NOTIONAL_MULTIPLE: Decimal = dec!(3);
/// Recent attempted quantities kept per symbol, most recent last.
const MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinSizeRecord {
    pub symbol: String,
    pub learned_minimum: Decimal,
    pub observed_min_notional: Decimal,
    pub rejection_count: u32,
    pub blacklisted: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub samples: Vec<Decimal>,
}

pub struct MinSizeLearner {
    records: RwLock<HashMap<String, MinSizeRecord>>,
    path: PathBuf,
}

impl MinSizeLearner {
    pub async fn load(path: impl AsRef<Path>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Arc::new(Self {
            records: RwLock::new(records),
            path,
        })
    }

    /// Suggest a quantity for `symbol` that satisfies both the
    /// exchange-documented `min_quantity`/`min_notional` and whatever this
    /// symbol has learned from past rejections, rounded up to `lot_step`.
    /// `price` converts the notional floor and `intended_notional` into a
    /// quantity; a zero price (no live quote yet) falls back to the
    /// quantity floors alone.
    pub fn suggest_quantity(
        &self,
        symbol: &str,
        intended_notional: Decimal,
        price: Decimal,
        min_quantity: Decimal,
        min_notional: Decimal,
        lot_step: Decimal,
    ) -> Decimal {
        let learned = self.records.read().get(symbol).map(|r| r.learned_minimum).unwrap_or(Decimal::ZERO);
        let floor_qty = min_quantity.max(learned);

        let mut qty = if price.is_zero() { floor_qty } else { intended_notional / price };
        qty = qty.max(floor_qty);
        if !price.is_zero() {
            qty = qty.max(min_notional / price);
        }
        round_up_to_step(qty, lot_step)
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.records
            .read()
            .get(symbol)
            .map(|r| r.blacklisted)
            .unwrap_or(false)
    }

    /// Record a minimum-size rejection for `symbol`, raising its learned
    /// floor and observed minimum notional. Blacklisting requires both the
    /// rejection count to pass its threshold *and* the observed minimum
    /// notional to exceed `BLACKLIST_NOTIONAL_MULTIPLE` times what the
    /// caller actually intended to trade — past that, no amount of retrying
    /// at this position size will ever clear the exchange's floor.
    pub async fn record_rejection(
        &self,
        symbol: &str,
        attempted_quantity: Decimal,
        price: Decimal,
        intended_notional: Decimal,
        error: impl Into<String>,
    ) {
        let error = error.into();
        {
            let mut guard = self.records.write();
            let record = guard.entry(symbol.to_string()).or_insert_with(|| MinSizeRecord {
                symbol: symbol.to_string(),
                learned_minimum: attempted_quantity,
                observed_min_notional: Decimal::ZERO,
                rejection_count: 0,
                blacklisted: false,
                last_error: None,
                samples: Vec::new(),
            });

            let attempted_notional = attempted_quantity * price;
            record.learned_minimum = record.learned_minimum.max(attempted_quantity) * LEARN_STEP;
            record.observed_min_notional = record.observed_min_notional.max(attempted_notional) * LEARN_STEP;
            record.rejection_count += 1;
            record.last_error = Some(error);
            record.samples.push(attempted_quantity);
            if record.samples.len() > MAX_SAMPLES {
                record.samples.remove(0);
            }

            if record.rejection_count >= BLACKLIST_THRESHOLD
                && intended_notional > Decimal::ZERO
                && record.observed_min_notional > intended_notional * BLACKLIST_NOTIONAL_MULTIPLE
            {
                record.blacklisted = true;
                warn!(symbol, rejections = record.rejection_count, observed_min_notional = %record.observed_min_notional, "symbol blacklisted, observed minimum far exceeds intended notional");
            }
        }
        self.persist().await;
    }

    /// Successful fills reset the rejection streak so transient mispricing
    /// doesn't permanently inflate the learned floor.
    pub async fn record_success(&self, symbol: &str) {
        let mut changed = false;
        {
            let mut guard = self.records.write();
            if let Some(record) = guard.get_mut(symbol) {
                if record.rejection_count > 0 {
                    record.rejection_count = 0;
                    changed = true;
                }
            }
        }
        if changed {
            self.persist().await;
        }
    }

    pub fn clear_blacklist(&self, symbol: &str) {
        if let Some(record) = self.records.write().get_mut(symbol) {
            record.blacklisted = false;
            record.rejection_count = 0;
        }
    }

    async fn persist(&self) {
        let snapshot = self.records.read().clone();
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || write_atomic(&path, &snapshot)).await;
        if matches!(result, Ok(Err(_)) | Err(_)) {
            warn!("min-size learner persistence failed, continuing in-memory");
        }
    }
}

fn round_up_to_step(quantity: Decimal, lot_step: Decimal) -> Decimal {
    if lot_step.is_zero() {
        return quantity;
    }
    (quantity / lot_step).ceil() * lot_step
}

fn write_atomic(path: &Path, snapshot: &HashMap<String, MinSizeRecord>) -> anyhow::Result<()> {
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

    struct TempPath(PathBuf);
    impl TempPath {
        fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!("min_size_test_{label}_{}.json", std::process::id()));
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
    async fn suggests_documented_minimum_when_unlearned() {
        let tmp = TempPath::new("unlearned");
        let learner = MinSizeLearner::load(&tmp.0).await;
        let qty = learner.suggest_quantity("BTC/USD", dec!(10), dec!(50000), dec!(0.0001), dec!(1), dec!(0.0001));
        assert_eq!(qty, dec!(0.0002));
    }

    #[tokio::test]
    async fn suggest_quantity_satisfies_min_notional_over_min_quantity() {
        let tmp = TempPath::new("notional_floor");
        let learner = MinSizeLearner::load(&tmp.0).await;
        // intended notional (5) and price (100) alone want 0.05, but
        // min_notional (20) at this price requires at least 0.2.
        let qty = learner.suggest_quantity("ETH/USD", dec!(5), dec!(100), dec!(0.001), dec!(20), dec!(0.01));
        assert_eq!(qty, dec!(0.2));
    }

    #[tokio::test]
    async fn rejection_raises_learned_floor_above_documented() {
        let tmp = TempPath::new("raise");
        let learner = MinSizeLearner::load(&tmp.0).await;
        learner.record_rejection("BTC/USD", dec!(0.0005), dec!(50000), dec!(25), "EOrder:Order minimum not met").await;
        let suggested = learner.suggest_quantity("BTC/USD", dec!(25), dec!(50000), dec!(0.0001), dec!(1), dec!(0.0001));
        assert!(suggested > dec!(0.0005));
    }

    #[tokio::test]
    async fn blacklists_after_threshold_rejections_with_notional_far_above_intended() {
        let tmp = TempPath::new("blacklist");
        let learner = MinSizeLearner::load(&tmp.0).await;
        // attempted_notional = 1 * 100 = 100, intended = 1 (100x over) so the
        // 3x multiple factor is satisfied alongside the count threshold.
        for _ in 0..BLACKLIST_THRESHOLD {
            learner.record_rejection("XRP/USD", dec!(1), dec!(100), dec!(1), "EOrder:Order minimum not met").await;
        }
        assert!(learner.is_blacklisted("XRP/USD"));
    }

    #[tokio::test]
    async fn threshold_rejections_alone_do_not_blacklist_when_notional_is_close() {
        let tmp = TempPath::new("no_blacklist");
        let learner = MinSizeLearner::load(&tmp.0).await;
        // attempted_notional = 1 * 1 = 1, intended = 1: never exceeds the 3x
        // multiple, so the symbol should not be blacklisted.
        for _ in 0..(BLACKLIST_THRESHOLD + 2) {
            learner.record_rejection("XRP/USD", dec!(1), dec!(1), dec!(1), "EOrder:Order minimum not met").await;
        }
        assert!(!learner.is_blacklisted("XRP/USD"));
    }

    #[tokio::test]
    async fn success_resets_rejection_streak() {
        let tmp = TempPath::new("reset");
        let learner = MinSizeLearner::load(&tmp.0).await;
        learner.record_rejection("ETH/USD", dec!(0.01), dec!(2000), dec!(20), "EOrder:Order minimum not met").await;
        learner.record_success("ETH/USD").await;
        {
            let guard = learner.records.read();
            assert_eq!(guard.get("ETH/USD").unwrap().rejection_count, 0);
        }
    }

    #[tokio::test]
    async fn clear_blacklist_reopens_symbol() {
        let tmp = TempPath::new("clear");
        let learner = MinSizeLearner::load(&tmp.0).await;
        for _ in 0..BLACKLIST_THRESHOLD {
            learner.record_rejection("DOGE/USD", dec!(10), dec!(1), dec!(1), "EOrder:Order minimum not met").await;
        }
        assert!(learner.is_blacklisted("DOGE/USD"));
        learner.clear_blacklist("DOGE/USD");
        assert!(!learner.is_blacklisted("DOGE/USD"));
    }
}
