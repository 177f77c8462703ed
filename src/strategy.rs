// =============================================================================
// Strategy interface — the only surface this core exposes to trading logic
// =============================================================================
//
// Strategy internals (indicator math, regime detection, signal scoring) are
// deliberately not part of this crate: the orchestrator only knows how to
// call `Strategy::evaluate` once per cycle with the freshest snapshot of
// tickers, balances and positions, and act on whatever `Signal`s come back.
// A strategy reports its own confidence per signal rather than the
// orchestrator guessing one, since only the strategy knows how strong its
// own read on the market is; the orchestrator only decides whether that
// confidence clears the configured floor and whether sizing/risk allow it
// through. `NoOpStrategy` below exists only to exercise the orchestrator's
// wiring in tests; a real deployment supplies its own `Strategy` impl.
// =============================================================================

use rust_decimal::Decimal;

use crate::balance_ledger::BalanceEntry;
use crate::position_tracker::Position;
use crate::types::{Side, Ticker};

#[derive(Debug, Clone)]
pub enum Signal {
    /// Open or add to a position. `confidence` is on either a 0-1 or 0-100
    /// scale (the orchestrator normalizes); `suggested_price` is a limit
    /// reference the order sizing can use, or `None` to size off the live
    /// ticker instead.
    Enter {
        symbol: String,
        side: Side,
        confidence: Decimal,
        suggested_price: Option<Decimal>,
    },
    /// Close an existing position. Quantity is not specified here — the
    /// orchestrator exits the full tracked position, since a partial exit
    /// isn't a distinct signal this core supports.
    Exit {
        symbol: String,
        confidence: Decimal,
        suggested_price: Option<Decimal>,
    },
}

impl Signal {
    pub fn symbol(&self) -> &str {
        match self {
            Signal::Enter { symbol, .. } => symbol,
            Signal::Exit { symbol, .. } => symbol,
        }
    }

    pub fn confidence(&self) -> Decimal {
        match self {
            Signal::Enter { confidence, .. } => *confidence,
            Signal::Exit { confidence, .. } => *confidence,
        }
    }
}

/// Implemented externally to this crate's core; the orchestrator depends
/// only on this trait, never on a specific strategy's internals. An empty
/// return means "nothing to do this cycle" for every symbol evaluated.
pub trait Strategy: Send + Sync {
    fn evaluate(&self, snapshots: &[Ticker], balances: &[BalanceEntry], positions: &[Position]) -> Vec<Signal>;
}

/// Reference implementation used by integration tests to exercise the
/// orchestrator's order-submission path without pulling in real strategy
/// logic. Never signals.
pub struct NoOpStrategy;

impl Strategy for NoOpStrategy {
    fn evaluate(&self, _snapshots: &[Ticker], _balances: &[BalanceEntry], _positions: &[Position]) -> Vec<Signal> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_strategy_never_signals() {
        let strategy = NoOpStrategy;
        assert!(strategy.evaluate(&[], &[], &[]).is_empty());
    }

    #[test]
    fn signal_accessors_match_each_variant() {
        use rust_decimal_macros::dec;
        let enter = Signal::Enter {
            symbol: "BTC/USD".to_string(),
            side: Side::Buy,
            confidence: dec!(0.8),
            suggested_price: None,
        };
        assert_eq!(enter.symbol(), "BTC/USD");
        assert_eq!(enter.confidence(), dec!(0.8));

        let exit = Signal::Exit {
            symbol: "ETH/USD".to_string(),
            confidence: dec!(90),
            suggested_price: Some(dec!(2000)),
        };
        assert_eq!(exit.symbol(), "ETH/USD");
        assert_eq!(exit.confidence(), dec!(90));
    }
}
