// =============================================================================
// Shared types used across the trading core
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A trading pair's exchange-defined constraints, as reported by Kraken's
/// `AssetPairs` endpoint. Immutable once fetched at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
    pub price_tick: Decimal,
    pub lot_step: Decimal,
    pub min_quantity: Decimal,
    pub min_notional: Decimal,
}

impl Symbol {
    /// Kraken's `BASE/QUOTE` wire representation, e.g. `BTC/USD`.
    pub fn pair(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    /// Round `quantity` up to the nearest multiple of `lot_step`.
    pub fn round_up_to_lot(&self, quantity: Decimal) -> Decimal {
        if self.lot_step.is_zero() {
            return quantity;
        }
        let steps = (quantity / self.lot_step).ceil();
        steps * self.lot_step
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTilCancelled,
    ImmediateOrCancel,
    GoodTilDate,
}

/// Order lifecycle status. Transitions are monotone per the status graph:
/// `Pending -> Open -> (PartiallyFilled)* -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Whether transitioning from `self` to `next` is allowed by the status
    /// graph. Checked defensively wherever an execution or ack updates status.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Open) | (Pending, Rejected) | (Pending, Cancelled) => true,
            (Open, PartiallyFilled) | (Open, Filled) | (Open, Cancelled) | (Open, Expired) => true,
            (PartiallyFilled, PartiallyFilled)
            | (PartiallyFilled, Filled)
            | (PartiallyFilled, Cancelled)
            | (PartiallyFilled, Expired) => true,
            _ => false,
        }
    }
}

/// Whether the engine is actively trading, paused, or killed. Paused is the
/// safe default on every startup; killed additionally rejects resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether the account is running against real funds or Kraken's demo
/// endpoint. Only changes which base URL and credentials are used; paper
/// simulation on top of that is outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Rate-limit tier, determining which counter/decay parameters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Starter,
    Intermediate,
    Pro,
}

/// A normalized top-of-book / last-trade view for a single symbol, merged
/// from whichever source (WS or REST) is currently authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub updated_at_ms: i64,
}
