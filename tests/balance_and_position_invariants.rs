// Property 3 (free + locked == total, all non-negative) and property 5
// (positive quantity implies positive avg price, realized P&L sums per-fill
// contributions), exercised together the way a fill actually updates both
// components, plus scenario S1.

mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use kraken_scalp_core::types::Side;

#[tokio::test]
async fn balance_total_invariant_holds_across_deltas_and_snapshots() {
    let h = common::build("balance_invariant").await;

    h.balance_ledger.apply_delta("USDT", dec!(100), dec!(10));
    let entry = h.balance_ledger.get("USDT").unwrap();
    assert_eq!(entry.total(), entry.free + entry.locked);
    assert!(entry.free >= Decimal::ZERO && entry.locked >= Decimal::ZERO);

    let mut snapshot = std::collections::HashMap::new();
    snapshot.insert("USDT".to_string(), dec!(80));
    h.balance_ledger.apply_snapshot(snapshot);
    let entry = h.balance_ledger.get("USDT").unwrap();
    assert_eq!(entry.total(), entry.free + entry.locked);
    assert!(entry.free >= Decimal::ZERO && entry.locked >= Decimal::ZERO);
}

// S1 — Buy with sufficient balance. The actual network fill is simulated by
// driving position_tracker.apply_fill and balance_ledger.apply_delta
// directly, the same calls on_execution and a balances push would make.
#[tokio::test]
async fn s1_buy_with_sufficient_balance_updates_position_and_balance() {
    let h = common::build("s1_buy").await;
    h.balance_ledger.apply_delta("USDT", dec!(100), Decimal::ZERO);

    let quantity = dec!(0.0004);
    let fill_price = dec!(25000);
    let fee = dec!(0.01);
    let notional = quantity * fill_price;

    h.position_tracker.apply_fill("BTC/USDT", Side::Buy, quantity, fill_price, fee).await;
    // A balances push after the fill reports the debited total directly;
    // the ledger doesn't derive this from the fill itself.
    let remaining = dec!(100) - notional - fee;
    h.balance_ledger.apply_delta("USDT", remaining, Decimal::ZERO);

    let position = h.position_tracker.get("BTC/USDT").unwrap();
    assert_eq!(position.quantity, quantity);
    assert_eq!(position.avg_entry_price, fill_price);
    assert!(position.avg_entry_price > Decimal::ZERO);

    let balance = h.balance_ledger.get("USDT").unwrap();
    assert!(balance.free < dec!(90.1) && balance.free > dec!(89.9));
    assert_eq!(balance.total(), balance.free + balance.locked);
}

#[tokio::test]
async fn realized_pnl_sums_per_fill_contributions_on_closure() {
    let h = common::build("realized_pnl_sum").await;

    h.position_tracker.apply_fill("ETH/USD", Side::Buy, dec!(1), dec!(100), Decimal::ZERO).await;
    h.position_tracker.apply_fill("ETH/USD", Side::Buy, dec!(1), dec!(120), Decimal::ZERO).await;
    // avg entry is now 110; two separate sells realize pnl against it.
    h.position_tracker.apply_fill("ETH/USD", Side::Sell, dec!(1), dec!(130), Decimal::ZERO).await;
    h.position_tracker.apply_fill("ETH/USD", Side::Sell, dec!(1), dec!(150), Decimal::ZERO).await;

    let position = h.position_tracker.get("ETH/USD").unwrap();
    assert!(position.is_flat());
    // (130-110)*1 + (150-110)*1 = 20 + 40 = 60
    assert_eq!(position.realized_pnl, dec!(60));
}
