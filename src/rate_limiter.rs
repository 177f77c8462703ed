// =============================================================================
// Rate Limiter — decay-on-read counter matching Kraken's private-endpoint model
// =============================================================================
//
// Kraken's limiter isn't a fixed window like Binance's weight header; each
// account tier has a maximum counter value and a decay rate per second, and
// every private call adds a documented cost to the counter. A call is
// admitted only while the counter, decayed up to "now", sits below the
// tier's ceiling minus the call's cost.
//
// `acquire` is async and queues FIFO via `tokio::sync::Notify` rather than
// spinning: callers that would overflow the ceiling wait for the next decay
// tick instead of busy-polling, and a cancelled `acquire` future (caller
// drops the `.await`) never leaves the queue stuck waiting on it.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::types::Tier;

/// Per-tier counter ceiling and decay rate (points removed per second).
fn tier_params(tier: Tier) -> (f64, f64) {
    match tier {
        Tier::Starter => (15.0, 0.33),
        Tier::Intermediate => (20.0, 0.5),
        Tier::Pro => (20.0, 3.75),
    }
}

/// Documented point cost for a private endpoint. Costs we could not find
/// confirmed are given the conservative default via `unknown_endpoint_cost`.
pub fn endpoint_cost(endpoint: &str) -> u32 {
    match endpoint {
        "AddOrder" | "CancelOrder" | "EditOrder" => 0,
        "CancelAll" | "CancelAllOrdersAfter" => 1,
        "Balance" | "BalanceEx" | "TradeBalance" => 2,
        "OpenOrders" | "ClosedOrders" | "QueryOrders" => 1,
        "TradesHistory" | "QueryTrades" | "OpenPositions" | "Ledgers" | "QueryLedgers" => 2,
        "GetWebSocketsToken" => 1,
        _ => unknown_endpoint_cost(),
    }
}

fn unknown_endpoint_cost() -> u32 {
    2
}

struct Inner {
    counter: f64,
    last_decay: Instant,
    ceiling: f64,
    decay_per_sec: f64,
    waiters: VecDeque<u64>,
    next_waiter_id: u64,
    /// Set by `release(.., RateLimited)` when the exchange itself reported a
    /// rate-limit violation; admission is refused until this elapses even if
    /// the decayed counter would otherwise allow it.
    penalty_until: Option<Instant>,
}

impl Inner {
    fn decay(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_decay).as_secs_f64();
        if elapsed > 0.0 {
            self.counter = (self.counter - elapsed * self.decay_per_sec).max(0.0);
            self.last_decay = now;
        }
    }

    fn under_penalty(&self) -> bool {
        self.penalty_until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}

/// Additional backoff imposed on top of decay-based admission when the
/// exchange itself reports a rate-limit violation, independent of our own
/// counter accounting (it may have been wrong, or another process on the
/// same key may have contributed to the violation).
const RATE_LIMIT_PENALTY: Duration = Duration::from_secs(45);

/// What happened to the call a [`Permit`] was issued for. Passed to
/// [`RateLimiter::release`] so the limiter can react to server-reported
/// outcomes the local counter has no way to see on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    RateLimited,
}

/// A held admission slot. The cost was already added to the counter at
/// acquire time and decays naturally; `release` is how a caller reports back
/// what happened so the limiter can react to server-reported outcomes.
pub struct Permit {
    pub cost: u32,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(tier: Tier) -> Arc<Self> {
        let (ceiling, decay_per_sec) = tier_params(tier);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                counter: 0.0,
                last_decay: Instant::now(),
                ceiling,
                decay_per_sec,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                penalty_until: None,
            }),
            notify: Notify::new(),
        })
    }

    /// Admit a call costing `endpoint`'s documented points. Waits in FIFO
    /// order if admitting now would exceed the tier ceiling.
    pub async fn acquire(&self, endpoint: &str) -> Permit {
        let cost = endpoint_cost(endpoint) as f64;
        let my_id;
        {
            let mut guard = self.inner.lock();
            my_id = guard.next_waiter_id;
            guard.next_waiter_id += 1;
            guard.waiters.push_back(my_id);
        }

        loop {
            {
                let mut guard = self.inner.lock();
                guard.decay();
                let is_front = guard.waiters.front() == Some(&my_id);
                if is_front && !guard.under_penalty() && guard.counter + cost <= guard.ceiling {
                    guard.counter += cost;
                    guard.waiters.pop_front();
                    debug!(endpoint, cost, counter = guard.counter, ceiling = guard.ceiling, "rate limiter admitted call");
                    drop(guard);
                    self.notify.notify_waiters();
                    return Permit { cost: cost as u32 };
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    /// Current decayed counter value, for diagnostics/tests.
    pub fn current_load(&self) -> f64 {
        let mut guard = self.inner.lock();
        guard.decay();
        guard.counter
    }

    /// Report what happened to the call `permit` was issued for. A
    /// server-reported rate-limit violation imposes an additional 45s
    /// backoff on top of whatever the decayed counter would otherwise allow,
    /// since the violation may mean our own accounting under-counted.
    pub fn release(&self, permit: Permit, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::RateLimited {
            let mut guard = self.inner.lock();
            let until = Instant::now() + RATE_LIMIT_PENALTY;
            guard.penalty_until = Some(match guard.penalty_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
            warn_rate_limited(permit.cost);
        }
        drop(permit);
    }

    /// Whether the limiter is currently under a server-reported rate-limit
    /// penalty, independent of decayed counter admission.
    pub fn is_penalized(&self) -> bool {
        self.inner.lock().under_penalty()
    }
}

fn warn_rate_limited(cost: u32) {
    tracing::warn!(cost, "rate limiter applying 45s penalty after server-reported rate limit");
}
