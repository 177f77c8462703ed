// =============================================================================
// Circuit Breaker — per-resource Closed/Open/HalfOpen state machine
// =============================================================================
//
// Each resource (a REST endpoint family, a WS connection, "orders" as a
// whole) gets its own independent breaker keyed in a `DashMap` so failures
// on one never block traffic to another. Transitions:
//
//   Closed   -- consecutive_failures >= threshold -->  Open
//   Open     -- open_duration elapsed             -->  HalfOpen
//   HalfOpen -- trial succeeds                     -->  Closed
//   HalfOpen -- trial fails                        -->  Open (duration resets)
//
// `Config::emergency_bypass` is checked independently of per-resource state:
// when set, `can_execute` short-circuits to true for every resource, letting
// an operator force calls through (e.g. to flatten positions manually) even
// while a breaker would otherwise be open.
//
// Resources don't all share one recovery cooldown: `rate_limit` opens for
// longer than the general default, since a server-reported rate-limit
// violation needs more time to drain than a handful of failed requests.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct ResourceBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_trials_used: u32,
}

impl ResourceBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_trials_used: 0,
        }
    }
}

pub struct CircuitBreaker {
    resources: DashMap<String, ResourceBreaker>,
    config: Arc<Config>,
}

impl CircuitBreaker {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            resources: DashMap::new(),
            config,
        })
    }

    /// Whether a call against `resource` may proceed right now. A `HalfOpen`
    /// breaker admits only up to `breaker_half_open_trial_count` probes
    /// before refusing further calls until one of them resolves.
    pub fn can_execute(&self, resource: &str) -> bool {
        if self.config.is_emergency_bypassed() {
            return true;
        }

        let mut entry = self.resources.entry(resource.to_string()).or_insert_with(ResourceBreaker::new);

        match entry.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= Duration::from_secs(self.config.open_duration_secs_for(resource)) {
                    info!(resource, "breaker transitioning Open -> HalfOpen");
                    entry.state = BreakerState::HalfOpen;
                    entry.half_open_trials_used = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if entry.half_open_trials_used < self.config.breaker_half_open_trial_count {
                    entry.half_open_trials_used += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self, resource: &str) {
        let mut entry = self.resources.entry(resource.to_string()).or_insert_with(ResourceBreaker::new);
        if entry.state != BreakerState::Closed {
            info!(resource, from = ?entry.state, "breaker closing after successful call");
        }
        entry.state = BreakerState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
        entry.half_open_trials_used = 0;
    }

    pub fn on_failure(&self, resource: &str) {
        let mut entry = self.resources.entry(resource.to_string()).or_insert_with(ResourceBreaker::new);

        match entry.state {
            BreakerState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.breaker_failure_threshold {
                    warn!(resource, failures = entry.consecutive_failures, "breaker opening");
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!(resource, "half-open trial failed, breaker re-opening");
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Instant::now());
                entry.half_open_trials_used = 0;
            }
            BreakerState::Open => {
                // Already open; a failure here just means we raced a probe.
            }
        }
    }

    pub fn state_of(&self, resource: &str) -> BreakerState {
        self.resources
            .get(resource)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(threshold: u32, open_secs: u64, trials: u32) -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.breaker_failure_threshold = threshold;
        cfg.breaker_open_duration_secs = open_secs;
        cfg.breaker_half_open_trial_count = trials;
        Arc::new(cfg)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(test_config(3, 30, 1));
        assert!(breaker.can_execute("rest"));
        breaker.on_failure("rest");
        breaker.on_failure("rest");
        assert_eq!(breaker.state_of("rest"), BreakerState::Closed);
        breaker.on_failure("rest");
        assert_eq!(breaker.state_of("rest"), BreakerState::Open);
        assert!(!breaker.can_execute("rest"));
    }

    #[test]
    fn half_open_trial_success_closes_breaker() {
        let breaker = CircuitBreaker::new(test_config(1, 0, 1));
        breaker.on_failure("ws");
        assert_eq!(breaker.state_of("ws"), BreakerState::Open);

        // open_duration_secs is 0, so the next can_execute immediately
        // transitions to HalfOpen and admits one trial.
        assert!(breaker.can_execute("ws"));
        assert_eq!(breaker.state_of("ws"), BreakerState::HalfOpen);

        breaker.on_success("ws");
        assert_eq!(breaker.state_of("ws"), BreakerState::Closed);
    }

    #[test]
    fn half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config(1, 0, 1));
        breaker.on_failure("orders");
        assert!(breaker.can_execute("orders"));
        assert_eq!(breaker.state_of("orders"), BreakerState::HalfOpen);

        breaker.on_failure("orders");
        assert_eq!(breaker.state_of("orders"), BreakerState::Open);
    }

    #[test]
    fn resources_are_tracked_independently() {
        let breaker = CircuitBreaker::new(test_config(1, 30, 1));
        breaker.on_failure("rest");
        assert_eq!(breaker.state_of("rest"), BreakerState::Open);
        assert_eq!(breaker.state_of("ws"), BreakerState::Closed);
        assert!(breaker.can_execute("ws"));
    }

    #[test]
    fn emergency_bypass_forces_every_resource_through() {
        let config = test_config(5, 30, 1);
        config.set_emergency_bypass(true);
        let breaker = CircuitBreaker::new(config);
        breaker.on_failure("rest");
        breaker.on_failure("rest");
        breaker.on_failure("rest");
        breaker.on_failure("rest");
        breaker.on_failure("rest");
        assert_eq!(breaker.state_of("rest"), BreakerState::Open);
        assert!(breaker.can_execute("rest"));
        assert!(breaker.can_execute("ws"));
    }

    #[test]
    fn rate_limit_resource_uses_its_own_cooldown() {
        let mut cfg = Config::default();
        cfg.breaker_failure_threshold = 1;
        cfg.breaker_open_duration_secs = 30;
        cfg.rate_limit_breaker_cooldown_secs = 0;
        let breaker = CircuitBreaker::new(Arc::new(cfg));
        breaker.on_failure("rate_limit");
        assert_eq!(breaker.state_of("rate_limit"), BreakerState::Open);
        // cooldown is 0, so it should transition to HalfOpen immediately
        // while a general resource with the same failure would still wait.
        assert!(breaker.can_execute("rate_limit"));
    }
}
