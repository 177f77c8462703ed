// =============================================================================
// Configuration — immutable startup snapshot with atomic persistence
// =============================================================================
//
// Every tunable lives here, loaded once at startup into an `Arc<Config>` and
// handed to every component by reference. There is deliberately no hot-reload
// path: changing a limit means restarting the process with a new file, so
// nothing downstream has to reason about a config value changing under it
// mid-decision. The one exception is `emergency_bypass`, an `AtomicBool`
// operators can flip without a restart to force the circuit breaker open
// everywhere; it lives outside the serialized snapshot for that reason.
//
// Persistence uses the same atomic tmp + rename pattern used everywhere else
// in this crate (nonce floor, learned minimum sizes, position snapshots) so
// that a crash mid-write never corrupts the file on disk.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, Tier, TradingMode};

fn default_true() -> bool {
    true
}

/// WebSocket usage toggle, nested to mirror the dotted `websocket.enabled`
/// key documented for this crate. When disabled the orchestrator never
/// spawns the public/private streams and the order engine submits over REST
/// only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_symbols() -> Vec<String> {
    vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
}

fn default_tier() -> Tier {
    Tier::Intermediate
}

fn default_max_concurrent_positions() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> Decimal {
    dec!(3.0)
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_trades_per_day() -> u32 {
    50
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_rest_base_url() -> String {
    "https://api.kraken.com".to_string()
}

fn default_ws_public_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn default_ws_private_url() -> String {
    "wss://ws-auth.kraken.com/v2".to_string()
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_open_duration_secs() -> u64 {
    30
}

fn default_breaker_half_open_trial_count() -> u32 {
    1
}

fn default_rate_limit_breaker_cooldown_secs() -> u64 {
    45
}

fn default_position_size_usdt() -> Decimal {
    dec!(100)
}

fn default_max_position_pct() -> Decimal {
    dec!(20.0)
}

fn default_take_profit_pct() -> Decimal {
    dec!(1.5)
}

fn default_stop_loss_pct() -> Decimal {
    dec!(1.0)
}

fn default_min_confidence() -> Decimal {
    dec!(0.6)
}

fn default_cycle_ms() -> u64 {
    5_000
}

fn default_signal_cooldown_secs() -> u64 {
    30
}

/// Top-level configuration snapshot, loaded once at startup.
///
/// Every field carries `#[serde(default)]` so that adding new fields never
/// breaks loading an older config file.
#[derive(Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,
    #[serde(default = "default_tier")]
    pub tier: Tier,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_public_url")]
    pub ws_public_url: String,
    #[serde(default = "default_ws_private_url")]
    pub ws_private_url: String,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_open_duration_secs")]
    pub breaker_open_duration_secs: u64,
    #[serde(default = "default_breaker_half_open_trial_count")]
    pub breaker_half_open_trial_count: u32,
    /// Distinct cooldown for the `rate_limit` resource, which needs longer
    /// to drain than a handful of failed requests on any other resource.
    #[serde(default = "default_rate_limit_breaker_cooldown_secs")]
    pub rate_limit_breaker_cooldown_secs: u64,

    /// Notional size, in quote-asset USDT-equivalent terms, an accepted
    /// signal's intended position is sized from before minimum/lot rounding.
    #[serde(default = "default_position_size_usdt")]
    pub position_size_usdt: Decimal,
    /// Ceiling on how much of total equity a single position may represent.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Minimum strategy confidence (0-1) required to act on a signal.
    /// Strategies reporting on a 0-100 scale are normalized before this
    /// comparison.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// How often the strategy loop evaluates the configured symbols.
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,
    /// Minimum spacing between two accepted signals for the same
    /// symbol+side, so a jittery strategy can't resubmit every cycle.
    #[serde(default = "default_signal_cooldown_secs")]
    pub signal_cooldown_secs: u64,

    #[serde(default)]
    pub websocket: WebsocketConfig,

    /// Directory holding persisted state: nonce floor, learned minimum
    /// sizes, position snapshots. Created on startup if missing.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Whether reconciliation drift should only be logged (true, the safe
    /// default) or should additionally pause trading mode.
    #[serde(default = "default_true")]
    pub reconcile_log_only: bool,

    /// API credentials, sourced from the environment rather than the config
    /// file so they never end up in a checked-in JSON snapshot. Skipped
    /// entirely on serialize.
    #[serde(skip_serializing, default)]
    pub api_key: String,
    #[serde(skip_serializing, default)]
    pub api_secret: String,

    /// Operator-controlled kill switch: when true, the circuit breaker
    /// treats every resource as open regardless of its own state. Lives
    /// outside the persisted snapshot; flipped at runtime via the shared
    /// `Arc<Config>`, never reloaded from disk.
    #[serde(skip)]
    pub emergency_bypass: AtomicBool,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            trading_mode: self.trading_mode.clone(),
            account_mode: self.account_mode.clone(),
            tier: self.tier.clone(),
            symbols: self.symbols.clone(),
            max_concurrent_positions: self.max_concurrent_positions,
            max_daily_loss_pct: self.max_daily_loss_pct,
            max_consecutive_losses: self.max_consecutive_losses,
            max_trades_per_day: self.max_trades_per_day,
            rest_base_url: self.rest_base_url.clone(),
            ws_public_url: self.ws_public_url.clone(),
            ws_private_url: self.ws_private_url.clone(),
            breaker_failure_threshold: self.breaker_failure_threshold,
            breaker_open_duration_secs: self.breaker_open_duration_secs,
            breaker_half_open_trial_count: self.breaker_half_open_trial_count,
            rate_limit_breaker_cooldown_secs: self.rate_limit_breaker_cooldown_secs,
            position_size_usdt: self.position_size_usdt,
            max_position_pct: self.max_position_pct,
            take_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
            min_confidence: self.min_confidence,
            cycle_ms: self.cycle_ms,
            signal_cooldown_secs: self.signal_cooldown_secs,
            websocket: self.websocket.clone(),
            state_dir: self.state_dir.clone(),
            reconcile_log_only: self.reconcile_log_only,
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            emergency_bypass: AtomicBool::new(self.emergency_bypass.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("trading_mode", &self.trading_mode)
            .field("account_mode", &self.account_mode)
            .field("tier", &self.tier)
            .field("symbols", &self.symbols)
            .field("max_concurrent_positions", &self.max_concurrent_positions)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("position_size_usdt", &self.position_size_usdt)
            .field("max_position_pct", &self.max_position_pct)
            .field("min_confidence", &self.min_confidence)
            .field("cycle_ms", &self.cycle_ms)
            .field("websocket_enabled", &self.websocket.enabled)
            .field("rest_base_url", &self.rest_base_url)
            .field("state_dir", &self.state_dir)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("emergency_bypass", &self.emergency_bypass.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            tier: default_tier(),
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            rest_base_url: default_rest_base_url(),
            ws_public_url: default_ws_public_url(),
            ws_private_url: default_ws_private_url(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_open_duration_secs: default_breaker_open_duration_secs(),
            breaker_half_open_trial_count: default_breaker_half_open_trial_count(),
            rate_limit_breaker_cooldown_secs: default_rate_limit_breaker_cooldown_secs(),
            position_size_usdt: default_position_size_usdt(),
            max_position_pct: default_max_position_pct(),
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            min_confidence: default_min_confidence(),
            cycle_ms: default_cycle_ms(),
            signal_cooldown_secs: default_signal_cooldown_secs(),
            websocket: WebsocketConfig::default(),
            state_dir: default_state_dir(),
            reconcile_log_only: true,
            api_key: String::new(),
            api_secret: String::new(),
            emergency_bypass: AtomicBool::new(false),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`, then layer API
    /// credentials from the environment on top. Startup always forces
    /// `trading_mode` to `Paused` regardless of what was persisted, so a
    /// crash-and-restart never silently resumes live trading.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Self = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "no config file found, using defaults");
                Self::default()
            }
        };

        config.api_key = std::env::var("KRAKEN_API_KEY").unwrap_or_default();
        config.api_secret = std::env::var("KRAKEN_API_SECRET").unwrap_or_default();
        config.trading_mode = TradingMode::Paused;

        info!(
            symbols = ?config.symbols,
            account_mode = %config.account_mode,
            tier = ?config.tier,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). Credentials are never written out.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    pub fn is_emergency_bypassed(&self) -> bool {
        self.emergency_bypass.load(Ordering::Relaxed)
    }

    pub fn set_emergency_bypass(&self, enabled: bool) {
        self.emergency_bypass.store(enabled, Ordering::Relaxed);
        warn!(enabled, "emergency bypass toggled");
    }

    /// Open-state cooldown for `resource`. `rate_limit` gets its own,
    /// typically longer, cooldown; every other resource shares the general
    /// breaker setting.
    pub fn open_duration_secs_for(&self, resource: &str) -> u64 {
        if resource == "rate_limit" {
            self.rate_limit_breaker_cooldown_secs
        } else {
            self.breaker_open_duration_secs
        }
    }

    /// Normalize a confidence value onto the 0-1 scale: strategies reporting
    /// on a 0-100 scale are divided down, values already <= 1 pass through.
    pub fn normalize_confidence(value: Decimal) -> Decimal {
        if value > Decimal::ONE {
            value / dec!(100)
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbols, vec!["BTC/USD".to_string(), "ETH/USD".to_string()]);
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert!(!cfg.is_emergency_bypassed());
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.max_consecutive_losses, 5);
        assert_eq!(cfg.breaker_failure_threshold, 5);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "account_mode": "Live", "symbols": ["XRP/USD"] }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.account_mode, AccountMode::Live);
        assert_eq!(cfg.symbols, vec!["XRP/USD".to_string()]);
        assert_eq!(cfg.max_trades_per_day, 50);
    }

    #[test]
    fn roundtrip_serialization_preserves_fields() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.tier as u8, cfg2.tier as u8);
    }

    #[test]
    fn credentials_are_never_serialized() {
        let mut cfg = Config::default();
        cfg.api_key = "secret-key".to_string();
        cfg.api_secret = "secret-value".to_string();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret-key"));
        assert!(!json.contains("secret-value"));
    }

    #[test]
    fn emergency_bypass_toggles_independently_of_snapshot() {
        let cfg = Config::default();
        cfg.set_emergency_bypass(true);
        assert!(cfg.is_emergency_bypassed());
        cfg.set_emergency_bypass(false);
        assert!(!cfg.is_emergency_bypassed());
    }

    #[test]
    fn rate_limit_resource_gets_its_own_cooldown() {
        let cfg = Config::default();
        assert_eq!(cfg.open_duration_secs_for("rate_limit"), 45);
        assert_eq!(cfg.open_duration_secs_for("orders"), cfg.breaker_open_duration_secs);
    }

    #[test]
    fn confidence_normalization_divides_0_to_100_scale() {
        assert_eq!(Config::normalize_confidence(dec!(75)), dec!(0.75));
        assert_eq!(Config::normalize_confidence(dec!(0.75)), dec!(0.75));
    }

    #[test]
    fn trading_config_fields_have_sane_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.cycle_ms, 5_000);
        assert!(cfg.websocket.enabled);
        assert_eq!(cfg.min_confidence, dec!(0.6));
    }
}
