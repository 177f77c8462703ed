// =============================================================================
// Error Taxonomy — typed classification for every fallible core operation
// =============================================================================
//
// Kraken error strings arrive as opaque text inside a JSON `error` array.
// `classify_kraken_error` maps the documented substrings onto this enum so
// that retry/backoff policy can be decided once, at the boundary, instead of
// by every caller re-parsing strings.
// =============================================================================

use thiserror::Error;

/// Typed error kinds shared across the exchange-interaction core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Network failure, HTTP 5xx, or request timeout. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Kraken rejected the nonce as out of order. Recovered by jumping the
    /// nonce floor forward before retrying.
    #[error("invalid nonce: {0}")]
    NonceError(String),

    /// Kraken reported a rate-limit violation independent of our own
    /// admission control.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Key, signature, or permission failure. Never retried automatically.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Business-rule rejection (e.g. insufficient funds, bad parameters).
    #[error("business rejection: {0}")]
    Business(String),

    /// Order size/notional below the exchange's minimum for the symbol.
    #[error("minimum size violation: {0}")]
    MinSizeViolation(String),

    /// Unexpected message shape or invariant break. Logged, never fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Persistent failure that cannot be recovered from at runtime.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Catch-all for errors that don't fit the taxonomy above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether an operation returning this error is safe to retry under the
    /// caller's own backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::NonceError(_) | CoreError::RateLimit(_)
        )
    }
}

/// Classify a Kraken `error[]` entry into a [`CoreError`], per the
/// documented substring table. Unknown strings surface as `Other`.
pub fn classify_kraken_error(message: &str) -> CoreError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("invalid nonce") {
        CoreError::NonceError(message.to_string())
    } else if lower.contains("rate limit") || lower.contains("too many") {
        CoreError::RateLimit(message.to_string())
    } else if lower.contains("permission denied") || lower.contains("invalid signature") {
        CoreError::Auth(message.to_string())
    } else if lower.contains("insufficient funds") {
        CoreError::Business(message.to_string())
    } else if lower.contains("minimum") {
        CoreError::MinSizeViolation(message.to_string())
    } else {
        CoreError::Other(anyhow::anyhow!("unclassified Kraken error: {message}"))
    }
}

/// Classify an HTTP status code, for use alongside [`classify_kraken_error`]
/// when the response has no `error[]` body to inspect.
pub fn classify_http_status(status: reqwest::StatusCode) -> CoreError {
    if status.is_server_error() {
        CoreError::Transient(format!("HTTP {status}"))
    } else {
        CoreError::Other(anyhow::anyhow!("unexpected HTTP status: {status}"))
    }
}
