// =============================================================================
// REST Client — signed and public HTTP access to Kraken's Spot REST API
// =============================================================================
//
// SECURITY: credentials live only in the `Signer` this client holds; they are
// never logged. Every signed call follows the same six steps: mint a nonce,
// acquire a rate-limit permit, urlencode the post body (nonce included),
// sign it, send, then classify the response into a typed [`CoreError`] so
// retry policy is decided once, here, rather than by each caller.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{classify_http_status, classify_kraken_error, CoreError};
use crate::nonce::NonceAuthority;
use crate::rate_limiter::{RateLimiter, ReleaseOutcome};
use crate::signer::Signer;
use crate::types::Symbol;

/// Ceiling on retry attempts for a single `post_private` call, independent of
/// the total-wait cap below.
const MAX_RETRY_ATTEMPTS: u32 = 5;
/// Ceiling on cumulative time spent retrying a single call, including the
/// rate limiter's own admission wait.
const MAX_TOTAL_RETRY_WAIT: Duration = Duration::from_secs(60);

pub mod endpoints {
    pub const TIME: &str = "/0/public/Time";
    pub const SYSTEM_STATUS: &str = "/0/public/SystemStatus";
    pub const ASSET_PAIRS: &str = "/0/public/AssetPairs";
    pub const TICKER: &str = "/0/public/Ticker";

    pub const BALANCE: &str = "/0/private/Balance";
    pub const OPEN_ORDERS: &str = "/0/private/OpenOrders";
    pub const CLOSED_ORDERS: &str = "/0/private/ClosedOrders";
    pub const QUERY_ORDERS: &str = "/0/private/QueryOrders";
    pub const TRADES_HISTORY: &str = "/0/private/TradesHistory";
    pub const ADD_ORDER: &str = "/0/private/AddOrder";
    pub const AMEND_ORDER: &str = "/0/private/AmendOrder";
    pub const EDIT_ORDER: &str = "/0/private/EditOrder";
    pub const CANCEL_ORDER: &str = "/0/private/CancelOrder";
    pub const CANCEL_ALL: &str = "/0/private/CancelAll";
    pub const GET_WEBSOCKETS_TOKEN: &str = "/0/private/GetWebSocketsToken";

    /// The endpoint method name as used by the rate limiter's cost table,
    /// which keys on the trailing path segment rather than the full path.
    pub fn method_name(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }
}

#[derive(Clone)]
pub struct KrakenRestClient {
    base_url: String,
    client: reqwest::Client,
    signer: Arc<Signer>,
    nonce: Arc<NonceAuthority>,
    rate_limiter: Arc<RateLimiter>,
}

impl KrakenRestClient {
    pub fn new(
        base_url: impl Into<String>,
        signer: Arc<Signer>,
        nonce: Arc<NonceAuthority>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            signer,
            nonce,
            rate_limiter,
        }
    }

    /// Call a public endpoint (no signature, no nonce, still rate-limited).
    #[instrument(skip(self), fields(path))]
    pub async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, CoreError> {
        let _permit = self.rate_limiter.acquire(endpoints::method_name(path)).await;
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        self.parse_response(response).await
    }

    /// Call a private endpoint with the six-step signed-request algorithm:
    /// mint a nonce, rate-limit, urlencode the body, sign, send, classify.
    /// `NonceError`/`RateLimit`/`Transient` failures are retried with
    /// exponential-plus-jitter backoff, capped at `MAX_RETRY_ATTEMPTS`
    /// attempts and `MAX_TOTAL_RETRY_WAIT` cumulative wait; every other kind
    /// returns immediately.
    #[instrument(skip(self, form_params), fields(path))]
    pub async fn post_private<T: DeserializeOwned>(&self, path: &str, form_params: Vec<(String, String)>) -> Result<T, CoreError> {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let permit = self.rate_limiter.acquire(endpoints::method_name(path)).await;
            let result = self.send_signed(path, form_params.clone()).await;

            self.rate_limiter.release(
                permit,
                if matches!(result, Err(CoreError::RateLimit(_))) {
                    ReleaseOutcome::RateLimited
                } else {
                    ReleaseOutcome::Success
                },
            );

            if let Err(CoreError::NonceError(ref msg)) = result {
                warn!(error = %msg, "nonce rejected by exchange, recovering floor");
                self.nonce.recover_from_invalid().await;
            }

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let elapsed = start.elapsed();
            if !err.is_retryable() || attempt >= MAX_RETRY_ATTEMPTS || elapsed >= MAX_TOTAL_RETRY_WAIT {
                return Err(err);
            }

            let remaining = MAX_TOTAL_RETRY_WAIT - elapsed;
            let delay = retry_backoff(attempt).min(remaining);
            warn!(path, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying private call after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_signed<T: DeserializeOwned>(&self, path: &str, mut form_params: Vec<(String, String)>) -> Result<T, CoreError> {
        let nonce = self.nonce.next_nonce().await;
        form_params.insert(0, ("nonce".to_string(), nonce.to_string()));

        let body = serde_urlencoded::to_string(&form_params)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to urlencode form body: {e}")))?;

        let signed = self.signer.sign(path, &body, nonce);
        let mut headers = HeaderMap::new();
        headers.insert(
            "API-Key",
            HeaderValue::from_str(&signed.api_key).map_err(|e| CoreError::Auth(e.to_string()))?,
        );
        headers.insert(
            "API-Sign",
            HeaderValue::from_str(&signed.api_sign).map_err(|e| CoreError::Auth(e.to_string()))?,
        );

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        self.parse_response(response).await
    }

    /// Fetch and parse Kraken's `AssetPairs` metadata for `pairs` (wire form,
    /// e.g. `BTC/USD`), matched against each entry's `wsname`. Pairs the
    /// response doesn't recognize are silently absent from the result rather
    /// than failing the whole call, since the order engine treats an
    /// unregistered symbol as "validate nothing" rather than fatal.
    pub async fn fetch_symbol_metadata(&self, pairs: &[String]) -> Result<HashMap<String, Symbol>, CoreError> {
        let raw: HashMap<String, Value> = self.get_public(endpoints::ASSET_PAIRS, &[]).await?;

        let mut out = HashMap::new();
        for info in raw.values() {
            let Some(wsname) = info.get("wsname").and_then(|v| v.as_str()) else {
                continue;
            };
            if !pairs.iter().any(|p| p == wsname) {
                continue;
            }
            let Some((base, quote)) = wsname.split_once('/') else {
                continue;
            };

            let price_tick = info
                .get("tick_size")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| decimal_places_unit(info.get("pair_decimals")));
            let lot_step = decimal_places_unit(info.get("lot_decimals"));
            let min_quantity = info
                .get("ordermin")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let min_notional = info
                .get("costmin")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);

            out.insert(
                wsname.to_string(),
                Symbol {
                    base: base.to_string(),
                    quote: quote.to_string(),
                    price_tick,
                    lot_step,
                    min_quantity,
                    min_notional,
                },
            );
        }

        Ok(out)
    }

    async fn parse_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, CoreError> {
        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("failed to parse response body: {e}")))?;

        if let Some(errors) = body.get("error").and_then(|e| e.as_array()) {
            if let Some(first) = errors.first().and_then(|e| e.as_str()) {
                return Err(classify_kraken_error(first));
            }
        }

        let result = body
            .get("result")
            .cloned()
            .unwrap_or(Value::Null);

        debug!("response parsed successfully");
        serde_json::from_value(result)
            .with_context(|| "failed to deserialize Kraken result payload".to_string())
            .map_err(CoreError::from)
    }
}

/// Exponential-with-jitter backoff for a retry attempt (1-indexed), doubling
/// from a 250ms base and capped at 8s before jitter is added.
fn retry_backoff(attempt: u32) -> Duration {
    let base_ms = 250u64 * 2u64.pow(attempt.saturating_sub(1).min(5));
    let capped_ms = base_ms.min(8_000);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped_ms / 4);
    Duration::from_millis(capped_ms + jitter_ms)
}

/// Kraken reports pair granularity as a decimal-places count rather than a
/// step value directly; `10^-places` converts it into the same step-size
/// shape as `tick_size`/`ordermin`.
fn decimal_places_unit(places: Option<&Value>) -> Decimal {
    let places = places.and_then(|v| v.as_u64()).unwrap_or(8) as u32;
    Decimal::new(1, places)
}
