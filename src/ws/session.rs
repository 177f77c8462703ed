// =============================================================================
// WebSocket Session Manager — dual public/private connect loops with reconnect
// =============================================================================
//
// Each call to `run` owns one socket: connect, subscribe, read until the
// stream ends or errors, then return so the caller decides whether and how
// long to back off before reconnecting. This mirrors the exchange-facing
// stream loops elsewhere in this crate rather than retrying internally, so
// the orchestrator's supervision policy stays in one place.
//
// The private connection additionally owns an outbound RPC path
// (`send_private_rpc`) used by the order engine to prefer `add_order` over
// REST: a writer task drains an mpsc channel into the socket, and responses
// tagged with a `req_id` are matched back to the caller via a one-shot
// waiter table instead of being broadcast like subscription acks. Kraken's WS
// auth token expires 15 minutes after issue, so `run_private` refreshes it on
// a timer well inside that window rather than letting the connection go
// stale mid-session.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::{Stream, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::router::{parse_envelope, route_channel_data, RouterEvent, WsEnvelope};
use crate::rest_client::{endpoints, KrakenRestClient};

/// How long before Kraken's documented 15-minute WS token expiry to proactively
/// fetch a replacement and resubscribe with it.
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(13 * 60);
/// How long `send_private_rpc` waits for a `req_id`-tagged response before
/// giving up, letting the caller retry over an alternate transport.
const PRIVATE_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Last-message-at per channel, in epoch millis. Read by callers deciding
/// whether a stream has gone quiet without erroring outright (Kraken sends
/// heartbeats, so a long silence means a half-dead connection, not just an
/// idle market).
#[derive(Default)]
pub struct StreamHealth {
    public_last_ms: AtomicI64,
    private_last_ms: AtomicI64,
}

impl StreamHealth {
    pub fn public_age_ms(&self) -> i64 {
        age_since(self.public_last_ms.load(Ordering::Relaxed))
    }

    pub fn private_age_ms(&self) -> i64 {
        age_since(self.private_last_ms.load(Ordering::Relaxed))
    }

    fn touch(&self, channel: WsChannel) {
        let now = chrono::Utc::now().timestamp_millis();
        match channel {
            WsChannel::Public => self.public_last_ms.store(now, Ordering::Relaxed),
            WsChannel::Private => self.private_last_ms.store(now, Ordering::Relaxed),
        }
    }
}

fn age_since(last_ms: i64) -> i64 {
    if last_ms == 0 {
        return i64::MAX;
    }
    chrono::Utc::now().timestamp_millis() - last_ms
}

/// Ticks can lag and drop the oldest; this is the bound before that happens.
const TICK_CHANNEL_CAPACITY: usize = 1024;
/// Executions/balances are sized generously so a slow subscriber practically
/// never misses one; losing these would desync downstream state.
const CRITICAL_CHANNEL_CAPACITY: usize = 4096;

/// Which logical stream a subscription belongs to, determining drop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsChannel {
    Public,
    Private,
}

pub struct SessionManager {
    public_url: String,
    private_url: String,
    rest_client: Arc<KrakenRestClient>,
    tick_tx: broadcast::Sender<RouterEvent>,
    critical_tx: broadcast::Sender<RouterEvent>,
    health: StreamHealth,
    write_tx: tokio::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    private_token: RwLock<Option<String>>,
    ack_waiters: DashMap<u64, oneshot::Sender<RouterEvent>>,
    req_id_counter: AtomicU64,
}

impl SessionManager {
    pub fn new(public_url: impl Into<String>, private_url: impl Into<String>, rest_client: Arc<KrakenRestClient>) -> Arc<Self> {
        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (critical_tx, _) = broadcast::channel(CRITICAL_CHANNEL_CAPACITY);
        Arc::new(Self {
            public_url: public_url.into(),
            private_url: private_url.into(),
            rest_client,
            tick_tx,
            critical_tx,
            health: StreamHealth::default(),
            write_tx: tokio::sync::Mutex::new(None),
            private_token: RwLock::new(None),
            ack_waiters: DashMap::new(),
            req_id_counter: AtomicU64::new(0),
        })
    }

    /// Whether the private connection currently has a live write channel,
    /// used by the order engine to decide whether WS is worth trying before
    /// falling back to REST.
    pub fn has_active_private_connection(&self) -> bool {
        self.write_tx.try_lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Send a `req_id`-tagged private RPC (`add_order`, `cancel_order`,
    /// `amend_order`) over the live private connection and wait for its
    /// matching response. Injects the cached auth token into `params`.
    pub async fn send_private_rpc(&self, method: &str, mut params: Value) -> Result<RouterEvent> {
        let tx = {
            let guard = self.write_tx.lock().await;
            guard.clone().context("no active private WebSocket connection")?
        };
        let token = self
            .private_token
            .read()
            .clone()
            .context("no cached private WebSocket auth token yet")?;

        let req_id = self.req_id_counter.fetch_add(1, Ordering::Relaxed);
        if let Value::Object(ref mut map) = params {
            map.insert("token".to_string(), json!(token));
        }
        let message = json!({ "method": method, "params": params, "req_id": req_id });

        let (ack_tx, ack_rx) = oneshot::channel();
        self.ack_waiters.insert(req_id, ack_tx);

        if tx.send(Message::Text(message.to_string())).is_err() {
            self.ack_waiters.remove(&req_id);
            anyhow::bail!("private WebSocket write channel closed");
        }

        match tokio::time::timeout(PRIVATE_RPC_TIMEOUT, ack_rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => anyhow::bail!("{method} ack channel dropped before a response arrived"),
            Err(_) => {
                self.ack_waiters.remove(&req_id);
                anyhow::bail!("timed out waiting for {method} acknowledgement")
            }
        }
    }

    pub fn health(&self) -> &StreamHealth {
        &self.health
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<RouterEvent> {
        self.tick_tx.subscribe()
    }

    pub fn subscribe_critical(&self) -> broadcast::Receiver<RouterEvent> {
        self.critical_tx.subscribe()
    }

    /// Run the public-data connection: ticker subscriptions for `symbols`.
    /// Returns when the connection drops; the caller is expected to call
    /// this again with backoff.
    pub async fn run_public(&self, symbols: &[String]) -> Result<()> {
        info!(url = %self.public_url, "connecting to public WebSocket");
        let (ws_stream, _) = connect_async(&self.public_url)
            .await
            .context("failed to connect to public WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = json!({
            "method": "subscribe",
            "params": { "channel": "ticker", "symbol": symbols },
        });
        write
            .send(Message::Text(subscribe_msg.to_string()))
            .await
            .context("failed to send ticker subscription")?;

        self.read_loop(&mut read, WsChannel::Public).await
    }

    /// Run the private connection: fetches a fresh WS auth token via REST,
    /// then subscribes to `executions` and `balances`. Kraken tokens expire
    /// after a short window, so this always fetches a new one per connect
    /// rather than caching across reconnects, and proactively refreshes it
    /// again roughly every 13 minutes while the connection stays open.
    ///
    /// Owns the write half for the duration of the connection: a writer task
    /// drains an mpsc channel into the socket so `send_private_rpc` can push
    /// outbound calls from other tasks without fighting over the sink.
    pub async fn run_private(&self) -> Result<()> {
        let token = self.fetch_ws_token().await?;
        *self.private_token.write() = Some(token.clone());

        info!(url = %self.private_url, "connecting to private WebSocket");
        let (ws_stream, _) = connect_async(&self.private_url)
            .await
            .context("failed to connect to private WebSocket")?;
        let (write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.write_tx.lock().await = Some(tx.clone());

        let writer = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let subscribe_result = self.subscribe_private_channels(&tx, &token).await;
        let result = if let Err(e) = subscribe_result {
            Err(e)
        } else {
            self.run_private_loop(&mut read, &tx).await
        };

        *self.write_tx.lock().await = None;
        writer.abort();
        result
    }

    async fn subscribe_private_channels(&self, tx: &mpsc::UnboundedSender<Message>, token: &str) -> Result<()> {
        for channel in ["executions", "balances"] {
            let subscribe_msg = json!({
                "method": "subscribe",
                "params": { "channel": channel, "token": token },
            });
            tx.send(Message::Text(subscribe_msg.to_string()))
                .with_context(|| format!("failed to send {channel} subscription"))?;
        }
        Ok(())
    }

    async fn run_private_loop<S>(&self, read: &mut S, tx: &mpsc::UnboundedSender<Message>) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut refresh_interval = tokio::time::interval(TOKEN_REFRESH_INTERVAL);
        refresh_interval.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text, WsChannel::Private),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            warn!(?frame, "private WebSocket closed by peer");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "private WebSocket read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("private WebSocket stream ended");
                            return Ok(());
                        }
                    }
                }
                _ = refresh_interval.tick() => {
                    match self.fetch_ws_token().await {
                        Ok(new_token) => {
                            *self.private_token.write() = Some(new_token.clone());
                            if let Err(e) = self.subscribe_private_channels(tx, &new_token).await {
                                warn!(error = %e, "failed to resubscribe with refreshed WS token");
                            } else {
                                info!("refreshed private WebSocket auth token");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to refresh WS auth token, continuing with existing session"),
                    }
                }
            }
        }
    }

    async fn fetch_ws_token(&self) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TokenResult {
            token: String,
        }
        let result: TokenResult = self
            .rest_client
            .post_private(endpoints::GET_WEBSOCKETS_TOKEN, Vec::new())
            .await
            .context("failed to fetch WS auth token")?;
        Ok(result.token)
    }

    async fn read_loop<S>(&self, read: &mut S, channel: WsChannel) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => self.dispatch(&text, channel),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    warn!(?frame, ?channel, "WebSocket closed by peer");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, ?channel, "WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(?channel, "WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, text: &str, channel: WsChannel) {
        self.health.touch(channel);
        let envelope = match parse_envelope(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to parse WS envelope");
                return;
            }
        };

        match envelope {
            WsEnvelope::ChannelData { channel: name, data, .. } => {
                for event in route_channel_data(&name, &data) {
                    self.publish(event, channel);
                }
            }
            WsEnvelope::MethodAck { method, success, error, req_id, result } => {
                if let Some(id) = req_id {
                    if let Some((_, waiter)) = self.ack_waiters.remove(&id) {
                        let _ = waiter.send(RouterEvent::MethodResponse { method, req_id: Some(id), success, error, result });
                        return;
                    }
                }
                if !success {
                    warn!(method, error = ?error, "WS subscription request failed");
                }
                let _ = self.critical_tx.send(RouterEvent::SubscriptionAck { channel: method, success });
            }
            WsEnvelope::Heartbeat => {
                let _ = self.critical_tx.send(RouterEvent::Heartbeat);
            }
            WsEnvelope::Unknown(_) => {}
        }
    }

    fn publish(&self, event: RouterEvent, channel: WsChannel) {
        let _ = channel;
        match event {
            RouterEvent::Ticker(_) => {
                let _ = self.tick_tx.send(event);
            }
            RouterEvent::Execution(_) | RouterEvent::BalanceUpdate(_) => {
                let _ = self.critical_tx.send(event);
            }
            other => {
                let _ = self.critical_tx.send(other);
            }
        }
    }
}

/// Reconnect with exponential backoff, capped, jittered by the caller's
/// choice of `attempt`. Used by the orchestrator's supervised spawn loop.
pub fn backoff_delay(attempt: u32) -> Duration {
    let capped = attempt.min(6);
    Duration::from_secs(1u64 << capped).min(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn untouched_health_reports_max_age() {
        let health = StreamHealth::default();
        assert_eq!(health.public_age_ms(), i64::MAX);
        assert_eq!(health.private_age_ms(), i64::MAX);
    }

    #[test]
    fn touching_a_channel_resets_its_age() {
        let health = StreamHealth::default();
        health.touch(WsChannel::Public);
        assert!(health.public_age_ms() < 1_000);
        assert_eq!(health.private_age_ms(), i64::MAX);
    }

    #[test]
    fn token_refresh_interval_stays_inside_the_documented_expiry() {
        assert!(TOKEN_REFRESH_INTERVAL < Duration::from_secs(15 * 60));
    }

    #[tokio::test]
    async fn no_active_connection_without_a_write_channel() {
        use base64::engine::general_purpose::STANDARD as base64_std;
        use base64::Engine;

        let tmp = std::env::temp_dir().join(format!("session_test_{}.json", std::process::id()));
        let nonce = crate::nonce::NonceAuthority::load(&tmp).await;
        let signer = Arc::new(crate::signer::Signer::new("key", &base64_std.encode([0u8; 32])).unwrap());
        let rate_limiter = crate::rate_limiter::RateLimiter::new(crate::types::Tier::Intermediate);
        let rest_client = Arc::new(KrakenRestClient::new("https://api.kraken.com", signer, nonce, rate_limiter));

        let manager = SessionManager::new("wss://example.invalid", "wss://example.invalid", rest_client);
        assert!(!manager.has_active_private_connection());

        let result = manager.send_private_rpc("add_order", json!({})).await;
        assert!(result.is_err());
    }
}
