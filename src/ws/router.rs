// =============================================================================
// Message Router — parses Kraken WS v2 envelopes into typed events
// =============================================================================
//
// Kraken v2 messages come in two unrelated shapes on the same socket:
//   - channel-tagged data pushes: `{"channel": "ticker", "type": "update", "data": [...]}`
//   - method-tagged acks/responses: `{"method": "subscribe", "success": true, ...}`
// `parse_envelope` distinguishes them up front so callers never have to
// guess which fields are present.
// =============================================================================

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::types::Ticker;

#[derive(Debug, Clone)]
pub enum WsEnvelope {
    ChannelData { channel: String, msg_type: Option<String>, data: Value },
    MethodAck {
        method: String,
        success: bool,
        error: Option<String>,
        req_id: Option<u64>,
        result: Option<Value>,
    },
    Heartbeat,
    Unknown(Value),
}

/// Fully decoded event, ready for fan-out to subscribers.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    Ticker(Ticker),
    Execution(ExecutionEvent),
    BalanceUpdate(BalanceEvent),
    SubscriptionAck { channel: String, success: bool },
    /// Response to a `req_id`-tagged outbound RPC (`add_order`,
    /// `cancel_order`, `amend_order`), matched back to its caller by
    /// `SessionManager`'s ack-waiter table rather than broadcast to every
    /// subscriber.
    MethodResponse { method: String, req_id: Option<u64>, success: bool, error: Option<String>, result: Option<Value> },
    Heartbeat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionEvent {
    pub order_id: String,
    pub exec_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_status: String,
    #[serde(default)]
    pub last_qty: Option<Decimal>,
    #[serde(default)]
    pub last_price: Option<Decimal>,
    #[serde(default)]
    pub fee: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceEvent {
    pub asset: String,
    pub balance: Decimal,
    #[serde(default)]
    pub hold_trade: Decimal,
}

pub fn parse_envelope(text: &str) -> Result<WsEnvelope, serde_json::Error> {
    let root: Value = serde_json::from_str(text)?;

    if let Some(channel) = root.get("channel").and_then(|c| c.as_str()) {
        if channel == "heartbeat" {
            return Ok(WsEnvelope::Heartbeat);
        }
        let msg_type = root.get("type").and_then(|t| t.as_str()).map(str::to_string);
        let data = root.get("data").cloned().unwrap_or(Value::Null);
        return Ok(WsEnvelope::ChannelData {
            channel: channel.to_string(),
            msg_type,
            data,
        });
    }

    if let Some(method) = root.get("method").and_then(|m| m.as_str()) {
        let success = root.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
        let error = root.get("error").and_then(|e| e.as_str()).map(str::to_string);
        let req_id = root.get("req_id").and_then(|r| r.as_u64());
        let result = root.get("result").cloned();
        return Ok(WsEnvelope::MethodAck {
            method: method.to_string(),
            success,
            error,
            req_id,
            result,
        });
    }

    Ok(WsEnvelope::Unknown(root))
}

/// Turn a channel-tagged envelope into zero or more routed events. An
/// unrecognized channel or malformed entry is dropped with the caller
/// expected to log it, not a parse failure — one bad element in an array
/// shouldn't discard the rest.
pub fn route_channel_data(channel: &str, data: &Value) -> Vec<RouterEvent> {
    match channel {
        "ticker" => data
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(parse_ticker_entry)
            .map(RouterEvent::Ticker)
            .collect(),
        "executions" => data
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| serde_json::from_value::<ExecutionEvent>(entry.clone()).ok())
            .map(RouterEvent::Execution)
            .collect(),
        "balances" => data
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| serde_json::from_value::<BalanceEvent>(entry.clone()).ok())
            .map(RouterEvent::BalanceUpdate)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_ticker_entry(entry: &Value) -> Option<Ticker> {
    let symbol = entry.get("symbol")?.as_str()?.to_string();
    let bid = parse_decimal_field(entry, "bid")?;
    let ask = parse_decimal_field(entry, "ask")?;
    let last = parse_decimal_field(entry, "last")?;
    Some(Ticker {
        symbol,
        bid,
        ask,
        last,
        updated_at_ms: chrono::Utc::now().timestamp_millis(),
    })
}

fn parse_decimal_field(entry: &Value, key: &str) -> Option<Decimal> {
    let v = entry.get(key)?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else if let Some(f) = v.as_f64() {
        Decimal::try_from(f).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_data_envelope() {
        let raw = r#"{"channel":"ticker","type":"update","data":[{"symbol":"BTC/USD","bid":"50000.1","ask":"50000.2","last":"50000.1"}]}"#;
        let envelope = parse_envelope(raw).unwrap();
        match envelope {
            WsEnvelope::ChannelData { channel, data, .. } => {
                assert_eq!(channel, "ticker");
                let events = route_channel_data(&channel, &data);
                assert_eq!(events.len(), 1);
                match &events[0] {
                    RouterEvent::Ticker(t) => assert_eq!(t.symbol, "BTC/USD"),
                    _ => panic!("expected ticker event"),
                }
            }
            _ => panic!("expected channel data envelope"),
        }
    }

    #[test]
    fn parses_method_ack_envelope() {
        let raw = r#"{"method":"subscribe","success":true,"result":{"channel":"ticker"}}"#;
        let envelope = parse_envelope(raw).unwrap();
        match envelope {
            WsEnvelope::MethodAck { method, success, error, .. } => {
                assert_eq!(method, "subscribe");
                assert!(success);
                assert!(error.is_none());
            }
            _ => panic!("expected method ack envelope"),
        }
    }

    #[test]
    fn parses_req_id_tagged_method_response() {
        let raw = r#"{"method":"add_order","success":true,"req_id":42,"result":{"order_id":"OABC-123"}}"#;
        let envelope = parse_envelope(raw).unwrap();
        match envelope {
            WsEnvelope::MethodAck { method, success, req_id, result, .. } => {
                assert_eq!(method, "add_order");
                assert!(success);
                assert_eq!(req_id, Some(42));
                assert!(result.is_some());
            }
            _ => panic!("expected method ack envelope"),
        }
    }

    #[test]
    fn recognizes_heartbeat_channel() {
        let raw = r#"{"channel":"heartbeat"}"#;
        assert!(matches!(parse_envelope(raw).unwrap(), WsEnvelope::Heartbeat));
    }

    #[test]
    fn malformed_entry_in_array_is_skipped_not_fatal() {
        let data: Value = serde_json::from_str(
            r#"[{"symbol":"BTC/USD","bid":"1","ask":"2","last":"1.5"},{"symbol":"broken"}]"#,
        )
        .unwrap();
        let events = route_channel_data("ticker", &data);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn unknown_envelope_shape_does_not_error() {
        let raw = r#"{"status":"ok"}"#;
        assert!(matches!(parse_envelope(raw).unwrap(), WsEnvelope::Unknown(_)));
    }
}
