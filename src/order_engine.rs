// =============================================================================
// Order Execution Engine — submission, lifecycle tracking, and fan-out
// =============================================================================
//
// Every order carries a caller-chosen client-order-id that Kraken echoes
// back (`cl_ord_id`). Submitting the same client-order-id twice returns the
// existing tracked order instead of sending a second request — this is what
// makes retrying a submission after a timeout safe: the caller can't tell
// whether the first attempt reached the exchange, but resubmitting can't
// double-place it.
//
// Submission validates against the symbol's documented tick/lot/minimums and
// the Balance Ledger's free balance before ever touching the network, prefers
// sending `add_order` over the private WebSocket (its own ~10s ack timeout
// lives in `SessionManager::send_private_rpc`) and falls back to REST on any
// WS failure or timeout. WS executions then update order status faster than
// polling REST would; this engine is WS-preferred for status updates and
// REST-fallback for submission, matching the dual-transport guidance.
// Position and minimum-size state are updated from the same execution events
// so they never see a state REST wouldn't also eventually report.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::balance_ledger::BalanceLedger;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{classify_kraken_error, CoreError};
use crate::min_size::MinSizeLearner;
use crate::position_tracker::PositionTracker;
use crate::rest_client::{endpoints, KrakenRestClient};
use crate::types::{OrderStatus, OrderType, Side, Symbol, TimeInForce};
use crate::ws::router::{ExecutionEvent, RouterEvent};
use crate::ws::session::SessionManager;

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop: Option<Decimal>,
    pub tif: TimeInForce,
    pub post_only: bool,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    /// `filled_quantity + remaining_qty == quantity` always holds.
    pub remaining_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub fees: Decimal,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub error: Option<String>,
}

struct AddOrderAck {
    exchange_order_id: Option<String>,
}

type ExecutionHandler = Box<dyn Fn(&Order, &ExecutionEvent) + Send + Sync>;
type StatusHandler = Box<dyn Fn(&Order, OrderStatus) + Send + Sync>;

pub struct OrderEngine {
    rest_client: Arc<KrakenRestClient>,
    session_manager: Arc<SessionManager>,
    breaker: Arc<CircuitBreaker>,
    min_size: Arc<MinSizeLearner>,
    position_tracker: Arc<PositionTracker>,
    balance_ledger: Arc<BalanceLedger>,
    config: Arc<Config>,
    symbols: DashMap<String, Symbol>,
    orders: RwLock<HashMap<String, Order>>,
    execution_handlers: RwLock<Vec<ExecutionHandler>>,
    status_handlers: RwLock<Vec<StatusHandler>>,
}

impl OrderEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rest_client: Arc<KrakenRestClient>,
        session_manager: Arc<SessionManager>,
        breaker: Arc<CircuitBreaker>,
        min_size: Arc<MinSizeLearner>,
        position_tracker: Arc<PositionTracker>,
        balance_ledger: Arc<BalanceLedger>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rest_client,
            session_manager,
            breaker,
            min_size,
            position_tracker,
            balance_ledger,
            config,
            symbols: DashMap::new(),
            orders: RwLock::new(HashMap::new()),
            execution_handlers: RwLock::new(Vec::new()),
            status_handlers: RwLock::new(Vec::new()),
        })
    }

    /// Register a symbol's exchange-documented constraints, fetched once at
    /// startup via `KrakenRestClient::fetch_symbol_metadata`. An
    /// unregistered symbol skips tick/lot/minimum validation entirely rather
    /// than blocking submission on metadata this engine never received.
    pub fn register_symbol(&self, symbol: Symbol) {
        self.symbols.insert(symbol.pair(), symbol);
    }

    /// The registered tick/lot/minimum constraints for `symbol`, if any were
    /// fetched at startup. Used by the orchestrator to size a signal before
    /// ever calling `submit`.
    pub fn symbol_info(&self, symbol: &str) -> Option<Symbol> {
        self.symbols.get(symbol).map(|s| s.clone())
    }

    pub fn register_execution_handler(&self, handler: ExecutionHandler) {
        self.execution_handlers.write().push(handler);
    }

    pub fn register_status_handler(&self, handler: StatusHandler) {
        self.status_handlers.write().push(handler);
    }

    pub fn status(&self, client_order_id: &str) -> Option<Order> {
        self.orders.read().get(client_order_id).cloned()
    }

    /// Orders this engine still considers open, for reconciliation against
    /// the exchange's own open-orders view.
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Submit a new order, generating a fresh client-order-id. Returns the
    /// tracked [`Order`] either way; callers distinguish success from
    /// rejection via its `status`.
    pub async fn submit(&self, request: OrderRequest) -> Result<Order, CoreError> {
        let client_order_id = Uuid::new_v4().to_string();
        self.submit_with_id(client_order_id, request, false).await
    }

    /// Validate, track, and transmit `request` under `client_order_id`.
    /// `refreshed_balance` guards the one-time balance refresh-and-recheck on
    /// an insufficient-funds rejection so this never loops more than once.
    fn submit_with_id<'a>(
        &'a self,
        client_order_id: String,
        request: OrderRequest,
        refreshed_balance: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Order, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            if self.min_size.is_blacklisted(&request.symbol) {
                return Err(CoreError::MinSizeViolation(format!(
                    "{} is blacklisted after repeated minimum-size rejections",
                    request.symbol
                )));
            }

            if let Some(symbol) = self.symbols.get(&request.symbol) {
                if request.quantity < symbol.min_quantity {
                    return Err(CoreError::MinSizeViolation(format!(
                        "{} quantity {} is below the documented minimum {}",
                        request.symbol, request.quantity, symbol.min_quantity
                    )));
                }
                if let Some(price) = request.price {
                    let notional = request.quantity * price;
                    if notional < symbol.min_notional {
                        return Err(CoreError::MinSizeViolation(format!(
                            "{} notional {} is below the documented minimum {}",
                            request.symbol, notional, symbol.min_notional
                        )));
                    }
                }
            }

            if let Some((asset, required)) = self.required_balance(&request) {
                let free = self.balance_ledger.get(&asset).map(|e| e.free).unwrap_or(Decimal::ZERO);
                if free < required {
                    if !refreshed_balance {
                        warn!(asset, free = %free, required = %required, "insufficient free balance, refreshing once before rejecting");
                        let _ = self.balance_ledger.force_refresh().await;
                        return self.submit_with_id(client_order_id, request, true).await;
                    }
                    return Err(CoreError::Business(format!(
                        "insufficient free {asset} balance: have {free}, need {required}"
                    )));
                }
            }

            if !self.breaker.can_execute("orders") {
                return Err(CoreError::Transient("orders circuit breaker is open".to_string()));
            }

            if self.orders.read().get(&client_order_id).is_none() {
                let now = chrono::Utc::now().timestamp_millis();
                let order = Order {
                    client_order_id: client_order_id.clone(),
                    exchange_order_id: None,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    order_type: request.order_type,
                    quantity: request.quantity,
                    price: request.price,
                    stop: request.stop,
                    tif: request.time_in_force,
                    post_only: request.post_only,
                    reduce_only: request.reduce_only,
                    status: OrderStatus::Pending,
                    filled_quantity: Decimal::ZERO,
                    remaining_qty: request.quantity,
                    avg_fill_price: Decimal::ZERO,
                    fees: Decimal::ZERO,
                    created_at_ms: now,
                    updated_at_ms: now,
                    error: None,
                };
                self.orders.write().insert(client_order_id.clone(), order);
            }

            let intended_notional = request.price.unwrap_or(Decimal::ZERO) * request.quantity;

            match self.send_via_preferred_transport(&client_order_id, &request).await {
                Ok(ack) => {
                    self.breaker.on_success("orders");
                    self.min_size.record_success(&request.symbol).await;
                    Ok(self.update_status(&client_order_id, OrderStatus::Open, ack.exchange_order_id))
                }
                Err(err) => {
                    self.breaker.on_failure("orders");
                    if matches!(err, CoreError::MinSizeViolation(_)) {
                        self.min_size
                            .record_rejection(
                                &request.symbol,
                                request.quantity,
                                request.price.unwrap_or(Decimal::ZERO),
                                intended_notional,
                                err.to_string(),
                            )
                            .await;
                    }
                    self.mark_rejected(&client_order_id, err.to_string());
                    Err(err)
                }
            }
        })
    }

    /// The asset and amount a submission would consume from the free
    /// balance, if known. A buy needs a live price to size a quote-asset
    /// requirement; a market buy with no price quoted isn't checked here and
    /// relies on the exchange's own rejection instead.
    fn required_balance(&self, request: &OrderRequest) -> Option<(String, Decimal)> {
        let (base, quote) = request.symbol.split_once('/')?;
        match request.side {
            Side::Buy => {
                let price = request.price?;
                Some((quote.to_string(), request.quantity * price))
            }
            Side::Sell => Some((base.to_string(), request.quantity)),
        }
    }

    /// Prefer the private WebSocket's `add_order` RPC; on any failure
    /// (connection not up, ack timeout, rejection over that transport) fall
    /// back to REST's `AddOrder` once.
    async fn send_via_preferred_transport(&self, client_order_id: &str, request: &OrderRequest) -> Result<AddOrderAck, CoreError> {
        if self.config.websocket.enabled && self.session_manager.has_active_private_connection() {
            match self.send_via_ws(client_order_id, request).await {
                Ok(ack) => return Ok(ack),
                Err(e) => warn!(client_order_id, error = %e, "WS add_order failed, retrying over REST"),
            }
        }
        self.send_via_rest(client_order_id, request).await
    }

    async fn send_via_ws(&self, client_order_id: &str, request: &OrderRequest) -> Result<AddOrderAck, CoreError> {
        let mut params = serde_json::json!({
            "order_type": order_type_str(request.order_type),
            "side": side_str(request.side),
            "order_qty": request.quantity.to_string(),
            "symbol": request.symbol,
            "cl_ord_id": client_order_id,
            "post_only": request.post_only,
            "reduce_only": request.reduce_only,
        });
        if let Some(price) = request.price {
            params["limit_price"] = serde_json::json!(price.to_string());
        }
        if let Some(stop) = request.stop {
            params["stop_price"] = serde_json::json!(stop.to_string());
        }
        if request.time_in_force == TimeInForce::ImmediateOrCancel {
            params["time_in_force"] = serde_json::json!("ioc");
        }

        let event = self
            .session_manager
            .send_private_rpc("add_order", params)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        match event {
            RouterEvent::MethodResponse { success: true, result, .. } => {
                let exchange_order_id = result.as_ref().and_then(|r| r.get("order_id")).and_then(|v| v.as_str()).map(str::to_string);
                Ok(AddOrderAck { exchange_order_id })
            }
            RouterEvent::MethodResponse { success: false, error, .. } => Err(classify_kraken_error(&error.unwrap_or_default())),
            _ => Err(CoreError::ProtocolViolation("unexpected response to add_order".to_string())),
        }
    }

    async fn send_via_rest(&self, client_order_id: &str, request: &OrderRequest) -> Result<AddOrderAck, CoreError> {
        let mut form = vec![
            ("pair".to_string(), request.symbol.replace('/', "")),
            ("type".to_string(), request.side.to_string()),
            ("ordertype".to_string(), order_type_str(request.order_type).to_string()),
            ("volume".to_string(), request.quantity.to_string()),
            ("cl_ord_id".to_string(), client_order_id.to_string()),
        ];
        if let Some(price) = request.price {
            form.push(("price".to_string(), price.to_string()));
        }
        if let Some(stop) = request.stop {
            form.push(("price2".to_string(), stop.to_string()));
        }
        if request.time_in_force == TimeInForce::ImmediateOrCancel {
            form.push(("timeinforce".to_string(), "IOC".to_string()));
        }
        if request.post_only {
            form.push(("oflags".to_string(), "post".to_string()));
        }
        if request.reduce_only {
            form.push(("reduce_only".to_string(), "true".to_string()));
        }

        #[derive(serde::Deserialize)]
        struct AddOrderResult {
            #[serde(default)]
            txid: Vec<String>,
        }

        let result: AddOrderResult = self.rest_client.post_private(endpoints::ADD_ORDER, form).await?;
        Ok(AddOrderAck {
            exchange_order_id: result.txid.into_iter().next(),
        })
    }

    pub async fn cancel(&self, client_order_id: &str) -> Result<(), CoreError> {
        let exchange_id = self
            .orders
            .read()
            .get(client_order_id)
            .and_then(|o| o.exchange_order_id.clone())
            .ok_or_else(|| CoreError::Business(format!("unknown order {client_order_id}")))?;

        if !self.breaker.can_execute("orders") {
            return Err(CoreError::Transient("orders circuit breaker is open".to_string()));
        }

        let form = vec![("txid".to_string(), exchange_id)];
        let result: Result<serde_json::Value, CoreError> = self.rest_client.post_private(endpoints::CANCEL_ORDER, form).await;

        match result {
            Ok(_) => {
                self.breaker.on_success("orders");
                self.update_status(client_order_id, OrderStatus::Cancelled, None);
                Ok(())
            }
            Err(err) => {
                self.breaker.on_failure("orders");
                Err(err)
            }
        }
    }

    /// Amend quantity/price in place. Kraken's `AmendOrder` endpoint can
    /// reject combinations it doesn't support; on any failure this falls
    /// back to cancel-and-resubmit, since a guaranteed-successful amend
    /// isn't available for every order state.
    pub async fn amend(&self, client_order_id: &str, new_quantity: Decimal, new_price: Option<Decimal>) -> Result<Order, CoreError> {
        let existing = self
            .orders
            .read()
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| CoreError::Business(format!("unknown order {client_order_id}")))?;

        let exchange_id = existing
            .exchange_order_id
            .clone()
            .ok_or_else(|| CoreError::Business("order has no exchange id yet".to_string()))?;

        let mut form = vec![("txid".to_string(), exchange_id), ("order_qty".to_string(), new_quantity.to_string())];
        if let Some(price) = new_price {
            form.push(("limit_price".to_string(), price.to_string()));
        }

        let amend_result: Result<serde_json::Value, CoreError> = self.rest_client.post_private(endpoints::AMEND_ORDER, form).await;

        if amend_result.is_ok() {
            self.breaker.on_success("orders");
            let mut guard = self.orders.write();
            if let Some(order) = guard.get_mut(client_order_id) {
                order.quantity = new_quantity;
                order.remaining_qty = (new_quantity - order.filled_quantity).max(Decimal::ZERO);
                order.price = new_price.or(order.price);
                order.updated_at_ms = chrono::Utc::now().timestamp_millis();
                return Ok(order.clone());
            }
        }

        warn!(client_order_id, "amend failed, falling back to cancel-and-resubmit");
        self.cancel(client_order_id).await?;
        self.submit(OrderRequest {
            symbol: existing.symbol,
            side: existing.side,
            order_type: existing.order_type,
            quantity: new_quantity,
            price: new_price.or(existing.price),
            stop: existing.stop,
            time_in_force: TimeInForce::GoodTilCancelled,
            post_only: existing.post_only,
            reduce_only: existing.reduce_only,
        })
        .await
    }

    /// Apply a WS execution push: updates the tracked order's status and
    /// fill quantities, feeds the fill and its fee into the position
    /// tracker, and notifies registered handlers.
    pub async fn on_execution(&self, event: ExecutionEvent) {
        let client_order_id = {
            let guard = self.orders.read();
            guard
                .values()
                .find(|o| o.exchange_order_id.as_deref() == Some(event.order_id.as_str()))
                .map(|o| o.client_order_id.clone())
        };

        let Some(client_order_id) = client_order_id else {
            warn!(order_id = %event.order_id, "execution event for unknown order");
            return;
        };

        let next_status = parse_kraken_order_status(&event.order_status);

        let order_snapshot = {
            let mut guard = self.orders.write();
            let Some(order) = guard.get_mut(&client_order_id) else {
                return;
            };

            if let Some(status) = next_status {
                if order.status.can_transition_to(status) {
                    order.status = status;
                } else {
                    warn!(client_order_id, from = ?order.status, to = ?status, "ignoring invalid order status transition");
                }
            }

            if let (Some(qty), Some(price)) = (event.last_qty, event.last_price) {
                order.filled_quantity += qty;
                order.remaining_qty = (order.quantity - order.filled_quantity).max(Decimal::ZERO);
                order.avg_fill_price = price;
            }
            if let Some(fee) = event.fee {
                order.fees += fee;
            }
            order.updated_at_ms = chrono::Utc::now().timestamp_millis();
            order.clone()
        };

        if let (Some(qty), Some(price)) = (event.last_qty, event.last_price) {
            self.position_tracker
                .apply_fill(&order_snapshot.symbol, order_snapshot.side, qty, price, event.fee.unwrap_or(Decimal::ZERO))
                .await;
        }

        for handler in self.execution_handlers.read().iter() {
            handler(&order_snapshot, &event);
        }
        if let Some(status) = next_status {
            for handler in self.status_handlers.read().iter() {
                handler(&order_snapshot, status);
            }
        }

        info!(client_order_id, status = ?order_snapshot.status, filled = %order_snapshot.filled_quantity, remaining = %order_snapshot.remaining_qty, "order updated from execution event");
    }

    fn update_status(&self, client_order_id: &str, status: OrderStatus, exchange_id: Option<String>) -> Order {
        let mut guard = self.orders.write();
        let order = guard.get_mut(client_order_id).expect("order was inserted before update_status is called");
        if order.status.can_transition_to(status) {
            order.status = status;
        }
        if exchange_id.is_some() {
            order.exchange_order_id = exchange_id;
        }
        order.updated_at_ms = chrono::Utc::now().timestamp_millis();
        order.clone()
    }

    fn mark_rejected(&self, client_order_id: &str, error: String) {
        let mut guard = self.orders.write();
        if let Some(order) = guard.get_mut(client_order_id) {
            if order.status.can_transition_to(OrderStatus::Rejected) {
                order.status = OrderStatus::Rejected;
            }
            order.error = Some(error);
            order.updated_at_ms = chrono::Utc::now().timestamp_millis();
        }
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::StopLoss => "stop-loss",
        OrderType::TakeProfit => "take-profit",
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn parse_kraken_order_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "pending" => Some(OrderStatus::Pending),
        "new" | "open" => Some(OrderStatus::Open),
        "partially_filled" => Some(OrderStatus::PartiallyFilled),
        "filled" => Some(OrderStatus::Filled),
        "canceled" | "cancelled" => Some(OrderStatus::Cancelled),
        "rejected" => Some(OrderStatus::Rejected),
        "expired" => Some(OrderStatus::Expired),
        _ => None,
    }
}
