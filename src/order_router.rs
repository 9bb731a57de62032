// =============================================================================
// Order Router — in-flight order map, idempotent dispatch, fill application
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::warn;

use crate::event_log::{EventLog, ExecutionEvent};
use crate::exchange::{CancelResult, ExchangeAdapter, OrderAcknowledgement, PlaceOrderRequest, RemoteOrderStatus};
use crate::failure_tracker::FailureTracker;
use crate::position_registry::PositionRegistry;
use crate::safe_mode::SafeModeController;
use crate::types::{OperationMode, OrderIntent, OrderRecord, OrderSide, OrderStatus, OrderType, PositionOrigin};

pub struct OrderRouter {
    orders: RwLock<HashMap<String, OrderRecord>>,
    exchange: Arc<dyn ExchangeAdapter>,
    registry: Arc<PositionRegistry>,
    event_log: Arc<EventLog>,
    failure_tracker: Arc<FailureTracker>,
    safe_mode: Arc<SafeModeController>,
}

impl OrderRouter {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        registry: Arc<PositionRegistry>,
        event_log: Arc<EventLog>,
        failure_tracker: Arc<FailureTracker>,
        safe_mode: Arc<SafeModeController>,
    ) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            exchange,
            registry,
            event_log,
            failure_tracker,
            safe_mode,
        }
    }

    fn has_active_order_for(&self, strategy_position_id: &str) -> bool {
        self.orders
            .read()
            .values()
            .any(|o| o.strategy_position_id == strategy_position_id && !o.status.is_terminal())
    }

    /// Public view of the idempotency check, for evaluators that want to
    /// skip sizing/condition work before even attempting a dispatch.
    pub fn has_active_order(&self, strategy_position_id: &str) -> bool {
        self.has_active_order_for(strategy_position_id)
    }

    /// Place a new order — entry or exit, distinguished by `intent`. Returns
    /// `None` without contacting the exchange if an active order already
    /// exists for this `strategy_position_id` — the router's idempotency
    /// guarantee against duplicate dispatch from tick races.
    pub async fn place_entry_order(
        &self,
        asset: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        limit_price: Option<Decimal>,
        strategy_position_id: &str,
        intent: OrderIntent,
        mode: OperationMode,
    ) -> Option<OrderRecord> {
        if self.has_active_order_for(strategy_position_id) {
            return None;
        }

        if self.exchange.is_rate_limited() {
            return None;
        }

        let internal_id = uuid::Uuid::new_v4().to_string();
        let mut record = OrderRecord {
            internal_id: internal_id.clone(),
            exchange_order_id: None,
            asset: asset.to_string(),
            side,
            order_type,
            quantity,
            limit_price,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            strategy_position_id: strategy_position_id.to_string(),
            position_id: None,
            rejection_reason: None,
            intent,
        };
        self.orders.write().insert(internal_id.clone(), record.clone());

        let request = PlaceOrderRequest {
            idempotency_key: internal_id.clone(),
            asset: asset.to_string(),
            side,
            order_type,
            quantity,
            limit_price,
        };

        match self.exchange.place_order(request).await {
            Ok(OrderAcknowledgement { exchange_order_id }) => {
                record.exchange_order_id = Some(exchange_order_id.clone());
                record.status = OrderStatus::Open;
                self.orders.write().insert(internal_id.clone(), record.clone());
                self.event_log.append(ExecutionEvent::new(
                    "order_placed",
                    mode,
                    serde_json::json!({
                        "internal_id": internal_id,
                        "exchange_order_id": exchange_order_id,
                        "asset": asset,
                        "side": side,
                        "quantity": quantity,
                    }),
                ));
                self.failure_tracker.record_success();
                Some(record)
            }
            Err(e) => {
                record.status = OrderStatus::Rejected;
                record.rejection_reason = Some(e.to_string());
                self.orders.write().insert(internal_id.clone(), record.clone());
                self.event_log.append(ExecutionEvent::new(
                    "order_rejected",
                    mode,
                    serde_json::json!({
                        "internal_id": internal_id,
                        "asset": asset,
                        "reason": e.to_string(),
                    }),
                ));

                if e.is_authentication() {
                    self.safe_mode
                        .activate("authentication_failure", &self.registry, self, mode)
                        .await;
                } else if e.counts_as_failure() && self.failure_tracker.record_failure() {
                    self.safe_mode
                        .activate("consecutive_failures", &self.registry, self, mode)
                        .await;
                }

                Some(record)
            }
        }
    }

    /// Apply a fill event for `exchange_order_id`. Never panics on an
    /// unknown order — just warns and returns. `filled_qty` is the
    /// incremental amount filled by this event, not the cumulative total.
    pub fn apply_fill(
        &self,
        exchange_order_id: &str,
        filled_qty: Decimal,
        fill_price: Decimal,
        strategy_id: &str,
        mode: OperationMode,
    ) {
        let internal_id = {
            let orders = self.orders.read();
            match orders.values().find(|o| o.exchange_order_id.as_deref() == Some(exchange_order_id)) {
                Some(o) => o.internal_id.clone(),
                None => {
                    warn!(exchange_order_id, "order router: fill for unknown order");
                    return;
                }
            }
        };

        let (is_full, record) = {
            let mut orders = self.orders.write();
            let order = orders.get_mut(&internal_id).expect("located by internal_id above");

            let new_filled = order.filled_quantity + filled_qty;
            order.average_fill_price = if new_filled > Decimal::ZERO {
                (order.filled_quantity * order.average_fill_price + filled_qty * fill_price) / new_filled
            } else {
                fill_price
            };
            order.filled_quantity = new_filled;

            let is_full = order.is_full_fill();
            if is_full {
                order.status = OrderStatus::Filled;
            } else {
                order.status = OrderStatus::PartiallyFilled;
            }
            (is_full, order.clone())
        };

        match &record.intent {
            OrderIntent::Entry => match self.registry.find_by_strategy_position(&record.strategy_position_id) {
                Some(existing) => {
                    self.registry.apply_partial_fill(&existing.id, filled_qty, fill_price);
                }
                None => {
                    let direction = match record.side {
                        OrderSide::Buy => crate::types::Direction::Long,
                        OrderSide::Sell => crate::types::Direction::Short,
                    };
                    let position = self.registry.open_position(
                        &record.strategy_position_id,
                        strategy_id,
                        &record.asset,
                        direction,
                        filled_qty,
                        fill_price,
                        PositionOrigin::Strategy,
                        mode,
                    );
                    if let Some(o) = self.orders.write().get_mut(&internal_id) {
                        o.position_id = Some(position.id);
                    }
                }
            },
            OrderIntent::Exit { position_id, exit_reason } => {
                self.registry
                    .close_position(position_id, filled_qty, fill_price, exit_reason.clone(), mode);
            }
        }

        self.event_log.append(ExecutionEvent::new(
            if is_full { "order_filled" } else { "order_partially_filled" },
            mode,
            serde_json::json!({
                "internal_id": internal_id,
                "exchange_order_id": exchange_order_id,
                "filled_quantity": filled_qty,
                "fill_price": fill_price,
            }),
        ));
    }

    /// Poll the exchange for every order still in flight and apply any newly
    /// observed fills. Driven by the main tick loop — the adapters used here
    /// never push fills on their own, so someone has to ask.
    pub async fn poll_fills(&self, strategy_id: &str, mode: OperationMode) {
        let in_flight: Vec<(String, Decimal)> = self
            .orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter_map(|o| o.exchange_order_id.clone().map(|eid| (eid, o.filled_quantity)))
            .collect();

        for (exchange_id, already_filled) in in_flight {
            match self.exchange.get_order_status(&exchange_id).await {
                Ok(report) => {
                    let delta = report.filled_qty - already_filled;
                    if delta > Decimal::ZERO {
                        self.apply_fill(&exchange_id, delta, report.avg_fill_price, strategy_id, mode);
                    }
                    if matches!(report.status, RemoteOrderStatus::Cancelled | RemoteOrderStatus::Rejected) {
                        let mut orders = self.orders.write();
                        if let Some(order) = orders.values_mut().find(|o| o.exchange_order_id.as_deref() == Some(exchange_id.as_str())) {
                            order.status = match report.status {
                                RemoteOrderStatus::Cancelled => OrderStatus::Cancelled,
                                _ => OrderStatus::Rejected,
                            };
                        }
                    }
                }
                Err(e) => warn!(exchange_id, error = %e, "order router: poll_fills status lookup failed"),
            }
        }
    }

    pub async fn cancel_order(&self, internal_id: &str, mode: OperationMode) -> Option<CancelResult> {
        let exchange_order_id = {
            let orders = self.orders.read();
            orders.get(internal_id)?.exchange_order_id.clone()?
        };

        let result = self.exchange.cancel_order(&exchange_order_id).await.ok()?;
        if result.success {
            if let Some(order) = self.orders.write().get_mut(internal_id) {
                order.status = OrderStatus::Cancelled;
            }
            self.event_log.append(ExecutionEvent::new(
                "order_cancelled",
                mode,
                serde_json::json!({ "internal_id": internal_id }),
            ));
        }
        Some(result)
    }

    pub fn get_order(&self, internal_id: &str) -> Option<OrderRecord> {
        self.orders.read().get(internal_id).cloned()
    }

    /// Pending (non-terminal) orders, keyed by strategy-position-id — used
    /// to cancel outstanding limit orders when a strategy expires.
    pub fn pending_orders(&self) -> Vec<OrderRecord> {
        self.orders.read().values().filter(|o| !o.status.is_terminal()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchangeAdapter;
    use crate::types::MarketSnapshot;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;

    fn router() -> OrderRouter {
        let dir = std::env::temp_dir().join(format!("order-router-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        let registry = Arc::new(PositionRegistry::new(dir.clone(), log.clone()));
        let failure_tracker = Arc::new(FailureTracker::new(dir.join("failure_count.json"), 3));
        let safe_mode = Arc::new(SafeModeController::new(dir.join("safe_mode.json"), log.clone()));

        let mut snaps = StdHashMap::new();
        snaps.insert(
            "BTC/USD".to_string(),
            MarketSnapshot { bid: dec!(49990), ask: dec!(50010), timestamp: None, indicators: StdHashMap::new() },
        );
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(PaperExchangeAdapter::new(
            dec!(10000),
            dec!(0.001),
            dec!(0.0005),
            Arc::new(RwLock::new(snaps)),
        ));

        OrderRouter::new(exchange, registry, log, failure_tracker, safe_mode)
    }

    #[tokio::test]
    async fn duplicate_dispatch_for_same_strategy_position_is_prevented() {
        let router = router();
        let first = router
            .place_entry_order(
                "BTC/USD",
                OrderSide::Buy,
                OrderType::Market,
                dec!(0.01),
                None,
                "sp1",
                OrderIntent::Entry,
                OperationMode::Paper,
            )
            .await;
        assert!(first.is_some());

        // paper fills immediately on the adapter side, but the router only
        // marks the record `filled` once `apply_fill` runs — so while it
        // still reads `open` a second dispatch for the same
        // strategy_position_id is blocked.
        let second = router
            .place_entry_order(
                "BTC/USD",
                OrderSide::Buy,
                OrderType::Market,
                dec!(0.01),
                None,
                "sp1",
                OrderIntent::Entry,
                OperationMode::Paper,
            )
            .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn apply_fill_opens_a_new_position_on_first_fill() {
        let router = router();
        let record = router
            .place_entry_order(
                "BTC/USD",
                OrderSide::Buy,
                OrderType::Market,
                dec!(0.01),
                None,
                "sp1",
                OrderIntent::Entry,
                OperationMode::Paper,
            )
            .await
            .unwrap();
        let exchange_id = record.exchange_order_id.unwrap();
        router.apply_fill(&exchange_id, dec!(0.01), dec!(50005), "strat-hash", OperationMode::Paper);

        let position = router.registry.find_by_strategy_position("sp1");
        assert!(position.is_some());
    }

    #[tokio::test]
    async fn exit_intent_fill_closes_the_position() {
        let router = router();
        let position = router.registry.open_position(
            "sp1",
            "strat-hash",
            "BTC/USD",
            crate::types::Direction::Long,
            dec!(0.02),
            dec!(50000),
            PositionOrigin::Strategy,
            OperationMode::Paper,
        );

        let record = router
            .place_entry_order(
                "BTC/USD",
                OrderSide::Sell,
                OrderType::Market,
                dec!(0.02),
                None,
                "sp1_exit",
                OrderIntent::Exit { position_id: position.id.clone(), exit_reason: crate::types::ExitReason::Manual },
                OperationMode::Paper,
            )
            .await
            .unwrap();
        let exchange_id = record.exchange_order_id.unwrap();
        router.apply_fill(&exchange_id, dec!(0.02), dec!(50100), "strat-hash", OperationMode::Paper);

        assert!(router.registry.get_open_position(&position.id).is_none());
        assert_eq!(router.registry.get_closed_trades(1).len(), 1);
    }

    struct RateLimitedStub;

    #[async_trait::async_trait]
    impl ExchangeAdapter for RateLimitedStub {
        async fn place_order(&self, _request: PlaceOrderRequest) -> Result<OrderAcknowledgement, crate::errors::ExchangeAdapterError> {
            panic!("should never be called while rate limited");
        }
        async fn cancel_order(&self, _exchange_order_id: &str) -> Result<CancelResult, crate::errors::ExchangeAdapterError> {
            unimplemented!()
        }
        async fn get_order_status(&self, _exchange_order_id: &str) -> Result<crate::exchange::OrderStatusReport, crate::errors::ExchangeAdapterError> {
            unimplemented!()
        }
        async fn get_account_balance(&self) -> Result<crate::types::AccountBalance, crate::errors::ExchangeAdapterError> {
            unimplemented!()
        }
        async fn get_open_positions(&self) -> Result<Vec<crate::types::ExchangePosition>, crate::errors::ExchangeAdapterError> {
            unimplemented!()
        }
        fn is_rate_limited(&self) -> bool {
            true
        }
        fn rate_limit_resumes_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            Some(chrono::Utc::now() + chrono::Duration::seconds(30))
        }
    }

    #[tokio::test]
    async fn rate_limited_adapter_suspends_new_placements() {
        let dir = std::env::temp_dir().join(format!("order-router-ratelimit-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        let registry = Arc::new(PositionRegistry::new(dir.clone(), log.clone()));
        let failure_tracker = Arc::new(FailureTracker::new(dir.join("failure_count.json"), 3));
        let safe_mode = Arc::new(SafeModeController::new(dir.join("safe_mode.json"), log.clone()));
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(RateLimitedStub);
        let router = OrderRouter::new(exchange, registry, log, failure_tracker, safe_mode);

        let result = router
            .place_entry_order("BTC/USD", OrderSide::Buy, OrderType::Market, dec!(0.01), None, "sp1", OrderIntent::Entry, OperationMode::Paper)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn consecutive_rejections_trigger_safe_mode() {
        let dir = std::env::temp_dir().join(format!("order-router-failtrack-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        let registry = Arc::new(PositionRegistry::new(dir.clone(), log.clone()));
        let failure_tracker = Arc::new(FailureTracker::new(dir.join("failure_count.json"), 2));
        let safe_mode = Arc::new(SafeModeController::new(dir.join("safe_mode.json"), log.clone()));

        // no cached snapshot for this asset -> every placement is rejected
        // with NoMarketData, which counts as a failure.
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(PaperExchangeAdapter::new(
            dec!(10000),
            dec!(0.001),
            dec!(0.0005),
            Arc::new(RwLock::new(StdHashMap::new())),
        ));
        let router = OrderRouter::new(exchange, registry, log, failure_tracker.clone(), safe_mode.clone());

        router
            .place_entry_order("DOGE/USD", OrderSide::Buy, OrderType::Market, dec!(1), None, "sp1", OrderIntent::Entry, OperationMode::Paper)
            .await;
        assert!(!safe_mode.is_active());

        router
            .place_entry_order("DOGE/USD", OrderSide::Buy, OrderType::Market, dec!(1), None, "sp2", OrderIntent::Entry, OperationMode::Paper)
            .await;
        assert!(safe_mode.is_active());
    }
}
