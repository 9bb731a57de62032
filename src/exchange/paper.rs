// =============================================================================
// Paper Exchange Adapter — simulated fills with slippage + commission
// =============================================================================
//
// Grounded on this repository's existing demo-mode execution path: a market
// order fills immediately against the cached snapshot rather than going out
// over the network. Here that is generalized into a standalone adapter
// behind the same `ExchangeAdapter` trait the live adapter implements, so
// the Order Router never needs to know which mode it's talking to.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::errors::ExchangeAdapterError;
use crate::types::{AccountBalance, ExchangePosition, MarketSnapshot, OrderSide};

use super::{
    CancelResult, ExchangeAdapter, OrderAcknowledgement, OrderStatusReport, PlaceOrderRequest,
    RemoteOrderStatus,
};

struct FilledOrder {
    status: RemoteOrderStatus,
    filled_qty: Decimal,
    avg_fill_price: Decimal,
}

pub struct PaperExchangeAdapter {
    slippage_pct: Decimal,
    commission_rate: Decimal,
    initial_balance_usd: Decimal,
    snapshots: Arc<RwLock<HashMap<String, MarketSnapshot>>>,
    realized_notional: RwLock<Decimal>,
    next_order_id: AtomicU64,
    orders: RwLock<HashMap<String, FilledOrder>>,
}

impl PaperExchangeAdapter {
    pub fn new(
        initial_balance_usd: Decimal,
        slippage_pct: Decimal,
        commission_rate: Decimal,
        snapshots: Arc<RwLock<HashMap<String, MarketSnapshot>>>,
    ) -> Self {
        Self {
            slippage_pct,
            commission_rate,
            initial_balance_usd,
            snapshots,
            realized_notional: RwLock::new(Decimal::ZERO),
            next_order_id: AtomicU64::new(1),
            orders: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchangeAdapter {
    async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<OrderAcknowledgement, ExchangeAdapterError> {
        let snapshot = self
            .snapshots
            .read()
            .get(&request.asset)
            .cloned()
            .ok_or_else(|| ExchangeAdapterError::NoMarketData(request.asset.clone()))?;

        let mid = snapshot.mid();
        let direction_mult = match request.side {
            OrderSide::Buy => Decimal::ONE + self.slippage_pct,
            OrderSide::Sell => Decimal::ONE - self.slippage_pct,
        };
        let fill_price = mid * direction_mult;
        let notional = request.quantity * fill_price;
        let commission = request.quantity * fill_price * self.commission_rate;

        {
            let mut realized = self.realized_notional.write();
            *realized += match request.side {
                OrderSide::Buy => -(notional + commission),
                OrderSide::Sell => notional - commission,
            };
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let exchange_order_id = format!("paper-{order_id}");

        self.orders.write().insert(
            exchange_order_id.clone(),
            FilledOrder {
                status: RemoteOrderStatus::Filled,
                filled_qty: request.quantity,
                avg_fill_price: fill_price,
            },
        );

        Ok(OrderAcknowledgement { exchange_order_id })
    }

    async fn cancel_order(&self, exchange_id: &str) -> Result<CancelResult, ExchangeAdapterError> {
        // Paper fills are immediate, so there is never anything left to
        // cancel by the time this is called.
        if self.orders.read().contains_key(exchange_id) {
            Ok(CancelResult {
                success: false,
                error: Some("paper order already filled".to_string()),
            })
        } else {
            Err(ExchangeAdapterError::OrderNotFound(exchange_id.to_string()))
        }
    }

    async fn get_order_status(
        &self,
        exchange_id: &str,
    ) -> Result<OrderStatusReport, ExchangeAdapterError> {
        let orders = self.orders.read();
        let order = orders
            .get(exchange_id)
            .ok_or_else(|| ExchangeAdapterError::OrderNotFound(exchange_id.to_string()))?;
        Ok(OrderStatusReport {
            status: order.status,
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_fill_price,
            rejection_reason: None,
        })
    }

    async fn get_account_balance(&self) -> Result<AccountBalance, ExchangeAdapterError> {
        let available_usd = self.initial_balance_usd + *self.realized_notional.read();
        Ok(AccountBalance {
            available_usd,
            per_asset_qty: HashMap::new(),
            ts: Utc::now(),
        })
    }

    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeAdapterError> {
        // The paper adapter has no exchange-side position book independent
        // of the registry it fills for — reconciliation against it is
        // always a no-op, which is the expected behavior in paper mode.
        Ok(Vec::new())
    }

    fn is_rate_limited(&self) -> bool {
        false
    }

    fn rate_limit_resumes_at(&self) -> Option<chrono::DateTime<Utc>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot_map(asset: &str, bid: Decimal, ask: Decimal) -> Arc<RwLock<HashMap<String, MarketSnapshot>>> {
        let mut map = HashMap::new();
        map.insert(
            asset.to_string(),
            MarketSnapshot {
                bid,
                ask,
                timestamp: Some(Utc::now()),
                indicators: HashMap::new(),
            },
        );
        Arc::new(RwLock::new(map))
    }

    #[tokio::test]
    async fn buy_fills_above_mid_by_slippage() {
        let snapshots = snapshot_map("BTC/USD", dec!(49990), dec!(50010));
        let adapter = PaperExchangeAdapter::new(dec!(10000), dec!(0.001), dec!(0.0005), snapshots);

        let ack = adapter
            .place_order(PlaceOrderRequest {
                idempotency_key: "sp1".into(),
                asset: "BTC/USD".into(),
                side: OrderSide::Buy,
                order_type: crate::types::OrderType::Market,
                quantity: dec!(0.02),
                limit_price: None,
            })
            .await
            .unwrap();

        let status = adapter.get_order_status(&ack.exchange_order_id).await.unwrap();
        assert_eq!(status.status, RemoteOrderStatus::Filled);
        assert_eq!(status.avg_fill_price, dec!(50000) * (Decimal::ONE + dec!(0.001)));
    }

    #[tokio::test]
    async fn order_for_unknown_asset_rejected() {
        let snapshots = Arc::new(RwLock::new(HashMap::new()));
        let adapter = PaperExchangeAdapter::new(dec!(10000), dec!(0.001), dec!(0.0005), snapshots);
        let result = adapter
            .place_order(PlaceOrderRequest {
                idempotency_key: "sp1".into(),
                asset: "DOGE/USD".into(),
                side: OrderSide::Buy,
                order_type: crate::types::OrderType::Market,
                quantity: dec!(100),
                limit_price: None,
            })
            .await;
        assert!(matches!(result, Err(ExchangeAdapterError::NoMarketData(_))));
    }
}
