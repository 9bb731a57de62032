// =============================================================================
// Exchange Adapter — capability interface + two variants
// =============================================================================
//
// The core depends only on this trait. `live` speaks the same signed-REST +
// WebSocket scheme this repository's Binance client already implements;
// `paper` simulates fills with slippage and commission against a cached
// market snapshot, in the spirit of a demo-mode execution path.
// =============================================================================

pub mod live;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::errors::ExchangeAdapterError;
use crate::types::{AccountBalance, ExchangePosition, OrderSide, OrderType};

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub idempotency_key: String,
    pub asset: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct OrderAcknowledgement {
    pub exchange_order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub status: RemoteOrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelResult {
    pub success: bool,
    pub error: Option<String>,
}

/// A single market tick delivered to `subscribe_market_data` callbacks.
#[derive(Debug, Clone)]
pub struct MarketTick {
    pub asset: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Capability set the execution core depends on. The live and paper variants
/// below are the only two implementations; callers never reach past this
/// trait into adapter-specific state.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<OrderAcknowledgement, ExchangeAdapterError>;

    async fn cancel_order(&self, exchange_id: &str) -> Result<CancelResult, ExchangeAdapterError>;

    async fn get_order_status(
        &self,
        exchange_id: &str,
    ) -> Result<OrderStatusReport, ExchangeAdapterError>;

    async fn get_account_balance(&self) -> Result<AccountBalance, ExchangeAdapterError>;

    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeAdapterError>;

    fn is_rate_limited(&self) -> bool;

    fn rate_limit_resumes_at(&self) -> Option<DateTime<Utc>>;
}
