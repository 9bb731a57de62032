// =============================================================================
// Shared domain types for the execution core
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Paper vs. live trading. Persisted in `operation_mode.json`; threaded into
/// every event record. Default is paper — an operator must explicitly
/// promote to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Paper,
    Live,
}

impl Default for OperationMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Direction of a position (long or short).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Strategy document posture — governs whether entries fire at all and
/// whether every open position should be unwound immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Aggressive,
    Moderate,
    Defensive,
    Flat,
    ExitAll,
}

/// How a position's entry order is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Market,
    Limit,
    Conditional,
}

/// Origin of an open position — distinguishes positions the strategy opened
/// itself from ones discovered on the exchange during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionOrigin {
    Strategy,
    Reconciled,
    External,
}

/// Why a position was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLossHard,
    StopLossTrailing,
    TakeProfitTarget(usize),
    TimeExit,
    Invalidation,
    ExitAll,
    ReconciledMissing,
    SafeModeClose,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLossHard => write!(f, "stop_loss_hard"),
            Self::StopLossTrailing => write!(f, "stop_loss_trailing"),
            Self::TakeProfitTarget(n) => write!(f, "take_profit_target_{n}"),
            Self::TimeExit => write!(f, "time_exit"),
            Self::Invalidation => write!(f, "invalidation"),
            Self::ExitAll => write!(f, "exit_all"),
            Self::ReconciledMissing => write!(f, "reconciled_missing"),
            Self::SafeModeClose => write!(f, "safe_mode_close"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Non-terminal statuses are the ones a duplicate dispatch check must
    /// treat as "already in flight" for a given strategy-position-id.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// Side of an order (maps 1:1 to direction at entry, inverse at exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type as understood by the exchange adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// A single take-profit target: close `close_pct` of the position at `price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: Decimal,
    pub close_pct: Decimal,
}

/// Stop-loss specification: either a fixed price or a trailing percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StopLoss {
    Hard { price: Decimal },
    Trailing { trail_pct: Decimal },
}

/// Portfolio-level risk limits carried by a strategy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRisk {
    pub max_drawdown_pct: Decimal,
    pub daily_loss_limit_usd: Decimal,
    pub max_total_exposure_pct: Decimal,
    pub max_per_position_pct: Decimal,
}

/// One logical position within a strategy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPosition {
    pub id: String,
    pub asset: String,
    pub direction: Direction,
    pub allocation_pct: Decimal,
    pub entry_type: EntryType,
    #[serde(default)]
    pub entry_condition: Option<String>,
    #[serde(default)]
    pub entry_limit_price: Option<Decimal>,
    #[serde(default)]
    pub take_profit_targets: Vec<TakeProfitTarget>,
    pub stop_loss: StopLoss,
    #[serde(default)]
    pub time_exit_utc: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub invalidation_condition: Option<String>,
}

/// The strategy document as read from `strategy.json`. Immutable once
/// loaded; a new document entirely replaces the active one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDocument {
    pub mode: OperationMode,
    pub validity_window: chrono::DateTime<chrono::Utc>,
    pub posture: Posture,
    pub portfolio_risk: PortfolioRisk,
    pub positions: Vec<StrategyPosition>,
}

/// An open position owned exclusively by the Position Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: String,
    pub strategy_position_id: String,
    pub strategy_id: String,
    pub asset: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub trailing_stop_price: Option<Decimal>,
    #[serde(default)]
    pub take_profit_targets_hit: Vec<usize>,
    pub origin: PositionOrigin,
    #[serde(skip)]
    pub current_price: Decimal,
    #[serde(skip)]
    pub unrealized_pnl: Decimal,
}

impl OpenPosition {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.current_price
    }

    pub fn update_unrealized_pnl(&mut self, mid: Decimal) {
        self.current_price = mid;
        self.unrealized_pnl = match self.direction {
            Direction::Long => (mid - self.average_entry_price) * self.quantity,
            Direction::Short => (self.average_entry_price - mid) * self.quantity,
        };
    }
}

/// An immutable, append-only record of a closed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: String,
    pub strategy_position_id: String,
    pub strategy_id: String,
    pub asset: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
    pub exit_price: Decimal,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    pub closed_at: chrono::DateTime<chrono::Utc>,
    pub exit_reason: ExitReason,
    pub realized_pnl: Decimal,
}

impl ClosedTrade {
    /// Build a closed trade snapshot from an open position at close time.
    pub fn from_open(position: &OpenPosition, exit_price: Decimal, reason: ExitReason) -> Self {
        let realized_pnl = match position.direction {
            Direction::Long => (exit_price - position.average_entry_price) * position.quantity,
            Direction::Short => (position.average_entry_price - exit_price) * position.quantity,
        };
        Self {
            id: position.id.clone(),
            strategy_position_id: position.strategy_position_id.clone(),
            strategy_id: position.strategy_id.clone(),
            asset: position.asset.clone(),
            direction: position.direction,
            quantity: position.quantity,
            average_entry_price: position.average_entry_price,
            exit_price,
            opened_at: position.opened_at,
            closed_at: chrono::Utc::now(),
            exit_reason: reason,
            realized_pnl,
        }
    }
}

/// What an order's fill should do to the Position Registry: open/grow a
/// position, or close a slice of an existing one for a specific reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIntent {
    Entry,
    Exit { position_id: String, exit_reason: ExitReason },
}

/// A tracked order, owned by the Order Router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub internal_id: String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub asset: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_quantity: Decimal,
    #[serde(default)]
    pub average_fill_price: Decimal,
    pub strategy_position_id: String,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub intent: OrderIntent,
}

impl OrderRecord {
    pub fn is_full_fill(&self) -> bool {
        self.filled_quantity >= self.quantity
    }
}

/// A per-asset market snapshot: best bid/ask and computed indicators.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketSnapshot {
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub indicators: std::collections::HashMap<String, Decimal>,
}

impl MarketSnapshot {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::new(2, 0)
    }
}

/// Exchange-side account balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available_usd: Decimal,
    #[serde(default)]
    pub per_asset_qty: std::collections::HashMap<String, Decimal>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// A position as reported directly by the exchange (used by reconciliation).
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub asset: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
}
