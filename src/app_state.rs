// =============================================================================
// Central Application State — Execution Service
// =============================================================================
//
// The single source of truth threaded into every axum handler. Each subsystem
// owns its own interior mutability (`PositionRegistry`, `RiskEnforcer`,
// `SafeModeController`, ...); AppState just holds `Arc` handles to all of them
// plus the version counter the WebSocket push loop polls.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::event_log::EventLog;
use crate::exchange::ExchangeAdapter;
use crate::failure_tracker::FailureTracker;
use crate::market_data::MarketDataHub;
use crate::operation_mode::OperationModeController;
use crate::order_router::OrderRouter;
use crate::position_registry::PositionRegistry;
use crate::risk::{RiskEnforcer, RiskState};
use crate::safe_mode::SafeModeController;
use crate::strategy_service::{LifecycleState, StrategyService};
use crate::types::OperationMode;

/// Central application state shared across all async tasks and HTTP handlers
/// via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation. The WebSocket feed uses this to detect
    /// changes and push updates.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,

    /// Instant when the service started. Used for uptime reporting.
    pub start_time: Instant,

    pub config: ServiceConfig,
    pub event_log: Arc<EventLog>,
    pub registry: Arc<PositionRegistry>,
    pub router: Arc<OrderRouter>,
    pub risk: Arc<RiskEnforcer>,
    pub safe_mode: Arc<SafeModeController>,
    pub failure_tracker: Arc<FailureTracker>,
    pub mode_controller: Arc<OperationModeController>,
    pub market: Arc<MarketDataHub>,
    pub strategy_service: Arc<StrategyService>,
    pub exchange: Arc<dyn ExchangeAdapter>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServiceConfig,
        event_log: Arc<EventLog>,
        registry: Arc<PositionRegistry>,
        router: Arc<OrderRouter>,
        risk: Arc<RiskEnforcer>,
        safe_mode: Arc<SafeModeController>,
        failure_tracker: Arc<FailureTracker>,
        mode_controller: Arc<OperationModeController>,
        market: Arc<MarketDataHub>,
        strategy_service: Arc<StrategyService>,
        exchange: Arc<dyn ExchangeAdapter>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),
            start_time: Instant::now(),

            config,
            event_log,
            registry,
            router,
            risk,
            safe_mode,
            failure_tracker,
            mode_controller,
            market,
            strategy_service,
            exchange,
        }
    }

    /// Atomically increment the state version. Call this after every
    /// meaningful mutation to signal WebSocket clients that fresh data is
    /// available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Read the current state version without modifying it.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Build the operator-surface snapshot: service mode, safe-mode status,
    /// active strategy id, and open-position count. See spec §6.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = chrono::Utc::now();
        let strategy = self.strategy_service.active();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mode: self.mode_controller.current(),
            strategy_id: strategy.as_ref().map(|s| s.strategy_id.clone()),
            strategy_state: format!("{:?}", self.strategy_service.state()),
            open_positions_count: self.registry.get_open_positions().len(),
            safe_mode: SafeModeSnapshot {
                active: self.safe_mode.is_active(),
                reason: self.safe_mode.reason(),
                triggered_at: self.safe_mode.triggered_at(),
            },
            risk: self.risk.get_state(),
        }
    }
}

/// Full operator-facing snapshot returned by `GET /api/v1/status` and pushed
/// over the WebSocket feed.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub mode: OperationMode,
    pub strategy_id: Option<String>,
    pub strategy_state: String,
    pub open_positions_count: usize,
    pub safe_mode: SafeModeSnapshot,
    pub risk: RiskState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeModeSnapshot {
    pub active: bool,
    pub reason: Option<String>,
    pub triggered_at: Option<chrono::DateTime<chrono::Utc>>,
}
