// =============================================================================
// Safe Mode Controller — persistent kill switch, best-effort flatten
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::event_log::{EventLog, ExecutionEvent};
use crate::failure_tracker::FailureTracker;
use crate::order_router::OrderRouter;
use crate::persist;
use crate::position_registry::PositionRegistry;
use crate::types::{Direction, ExitReason, OperationMode, OrderIntent, OrderSide, OrderType};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SafeModeState {
    active: bool,
    triggered_at: Option<DateTime<Utc>>,
    reason: Option<String>,
}

pub struct SafeModeController {
    path: PathBuf,
    state: RwLock<SafeModeState>,
    activating: AtomicBool,
    event_log: Arc<EventLog>,
}

impl SafeModeController {
    pub fn new(path: impl Into<PathBuf>, event_log: Arc<EventLog>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(SafeModeState::default()),
            activating: AtomicBool::new(false),
            event_log,
        }
    }

    pub fn load(&self) {
        match persist::load::<SafeModeState>(&self.path) {
            Ok(Some(state)) => *self.state.write() = state,
            Ok(None) => {}
            Err(e) => error!(error = %e, "safe mode controller: failed to load state, starting inactive"),
        }
    }

    fn persist(&self, state: &SafeModeState) {
        if let Err(e) = persist::save_atomic(&self.path, state) {
            error!(error = %e, "safe mode controller: failed to persist state");
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    /// Activate safe mode. A no-op if already active. Otherwise marks active,
    /// persists, emits `safe_mode_activated`, then dispatches best-effort
    /// market-close orders for every open position — failures there are
    /// logged but never roll back the activation itself.
    ///
    /// Concurrent callers race on `activating`; exactly one wins the
    /// transition and emits the event, the rest observe `already_active`.
    pub async fn activate(
        &self,
        reason: &str,
        registry: &PositionRegistry,
        order_router: &OrderRouter,
        mode: OperationMode,
    ) {
        if self.activating.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state.read().active {
            return;
        }

        let new_state = SafeModeState {
            active: true,
            triggered_at: Some(Utc::now()),
            reason: Some(reason.to_string()),
        };
        *self.state.write() = new_state.clone();
        self.persist(&new_state);

        self.event_log.append(ExecutionEvent::new(
            "safe_mode_activated",
            mode,
            serde_json::json!({ "reason": reason }),
        ));

        for position in registry.get_open_positions() {
            let close_side = match position.direction {
                Direction::Long => OrderSide::Sell,
                Direction::Short => OrderSide::Buy,
            };
            let result = order_router
                .place_entry_order(
                    &position.asset,
                    close_side,
                    OrderType::Market,
                    position.quantity,
                    None,
                    &format!("{}_exit", position.strategy_position_id),
                    OrderIntent::Exit { position_id: position.id.clone(), exit_reason: ExitReason::SafeModeClose },
                    mode,
                )
                .await;
            if result.is_none() {
                warn!(position_id = %position.id, "safe mode: flatten dispatch skipped (already in flight)");
            }
        }
    }

    /// Deactivate safe mode and reset the failure tracker. Requires an
    /// explicit operator command — never triggered automatically.
    pub fn deactivate(&self, failure_tracker: &FailureTracker, mode: OperationMode) {
        let cleared = SafeModeState::default();
        *self.state.write() = cleared.clone();
        self.persist(&cleared);
        self.activating.store(false, Ordering::SeqCst);
        failure_tracker.reset();

        self.event_log.append(ExecutionEvent::new(
            "safe_mode_deactivated",
            mode,
            serde_json::json!({}),
        ));
        info!("safe mode deactivated");
    }

    pub fn reason(&self) -> Option<String> {
        self.state.read().reason.clone()
    }

    pub fn triggered_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().triggered_at
    }
}
