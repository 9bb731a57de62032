// =============================================================================
// Operation Mode — persistent paper/live selector
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::event_log::{EventLog, ExecutionEvent};
use crate::persist;
use crate::types::OperationMode as Mode;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModeState {
    mode: Mode,
    changed_at: DateTime<Utc>,
    changed_by: String,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            changed_at: Utc::now(),
            changed_by: "system".to_string(),
        }
    }
}

/// Tracks which exchange adapter the Order Router should use. Paper by
/// default; an operator command is required to promote to live.
pub struct OperationModeController {
    path: PathBuf,
    state: RwLock<ModeState>,
    is_live: AtomicBool,
    event_log: Arc<EventLog>,
}

impl OperationModeController {
    pub fn new(path: impl Into<PathBuf>, event_log: Arc<EventLog>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(ModeState::default()),
            is_live: AtomicBool::new(false),
            event_log,
        }
    }

    pub fn load(&self) {
        match persist::load::<ModeState>(&self.path) {
            Ok(Some(state)) => {
                self.is_live.store(matches!(state.mode, Mode::Live), Ordering::SeqCst);
                *self.state.write() = state;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "operation mode: failed to load state, defaulting to paper"),
        }
    }

    fn persist(&self, state: &ModeState) {
        if let Err(e) = persist::save_atomic(&self.path, state) {
            error!(error = %e, "operation mode: failed to persist state");
        }
    }

    pub fn current(&self) -> Mode {
        self.state.read().mode
    }

    /// Transition to a new mode with an operator note. A no-op (no event)
    /// if already in the requested mode.
    pub fn transition(&self, new_mode: Mode, changed_by: &str, operator_note: &str) {
        let previous_mode = {
            let state = self.state.read();
            if state.mode == new_mode {
                return;
            }
            state.mode
        };

        let new_state = ModeState {
            mode: new_mode,
            changed_at: Utc::now(),
            changed_by: changed_by.to_string(),
        };
        self.is_live.store(matches!(new_mode, Mode::Live), Ordering::SeqCst);
        *self.state.write() = new_state.clone();
        self.persist(&new_state);

        self.event_log.append(ExecutionEvent::new(
            "mode_changed",
            new_mode,
            serde_json::json!({
                "new_mode": new_mode,
                "previous_mode": previous_mode,
                "operator_note": operator_note,
            }),
        ));
    }
}
