// =============================================================================
// Failure Tracker — consecutive order-placement failure counter
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureState {
    consecutive_failures: u64,
    last_failure_utc: Option<DateTime<Utc>>,
}

impl Default for FailureState {
    fn default() -> Self {
        Self { consecutive_failures: 0, last_failure_utc: None }
    }
}

/// Counts consecutive `place_order` failures. Fires the safe-mode trigger
/// exactly once per breach, reset only by an explicit [`FailureTracker::reset`].
pub struct FailureTracker {
    path: PathBuf,
    threshold: u64,
    state: Mutex<FailureState>,
    safe_mode_triggered: AtomicBool,
}

impl FailureTracker {
    pub fn new(path: impl Into<PathBuf>, threshold: u64) -> Self {
        Self {
            path: path.into(),
            threshold,
            state: Mutex::new(FailureState::default()),
            safe_mode_triggered: AtomicBool::new(false),
        }
    }

    /// Restore state from disk. If the persisted count already meets the
    /// threshold, `safe_mode_triggered` initializes to `true` — a restart
    /// must not silently forget an already-tripped breaker.
    pub fn load(&self) {
        match persist::load::<FailureState>(&self.path) {
            Ok(Some(state)) => {
                let already_tripped = state.consecutive_failures >= self.threshold;
                *self.state.lock() = state;
                self.safe_mode_triggered.store(already_tripped, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "failure tracker: failed to load state, starting fresh");
            }
        }
    }

    fn persist(&self, state: &FailureState) {
        if let Err(e) = persist::save_atomic(&self.path, state) {
            error!(error = %e, "failure tracker: failed to persist state");
        }
    }

    /// Record a successful order placement — resets the counter to zero.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        self.persist(&state);
    }

    /// Record a failed order placement. Returns `true` exactly once, the
    /// tick the threshold is first crossed — callers use this to decide
    /// whether to invoke the safe-mode trigger callback.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure_utc = Some(Utc::now());
        self.persist(&state);

        if state.consecutive_failures >= self.threshold {
            let already_triggered = self.safe_mode_triggered.swap(true, Ordering::Relaxed);
            if !already_triggered {
                warn!(consecutive_failures = state.consecutive_failures, "failure tracker: threshold reached");
                return true;
            }
        }
        false
    }

    pub fn is_safe_mode_triggered(&self) -> bool {
        self.safe_mode_triggered.load(Ordering::Relaxed)
    }

    /// Clear the counter and the trigger latch — called by the Safe Mode
    /// Controller on `deactivate()`.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = FailureState::default();
        self.persist(&state);
        self.safe_mode_triggered.store(false, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.state.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u64) -> FailureTracker {
        let path = std::env::temp_dir().join(format!("failure-tracker-test-{}.json", uuid::Uuid::new_v4()));
        FailureTracker::new(path, threshold)
    }

    #[test]
    fn success_resets_counter() {
        let t = tracker(3);
        t.record_failure();
        t.record_failure();
        t.record_success();
        assert_eq!(t.consecutive_failures(), 0);
    }

    #[test]
    fn fires_exactly_once_at_threshold() {
        let t = tracker(2);
        assert!(!t.record_failure());
        assert!(t.record_failure());
        // stays triggered, does not refire
        assert!(!t.record_failure());
        assert!(t.is_safe_mode_triggered());
    }

    #[test]
    fn restart_with_already_tripped_count_restores_trigger() {
        let path = std::env::temp_dir().join(format!("failure-tracker-restart-{}.json", uuid::Uuid::new_v4()));
        let t1 = FailureTracker::new(path.clone(), 2);
        t1.record_failure();
        t1.record_failure();
        assert!(t1.is_safe_mode_triggered());

        let t2 = FailureTracker::new(path, 2);
        t2.load();
        assert!(t2.is_safe_mode_triggered());
    }

    #[test]
    fn reset_clears_counter_and_trigger() {
        let t = tracker(1);
        t.record_failure();
        assert!(t.is_safe_mode_triggered());
        t.reset();
        assert!(!t.is_safe_mode_triggered());
        assert_eq!(t.consecutive_failures(), 0);
    }
}
