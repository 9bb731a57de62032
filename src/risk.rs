// =============================================================================
// Risk Enforcer — drawdown, exposure, and daily-loss breakers
// =============================================================================
//
// Three breakers guarding capital, evaluated fresh on every tick:
//   1. Drawdown        — trips safe mode when equity falls too far off peak.
//   2. Exposure         — suspends new entries above a notional-to-equity
//                         cap; re-enables with hysteresis, not at the line.
//   3. Daily loss       — suspends entries until the next UTC midnight once
//                         today's loss from the daily baseline exceeds a cap.
//
// Pure with respect to side effects besides events and its own flags — the
// enforcer never places or cancels an order itself.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event_log::{EventLog, ExecutionEvent};
use crate::types::{OperationMode, PortfolioRisk};

/// Snapshot of the enforcer's state for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub daily_baseline_equity: Decimal,
    pub exposure_pct: Decimal,
    pub drawdown_pct: Decimal,
    pub daily_loss: Decimal,
    pub entries_suspended: bool,
    pub safe_mode_triggered: bool,
    pub daily_loss_suspended_until: Option<DateTime<Utc>>,
}

struct Inner {
    peak_equity: Decimal,
    daily_baseline_equity: Decimal,
    daily_baseline_date: String,
    entries_suspended: bool,
    safe_mode_triggered: bool,
    daily_loss_suspended_until: Option<DateTime<Utc>>,
    last_exposure_pct: Decimal,
    last_drawdown_pct: Decimal,
    last_daily_loss: Decimal,
    last_equity: Decimal,
}

/// Hysteresis band for re-enabling entries after an exposure suspension:
/// exposure must fall below this fraction of the cap, not merely under it.
const EXPOSURE_REENABLE_FRACTION: Decimal = Decimal::from_parts(95, 0, 0, false, 2);

pub struct RiskEnforcer {
    inner: RwLock<Inner>,
    event_log: Arc<EventLog>,
}

impl RiskEnforcer {
    pub fn new(initial_equity: Decimal, event_log: Arc<EventLog>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                peak_equity: initial_equity,
                daily_baseline_equity: initial_equity,
                daily_baseline_date: Utc::now().format("%Y-%m-%d").to_string(),
                entries_suspended: false,
                safe_mode_triggered: false,
                daily_loss_suspended_until: None,
                last_exposure_pct: Decimal::ZERO,
                last_drawdown_pct: Decimal::ZERO,
                last_daily_loss: Decimal::ZERO,
                last_equity: initial_equity,
            }),
            event_log,
        }
    }

    fn maybe_roll_daily_baseline(&self, inner: &mut Inner, equity: Decimal) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if today != inner.daily_baseline_date {
            inner.daily_baseline_date = today;
            inner.daily_baseline_equity = equity;
            // re-arm the daily-loss breaker — otherwise a stale `Some` from
            // yesterday's breach blocks today's `is_none()` guard forever.
            inner.daily_loss_suspended_until = None;
        }
    }

    /// Evaluate all three breakers against current equity and notional
    /// exposure. `limits` comes from the active strategy's portfolio risk
    /// block. Returns `true` if this call just triggered safe mode (callers
    /// invoke the Safe Mode Controller in response).
    pub fn evaluate(&self, equity: Decimal, total_notional_exposure: Decimal, limits: &PortfolioRisk, mode: OperationMode) -> bool {
        let mut inner = self.inner.write();

        self.maybe_roll_daily_baseline(&mut inner, equity);

        if equity > inner.peak_equity {
            inner.peak_equity = equity;
        }

        let exposure_pct = if equity > Decimal::ZERO { total_notional_exposure / equity } else { Decimal::ZERO };
        let drawdown_pct = if inner.peak_equity > Decimal::ZERO {
            (inner.peak_equity - equity) / inner.peak_equity
        } else {
            Decimal::ZERO
        };
        let daily_loss = inner.daily_baseline_equity - equity;

        inner.last_exposure_pct = exposure_pct;
        inner.last_drawdown_pct = drawdown_pct;
        inner.last_daily_loss = daily_loss;
        inner.last_equity = equity;

        let mut just_triggered_safe_mode = false;

        if drawdown_pct >= limits.max_drawdown_pct && !inner.safe_mode_triggered {
            inner.safe_mode_triggered = true;
            just_triggered_safe_mode = true;
            warn!(%drawdown_pct, limit = %limits.max_drawdown_pct, "risk enforcer: drawdown breach");
            self.event_log.append(ExecutionEvent::new(
                "risk_limit_breached",
                mode,
                serde_json::json!({ "limit": "max_drawdown_pct", "action": "safe_mode", "value": drawdown_pct }),
            ));
        }

        if exposure_pct >= limits.max_total_exposure_pct {
            if !inner.entries_suspended {
                inner.entries_suspended = true;
                self.event_log.append(ExecutionEvent::new(
                    "risk_limit_breached",
                    mode,
                    serde_json::json!({ "limit": "max_total_exposure_pct", "action": "suspend_entries", "value": exposure_pct }),
                ));
            }
        } else if inner.entries_suspended
            && !inner.safe_mode_triggered
            && exposure_pct < limits.max_total_exposure_pct * EXPOSURE_REENABLE_FRACTION
        {
            inner.entries_suspended = false;
            info!(%exposure_pct, "risk enforcer: exposure fell below hysteresis band, entries re-enabled");
        }

        if daily_loss >= limits.daily_loss_limit_usd {
            if inner.daily_loss_suspended_until.is_none() {
                let tomorrow_midnight = (Utc::now().date_naive() + chrono::Duration::days(1))
                    .and_time(NaiveTime::MIN)
                    .and_utc();
                inner.daily_loss_suspended_until = Some(tomorrow_midnight);
                self.event_log.append(ExecutionEvent::new(
                    "risk_limit_breached",
                    mode,
                    serde_json::json!({
                        "limit": "daily_loss_limit_usd",
                        "action": "suspend_entries_until_utc_midnight",
                        "value": daily_loss,
                    }),
                ));
            }
        }

        just_triggered_safe_mode
    }

    /// Whether new entries should be blocked right now, accounting for both
    /// the exposure and daily-loss suspensions.
    pub fn entries_suspended(&self) -> bool {
        let inner = self.inner.read();
        if inner.entries_suspended {
            return true;
        }
        match inner.daily_loss_suspended_until {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }

    pub fn is_safe_mode_triggered(&self) -> bool {
        self.inner.read().safe_mode_triggered
    }

    /// Clear all state, anchoring both peak and daily baseline equity at
    /// `new_equity` — used after safe-mode deactivation or a new strategy.
    pub fn reset(&self, new_equity: Decimal) {
        let mut inner = self.inner.write();
        inner.peak_equity = new_equity;
        inner.daily_baseline_equity = new_equity;
        inner.daily_baseline_date = Utc::now().format("%Y-%m-%d").to_string();
        inner.entries_suspended = false;
        inner.safe_mode_triggered = false;
        inner.daily_loss_suspended_until = None;
        inner.last_exposure_pct = Decimal::ZERO;
        inner.last_drawdown_pct = Decimal::ZERO;
        inner.last_daily_loss = Decimal::ZERO;
        inner.last_equity = new_equity;
    }

    pub fn get_state(&self) -> RiskState {
        let inner = self.inner.read();
        RiskState {
            equity: inner.last_equity,
            peak_equity: inner.peak_equity,
            daily_baseline_equity: inner.daily_baseline_equity,
            exposure_pct: inner.last_exposure_pct,
            drawdown_pct: inner.last_drawdown_pct,
            daily_loss: inner.last_daily_loss,
            entries_suspended: inner.entries_suspended,
            safe_mode_triggered: inner.safe_mode_triggered,
            daily_loss_suspended_until: inner.daily_loss_suspended_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn enforcer(initial_equity: Decimal) -> RiskEnforcer {
        let dir = std::env::temp_dir().join(format!("risk-enforcer-test-{}", uuid::Uuid::new_v4()));
        let log = Arc::new(EventLog::new(dir, false).unwrap());
        RiskEnforcer::new(initial_equity, log)
    }

    fn limits() -> PortfolioRisk {
        PortfolioRisk {
            max_drawdown_pct: dec!(0.2),
            daily_loss_limit_usd: dec!(500),
            max_total_exposure_pct: dec!(0.5),
            max_per_position_pct: dec!(0.2),
        }
    }

    #[test]
    fn peak_equity_tracks_maximum() {
        let enforcer = enforcer(dec!(10000));
        enforcer.evaluate(dec!(11000), dec!(0), &limits(), OperationMode::Paper);
        enforcer.evaluate(dec!(9000), dec!(0), &limits(), OperationMode::Paper);
        assert_eq!(enforcer.get_state().peak_equity, dec!(11000));
    }

    #[test]
    fn drawdown_breach_triggers_safe_mode_once() {
        let enforcer = enforcer(dec!(10000));
        let triggered_first = enforcer.evaluate(dec!(7900), dec!(0), &limits(), OperationMode::Paper);
        assert!(triggered_first);
        let triggered_second = enforcer.evaluate(dec!(7000), dec!(0), &limits(), OperationMode::Paper);
        assert!(!triggered_second);
        assert!(enforcer.is_safe_mode_triggered());
    }

    #[test]
    fn exposure_hysteresis_requires_falling_below_95_pct_of_cap() {
        let enforcer = enforcer(dec!(10000));
        // exactly at cap -> suspend
        enforcer.evaluate(dec!(10000), dec!(5000), &limits(), OperationMode::Paper);
        assert!(enforcer.entries_suspended());

        // 94.99% of cap (cap=0.5 -> 0.4999) -> still suspended
        enforcer.evaluate(dec!(10000), dec!(4999), &limits(), OperationMode::Paper);
        assert!(enforcer.entries_suspended());

        // 94.9% of cap (0.5 * 0.949 = 0.4745) -> resumes
        enforcer.evaluate(dec!(10000), dec!(4745), &limits(), OperationMode::Paper);
        assert!(!enforcer.entries_suspended());
    }

    #[test]
    fn daily_loss_breaker_rearms_on_new_utc_day() {
        let enforcer = enforcer(dec!(10000));
        let triggered = enforcer.evaluate(dec!(9000), dec!(0), &limits(), OperationMode::Paper);
        assert!(!triggered); // daily loss is a suspension, not a safe-mode trip
        assert!(enforcer.entries_suspended());
        assert!(enforcer.inner.read().daily_loss_suspended_until.is_some());

        // simulate the UTC day having rolled over without waiting for real time
        {
            let mut inner = enforcer.inner.write();
            inner.daily_baseline_date = "2000-01-01".to_string();
        }

        // next evaluation should detect the stale date, roll the baseline,
        // and clear the suspension left over from yesterday's breach
        enforcer.evaluate(dec!(9000), dec!(0), &limits(), OperationMode::Paper);
        assert!(enforcer.inner.read().daily_loss_suspended_until.is_none());
        assert!(!enforcer.entries_suspended());

        // a fresh breach today must still be able to re-arm the breaker
        let state_before = enforcer.get_state().daily_baseline_equity;
        enforcer.evaluate(state_before - dec!(600), dec!(0), &limits(), OperationMode::Paper);
        assert!(enforcer.inner.read().daily_loss_suspended_until.is_some());
        assert!(enforcer.entries_suspended());
    }

    #[test]
    fn reset_anchors_peak_and_baseline_at_new_equity() {
        let enforcer = enforcer(dec!(10000));
        enforcer.evaluate(dec!(7000), dec!(0), &limits(), OperationMode::Paper);
        enforcer.reset(dec!(8000));
        let state = enforcer.get_state();
        assert_eq!(state.peak_equity, dec!(8000));
        assert_eq!(state.daily_baseline_equity, dec!(8000));
        assert!(!state.safe_mode_triggered);
    }
}
