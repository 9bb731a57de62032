// =============================================================================
// Strategy Service — file watcher, validator, compiler, lifecycle states
// =============================================================================
//
// No file-notification crate appears in this repository's dependency tree,
// so the watcher follows the same polling idiom used elsewhere here: a
// `tokio::time::interval` loop that stats the file and compares content
// hashes, debounced by `reload_latency_ms` before acting on a change.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::condition::{parse, ConditionEvaluator};
use crate::event_log::{EventLog, ExecutionEvent};
use crate::types::{Direction, EntryType, OperationMode, Posture, StopLoss, StrategyDocument, StrategyPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Active,
    Expired,
}

/// One strategy position plus its compiled conditions. Conditions are
/// recompiled (and their crossing state discarded) on every strategy load.
pub struct CompiledPosition {
    pub def: StrategyPosition,
    pub entry_condition: Option<ConditionEvaluator>,
    pub invalidation_condition: Option<ConditionEvaluator>,
}

pub struct CompiledStrategy {
    pub strategy_id: String,
    pub doc: StrategyDocument,
    pub positions: Vec<CompiledPosition>,
    pub loaded_at: chrono::DateTime<Utc>,
}

impl CompiledStrategy {
    pub fn assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.doc.positions.iter().map(|p| p.asset.clone()).collect();
        assets.sort();
        assets.dedup();
        assets
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.doc.validity_window
    }
}

fn validate(doc: &StrategyDocument) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if doc.validity_window <= Utc::now() {
        errors.push("validity_window must be in the future".to_string());
    }
    if doc.portfolio_risk.max_drawdown_pct <= rust_decimal::Decimal::ZERO || doc.portfolio_risk.max_drawdown_pct > rust_decimal::Decimal::ONE {
        errors.push("max_drawdown_pct must be in (0, 1]".to_string());
    }
    if doc.portfolio_risk.max_total_exposure_pct < rust_decimal::Decimal::ZERO || doc.portfolio_risk.max_total_exposure_pct > rust_decimal::Decimal::ONE {
        errors.push("max_total_exposure_pct must be in [0, 1]".to_string());
    }
    if doc.portfolio_risk.max_per_position_pct <= rust_decimal::Decimal::ZERO || doc.portfolio_risk.max_per_position_pct > rust_decimal::Decimal::ONE {
        errors.push("max_per_position_pct must be in (0, 1]".to_string());
    }
    if doc.portfolio_risk.daily_loss_limit_usd < rust_decimal::Decimal::ZERO {
        errors.push("daily_loss_limit_usd must be >= 0".to_string());
    }

    if doc.positions.is_empty() {
        errors.push("strategy document must declare at least one position".to_string());
    }

    for pos in &doc.positions {
        if pos.id.is_empty() {
            errors.push("position id must be nonempty".to_string());
        }
        if pos.asset.is_empty() {
            errors.push(format!("position {}: asset must be nonempty", pos.id));
        }
        if pos.allocation_pct <= rust_decimal::Decimal::ZERO || pos.allocation_pct > rust_decimal::Decimal::ONE {
            errors.push(format!("position {}: allocation_pct must be in (0, 1]", pos.id));
        }
        if matches!(pos.entry_type, EntryType::Conditional) && pos.entry_condition.is_none() {
            errors.push(format!("position {}: conditional entry requires entry_condition", pos.id));
        }
        if matches!(pos.entry_type, EntryType::Limit) && pos.entry_limit_price.is_none() {
            errors.push(format!("position {}: limit entry requires entry_limit_price", pos.id));
        }
        if let Some(cond) = &pos.entry_condition {
            if let Err(e) = parse(cond) {
                errors.push(format!("position {}: entry_condition: {e}", pos.id));
            }
        }
        if let Some(cond) = &pos.invalidation_condition {
            if let Err(e) = parse(cond) {
                errors.push(format!("position {}: invalidation_condition: {e}", pos.id));
            }
        }
        match &pos.stop_loss {
            StopLoss::Hard { price } if *price <= rust_decimal::Decimal::ZERO => {
                errors.push(format!("position {}: hard stop price must be positive", pos.id));
            }
            StopLoss::Trailing { trail_pct } if *trail_pct <= rust_decimal::Decimal::ZERO => {
                errors.push(format!("position {}: trailing stop percent must be positive", pos.id));
            }
            _ => {}
        }
        let close_pct_sum: rust_decimal::Decimal = pos.take_profit_targets.iter().map(|t| t.close_pct).sum();
        let epsilon = rust_decimal::Decimal::new(1, 6);
        if close_pct_sum > rust_decimal::Decimal::ONE + epsilon {
            errors.push(format!("position {}: take_profit_targets close_pct sum exceeds 1", pos.id));
        }
        if !matches!(pos.direction, Direction::Long | Direction::Short) {
            errors.push(format!("position {}: direction must be long or short", pos.id));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn compile(doc: StrategyDocument, strategy_id: String) -> CompiledStrategy {
    let positions = doc
        .positions
        .iter()
        .map(|pos| CompiledPosition {
            def: pos.clone(),
            entry_condition: pos.entry_condition.as_deref().and_then(|c| parse(c).ok()).map(|c| ConditionEvaluator::compile(&c)),
            invalidation_condition: pos.invalidation_condition.as_deref().and_then(|c| parse(c).ok()).map(|c| ConditionEvaluator::compile(&c)),
        })
        .collect();

    CompiledStrategy { strategy_id, doc, positions, loaded_at: Utc::now() }
}

pub struct StrategyService {
    path: PathBuf,
    reload_latency_ms: u64,
    active: RwLock<Option<Arc<CompiledStrategy>>>,
    state: RwLock<LifecycleState>,
    last_content_hash: RwLock<Option<String>>,
    event_log: Arc<EventLog>,
}

impl StrategyService {
    pub fn new(path: impl Into<PathBuf>, reload_latency_ms: u64, event_log: Arc<EventLog>) -> Self {
        Self {
            path: path.into(),
            reload_latency_ms,
            active: RwLock::new(None),
            state: RwLock::new(LifecycleState::Idle),
            last_content_hash: RwLock::new(None),
            event_log,
        }
    }

    pub fn active(&self) -> Option<Arc<CompiledStrategy>> {
        self.active.read().clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Read, validate, and (on success) atomically swap the active strategy.
    /// Returns `true` if a new strategy was loaded.
    pub fn try_reload(&self, mode_override: OperationMode) -> bool {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "strategy service: file unreadable, keeping current strategy");
                self.event_log.append(ExecutionEvent::new(
                    "strategy_rejected",
                    mode_override,
                    serde_json::json!({ "errors": [format!("unreadable: {e}")] }),
                ));
                return false;
            }
        };

        let content_hash = format!("{:x}", Sha256::digest(content.as_bytes()));
        if self.last_content_hash.read().as_deref() == Some(content_hash.as_str()) {
            return false;
        }

        let doc: StrategyDocument = match serde_json::from_str(&content) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "strategy service: malformed JSON");
                self.event_log.append(ExecutionEvent::new(
                    "strategy_rejected",
                    mode_override,
                    serde_json::json!({ "errors": [format!("parse error: {e}")] }),
                ));
                return false;
            }
        };

        if let Err(errors) = validate(&doc) {
            warn!(?errors, "strategy service: validation failed");
            self.event_log.append(ExecutionEvent::new(
                "strategy_rejected",
                mode_override,
                serde_json::json!({ "errors": errors }),
            ));
            return false;
        }

        let previous_id = self.active.read().as_ref().map(|s| s.strategy_id.clone());
        let compiled = Arc::new(compile(doc, content_hash.clone()));

        *self.last_content_hash.write() = Some(content_hash.clone());
        *self.active.write() = Some(compiled.clone());
        *self.state.write() = LifecycleState::Active;

        self.event_log.append(ExecutionEvent::new(
            "strategy_loaded",
            mode_override,
            serde_json::json!({ "strategy_id": compiled.strategy_id, "positions": compiled.positions.len() }),
        ));

        if previous_id.as_deref() != Some(compiled.strategy_id.as_str()) {
            self.event_log.append(ExecutionEvent::new(
                "strategy_swapped",
                mode_override,
                serde_json::json!({ "previous_strategy_id": previous_id, "new_strategy_id": compiled.strategy_id }),
            ));
        }

        info!(strategy_id = compiled.strategy_id, "strategy service: loaded new strategy");
        true
    }

    /// Check validity-window expiry. Called periodically by the validity
    /// timer. Returns `true` if the strategy just transitioned to expired.
    pub fn check_validity(&self, mode: OperationMode) -> bool {
        let Some(active) = self.active() else { return false };
        if *self.state.read() == LifecycleState::Active && active.is_expired() {
            *self.state.write() = LifecycleState::Expired;
            self.event_log.append(ExecutionEvent::new(
                "strategy_expired",
                mode,
                serde_json::json!({ "strategy_id": active.strategy_id }),
            ));
            warn!(strategy_id = active.strategy_id, "strategy service: strategy expired");
            return true;
        }
        false
    }

    pub fn posture(&self) -> Option<Posture> {
        self.active().map(|s| s.doc.posture)
    }

    pub fn reload_latency(&self) -> Duration {
        Duration::from_millis(self.reload_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_log() -> Arc<EventLog> {
        let dir = std::env::temp_dir().join(format!("strategy-service-events-{}", uuid::Uuid::new_v4()));
        Arc::new(EventLog::new(dir, false).unwrap())
    }

    fn write_strategy(path: &std::path::Path, validity_hours: i64) {
        let doc = serde_json::json!({
            "mode": "paper",
            "validity_window": (Utc::now() + chrono::Duration::hours(validity_hours)).to_rfc3339(),
            "posture": "moderate",
            "portfolio_risk": {
                "max_drawdown_pct": 0.2,
                "daily_loss_limit_usd": 500,
                "max_total_exposure_pct": 0.5,
                "max_per_position_pct": 0.2,
            },
            "positions": [{
                "id": "sp1",
                "asset": "BTC/USD",
                "direction": "long",
                "allocation_pct": 0.1,
                "entry_type": "market",
                "stop_loss": { "kind": "hard", "price": 48000 },
            }],
        });
        std::fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    #[test]
    fn valid_strategy_loads_and_emits_events() {
        let dir = std::env::temp_dir().join(format!("strategy-service-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strategy.json");
        write_strategy(&path, 24);

        let service = StrategyService::new(&path, 500, event_log());
        assert!(service.try_reload(OperationMode::Paper));
        assert_eq!(service.state(), LifecycleState::Active);
        assert!(service.active().is_some());

        // identical content does not reload again
        assert!(!service.try_reload(OperationMode::Paper));
    }

    #[test]
    fn invalid_strategy_is_rejected_and_keeps_previous() {
        let dir = std::env::temp_dir().join(format!("strategy-service-invalid-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strategy.json");
        write_strategy(&path, 24);

        let service = StrategyService::new(&path, 500, event_log());
        assert!(service.try_reload(OperationMode::Paper));
        let loaded_id = service.active().unwrap().strategy_id.clone();

        std::fs::write(&path, "{not valid json").unwrap();
        assert!(!service.try_reload(OperationMode::Paper));
        assert_eq!(service.active().unwrap().strategy_id, loaded_id);
    }

    #[test]
    fn validity_window_already_in_the_past_is_rejected() {
        let dir = std::env::temp_dir().join(format!("strategy-service-expiry-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strategy.json");
        write_strategy(&path, -1);

        let service = StrategyService::new(&path, 500, event_log());
        assert!(!service.try_reload(OperationMode::Paper));
    }

    #[test]
    fn active_strategy_transitions_to_expired_after_validity_window() {
        let dir = std::env::temp_dir().join(format!("strategy-service-live-expiry-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strategy.json");
        write_strategy(&path, 24);

        let service = StrategyService::new(&path, 500, event_log());
        assert!(service.try_reload(OperationMode::Paper));

        // force expiry without waiting out the real validity window
        if let Some(active) = service.active() {
            let mut doc = active.doc.clone();
            doc.validity_window = Utc::now() - chrono::Duration::seconds(1);
            let forced = Arc::new(CompiledStrategy {
                strategy_id: active.strategy_id.clone(),
                doc,
                positions: Vec::new(),
                loaded_at: active.loaded_at,
            });
            *service.active.write() = Some(forced);
        }

        assert!(service.check_validity(OperationMode::Paper));
        assert_eq!(service.state(), LifecycleState::Expired);
    }

    #[test]
    fn conditional_entry_without_condition_is_rejected() {
        let dir = std::env::temp_dir().join(format!("strategy-service-cond-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strategy.json");
        let doc = serde_json::json!({
            "mode": "paper",
            "validity_window": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            "posture": "moderate",
            "portfolio_risk": {
                "max_drawdown_pct": 0.2,
                "daily_loss_limit_usd": 500,
                "max_total_exposure_pct": 0.5,
                "max_per_position_pct": 0.2,
            },
            "positions": [{
                "id": "sp1",
                "asset": "BTC/USD",
                "direction": "long",
                "allocation_pct": 0.1,
                "entry_type": "conditional",
                "stop_loss": { "kind": "hard", "price": 48000 },
            }],
        });
        std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

        let service = StrategyService::new(&path, 500, event_log());
        assert!(!service.try_reload(OperationMode::Paper));
    }
}
