// =============================================================================
// Reconciliation — one-shot startup comparison of registry vs. exchange
// =============================================================================
//
// Keyed on (asset, direction), not quantity — the next fill or exit cycle is
// left to converge quantity drift (see DESIGN.md for the open-question
// rationale). Never blocks startup: adapter failures are caught and reported
// through the same `reconciliation_summary` event rather than propagated.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::event_log::{EventLog, ExecutionEvent};
use crate::exchange::ExchangeAdapter;
use crate::position_registry::PositionRegistry;
use crate::safe_mode::SafeModeController;
use crate::types::{Direction, ExitReason, OpenPosition, OperationMode, PositionOrigin};

/// Run reconciliation once. Skipped entirely (no event emitted) when safe
/// mode is already active — flattening is already underway and touching the
/// registry here would race with the safe-mode close dispatches.
pub async fn reconcile(
    registry: &Arc<PositionRegistry>,
    exchange: &Arc<dyn ExchangeAdapter>,
    safe_mode: &Arc<SafeModeController>,
    event_log: &Arc<EventLog>,
    mode: OperationMode,
) {
    if safe_mode.is_active() {
        info!("reconciliation: skipped, safe mode is active");
        return;
    }

    let exchange_positions = match exchange.get_open_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!(error = %e, "reconciliation: failed to fetch exchange positions");
            event_log.append(ExecutionEvent::new(
                "reconciliation_summary",
                mode,
                serde_json::json!({
                    "status": "error",
                    "orphaned_closed": 0,
                    "unknown_added": 0,
                    "matched": 0,
                    "error": e.to_string(),
                }),
            ));
            return;
        }
    };

    let registry_positions = registry.get_open_positions();

    let mut matched: u64 = 0;
    let mut orphaned_closed: u64 = 0;
    let mut unknown_added: u64 = 0;

    for reg_pos in &registry_positions {
        let on_exchange = exchange_positions
            .iter()
            .any(|ep| ep.asset == reg_pos.asset && ep.direction == reg_pos.direction);

        if on_exchange {
            matched += 1;
            continue;
        }

        if registry
            .close_position(
                &reg_pos.id,
                reg_pos.quantity,
                reg_pos.average_entry_price,
                ExitReason::ReconciledMissing,
                mode,
            )
            .is_some()
        {
            orphaned_closed += 1;
            warn!(asset = %reg_pos.asset, direction = %reg_pos.direction, "reconciliation: registry position not found on exchange, closed");
        }
    }

    for ex_pos in &exchange_positions {
        let in_registry = registry_positions
            .iter()
            .any(|rp| rp.asset == ex_pos.asset && rp.direction == ex_pos.direction);

        if in_registry {
            continue;
        }

        registry.upsert_position(OpenPosition {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_position_id: format!("reconciled_{}_{}", ex_pos.asset, ex_pos.direction),
            strategy_id: "reconciled".to_string(),
            asset: ex_pos.asset.clone(),
            direction: ex_pos.direction,
            quantity: ex_pos.quantity,
            average_entry_price: ex_pos.average_entry_price,
            opened_at: chrono::Utc::now(),
            trailing_stop_price: None,
            take_profit_targets_hit: Vec::new(),
            origin: PositionOrigin::Reconciled,
            current_price: ex_pos.average_entry_price,
            unrealized_pnl: rust_decimal::Decimal::ZERO,
        });
        unknown_added += 1;
        warn!(asset = %ex_pos.asset, direction = %ex_pos.direction, "reconciliation: exchange position not found in registry, added");
    }

    info!(matched, orphaned_closed, unknown_added, "reconciliation complete");
    event_log.append(ExecutionEvent::new(
        "reconciliation_summary",
        mode,
        serde_json::json!({
            "status": "ok",
            "orphaned_closed": orphaned_closed,
            "unknown_added": unknown_added,
            "matched": matched,
        }),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExchangeAdapterError;
    use crate::exchange::paper::PaperExchangeAdapter;
    use crate::exchange::{CancelResult, OrderAcknowledgement, OrderStatusReport, PlaceOrderRequest};
    use crate::failure_tracker::FailureTracker;
    use crate::order_router::OrderRouter;
    use crate::types::{AccountBalance, ExchangePosition, MarketSnapshot};
    use parking_lot::RwLock as PlRwLock;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct StubAdapter {
        positions: Vec<ExchangePosition>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ExchangeAdapter for StubAdapter {
        async fn place_order(&self, _request: PlaceOrderRequest) -> Result<OrderAcknowledgement, ExchangeAdapterError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _exchange_order_id: &str) -> Result<CancelResult, ExchangeAdapterError> {
            unimplemented!()
        }
        async fn get_order_status(&self, _exchange_order_id: &str) -> Result<OrderStatusReport, ExchangeAdapterError> {
            unimplemented!()
        }
        async fn get_account_balance(&self) -> Result<AccountBalance, ExchangeAdapterError> {
            unimplemented!()
        }
        async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeAdapterError> {
            if self.fail {
                Err(ExchangeAdapterError::Transient(anyhow::anyhow!("boom")))
            } else {
                Ok(self.positions.clone())
            }
        }
        fn is_rate_limited(&self) -> bool {
            false
        }
        fn rate_limit_resumes_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            None
        }
    }

    fn harness() -> (Arc<PositionRegistry>, Arc<SafeModeController>, Arc<EventLog>) {
        let dir = std::env::temp_dir().join(format!("reconcile-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        let registry = Arc::new(PositionRegistry::new(dir.clone(), log.clone()));
        let safe_mode = Arc::new(SafeModeController::new(dir.join("safe_mode.json"), log.clone()));
        (registry, safe_mode, log)
    }

    #[tokio::test]
    async fn orphaned_registry_position_is_closed() {
        let (registry, safe_mode, log) = harness();
        registry.open_position(
            "sp1", "strat-1", "BTC/USD", Direction::Long, dec!(0.01), dec!(50000),
            PositionOrigin::Strategy, OperationMode::Paper,
        );

        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter { positions: vec![], fail: false });
        reconcile(&registry, &exchange, &safe_mode, &log, OperationMode::Paper).await;

        assert!(registry.get_open_positions().is_empty());
        assert_eq!(registry.get_closed_trades(1)[0].exit_reason, ExitReason::ReconciledMissing);
    }

    #[tokio::test]
    async fn unknown_exchange_position_is_added() {
        let (registry, safe_mode, log) = harness();
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            positions: vec![ExchangePosition {
                asset: "ETH/USD".to_string(),
                direction: Direction::Long,
                quantity: dec!(1.0),
                average_entry_price: dec!(3000),
            }],
            fail: false,
        });

        reconcile(&registry, &exchange, &safe_mode, &log, OperationMode::Paper).await;

        let open = registry.get_open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].origin, PositionOrigin::Reconciled);
        assert_eq!(open[0].strategy_position_id, "reconciled_ETH/USD_long");
    }

    #[tokio::test]
    async fn matched_position_is_untouched() {
        let (registry, safe_mode, log) = harness();
        registry.open_position(
            "sp1", "strat-1", "BTC/USD", Direction::Long, dec!(0.01), dec!(50000),
            PositionOrigin::Strategy, OperationMode::Paper,
        );
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            positions: vec![ExchangePosition {
                asset: "BTC/USD".to_string(),
                direction: Direction::Long,
                quantity: dec!(0.01),
                average_entry_price: dec!(50000),
            }],
            fail: false,
        });

        reconcile(&registry, &exchange, &safe_mode, &log, OperationMode::Paper).await;
        assert_eq!(registry.get_open_positions().len(), 1);
        assert!(registry.get_closed_trades(1).is_empty());
    }

    #[tokio::test]
    async fn skipped_entirely_when_safe_mode_active() {
        let (registry, safe_mode, log) = harness();
        registry.open_position(
            "sp1", "strat-1", "BTC/USD", Direction::Long, dec!(0.01), dec!(50000),
            PositionOrigin::Strategy, OperationMode::Paper,
        );
        let failure_tracker = Arc::new(FailureTracker::new(
            std::env::temp_dir().join(format!("ft-{}.json", uuid::Uuid::new_v4())),
            3,
        ));
        let order_router = OrderRouter::new(
            Arc::new(PaperExchangeAdapter::new(dec!(10000), dec!(0.001), dec!(0.0005), Arc::new(PlRwLock::new(HashMap::<String, MarketSnapshot>::new())))),
            registry.clone(),
            log.clone(),
            failure_tracker,
            safe_mode.clone(),
        );
        safe_mode.activate("test", &registry, &order_router, OperationMode::Paper).await;

        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter { positions: vec![], fail: false });
        reconcile(&registry, &exchange, &safe_mode, &log, OperationMode::Paper).await;

        // position still present; safe mode's own flatten dispatch is a
        // separate code path exercised in safe_mode.rs, not reconciliation.
        assert_eq!(registry.get_open_positions().len(), 1);
    }

    #[tokio::test]
    async fn adapter_error_reports_status_error_without_panicking() {
        let (registry, safe_mode, log) = harness();
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter { positions: vec![], fail: true });
        reconcile(&registry, &exchange, &safe_mode, &log, OperationMode::Paper).await;
        let recent = log.get_recent(1);
        assert_eq!(recent[0].event_type, "reconciliation_summary");
        assert_eq!(recent[0].data["status"], "error");
    }
}
