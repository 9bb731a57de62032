// =============================================================================
// Exit Evaluator — per-tick exit priority ladder for open positions
// =============================================================================
//
// Runs after the Entry Evaluator within the same tick. For every open
// position it checks, in strict priority order, hard stop, trailing stop,
// time exit, invalidation, then take-profit targets — the first condition
// that trips wins, and only one take-profit target can fire per tick.
// Duplicate exit dispatch for the same cause is prevented by reusing the
// Order Router's own idempotency check against a synthesized dispatch id,
// rather than keeping a second set of in-flight-exit bookkeeping.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use crate::condition::evaluator::Tristate;
use crate::market_data::{MarketDataHub, SnapshotContext};
use crate::order_router::OrderRouter;
use crate::position_registry::PositionRegistry;
use crate::strategy_service::CompiledStrategy;
use crate::types::{Direction, ExitReason, OperationMode, OpenPosition, OrderIntent, OrderSide, OrderType, Posture, StopLoss};

pub struct ExitEvaluator {
    event_log: Arc<crate::event_log::EventLog>,
}

impl ExitEvaluator {
    pub fn new(event_log: Arc<crate::event_log::EventLog>) -> Self {
        Self { event_log }
    }

    /// Evaluate every open position. `strategy` is `None` when no strategy
    /// is currently active — in that case every open position is force-closed,
    /// the same as an explicit `exit_all` posture.
    pub async fn evaluate_tick(
        &self,
        strategy: Option<&CompiledStrategy>,
        registry: &PositionRegistry,
        market: &MarketDataHub,
        router: &OrderRouter,
        mode: OperationMode,
    ) {
        let force_exit_all = match strategy {
            None => true,
            Some(s) => matches!(s.doc.posture, Posture::ExitAll),
        };

        for position in registry.get_open_positions() {
            let Some(snapshot) = market.get_snapshot(&position.asset) else { continue };
            let mid = snapshot.mid();
            registry.update_unrealized_pnl(&position.asset, mid);

            if force_exit_all {
                self.dispatch_close(router, &position, ExitReason::ExitAll, position.quantity, mode).await;
                continue;
            }

            let strategy = strategy.expect("force_exit_all is false only when a strategy is active");
            let Some(compiled_pos) = strategy.positions.iter().find(|p| p.def.id == position.strategy_position_id) else {
                continue;
            };

            let mut trailing_stop = position.trailing_stop_price;
            if let StopLoss::Trailing { trail_pct } = &compiled_pos.def.stop_loss {
                let candidate = match position.direction {
                    Direction::Long => snapshot.bid * (Decimal::ONE - trail_pct),
                    Direction::Short => snapshot.ask * (Decimal::ONE + trail_pct),
                };
                let new_trailing = match trailing_stop {
                    Some(old) => match position.direction {
                        Direction::Long => old.max(candidate),
                        Direction::Short => old.min(candidate),
                    },
                    None => candidate,
                };
                if trailing_stop != Some(new_trailing) {
                    registry.update_trailing_stop(&position.id, new_trailing);
                }
                trailing_stop = Some(new_trailing);
            }

            // 1. hard stop
            if let StopLoss::Hard { price } = &compiled_pos.def.stop_loss {
                let triggered = match position.direction {
                    Direction::Long => mid <= *price,
                    Direction::Short => mid >= *price,
                };
                if triggered {
                    self.dispatch_close(router, &position, ExitReason::StopLossHard, position.quantity, mode).await;
                    continue;
                }
            }

            // 2. trailing stop
            if let Some(trail_price) = trailing_stop {
                let triggered = match position.direction {
                    Direction::Long => mid <= trail_price,
                    Direction::Short => mid >= trail_price,
                };
                if triggered {
                    self.dispatch_close(router, &position, ExitReason::StopLossTrailing, position.quantity, mode).await;
                    continue;
                }
            }

            // 3. time exit
            if let Some(time_exit) = compiled_pos.def.time_exit_utc {
                if chrono::Utc::now() >= time_exit {
                    self.dispatch_close(router, &position, ExitReason::TimeExit, position.quantity, mode).await;
                    continue;
                }
            }

            // 4. invalidation condition
            if let Some(cond) = &compiled_pos.invalidation_condition {
                let snapshots = market.get_all_snapshots();
                let ctx = SnapshotContext::new(&snapshots);
                if matches!(cond.evaluate(&ctx), Tristate::True) {
                    self.dispatch_close(router, &position, ExitReason::Invalidation, position.quantity, mode).await;
                    continue;
                }
            }

            // 5. take-profit targets, strictly in order — target i only
            // fires once target i-1 has already hit, and at most one target
            // fires per tick.
            for (idx, target) in compiled_pos.def.take_profit_targets.iter().enumerate() {
                if position.take_profit_targets_hit.contains(&idx) {
                    continue;
                }
                if idx > 0 && !position.take_profit_targets_hit.contains(&(idx - 1)) {
                    break;
                }
                let triggered = match position.direction {
                    Direction::Long => mid >= target.price,
                    Direction::Short => mid <= target.price,
                };
                if !triggered {
                    break;
                }
                let close_qty = position.quantity * target.close_pct;
                self.dispatch_partial_close(router, registry, &position, idx, close_qty, mode).await;
                break;
            }
        }
    }

    async fn dispatch_close(
        &self,
        router: &OrderRouter,
        position: &OpenPosition,
        reason: ExitReason,
        quantity: Decimal,
        mode: OperationMode,
    ) {
        let dispatch_id = format!("{}_exit", position.strategy_position_id);
        if router.has_active_order(&dispatch_id) {
            return;
        }
        let side = match position.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        info!(position_id = %position.id, ?reason, "exit evaluator: dispatching close");
        router
            .place_entry_order(
                &position.asset,
                side,
                OrderType::Market,
                quantity,
                None,
                &dispatch_id,
                OrderIntent::Exit { position_id: position.id.clone(), exit_reason: reason },
                mode,
            )
            .await;
    }

    async fn dispatch_partial_close(
        &self,
        router: &OrderRouter,
        registry: &PositionRegistry,
        position: &OpenPosition,
        idx: usize,
        close_qty: Decimal,
        mode: OperationMode,
    ) {
        let dispatch_id = format!("{}_tp{}", position.strategy_position_id, idx);
        if router.has_active_order(&dispatch_id) {
            return;
        }
        let side = match position.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        info!(position_id = %position.id, idx, "exit evaluator: dispatching take-profit target");
        let result = router
            .place_entry_order(
                &position.asset,
                side,
                OrderType::Market,
                close_qty,
                None,
                &dispatch_id,
                OrderIntent::Exit { position_id: position.id.clone(), exit_reason: ExitReason::TakeProfitTarget(idx) },
                mode,
            )
            .await;

        if let Some(record) = result {
            if !matches!(record.status, crate::types::OrderStatus::Rejected) {
                registry.mark_take_profit_hit(&position.id, idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchangeAdapter;
    use crate::exchange::ExchangeAdapter;
    use crate::failure_tracker::FailureTracker;
    use crate::safe_mode::SafeModeController;
    use crate::strategy_service::CompiledPosition;
    use crate::types::{EntryType, MarketSnapshot, PortfolioRisk, PositionOrigin, StrategyDocument, StrategyPosition, TakeProfitTarget};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn harness() -> (Arc<crate::event_log::EventLog>, Arc<MarketDataHub>, Arc<PositionRegistry>, OrderRouter) {
        let dir = std::env::temp_dir().join(format!("exit-eval-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(crate::event_log::EventLog::new(dir.join("events"), false).unwrap());
        let market = Arc::new(MarketDataHub::new());
        market.on_snapshot(
            "BTC/USD",
            MarketSnapshot { bid: dec!(49990), ask: dec!(50010), timestamp: None, indicators: HashMap::new() },
        );
        let registry = Arc::new(PositionRegistry::new(dir.clone(), log.clone()));
        let failure_tracker = Arc::new(FailureTracker::new(dir.join("failure_count.json"), 5));
        let safe_mode = Arc::new(SafeModeController::new(dir.join("safe_mode.json"), log.clone()));
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(PaperExchangeAdapter::new(
            dec!(10000),
            dec!(0.001),
            dec!(0.0005),
            market.snapshots_handle(),
        ));
        let router = OrderRouter::new(exchange, registry.clone(), log.clone(), failure_tracker, safe_mode);
        (log, market, registry, router)
    }

    fn strategy_with(position: StrategyPosition, posture: Posture) -> CompiledStrategy {
        let compiled = CompiledPosition { def: position, entry_condition: None, invalidation_condition: None };
        CompiledStrategy {
            strategy_id: "strat-1".to_string(),
            doc: StrategyDocument {
                mode: OperationMode::Paper,
                validity_window: chrono::Utc::now() + chrono::Duration::hours(1),
                posture,
                portfolio_risk: PortfolioRisk {
                    max_drawdown_pct: dec!(0.2),
                    daily_loss_limit_usd: dec!(500),
                    max_total_exposure_pct: dec!(0.5),
                    max_per_position_pct: dec!(0.2),
                },
                positions: vec![],
            },
            positions: vec![compiled],
            loaded_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn hard_stop_triggers_full_close() {
        let (log, market, registry, router) = harness();
        let evaluator = ExitEvaluator::new(log);

        let position = registry.open_position(
            "sp1", "strat-1", "BTC/USD", Direction::Long, dec!(0.02), dec!(50000),
            PositionOrigin::Strategy, OperationMode::Paper,
        );

        let def = StrategyPosition {
            id: "sp1".into(),
            asset: "BTC/USD".into(),
            direction: Direction::Long,
            allocation_pct: dec!(0.1),
            entry_type: EntryType::Market,
            entry_condition: None,
            entry_limit_price: None,
            take_profit_targets: vec![],
            stop_loss: StopLoss::Hard { price: dec!(50100) },
            time_exit_utc: None,
            invalidation_condition: None,
        };
        let strat = strategy_with(def, Posture::Moderate);

        evaluator.evaluate_tick(Some(&strat), &registry, &market, &router, OperationMode::Paper).await;
        assert!(router.has_active_order(&format!("{}_exit", position.strategy_position_id)));
    }

    #[tokio::test]
    async fn exit_all_posture_force_closes_every_position() {
        let (log, market, registry, router) = harness();
        let evaluator = ExitEvaluator::new(log);

        registry.open_position(
            "sp1", "strat-1", "BTC/USD", Direction::Long, dec!(0.02), dec!(50000),
            PositionOrigin::Strategy, OperationMode::Paper,
        );
        let def = StrategyPosition {
            id: "sp1".into(),
            asset: "BTC/USD".into(),
            direction: Direction::Long,
            allocation_pct: dec!(0.1),
            entry_type: EntryType::Market,
            entry_condition: None,
            entry_limit_price: None,
            take_profit_targets: vec![],
            stop_loss: StopLoss::Hard { price: dec!(1) },
            time_exit_utc: None,
            invalidation_condition: None,
        };
        let strat = strategy_with(def, Posture::ExitAll);

        evaluator.evaluate_tick(Some(&strat), &registry, &market, &router, OperationMode::Paper).await;
        assert!(router.has_active_order("sp1_exit"));
    }

    #[tokio::test]
    async fn take_profit_targets_fire_in_order_one_per_tick() {
        let (log, market, registry, router) = harness();
        let evaluator = ExitEvaluator::new(log);

        let position = registry.open_position(
            "sp1", "strat-1", "BTC/USD", Direction::Long, dec!(1.0), dec!(40000),
            PositionOrigin::Strategy, OperationMode::Paper,
        );
        let def = StrategyPosition {
            id: "sp1".into(),
            asset: "BTC/USD".into(),
            direction: Direction::Long,
            allocation_pct: dec!(0.1),
            entry_type: EntryType::Market,
            entry_condition: None,
            entry_limit_price: None,
            take_profit_targets: vec![
                TakeProfitTarget { price: dec!(49000), close_pct: dec!(0.5) },
                TakeProfitTarget { price: dec!(60000), close_pct: dec!(1.0) },
            ],
            stop_loss: StopLoss::Hard { price: dec!(1) },
            time_exit_utc: None,
            invalidation_condition: None,
        };
        let strat = strategy_with(def, Posture::Moderate);

        // mid = 50000, above target 0 (49000) but below target 1 (60000)
        evaluator.evaluate_tick(Some(&strat), &registry, &market, &router, OperationMode::Paper).await;
        assert!(router.has_active_order("sp1_tp0"));
        assert!(!router.has_active_order("sp1_tp1"));

        let updated = registry.get_open_position(&position.id).unwrap();
        assert_eq!(updated.take_profit_targets_hit, vec![0]);
    }
}
