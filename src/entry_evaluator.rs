// =============================================================================
// Entry Evaluator — per-tick entry dispatch for the active strategy
// =============================================================================
//
// One instance lives for the process lifetime. Its dispatch set tracks which
// strategy positions have already fired this strategy load, so a market
// entry — which is "always true" — fires exactly once even though the
// underlying order eventually reaches a terminal status and stops blocking
// the Order Router's own idempotency check.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::info;

use crate::condition::evaluator::Tristate;
use crate::event_log::{EventLog, ExecutionEvent};
use crate::market_data::{MarketDataHub, SnapshotContext};
use crate::order_router::OrderRouter;
use crate::position_sizer::PositionSizer;
use crate::risk::RiskEnforcer;
use crate::strategy_service::CompiledStrategy;
use crate::types::{Direction, EntryType, OperationMode, OrderIntent, OrderSide, OrderType, Posture};

pub struct EntryEvaluator {
    dispatch_set: Mutex<HashSet<String>>,
    last_strategy_id: Mutex<Option<String>>,
    event_log: Arc<EventLog>,
}

impl EntryEvaluator {
    pub fn new(event_log: Arc<EventLog>) -> Self {
        Self {
            dispatch_set: Mutex::new(HashSet::new()),
            last_strategy_id: Mutex::new(None),
            event_log,
        }
    }

    fn reset_if_new_strategy(&self, strategy_id: &str) {
        let mut last = self.last_strategy_id.lock();
        if last.as_deref() != Some(strategy_id) {
            self.dispatch_set.lock().clear();
            *last = Some(strategy_id.to_string());
        }
    }

    /// Evaluate every position in `strategy` once. `available_balance` is
    /// the current account balance available for new entries, fetched once
    /// per tick by the caller.
    pub async fn evaluate_tick(
        &self,
        strategy: &CompiledStrategy,
        market: &MarketDataHub,
        risk: &RiskEnforcer,
        sizer: &PositionSizer,
        router: &OrderRouter,
        available_balance: Decimal,
        mode: OperationMode,
    ) {
        self.reset_if_new_strategy(&strategy.strategy_id);

        if matches!(strategy.doc.posture, Posture::ExitAll | Posture::Flat) {
            return;
        }
        if risk.entries_suspended() {
            return;
        }

        for position in &strategy.positions {
            let spid = position.def.id.clone();

            if self.dispatch_set.lock().contains(&spid) {
                continue;
            }

            let should_enter = match position.def.entry_type {
                EntryType::Market => true,
                EntryType::Limit => {
                    let Some(snapshot) = market.get_snapshot(&position.def.asset) else { continue };
                    let Some(limit) = position.def.entry_limit_price else { continue };
                    match position.def.direction {
                        Direction::Long => snapshot.bid <= limit,
                        Direction::Short => snapshot.ask >= limit,
                    }
                }
                EntryType::Conditional => {
                    let Some(cond) = &position.entry_condition else { continue };
                    let snapshots = market.get_all_snapshots();
                    let ctx = SnapshotContext::new(&snapshots);
                    match cond.evaluate(&ctx) {
                        Tristate::True => true,
                        Tristate::False => false,
                        Tristate::Unknown => {
                            self.skip(&spid, &position.def.asset, "indicator_not_ready", mode);
                            false
                        }
                    }
                }
            };

            if !should_enter {
                continue;
            }

            let Some(price) = market.get_snapshot(&position.def.asset).map(|s| s.mid()) else { continue };
            let Some(quantity) = sizer.calculate(
                &position.def.asset,
                &spid,
                position.def.allocation_pct,
                strategy.doc.portfolio_risk.max_per_position_pct,
                available_balance,
                price,
                mode,
            ) else {
                continue;
            };

            // Dispatch lock: re-check idempotency right before committing,
            // since evaluating conditions above takes no lock and another
            // tick could have raced in between.
            {
                let mut set = self.dispatch_set.lock();
                if set.contains(&spid) {
                    continue;
                }
                set.insert(spid.clone());
            }

            self.event_log.append(ExecutionEvent::new(
                "entry_triggered",
                mode,
                serde_json::json!({
                    "strategy_position_id": spid,
                    "asset": position.def.asset,
                    "direction": position.def.direction,
                    "quantity": quantity,
                }),
            ));
            info!(strategy_position_id = %spid, asset = %position.def.asset, %quantity, "entry evaluator: dispatching entry");

            let side = match position.def.direction {
                Direction::Long => OrderSide::Buy,
                Direction::Short => OrderSide::Sell,
            };
            let (order_type, limit_price) = match position.def.entry_type {
                EntryType::Limit => (OrderType::Limit, position.def.entry_limit_price),
                _ => (OrderType::Market, None),
            };

            router
                .place_entry_order(
                    &position.def.asset,
                    side,
                    order_type,
                    quantity,
                    limit_price,
                    &spid,
                    OrderIntent::Entry,
                    mode,
                )
                .await;
        }
    }

    fn skip(&self, strategy_position_id: &str, asset: &str, reason: &str, mode: OperationMode) {
        self.event_log.append(ExecutionEvent::new(
            "entry_skipped",
            mode,
            serde_json::json!({
                "strategy_position_id": strategy_position_id,
                "asset": asset,
                "reason": reason,
            }),
        ));
    }
}
