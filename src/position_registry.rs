// =============================================================================
// Position Registry — authoritative store of open positions and closed trades
// =============================================================================
//
// Mirrors the structure of the engine's earlier in-memory position tracker:
// two collections behind one mutex, mutated through a small set of methods
// that each persist atomically afterward. Unlike that earlier tracker, every
// mutation here is backed by `positions.json` / `trades.json` so state
// survives a restart, and closing arithmetic follows the exact long/short
// formulas this repository already uses.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::event_log::{EventLog, ExecutionEvent};
use crate::persist;
use crate::types::{ClosedTrade, Direction, ExitReason, OpenPosition, OperationMode, PositionOrigin};

struct Inner {
    open: Vec<OpenPosition>,
    closed: Vec<ClosedTrade>,
}

pub struct PositionRegistry {
    state: RwLock<Inner>,
    positions_path: PathBuf,
    trades_path: PathBuf,
    event_log: Arc<EventLog>,
}

impl PositionRegistry {
    pub fn new(state_dir: impl Into<PathBuf>, event_log: Arc<EventLog>) -> Self {
        let state_dir = state_dir.into();
        Self {
            state: RwLock::new(Inner {
                open: Vec::new(),
                closed: Vec::new(),
            }),
            positions_path: state_dir.join("positions.json"),
            trades_path: state_dir.join("trades.json"),
            event_log,
        }
    }

    /// Load persisted state. Malformed content logs an error and starts
    /// empty rather than aborting startup.
    pub fn load(&self) -> Result<()> {
        let open: Vec<OpenPosition> = match persist::load(&self.positions_path) {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, path = %self.positions_path.display(), "failed to load positions.json — starting empty");
                Vec::new()
            }
        };
        let closed: Vec<ClosedTrade> = match persist::load(&self.trades_path) {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, path = %self.trades_path.display(), "failed to load trades.json — starting empty");
                Vec::new()
            }
        };

        info!(open = open.len(), closed = closed.len(), "position registry loaded");
        let mut state = self.state.write();
        state.open = open;
        state.closed = closed;
        Ok(())
    }

    fn persist_open(&self, open: &[OpenPosition]) {
        if let Err(e) = persist::save_atomic(&self.positions_path, &open) {
            error!(error = %e, "position registry: failed to persist positions.json — mutation applied in memory only");
        }
    }

    fn persist_closed(&self, closed: &[ClosedTrade]) {
        if let Err(e) = persist::save_atomic(&self.trades_path, &closed) {
            error!(error = %e, "position registry: failed to persist trades.json — mutation applied in memory only");
        }
    }

    /// Create a new open position from a first fill.
    pub fn open_position(
        &self,
        strategy_position_id: &str,
        strategy_id: &str,
        asset: &str,
        direction: Direction,
        quantity: Decimal,
        fill_price: Decimal,
        origin: PositionOrigin,
        mode: OperationMode,
    ) -> OpenPosition {
        let position = OpenPosition {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_position_id: strategy_position_id.to_string(),
            strategy_id: strategy_id.to_string(),
            asset: asset.to_string(),
            direction,
            quantity,
            average_entry_price: fill_price,
            opened_at: chrono::Utc::now(),
            trailing_stop_price: None,
            take_profit_targets_hit: Vec::new(),
            origin,
            current_price: fill_price,
            unrealized_pnl: Decimal::ZERO,
        };

        let snapshot = {
            let mut state = self.state.write();
            state.open.push(position.clone());
            state.open.clone()
        };
        self.persist_open(&snapshot);

        self.event_log.append(ExecutionEvent::new(
            "position_opened",
            mode,
            serde_json::json!({
                "position_id": position.id,
                "strategy_position_id": position.strategy_position_id,
                "asset": position.asset,
                "direction": position.direction,
                "quantity": position.quantity,
                "average_entry_price": position.average_entry_price,
            }),
        ));

        position
    }

    /// Apply a partial fill, recomputing the volume-weighted average entry
    /// price: `new_avg = (old_qty*old_avg + add_qty*add_price) / (old_qty + add_qty)`.
    pub fn apply_partial_fill(&self, position_id: &str, add_qty: Decimal, add_price: Decimal) {
        let snapshot = {
            let mut state = self.state.write();
            if let Some(pos) = state.open.iter_mut().find(|p| p.id == position_id) {
                let new_qty = pos.quantity + add_qty;
                pos.average_entry_price =
                    (pos.quantity * pos.average_entry_price + add_qty * add_price) / new_qty;
                pos.quantity = new_qty;
            } else {
                warn!(position_id, "apply_partial_fill: position not found");
            }
            state.open.clone()
        };
        self.persist_open(&snapshot);
    }

    /// Close (fully or partially) a position at `exit_price` for `reason`.
    /// `close_qty` lets the Exit Evaluator close a fraction of the position
    /// for a take-profit target; pass the full quantity for stops and
    /// invalidation. Returns the realized P&L of the closed portion, or
    /// `None` if the position was not found.
    pub fn close_position(
        &self,
        position_id: &str,
        close_qty: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
        mode: OperationMode,
    ) -> Option<Decimal> {
        let (trade, open_snapshot, closed_snapshot) = {
            let mut state = self.state.write();
            let idx = state.open.iter().position(|p| p.id == position_id)?;
            let position = &state.open[idx];

            let closing_qty = close_qty.min(position.quantity);
            let partial_trade = {
                let mut snapshot = position.clone();
                snapshot.quantity = closing_qty;
                ClosedTrade::from_open(&snapshot, exit_price, reason.clone())
            };

            let remaining = position.quantity - closing_qty;
            if remaining <= Decimal::ZERO {
                state.open.remove(idx);
            } else {
                state.open[idx].quantity = remaining;
            }

            state.closed.push(partial_trade.clone());

            (partial_trade, state.open.clone(), state.closed.clone())
        };

        self.persist_open(&open_snapshot);
        self.persist_closed(&closed_snapshot);

        self.event_log.append(ExecutionEvent::new(
            "position_closed",
            mode,
            serde_json::json!({
                "position_id": position_id,
                "exit_reason": trade.exit_reason.to_string(),
                "realized_pnl": trade.realized_pnl,
                "exit_price": trade.exit_price,
            }),
        ));

        Some(trade.realized_pnl)
    }

    /// Remove a registry position without recording a trade — used by
    /// reconciliation when an exchange-side position vanished.
    pub fn remove_position(&self, position_id: &str) -> Option<OpenPosition> {
        let (removed, snapshot) = {
            let mut state = self.state.write();
            let idx = state.open.iter().position(|p| p.id == position_id)?;
            let removed = state.open.remove(idx);
            (removed, state.open.clone())
        };
        self.persist_open(&snapshot);
        Some(removed)
    }

    /// Insert a position discovered on the exchange but absent from the
    /// registry (reconciliation).
    pub fn upsert_position(&self, position: OpenPosition) {
        let snapshot = {
            let mut state = self.state.write();
            state.open.push(position);
            state.open.clone()
        };
        self.persist_open(&snapshot);
    }

    pub fn update_unrealized_pnl(&self, asset: &str, mid: Decimal) {
        let mut state = self.state.write();
        for pos in state.open.iter_mut().filter(|p| p.asset == asset) {
            pos.update_unrealized_pnl(mid);
        }
    }

    pub fn get_open_positions(&self) -> Vec<OpenPosition> {
        self.state.read().open.clone()
    }

    pub fn get_open_position(&self, position_id: &str) -> Option<OpenPosition> {
        self.state.read().open.iter().find(|p| p.id == position_id).cloned()
    }

    pub fn find_by_strategy_position(&self, strategy_position_id: &str) -> Option<OpenPosition> {
        self.state
            .read()
            .open
            .iter()
            .find(|p| p.strategy_position_id == strategy_position_id)
            .cloned()
    }

    pub fn find_by_asset_direction(&self, asset: &str, direction: Direction) -> Option<OpenPosition> {
        self.state
            .read()
            .open
            .iter()
            .find(|p| p.asset == asset && p.direction == direction)
            .cloned()
    }

    pub fn get_closed_trades(&self, limit: usize) -> Vec<ClosedTrade> {
        let state = self.state.read();
        state.closed.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Update the trailing stop watermark for a position. The Exit Evaluator
    /// computes the new value; this just stores and persists it.
    pub fn update_trailing_stop(&self, position_id: &str, new_trailing_stop: Decimal) {
        let snapshot = {
            let mut state = self.state.write();
            if let Some(pos) = state.open.iter_mut().find(|p| p.id == position_id) {
                pos.trailing_stop_price = Some(new_trailing_stop);
            }
            state.open.clone()
        };
        self.persist_open(&snapshot);
    }

    /// Record that take-profit target `idx` has fired for a position, so the
    /// Exit Evaluator won't dispatch it again next tick.
    pub fn mark_take_profit_hit(&self, position_id: &str, idx: usize) {
        let snapshot = {
            let mut state = self.state.write();
            if let Some(pos) = state.open.iter_mut().find(|p| p.id == position_id) {
                if !pos.take_profit_targets_hit.contains(&idx) {
                    pos.take_profit_targets_hit.push(idx);
                }
            }
            state.open.clone()
        };
        self.persist_open(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn registry() -> PositionRegistry {
        let dir = std::env::temp_dir().join(format!("position-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        PositionRegistry::new(dir, log)
    }

    #[test]
    fn open_then_close_long_computes_pnl() {
        let reg = registry();
        let pos = reg.open_position(
            "sp1",
            "strat-hash",
            "BTC/USD",
            Direction::Long,
            dec!(0.02),
            dec!(50050),
            PositionOrigin::Strategy,
            OperationMode::Paper,
        );
        let pnl = reg
            .close_position(&pos.id, dec!(0.02), dec!(51050), ExitReason::Manual, OperationMode::Paper)
            .unwrap();
        assert_eq!(pnl, dec!(20.00));
        assert!(reg.get_open_positions().is_empty());
        assert_eq!(reg.get_closed_trades(10).len(), 1);
    }

    #[test]
    fn partial_fill_updates_volume_weighted_average() {
        let reg = registry();
        let pos = reg.open_position(
            "sp1",
            "strat-hash",
            "BTC/USD",
            Direction::Long,
            dec!(1.0),
            dec!(100),
            PositionOrigin::Strategy,
            OperationMode::Paper,
        );
        reg.apply_partial_fill(&pos.id, dec!(1.0), dec!(200));
        let updated = reg.get_open_position(&pos.id).unwrap();
        assert_eq!(updated.quantity, dec!(2.0));
        assert_eq!(updated.average_entry_price, dec!(150));
    }

    #[test]
    fn load_after_save_round_trips() {
        let dir = std::env::temp_dir().join(format!("position-registry-rt-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        let reg = PositionRegistry::new(dir.clone(), log.clone());
        reg.open_position(
            "sp1",
            "strat-hash",
            "BTC/USD",
            Direction::Long,
            dec!(1.0),
            dec!(100),
            PositionOrigin::Strategy,
            OperationMode::Paper,
        );

        let reg2 = PositionRegistry::new(dir, log);
        reg2.load().unwrap();
        assert_eq!(reg2.get_open_positions().len(), 1);
    }

    #[test]
    fn trailing_stop_and_take_profit_hits_persist() {
        let reg = registry();
        let pos = reg.open_position(
            "sp1",
            "strat-hash",
            "BTC/USD",
            Direction::Long,
            dec!(1.0),
            dec!(100),
            PositionOrigin::Strategy,
            OperationMode::Paper,
        );
        reg.update_trailing_stop(&pos.id, dec!(95));
        reg.mark_take_profit_hit(&pos.id, 0);
        reg.mark_take_profit_hit(&pos.id, 0);

        let updated = reg.get_open_position(&pos.id).unwrap();
        assert_eq!(updated.trailing_stop_price, Some(dec!(95)));
        assert_eq!(updated.take_profit_targets_hit, vec![0]);
    }

    #[test]
    fn malformed_positions_file_starts_empty() {
        let dir = std::env::temp_dir().join(format!("position-registry-bad-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("positions.json"), "{not valid json").unwrap();
        let log = Arc::new(EventLog::new(dir.join("events"), false).unwrap());
        let reg = PositionRegistry::new(dir, log);
        reg.load().unwrap();
        assert!(reg.get_open_positions().is_empty());
    }
}
