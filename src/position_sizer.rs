// =============================================================================
// Position Sizer — allocation-pct to quantity, lot-rounded
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use crate::event_log::{EventLog, ExecutionEvent};
use crate::types::OperationMode;

/// Per-asset lot increment / minimum lot size overrides. Assets absent from
/// the map use the configured default (0.0001 for BTC-class instruments).
#[derive(Debug, Clone, Default)]
pub struct LotRules {
    pub increments: HashMap<String, Decimal>,
    pub minimums: HashMap<String, Decimal>,
    pub default_increment: Decimal,
    pub default_minimum: Decimal,
}

impl LotRules {
    pub fn new(default_increment: Decimal, default_minimum: Decimal) -> Self {
        Self {
            increments: HashMap::new(),
            minimums: HashMap::new(),
            default_increment,
            default_minimum,
        }
    }

    fn increment_for(&self, asset: &str) -> Decimal {
        self.increments.get(asset).copied().unwrap_or(self.default_increment)
    }

    fn minimum_for(&self, asset: &str) -> Decimal {
        self.minimums.get(asset).copied().unwrap_or(self.default_minimum)
    }
}

pub struct PositionSizer {
    lot_rules: LotRules,
    event_log: Arc<EventLog>,
}

impl PositionSizer {
    pub fn new(lot_rules: LotRules, event_log: Arc<EventLog>) -> Self {
        Self { lot_rules, event_log }
    }

    /// Compute an entry quantity from available capital. Returns `None` (and
    /// logs `entry_skipped`) when there's nothing to deploy or the resulting
    /// quantity falls below the asset's minimum lot.
    pub fn calculate(
        &self,
        asset: &str,
        strategy_position_id: &str,
        allocation_pct: Decimal,
        max_per_position_pct: Decimal,
        available_balance: Decimal,
        price: Decimal,
        mode: OperationMode,
    ) -> Option<Decimal> {
        if available_balance <= Decimal::ZERO {
            self.skip(strategy_position_id, asset, "no_available_capital", mode);
            return None;
        }

        let effective_pct = allocation_pct.min(max_per_position_pct);
        let notional = available_balance * effective_pct;
        let raw_qty = notional / price;

        let increment = self.lot_rules.increment_for(asset);
        let rounded_qty = (raw_qty / increment).floor() * increment;

        let minimum = self.lot_rules.minimum_for(asset);
        if rounded_qty < minimum {
            self.skip(strategy_position_id, asset, "below_minimum_lot_size", mode);
            return None;
        }

        info!(asset, strategy_position_id, qty = %rounded_qty, "position sizer: computed entry quantity");
        Some(rounded_qty)
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sizer() -> PositionSizer {
        let dir = std::env::temp_dir().join(format!("position-sizer-test-{}", uuid::Uuid::new_v4()));
        let log = Arc::new(EventLog::new(dir, false).unwrap());
        PositionSizer::new(LotRules::new(dec!(0.0001), dec!(0.0001)), log)
    }

    #[test]
    fn zero_balance_skips_with_no_available_capital() {
        let sizer = sizer();
        let qty = sizer.calculate("BTC/USD", "sp1", dec!(0.1), dec!(0.2), dec!(0), dec!(50000), OperationMode::Paper);
        assert!(qty.is_none());
    }

    #[test]
    fn effective_pct_is_the_minimum_of_allocation_and_cap() {
        let sizer = sizer();
        let qty = sizer
            .calculate("BTC/USD", "sp1", dec!(0.5), dec!(0.1), dec!(10000), dec!(50000), OperationMode::Paper)
            .unwrap();
        // effective pct = 0.1 -> notional = 1000 -> raw qty = 0.02
        assert_eq!(qty, dec!(0.0200));
    }

    #[test]
    fn below_minimum_lot_is_skipped() {
        let sizer = sizer();
        let qty = sizer.calculate("BTC/USD", "sp1", dec!(0.0001), dec!(0.2), dec!(100), dec!(50000), OperationMode::Paper);
        assert!(qty.is_none());
    }
}
