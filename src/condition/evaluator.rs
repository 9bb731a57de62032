// =============================================================================
// Condition DSL — three-valued evaluator with stateful crossing detection
// =============================================================================
//
// A condition evaluates to `true`, `false`, or `unknown` (when it references
// an asset with no cached snapshot yet). `unknown` never trips entry or
// invalidation logic — callers treat it exactly like `false` for dispatch
// purposes, but it is kept distinct so the strategy service can log "waiting
// on data" separately from "condition not yet met".
// =============================================================================

use std::collections::HashMap;
use std::sync::Mutex;

use rust_decimal::Decimal;

use super::parser::{Comparator, Condition, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    True,
    False,
    Unknown,
}

impl Tristate {
    pub fn is_true(self) -> bool {
        matches!(self, Tristate::True)
    }

    fn not(self) -> Tristate {
        match self {
            Tristate::True => Tristate::False,
            Tristate::False => Tristate::True,
            Tristate::Unknown => Tristate::Unknown,
        }
    }

    fn and(values: &[Tristate]) -> Tristate {
        if values.iter().any(|v| *v == Tristate::False) {
            Tristate::False
        } else if values.iter().all(|v| *v == Tristate::True) {
            Tristate::True
        } else {
            Tristate::Unknown
        }
    }

    fn or(values: &[Tristate]) -> Tristate {
        if values.iter().any(|v| *v == Tristate::True) {
            Tristate::True
        } else if values.iter().all(|v| *v == Tristate::False) {
            Tristate::False
        } else {
            Tristate::Unknown
        }
    }
}

/// Resolves `price(ASSET)` and indicator lookups against live market state.
/// `MarketDataHub` and the strategy service's per-tick snapshot both
/// implement this.
pub trait MarketContext {
    fn price(&self, asset: &str) -> Option<Decimal>;
    fn indicator(&self, name: &str, args: &[String], asset: &str) -> Option<Decimal>;
}

#[derive(Debug, Clone)]
enum Compiled {
    Comparison {
        left: Value,
        op: Comparator,
        right: Value,
        crossing_id: Option<usize>,
    },
    And(Vec<Compiled>),
    Or(Vec<Compiled>),
    Not(Box<Compiled>),
}

fn compile(condition: &Condition, next_id: &mut usize) -> Compiled {
    match condition {
        Condition::Comparison { left, op, right } => {
            let crossing_id = match op {
                Comparator::CrossesAbove | Comparator::CrossesBelow => {
                    let id = *next_id;
                    *next_id += 1;
                    Some(id)
                }
                _ => None,
            };
            Compiled::Comparison {
                left: left.clone(),
                op: *op,
                right: right.clone(),
                crossing_id,
            }
        }
        Condition::And(parts) => Compiled::And(parts.iter().map(|p| compile(p, next_id)).collect()),
        Condition::Or(parts) => Compiled::Or(parts.iter().map(|p| compile(p, next_id)).collect()),
        Condition::Not(inner) => Compiled::Not(Box::new(compile(inner, next_id))),
    }
}

/// A parsed condition plus the crossing-detection state it accumulates
/// across evaluations. One instance is compiled per strategy position and
/// discarded whenever the strategy reloads — crossing history never
/// survives a reload.
pub struct ConditionEvaluator {
    compiled: Compiled,
    previous_diffs: Mutex<HashMap<usize, Decimal>>,
}

impl ConditionEvaluator {
    pub fn compile(condition: &Condition) -> Self {
        let mut next_id = 0;
        let compiled = compile(condition, &mut next_id);
        Self {
            compiled,
            previous_diffs: Mutex::new(HashMap::new()),
        }
    }

    pub fn evaluate(&self, ctx: &dyn MarketContext) -> Tristate {
        self.eval_node(&self.compiled, ctx)
    }

    fn eval_node(&self, node: &Compiled, ctx: &dyn MarketContext) -> Tristate {
        match node {
            Compiled::Comparison { left, op, right, crossing_id } => {
                let left_val = resolve(left, ctx);
                let right_val = resolve(right, ctx);
                let (Some(l), Some(r)) = (left_val, right_val) else {
                    return Tristate::Unknown;
                };
                match op {
                    Comparator::Gt => bool_tristate(l > r),
                    Comparator::Gte => bool_tristate(l >= r),
                    Comparator::Lt => bool_tristate(l < r),
                    Comparator::Lte => bool_tristate(l <= r),
                    Comparator::Eq => bool_tristate(l == r),
                    Comparator::CrossesAbove | Comparator::CrossesBelow => {
                        let id = crossing_id.expect("crossing comparator always has a crossing_id");
                        let diff = l - r;
                        let mut prev_map = self.previous_diffs.lock().unwrap();
                        let result = match prev_map.get(&id) {
                            None => Tristate::False,
                            Some(prev_diff) => {
                                let crossed = match op {
                                    Comparator::CrossesAbove => *prev_diff <= Decimal::ZERO && diff > Decimal::ZERO,
                                    Comparator::CrossesBelow => *prev_diff >= Decimal::ZERO && diff < Decimal::ZERO,
                                    _ => unreachable!(),
                                };
                                bool_tristate(crossed)
                            }
                        };
                        prev_map.insert(id, diff);
                        result
                    }
                }
            }
            Compiled::And(parts) => {
                let values: Vec<Tristate> = parts.iter().map(|p| self.eval_node(p, ctx)).collect();
                Tristate::and(&values)
            }
            Compiled::Or(parts) => {
                let values: Vec<Tristate> = parts.iter().map(|p| self.eval_node(p, ctx)).collect();
                Tristate::or(&values)
            }
            Compiled::Not(inner) => self.eval_node(inner, ctx).not(),
        }
    }
}

fn resolve(value: &Value, ctx: &dyn MarketContext) -> Option<Decimal> {
    match value {
        Value::Literal(d) => Some(*d),
        Value::Price(asset) => ctx.price(asset),
        Value::Indicator { name, args, asset } => ctx.indicator(name, args, asset),
    }
}

fn bool_tristate(b: bool) -> Tristate {
    if b {
        Tristate::True
    } else {
        Tristate::False
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parser::parse;
    use rust_decimal_macros::dec;
    use std::cell::RefCell;

    struct FixedContext {
        prices: RefCell<HashMap<String, Decimal>>,
    }

    impl FixedContext {
        fn new() -> Self {
            Self { prices: RefCell::new(HashMap::new()) }
        }

        fn set(&self, asset: &str, price: Decimal) {
            self.prices.borrow_mut().insert(asset.to_string(), price);
        }
    }

    impl MarketContext for FixedContext {
        fn price(&self, asset: &str) -> Option<Decimal> {
            self.prices.borrow().get(asset).copied()
        }

        fn indicator(&self, _name: &str, _args: &[String], _asset: &str) -> Option<Decimal> {
            None
        }
    }

    #[test]
    fn simple_comparison_evaluates_true_and_false() {
        let cond = parse("price(BTC/USD) > 50000").unwrap();
        let evaluator = ConditionEvaluator::compile(&cond);
        let ctx = FixedContext::new();
        ctx.set("BTC/USD", dec!(49000));
        assert_eq!(evaluator.evaluate(&ctx), Tristate::False);
        ctx.set("BTC/USD", dec!(51000));
        assert_eq!(evaluator.evaluate(&ctx), Tristate::True);
    }

    #[test]
    fn missing_snapshot_is_unknown_not_false() {
        let cond = parse("price(DOGE/USD) > 1").unwrap();
        let evaluator = ConditionEvaluator::compile(&cond);
        let ctx = FixedContext::new();
        assert_eq!(evaluator.evaluate(&ctx), Tristate::Unknown);
    }

    #[test]
    fn crosses_above_is_false_on_first_eval_then_fires_on_transition() {
        let cond = parse("price(BTC/USD) crosses_above 50000").unwrap();
        let evaluator = ConditionEvaluator::compile(&cond);
        let ctx = FixedContext::new();

        ctx.set("BTC/USD", dec!(49000));
        assert_eq!(evaluator.evaluate(&ctx), Tristate::False);

        // still below — no transition yet
        ctx.set("BTC/USD", dec!(49500));
        assert_eq!(evaluator.evaluate(&ctx), Tristate::False);

        // crosses now
        ctx.set("BTC/USD", dec!(50500));
        assert_eq!(evaluator.evaluate(&ctx), Tristate::True);

        // staying above does not refire
        ctx.set("BTC/USD", dec!(51000));
        assert_eq!(evaluator.evaluate(&ctx), Tristate::False);
    }

    #[test]
    fn and_or_not_three_valued_semantics() {
        assert_eq!(Tristate::and(&[Tristate::True, Tristate::Unknown]), Tristate::Unknown);
        assert_eq!(Tristate::and(&[Tristate::True, Tristate::False]), Tristate::False);
        assert_eq!(Tristate::or(&[Tristate::False, Tristate::Unknown]), Tristate::Unknown);
        assert_eq!(Tristate::or(&[Tristate::True, Tristate::Unknown]), Tristate::True);
        assert_eq!(Tristate::True.not(), Tristate::False);
        assert_eq!(Tristate::Unknown.not(), Tristate::Unknown);
    }
}
