// =============================================================================
// Market Data Hub — per-asset snapshot cache with subscribe-on-load
// =============================================================================
//
// Plays the same role the existing candle/orderbook caches play in this
// service (a shared, lock-guarded map updated by streaming tasks and read by
// the tick-evaluation path) but scoped to exactly what the execution core
// needs: one snapshot per asset, refreshed on tick, broadcast on update.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use rust_decimal::Decimal;

use crate::condition::evaluator::MarketContext;
use crate::types::MarketSnapshot;

/// Bridges a plain snapshot map into the condition evaluator's lookup
/// interface: `price(ASSET)` resolves to the mid, and `FN(args, ASSET)`
/// resolves to the `FN_arg1_arg2` key in the asset's indicator map.
pub struct SnapshotContext<'a> {
    snapshots: &'a HashMap<String, MarketSnapshot>,
}

impl<'a> SnapshotContext<'a> {
    pub fn new(snapshots: &'a HashMap<String, MarketSnapshot>) -> Self {
        Self { snapshots }
    }
}

impl<'a> MarketContext for SnapshotContext<'a> {
    fn price(&self, asset: &str) -> Option<Decimal> {
        self.snapshots.get(asset).map(|s| s.mid())
    }

    fn indicator(&self, name: &str, args: &[String], asset: &str) -> Option<Decimal> {
        // Indicator keys are always NAME_PARAM1_PARAM2… uppercased, regardless
        // of how the DSL author capitalized the function name.
        let key = if args.is_empty() { name.to_string() } else { format!("{}_{}", name, args.join("_")) };
        let key = key.to_uppercase();
        self.snapshots.get(asset).and_then(|s| s.indicators.get(&key).copied())
    }
}

pub struct MarketDataHub {
    snapshots: Arc<RwLock<HashMap<String, MarketSnapshot>>>,
    subscribed: RwLock<HashSet<String>>,
    last_tick_at: RwLock<HashMap<String, Instant>>,
    tx: broadcast::Sender<MarketSnapshot>,
}

impl MarketDataHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            subscribed: RwLock::new(HashSet::new()),
            last_tick_at: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Shared handle to the underlying map, for wiring into the paper
    /// adapter which fills directly against it.
    pub fn snapshots_handle(&self) -> Arc<RwLock<HashMap<String, MarketSnapshot>>> {
        Arc::clone(&self.snapshots)
    }

    /// Resubscribe to exactly the given asset set — called on strategy load
    /// and whenever the active strategy's asset universe changes.
    pub fn resubscribe(&self, assets: &[String]) {
        let mut subscribed = self.subscribed.write();
        let new_set: HashSet<String> = assets.iter().cloned().collect();
        if *subscribed != new_set {
            info!(assets = ?assets, "market data hub: resubscribed to asset set");
            *subscribed = new_set;
        }
    }

    pub fn subscribed_assets(&self) -> Vec<String> {
        self.subscribed.read().iter().cloned().collect()
    }

    /// Called by each market-data task on every tick.
    pub fn on_snapshot(&self, asset: &str, snapshot: MarketSnapshot) {
        self.snapshots.write().insert(asset.to_string(), snapshot.clone());
        self.last_tick_at.write().insert(asset.to_string(), Instant::now());
        debug!(asset, bid = %snapshot.bid, ask = %snapshot.ask, "market data hub: snapshot updated");
        let _ = self.tx.send(snapshot);
    }

    pub fn get_snapshot(&self, asset: &str) -> Option<MarketSnapshot> {
        self.snapshots.read().get(asset).cloned()
    }

    pub fn get_all_snapshots(&self) -> HashMap<String, MarketSnapshot> {
        self.snapshots.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketSnapshot> {
        self.tx.subscribe()
    }

    /// Seconds since the last tick for `asset`, or `None` if never ticked.
    pub fn staleness_secs(&self, asset: &str) -> Option<u64> {
        self.last_tick_at
            .read()
            .get(asset)
            .map(|instant| instant.elapsed().as_secs())
    }
}

impl Default for MarketDataHub {
    fn default() -> Self {
        Self::new()
    }
}
