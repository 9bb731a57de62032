// =============================================================================
// Execution Service — Main Entry Point
// =============================================================================
//
// Starts in whatever operation mode was last persisted (paper by default on a
// fresh state directory). Promotion to live trading is an explicit operator
// command through the REST API, never a startup flag.
// =============================================================================

mod api;
mod app_state;
mod condition;
mod config;
mod entry_evaluator;
mod errors;
mod event_log;
mod exchange;
mod exit_evaluator;
mod failure_tracker;
mod market_data;
mod operation_mode;
mod order_router;
mod persist;
mod position_registry;
mod position_sizer;
mod reconcile;
mod risk;
mod safe_mode;
mod strategy_service;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ServiceConfig;
use crate::entry_evaluator::EntryEvaluator;
use crate::event_log::EventLog;
use crate::exchange::live::{LiveAdapterConfig, LiveExchangeAdapter};
use crate::exchange::paper::PaperExchangeAdapter;
use crate::exchange::ExchangeAdapter;
use crate::exit_evaluator::ExitEvaluator;
use crate::failure_tracker::FailureTracker;
use crate::market_data::MarketDataHub;
use crate::operation_mode::OperationModeController;
use crate::order_router::OrderRouter;
use crate::position_registry::PositionRegistry;
use crate::position_sizer::{LotRules, PositionSizer};
use crate::risk::RiskEnforcer;
use crate::safe_mode::SafeModeController;
use crate::strategy_service::StrategyService;
use crate::types::{MarketSnapshot, OperationMode};

/// Cadence of the main entry/exit evaluation loop. Strategy hot-reload and
/// validity checks run on their own, independently configured intervals.
const TICK_INTERVAL: Duration = Duration::from_millis(1000);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("execution service starting up");

    let config = ServiceConfig::from_env()?;

    let event_log = Arc::new(EventLog::new(config.state_dir.join("events"), true)?);

    let registry = Arc::new(PositionRegistry::new(config.state_dir.clone(), event_log.clone()));
    registry.load()?;

    let failure_tracker = Arc::new(FailureTracker::new(
        config.state_dir.join("failure_count.json"),
        config.consecutive_failure_limit,
    ));
    failure_tracker.load();

    let safe_mode = Arc::new(SafeModeController::new(config.state_dir.join("safe_mode.json"), event_log.clone()));
    safe_mode.load();

    let mode_controller = Arc::new(OperationModeController::new(
        config.state_dir.join("operation_mode.json"),
        event_log.clone(),
    ));
    mode_controller.load();

    let market = Arc::new(MarketDataHub::new());

    let exchange: Arc<dyn ExchangeAdapter> = match mode_controller.current() {
        OperationMode::Paper => Arc::new(PaperExchangeAdapter::new(
            config.paper_initial_balance_usd,
            config.paper_slippage_pct,
            config.paper_commission_rate,
            market.snapshots_handle(),
        )),
        OperationMode::Live => Arc::new(LiveExchangeAdapter::new(LiveAdapterConfig {
            api_key: config.exchange_api_key.clone(),
            api_secret: config.exchange_api_secret.clone(),
            base_url: config.exchange_base_url.clone(),
            ws_base_url: config.exchange_ws_url.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts as u32,
            reconnect_delay_seconds: config.reconnect_delay_seconds,
        })),
    };

    let strategy_service = Arc::new(StrategyService::new(
        config.strategy_path.clone(),
        config.reload_latency_ms,
        event_log.clone(),
    ));

    let initial_equity = match exchange.get_account_balance().await {
        Ok(balance) => balance.available_usd,
        Err(e) => {
            warn!(error = %e, "failed to fetch initial account balance, falling back to configured paper balance");
            config.paper_initial_balance_usd
        }
    };
    let risk = Arc::new(RiskEnforcer::new(initial_equity, event_log.clone()));

    let order_router = Arc::new(OrderRouter::new(
        exchange.clone(),
        registry.clone(),
        event_log.clone(),
        failure_tracker.clone(),
        safe_mode.clone(),
    ));

    let sizer = PositionSizer::new(
        LotRules::new(config.default_lot_increment, config.default_min_lot_size),
        event_log.clone(),
    );
    let entry_evaluator = EntryEvaluator::new(event_log.clone());
    let exit_evaluator = ExitEvaluator::new(event_log.clone());

    // Market data is public to the exchange regardless of which adapter
    // routes orders, so it always flows from a live feed even in paper mode.
    let feed_adapter = Arc::new(LiveExchangeAdapter::new(LiveAdapterConfig {
        api_key: config.exchange_api_key.clone(),
        api_secret: config.exchange_api_secret.clone(),
        base_url: config.exchange_base_url.clone(),
        ws_base_url: config.exchange_ws_url.clone(),
        max_reconnect_attempts: config.max_reconnect_attempts as u32,
        reconnect_delay_seconds: config.reconnect_delay_seconds,
    }));

    let bind_address = config.bind_address.clone();
    let validity_check_interval_ms = config.validity_check_interval_ms;

    let state = Arc::new(AppState::new(
        config,
        event_log.clone(),
        registry.clone(),
        order_router.clone(),
        risk.clone(),
        safe_mode.clone(),
        failure_tracker.clone(),
        mode_controller.clone(),
        market.clone(),
        strategy_service.clone(),
        exchange.clone(),
    ));

    // ── Startup reconciliation, one shot ─────────────────────────────────
    {
        let registry = registry.clone();
        let exchange = exchange.clone();
        let safe_mode = safe_mode.clone();
        let event_log = event_log.clone();
        let mode = mode_controller.current();
        tokio::spawn(async move {
            reconcile::reconcile(&registry, &exchange, &safe_mode, &event_log, mode).await;
        });
    }

    // ── Market data feed, reconnect with backoff on error ────────────────
    {
        let market = market.clone();
        let strategy_service = strategy_service.clone();
        let feed_adapter = feed_adapter.clone();
        tokio::spawn(async move {
            loop {
                let assets = strategy_service.active().map(|s| s.assets()).unwrap_or_default();
                if assets.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                market.resubscribe(&assets);
                let hub = market.clone();
                let result = feed_adapter
                    .subscribe_market_data(assets, move |tick| {
                        hub.on_snapshot(
                            &tick.asset,
                            MarketSnapshot {
                                bid: tick.bid,
                                ask: tick.ask,
                                timestamp: Some(tick.timestamp),
                                indicators: HashMap::new(),
                            },
                        );
                    })
                    .await;

                if let Err(e) = result {
                    error!(error = %e, "market data feed error — reconnecting");
                }
                tokio::time::sleep(Duration::from_secs(feed_adapter.reconnect_delay_seconds)).await;
            }
        });
    }

    // ── Rate-limit backoff watcher ────────────────────────────────────────
    // The adapters flip a flag when the exchange reports a rate limit; this
    // task is the only thing watching for the transition so the
    // started/ended events fire exactly once per episode instead of once
    // per tick the router happens to skip a placement on.
    {
        let exchange = exchange.clone();
        let event_log = event_log.clone();
        let mode_controller = mode_controller.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            let mut was_limited = false;
            loop {
                interval.tick().await;
                let mode = mode_controller.current();
                let is_limited = exchange.is_rate_limited();
                if is_limited && !was_limited {
                    warn!("rate limit backoff started");
                    event_log.append(crate::event_log::ExecutionEvent::new(
                        "rate_limit_backoff_started",
                        mode,
                        serde_json::json!({
                            "resumes_at": exchange.rate_limit_resumes_at(),
                        }),
                    ));
                } else if !is_limited && was_limited {
                    info!("rate limit backoff ended");
                    event_log.append(crate::event_log::ExecutionEvent::new(
                        "rate_limit_backoff_ended",
                        mode,
                        serde_json::json!({}),
                    ));
                }
                was_limited = is_limited;
            }
        });
    }

    // ── Strategy hot-reload watcher ───────────────────────────────────────
    {
        let strategy_service = strategy_service.clone();
        let mode_controller = mode_controller.clone();
        let market = market.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(strategy_service.reload_latency());
            loop {
                interval.tick().await;
                let mode = mode_controller.current();
                if strategy_service.try_reload(mode) {
                    if let Some(active) = strategy_service.active() {
                        market.resubscribe(&active.assets());
                    }
                }
            }
        });
    }

    // ── Strategy validity watcher ─────────────────────────────────────────
    {
        let strategy_service = strategy_service.clone();
        let mode_controller = mode_controller.clone();
        let order_router = order_router.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(validity_check_interval_ms));
            loop {
                interval.tick().await;
                let mode = mode_controller.current();
                if strategy_service.check_validity(mode) {
                    for pending in order_router.pending_orders() {
                        info!(internal_id = %pending.internal_id, "cancelling pending order, strategy expired");
                        order_router.cancel_order(&pending.internal_id, mode).await;
                    }
                }
            }
        });
    }

    // ── Main tick loop: entries, exits, fill polling ─────────────────────
    {
        let strategy_service = strategy_service.clone();
        let mode_controller = mode_controller.clone();
        let market = market.clone();
        let registry = registry.clone();
        let risk = risk.clone();
        let safe_mode = safe_mode.clone();
        let order_router = order_router.clone();
        let exchange = exchange.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let mode = mode_controller.current();
                let strategy = strategy_service.active();

                let available_balance = match exchange.get_account_balance().await {
                    Ok(balance) => balance.available_usd,
                    Err(e) => {
                        warn!(error = %e, "tick: failed to fetch account balance, skipping entry evaluation");
                        continue;
                    }
                };

                let open_positions = registry.get_open_positions();
                let total_notional: rust_decimal::Decimal =
                    open_positions.iter().map(|p| p.notional()).sum();
                let equity = available_balance + total_notional;

                if let Some(active) = &strategy {
                    let just_triggered = risk.evaluate(equity, total_notional, &active.doc.portfolio_risk, mode);
                    if just_triggered {
                        safe_mode.activate("drawdown_breach", &registry, &order_router, mode).await;
                    }
                }

                if !safe_mode.is_active() && !risk.entries_suspended() {
                    if let Some(active) = &strategy {
                        entry_evaluator
                            .evaluate_tick(active, &market, &risk, &sizer, &order_router, available_balance, mode)
                            .await;
                    }
                }

                exit_evaluator
                    .evaluate_tick(strategy.as_deref(), &registry, &market, &order_router, mode)
                    .await;

                let strategy_id = strategy.as_ref().map(|s| s.strategy_id.clone()).unwrap_or_else(|| "none".to_string());
                order_router.poll_fills(&strategy_id, mode).await;

                state.increment_version();
            }
        });
    }

    // ── HTTP + WebSocket server ───────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let app = api::rest::router(state);
            let listener = match tokio::net::TcpListener::bind(&bind_address).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %bind_address, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_address, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server terminated unexpectedly");
            }
        });
    }

    info!("all subsystems running, press ctrl+c to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");

    Ok(())
}
