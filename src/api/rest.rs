// =============================================================================
// REST API — Axum 0.7
// =============================================================================
//
// Everything under `/api/v1/` except `/health` requires a valid Bearer token,
// checked via the `AuthBearer` extractor. Every state-mutating endpoint emits
// an `operator_command` event so the action shows up in the same audit trail
// as automated decisions.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::event_log::ExecutionEvent;
use crate::types::OperationMode;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/orders", get(orders))
        .route("/api/v1/orders/:internal_id", get(order_detail))
        .route("/api/v1/events", get(recent_events))
        .route("/api/v1/safe-mode/activate", post(activate_safe_mode))
        .route("/api/v1/safe-mode/deactivate", post(deactivate_safe_mode))
        .route("/api/v1/mode", post(change_mode))
        .route("/api/v1/strategy/reload", post(force_reload))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Status snapshot
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Positions / trades / orders
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.get_open_positions())
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.registry.get_closed_trades(query.limit.unwrap_or(100)))
}

async fn orders(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.pending_orders())
}

async fn order_detail(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(internal_id): Path<String>,
) -> impl IntoResponse {
    match state.router.get_order(&internal_id) {
        Some(order) => Json(order).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "order not found" }))).into_response(),
    }
}

// =============================================================================
// Event log
// =============================================================================

async fn recent_events(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.event_log.get_recent(query.limit.unwrap_or(100)))
}

// =============================================================================
// Safe mode controls
// =============================================================================

#[derive(Deserialize)]
struct SafeModeActivateRequest {
    reason: String,
}

async fn activate_safe_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SafeModeActivateRequest>,
) -> impl IntoResponse {
    let mode = state.mode_controller.current();
    state
        .safe_mode
        .activate(&req.reason, &state.registry, &state.router, mode)
        .await;
    state.increment_version();
    warn!(reason = %req.reason, "safe mode activated via operator command");
    state.event_log.append(ExecutionEvent::new(
        "operator_command",
        mode,
        serde_json::json!({ "command": "safe_mode_activate", "reason": req.reason }),
    ));
    Json(serde_json::json!({ "active": true }))
}

async fn deactivate_safe_mode(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mode = state.mode_controller.current();
    state.safe_mode.deactivate(&state.failure_tracker, mode);
    state.increment_version();
    info!("safe mode deactivated via operator command");
    state.event_log.append(ExecutionEvent::new(
        "operator_command",
        mode,
        serde_json::json!({ "command": "safe_mode_deactivate" }),
    ));
    Json(serde_json::json!({ "active": false }))
}

// =============================================================================
// Mode promotion / demotion
// =============================================================================

#[derive(Deserialize)]
struct ModeChangeRequest {
    mode: String,
    #[serde(default)]
    note: String,
}

async fn change_mode(
    auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ModeChangeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let new_mode = match req.mode.to_lowercase().as_str() {
        "paper" => OperationMode::Paper,
        "live" => OperationMode::Live,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid mode '{other}', expected 'paper' or 'live'") })),
            ));
        }
    };

    state.mode_controller.transition(new_mode, &auth.0, &req.note);
    state.increment_version();
    state.event_log.append(ExecutionEvent::new(
        "operator_command",
        new_mode,
        serde_json::json!({ "command": "mode_change", "new_mode": req.mode, "note": req.note }),
    ));
    Ok(Json(serde_json::json!({ "mode": new_mode.to_string() })))
}

// =============================================================================
// Strategy force reload
// =============================================================================

async fn force_reload(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mode = state.mode_controller.current();
    let reloaded = state.strategy_service.try_reload(mode);
    state.increment_version();
    state.event_log.append(ExecutionEvent::new(
        "operator_command",
        mode,
        serde_json::json!({ "command": "force_reload", "reloaded": reloaded }),
    ));
    Json(serde_json::json!({ "reloaded": reloaded }))
}
