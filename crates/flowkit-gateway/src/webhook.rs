//! HTTP webhook boundary (§6): trigger emissions and await resolutions.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use flowkit_core::trigger::TriggerType;
use flowkit_engine::AwaitError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/webhook/trigger/:trigger_name", post(fire_trigger))
        .route("/webhook/await/:flow_name/:run_id/:step_name", get(resolve_await).post(resolve_await))
}

#[derive(Serialize)]
struct TriggerFiredResponse {
    success: bool,
    #[serde(rename = "subscribedFlows")]
    subscribed_flows: Vec<String>,
}

async fn fire_trigger(State(state): State<AppState>, Path(trigger_name): Path<String>, body: Option<Json<Value>>) -> Result<Json<TriggerFiredResponse>, StatusCode> {
    let triggers = &state.engine.triggers;
    let trigger = triggers.get_trigger(&trigger_name).await.map_err(|err| {
        tracing::error!(error = %err, trigger_name, "failed to read trigger");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let Some(trigger) = trigger else { return Err(StatusCode::NOT_FOUND) };
    if trigger.trigger_type != TriggerType::Webhook {
        return Err(StatusCode::METHOD_NOT_ALLOWED);
    }

    let payload = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let subscribed_flows = triggers.emit_trigger(&trigger_name, payload).await.map_err(|err| {
        tracing::error!(error = %err, trigger_name, "trigger emission failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(TriggerFiredResponse { success: true, subscribed_flows }))
}

#[derive(Deserialize)]
struct AwaitQuery {
    t: String,
}

#[derive(Serialize)]
struct AwaitResolvedResponse {
    resolved: bool,
}

async fn resolve_await(
    State(state): State<AppState>,
    Path((flow_name, run_id, step_name)): Path<(String, Uuid, String)>,
    Query(query): Query<AwaitQuery>,
    body: Option<Json<Value>>,
) -> Result<Json<AwaitResolvedResponse>, StatusCode> {
    let payload = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let awaits = &state.engine.awaits;

    match awaits.resolve_webhook(run_id, &step_name, &flow_name, "before", &query.t, payload.clone()).await {
        Ok(()) => return Ok(Json(AwaitResolvedResponse { resolved: true })),
        Err(AwaitError::NotFound { .. }) => {}
        Err(AwaitError::TokenMismatch { .. }) => return Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            tracing::error!(error = %err, "await resolution failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    match awaits.resolve_webhook(run_id, &step_name, &flow_name, "after", &query.t, payload).await {
        Ok(()) => Ok(Json(AwaitResolvedResponse { resolved: true })),
        Err(AwaitError::NotFound { .. }) => Err(StatusCode::GONE),
        Err(AwaitError::TokenMismatch { .. }) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            tracing::error!(error = %err, "await resolution failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}
