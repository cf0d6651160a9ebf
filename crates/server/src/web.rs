//! REST surface: zone CRUD, history listings, alert acknowledgement, manual
//! watering, and the on-demand cycle trigger.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::db::{
    now_unix, AlertEvent, AlertFilter, Db, HistoryFilter, NewZone, PumpEvent, Reading, Zone,
    ZonePatch,
};
use crate::error::{AppError, AppResult};
use crate::monitor::{CycleOutcome, Monitor};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub monitor: Arc<Monitor>,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ManualWaterRequest {
    pub duration_sec: Option<i64>,
}

/// Aggregate per-zone view: config plus the latest observed facts.
#[derive(Debug, Serialize)]
pub struct StatusItem {
    pub zone: Zone,
    pub latest_reading: Option<Reading>,
    pub last_pump_event: Option<PumpEvent>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/zones", get(list_zones).post(create_zone))
        .route("/api/zones/{id}", patch(update_zone).delete(delete_zone))
        .route("/api/zones/{id}/water", post(manual_water))
        .route("/api/readings", get(list_readings))
        .route("/api/pump-events", get(list_pump_events))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/{id}/ack", post(acknowledge_alert))
        .route("/api/status", get(zone_status))
        .route("/api/run-cycle", post(run_cycle))
        .route("/api/reset-db", post(reset_db))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// -- Zones ------------------------------------------------------------------

async fn list_zones(State(state): State<AppState>) -> AppResult<Json<Vec<Zone>>> {
    Ok(Json(state.db.list_zones().await?))
}

async fn create_zone(
    State(state): State<AppState>,
    Json(payload): Json<NewZone>,
) -> AppResult<(StatusCode, Json<Zone>)> {
    validate_zone_numbers(
        payload.threshold,
        payload.cooldown_hours,
        payload.water_duration_sec,
    )?;
    let zone = state.db.create_zone(&payload).await?;
    Ok((StatusCode::CREATED, Json(zone)))
}

async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<ZonePatch>,
) -> AppResult<Json<Zone>> {
    validate_zone_numbers(
        patch.threshold.unwrap_or(0),
        patch.cooldown_hours.unwrap_or(0),
        patch.water_duration_sec.unwrap_or(0),
    )?;
    let zone = state
        .db
        .update_zone(id, &patch)
        .await?
        .ok_or(AppError::NotFound("Zone"))?;
    Ok(Json(zone))
}

async fn delete_zone(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<StatusCode> {
    if state.db.delete_zone(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Zone"))
    }
}

/// Negative numbers never make sense for these fields; the core assumes the
/// API layer keeps them out of the store.
fn validate_zone_numbers(threshold: i64, cooldown_hours: i64, water_duration_sec: i64) -> AppResult<()> {
    if threshold < 0 {
        return Err(AppError::Validation("threshold must be non-negative".into()));
    }
    if cooldown_hours < 0 {
        return Err(AppError::Validation("cooldown_hours must be non-negative".into()));
    }
    if water_duration_sec < 0 {
        return Err(AppError::Validation(
            "water_duration_sec must be non-negative".into(),
        ));
    }
    Ok(())
}

// -- Watering ----------------------------------------------------------------

async fn manual_water(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ManualWaterRequest>,
) -> AppResult<Json<PumpEvent>> {
    let event = state.monitor.manual_water(id, payload.duration_sec).await?;
    Ok(Json(event))
}

async fn run_cycle(State(state): State<AppState>) -> AppResult<Json<CycleOutcome>> {
    let outcome = state.monitor.run_cycle().await?;
    Ok(Json(outcome))
}

// -- Histories ----------------------------------------------------------------

async fn list_readings(
    State(state): State<AppState>,
    Query(filter): Query<HistoryFilter>,
) -> AppResult<Json<Vec<Reading>>> {
    Ok(Json(state.db.list_readings(&filter).await?))
}

async fn list_pump_events(
    State(state): State<AppState>,
    Query(filter): Query<HistoryFilter>,
) -> AppResult<Json<Vec<PumpEvent>>> {
    Ok(Json(state.db.list_pump_events(&filter).await?))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(filter): Query<AlertFilter>,
) -> AppResult<Json<Vec<AlertEvent>>> {
    Ok(Json(state.db.list_alerts(&filter).await?))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<AlertEvent>> {
    let alert = state
        .db
        .acknowledge_alert(id, now_unix())
        .await?
        .ok_or(AppError::NotFound("Alert"))?;
    Ok(Json(alert))
}

// -- Status / maintenance -----------------------------------------------------

async fn zone_status(State(state): State<AppState>) -> AppResult<Json<Vec<StatusItem>>> {
    let zones = state.db.list_zones().await?;
    let mut items = Vec::with_capacity(zones.len());
    for zone in zones {
        let latest_reading = state.db.latest_reading(zone.id).await?;
        let last_pump_event = crate::db::latest_pump_event(state.db.pool(), zone.id).await?;
        items.push(StatusItem {
            zone,
            latest_reading,
            last_pump_event,
        });
    }
    Ok(Json(items))
}

async fn reset_db(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    state.db.reset().await?;
    Ok(Json(json!({ "status": "reset" })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;

    tracing::info!("api listening on http://{bind_addr}");

    axum::serve(listener, router(state))
        .await
        .map_err(Into::into)
}

// ===========================================================================
// Tests
// ===========================================================================
