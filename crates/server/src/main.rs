mod config;
mod db;
mod error;
mod monitor;
mod pump;
mod scheduler;
mod sensor;
mod web;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Settings;
use db::Db;
use monitor::Monitor;
use pump::{PumpActuator, PumpController};
use sensor::{SensorManager, SensorReader};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.database_url).await?;
    db.migrate().await?;

    let seeded = config::seed_zones(&db, &settings).await?;
    let zones = db.list_zones().await?;
    if zones.is_empty() {
        tracing::warn!("no zones configured in the database");
    }
    tracing::info!(zones = zones.len(), seeded, "db ready");

    // ── Hardware collaborators ──────────────────────────────────────
    let sensors: Arc<dyn SensorReader> = Arc::new(SensorManager::new(settings.simulate_sensors));
    let pumps: Arc<dyn PumpActuator> = Arc::new(PumpController::new(settings.simulate_pumps));

    let monitor = Arc::new(Monitor::new(
        db.clone(),
        sensors,
        pumps,
        settings.max_pump_seconds,
    ));

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::spawn(scheduler::run(
        Arc::clone(&monitor),
        settings.read_interval_hours,
    ));

    // ── API server ──────────────────────────────────────────────────
    web::serve(AppState { db, monitor }, &settings.bind_addr).await
}
