//! SQLite persistence for zones, readings, pump events, and alert events.
//!
//! Row operations the monitoring cycle performs are free functions generic
//! over the executor, so a whole cycle can run inside one transaction and
//! commit (or roll back) as a batch.  Pool-scoped convenience methods on
//! [`Db`] back the HTTP layer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Pool, Sqlite, Transaction};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    /// Moisture value below which the zone counts as dry (lower = drier).
    pub threshold: i64,
    /// Stored for forward compatibility; the decision logic does not read it.
    pub hysteresis: i64,
    pub cooldown_hours: i64,
    pub water_duration_sec: i64,
    pub sensor_channel: i64,
    /// BCM output pin driving the pump relay.  Absent when the zone has no
    /// actuator wired.
    pub pump_gpio: Option<i64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewZone {
    pub name: String,
    pub threshold: i64,
    pub hysteresis: i64,
    pub cooldown_hours: i64,
    #[serde(default = "default_water_duration")]
    pub water_duration_sec: i64,
    pub sensor_channel: i64,
    #[serde(default)]
    pub pump_gpio: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_water_duration() -> i64 {
    30
}

fn default_enabled() -> bool {
    true
}

/// Partial zone update.  `None` fields stay untouched; `pump_gpio` can be
/// changed but not cleared through this path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZonePatch {
    pub name: Option<String>,
    pub threshold: Option<i64>,
    pub hysteresis: Option<i64>,
    pub cooldown_hours: Option<i64>,
    pub water_duration_sec: Option<i64>,
    pub sensor_channel: Option<i64>,
    pub pump_gpio: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub zone_id: i64,
    pub value: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PumpAction {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PumpReason {
    Manual,
    Threshold,
}

/// A `duration_sec` of `None` means the actuator reported failure; a row with
/// a duration implies the pump physically ran.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PumpEvent {
    pub id: i64,
    pub zone_id: i64,
    pub action: PumpAction,
    pub reason: PumpReason,
    pub duration_sec: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AlertType {
    LowMoisture,
    PumpFailed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertEvent {
    pub id: i64,
    pub zone_id: i64,
    pub alert_type: AlertType,
    pub message: String,
    pub created_at: i64,
    pub acknowledged: bool,
    pub acknowledged_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// List filters
// ---------------------------------------------------------------------------

/// Time-range / zone filter shared by the readings and pump-event listings.
/// Timestamps are unix seconds, inclusive on both ends.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryFilter {
    pub zone_id: Option<i64>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AlertFilter {
    pub zone_id: Option<i64>,
    pub alert_type: Option<AlertType>,
    pub acknowledged: Option<bool>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

const READING_COLUMNS: &str = "id, zone_id, value, created_at";
const ZONE_COLUMNS: &str = "id, name, threshold, hysteresis, cooldown_hours, \
     water_duration_sec, sensor_channel, pump_gpio, enabled";
const PUMP_EVENT_COLUMNS: &str = "id, zone_id, action, reason, duration_sec, created_at";
const ALERT_COLUMNS: &str =
    "id, zone_id, alert_type, message, created_at, acknowledged, acknowledged_at";

/// Hard caps on list endpoints.
const HISTORY_LIMIT: i64 = 500;
const ALERT_LIMIT: i64 = 200;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:waterpal.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory SQLite database exists per connection; cap the pool at
        // one so every caller sees the same database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("failed to begin transaction")
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn create_zone(&self, z: &NewZone) -> Result<Zone> {
        let sql = format!(
            "INSERT INTO zones (name, threshold, hysteresis, cooldown_hours, \
                 water_duration_sec, sensor_channel, pump_gpio, enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {ZONE_COLUMNS}"
        );
        sqlx::query_as::<_, Zone>(&sql)
            .bind(&z.name)
            .bind(z.threshold)
            .bind(z.hysteresis)
            .bind(z.cooldown_hours)
            .bind(z.water_duration_sec)
            .bind(z.sensor_channel)
            .bind(z.pump_gpio)
            .bind(z.enabled)
            .fetch_one(&self.pool)
            .await
            .context("create_zone failed")
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        let sql = format!("SELECT {ZONE_COLUMNS} FROM zones ORDER BY id");
        sqlx::query_as::<_, Zone>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("list_zones failed")
    }

    pub async fn get_zone(&self, id: i64) -> Result<Option<Zone>> {
        let sql = format!("SELECT {ZONE_COLUMNS} FROM zones WHERE id = ?");
        sqlx::query_as::<_, Zone>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_zone failed")
    }

    /// Applies a partial update and returns the new row, or `None` when the
    /// zone does not exist.
    pub async fn update_zone(&self, id: i64, patch: &ZonePatch) -> Result<Option<Zone>> {
        let Some(current) = self.get_zone(id).await? else {
            return Ok(None);
        };

        let sql = format!(
            "UPDATE zones SET name = ?, threshold = ?, hysteresis = ?, \
                 cooldown_hours = ?, water_duration_sec = ?, sensor_channel = ?, \
                 pump_gpio = ?, enabled = ? \
             WHERE id = ? \
             RETURNING {ZONE_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Zone>(&sql)
            .bind(patch.name.as_deref().unwrap_or(&current.name))
            .bind(patch.threshold.unwrap_or(current.threshold))
            .bind(patch.hysteresis.unwrap_or(current.hysteresis))
            .bind(patch.cooldown_hours.unwrap_or(current.cooldown_hours))
            .bind(patch.water_duration_sec.unwrap_or(current.water_duration_sec))
            .bind(patch.sensor_channel.unwrap_or(current.sensor_channel))
            .bind(patch.pump_gpio.or(current.pump_gpio))
            .bind(patch.enabled.unwrap_or(current.enabled))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("update_zone failed")?;
        Ok(Some(updated))
    }

    pub async fn delete_zone(&self, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM zones WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_zone failed")?;
        Ok(done.rows_affected() > 0)
    }

    // ----------------------------
    // Histories (newest first)
    // ----------------------------

    pub async fn list_readings(&self, f: &HistoryFilter) -> Result<Vec<Reading>> {
        let mut sql = format!("SELECT {READING_COLUMNS} FROM readings WHERE 1=1");
        push_history_clauses(&mut sql, f);
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let q = sqlx::query_as::<_, Reading>(&sql);
        bind_history(q, f)
            .bind(HISTORY_LIMIT)
            .fetch_all(&self.pool)
            .await
            .context("list_readings failed")
    }

    pub async fn latest_reading(&self, zone_id: i64) -> Result<Option<Reading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM readings WHERE zone_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        sqlx::query_as::<_, Reading>(&sql)
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .context("latest_reading failed")
    }

    pub async fn list_pump_events(&self, f: &HistoryFilter) -> Result<Vec<PumpEvent>> {
        let mut sql = format!("SELECT {PUMP_EVENT_COLUMNS} FROM pump_events WHERE 1=1");
        push_history_clauses(&mut sql, f);
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let q = sqlx::query_as::<_, PumpEvent>(&sql);
        bind_history(q, f)
            .bind(HISTORY_LIMIT)
            .fetch_all(&self.pool)
            .await
            .context("list_pump_events failed")
    }

    pub async fn list_alerts(&self, f: &AlertFilter) -> Result<Vec<AlertEvent>> {
        let mut sql = format!("SELECT {ALERT_COLUMNS} FROM alert_events WHERE 1=1");
        if f.zone_id.is_some() {
            sql.push_str(" AND zone_id = ?");
        }
        if f.alert_type.is_some() {
            sql.push_str(" AND alert_type = ?");
        }
        if f.acknowledged.is_some() {
            sql.push_str(" AND acknowledged = ?");
        }
        if f.start.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if f.end.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, AlertEvent>(&sql);
        if let Some(zone_id) = f.zone_id {
            q = q.bind(zone_id);
        }
        if let Some(alert_type) = f.alert_type {
            q = q.bind(alert_type);
        }
        if let Some(acknowledged) = f.acknowledged {
            q = q.bind(acknowledged);
        }
        if let Some(start) = f.start {
            q = q.bind(start);
        }
        if let Some(end) = f.end {
            q = q.bind(end);
        }
        q.bind(ALERT_LIMIT)
            .fetch_all(&self.pool)
            .await
            .context("list_alerts failed")
    }

    /// Marks an alert acknowledged.  Acknowledging twice is a no-op on the
    /// second call; the stored `acknowledged_at` keeps its original value.
    pub async fn acknowledge_alert(&self, id: i64, now: i64) -> Result<Option<AlertEvent>> {
        sqlx::query(
            "UPDATE alert_events SET acknowledged = 1, acknowledged_at = ? \
             WHERE id = ? AND acknowledged = 0",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("acknowledge_alert failed")?;

        let sql = format!("SELECT {ALERT_COLUMNS} FROM alert_events WHERE id = ?");
        sqlx::query_as::<_, AlertEvent>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("acknowledge_alert fetch failed")
    }

    /// Wipes every table.  Development convenience behind /api/reset-db.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.begin().await?;
        for table in ["alert_events", "pump_events", "readings", "zones"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("reset: clearing {table} failed"))?;
        }
        tx.commit().await.context("reset commit failed")
    }
}

fn push_history_clauses(sql: &mut String, f: &HistoryFilter) {
    if f.zone_id.is_some() {
        sql.push_str(" AND zone_id = ?");
    }
    if f.start.is_some() {
        sql.push_str(" AND created_at >= ?");
    }
    if f.end.is_some() {
        sql.push_str(" AND created_at <= ?");
    }
}

fn bind_history<'q, T>(
    mut q: sqlx::query::QueryAs<'q, Sqlite, T, sqlx::sqlite::SqliteArguments<'q>>,
    f: &HistoryFilter,
) -> sqlx::query::QueryAs<'q, Sqlite, T, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(zone_id) = f.zone_id {
        q = q.bind(zone_id);
    }
    if let Some(start) = f.start {
        q = q.bind(start);
    }
    if let Some(end) = f.end {
        q = q.bind(end);
    }
    q
}

// ---------------------------------------------------------------------------
// Cycle row operations (executor-generic so they compose into a transaction)
// ---------------------------------------------------------------------------

pub async fn enabled_zones<'e, E>(exec: E) -> Result<Vec<Zone>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {ZONE_COLUMNS} FROM zones WHERE enabled = 1 ORDER BY id");
    sqlx::query_as::<_, Zone>(&sql)
        .fetch_all(exec)
        .await
        .context("enabled_zones failed")
}

pub async fn insert_reading<'e, E>(exec: E, zone_id: i64, value: i64, created_at: i64) -> Result<Reading>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO readings (zone_id, value, created_at) VALUES (?, ?, ?) \
         RETURNING {READING_COLUMNS}"
    );
    sqlx::query_as::<_, Reading>(&sql)
        .bind(zone_id)
        .bind(value)
        .bind(created_at)
        .fetch_one(exec)
        .await
        .context("insert_reading failed")
}

pub async fn latest_pump_event<'e, E>(exec: E, zone_id: i64) -> Result<Option<PumpEvent>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {PUMP_EVENT_COLUMNS} FROM pump_events WHERE zone_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    sqlx::query_as::<_, PumpEvent>(&sql)
        .bind(zone_id)
        .fetch_optional(exec)
        .await
        .context("latest_pump_event failed")
}

pub async fn insert_pump_event<'e, E>(
    exec: E,
    zone_id: i64,
    action: PumpAction,
    reason: PumpReason,
    duration_sec: Option<i64>,
    created_at: i64,
) -> Result<PumpEvent>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO pump_events (zone_id, action, reason, duration_sec, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING {PUMP_EVENT_COLUMNS}"
    );
    sqlx::query_as::<_, PumpEvent>(&sql)
        .bind(zone_id)
        .bind(action)
        .bind(reason)
        .bind(duration_sec)
        .bind(created_at)
        .fetch_one(exec)
        .await
        .context("insert_pump_event failed")
}

pub async fn latest_alert<'e, E>(
    exec: E,
    zone_id: i64,
    alert_type: AlertType,
) -> Result<Option<AlertEvent>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {ALERT_COLUMNS} FROM alert_events WHERE zone_id = ? AND alert_type = ? \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    sqlx::query_as::<_, AlertEvent>(&sql)
        .bind(zone_id)
        .bind(alert_type)
        .fetch_optional(exec)
        .await
        .context("latest_alert failed")
}

pub async fn insert_alert<'e, E>(
    exec: E,
    zone_id: i64,
    alert_type: AlertType,
    message: &str,
    created_at: i64,
) -> Result<AlertEvent>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO alert_events (zone_id, alert_type, message, created_at) \
         VALUES (?, ?, ?, ?) \
         RETURNING {ALERT_COLUMNS}"
    );
    sqlx::query_as::<_, AlertEvent>(&sql)
        .bind(zone_id)
        .bind(alert_type)
        .bind(message)
        .bind(created_at)
        .fetch_one(exec)
        .await
        .context("insert_alert failed")
}

// ===========================================================================
// Tests
// ===========================================================================
