//! Monitoring cycle: turns a raw sensor reading per zone into a watering
//! decision with cooldown suppression and alerting.
//!
//! Each cycle recomputes every decision from the persisted event histories —
//! no state is carried between invocations — and writes the whole batch of
//! readings and events in one transaction.  A zone whose sensor yields no
//! value is skipped outright: no reading, no decision, no alert.
//!
//! Alerting and actuation are two separate cooldown-gated policies.  They
//! share the zone's cooldown window length but anchor to different
//! histories: low-moisture alerts look at the alert history, the watering
//! decision looks at the pump-event history.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::{self, now_unix, AlertType, Db, PumpAction, PumpEvent, PumpReason, Zone};
use crate::error::AppError;
use crate::pump::PumpActuator;
use crate::sensor::SensorReader;

/// Manual watering durations accepted from the API.
const MANUAL_DURATION_RANGE: std::ops::RangeInclusive<i64> = 1..=600;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleOutcome {
    pub readings_saved: u32,
    pub pumps_run: u32,
}

pub struct Monitor {
    db: Db,
    sensors: Arc<dyn SensorReader>,
    pumps: Arc<dyn PumpActuator>,
    /// Hard ceiling on any single pump run, independent of per-zone config.
    max_pump_seconds: i64,
    /// At most one actuation sequence in flight: scheduled cycles, on-demand
    /// cycles, and manual watering all take this lock.
    gate: Mutex<()>,
}

impl Monitor {
    pub fn new(
        db: Db,
        sensors: Arc<dyn SensorReader>,
        pumps: Arc<dyn PumpActuator>,
        max_pump_seconds: i64,
    ) -> Self {
        Self {
            db,
            sensors,
            pumps,
            max_pump_seconds,
            gate: Mutex::new(()),
        }
    }

    /// Runs one monitoring cycle across all enabled zones, in id order.
    ///
    /// All rows written by the cycle commit together at the end; a failure
    /// mid-loop rolls the whole batch back and the next scheduled invocation
    /// is the retry.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let _gate = self.gate.lock().await;
        let now = now_unix();
        let mut outcome = CycleOutcome::default();

        let mut tx = self.db.begin().await?;
        let zones = db::enabled_zones(&mut *tx).await?;

        for zone in &zones {
            let Some(value) = self.sensors.read_channel(zone.sensor_channel) else {
                tracing::warn!(
                    zone = zone.id,
                    channel = zone.sensor_channel,
                    "no reading — skipping zone"
                );
                continue;
            };

            db::insert_reading(&mut *tx, zone.id, value, now).await?;
            outcome.readings_saved += 1;

            if value < zone.threshold {
                let last_alert =
                    db::latest_alert(&mut *tx, zone.id, AlertType::LowMoisture).await?;
                if cooldown_elapsed(zone, last_alert.map(|a| a.created_at), now) {
                    db::insert_alert(
                        &mut *tx,
                        zone.id,
                        AlertType::LowMoisture,
                        &format!(
                            "Moisture reading {value} below threshold {}.",
                            zone.threshold
                        ),
                        now,
                    )
                    .await?;
                }
            }

            let last_event = db::latest_pump_event(&mut *tx, zone.id).await?;
            if !should_water(zone, value, last_event.map(|e| e.created_at), now) {
                continue;
            }

            let duration = zone.water_duration_sec.min(self.max_pump_seconds);
            if self.pumps.run(zone.pump_gpio, duration).await {
                db::insert_pump_event(
                    &mut *tx,
                    zone.id,
                    PumpAction::Auto,
                    PumpReason::Threshold,
                    Some(duration),
                    now,
                )
                .await?;
                outcome.pumps_run += 1;
                tracing::info!(zone = zone.id, duration_sec = duration, value, "watered zone");
            } else {
                db::insert_alert(
                    &mut *tx,
                    zone.id,
                    AlertType::PumpFailed,
                    "Pump failed to run during automatic cycle.",
                    now,
                )
                .await?;
                tracing::warn!(zone = zone.id, "pump failed during automatic cycle");
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Waters a zone on demand, sharing the actuator path and the pump-event
    /// history with the automatic cycle — a manual run therefore pushes back
    /// the next automatic cooldown window.
    pub async fn manual_water(
        &self,
        zone_id: i64,
        requested_sec: Option<i64>,
    ) -> Result<PumpEvent, AppError> {
        if let Some(sec) = requested_sec {
            if !MANUAL_DURATION_RANGE.contains(&sec) {
                return Err(AppError::Validation(format!(
                    "duration_sec must be between {} and {}",
                    MANUAL_DURATION_RANGE.start(),
                    MANUAL_DURATION_RANGE.end()
                )));
            }
        }

        let zone = self
            .db
            .get_zone(zone_id)
            .await?
            .ok_or(AppError::NotFound("Zone"))?;
        if !zone.enabled {
            return Err(AppError::ZoneDisabled);
        }

        let _gate = self.gate.lock().await;
        let duration = requested_sec
            .unwrap_or(zone.water_duration_sec)
            .min(self.max_pump_seconds);
        let ran = self.pumps.run(zone.pump_gpio, duration).await;

        let event = db::insert_pump_event(
            self.db.pool(),
            zone.id,
            PumpAction::Manual,
            PumpReason::Manual,
            ran.then_some(duration),
            now_unix(),
        )
        .await?;
        tracing::info!(zone = zone.id, duration_sec = duration, ran, "manual watering");
        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// Decision helpers
// ---------------------------------------------------------------------------

/// Whether the zone should be watered now.
///
/// Wet enough: no.  Never watered: yes.  Otherwise only once the cooldown
/// window since the last pump event (manual or automatic) has fully elapsed.
fn should_water(zone: &Zone, value: i64, last_event_at: Option<i64>, now: i64) -> bool {
    if value >= zone.threshold {
        return false;
    }
    cooldown_elapsed(zone, last_event_at, now)
}

fn cooldown_elapsed(zone: &Zone, last_at: Option<i64>, now: i64) -> bool {
    match last_at {
        None => true,
        Some(at) => now - at >= zone.cooldown_hours * 3600,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AlertFilter, HistoryFilter, NewZone};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Sensor double returning a fixed value per channel; unmapped channels
    /// read as "no reading".
    struct FixedSensors(HashMap<i64, i64>);

    impl FixedSensors {
        fn reading(channel: i64, value: i64) -> Arc<Self> {
            Arc::new(Self(HashMap::from([(channel, value)])))
        }

        fn dead() -> Arc<Self> {
            Arc::new(Self(HashMap::new()))
        }
    }

    impl SensorReader for FixedSensors {
        fn read_channel(&self, channel: i64) -> Option<i64> {
            self.0.get(&channel).copied()
        }
    }

    /// Pump double recording every command and answering a scripted result.
    struct ScriptedPump {
        succeed: bool,
        calls: StdMutex<Vec<(Option<i64>, i64)>>,
    }

    impl ScriptedPump {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Option<i64>, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PumpActuator for ScriptedPump {
        async fn run(&self, gpio_pin: Option<i64>, duration_sec: i64) -> bool {
            self.calls.lock().unwrap().push((gpio_pin, duration_sec));
            self.succeed && gpio_pin.is_some()
        }
    }

    fn test_zone() -> NewZone {
        NewZone {
            name: "Bed A".into(),
            threshold: 16000,
            hysteresis: 800,
            cooldown_hours: 4,
            water_duration_sec: 30,
            sensor_channel: 0,
            pump_gpio: Some(17),
            enabled: true,
        }
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn monitor(db: &Db, sensors: Arc<dyn SensorReader>, pumps: Arc<dyn PumpActuator>) -> Monitor {
        Monitor::new(db.clone(), sensors, pumps, 30)
    }

    async fn pump_events(db: &Db, zone_id: i64) -> Vec<PumpEvent> {
        db.list_pump_events(&HistoryFilter {
            zone_id: Some(zone_id),
            ..HistoryFilter::default()
        })
        .await
        .unwrap()
    }

    async fn alerts(db: &Db, zone_id: i64) -> Vec<crate::db::AlertEvent> {
        db.list_alerts(&AlertFilter {
            zone_id: Some(zone_id),
            ..AlertFilter::default()
        })
        .await
        .unwrap()
    }

    // -- Dry zone, no history: water + alert ------------------------------

    #[tokio::test]
    async fn dry_zone_without_history_waters_and_alerts() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, FixedSensors::reading(0, 15000), pumps.clone());

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.readings_saved, 1);
        assert_eq!(outcome.pumps_run, 1);

        let readings = db
            .list_readings(&HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 15000);

        let events = pump_events(&db, zone.id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, PumpAction::Auto);
        assert_eq!(events[0].reason, PumpReason::Threshold);
        assert_eq!(events[0].duration_sec, Some(30));

        let alerts = alerts(&db, zone.id).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LowMoisture);
        assert_eq!(alerts[0].message, "Moisture reading 15000 below threshold 16000.");

        assert_eq!(pumps.calls(), vec![(Some(17), 30)]);
    }

    // -- Wet zone: reading only, regardless of history --------------------

    #[tokio::test]
    async fn wet_zone_only_records_reading() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        // Stale history must not matter when the soil is wet enough.
        db::insert_pump_event(
            db.pool(),
            zone.id,
            PumpAction::Auto,
            PumpReason::Threshold,
            Some(30),
            now_unix() - 100_000,
        )
        .await
        .unwrap();

        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, FixedSensors::reading(0, 17000), pumps.clone());

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.readings_saved, 1);
        assert_eq!(outcome.pumps_run, 0);
        assert_eq!(pump_events(&db, zone.id).await.len(), 1); // only the seeded one
        assert!(alerts(&db, zone.id).await.is_empty());
        assert!(pumps.calls().is_empty());
    }

    // -- Sensor failure: zone skipped entirely ----------------------------

    #[tokio::test]
    async fn unreadable_sensor_skips_zone() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let mon = monitor(&db, FixedSensors::dead(), ScriptedPump::new(true));

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.readings_saved, 0);
        assert_eq!(outcome.pumps_run, 0);
        assert!(db.list_readings(&HistoryFilter::default()).await.unwrap().is_empty());
        assert!(alerts(&db, zone.id).await.is_empty());
    }

    // -- Cooldown: both boundary sides ------------------------------------

    #[tokio::test]
    async fn cooldown_not_elapsed_suppresses_watering() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        // Last watering 4 h minus one minute ago.
        db::insert_pump_event(
            db.pool(),
            zone.id,
            PumpAction::Auto,
            PumpReason::Threshold,
            Some(30),
            now_unix() - (4 * 3600 - 60),
        )
        .await
        .unwrap();

        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, FixedSensors::reading(0, 15000), pumps.clone());

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.pumps_run, 0);
        assert_eq!(pump_events(&db, zone.id).await.len(), 1);
        assert!(pumps.calls().is_empty());
    }

    #[tokio::test]
    async fn cooldown_elapsed_waters_again() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        // Last watering 4 h plus one minute ago.
        db::insert_pump_event(
            db.pool(),
            zone.id,
            PumpAction::Auto,
            PumpReason::Threshold,
            Some(30),
            now_unix() - (4 * 3600 + 60),
        )
        .await
        .unwrap();

        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.pumps_run, 1);
        assert_eq!(pump_events(&db, zone.id).await.len(), 2);
    }

    #[tokio::test]
    async fn manual_watering_pushes_back_auto_cooldown() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        db::insert_pump_event(
            db.pool(),
            zone.id,
            PumpAction::Manual,
            PumpReason::Manual,
            Some(10),
            now_unix() - 600,
        )
        .await
        .unwrap();

        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.pumps_run, 0);
        assert_eq!(pump_events(&db, zone.id).await.len(), 1);
    }

    // -- Alert suppression -------------------------------------------------

    #[tokio::test]
    async fn consecutive_low_readings_alert_once() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        mon.run_cycle().await.unwrap();
        mon.run_cycle().await.unwrap();

        let alerts = alerts(&db, zone.id).await;
        assert_eq!(alerts.len(), 1, "second low reading within cooldown must not re-alert");
        // The second cycle also sits inside the pump cooldown.
        assert_eq!(pump_events(&db, zone.id).await.len(), 1);
    }

    #[tokio::test]
    async fn alerting_is_independent_of_pump_history() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        // Fresh pump event suppresses watering, but there is no alert history,
        // so the low reading must still raise an alert.
        db::insert_pump_event(
            db.pool(),
            zone.id,
            PumpAction::Auto,
            PumpReason::Threshold,
            Some(30),
            now_unix() - 600,
        )
        .await
        .unwrap();

        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));
        let outcome = mon.run_cycle().await.unwrap();

        assert_eq!(outcome.pumps_run, 0);
        let alerts = alerts(&db, zone.id).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LowMoisture);
    }

    // -- Pump failure -------------------------------------------------------

    #[tokio::test]
    async fn pump_failure_alerts_without_pump_event() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(false));

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.readings_saved, 1);
        assert_eq!(outcome.pumps_run, 0);

        assert!(pump_events(&db, zone.id).await.is_empty());
        let alerts = alerts(&db, zone.id).await;
        let failed: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::PumpFailed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message, "Pump failed to run during automatic cycle.");
    }

    #[tokio::test]
    async fn zone_without_gpio_records_pump_failure() {
        let db = test_db().await;
        let zone = db
            .create_zone(&NewZone {
                pump_gpio: None,
                ..test_zone()
            })
            .await
            .unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.pumps_run, 0);
        assert!(pump_events(&db, zone.id).await.is_empty());
        assert_eq!(alerts(&db, zone.id).await.len(), 2); // low_moisture + pump_failed
    }

    // -- Duration ceiling ---------------------------------------------------

    #[tokio::test]
    async fn water_duration_capped_by_global_ceiling() {
        let db = test_db().await;
        db.create_zone(&NewZone {
            water_duration_sec: 120,
            ..test_zone()
        })
        .await
        .unwrap();
        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, FixedSensors::reading(0, 15000), pumps.clone());

        mon.run_cycle().await.unwrap();
        assert_eq!(pumps.calls(), vec![(Some(17), 30)]);
    }

    // -- Disabled zones -----------------------------------------------------

    #[tokio::test]
    async fn disabled_zone_is_not_processed() {
        let db = test_db().await;
        let zone = db
            .create_zone(&NewZone {
                enabled: false,
                ..test_zone()
            })
            .await
            .unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.readings_saved, 0);
        assert!(db.list_readings(&HistoryFilter::default()).await.unwrap().is_empty());
        assert!(alerts(&db, zone.id).await.is_empty());
    }

    // -- Manual watering ----------------------------------------------------

    #[tokio::test]
    async fn manual_water_records_event_with_capped_duration() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, FixedSensors::reading(0, 15000), pumps.clone());

        let event = mon.manual_water(zone.id, Some(600)).await.unwrap();
        assert_eq!(event.action, PumpAction::Manual);
        assert_eq!(event.reason, PumpReason::Manual);
        assert_eq!(event.duration_sec, Some(30));
        assert_eq!(pumps.calls(), vec![(Some(17), 30)]);
    }

    #[tokio::test]
    async fn manual_water_defaults_to_zone_duration() {
        let db = test_db().await;
        let zone = db
            .create_zone(&NewZone {
                water_duration_sec: 12,
                ..test_zone()
            })
            .await
            .unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        let event = mon.manual_water(zone.id, None).await.unwrap();
        assert_eq!(event.duration_sec, Some(12));
    }

    #[tokio::test]
    async fn manual_water_failure_records_event_without_duration() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(false));

        let event = mon.manual_water(zone.id, Some(10)).await.unwrap();
        assert_eq!(event.duration_sec, None);
    }

    #[tokio::test]
    async fn manual_water_rejects_disabled_zone() {
        let db = test_db().await;
        let zone = db
            .create_zone(&NewZone {
                enabled: false,
                ..test_zone()
            })
            .await
            .unwrap();
        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, FixedSensors::reading(0, 15000), pumps.clone());

        let err = mon.manual_water(zone.id, Some(10)).await.unwrap_err();
        assert!(matches!(err, AppError::ZoneDisabled));
        assert!(pump_events(&db, zone.id).await.is_empty());
        assert!(pumps.calls().is_empty());
    }

    #[tokio::test]
    async fn manual_water_rejects_unknown_zone() {
        let db = test_db().await;
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        let err = mon.manual_water(99, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn manual_water_rejects_out_of_range_duration() {
        let db = test_db().await;
        let zone = db.create_zone(&test_zone()).await.unwrap();
        let mon = monitor(&db, FixedSensors::reading(0, 15000), ScriptedPump::new(true));

        for bad in [0, -5, 601] {
            let err = mon.manual_water(zone.id, Some(bad)).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "duration {bad}");
        }
        assert!(pump_events(&db, zone.id).await.is_empty());
    }

    // -- Multiple zones -----------------------------------------------------

    #[tokio::test]
    async fn zones_are_processed_independently() {
        let db = test_db().await;
        let dry = db.create_zone(&test_zone()).await.unwrap();
        let wet = db
            .create_zone(&NewZone {
                sensor_channel: 1,
                pump_gpio: Some(27),
                ..test_zone()
            })
            .await
            .unwrap();
        let silent = db
            .create_zone(&NewZone {
                sensor_channel: 2,
                pump_gpio: Some(22),
                ..test_zone()
            })
            .await
            .unwrap();

        // Channel 0 dry, channel 1 wet, channel 2 unreadable.
        let sensors = Arc::new(FixedSensors(HashMap::from([(0, 15000), (1, 17000)])));
        let pumps = ScriptedPump::new(true);
        let mon = monitor(&db, sensors, pumps.clone());

        let outcome = mon.run_cycle().await.unwrap();
        assert_eq!(outcome.readings_saved, 2);
        assert_eq!(outcome.pumps_run, 1);

        assert_eq!(pump_events(&db, dry.id).await.len(), 1);
        assert!(pump_events(&db, wet.id).await.is_empty());
        assert!(pump_events(&db, silent.id).await.is_empty());
        assert!(alerts(&db, silent.id).await.is_empty());
    }

    // -- Pure decision helpers ---------------------------------------------

    #[test]
    fn should_water_boundary_is_inclusive() {
        let zone = Zone {
            id: 1,
            name: "z".into(),
            threshold: 16000,
            hysteresis: 800,
            cooldown_hours: 4,
            water_duration_sec: 30,
            sensor_channel: 0,
            pump_gpio: Some(17),
            enabled: true,
        };
        let now = 1_700_000_000;

        assert!(!should_water(&zone, 16000, None, now), "at threshold is wet enough");
        assert!(should_water(&zone, 15999, None, now), "below threshold, no history");

        let exactly = now - 4 * 3600;
        assert!(should_water(&zone, 15000, Some(exactly), now), "cooldown exactly elapsed");
        assert!(!should_water(&zone, 15000, Some(exactly + 1), now), "one second short");
    }

    #[test]
    fn zero_cooldown_always_allows() {
        let zone = Zone {
            id: 1,
            name: "z".into(),
            threshold: 16000,
            hysteresis: 0,
            cooldown_hours: 0,
            water_duration_sec: 30,
            sensor_channel: 0,
            pump_gpio: Some(17),
            enabled: true,
        };
        let now = 1_700_000_000;
        assert!(should_water(&zone, 15000, Some(now), now));
    }
}
