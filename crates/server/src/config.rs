//! Environment-sourced settings (fixed at process start) and first-run zone
//! seeding, either from a validated TOML file or from built-in defaults.
//!
//! The database is the source of truth for zone config once seeded; the
//! seed never overwrites edits made through the API.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;

use crate::db::{Db, NewZone};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: String,
    pub read_interval_hours: i64,
    pub default_threshold: i64,
    pub default_hysteresis: i64,
    /// Hard ceiling on any single pump run, automatic or manual.
    pub max_pump_seconds: i64,
    pub cooldown_hours: i64,
    pub simulate_sensors: bool,
    pub simulate_pumps: bool,
    /// Optional TOML file seeding zones on first start.
    pub zones_config: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:waterpal.db".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            read_interval_hours: env_parse("READ_INTERVAL_HOURS", 4),
            default_threshold: env_parse("DEFAULT_THRESHOLD", 16000),
            default_hysteresis: env_parse("DEFAULT_HYSTERESIS", 800),
            max_pump_seconds: env_parse("MAX_PUMP_SECONDS", 30),
            cooldown_hours: env_parse("COOLDOWN_HOURS", 4),
            simulate_sensors: env_bool("SIMULATE_SENSORS", true),
            simulate_pumps: env_bool("SIMULATE_PUMPS", true),
            zones_config: env::var("ZONES_CONFIG").ok(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Zone seed file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    pub threshold: i64,
    #[serde(default)]
    pub hysteresis: i64,
    pub cooldown_hours: i64,
    pub water_duration_sec: i64,
    pub sensor_channel: i64,
    #[serde(default)]
    pub pump_gpio: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// BCM GPIO pins usable for pump relays on the Raspberry Pi 40-pin header.
/// GPIO 0-1 are reserved for the ID EEPROM; 28+ are not exposed.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// Highest single-ended ADS1115 input index.
const MAX_SENSOR_CHANNEL: i64 = 3;

impl SeedConfig {
    /// Validate all entries, reporting every violation found rather than
    /// bailing on the first.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.name.trim().is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.name)
                }
            };

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if z.threshold < 0 {
                errors.push(format!("{}: threshold must be non-negative, got {}", ctx(), z.threshold));
            }
            if z.cooldown_hours < 0 {
                errors.push(format!(
                    "{}: cooldown_hours must be non-negative, got {}",
                    ctx(),
                    z.cooldown_hours
                ));
            }
            if z.water_duration_sec <= 0 {
                errors.push(format!(
                    "{}: water_duration_sec must be positive, got {}",
                    ctx(),
                    z.water_duration_sec
                ));
            }
            if !(0..=MAX_SENSOR_CHANNEL).contains(&z.sensor_channel) {
                errors.push(format!(
                    "{}: sensor_channel {} out of range (0-{MAX_SENSOR_CHANNEL})",
                    ctx(),
                    z.sensor_channel
                ));
            }
            if let Some(pin) = z.pump_gpio {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: pump_gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx()
                    ));
                } else if !seen_pins.insert(pin) {
                    errors.push(format!(
                        "{}: pump_gpio {pin} is already used by another zone",
                        ctx()
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "zone config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

/// Read, parse, and validate a TOML zone seed file.
pub fn load(path: &str) -> Result<SeedConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read zone config: {path}"))?;
    let config: SeedConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse zone config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid zone config: {path}"))?;
    Ok(config)
}

/// Three zones on sensor channels 0-2, mirroring a common three-bed setup.
fn default_zones(settings: &Settings) -> Vec<ZoneEntry> {
    [(0, 17), (1, 27), (2, 22)]
        .into_iter()
        .enumerate()
        .map(|(i, (channel, gpio))| ZoneEntry {
            name: format!("Zone {}", i + 1),
            threshold: settings.default_threshold,
            hysteresis: settings.default_hysteresis,
            cooldown_hours: settings.cooldown_hours,
            water_duration_sec: settings.max_pump_seconds,
            sensor_channel: channel,
            pump_gpio: Some(gpio),
            enabled: true,
        })
        .collect()
}

/// Seed zones on first start.  Returns the number of zones created; an
/// already-populated table is left untouched.
pub async fn seed_zones(db: &Db, settings: &Settings) -> Result<usize> {
    if !db.list_zones().await?.is_empty() {
        return Ok(0);
    }

    let entries = match &settings.zones_config {
        Some(path) => load(path)?.zones,
        None => default_zones(settings),
    };

    let count = entries.len();
    for z in &entries {
        db.create_zone(&NewZone {
            name: z.name.clone(),
            threshold: z.threshold,
            hysteresis: z.hysteresis,
            cooldown_hours: z.cooldown_hours,
            water_duration_sec: z.water_duration_sec,
            sensor_channel: z.sensor_channel,
            pump_gpio: z.pump_gpio,
            enabled: z.enabled,
        })
        .await
        .with_context(|| format!("failed to seed zone '{}'", z.name))?;
    }

    tracing::info!(zones = count, "zones seeded");
    Ok(count)
}

// ===========================================================================
// Tests
// ===========================================================================
