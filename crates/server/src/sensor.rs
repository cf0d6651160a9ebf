//! Soil moisture sensing.  The `hardware` feature gates real ADS1115 reads
//! over I2C; without it (or with `SIMULATE_SENSORS=true`) a noise simulator
//! stands in.
//!
//! A failed or unsupported read is never an error: the cycle sees `None`
//! and skips the zone.

/// Read access to one moisture channel.  Implementations must be safe to
/// call with no physical hardware attached and must signal every failure as
/// `None` rather than panicking or erroring.
pub trait SensorReader: Send + Sync {
    fn read_channel(&self, channel: i64) -> Option<i64>;
}

// ---------------------------------------------------------------------------
// Simulated backend
// ---------------------------------------------------------------------------

/// Pseudo-random moisture values centred per channel, so neighbouring
/// channels stay distinguishable in the UI while still moving around.
const SIM_BASE: i64 = 15000;
const SIM_CHANNEL_STEP: i64 = 1200;
const SIM_JITTER: i64 = 400;

fn simulated_value(channel: i64) -> i64 {
    SIM_BASE + channel * SIM_CHANNEL_STEP + fastrand::i64(-SIM_JITTER..=SIM_JITTER)
}

// ---------------------------------------------------------------------------
// SensorManager
// ---------------------------------------------------------------------------

pub struct SensorManager {
    backend: Backend,
}

enum Backend {
    Sim,
    #[cfg(feature = "hardware")]
    Ads1115(hw::Ads1115),
}

impl SensorManager {
    pub fn new(simulate: bool) -> Self {
        if simulate {
            tracing::info!("sensor backend: simulated");
            return Self { backend: Backend::Sim };
        }

        #[cfg(feature = "hardware")]
        {
            tracing::info!("sensor backend: ads1115");
            Self {
                backend: Backend::Ads1115(hw::Ads1115::new(hw::DEFAULT_ADDR)),
            }
        }
        #[cfg(not(feature = "hardware"))]
        {
            tracing::warn!("built without the hardware feature — using simulated sensors");
            Self { backend: Backend::Sim }
        }
    }
}

impl SensorReader for SensorManager {
    fn read_channel(&self, channel: i64) -> Option<i64> {
        match &self.backend {
            Backend::Sim => Some(simulated_value(channel)),
            #[cfg(feature = "hardware")]
            Backend::Ads1115(adc) => adc.read_channel(channel),
        }
    }
}

// ---------------------------------------------------------------------------
// ADS1115 over I2C (single-shot, single-ended)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
mod hw {
    use rppal::i2c::I2c;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    pub(super) const DEFAULT_ADDR: u16 = 0x48;

    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;

    /// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
    /// DR=100 (128 SPS), comparator off.
    const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

    /// MUX values for AINx vs GND, shifted into bits [14:12].
    const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
    const MUX_SHIFT: u8 = 12;

    /// Conversion time at 128 SPS is ~7.8 ms; wait 9 ms for margin.
    const CONVERSION_WAIT: Duration = Duration::from_millis(9);

    /// Lazily-opened I2C bus, owned here and nowhere else.  Dropped on any
    /// bus error so the next read reopens it.
    pub(super) struct Ads1115 {
        addr: u16,
        bus: Mutex<Option<I2c>>,
    }

    impl Ads1115 {
        pub(super) fn new(addr: u16) -> Self {
            Self {
                addr,
                bus: Mutex::new(None),
            }
        }

        pub(super) fn read_channel(&self, channel: i64) -> Option<i64> {
            let mux = match usize::try_from(channel).ok().and_then(|c| MUX_SINGLE_ENDED.get(c)) {
                Some(mux) => *mux,
                None => return None,
            };

            let mut guard = self.bus.lock().unwrap_or_else(|p| p.into_inner());
            match self.single_shot(&mut guard, mux) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(channel, "adc read failed: {e}");
                    *guard = None;
                    None
                }
            }
        }

        fn single_shot(&self, bus: &mut Option<I2c>, mux: u16) -> rppal::i2c::Result<i64> {
            if bus.is_none() {
                let mut i2c = I2c::new()?;
                i2c.set_slave_address(self.addr)?;
                *bus = Some(i2c);
            }
            let i2c = bus.as_mut().expect("bus opened above");

            let config = CONFIG_BASE | (mux << MUX_SHIFT);
            i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;
            thread::sleep(CONVERSION_WAIT);

            let mut buf = [0u8; 2];
            i2c.block_read(REG_CONVERSION, &mut buf)?;
            let raw = i16::from_be_bytes(buf);

            // Single-ended reads are non-negative; clamp against bus noise.
            Ok((raw as i64).clamp(0, 32767))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_values_centre_per_channel() {
        for channel in 0..4 {
            let centre = SIM_BASE + channel * SIM_CHANNEL_STEP;
            for _ in 0..50 {
                let v = simulated_value(channel);
                assert!(
                    (centre - SIM_JITTER..=centre + SIM_JITTER).contains(&v),
                    "channel {channel}: {v} outside centre ±{SIM_JITTER}"
                );
            }
        }
    }

    #[test]
    fn sim_manager_always_reads() {
        let sensors = SensorManager::new(true);
        for channel in 0..4 {
            assert!(sensors.read_channel(channel).is_some());
        }
    }

    #[test]
    fn channels_stay_distinguishable() {
        let a = simulated_value(0);
        let b = simulated_value(2);
        // Channels two steps apart can never overlap (2 * 1200 > 2 * 400).
        assert!(b > a);
    }
}
