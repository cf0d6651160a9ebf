//! Pump actuation.  The `hardware` feature gates real GPIO output via rppal;
//! without it (or with `SIMULATE_PUMPS=true`) a simulated controller reports
//! success without touching anything.
//!
//! A hardware fault never surfaces as an error: `run` answers `false` and
//! the caller records a pump-failed alert.

use async_trait::async_trait;

/// One blocking on/off pulse on a pump output line.
///
/// Returns `false` immediately when `gpio_pin` is absent (zone has no
/// actuator wired) and on any hardware fault.  `true` means the pump ran
/// for the full commanded duration.
#[async_trait]
pub trait PumpActuator: Send + Sync {
    async fn run(&self, gpio_pin: Option<i64>, duration_sec: i64) -> bool;
}

// ---------------------------------------------------------------------------
// PumpController
// ---------------------------------------------------------------------------

pub struct PumpController {
    backend: Backend,
}

enum Backend {
    Sim,
    #[cfg(feature = "hardware")]
    Gpio(hw::GpioPumps),
}

impl PumpController {
    pub fn new(simulate: bool) -> Self {
        if simulate {
            tracing::info!("pump backend: simulated");
            return Self { backend: Backend::Sim };
        }

        #[cfg(feature = "hardware")]
        {
            tracing::info!("pump backend: gpio");
            Self {
                backend: Backend::Gpio(hw::GpioPumps::new()),
            }
        }
        #[cfg(not(feature = "hardware"))]
        {
            tracing::warn!("built without the hardware feature — using simulated pumps");
            Self { backend: Backend::Sim }
        }
    }
}

#[async_trait]
impl PumpActuator for PumpController {
    async fn run(&self, gpio_pin: Option<i64>, duration_sec: i64) -> bool {
        let Some(pin) = gpio_pin else {
            return false;
        };

        match &self.backend {
            Backend::Sim => {
                tracing::debug!(pin, duration_sec, "[sim] pump pulse");
                true
            }
            #[cfg(feature = "hardware")]
            Backend::Gpio(pumps) => pumps.pulse(pin, duration_sec).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO pulses (Raspberry Pi)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
mod hw {
    use rppal::gpio::{Gpio, OutputPin};
    use std::collections::hash_map::Entry;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Owned, lazily-built map of output pins.  The lock is held for the
    /// whole pulse, so two callers can never drive outputs concurrently.
    pub(super) struct GpioPumps {
        pins: Mutex<HashMap<u8, OutputPin>>,
    }

    /// Deasserts the line on drop, so the pump stops on every exit path —
    /// including cancellation mid-pulse.
    struct Pulse<'a>(&'a mut OutputPin);

    impl<'a> Pulse<'a> {
        fn begin(pin: &'a mut OutputPin) -> Self {
            pin.set_high();
            Self(pin)
        }
    }

    impl Drop for Pulse<'_> {
        fn drop(&mut self) {
            self.0.set_low();
        }
    }

    impl GpioPumps {
        pub(super) fn new() -> Self {
            Self {
                pins: Mutex::new(HashMap::new()),
            }
        }

        pub(super) async fn pulse(&self, pin: i64, duration_sec: i64) -> bool {
            let Ok(pin_num) = u8::try_from(pin) else {
                tracing::warn!(pin, "pump gpio out of range");
                return false;
            };

            let mut pins = self.pins.lock().await;
            let out = match pins.entry(pin_num) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(v) => {
                    match Gpio::new().and_then(|gpio| gpio.get(pin_num)) {
                        Ok(p) => {
                            let mut out = p.into_output();
                            out.set_low();
                            v.insert(out)
                        }
                        Err(e) => {
                            tracing::warn!(pin = pin_num, "pump gpio init failed: {e}");
                            return false;
                        }
                    }
                }
            };

            let pulse = Pulse::begin(out);
            tokio::time::sleep(Duration::from_secs(duration_sec.max(0) as u64)).await;
            drop(pulse);
            true
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_gpio_fails_immediately() {
        let pumps = PumpController::new(true);
        assert!(!pumps.run(None, 30).await);
    }

    #[tokio::test]
    async fn sim_pulse_succeeds() {
        let pumps = PumpController::new(true);
        assert!(pumps.run(Some(17), 30).await);
    }
}
