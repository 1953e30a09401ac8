//! Pressure facade: source/setpoint ordering, limit clamping, ramps.
//!
//! States command pressure only through this facade, which owns the
//! invariant that the regulator never sees a setpoint outside
//! `[-limit, +limit]`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use autopatch_traits::{Clock, PressureRegulator, PressureSource};
use eyre::WrapErr;

use crate::dev_error::map_dev_error;
use crate::error::{Report, Result};
use crate::task::OpHandle;

/// Commanded pressure state as last pushed to the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureState {
    pub source: PressureSource,
    pub pressure: f64,
}

#[derive(Debug, Clone)]
pub struct PressureSettings {
    /// Absolute bound on commanded pressure, pascals.
    pub limit: f64,
    /// Regulator settling interval.
    pub settle: Duration,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            limit: 70e3,
            settle: Duration::from_millis(300),
        }
    }
}

/// Ramp goal: a target setpoint, or a band the current setpoint should be
/// brought into.
#[derive(Debug, Clone, Copy)]
pub enum RampTarget {
    To(f64),
    Into { min: f64, max: f64 },
}

/// Ramp pacing: a rate in pascals per second, or a total duration. When
/// omitted, the settle interval is used as the duration.
#[derive(Debug, Clone, Copy)]
pub enum RampPace {
    Rate(f64),
    Duration(Duration),
}

pub struct PressureFacade {
    dev: Mutex<Box<dyn PressureRegulator>>,
    settings: PressureSettings,
    state: Mutex<PressureState>,
    clock: Arc<dyn Clock + Send + Sync>,
    source_switches: AtomicUsize,
}

impl PressureFacade {
    pub fn new(
        dev: Box<dyn PressureRegulator>,
        settings: PressureSettings,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            dev: Mutex::new(dev),
            settings,
            state: Mutex::new(PressureState {
                source: PressureSource::Atmosphere,
                pressure: 0.0,
            }),
            clock,
            source_switches: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> f64 {
        self.settings.limit
    }

    pub fn settle_interval(&self) -> Duration {
        self.settings.settle
    }

    /// Last commanded source and setpoint.
    pub fn current(&self) -> PressureState {
        *self.lock_state()
    }

    /// Number of source switches pushed to the device (repeat commands with
    /// an unchanged source are elided).
    pub fn source_switch_count(&self) -> usize {
        self.source_switches.load(Ordering::Relaxed)
    }

    /// Command a source and setpoint.
    ///
    /// Ordering rule: switching to atmosphere or user flips the source
    /// before the setpoint is written; switching to the regulator writes the
    /// setpoint first and waits one settling interval before the source
    /// flips, so a stale regulator value is never applied to the pipette.
    pub fn set(&self, source: PressureSource, pressure: f64) -> Result<()> {
        let pressure = self.clamp(pressure);
        let prev = self.current();
        if prev.source == source && (prev.pressure - pressure).abs() < f64::EPSILON {
            tracing::trace!(%source, pressure, "pressure unchanged, skipping");
            return Ok(());
        }
        match source {
            PressureSource::Atmosphere | PressureSource::User => {
                if prev.source != source {
                    self.select_source(source)?;
                }
                self.write_setpoint(pressure)?;
            }
            PressureSource::Regulator => {
                self.write_setpoint(pressure)?;
                if prev.source != source {
                    self.clock.sleep(self.settings.settle);
                    self.select_source(source)?;
                }
            }
        }
        *self.lock_state() = PressureState { source, pressure };
        tracing::debug!(%source, pressure, "pressure changed");
        Ok(())
    }

    /// Ramp the regulator setpoint linearly toward the goal, sampling the
    /// settling interval at each step. Selects the regulator source first if
    /// necessary. Cancellable through the returned handle.
    pub fn ramp(self: &Arc<Self>, target: RampTarget, pace: Option<RampPace>) -> Result<OpHandle> {
        let start = self.current().pressure;
        self.set(PressureSource::Regulator, start)?;
        let goal = self.clamp(match target {
            RampTarget::To(p) => p,
            RampTarget::Into { min, max } => crate::util::clamp_between(start, min, max),
        });
        let duration = match pace {
            Some(RampPace::Rate(rate)) => {
                crate::util::secs((goal - start).abs() / rate.abs().max(1e-9))
            }
            Some(RampPace::Duration(d)) => d,
            None => self.settings.settle,
        };
        let settle = self.settings.settle;
        let steps = (duration.as_secs_f64() / settle.as_secs_f64()).round().max(1.0) as u32;
        let facade = self.clone();
        let clock = self.clock.clone();
        tracing::debug!(start, goal, steps, "pressure ramp started");
        Ok(OpHandle::spawn("pressure ramp", clock, move |token| {
            for i in 1..=steps {
                token.sleep(settle)?;
                let f = f64::from(i) / f64::from(steps);
                let p = start + (goal - start) * f;
                facade.set(PressureSource::Regulator, p)?;
            }
            Ok(())
        }))
    }

    fn clamp(&self, pressure: f64) -> f64 {
        let limit = self.settings.limit;
        if pressure.abs() > limit {
            tracing::warn!(pressure, limit, "pressure command clamped");
        }
        pressure.clamp(-limit, limit)
    }

    fn select_source(&self, source: PressureSource) -> Result<()> {
        self.lock_dev()
            .select_source(source)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("select pressure source")?;
        self.source_switches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_setpoint(&self, pressure: f64) -> Result<()> {
        self.lock_dev()
            .set_setpoint(pressure)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("set pressure setpoint")
    }

    fn lock_dev(&self) -> MutexGuard<'_, Box<dyn PressureRegulator>> {
        match self.dev.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PressureState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{CommandLog, NoopPressure};
    use autopatch_traits::MonotonicClock;

    fn facade(limit: f64) -> (Arc<PressureFacade>, CommandLog) {
        let log = CommandLog::default();
        let facade = PressureFacade::new(
            Box::new(NoopPressure::new(log.clone())),
            PressureSettings {
                limit,
                settle: Duration::from_millis(1),
            },
            Arc::new(MonotonicClock::new()),
        );
        (Arc::new(facade), log)
    }

    #[test]
    fn atmosphere_switches_source_before_setpoint() {
        let (f, log) = facade(70e3);
        f.set(PressureSource::Regulator, -1000.0).unwrap();
        log.clear();
        f.set(PressureSource::Atmosphere, 0.0).unwrap();
        let cmds = log.entries();
        assert_eq!(cmds[0], "source atmosphere");
        assert!(cmds[1].starts_with("setpoint"));
    }

    #[test]
    fn regulator_writes_setpoint_before_source() {
        let (f, log) = facade(70e3);
        f.set(PressureSource::Regulator, -1500.0).unwrap();
        let cmds = log.entries();
        assert_eq!(cmds[0], "setpoint -1500");
        assert_eq!(cmds[1], "source regulator");
    }

    #[test]
    fn repeated_atmosphere_command_is_a_no_op() {
        let (f, _log) = facade(70e3);
        f.set(PressureSource::Atmosphere, 0.0).unwrap();
        let n = f.source_switch_count();
        f.set(PressureSource::Atmosphere, 0.0).unwrap();
        assert_eq!(f.source_switch_count(), n);
    }

    #[test]
    fn commands_are_clamped_to_the_limit() {
        let (f, _log) = facade(70e3);
        f.set(PressureSource::Regulator, -90e3).unwrap();
        assert_eq!(f.current().pressure, -70e3);
        f.set(PressureSource::Regulator, 100e3).unwrap();
        assert_eq!(f.current().pressure, 70e3);
    }

    #[test]
    fn ramp_reaches_target_and_interpolates() {
        let (f, _log) = facade(70e3);
        f.set(PressureSource::Regulator, 0.0).unwrap();
        let ramp = f
            .ramp(
                RampTarget::To(-1000.0),
                Some(RampPace::Duration(Duration::from_millis(10))),
            )
            .unwrap();
        ramp.wait(Duration::from_secs(5)).unwrap();
        assert!((f.current().pressure - -1000.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_into_band_stops_at_the_nearer_bound() {
        let (f, _log) = facade(70e3);
        f.set(PressureSource::Regulator, -5000.0).unwrap();
        let ramp = f
            .ramp(
                RampTarget::Into {
                    min: -2000.0,
                    max: 0.0,
                },
                None,
            )
            .unwrap();
        ramp.wait(Duration::from_secs(5)).unwrap();
        assert!((f.current().pressure - -2000.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_is_cancellable_midway() {
        let (f, _log) = facade(70e3);
        f.set(PressureSource::Regulator, 0.0).unwrap();
        let ramp = f
            .ramp(
                RampTarget::To(-10_000.0),
                Some(RampPace::Duration(Duration::from_secs(30))),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        ramp.stop();
        assert!(ramp.wait(Duration::from_secs(5)).is_err());
        assert!(f.current().pressure > -10_000.0);
    }
}
