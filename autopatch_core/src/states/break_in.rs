//! Break-in state: rupture the membrane patch with suction pulses of
//! increasing strength.
//!
//! Runs with the DAQ reserved: the pulse timing matters and nothing else
//! should be driving the hardware meanwhile.

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::error::Result;
use crate::state::{PatchState, StateContext, StateSetup};
use crate::util::secs;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakInConfig {
    /// Suction pulse schedule as `(pressure, duration)` attempts, tried in
    /// order.
    pub pulses: Vec<(f64, f64)>,
    /// Observation window after each pulse.
    pub settle_time: f64,
    /// Resistance below this means the patch ruptured.
    pub resistance_threshold: f64,
    /// Capacitance above this means the patch ruptured.
    pub capacitance_threshold: f64,
    pub next_state: String,
    pub fallback_state: String,
}

impl Default for BreakInConfig {
    fn default() -> Self {
        Self {
            pulses: vec![
                (-25e3, 0.5),
                (-30e3, 0.7),
                (-35e3, 1.0),
                (-40e3, 1.5),
            ],
            settle_time: 2.0,
            resistance_threshold: 400e6,
            capacitance_threshold: 10e-12,
            next_state: super::names::WHOLE_CELL.to_string(),
            fallback_state: super::names::FOULED.to_string(),
        }
    }
}

pub struct BreakInState {
    config: BreakInConfig,
}

impl BreakInState {
    pub fn new(config: BreakInConfig) -> Self {
        Self { config }
    }

    fn ruptured(&self, cx: &StateContext) -> Result<bool> {
        if let Some(p) = cx.cycle()? {
            let a = p.analysis;
            if a.steady_state_resistance < self.config.resistance_threshold
                || a.capacitance > self.config.capacitance_threshold
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PatchState for BreakInState {
    fn name(&self) -> &'static str {
        super::names::BREAK_IN
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Atmosphere, 0.0)),
            clamp_mode: Some(ClampMode::Vc),
            test_pulse: Some(true),
            reserve_daq: true,
            fallback_state: Some(self.config.fallback_state.clone()),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        for (attempt, &(pressure, duration)) in cfg.pulses.iter().enumerate() {
            cx.task.check_stop(std::time::Duration::ZERO)?;
            tracing::info!(attempt, pressure, duration, "break-in pulse");
            cx.rig.pressure.set(PressureSource::Regulator, pressure)?;
            cx.task.sleep(secs(duration))?;
            cx.rig.pressure.set(PressureSource::Atmosphere, 0.0)?;

            let settle_until = cx.task.elapsed() + cfg.settle_time;
            while cx.task.elapsed() < settle_until {
                if self.ruptured(cx)? {
                    cx.record.set("breakInSuccessful", true);
                    cx.record.set("breakInTime", cx.task.elapsed());
                    cx.record.set("breakInAttempts", (attempt + 1) as f64);
                    tracing::info!(attempt, "break-in succeeded");
                    return Ok(Some(cfg.next_state));
                }
            }
        }
        cx.record.set("breakInSuccessful", false);
        tracing::info!("break-in attempts exhausted");
        Ok(Some(cfg.fallback_state))
    }
}
