//! Seal state: form a gigaohm seal between the tip and the membrane.

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::analysis::{BreakDetector, SealAction, SealRateConfig, SealRateController};
use crate::error::{PatchError, Result, err};
use crate::state::{PatchState, StateContext, StateSetup};
use crate::util::secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealPressureMode {
    /// The operator drives suction through the user port.
    User,
    /// The slope-driven controller drives the regulator.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SealConfig {
    pub pressure_mode: SealPressureMode,
    /// First suction applied in auto mode (and after a floor cycle).
    pub starting_pressure: f64,
    /// Switch the holding potential on once resistance passes this.
    pub holding_threshold: f64,
    pub holding_potential: f64,
    /// Resistance that counts as sealed.
    pub seal_threshold: f64,
    /// Offset below the initial resistance that counts as a broken tip
    /// (negative).
    pub break_threshold: f64,
    /// Seconds the resistance must stay above `seal_threshold`.
    pub delay_after_seal: f64,
    /// Give up and foul out after this many seconds.
    pub seal_timeout: f64,
    /// Piecewise `(max_slope, pressure_delta)` table for auto mode.
    pub pressure_change_rates: Vec<(f64, f64)>,
    /// Suction floor for the controller.
    pub pressure_limit: f64,
    /// Vent time before resuming suction after hitting the floor.
    pub reset_delay: f64,
    pub slope_samples: usize,
    pub next_state: String,
    pub fallback_state: String,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            pressure_mode: SealPressureMode::User,
            starting_pressure: -1000.0,
            holding_threshold: 100e6,
            holding_potential: -70e-3,
            seal_threshold: 1e9,
            break_threshold: -1e6,
            delay_after_seal: 5.0,
            seal_timeout: 120.0,
            pressure_change_rates: vec![(-1e6, 200.0), (0.5e6, -100.0), (100e6, 0.0)],
            pressure_limit: -3e3,
            reset_delay: 5.0,
            slope_samples: 4,
            next_state: super::names::CELL_ATTACHED.to_string(),
            fallback_state: super::names::FOULED.to_string(),
        }
    }
}

pub struct SealState {
    config: SealConfig,
}

impl SealState {
    pub fn new(config: SealConfig) -> Self {
        Self { config }
    }
}

impl PatchState for SealState {
    fn name(&self) -> &'static str {
        super::names::SEAL
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            test_pulse: Some(true),
            fallback_state: Some(self.config.fallback_state.clone()),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();

        // Capture the pre-seal baseline from the first pulse.
        let initial = loop {
            if cx.task.elapsed() > 10.0 {
                return err(PatchError::Timeout("no pulses at seal start".into()));
            }
            if let Some(p) = cx.cycle()? {
                break p.analysis.steady_state_resistance;
            }
        };
        cx.record.set("sealStartResistance", initial);

        // Already sealed: hold for the dwell with no pressure applied.
        if initial >= cfg.seal_threshold {
            cx.task.sleep(secs(cfg.delay_after_seal))?;
            cx.record.set("sealSuccessful", true);
            cx.record.set("sealResistance", initial);
            return Ok(Some(cfg.next_state));
        }

        let mut controller = match cfg.pressure_mode {
            SealPressureMode::User => {
                cx.rig.pressure.set(PressureSource::User, 0.0)?;
                None
            }
            SealPressureMode::Auto => {
                cx.rig
                    .pressure
                    .set(PressureSource::Regulator, cfg.starting_pressure)?;
                Some(SealRateController::new(SealRateConfig {
                    change_rates: cfg.pressure_change_rates.clone(),
                    pressure_limit: cfg.pressure_limit,
                    slope_samples: cfg.slope_samples,
                }))
            }
        };

        let mut breaker = BreakDetector::new(initial, cfg.break_threshold);
        let mut holding_applied = false;
        let mut sealed_since: Option<f64> = None;
        loop {
            if cx.task.elapsed() > cfg.seal_timeout {
                cx.record.set("sealSuccessful", false);
                tracing::info!("seal timed out");
                return Ok(Some(cfg.fallback_state));
            }
            let Some(pulse) = cx.cycle()? else { continue };
            let r = pulse.analysis.steady_state_resistance;

            if breaker.update(r) {
                cx.record.set("sealSuccessful", false);
                return Ok(Some(super::names::BROKEN.to_string()));
            }

            if !holding_applied && r > cfg.holding_threshold {
                cx.rig
                    .clamp
                    .set_holding(ClampMode::Vc, cfg.holding_potential)?;
                holding_applied = true;
                tracing::debug!(r, "holding potential applied");
            }

            if r > cfg.seal_threshold {
                let now = cx.task.elapsed();
                let since = *sealed_since.get_or_insert(now);
                if now - since >= cfg.delay_after_seal {
                    cx.record.set("sealSuccessful", true);
                    cx.record.set("sealResistance", r);
                    cx.record.set("sealTime", now);
                    // Hold the seal gently once formed.
                    cx.rig.pressure.set(PressureSource::Atmosphere, 0.0)?;
                    tracing::info!(r, "gigaseal formed");
                    return Ok(Some(cfg.next_state));
                }
            } else {
                sealed_since = None;
            }

            if let Some(controller) = controller.as_mut() {
                let current = cx.rig.pressure.current().pressure;
                match controller.update(pulse.start_time, r, current) {
                    Some(SealAction::Set(p)) => {
                        cx.rig.pressure.set(PressureSource::Regulator, p)?;
                    }
                    Some(SealAction::CycleReset) => {
                        tracing::debug!("suction floor reached, venting and retrying");
                        cx.rig.pressure.set(PressureSource::Atmosphere, 0.0)?;
                        cx.task.sleep(secs(cfg.reset_delay))?;
                        cx.rig
                            .pressure
                            .set(PressureSource::Regulator, cfg.starting_pressure)?;
                    }
                    None => {}
                }
            }
        }
    }
}
