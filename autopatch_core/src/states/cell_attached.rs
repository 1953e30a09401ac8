//! Cell-attached state: hold the sealed configuration, watching for
//! spontaneous break-in or loss of the cell, with an optional timed
//! hand-off to the break-in state.

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::error::Result;
use crate::state::{PatchState, StateContext, StateSetup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellAttachedConfig {
    /// Hand off to break-in after this many seconds; `None` holds
    /// cell-attached until told otherwise.
    pub auto_break_in_delay: Option<f64>,
    /// Capacitance above this means the membrane ruptured on its own.
    pub capacitance_threshold: f64,
    /// Holding current below this means the seal let go of the cell.
    pub cell_loss_current: f64,
    pub next_state: String,
    pub spontaneous_state: String,
    pub loss_state: String,
}

impl Default for CellAttachedConfig {
    fn default() -> Self {
        Self {
            auto_break_in_delay: Some(10.0),
            capacitance_threshold: 10e-12,
            cell_loss_current: -1e-9,
            next_state: super::names::BREAK_IN.to_string(),
            spontaneous_state: super::names::WHOLE_CELL.to_string(),
            loss_state: super::names::FOULED.to_string(),
        }
    }
}

pub struct CellAttachedState {
    config: CellAttachedConfig,
}

impl CellAttachedState {
    pub fn new(config: CellAttachedConfig) -> Self {
        Self { config }
    }
}

impl PatchState for CellAttachedState {
    fn name(&self) -> &'static str {
        super::names::CELL_ATTACHED
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Atmosphere, 0.0)),
            clamp_mode: Some(ClampMode::Vc),
            test_pulse: Some(true),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let cfg = self.config.clone();
        cx.record.set("cellAttachedTime", cx.task.elapsed());
        loop {
            if let Some(delay) = cfg.auto_break_in_delay
                && cx.task.elapsed() >= delay
            {
                tracing::info!(delay, "auto break-in delay elapsed");
                return Ok(Some(cfg.next_state));
            }
            let Some(pulse) = cx.cycle()? else { continue };
            let a = pulse.analysis;
            if a.capacitance > cfg.capacitance_threshold {
                cx.record.set("spontaneousBreakIn", true);
                tracing::info!(capacitance = a.capacitance, "spontaneous break-in");
                return Ok(Some(cfg.spontaneous_state));
            }
            if a.baseline_current < cfg.cell_loss_current {
                cx.record.set("cellLost", true);
                tracing::info!(current = a.baseline_current, "cell lost while attached");
                return Ok(Some(cfg.loss_state));
            }
        }
    }
}
