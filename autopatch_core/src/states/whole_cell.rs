//! Whole-cell state: hold the recording configuration and log the session.
//!
//! A recording state: it monitors but never completes on its own; the
//! manager transitions away when the experiment moves on.

use serde::{Deserialize, Serialize};

use autopatch_traits::ClampMode;

use crate::error::Result;
use crate::state::{PatchState, StateContext, StateSetup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WholeCellConfig {
    pub holding_potential: f64,
    pub auto_bias: bool,
    pub auto_bias_target: f64,
}

impl Default for WholeCellConfig {
    fn default() -> Self {
        Self {
            holding_potential: -70e-3,
            auto_bias: true,
            auto_bias_target: -70e-3,
        }
    }
}

pub struct WholeCellState {
    config: WholeCellConfig,
}

impl WholeCellState {
    pub fn new(config: WholeCellConfig) -> Self {
        Self { config }
    }
}

impl PatchState for WholeCellState {
    fn name(&self) -> &'static str {
        super::names::WHOLE_CELL
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, self.config.holding_potential)),
            test_pulse: Some(true),
            auto_bias: Some(self.config.auto_bias),
            auto_bias_target: Some(self.config.auto_bias_target),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        cx.record.set("wholeCellStartTime", cx.task.elapsed());
        cx.record
            .set("wholeCellStartPosition", <[f64; 3]>::from(cx.rig.stage.position()?));
        tracing::info!("whole-cell recording");
        loop {
            if let Some(p) = cx.cycle()? {
                tracing::trace!(
                    r = p.analysis.steady_state_resistance,
                    i = p.analysis.baseline_current,
                    "whole-cell monitor"
                );
            }
        }
    }
}
