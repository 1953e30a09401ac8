//! Approach state: drive the tip to the standby point above the target and
//! zero the pipette offset.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::error::Result;
use crate::state::{PatchState, StateContext, StateSetup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApproachConfig {
    /// Where to go once positioned.
    pub next_state: String,
    pub fallback_state: String,
    /// Slight positive pressure while travelling through the bath.
    pub target_pressure: f64,
    /// Abort the move after this many seconds.
    pub move_timeout: f64,
}

impl Default for ApproachConfig {
    fn default() -> Self {
        Self {
            next_state: super::names::CELL_DETECT.to_string(),
            fallback_state: super::names::BATH.to_string(),
            target_pressure: 1.5e3,
            move_timeout: 120.0,
        }
    }
}

pub struct ApproachState {
    config: ApproachConfig,
}

impl ApproachState {
    pub fn new(config: ApproachConfig) -> Self {
        Self { config }
    }
}

impl PatchState for ApproachState {
    fn name(&self) -> &'static str {
        super::names::APPROACH
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Regulator, self.config.target_pressure)),
            clamp_mode: Some(ClampMode::Vc),
            test_pulse: Some(true),
            fallback_state: Some(self.config.fallback_state.clone()),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        let scene = cx.rig.scene()?;
        let path = cx.rig.planner.approach(&scene)?;
        let op = cx.rig.stage.move_path(&path)?;
        cx.wait_for(&op, Some(Duration::from_secs_f64(self.config.move_timeout)))?;
        cx.rig.clamp.auto_pipette_offset()?;
        cx.record.set("approachPosition", <[f64; 3]>::from(cx.rig.stage.position()?));
        Ok(Some(self.config.next_state.clone()))
    }
}
