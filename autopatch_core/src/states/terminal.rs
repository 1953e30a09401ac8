//! Rest and dead-end states: out, broken, fouled.

use serde::{Deserialize, Serialize};

use autopatch_traits::{ClampMode, PressureSource};

use crate::error::Result;
use crate::state::{PatchState, StateContext, StateSetup};

/// Resting configuration between patch attempts: vented, VC at 0 V, test
/// pulse off. Closes the previous attempt's record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OutConfig {}

pub struct OutState {
    _config: OutConfig,
}

impl OutState {
    pub fn new(config: OutConfig) -> Self {
        Self { _config: config }
    }
}

impl PatchState for OutState {
    fn name(&self) -> &'static str {
        super::names::OUT
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            finish_record: true,
            pressure: Some((PressureSource::Atmosphere, 0.0)),
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            test_pulse: Some(false),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, _cx: &mut StateContext) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BrokenConfig {}

/// The tip snapped: mark the pipette unusable and rest safe.
pub struct BrokenState {
    _config: BrokenConfig,
}

impl BrokenState {
    pub fn new(config: BrokenConfig) -> Self {
        Self { _config: config }
    }
}

impl PatchState for BrokenState {
    fn name(&self) -> &'static str {
        super::names::BROKEN
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Atmosphere, 0.0)),
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            test_pulse: Some(false),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        cx.record.set("tipBroken", true);
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FouledConfig {}

/// The tip picked up debris: it needs cleaning or replacement before
/// another attempt.
pub struct FouledState {
    _config: FouledConfig,
}

impl FouledState {
    pub fn new(config: FouledConfig) -> Self {
        Self { _config: config }
    }
}

impl PatchState for FouledState {
    fn name(&self) -> &'static str {
        super::names::FOULED
    }

    fn setup(&self) -> StateSetup {
        StateSetup {
            pressure: Some((PressureSource::Atmosphere, 0.0)),
            clamp_mode: Some(ClampMode::Vc),
            holding: Some((ClampMode::Vc, 0.0)),
            ..StateSetup::default()
        }
    }

    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>> {
        cx.record.set("tipClean", false);
        Ok(None)
    }
}
