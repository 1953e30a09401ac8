//! Simulated device implementations for the patch pipette engine.
//!
//! Real amplifiers, regulators and stages live behind the collaborator
//! traits in `autopatch_traits`; this crate provides the simulated variants
//! used by tests, demos and dry-runs, plus the typed hardware error enum.

pub mod error;
pub mod sim;
pub mod util;

pub use error::HwError;
pub use sim::{SimClamp, SimModel, SimPressure, SimPulses, SimRig, SimScope, SimStage};
