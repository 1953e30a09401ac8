#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Automated patch-clamp pipette engine (hardware-agnostic).
//!
//! Drives a glass micropipette through the patch sequence (bath, cell
//! detect, seal, break-in, whole cell, reseal or clean) from a stream of
//! amplifier test pulses, commanding the pressure regulator, clamp and
//! motorized stage through the collaborator traits in `autopatch_traits`.
//!
//! ## Architecture
//!
//! - **Measurements**: pump thread + per-state queues (`stream` module)
//! - **Actuators**: pressure/clamp/stage facades owning ordering rules and
//!   limits (`pressure`, `clamp`, `stage`)
//! - **Analysis**: streaming detectors over the resistance series
//!   (`analysis`)
//! - **Motion**: per-destination waypoint planners (`planner`, `transform`)
//! - **Tasks**: cooperative cancellation for every long operation (`task`)
//! - **States**: the state library and its base (`state`, `states`)
//! - **Manager**: one running state per pipette, ordered transitions
//!   (`manager`)

pub mod analysis;
pub mod clamp;
pub mod config;
pub mod dev_error;
pub mod error;
pub mod manager;
pub mod mocks;
pub mod planner;
pub mod pressure;
pub mod record;
pub mod rig;
pub mod stage;
pub mod state;
pub mod states;
pub mod stream;
pub mod task;
pub mod transform;
pub mod util;

pub use error::{PatchError, Result};
pub use manager::{PatchManager, StateEvent};
pub use planner::{MotionPath, MotionPlanner, PipettePose, Scene, Waypoint};
pub use record::{PatchRecord, RecordValue};
pub use rig::{Destination, Rig, RigDevices};
pub use state::{PatchState, StateContext, StateOutcome, StateSetup};
pub use stream::{MeasurementHub, PulsePump, PulseQueue};
pub use task::{OpHandle, TaskContext, TaskStatus};
