//! The built-in state library.
//!
//! Each state declares its recognized config keys as a serde struct with
//! defaults; the manager merges user override tables on top at construction
//! time. Transition policy lives entirely in the states: `run` returns the
//! next state's name.

pub mod approach;
pub mod bath;
pub mod break_in;
pub mod cell_attached;
pub mod cell_detect;
pub mod maintenance;
pub mod reseal;
pub mod seal;
pub mod terminal;
pub mod whole_cell;

use crate::config::merged_config;
use crate::manager::PatchManager;

/// Canonical state names.
pub mod names {
    pub const OUT: &str = "out";
    pub const BATH: &str = "bath";
    pub const APPROACH: &str = "approach";
    pub const CELL_DETECT: &str = "cell detect";
    pub const SEAL: &str = "seal";
    pub const CELL_ATTACHED: &str = "cell attached";
    pub const BREAK_IN: &str = "break in";
    pub const WHOLE_CELL: &str = "whole cell";
    pub const RESEAL: &str = "reseal";
    pub const HOME_WITH_NUCLEUS: &str = "home with nucleus";
    pub const BLOWOUT: &str = "blowout";
    pub const CLEAN: &str = "clean";
    pub const COLLECT: &str = "collect";
    pub const BROKEN: &str = "broken";
    pub const FOULED: &str = "fouled";
}

/// Register every built-in state on a manager.
pub fn register_defaults(mgr: &mut PatchManager) {
    mgr.register(names::OUT, |ov| {
        Ok(Box::new(terminal::OutState::new(merged_config(ov)?)))
    });
    mgr.register(names::BATH, |ov| {
        Ok(Box::new(bath::BathState::new(merged_config(ov)?)))
    });
    mgr.register(names::APPROACH, |ov| {
        Ok(Box::new(approach::ApproachState::new(merged_config(ov)?)))
    });
    mgr.register(names::CELL_DETECT, |ov| {
        Ok(Box::new(cell_detect::CellDetectState::new(merged_config(
            ov,
        )?)))
    });
    mgr.register(names::SEAL, |ov| {
        Ok(Box::new(seal::SealState::new(merged_config(ov)?)))
    });
    mgr.register(names::CELL_ATTACHED, |ov| {
        Ok(Box::new(cell_attached::CellAttachedState::new(
            merged_config(ov)?,
        )))
    });
    mgr.register(names::BREAK_IN, |ov| {
        Ok(Box::new(break_in::BreakInState::new(merged_config(ov)?)))
    });
    mgr.register(names::WHOLE_CELL, |ov| {
        Ok(Box::new(whole_cell::WholeCellState::new(merged_config(
            ov,
        )?)))
    });
    mgr.register(names::RESEAL, |ov| {
        Ok(Box::new(reseal::ResealState::new(merged_config(ov)?)))
    });
    mgr.register(names::HOME_WITH_NUCLEUS, |ov| {
        Ok(Box::new(reseal::HomeWithNucleusState::new(merged_config(
            ov,
        )?)))
    });
    mgr.register(names::BLOWOUT, |ov| {
        Ok(Box::new(maintenance::BlowoutState::new(merged_config(ov)?)))
    });
    mgr.register(names::CLEAN, |ov| {
        Ok(Box::new(maintenance::CleanState::new(merged_config(ov)?)))
    });
    mgr.register(names::COLLECT, |ov| {
        Ok(Box::new(maintenance::CollectState::new(merged_config(
            ov,
        )?)))
    });
    mgr.register(names::BROKEN, |ov| {
        Ok(Box::new(terminal::BrokenState::new(merged_config(ov)?)))
    });
    mgr.register(names::FOULED, |ov| {
        Ok(Box::new(terminal::FouledState::new(merged_config(ov)?)))
    });
}
