//! Quick Start Example
//!
//! Runs a complete automated patch attempt against the simulated rig:
//! approach, cell detect, seal, break-in, whole cell. Run with
//! `cargo run --example quick_start`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use autopatch_config::RigConfig;
use autopatch_core::states::{names, register_defaults};
use autopatch_core::{MeasurementHub, PatchManager, PulsePump, Rig, RigDevices};
use autopatch_hardware::{SimModel, SimRig};
use autopatch_traits::{MonotonicClock, TestPulseParams};
use nalgebra::Vector3;

fn main() -> Result<(), eyre::Report> {
    let mut model = SimModel::default();
    // A forgiving preparation for the demo: a wide contact patch.
    model.contact_radius = 5e-6;
    let cell = Vector3::from(model.cell_position);

    let sim = SimRig::new(model);
    let mut config = RigConfig::default();
    config.pressure.settle_ms = 10;
    config.geometry.approach_speed = 2e-3;

    let rig = Arc::new(Rig::new(
        RigDevices {
            clamp: Box::new(sim.clamp()),
            pressure: Box::new(sim.pressure()),
            stage: Box::new(sim.stage()),
            scope: Box::new(sim.scope()),
        },
        &config,
        Arc::new(MonotonicClock::new()),
    ));
    rig.clamp.set_test_pulse_params(TestPulseParams {
        amplitude: -10e-3,
        duration: 1e-3,
        interval: 0.02,
    })?;
    rig.set_target(Some(cell));

    let hub = MeasurementHub::new();
    let _pump = PulsePump::spawn(Box::new(sim.pulse_source()), hub.clone());

    let mut mgr = PatchManager::new(rig.clone(), hub);
    register_defaults(&mut mgr);
    let overrides: toml::value::Table = toml::from_str(
        r#"
        ["cell detect"]
        advance_speed = 10e-6
        fast_threshold = 1.5e6
        max_advance_distance = 400e-6
        detect_timeout = 90.0

        [seal]
        pressure_mode = "auto"
        delay_after_seal = 1.0

        ["cell attached"]
        auto_break_in_delay = 2.0
        "#,
    )?;
    mgr.set_overrides(overrides.into_iter().collect::<BTreeMap<_, _>>());

    let events = mgr.events();
    mgr.transition_to(names::APPROACH)?;

    // Drive the machine until it reaches whole-cell (or gives up).
    let deadline = std::time::Instant::now() + Duration::from_secs(180);
    while std::time::Instant::now() < deadline {
        mgr.poll(Duration::from_millis(100))?;
        for ev in events.try_iter() {
            println!("[{:>12}] {}", ev.state, ev.status);
        }
        match mgr.current_state() {
            Some(name) if name == names::WHOLE_CELL => {
                println!("\nwhole-cell configuration reached; patch record:");
                for (key, value) in mgr.record().snapshot() {
                    println!("  {key} = {value:?}");
                }
                mgr.abort();
                return Ok(());
            }
            None => break,
            _ => {}
        }
    }
    println!("\npatch attempt did not reach whole cell; record so far:");
    for (key, value) in mgr.record().snapshot() {
        println!("  {key} = {value:?}");
    }
    mgr.abort();
    Ok(())
}
