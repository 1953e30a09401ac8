//! Shared harness: a simulated rig wired into a manager.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use autopatch_config::RigConfig;
use autopatch_core::states::register_defaults;
use autopatch_core::{MeasurementHub, PatchManager, PulsePump, Rig, RigDevices};
use autopatch_hardware::{SimModel, SimRig};
use autopatch_traits::{MonotonicClock, TestPulse, TestPulseAnalysis, TestPulseParams};

pub struct Harness {
    pub sim: SimRig,
    pub rig: Arc<Rig>,
    pub mgr: PatchManager,
    pub hub: MeasurementHub,
    pub pump: Option<PulsePump>,
}

/// Test-friendly rig config: 1 ms regulator settling, brisk travel speeds.
pub fn test_config() -> RigConfig {
    let mut cfg = RigConfig::default();
    cfg.pressure.settle_ms = 1;
    cfg.geometry.approach_speed = 5e-3;
    cfg.geometry.fast_speed = 10e-3;
    cfg.geometry.slow_speed = 2e-3;
    cfg
}

/// Build a harness. `with_pump` starts the real pulse pump off the sim
/// amplifier; leave it off to publish pulses by hand. `states_toml` holds
/// per-state override tables, e.g. `[seal]\npressure_mode = "auto"`.
pub fn harness(model: SimModel, cfg: RigConfig, states_toml: &str, with_pump: bool) -> Harness {
    let sim = SimRig::new(model);
    let devices = RigDevices {
        clamp: Box::new(sim.clamp()),
        pressure: Box::new(sim.pressure()),
        stage: Box::new(sim.stage()),
        scope: Box::new(sim.scope()),
    };
    let rig = Arc::new(Rig::new(devices, &cfg, Arc::new(MonotonicClock::new())));
    rig.clamp
        .set_test_pulse_params(TestPulseParams {
            amplitude: -10e-3,
            duration: 1e-3,
            interval: 0.01,
        })
        .unwrap();

    let hub = MeasurementHub::new();
    let pump = with_pump.then(|| PulsePump::spawn(Box::new(sim.pulse_source()), hub.clone()));

    let mut mgr = PatchManager::new(rig.clone(), hub.clone());
    register_defaults(&mut mgr);
    if !states_toml.is_empty() {
        let table: toml::value::Table = toml::from_str(states_toml).unwrap();
        let overrides: BTreeMap<String, toml::Value> = table.into_iter().collect();
        mgr.set_overrides(overrides);
    }

    Harness {
        sim,
        rig,
        mgr,
        hub,
        pump,
    }
}

pub fn pulse(t: f64, r: f64) -> TestPulse {
    TestPulse {
        start_time: t,
        analysis: TestPulseAnalysis {
            steady_state_resistance: r,
            capacitance: 3e-12,
            baseline_current: 0.0,
        },
    }
}

pub fn pulse_with(t: f64, r: f64, capacitance: f64, current: f64) -> TestPulse {
    TestPulse {
        start_time: t,
        analysis: TestPulseAnalysis {
            steady_state_resistance: r,
            capacitance,
            baseline_current: current,
        },
    }
}

/// Drive the manager until it sits in `state`, or panic at the deadline.
pub fn drive_until(h: &mut Harness, state: &str, deadline: Duration) {
    let end = Instant::now() + deadline;
    loop {
        if h.mgr.current_state() == Some(state) && h.mgr.is_running() {
            return;
        }
        if Instant::now() >= end {
            panic!(
                "never reached `{state}`; currently {:?}",
                h.mgr.current_state()
            );
        }
        h.mgr.poll(Duration::from_millis(50)).unwrap();
    }
}
