//! End-to-end scenarios against the simulated rig.

mod common;

use std::time::{Duration, Instant};

use autopatch_core::RecordValue;
use autopatch_core::states::names;
use autopatch_hardware::SimModel;
use common::{drive_until, harness, pulse, test_config};
use nalgebra::Vector3;

/// Gap between hand-published pulses, comfortably above one drain cycle so
/// consumers never coalesce two pulses into one.
const GAP: Duration = Duration::from_millis(300);

#[test]
fn clean_entry_to_bath_establishes_baseline_and_stays() {
    let mut model = SimModel::default();
    model.bath_resistance = 10e6;
    let mut h = harness(
        model.clone(),
        test_config(),
        "[approach]\nnext_state = \"bath\"\n",
        true,
    );
    h.rig.set_target(Some(Vector3::from(model.cell_position)));

    h.mgr.transition_to(names::APPROACH).unwrap();
    drive_until(&mut h, names::BATH, Duration::from_secs(20));

    // Let the bath state take its baseline.
    let deadline = Instant::now() + Duration::from_secs(10);
    let initial = loop {
        if let Some(r) = h.mgr.record().get_number("initialBathResistance") {
            break r;
        }
        assert!(Instant::now() < deadline, "no bath baseline recorded");
        h.mgr.poll(Duration::from_millis(50)).unwrap();
    };
    assert!(
        (initial - 10e6).abs() < 1e6,
        "baseline should be ~10 MOhm, got {initial}"
    );

    // Healthy resistance: the bath state keeps monitoring, no transition.
    std::thread::sleep(Duration::from_millis(500));
    h.mgr.poll(Duration::ZERO).unwrap();
    assert_eq!(h.mgr.current_state(), Some(names::BATH));
    assert!(h.mgr.is_running());
}

#[test]
fn fast_cell_detection_fires_on_the_jump() {
    let mut h = harness(
        SimModel::default(),
        test_config(),
        "[\"cell detect\"]\nauto_advance = false\ninitial_resistance = 5e6\n",
        false,
    );

    h.mgr.transition_to(names::CELL_DETECT).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    for (i, r) in [5.0e6, 5.1e6, 5.2e6, 6.3e6].into_iter().enumerate() {
        h.hub.publish(pulse(i as f64 * 0.2, r));
        std::thread::sleep(GAP);
    }

    drive_until(&mut h, names::SEAL, Duration::from_secs(10));
    assert_eq!(h.mgr.record().get_bool("detectedCell"), Some(true));
    assert_eq!(h.mgr.record().get_bool("cellDetectFastRule"), Some(true));
    h.mgr.abort();
}

#[test]
fn slow_monotonic_detection_fires_on_the_fifth_pulse() {
    let mut h = harness(
        SimModel::default(),
        test_config(),
        concat!(
            "[\"cell detect\"]\n",
            "auto_advance = false\n",
            "initial_resistance = 5e6\n",
            "fast_threshold = 10e6\n",
            "slow_threshold = 0.2e6\n",
            "slow_steps = 3\n"
        ),
        false,
    );

    h.mgr.transition_to(names::CELL_DETECT).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let stream = [5.00e6, 5.05e6, 5.10e6, 5.15e6, 5.22e6];
    for (i, r) in stream.into_iter().enumerate() {
        // The first four pulses must not fire.
        assert_eq!(h.mgr.record().get_bool("detectedCell"), None);
        h.hub.publish(pulse(i as f64 * 0.2, r));
        std::thread::sleep(GAP);
    }

    drive_until(&mut h, names::SEAL, Duration::from_secs(10));
    assert_eq!(h.mgr.record().get_bool("detectedCell"), Some(true));
    h.mgr.abort();
}

#[test]
fn auto_seal_descends_pressure_by_the_slope_table() {
    let mut h = harness(
        SimModel::default(),
        test_config(),
        concat!(
            "[seal]\n",
            "pressure_mode = \"auto\"\n",
            "starting_pressure = -1000.0\n",
            "pressure_change_rates = [[0.5e6, -100.0], [100e6, 0.0], [-1e6, 200.0]]\n",
            "slope_samples = 2\n"
        ),
        false,
    );

    h.mgr.transition_to(names::SEAL).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    // Rising at 0.2 MOhm/s: the first table row (max slope 0.5 MOhm/s)
    // applies -100 Pa per update.
    h.hub.publish(pulse(0.0, 5.00e6));
    std::thread::sleep(GAP);
    h.hub.publish(pulse(0.2, 5.04e6));
    std::thread::sleep(GAP);
    h.hub.publish(pulse(0.4, 5.08e6));
    std::thread::sleep(GAP);

    let p = h.rig.pressure.current();
    assert_eq!(
        p.source,
        autopatch_traits::PressureSource::Regulator,
        "auto mode drives the regulator"
    );
    assert!(
        (p.pressure - -1100.0).abs() < 1e-6,
        "-1000 with one -100 step expected, got {}",
        p.pressure
    );
    h.mgr.abort();
}

#[test]
fn pipette_break_during_seal_goes_to_broken() {
    let mut h = harness(SimModel::default(), test_config(), "", false);

    h.mgr.transition_to(names::SEAL).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    h.hub.publish(pulse(0.0, 10e6));
    std::thread::sleep(GAP);
    // Two megaohms below the captured baseline, break threshold is -1 MOhm.
    h.hub.publish(pulse(0.2, 8e6));

    let deadline = Instant::now() + Duration::from_secs(10);
    while h.mgr.record().get_bool("tipBroken") != Some(true) {
        assert!(Instant::now() < deadline, "never reached broken");
        h.mgr.poll(Duration::from_millis(50)).unwrap();
    }
    assert_eq!(h.mgr.record().get_bool("sealSuccessful"), Some(false));
}

#[test]
fn seal_already_above_threshold_succeeds_with_no_pressure_applied() {
    let mut h = harness(
        SimModel::default(),
        test_config(),
        "[seal]\ndelay_after_seal = 0.2\n",
        false,
    );

    let switches_before = h.rig.pressure.source_switch_count();
    h.mgr.transition_to(names::SEAL).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    h.hub.publish(pulse(0.0, 2e9));

    drive_until(&mut h, names::CELL_ATTACHED, Duration::from_secs(10));
    assert_eq!(h.mgr.record().get_bool("sealSuccessful"), Some(true));
    assert_eq!(
        h.rig.pressure.source_switch_count(),
        switches_before,
        "no pressure commands on the already-sealed path"
    );
    h.mgr.abort();
}

#[test]
fn cancellation_during_motion_interrupts_and_restores_safety() {
    let mut cfg = test_config();
    cfg.geometry.approach_speed = 0.5e-3; // ~4 s travel
    let model = SimModel::default();
    let mut h = harness(model.clone(), cfg, "", false);
    h.rig.set_target(Some(Vector3::from(model.cell_position)));

    let start = h.rig.stage.position().unwrap();
    h.mgr.transition_to(names::APPROACH).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    let moved = h.rig.stage.position().unwrap();
    assert!((moved - start).norm() > 1e-6, "move should be in progress");

    let t0 = Instant::now();
    h.mgr.abort();
    assert!(
        t0.elapsed() < Duration::from_secs(1),
        "abort should complete promptly, took {:?}",
        t0.elapsed()
    );

    // The move stopped: position is stable.
    let p1 = h.rig.stage.position().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    let p2 = h.rig.stage.position().unwrap();
    assert!((p2 - p1).norm() < 1e-9, "stage still moving after abort");

    // And the pipette is vented.
    assert_eq!(
        h.rig.pressure.current().source,
        autopatch_traits::PressureSource::Atmosphere
    );
    assert!(!h.mgr.is_running());
}

#[test]
fn cell_detect_timeout_zero_falls_back_immediately() {
    let mut h = harness(
        SimModel::default(),
        test_config(),
        "[\"cell detect\"]\ndetect_timeout = 0.0\n",
        false,
    );

    h.mgr.transition_to(names::CELL_DETECT).unwrap();
    drive_until(&mut h, names::BATH, Duration::from_secs(10));
    h.mgr.abort();
}

#[test]
fn reseal_with_zero_success_distance_succeeds_on_first_measurement() {
    let mut h = harness(
        SimModel::default(),
        test_config(),
        concat!(
            "[reseal]\n",
            "retraction_success_distance = 0.0\n",
            "slurp_duration = 0.1\n",
            "lift_distance = 10e-6\n",
            "retraction_speed = 50e-6\n",
            "success_state = \"out\"\n"
        ),
        false,
    );

    h.mgr.transition_to(names::RESEAL).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    for i in 0..6 {
        h.hub.publish(pulse(i as f64 * 0.2, 1e9));
        std::thread::sleep(GAP);
    }

    let deadline = Instant::now() + Duration::from_secs(15);
    while h.mgr.record().get_bool("resealSuccessful") != Some(true) {
        assert!(Instant::now() < deadline, "reseal never succeeded");
        h.mgr.poll(Duration::from_millis(50)).unwrap();
    }
    assert!(matches!(
        h.mgr.record().get("resealStartResistance"),
        Some(RecordValue::Number(_))
    ));
}
