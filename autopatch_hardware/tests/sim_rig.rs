//! Behavior of the simulated preparation model.

use std::time::Duration;

use autopatch_hardware::{SimModel, SimPulses, SimRig};
use autopatch_traits::{
    ClampAmplifier, PressureRegulator, PressureSource, PulseSource, TestPulseParams,
};

fn fast_pulses(rig: &SimRig) -> SimPulses {
    let mut clamp = rig.clamp();
    clamp
        .set_test_pulse_params(TestPulseParams {
            amplitude: -10e-3,
            duration: 1e-3,
            interval: 2e-3,
        })
        .unwrap();
    clamp.enable_test_pulse(true).unwrap();
    rig.pulse_source()
}

fn next_resistance(pulses: &mut SimPulses) -> f64 {
    for _ in 0..50 {
        if let Some(p) = pulses.read_pulse(Duration::from_millis(20)).unwrap() {
            return p.analysis.steady_state_resistance;
        }
    }
    panic!("no pulse produced");
}

#[test]
fn dry_tip_reads_high_then_bath_after_immersion() {
    let rig = SimRig::default();
    let mut clamp = fast_pulses(&rig);

    rig.place_tip([0.0, 0.0, 5e-3]);
    assert!(next_resistance(&mut clamp) > 1e9);

    rig.place_tip([0.0, 0.0, 0.5e-3]);
    let r = next_resistance(&mut clamp);
    assert!((r - 5e6).abs() < 0.5e6, "bath resistance, got {r}");
}

#[test]
fn resistance_rises_monotonically_on_approach() {
    let model = SimModel::default();
    let cell = model.cell_position;
    let rig = SimRig::new(model);
    let mut clamp = fast_pulses(&rig);

    let mut last = 0.0;
    for d in [12e-6, 8e-6, 5e-6, 3e-6] {
        rig.place_tip([cell[0] - d, cell[1], cell[2]]);
        let r = next_resistance(&mut clamp);
        assert!(r > last, "expected rise at {d}, {r} <= {last}");
        last = r;
    }
}

#[test]
fn suction_at_contact_forms_gigaseal_and_pulse_breaks_in() {
    let model = SimModel::default();
    let cell = model.cell_position;
    let rig = SimRig::new(model);
    let mut clamp = fast_pulses(&rig);
    let mut pressure = rig.pressure();

    rig.place_tip(cell);
    pressure.set_setpoint(-2e3).unwrap();
    pressure.select_source(PressureSource::Regulator).unwrap();

    // Seal tau is 1 s; a few seconds of suction should pass 1 GOhm.
    let mut sealed = false;
    for _ in 0..200 {
        if next_resistance(&mut clamp) > 1e9 {
            sealed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    assert!(sealed, "seal never formed: {}", rig.seal_resistance());
    assert!(!rig.whole_cell());

    pressure.set_setpoint(-25e3).unwrap();
    let r = next_resistance(&mut clamp);
    assert!(rig.whole_cell(), "break-in pulse should rupture the patch");
    assert!(r < 1e9, "access resistance after break-in, got {r}");
}

#[test]
fn strong_positive_pressure_clears_the_tip() {
    let rig = SimRig::default();
    let mut pressure = rig.pressure();
    rig.force_seal(2e9);

    pressure.set_setpoint(50e3).unwrap();
    pressure.select_source(PressureSource::Regulator).unwrap();
    // A later command steps the model again with the pressure applied.
    pressure.set_setpoint(50e3).unwrap();
    assert!(rig.seal_resistance() < 1e6);
}
