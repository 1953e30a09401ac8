//! Named-destination moves through the rig facade.

mod common;

use std::time::Duration;

use autopatch_core::Destination;
use autopatch_hardware::SimModel;
use common::{harness, test_config};
use nalgebra::Vector3;

#[test]
fn search_brings_the_tip_near_the_camera_roi() {
    let model = SimModel::default();
    let cell = Vector3::from(model.cell_position);
    let h = harness(model, test_config(), "", false);

    let op = h.rig.goto(Destination::Search).unwrap();
    op.wait(Duration::from_secs(30)).unwrap();

    let g = h.rig.planner.geometry().clone();
    let pos = h.rig.stage.position().unwrap();
    // Pulled back along the axis and lifted relative to the ROI center.
    let offset = pos - cell;
    assert!(
        (offset.norm() - g.search_distance).abs() < g.search_distance,
        "tip should sit about one search distance from the ROI: {offset:?}"
    );
    assert!(pos.z > cell.z, "tip stays above the focus plane");
}

#[test]
fn idle_then_home_retracts_and_parks() {
    let model = SimModel::default();
    let h = harness(model, test_config(), "", false);
    // Start submerged so both destinations need the axis retract.
    h.sim.place_tip([0.0, 0.0, -50e-6]);

    let op = h.rig.goto(Destination::Idle).unwrap();
    op.wait(Duration::from_secs(30)).unwrap();
    let g = h.rig.planner.geometry().clone();
    let pos = h.rig.stage.position().unwrap();
    assert!((pos.z - g.idle_height).abs() < 1e-9);

    let op = h.rig.goto(Destination::Home).unwrap();
    op.wait(Duration::from_secs(30)).unwrap();
    let pos = h.rig.stage.position().unwrap();
    assert_eq!(<[f64; 3]>::from(pos), g.home_position);
}

#[test]
fn target_move_lands_on_the_target() {
    let model = SimModel::default();
    let cell = Vector3::from(model.cell_position);
    let h = harness(model, test_config(), "", false);
    h.rig.set_target(Some(cell));

    let op = h.rig.goto(Destination::Target).unwrap();
    op.wait(Duration::from_secs(60)).unwrap();
    let pos = h.rig.stage.position().unwrap();
    assert!((pos - cell).norm() < 1e-9, "tip at target, got {pos:?}");
}

#[test]
fn destination_outside_stage_limits_fails_before_moving() {
    let mut model = SimModel::default();
    model.limits = ([-1e-3; 3], [1e-3; 3]);
    let h = harness(model, test_config(), "", false);
    // Default home is at x = -10 mm, outside these limits.
    let before = h.rig.stage.position().unwrap();
    let result = h.rig.goto(Destination::Home);
    assert!(result.is_err());
    assert_eq!(h.rig.stage.position().unwrap(), before);
}
