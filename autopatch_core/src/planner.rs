//! Motion planning for named destinations.
//!
//! Planners produce waypoint sequences; they never touch the stage. The
//! pipette's own axis (yaw + pitch) constrains every in-sample move: legs
//! that change depth travel along the axis so the tip cuts its own track
//! instead of sweeping sideways through tissue.

use nalgebra::Vector3;

use autopatch_config::GeometrySection;

use crate::error::{PatchError, Result, err};

/// Setup leg length used to approach a final position from a consistent
/// direction, cancelling stage backlash.
const SETUP_DISTANCE: f64 = 100e-6;
/// Height above the surface for the above-target hold point.
const ABOVE_TARGET_MARGIN: f64 = 50e-6;

/// Pipette position and axis orientation.
#[derive(Debug, Clone, Copy)]
pub struct PipettePose {
    pub position: Vector3<f64>,
    /// Axis yaw in the global XY plane, radians.
    pub yaw: f64,
    /// Axis pitch below horizontal, radians, in (0, pi/2).
    pub pitch: f64,
}

impl PipettePose {
    /// Unit vector along the pipette toward its tip (forward and down).
    pub fn direction(&self) -> Vector3<f64> {
        Vector3::new(
            self.pitch.cos() * self.yaw.cos(),
            self.pitch.cos() * self.yaw.sin(),
            -self.pitch.sin(),
        )
    }

    /// Horizontal projection of the axis direction.
    pub fn heading(&self) -> Vector3<f64> {
        Vector3::new(self.yaw.cos(), self.yaw.sin(), 0.0)
    }
}

/// One leg of a planned move. `linear` legs must be executed as straight
/// lines in global coordinates, not merely joint-interpolated.
#[derive(Debug, Clone, Copy)]
pub struct Waypoint {
    pub position: Vector3<f64>,
    pub speed: f64,
    pub linear: bool,
    pub note: &'static str,
}

impl Waypoint {
    pub fn new(position: Vector3<f64>, speed: f64, linear: bool, note: &'static str) -> Self {
        Self {
            position,
            speed,
            linear,
            note,
        }
    }
}

pub type MotionPath = Vec<Waypoint>;

/// Everything a planner needs to know about the world right now.
#[derive(Debug, Clone, Copy)]
pub struct Scene {
    pub pose: PipettePose,
    /// Sample surface depth (global z).
    pub surface_z: f64,
    /// Target cell position, when one has been set.
    pub target: Option<Vector3<f64>>,
}

impl Scene {
    fn target(&self) -> Result<Vector3<f64>> {
        self.target
            .ok_or_else(|| eyre::Report::new(PatchError::Config("no target position set".into())))
    }
}

/// Intermediate waypoint for extracting the tip from the sample.
///
/// Works in the pipette's vertical plane: `dx` along the horizontal heading
/// (negative = backward), `dz` vertical (positive = up), both relative to
/// the current tip position. Valid extractions have `dx <= 0` and `dz >= 0`;
/// anything else is a direct move.
///
/// The waypoint splits the move into an along-axis leg and a remainder:
/// when the end point sits steeper than the pipette axis, climb the axis
/// first and finish vertically; otherwise climb the axis only until the
/// target height is reached and finish horizontally.
pub fn extraction_waypoint(dx: f64, dz: f64, pitch: f64) -> Option<Vector3<f64>> {
    if !(pitch > 0.0 && pitch < std::f64::consts::FRAC_PI_2) {
        return None;
    }
    if dx == 0.0 && dz == 0.0 {
        return None;
    }
    if dx > 0.0 || dz < 0.0 {
        return None;
    }
    let angle = dz.atan2(-dx);
    let w = if angle > pitch {
        Vector3::new(dx, 0.0, -dx * pitch.tan())
    } else {
        Vector3::new(-dz / pitch.tan(), 0.0, dz)
    };
    if w.x.abs() < 1e-15 && w.z.abs() < 1e-15 {
        return None;
    }
    // A candidate outside the start/end bounding box means the geometry is
    // degenerate; issue a direct move instead.
    let in_box = (dx..=0.0).contains(&w.x) && (0.0..=dz).contains(&w.z);
    in_box.then_some(w)
}

/// Per-destination path construction.
#[derive(Debug, Clone)]
pub struct MotionPlanner {
    geometry: GeometrySection,
}

impl MotionPlanner {
    pub fn new(geometry: GeometrySection) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &GeometrySection {
        &self.geometry
    }

    /// Retract leg along the pipette axis up to the given height, when the
    /// tip is below it.
    fn retract_to(&self, scene: &Scene, z: f64, speed: f64) -> Option<Waypoint> {
        let pose = &scene.pose;
        if pose.position.z >= z {
            return None;
        }
        let t = (z - pose.position.z) / pose.pitch.sin();
        let p = pose.position - pose.direction() * t;
        Some(Waypoint::new(p, speed, true, "axis retract"))
    }

    /// Just the retract-out-of-sample leg, when the tip is submerged.
    pub fn clear_sample(&self, scene: &Scene) -> MotionPath {
        let clear_z = scene.surface_z + self.geometry.clearance;
        self.retract_to(scene, clear_z, self.geometry.slow_speed)
            .into_iter()
            .collect()
    }

    /// Home: diagonal extraction until above the sample, then travel to the
    /// stage home position.
    pub fn home(&self, scene: &Scene) -> MotionPath {
        let g = &self.geometry;
        let mut path = MotionPath::new();
        let clear_z = scene.surface_z + g.clearance;
        let mut cur = scene.pose.position;
        if let Some(wp) = self.retract_to(scene, clear_z, g.slow_speed) {
            cur = wp.position;
            path.push(wp);
        }
        let home = Vector3::from(g.home_position);
        let heading = scene.pose.heading();
        let dx = (home - cur).dot(&heading);
        let dz = home.z - cur.z;
        if let Some(w) = extraction_waypoint(dx, dz, scene.pose.pitch) {
            let p = cur + heading * w.x + Vector3::z() * w.z;
            path.push(Waypoint::new(p, g.fast_speed, false, "diagonal"));
        }
        path.push(Waypoint::new(home, g.fast_speed, false, "home"));
        path
    }

    /// Search: bring the tip into the camera's field of view, pulled back
    /// along the axis and above the focus plane.
    ///
    /// `roi_center` is the camera ROI center already mapped to global
    /// coordinates at the search focus plane.
    pub fn search(&self, scene: &Scene, roi_center: Vector3<f64>) -> MotionPath {
        let g = &self.geometry;
        let lift = g.search_tip_height - g.search_height;
        let p = roi_center + Vector3::z() * lift - scene.pose.direction() * g.search_distance;
        vec![Waypoint::new(p, g.fast_speed, false, "search")]
    }

    /// Focus depth to set while searching for the tip.
    pub fn search_focus_z(&self, scene: &Scene) -> f64 {
        scene.surface_z + self.geometry.search_height
    }

    /// Approach: retract to standby height if needed, then translate to the
    /// point above the target on the pipette axis.
    pub fn approach(&self, scene: &Scene) -> Result<MotionPath> {
        let g = &self.geometry;
        let target = scene.target()?;
        let standby_z = scene.surface_z + g.approach_height;
        let mut path = MotionPath::new();
        let mut cur = scene.pose.position;
        if let Some(wp) = self.retract_to(scene, standby_z, g.slow_speed) {
            cur = wp.position;
            path.push(wp);
        }
        let d = scene.pose.direction();
        let s = (standby_z - target.z) / scene.pose.pitch.sin();
        if s < 0.0 {
            return err(PatchError::Config(
                "target is above the approach standby plane".into(),
            ));
        }
        let above = target - d * s;
        // Closest point on the approach axis to the current position; worth
        // visiting only when it sits above the standby plane, otherwise it
        // would backtrack into the sample.
        let nearest = target + d * (cur - target).dot(&d);
        if nearest.z > standby_z && (nearest - cur).norm() > 1e-9 {
            path.push(Waypoint::new(nearest, g.approach_speed, false, "axis join"));
        }
        path.push(Waypoint::new(above, g.approach_speed, false, "standby"));
        Ok(path)
    }

    /// Target: the approach path plus a final straight slow leg onto the
    /// target.
    pub fn target(&self, scene: &Scene) -> Result<MotionPath> {
        let g = &self.geometry;
        let target = scene.target()?;
        let mut path = self.approach(scene)?;
        path.push(Waypoint::new(target, g.slow_speed, true, "target"));
        Ok(path)
    }

    /// Above-target: a setup leg from a consistent direction, then a short
    /// translation to the hold point over the target.
    pub fn above_target(&self, scene: &Scene) -> Result<MotionPath> {
        let g = &self.geometry;
        let target = scene.target()?;
        let hold = Vector3::new(
            target.x,
            target.y,
            scene.surface_z + ABOVE_TARGET_MARGIN,
        );
        let setup = hold - scene.pose.direction() * SETUP_DISTANCE;
        Ok(vec![
            Waypoint::new(setup, g.fast_speed, false, "setup"),
            Waypoint::new(hold, g.approach_speed, false, "above target"),
        ])
    }

    /// Idle: retract out of the sample, then park away from the work area
    /// on the side the pipette came from.
    pub fn idle(&self, scene: &Scene) -> MotionPath {
        let g = &self.geometry;
        let idle_z = scene.surface_z + g.idle_height;
        let mut path = MotionPath::new();
        if let Some(wp) = self.retract_to(scene, idle_z, g.slow_speed) {
            path.push(wp);
        }
        let park = Vector3::new(
            g.origin[0] - g.idle_distance * scene.pose.yaw.cos(),
            g.origin[1] - g.idle_distance * scene.pose.yaw.sin(),
            idle_z,
        );
        path.push(Waypoint::new(park, g.fast_speed, false, "idle"));
        path
    }

    /// Route to a wash/collection well through its stored safe waypoints.
    /// The reverse path is returned alongside as the undo.
    pub fn well_route(
        &self,
        scene: &Scene,
        route: &[[f64; 3]],
    ) -> Result<(MotionPath, MotionPath)> {
        if route.is_empty() {
            return err(PatchError::Config("well route has no waypoints".into()));
        }
        let g = &self.geometry;
        let forward: MotionPath = route
            .iter()
            .map(|p| Waypoint::new(Vector3::from(*p), g.fast_speed, false, "well"))
            .collect();
        let mut back: MotionPath = route
            .iter()
            .rev()
            .skip(1)
            .map(|p| Waypoint::new(Vector3::from(*p), g.fast_speed, false, "well return"))
            .collect();
        back.push(Waypoint::new(
            scene.pose.position,
            g.fast_speed,
            false,
            "restore",
        ));
        Ok((forward, back))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(x: f64, z: f64) -> PipettePose {
        PipettePose {
            position: Vector3::new(x, 0.0, z),
            yaw: 0.0,
            pitch: 0.5,
        }
    }

    fn planner() -> MotionPlanner {
        MotionPlanner::new(GeometrySection::default())
    }

    #[test]
    fn direction_points_forward_and_down() {
        let d = pose(0.0, 0.0).direction();
        assert!(d.x > 0.0 && d.z < 0.0);
        assert!((d.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn extraction_steep_end_climbs_axis_first() {
        // End steeper than the pitch: full horizontal run along the axis.
        let w = extraction_waypoint(-100e-6, 500e-6, 0.5).unwrap();
        assert!((w.x - -100e-6).abs() < 1e-12);
        assert!((w.z - 100e-6 * 0.5f64.tan()).abs() < 1e-12);
    }

    #[test]
    fn extraction_shallow_end_climbs_to_height_first() {
        // End shallower than the pitch: climb the axis only to the end height.
        let w = extraction_waypoint(-500e-6, 100e-6, 0.5).unwrap();
        assert!((w.z - 100e-6).abs() < 1e-12);
        assert!((w.x - -100e-6 / 0.5f64.tan()).abs() < 1e-12);
    }

    #[test]
    fn extraction_direct_cases_have_no_waypoint() {
        assert!(extraction_waypoint(0.0, 0.0, 0.5).is_none());
        assert!(extraction_waypoint(50e-6, 100e-6, 0.5).is_none());
        assert!(extraction_waypoint(-50e-6, -1e-6, 0.5).is_none());
    }

    #[test]
    fn extraction_waypoint_stays_in_bounding_box() {
        for (dx, dz) in [(-1e-3, 1e-6), (-1e-6, 1e-3), (-300e-6, 300e-6)] {
            if let Some(w) = extraction_waypoint(dx, dz, 0.4) {
                assert!(w.x >= dx && w.x <= 0.0, "x {w:?} for ({dx}, {dz})");
                assert!(w.z >= 0.0 && w.z <= dz, "z {w:?} for ({dx}, {dz})");
            }
        }
    }

    #[test]
    fn home_retracts_before_travelling_when_submerged() {
        let p = planner();
        let scene = Scene {
            pose: pose(0.0, -50e-6),
            surface_z: 0.0,
            target: None,
        };
        let path = p.home(&scene);
        assert!(path.len() >= 2);
        assert_eq!(path[0].note, "axis retract");
        assert!(path[0].linear);
        let clear = scene.surface_z + p.geometry().clearance;
        assert!((path[0].position.z - clear).abs() < 1e-9);
        assert_eq!(
            path.last().unwrap().position,
            Vector3::from(p.geometry().home_position)
        );
    }

    #[test]
    fn approach_ends_above_target_on_the_axis() {
        let p = planner();
        let target = Vector3::new(1e-3, 0.0, -50e-6);
        let scene = Scene {
            pose: pose(0.0, 500e-6),
            surface_z: 0.0,
            target: Some(target),
        };
        let path = p.approach(&scene).unwrap();
        let last = path.last().unwrap();
        let standby_z = scene.surface_z + p.geometry().approach_height;
        assert!((last.position.z - standby_z).abs() < 1e-9);
        // The end point lies on the pipette axis through the target.
        let d = scene.pose.direction();
        let offset = last.position - target;
        let cross = offset.cross(&d).norm();
        assert!(cross < 1e-9, "not on axis: {cross}");
    }

    #[test]
    fn target_path_finishes_with_slow_linear_leg() {
        let p = planner();
        let target = Vector3::new(1e-3, 0.0, -50e-6);
        let scene = Scene {
            pose: pose(0.0, 500e-6),
            surface_z: 0.0,
            target: Some(target),
        };
        let path = p.target(&scene).unwrap();
        let last = path.last().unwrap();
        assert!(last.linear);
        assert_eq!(last.position, target);
        assert!((last.speed - p.geometry().slow_speed).abs() < 1e-12);
    }

    #[test]
    fn above_target_has_setup_then_hold() {
        let p = planner();
        let target = Vector3::new(1e-3, 2e-3, -50e-6);
        let scene = Scene {
            pose: pose(0.0, 500e-6),
            surface_z: 0.0,
            target: Some(target),
        };
        let path = p.above_target(&scene).unwrap();
        assert_eq!(path.len(), 2);
        let hold = path[1].position;
        assert_eq!((hold.x, hold.y), (target.x, target.y));
        assert!((hold.z - ABOVE_TARGET_MARGIN).abs() < 1e-12);
        let setup_len = (path[0].position - hold).norm();
        assert!((setup_len - SETUP_DISTANCE).abs() < 1e-9);
    }

    #[test]
    fn idle_parks_opposite_the_yaw() {
        let p = planner();
        let scene = Scene {
            pose: pose(0.0, 2e-3),
            surface_z: 0.0,
            target: None,
        };
        let path = p.idle(&scene);
        let park = path.last().unwrap().position;
        assert!(park.x < 0.0, "yaw 0 parks on -x: {park:?}");
        assert!((park.z - p.geometry().idle_height).abs() < 1e-12);
    }

    #[test]
    fn well_route_reverse_ends_at_the_start() {
        let p = planner();
        let scene = Scene {
            pose: pose(1e-3, 2e-3),
            surface_z: 0.0,
            target: None,
        };
        let route = [[5e-3, -20e-3, 2e-3], [5e-3, -25e-3, -1e-3]];
        let (fwd, back) = p.well_route(&scene, &route).unwrap();
        assert_eq!(fwd.len(), 2);
        assert_eq!(back.len(), 2);
        assert_eq!(back.last().unwrap().position, scene.pose.position);
    }
}
