//! Stage facade: limit-checked moves returning cancellable handles.
//!
//! Motion is asynchronous at the device; the facade polls `is_moving` from
//! a worker thread so callers get the same `OpHandle` protocol as every
//! other long operation. A stop request halts the hardware before the
//! worker exits.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use autopatch_traits::{Clock, Stage};
use eyre::WrapErr;
use nalgebra::Vector3;

use crate::dev_error::map_dev_error;
use crate::error::{PatchError, Report, Result, err};
use crate::planner::{MotionPath, Waypoint};
use crate::task::{OpHandle, StopToken};

/// Poll interval for in-flight moves.
const MOVE_POLL: Duration = Duration::from_millis(50);

pub struct StageFacade {
    dev: Arc<Mutex<Box<dyn Stage>>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl StageFacade {
    pub fn new(dev: Box<dyn Stage>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            dev: Arc::new(Mutex::new(dev)),
            clock,
        }
    }

    pub fn position(&self) -> Result<Vector3<f64>> {
        let p = lock(&self.dev)
            .position()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("read stage position")?;
        Ok(Vector3::from(p))
    }

    pub fn limits(&self) -> Result<(Vector3<f64>, Vector3<f64>)> {
        let (lo, hi) = lock(&self.dev)
            .limits()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("read stage limits")?;
        Ok((Vector3::from(lo), Vector3::from(hi)))
    }

    /// Reject a target outside the stage travel before any motion starts.
    pub fn check_limits(&self, target: Vector3<f64>) -> Result<()> {
        let (lo, hi) = self.limits()?;
        for axis in 0..3 {
            if target[axis] < lo[axis] || target[axis] > hi[axis] {
                return err(PatchError::OutOfRange(format!(
                    "axis {axis}: {:.6} outside [{:.6}, {:.6}]",
                    target[axis], lo[axis], hi[axis]
                )));
            }
        }
        Ok(())
    }

    /// Start a move and return a handle that completes when motion ends.
    pub fn move_to(&self, target: Vector3<f64>, speed: f64, linear: bool) -> Result<OpHandle> {
        self.check_limits(target)?;
        let current = self.position()?;
        if (target - current).norm() < 1e-12 {
            return Ok(OpHandle::ready("move"));
        }
        let dev = self.dev.clone();
        Ok(OpHandle::spawn("move", self.clock.clone(), move |token| {
            run_leg(&dev, token, target, speed, linear)
        }))
    }

    /// Execute a waypoint sequence, waiting for each leg.
    pub fn move_path(&self, path: &MotionPath) -> Result<OpHandle> {
        for wp in path {
            self.check_limits(wp.position)?;
        }
        if path.is_empty() {
            return Ok(OpHandle::ready("path"));
        }
        let legs: Vec<Waypoint> = path.clone();
        let dev = self.dev.clone();
        Ok(OpHandle::spawn("path", self.clock.clone(), move |token| {
            for wp in &legs {
                tracing::debug!(note = wp.note, "path leg");
                run_leg(&dev, token, wp.position, wp.speed, wp.linear)?;
            }
            Ok(())
        }))
    }

    /// Small relative move.
    pub fn step(&self, deltas: Vector3<f64>, speed: f64) -> Result<OpHandle> {
        let target = self.position()? + deltas;
        self.move_to(target, speed, false)
    }

    /// Best-effort immediate halt.
    pub fn halt(&self) {
        if let Err(e) = lock(&self.dev).halt() {
            tracing::warn!(error = %e, "stage halt failed");
        }
    }
}

fn run_leg(
    dev: &Arc<Mutex<Box<dyn Stage>>>,
    token: &StopToken,
    target: Vector3<f64>,
    speed: f64,
    linear: bool,
) -> Result<()> {
    token.checkpoint()?;
    lock(dev)
        .start_move(target.into(), speed, linear)
        .map_err(|e| Report::new(map_dev_error(&*e)))
        .wrap_err("start move")?;
    loop {
        if let Err(stop) = token.sleep(MOVE_POLL) {
            if let Err(e) = lock(dev).halt() {
                tracing::warn!(error = %e, "stage halt on stop failed");
            }
            return Err(stop);
        }
        let moving = lock(dev)
            .is_moving()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("poll move")?;
        if !moving {
            return Ok(());
        }
    }
}

fn lock(dev: &Arc<Mutex<Box<dyn Stage>>>) -> MutexGuard<'_, Box<dyn Stage>> {
    match dev.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::patch_error;
    use crate::mocks::NoopStage;
    use crate::task::TaskStatus;
    use autopatch_traits::MonotonicClock;

    fn facade() -> StageFacade {
        StageFacade::new(
            Box::new(NoopStage::new([0.0; 3], Duration::from_millis(200))),
            Arc::new(MonotonicClock::new()),
        )
    }

    #[test]
    fn out_of_range_fails_before_starting() {
        let f = facade();
        let e = f
            .move_to(Vector3::new(1.0, 0.0, 0.0), 1e-3, false)
            .unwrap_err();
        assert!(matches!(patch_error(&e), Some(PatchError::OutOfRange(_))));
        // Position unchanged: the move never started.
        assert_eq!(f.position().unwrap(), Vector3::zeros());
    }

    #[test]
    fn move_completes_and_updates_position() {
        let f = facade();
        let target = Vector3::new(1e-3, 2e-3, 0.0);
        let op = f.move_to(target, 1e-3, false).unwrap();
        op.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(f.position().unwrap(), target);
    }

    #[test]
    fn zero_length_move_is_already_done() {
        let f = facade();
        let op = f.move_to(Vector3::zeros(), 1e-3, false).unwrap();
        assert_eq!(op.status(), TaskStatus::Done);
    }

    #[test]
    fn stop_halts_midway() {
        let f = facade();
        let op = f.move_to(Vector3::new(5e-3, 0.0, 0.0), 1e-3, false).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        op.stop();
        assert!(op.wait(Duration::from_secs(2)).is_err());
        assert_eq!(op.status(), TaskStatus::Interrupted);
        let p = f.position().unwrap();
        assert!(p.x < 5e-3, "halted before the target: {p:?}");
    }

    #[test]
    fn path_visits_each_leg_in_order() {
        let f = facade();
        let path = vec![
            Waypoint::new(Vector3::new(1e-3, 0.0, 0.0), 1e-3, false, "a"),
            Waypoint::new(Vector3::new(1e-3, 1e-3, 0.0), 1e-3, true, "b"),
        ];
        let op = f.move_path(&path).unwrap();
        op.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(f.position().unwrap(), Vector3::new(1e-3, 1e-3, 0.0));
    }
}
