//! One pipette's view of the hardware: the actuator facades, the scope, the
//! planner and the shared timebase, bundled for handing to states.

use std::sync::{Arc, Mutex, MutexGuard};

use autopatch_config::RigConfig;
use autopatch_traits::{
    ClampAmplifier, ClampMode, Clock, PressureRegulator, PressureSource, Scope, Stage,
};
use eyre::WrapErr;
use nalgebra::Vector3;

use crate::clamp::ClampFacade;
use crate::dev_error::map_dev_error;
use crate::error::{Report, Result};
use crate::planner::{MotionPlanner, PipettePose, Scene};
use crate::pressure::{PressureFacade, PressureSettings};
use crate::stage::StageFacade;
use crate::task::OpHandle;
use crate::transform::{FrameId, FrameTree};

/// Named motion destinations a pipette can be sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Home,
    /// Into the camera's field of view for tip calibration; also moves the
    /// focus to the search plane.
    Search,
    /// Standby point above the target on the pipette axis.
    Approach,
    /// All the way onto the target.
    Target,
    /// Hold point just above the target.
    AboveTarget,
    /// Parked out of the way, above the sample.
    Idle,
}

/// Scope access plus the camera-to-global coordinate chain.
///
/// The frame tree's composed-transform cache is interior-mutable, so the
/// tree lives under the same discipline as the device: locked per call.
pub struct ScopeFacade {
    dev: Mutex<Box<dyn Scope>>,
    tree: Mutex<FrameTree>,
    camera: FrameId,
}

impl ScopeFacade {
    pub fn new(dev: Box<dyn Scope>, scope_offset: [f64; 3], camera_offset: [f64; 3]) -> Self {
        let mut tree = FrameTree::new();
        let scope = tree.add_offset_frame(None, scope_offset);
        let camera = tree.add_offset_frame(Some(scope), camera_offset);
        Self {
            dev: Mutex::new(dev),
            tree: Mutex::new(tree),
            camera,
        }
    }

    pub fn surface_depth(&self) -> Result<f64> {
        self.lock()
            .surface_depth()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("read surface depth")
    }

    pub fn set_focus_depth(&self, z: f64) -> Result<()> {
        self.lock()
            .set_focus_depth(z)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("set focus depth")
    }

    /// Camera ROI center mapped into global coordinates.
    pub fn roi_center_global(&self) -> Result<Vector3<f64>> {
        let c = self
            .lock()
            .roi_center_camera()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("read ROI center")?;
        let tree = match self.tree.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(tree.map_to_global(self.camera, c))
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Scope>> {
        match self.dev.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Boxed device set for one pipette.
pub struct RigDevices {
    pub clamp: Box<dyn ClampAmplifier>,
    pub pressure: Box<dyn PressureRegulator>,
    pub stage: Box<dyn Stage>,
    pub scope: Box<dyn Scope>,
}

pub struct Rig {
    pub pressure: Arc<PressureFacade>,
    pub clamp: Arc<ClampFacade>,
    pub stage: Arc<StageFacade>,
    pub scope: Arc<ScopeFacade>,
    pub planner: MotionPlanner,
    clock: Arc<dyn Clock + Send + Sync>,
    pitch: f64,
    yaw: f64,
    target: Mutex<Option<Vector3<f64>>>,
}

impl Rig {
    pub fn new(
        devices: RigDevices,
        config: &RigConfig,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let settings = PressureSettings {
            limit: config.pressure_limit(),
            settle: std::time::Duration::from_millis(config.pressure.settle_ms),
        };
        Self {
            pressure: Arc::new(PressureFacade::new(devices.pressure, settings, clock.clone())),
            clamp: Arc::new(ClampFacade::new(devices.clamp)),
            stage: Arc::new(StageFacade::new(devices.stage, clock.clone())),
            scope: Arc::new(ScopeFacade::new(
                devices.scope,
                config.optics.scope_offset,
                config.optics.camera_offset,
            )),
            planner: MotionPlanner::new(config.geometry.clone()),
            clock,
            pitch: config.geometry.pitch,
            yaw: config.geometry.yaw,
            target: Mutex::new(None),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock + Send + Sync> {
        self.clock.clone()
    }

    pub fn set_target(&self, target: Option<Vector3<f64>>) {
        if let Ok(mut g) = self.target.lock() {
            *g = target;
        }
    }

    pub fn target(&self) -> Option<Vector3<f64>> {
        self.target.lock().ok().and_then(|g| *g)
    }

    pub fn pose(&self) -> Result<PipettePose> {
        Ok(PipettePose {
            position: self.stage.position()?,
            yaw: self.yaw,
            pitch: self.pitch,
        })
    }

    pub fn scene(&self) -> Result<Scene> {
        Ok(Scene {
            pose: self.pose()?,
            surface_z: self.scope.surface_depth()?,
            target: self.target(),
        })
    }

    /// Plan and start the move to a named destination, returning its
    /// handle. The search destination also drives the focus to the search
    /// plane before reading the camera ROI.
    pub fn goto(&self, destination: Destination) -> Result<OpHandle> {
        let scene = self.scene()?;
        let path = match destination {
            Destination::Home => self.planner.home(&scene),
            Destination::Search => {
                self.scope
                    .set_focus_depth(self.planner.search_focus_z(&scene))?;
                let roi = self.scope.roi_center_global()?;
                self.planner.search(&scene, roi)
            }
            Destination::Approach => self.planner.approach(&scene)?,
            Destination::Target => self.planner.target(&scene)?,
            Destination::AboveTarget => self.planner.above_target(&scene)?,
            Destination::Idle => self.planner.idle(&scene),
        };
        tracing::info!(?destination, legs = path.len(), "pipette move");
        self.stage.move_path(&path)
    }

    /// Best-effort: stop motion and vent to atmosphere. Used when a state
    /// is interrupted; failures are logged, not propagated.
    pub fn halt_and_vent(&self) {
        self.stage.halt();
        if let Err(e) = self.pressure.set(PressureSource::Atmosphere, 0.0) {
            tracing::warn!(error = %e, "pressure vent failed");
        }
    }

    /// Best-effort safe configuration: atmospheric pressure, VC at 0 V, no
    /// motion in progress. Used on error exits.
    pub fn safe_rest(&self) {
        self.halt_and_vent();
        if let Err(e) = self
            .clamp
            .set_mode(ClampMode::Vc)
            .and_then(|()| self.clamp.set_holding(ClampMode::Vc, 0.0))
        {
            tracing::warn!(error = %e, "safe rest: clamp reset failed");
        }
    }
}
