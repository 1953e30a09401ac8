//! Simulated patch rig.
//!
//! One shared membrane/bath model behind four device fronts (`SimClamp`,
//! `SimPressure`, `SimStage`, `SimScope`) so the whole engine can be
//! exercised end-to-end without hardware. The model is deliberately coarse:
//! resistance responds to immersion, cell proximity, suction and break-in
//! pulses the way a detector needs it to, not the way a membrane biophysics
//! text would.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use autopatch_traits::{
    ClampAmplifier, ClampMode, DevResult, PressureRegulator, PressureSource, PulseSource, Scope,
    Stage, TestPulse, TestPulseAnalysis, TestPulseParams,
};

use crate::error::HwError;

/// Tunable parameters of the simulated preparation.
#[derive(Debug, Clone)]
pub struct SimModel {
    /// Sample surface depth (global z, meters).
    pub surface_z: f64,
    /// Bath liquid level; tips above this read dry.
    pub bath_level_z: f64,
    /// Open-tip resistance in the bath.
    pub bath_resistance: f64,
    /// Out-of-bath resistance.
    pub dry_resistance: f64,
    /// Cell soma position, global meters.
    pub cell_position: [f64; 3],
    /// Distance at which the tip begins to sense the cell.
    pub sense_radius: f64,
    /// Distance at which the tip is considered in contact.
    pub contact_radius: f64,
    /// Resistance added at full contact (ramps in over the sense radius).
    pub proximity_bump: f64,
    /// Seal growth time constant under suction, seconds.
    pub seal_tau: f64,
    /// Asymptotic seal resistance.
    pub max_seal_resistance: f64,
    /// Suction stronger than this ruptures a formed gigaseal.
    pub break_in_pressure: f64,
    /// Positive pressure stronger than this clears the tip.
    pub blowout_pressure: f64,
    /// Whole-cell access resistance after break-in.
    pub access_resistance: f64,
    /// Pipette stray capacitance.
    pub pipette_capacitance: f64,
    /// Apparent capacitance after break-in.
    pub cell_capacitance: f64,
    /// Stage travel limits (min, max).
    pub limits: ([f64; 3], [f64; 3]),
}

impl Default for SimModel {
    fn default() -> Self {
        Self {
            surface_z: 0.0,
            bath_level_z: 1e-3,
            bath_resistance: 5e6,
            dry_resistance: 2e9,
            cell_position: [50e-6, 0.0, -20e-6],
            sense_radius: 15e-6,
            contact_radius: 2e-6,
            proximity_bump: 2e6,
            seal_tau: 1.0,
            max_seal_resistance: 3e9,
            break_in_pressure: -20e3,
            blowout_pressure: 30e3,
            access_resistance: 150e6,
            pipette_capacitance: 3e-12,
            cell_capacitance: 33e-12,
            limits: ([-25e-3, -30e-3, -10e-3], [25e-3, 30e-3, 10e-3]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: [f64; 3],
    to: [f64; 3],
    speed: f64,
    started: Instant,
}

impl Motion {
    fn duration(&self) -> f64 {
        (dist(self.from, self.to) / self.speed.max(1e-12)).max(0.0)
    }

    fn at(&self, now: Instant) -> ([f64; 3], bool) {
        let t = now.saturating_duration_since(self.started).as_secs_f64();
        let dur = self.duration();
        if t >= dur {
            (self.to, false)
        } else {
            let f = t / dur;
            let p = [
                self.from[0] + (self.to[0] - self.from[0]) * f,
                self.from[1] + (self.to[1] - self.from[1]) * f,
                self.from[2] + (self.to[2] - self.from[2]) * f,
            ];
            (p, true)
        }
    }
}

struct SimState {
    model: SimModel,
    // pressure
    source: PressureSource,
    setpoint: f64,
    // clamp
    mode: ClampMode,
    holding: [f64; 3],
    test_pulse_on: bool,
    params: TestPulseParams,
    auto_bias: bool,
    auto_bias_target: f64,
    // stage
    position: [f64; 3],
    motion: Option<Motion>,
    // scope
    focus_z: f64,
    // membrane
    seal_resistance: f64,
    whole_cell: bool,
    last_step: Instant,
    next_pulse: Option<Instant>,
}

impl SimState {
    fn tip_position(&mut self, now: Instant) -> [f64; 3] {
        if let Some(m) = self.motion {
            let (p, moving) = m.at(now);
            self.position = p;
            if !moving {
                self.motion = None;
            }
        }
        self.position
    }

    fn applied_pressure(&self) -> f64 {
        match self.source {
            PressureSource::Regulator => self.setpoint,
            PressureSource::Atmosphere | PressureSource::User => 0.0,
        }
    }

    /// Advance the membrane model by the wall time since the last step.
    fn step(&mut self, now: Instant) {
        let dt = now
            .saturating_duration_since(self.last_step)
            .as_secs_f64()
            .min(1.0);
        self.last_step = now;
        let pos = self.tip_position(now);
        let p = self.applied_pressure();
        let d = dist(pos, self.model.cell_position);

        if p >= self.model.blowout_pressure {
            // Tip cleared: any seal or ruptured patch is blown off.
            self.seal_resistance = 0.0;
            self.whole_cell = false;
            return;
        }

        let in_contact = d <= self.model.contact_radius;
        if self.whole_cell {
            return;
        }
        if in_contact && p < -100.0 {
            // Suction at contact grows the seal toward its asymptote.
            let target = self.model.max_seal_resistance;
            let alpha = 1.0 - (-dt / self.model.seal_tau.max(1e-6)).exp();
            self.seal_resistance += (target - self.seal_resistance) * alpha;
        }
        if self.seal_resistance >= 1e9 && p <= self.model.break_in_pressure {
            self.whole_cell = true;
        }
    }

    fn resistance(&mut self, now: Instant) -> f64 {
        let pos = self.tip_position(now);
        if pos[2] > self.model.bath_level_z {
            return self.model.dry_resistance;
        }
        if self.whole_cell {
            return self.model.access_resistance;
        }
        if self.seal_resistance > self.model.bath_resistance {
            return self.seal_resistance;
        }
        let d = dist(pos, self.model.cell_position);
        let mut r = self.model.bath_resistance;
        if d < self.model.sense_radius {
            let f = 1.0 - (d / self.model.sense_radius);
            r += self.model.proximity_bump * f;
        }
        r
    }

    fn capacitance(&self) -> f64 {
        if self.whole_cell {
            self.model.cell_capacitance
        } else {
            self.model.pipette_capacitance
        }
    }

    fn baseline_current(&self) -> f64 {
        if self.whole_cell { -30e-12 } else { 0.0 }
    }
}

/// Handle to one simulated rig. Clones of the device fronts share the model.
pub struct SimRig {
    state: Arc<Mutex<SimState>>,
    epoch: Instant,
}

impl SimRig {
    pub fn new(model: SimModel) -> Self {
        let now = Instant::now();
        let focus = model.surface_z;
        let state = SimState {
            model,
            source: PressureSource::Atmosphere,
            setpoint: 0.0,
            mode: ClampMode::Vc,
            holding: [0.0; 3],
            test_pulse_on: false,
            params: TestPulseParams::default(),
            auto_bias: false,
            auto_bias_target: 0.0,
            position: [0.0, 0.0, 2e-3],
            motion: None,
            focus_z: focus,
            seal_resistance: 0.0,
            whole_cell: false,
            last_step: now,
            next_pulse: None,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            epoch: now,
        }
    }

    pub fn clamp(&self) -> SimClamp {
        SimClamp {
            state: self.state.clone(),
        }
    }

    /// The measurement side of the amplifier; hand this to the pulse pump.
    pub fn pulse_source(&self) -> SimPulses {
        SimPulses {
            state: self.state.clone(),
            epoch: self.epoch,
        }
    }

    pub fn pressure(&self) -> SimPressure {
        SimPressure {
            state: self.state.clone(),
        }
    }

    pub fn stage(&self) -> SimStage {
        SimStage {
            state: self.state.clone(),
        }
    }

    pub fn scope(&self) -> SimScope {
        SimScope {
            state: self.state.clone(),
        }
    }

    /// Teleport the tip (testing convenience; clears any motion in flight).
    pub fn place_tip(&self, position: [f64; 3]) {
        let mut s = self.lock();
        s.motion = None;
        s.position = position;
    }

    pub fn whole_cell(&self) -> bool {
        self.lock().whole_cell
    }

    pub fn seal_resistance(&self) -> f64 {
        self.lock().seal_resistance
    }

    /// Force a formed gigaseal (testing convenience).
    pub fn force_seal(&self, resistance: f64) {
        self.lock().seal_resistance = resistance;
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new(SimModel::default())
    }
}

fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

fn lock(state: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    match state.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct SimClamp {
    state: Arc<Mutex<SimState>>,
}

impl ClampAmplifier for SimClamp {
    fn set_mode(&mut self, mode: ClampMode) -> DevResult<()> {
        lock(&self.state).mode = mode;
        Ok(())
    }

    fn set_holding(&mut self, mode: ClampMode, value: f64) -> DevResult<()> {
        lock(&self.state).holding[mode.index()] = value;
        Ok(())
    }

    fn enable_test_pulse(&mut self, enabled: bool) -> DevResult<()> {
        let mut s = lock(&self.state);
        s.test_pulse_on = enabled;
        if !enabled {
            s.next_pulse = None;
        }
        Ok(())
    }

    fn set_test_pulse_params(&mut self, params: TestPulseParams) -> DevResult<()> {
        lock(&self.state).params = params;
        Ok(())
    }

    fn enable_auto_bias(&mut self, enabled: bool) -> DevResult<()> {
        lock(&self.state).auto_bias = enabled;
        Ok(())
    }

    fn set_auto_bias_target(&mut self, volts: f64) -> DevResult<()> {
        lock(&self.state).auto_bias_target = volts;
        Ok(())
    }

    fn auto_pipette_offset(&mut self) -> DevResult<()> {
        Ok(())
    }

    fn auto_cap_comp(&mut self) -> DevResult<()> {
        Ok(())
    }
}

/// Measurement side of the simulated amplifier.
pub struct SimPulses {
    state: Arc<Mutex<SimState>>,
    epoch: Instant,
}

impl PulseSource for SimPulses {
    fn read_pulse(&mut self, timeout: Duration) -> DevResult<Option<TestPulse>> {
        let wait = {
            let mut s = lock(&self.state);
            if !s.test_pulse_on {
                drop(s);
                std::thread::sleep(timeout);
                return Ok(None);
            }
            let now = Instant::now();
            let due = *s.next_pulse.get_or_insert(now);
            due.saturating_duration_since(now)
        };
        if wait > timeout {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        std::thread::sleep(wait);

        let mut s = lock(&self.state);
        let now = Instant::now();
        s.step(now);
        let analysis = TestPulseAnalysis {
            steady_state_resistance: s.resistance(now),
            capacitance: s.capacitance(),
            baseline_current: s.baseline_current(),
        };
        let interval = Duration::from_secs_f64(s.params.interval.max(1e-3));
        s.next_pulse = Some(now + interval);
        Ok(Some(TestPulse {
            start_time: now.saturating_duration_since(self.epoch).as_secs_f64(),
            analysis,
        }))
    }
}

pub struct SimPressure {
    state: Arc<Mutex<SimState>>,
}

impl PressureRegulator for SimPressure {
    fn select_source(&mut self, source: PressureSource) -> DevResult<()> {
        let mut s = lock(&self.state);
        let now = Instant::now();
        s.step(now);
        s.source = source;
        Ok(())
    }

    fn set_setpoint(&mut self, pascals: f64) -> DevResult<()> {
        let mut s = lock(&self.state);
        let now = Instant::now();
        s.step(now);
        s.setpoint = pascals;
        Ok(())
    }
}

pub struct SimStage {
    state: Arc<Mutex<SimState>>,
}

impl Stage for SimStage {
    fn position(&mut self) -> DevResult<[f64; 3]> {
        Ok(lock(&self.state).tip_position(Instant::now()))
    }

    fn limits(&mut self) -> DevResult<([f64; 3], [f64; 3])> {
        Ok(lock(&self.state).model.limits)
    }

    fn start_move(&mut self, target: [f64; 3], speed: f64, _linear: bool) -> DevResult<()> {
        let mut s = lock(&self.state);
        let (lo, hi) = s.model.limits;
        for axis in 0..3 {
            if target[axis] < lo[axis] || target[axis] > hi[axis] {
                return Err(Box::new(HwError::Travel(format!(
                    "axis {axis}: {} outside [{}, {}]",
                    target[axis], lo[axis], hi[axis]
                ))));
            }
        }
        let now = Instant::now();
        let from = s.tip_position(now);
        s.motion = Some(Motion {
            from,
            to: target,
            speed,
            started: now,
        });
        Ok(())
    }

    fn is_moving(&mut self) -> DevResult<bool> {
        let mut s = lock(&self.state);
        s.tip_position(Instant::now());
        Ok(s.motion.is_some())
    }

    fn halt(&mut self) -> DevResult<()> {
        let mut s = lock(&self.state);
        s.tip_position(Instant::now());
        s.motion = None;
        Ok(())
    }
}

pub struct SimScope {
    state: Arc<Mutex<SimState>>,
}

impl Scope for SimScope {
    fn surface_depth(&mut self) -> DevResult<f64> {
        Ok(lock(&self.state).model.surface_z)
    }

    fn set_focus_depth(&mut self, z: f64) -> DevResult<()> {
        lock(&self.state).focus_z = z;
        Ok(())
    }

    fn roi_center_camera(&mut self) -> DevResult<[f64; 3]> {
        // The sim camera frame coincides with global, so the ROI center is
        // simply the cell position.
        Ok(lock(&self.state).model.cell_position)
    }
}
