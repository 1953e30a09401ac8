//! State base: initial actuator pushes, worker launch, status mapping,
//! cleanup on every exit path.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use autopatch_traits::{ClampMode, PressureSource, TestPulse, TestPulseParams};

use crate::error::{PatchError, Report, Result, err, patch_error};
use crate::record::PatchRecord;
use crate::rig::Rig;
use crate::stream::{MeasurementHub, PulseQueue};
use crate::task::{OpHandle, TaskContext, TaskCtl, TaskStatus};

/// Measurement-loop cadence: states drain with this timeout and re-check
/// stop requests when no pulse arrived.
pub const CYCLE: Duration = Duration::from_millis(200);

/// Initial actuator setpoints and policies applied before `run` starts.
#[derive(Debug, Clone, Default)]
pub struct StateSetup {
    /// Close the previous patch record before anything else.
    pub finish_record: bool,
    /// Open a fresh patch record (a new attempt).
    pub new_record: bool,
    pub pressure: Option<(PressureSource, f64)>,
    pub clamp_mode: Option<ClampMode>,
    pub holding: Option<(ClampMode, f64)>,
    pub test_pulse: Option<bool>,
    pub test_pulse_params: Option<TestPulseParams>,
    pub auto_bias: Option<bool>,
    pub auto_bias_target: Option<f64>,
    /// Hold the DAQ reservation for the duration of `run`.
    pub reserve_daq: bool,
    /// Where the manager goes when `run` times out or errors.
    pub fallback_state: Option<String>,
}

/// What a state's worker hands to its body.
pub struct StateContext {
    pub rig: Arc<Rig>,
    pub pulses: PulseQueue,
    pub task: TaskContext,
    pub record: PatchRecord,
}

impl StateContext {
    /// One measurement cycle: wait up to the cycle interval for pulses,
    /// keep only the newest, and acknowledge any pending stop request.
    pub fn cycle(&self) -> Result<Option<TestPulse>> {
        let pulse = self.pulses.latest(CYCLE);
        self.task.check_stop(Duration::ZERO)?;
        Ok(pulse)
    }

    /// Gather `n` pulses (waiting up to `timeout` seconds total) and return
    /// their median resistance.
    pub fn median_resistance(&self, n: usize, timeout: f64) -> Result<f64> {
        let mut samples = Vec::with_capacity(n);
        let deadline = self.task.elapsed() + timeout;
        while samples.len() < n {
            if let Some(p) = self.cycle()? {
                samples.push(p.analysis.steady_state_resistance);
            } else if self.task.elapsed() > deadline {
                return err(PatchError::Timeout(format!(
                    "collected {}/{n} pulses for the baseline",
                    samples.len()
                )));
            }
        }
        crate::util::median(&samples)
            .ok_or_else(|| Report::new(PatchError::Invariant("empty baseline".into())))
    }

    pub fn wait_for(&self, op: &OpHandle, timeout: Option<Duration>) -> Result<()> {
        self.task.wait_for(op, timeout)
    }
}

/// A pipette state: a named policy with declared initial setpoints and a
/// long-running body that decides the next state.
pub trait PatchState: Send + 'static {
    fn name(&self) -> &'static str;
    fn setup(&self) -> StateSetup;
    /// The state body. Runs on a worker thread; returns the next state name
    /// (or `None` to rest). Raise `StopRequested`/`Timeout` through the
    /// context helpers rather than catching them.
    fn run(&mut self, cx: &mut StateContext) -> Result<Option<String>>;
}

/// Terminal report of one state's execution.
#[derive(Debug, Clone)]
pub struct StateOutcome {
    pub state: &'static str,
    pub status: TaskStatus,
    pub next: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
}

/// Handle to a launched state.
pub(crate) struct StateHandle {
    pub name: &'static str,
    pub fallback: Option<String>,
    ctl: Arc<TaskCtl>,
    join: Option<JoinHandle<StateOutcome>>,
    /// Outcome for states that never spawned (inactive pipette).
    stillborn: Option<StateOutcome>,
}

impl StateHandle {
    pub fn stop(&self) {
        self.ctl.request_stop();
    }

    pub fn status(&self) -> TaskStatus {
        self.ctl.status()
    }

    /// Wait up to `timeout` for the state to end; joins the worker and
    /// returns its outcome, or `None` if it is still running.
    pub fn wait_outcome(&mut self, timeout: Duration) -> Option<StateOutcome> {
        if let Some(outcome) = self.stillborn.take() {
            return Some(outcome);
        }
        if !self.ctl.wait_terminal(timeout).is_terminal() {
            return None;
        }
        let handle = self.join.take()?;
        match handle.join() {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(state = self.name, ?e, "state worker panicked");
                Some(StateOutcome {
                    state: self.name,
                    status: TaskStatus::Errored,
                    next: None,
                    error: Some("state worker panicked".into()),
                    timed_out: false,
                })
            }
        }
    }
}

/// Shared environment a manager launches states into.
#[derive(Clone)]
pub(crate) struct LaunchEnv {
    pub rig: Arc<Rig>,
    pub hub: MeasurementHub,
    pub record: PatchRecord,
    pub active: Arc<AtomicBool>,
    pub daq: Arc<std::sync::Mutex<()>>,
    /// Shared timebase origin for record timestamps.
    pub epoch: Instant,
}

/// How long a state waits for the DAQ reservation before giving up.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize and launch a state:
///
/// 1. finish/start the patch record as configured;
/// 2. push the initial pressure;
/// 3. push clamp mode, holding, test pulse enable + parameters, auto bias;
/// 4. subscribe to the measurement stream;
/// 5. launch `run` on a worker thread (skipped, and the task marked
///    interrupted, when the pipette is inactive).
///
/// Configuration and device failures here propagate to the caller; the
/// state body never starts.
pub(crate) fn launch(mut state: Box<dyn PatchState>, env: &LaunchEnv) -> Result<StateHandle> {
    let name = state.name();
    let setup = state.setup();
    let clock = env.rig.clock();

    if setup.finish_record {
        env.record.finish();
    }
    if setup.new_record {
        env.record.begin(clock.secs_since(env.epoch));
    }
    if let Some((source, pressure)) = setup.pressure {
        env.rig.pressure.set(source, pressure)?;
    }
    if let Some(mode) = setup.clamp_mode {
        env.rig.clamp.set_mode(mode)?;
    }
    if let Some((mode, value)) = setup.holding {
        env.rig.clamp.set_holding(mode, value)?;
    }
    if let Some(params) = setup.test_pulse_params {
        env.rig.clamp.set_test_pulse_params(params)?;
    }
    if let Some(enabled) = setup.test_pulse {
        env.rig.clamp.enable_test_pulse(enabled)?;
    }
    if let Some(enabled) = setup.auto_bias {
        env.rig.clamp.enable_auto_bias(enabled)?;
    }
    if let Some(target) = setup.auto_bias_target {
        env.rig.clamp.set_auto_bias_target(target)?;
    }

    let pulses = env.hub.subscribe();

    let ctl = Arc::new(TaskCtl::new());
    if !env.active.load(std::sync::atomic::Ordering::Relaxed) {
        ctl.set_status(TaskStatus::Interrupted);
        tracing::info!(state = name, "pipette inactive, state not started");
        return Ok(StateHandle {
            name,
            fallback: setup.fallback_state,
            ctl,
            join: None,
            stillborn: Some(StateOutcome {
                state: name,
                status: TaskStatus::Interrupted,
                next: None,
                error: None,
                timed_out: false,
            }),
        });
    }

    let task = TaskContext::new(ctl.clone(), env.active.clone(), clock);
    let mut cx = StateContext {
        rig: env.rig.clone(),
        pulses,
        task,
        record: env.record.clone(),
    };
    let worker_ctl = ctl.clone();
    let reserve = setup.reserve_daq;
    let daq = env.daq.clone();
    let rig = env.rig.clone();
    let join = std::thread::spawn(move || {
        worker_ctl.set_status(TaskStatus::Running);
        tracing::info!(state = name, "state running");

        let _daq_guard = if reserve {
            match acquire_daq(&daq, &cx) {
                Ok(guard) => Some(guard),
                Err(report) => {
                    drop(cx); // unsubscribe before reporting
                    return conclude(name, Err(report), &worker_ctl, &rig);
                }
            }
        } else {
            None
        };

        let result = state.run(&mut cx);
        drop(cx); // unsubscribe from measurements on every exit path
        conclude(name, result, &worker_ctl, &rig)
    });

    Ok(StateHandle {
        name,
        fallback: setup.fallback_state,
        ctl,
        join: Some(join),
        stillborn: None,
    })
}

fn acquire_daq<'a>(
    daq: &'a std::sync::Mutex<()>,
    cx: &StateContext,
) -> Result<std::sync::MutexGuard<'a, ()>> {
    let deadline = Instant::now() + RESERVE_TIMEOUT;
    loop {
        if let Ok(guard) = daq.try_lock() {
            return Ok(guard);
        }
        cx.task.check_stop(Duration::from_millis(20))?;
        if Instant::now() >= deadline {
            return err(PatchError::Timeout("DAQ reservation".into()));
        }
    }
}

/// Map the body's result to a terminal status, restore a safe configuration
/// on unexpected errors, and publish the outcome.
fn conclude(
    name: &'static str,
    result: Result<Option<String>>,
    ctl: &Arc<TaskCtl>,
    rig: &Arc<Rig>,
) -> StateOutcome {
    let (status, next, error, timed_out) = match result {
        Ok(next) => (TaskStatus::Done, next, None, false),
        Err(report) => match patch_error(&report) {
            Some(PatchError::StopRequested) => (TaskStatus::Interrupted, None, None, false),
            Some(PatchError::Timeout(_)) => (
                TaskStatus::Interrupted,
                None,
                Some(report.to_string()),
                true,
            ),
            _ => (TaskStatus::Errored, None, Some(report.to_string()), false),
        },
    };
    // Any exit other than a normal completion leaves the pipette safe: an
    // interruption halts motion and vents; an error additionally resets the
    // clamp to VC at 0 V.
    match status {
        TaskStatus::Errored => rig.safe_rest(),
        TaskStatus::Interrupted => rig.halt_and_vent(),
        _ => {}
    }
    if let Some(msg) = &error {
        ctl.set_error(msg.clone());
    }
    if timed_out {
        ctl.mark_timed_out();
    }
    tracing::info!(state = name, status = %status, next = ?next, "state finished");
    ctl.set_status(status);
    StateOutcome {
        state: name,
        status,
        next,
        error,
        timed_out,
    }
}
