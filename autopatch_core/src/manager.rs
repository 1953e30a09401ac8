//! State manager: one current-state slot per pipette, ordered transitions,
//! abort on deactivation, chained transitions through `next_state`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel as xch;

use crate::error::{PatchError, Result, err};
use crate::record::PatchRecord;
use crate::rig::Rig;
use crate::state::{LaunchEnv, PatchState, StateHandle, StateOutcome, launch};
use crate::stream::MeasurementHub;
use crate::task::TaskStatus;

/// Observable state-change notification.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state: String,
    pub status: TaskStatus,
    pub next: Option<String>,
    pub error: Option<String>,
}

type StateFactory = Box<dyn Fn(Option<&toml::Value>) -> Result<Box<dyn PatchState>> + Send>;

/// How long a transition waits for the outgoing state's cleanup. Cleanup is
/// cooperative and normally takes one measurement cycle; exceeding this is
/// a stuck worker.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PatchManager {
    registry: BTreeMap<&'static str, StateFactory>,
    overrides: BTreeMap<String, toml::Value>,
    env: LaunchEnv,
    current: Option<StateHandle>,
    event_tx: xch::Sender<StateEvent>,
    event_rx: xch::Receiver<StateEvent>,
}

impl PatchManager {
    pub fn new(rig: Arc<Rig>, hub: MeasurementHub) -> Self {
        let (event_tx, event_rx) = xch::unbounded();
        let clock = rig.clock();
        Self {
            registry: BTreeMap::new(),
            overrides: BTreeMap::new(),
            env: LaunchEnv {
                rig,
                hub,
                record: PatchRecord::new(),
                active: Arc::new(AtomicBool::new(true)),
                daq: Arc::new(std::sync::Mutex::new(())),
                epoch: clock.now(),
            },
            current: None,
            event_tx,
            event_rx,
        }
    }

    /// Register a state constructor under its name.
    pub fn register<F>(&mut self, name: &'static str, factory: F)
    where
        F: Fn(Option<&toml::Value>) -> Result<Box<dyn PatchState>> + Send + 'static,
    {
        self.registry.insert(name, Box::new(factory));
    }

    /// Install per-state config override tables (from the rig TOML).
    pub fn set_overrides(&mut self, overrides: BTreeMap<String, toml::Value>) {
        self.overrides = overrides;
    }

    pub fn record(&self) -> PatchRecord {
        self.env.record.clone()
    }

    /// Event stream; clones observe the same channel.
    pub fn events(&self) -> xch::Receiver<StateEvent> {
        self.event_rx.clone()
    }

    pub fn current_state(&self) -> Option<&'static str> {
        self.current.as_ref().map(|h| h.name)
    }

    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|h| !h.status().is_terminal())
    }

    /// Mark the pipette inactive: the running state observes the flag at
    /// its next suspension point (within one measurement cycle) and ends
    /// interrupted. New states will not start while inactive.
    pub fn deactivate(&mut self) {
        self.env.active.store(false, Ordering::Relaxed);
        self.abort();
    }

    pub fn activate(&mut self) {
        self.env.active.store(true, Ordering::Relaxed);
    }

    /// Stop the current state (if any) and wait for its cleanup. No
    /// replacement state is started.
    pub fn abort(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.stop();
            match handle.wait_outcome(CLEANUP_TIMEOUT) {
                Some(outcome) => self.emit(&outcome),
                None => {
                    tracing::error!(state = handle.name, "state did not stop in time");
                }
            }
        }
    }

    /// Stop the current state, wait for its cleanup, then construct and
    /// initialize the named state. The old state's cleanup happens-before
    /// the new state's initialize.
    pub fn transition_to(&mut self, name: &str) -> Result<()> {
        if let Some(mut handle) = self.current.take() {
            handle.stop();
            match handle.wait_outcome(CLEANUP_TIMEOUT) {
                Some(outcome) => self.emit(&outcome),
                None => {
                    self.current = Some(handle);
                    return err(PatchError::Invariant(
                        "previous state did not finish cleanup".into(),
                    ));
                }
            }
        }
        self.start(name)
    }

    fn start(&mut self, name: &str) -> Result<()> {
        let factory = self.registry.get(name).ok_or_else(|| {
            eyre::Report::new(PatchError::Config(format!("unknown state `{name}`")))
        })?;
        let state = factory(self.overrides.get(name))?;
        tracing::info!(state = name, "transition");
        let handle = launch(state, &self.env)?;
        let _ = self.event_tx.send(StateEvent {
            state: handle.name.to_string(),
            status: handle.status(),
            next: None,
            error: None,
        });
        self.current = Some(handle);
        Ok(())
    }

    /// Wait up to `timeout` for the current state to finish. When it does,
    /// emit its outcome and follow the chain: `next_state` on success, the
    /// state's fallback on timeout or error. Returns the outcome seen, if
    /// any.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<StateOutcome>> {
        let Some(handle) = self.current.as_mut() else {
            return Ok(None);
        };
        let Some(outcome) = handle.wait_outcome(timeout) else {
            return Ok(None);
        };
        let fallback = self.current.take().map(|h| h.fallback).unwrap_or(None);
        self.emit(&outcome);
        let next = match outcome.status {
            TaskStatus::Done => outcome.next.clone(),
            TaskStatus::Errored => fallback,
            TaskStatus::Interrupted if outcome.timed_out => fallback,
            _ => None,
        };
        if let Some(next) = next {
            self.start(&next)?;
        }
        Ok(Some(outcome))
    }

    /// Drive chained transitions until the machine goes idle or `deadline`
    /// passes. Returns the outcomes in order.
    pub fn run_until_idle(&mut self, deadline: Duration) -> Result<Vec<StateOutcome>> {
        let end = Instant::now() + deadline;
        let mut outcomes = Vec::new();
        while self.current.is_some() {
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            if let Some(outcome) = self.poll(left.min(Duration::from_millis(100)))? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    fn emit(&self, outcome: &StateOutcome) {
        let _ = self.event_tx.send(StateEvent {
            state: outcome.state.to_string(),
            status: outcome.status,
            next: outcome.next.clone(),
            error: outcome.error.clone(),
        });
    }
}

impl Drop for PatchManager {
    fn drop(&mut self) {
        // A worker thread must not outlive the machine that launched it.
        self.abort();
    }
}
