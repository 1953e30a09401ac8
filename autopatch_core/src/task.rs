//! Cancellable long-running operations.
//!
//! Every operation that outlives a single device call (a state body, a
//! stage move, a pressure ramp) runs on its own thread behind an
//! [`OpHandle`] and follows the same cooperative protocol: the body calls
//! `checkpoint`/`sleep` frequently (at least every ~200 ms), a stop request
//! is acknowledged at the next such suspension point, and the final status
//! records how the operation ended. There is no pre-emption and no
//! cross-thread exception injection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use autopatch_traits::Clock;

use crate::error::{PatchError, Report, Result, err, patch_error};

/// Granularity of stop-flag polling inside cooperative sleeps.
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    /// Completed normally (including a graceful finish request).
    Done,
    /// Ended on a stop request or timeout; not an error.
    Interrupted,
    /// Ended on an unexpected error; message recorded.
    Errored,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Interrupted | TaskStatus::Errored
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

/// Shared control block between a worker thread and its handle(s).
#[derive(Debug)]
pub(crate) struct TaskCtl {
    status: Mutex<TaskStatus>,
    cv: Condvar,
    stop: AtomicBool,
    /// Graceful completion requested (stop-when predicate matched): the
    /// worker unwinds via the stop path but the final status is `Done`.
    finish: AtomicBool,
    timed_out: AtomicBool,
    error: Mutex<Option<String>>,
}

impl TaskCtl {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Pending),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            finish: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn request_finish(&self) {
        self.finish.store(true, Ordering::Relaxed);
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn finish_requested(&self) -> bool {
        self.finish.load(Ordering::Relaxed)
    }

    pub(crate) fn status(&self) -> TaskStatus {
        *self.lock_status()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        *self.lock_status() = status;
        self.cv.notify_all();
    }

    pub(crate) fn set_error(&self, msg: String) {
        if let Ok(mut g) = self.error.lock() {
            *g = Some(msg);
        }
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Block up to `timeout` for a terminal status; returns the status seen
    /// last either way.
    pub(crate) fn wait_terminal(&self, timeout: Duration) -> TaskStatus {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock_status();
        while !g.is_terminal() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return *g;
            }
            let (ng, _) = match self.cv.wait_timeout(g, left) {
                Ok(v) => v,
                Err(poisoned) => poisoned.into_inner(),
            };
            g = ng;
        }
        *g
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, TaskStatus> {
        match self.status.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cooperative cancellation token handed to worker bodies.
///
/// `checkpoint` raises `PatchError::StopRequested` when a stop was requested
/// or the owning pipette was deactivated; `sleep` does the same while
/// sleeping in short slices so stops are acknowledged within ~20 ms.
pub struct StopToken {
    pub(crate) ctl: Arc<TaskCtl>,
    pub(crate) active: Option<Arc<AtomicBool>>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
}

impl StopToken {
    pub fn stop_requested(&self) -> bool {
        if self.ctl.stop_requested() {
            return true;
        }
        match &self.active {
            Some(a) => !a.load(Ordering::Relaxed),
            None => false,
        }
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.stop_requested() {
            err(PatchError::StopRequested)
        } else {
            Ok(())
        }
    }

    /// Sleep up to `d`, waking early to acknowledge a stop request.
    pub fn sleep(&self, d: Duration) -> Result<()> {
        let mut left = d;
        loop {
            self.checkpoint()?;
            if left.is_zero() {
                return Ok(());
            }
            let slice = left.min(STOP_POLL);
            self.clock.sleep(slice);
            left = left.saturating_sub(slice);
        }
    }
}

/// Handle to a running operation: observe status, request a stop or a
/// graceful finish, and block for completion.
///
/// Dropping the handle stops the worker and joins it, so operation threads
/// never outlive their owners.
pub struct OpHandle {
    label: &'static str,
    ctl: Arc<TaskCtl>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl OpHandle {
    /// Spawn a worker thread running `body` with a fresh control block.
    pub fn spawn<F>(label: &'static str, clock: Arc<dyn Clock + Send + Sync>, body: F) -> Self
    where
        F: FnOnce(&StopToken) -> Result<()> + Send + 'static,
    {
        let ctl = Arc::new(TaskCtl::new());
        ctl.set_status(TaskStatus::Running);
        let token = StopToken {
            ctl: ctl.clone(),
            active: None,
            clock,
        };
        let thread_ctl = ctl.clone();
        let join = std::thread::spawn(move || {
            let outcome = body(&token);
            finish_worker(&thread_ctl, label, outcome);
        });
        Self {
            label,
            ctl,
            join: Mutex::new(Some(join)),
        }
    }

    /// An already-completed handle (zero-length moves and the like).
    pub fn ready(label: &'static str) -> Self {
        let ctl = Arc::new(TaskCtl::new());
        ctl.set_status(TaskStatus::Done);
        Self {
            label,
            ctl,
            join: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn status(&self) -> TaskStatus {
        self.ctl.status()
    }

    pub fn error(&self) -> Option<String> {
        self.ctl.error()
    }

    pub fn timed_out(&self) -> bool {
        self.ctl.timed_out()
    }

    /// Request cancellation; the worker acknowledges at its next suspension
    /// point and ends `Interrupted`.
    pub fn stop(&self) {
        self.ctl.request_stop();
    }

    /// Request graceful completion; the worker unwinds like a stop but ends
    /// `Done`.
    pub fn finish(&self) {
        self.ctl.request_finish();
    }

    pub(crate) fn ctl(&self) -> Arc<TaskCtl> {
        self.ctl.clone()
    }

    /// Block until the operation reaches a terminal status or `timeout`
    /// elapses, then map the outcome: `Done` is `Ok`, interruption and
    /// errors surface as their typed conditions.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let status = self.ctl.wait_terminal(timeout);
        if !status.is_terminal() {
            self.stop();
            self.ctl.wait_terminal(Duration::from_secs(5));
            self.reap();
            return err(PatchError::Timeout(format!(
                "{} did not complete within {timeout:?}",
                self.label
            )));
        }
        self.reap();
        self.outcome(status)
    }

    fn outcome(&self, status: TaskStatus) -> Result<()> {
        match status {
            TaskStatus::Done => Ok(()),
            TaskStatus::Interrupted => {
                if self.ctl.timed_out() {
                    err(PatchError::Timeout(format!("{} timed out", self.label)))
                } else {
                    err(PatchError::StopRequested)
                }
            }
            TaskStatus::Errored => err(PatchError::Device(
                self.ctl
                    .error()
                    .unwrap_or_else(|| format!("{} failed", self.label)),
            )),
            TaskStatus::Pending | TaskStatus::Running => err(PatchError::Invariant(format!(
                "{} reported non-terminal status {status}",
                self.label
            ))),
        }
    }

    /// Join the worker thread once its status is terminal.
    fn reap(&self) {
        if let Ok(mut g) = self.join.lock()
            && let Some(handle) = g.take()
            && let Err(e) = handle.join()
        {
            tracing::warn!(label = self.label, ?e, "operation thread panicked");
        }
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        self.ctl.request_stop();
        if let Ok(mut g) = self.join.lock()
            && let Some(handle) = g.take()
            && let Err(e) = handle.join()
        {
            tracing::warn!(label = self.label, ?e, "operation thread panicked during drop");
        }
    }
}

impl std::fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpHandle")
            .field("label", &self.label)
            .field("status", &self.status())
            .finish()
    }
}

/// Map a worker body's outcome to a terminal status on its control block.
pub(crate) fn finish_worker(ctl: &TaskCtl, label: &str, outcome: Result<()>) {
    match outcome {
        Ok(()) => ctl.set_status(TaskStatus::Done),
        Err(report) => {
            let status = classify(ctl, &report);
            if status == TaskStatus::Errored {
                tracing::warn!(label, error = %report, "operation errored");
                ctl.set_error(report.to_string());
            } else {
                tracing::debug!(label, status = %status, "operation interrupted");
            }
            ctl.set_status(status);
        }
    }
}

fn classify(ctl: &TaskCtl, report: &Report) -> TaskStatus {
    match patch_error(report) {
        Some(PatchError::StopRequested) => {
            if ctl.finish_requested() {
                TaskStatus::Done
            } else {
                TaskStatus::Interrupted
            }
        }
        Some(PatchError::Timeout(msg)) => {
            ctl.mark_timed_out();
            ctl.set_error(msg.clone());
            TaskStatus::Interrupted
        }
        _ => TaskStatus::Errored,
    }
}

/// Execution context for a state body: the stop token plus wall-clock
/// helpers and future composition.
pub struct TaskContext {
    token: StopToken,
    epoch: Instant,
}

impl TaskContext {
    pub(crate) fn new(
        ctl: Arc<TaskCtl>,
        active: Arc<AtomicBool>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            token: StopToken {
                ctl,
                active: Some(active),
                clock,
            },
            epoch,
        }
    }

    /// Seconds since this context was created (state-local start time).
    pub fn elapsed(&self) -> f64 {
        self.token.clock.secs_since(self.epoch)
    }

    pub fn stop_requested(&self) -> bool {
        self.token.stop_requested()
    }

    /// Sleep up to `delay` then raise `StopRequested` if a stop arrived.
    pub fn check_stop(&self, delay: Duration) -> Result<()> {
        self.token.sleep(delay)
    }

    /// Stop-aware sleep.
    pub fn sleep(&self, d: Duration) -> Result<()> {
        self.token.sleep(d)
    }

    /// Block until `op` completes. If this task is stopped while waiting,
    /// the inner operation is stopped before the stop propagates; if
    /// `timeout` elapses first, the operation is stopped and a timeout is
    /// raised.
    pub fn wait_for(&self, op: &OpHandle, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.token.stop_requested() {
                op.stop();
                let _ = op.wait(Duration::from_secs(5));
                return err(PatchError::StopRequested);
            }
            let status = op.ctl().wait_terminal(STOP_POLL);
            if status.is_terminal() {
                return op.wait(Duration::ZERO);
            }
            if let Some(d) = deadline
                && Instant::now() >= d
            {
                op.stop();
                let _ = op.wait(Duration::from_secs(5));
                return err(PatchError::Timeout(format!(
                    "waiting for {} exceeded {timeout:?}",
                    op.label()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopatch_traits::MonotonicClock;

    fn clock() -> Arc<dyn Clock + Send + Sync> {
        Arc::new(MonotonicClock::new())
    }

    #[test]
    fn body_completes_as_done() {
        let op = OpHandle::spawn("noop", clock(), |_| Ok(()));
        op.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(op.status(), TaskStatus::Done);
    }

    #[test]
    fn stop_interrupts_a_sleeping_body() {
        let op = OpHandle::spawn("sleeper", clock(), |t| {
            t.sleep(Duration::from_secs(30))?;
            Ok(())
        });
        std::thread::sleep(Duration::from_millis(30));
        op.stop();
        let e = op.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            patch_error(&e),
            Some(PatchError::StopRequested)
        ));
        assert_eq!(op.status(), TaskStatus::Interrupted);
    }

    #[test]
    fn finish_request_ends_done_not_interrupted() {
        let op = OpHandle::spawn("finisher", clock(), |t| {
            t.sleep(Duration::from_secs(30))?;
            Ok(())
        });
        std::thread::sleep(Duration::from_millis(30));
        op.finish();
        op.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(op.status(), TaskStatus::Done);
    }

    #[test]
    fn body_timeout_is_interrupted_with_flag() {
        let op = OpHandle::spawn("deadline", clock(), |_| {
            err::<()>(PatchError::Timeout("deadline elapsed".into()))
        });
        let e = op.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(patch_error(&e), Some(PatchError::Timeout(_))));
        assert_eq!(op.status(), TaskStatus::Interrupted);
        assert!(op.timed_out());
    }

    #[test]
    fn body_error_is_recorded() {
        let op = OpHandle::spawn("broken", clock(), |_| {
            err::<()>(PatchError::Device("no response".into()))
        });
        let e = op.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(patch_error(&e), Some(PatchError::Device(_))));
        assert!(op.error().unwrap().contains("no response"));
    }

    #[test]
    fn wait_for_stops_inner_op_when_outer_is_stopped() {
        let ctl = Arc::new(TaskCtl::new());
        let active = Arc::new(AtomicBool::new(true));
        let cx = TaskContext::new(ctl.clone(), active, clock());

        let inner = OpHandle::spawn("inner", clock(), |t| {
            t.sleep(Duration::from_secs(30))?;
            Ok(())
        });

        ctl.request_stop();
        let e = cx.wait_for(&inner, None).unwrap_err();
        assert!(matches!(patch_error(&e), Some(PatchError::StopRequested)));
        assert_eq!(inner.status(), TaskStatus::Interrupted);
    }

    #[test]
    fn deactivation_counts_as_stop() {
        let ctl = Arc::new(TaskCtl::new());
        let active = Arc::new(AtomicBool::new(true));
        let cx = TaskContext::new(ctl, active.clone(), clock());
        assert!(cx.check_stop(Duration::ZERO).is_ok());
        active.store(false, Ordering::Relaxed);
        assert!(cx.check_stop(Duration::ZERO).is_err());
    }
}
