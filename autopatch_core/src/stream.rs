//! Test-pulse distribution: producer pump, per-state queues, watch
//! predicates.
//!
//! One pump thread owns the amplifier's measurement side and publishes every
//! completed pulse to a hub. Each state subscribes for its lifetime and
//! drains its own unbounded FIFO; subscription and unsubscription are paired
//! with state initialize/cleanup (dropping the queue unsubscribes).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use autopatch_traits::{PulseSource, TestPulse};
use crossbeam_channel as xch;

use crate::task::{OpHandle, TaskCtl};

type WatchPred = Box<dyn Fn(&TestPulse) -> bool + Send>;

struct Watcher {
    pred: WatchPred,
    targets: Vec<Arc<TaskCtl>>,
}

/// One registered watch slot. Re-registering replaces the predicate, so
/// repeated registration without a match is idempotent.
#[derive(Default)]
pub(crate) struct Watch {
    inner: Mutex<Option<Watcher>>,
}

impl Watch {
    /// Evaluate against a new pulse; on a match, finish the target
    /// operations gracefully and clear the slot (a watch fires once).
    fn observe(&self, pulse: &TestPulse) {
        let Ok(mut g) = self.inner.lock() else {
            return;
        };
        let fired = g.as_ref().is_some_and(|w| (w.pred)(pulse));
        if fired
            && let Some(w) = g.take()
        {
            tracing::debug!(
                t = pulse.start_time,
                r = pulse.analysis.steady_state_resistance,
                "watch predicate matched"
            );
            for ctl in w.targets {
                ctl.request_finish();
            }
        }
    }
}

struct Subscriber {
    tx: xch::Sender<TestPulse>,
    watch: Arc<Watch>,
}

/// Fan-out point for test pulses; clones share the subscriber list.
#[derive(Clone, Default)]
pub struct MeasurementHub {
    subs: Arc<Mutex<Vec<Subscriber>>>,
}

impl MeasurementHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a new queue. Dropping the returned queue unsubscribes on
    /// the next publish.
    pub fn subscribe(&self) -> PulseQueue {
        let (tx, rx) = xch::unbounded();
        let watch = Arc::new(Watch::default());
        if let Ok(mut subs) = self.subs.lock() {
            subs.push(Subscriber {
                tx,
                watch: watch.clone(),
            });
        }
        PulseQueue { rx, watch }
    }

    /// Deliver one pulse to every live subscriber, evaluating watch
    /// predicates inline so they fire even while the subscriber is blocked
    /// elsewhere.
    pub fn publish(&self, pulse: TestPulse) {
        let Ok(mut subs) = self.subs.lock() else {
            return;
        };
        subs.retain(|s| {
            if s.tx.send(pulse).is_err() {
                return false;
            }
            s.watch.observe(&pulse);
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A state's private FIFO of test pulses.
pub struct PulseQueue {
    rx: xch::Receiver<TestPulse>,
    watch: Arc<Watch>,
}

impl PulseQueue {
    /// Return all pulses that arrived since the last drain, blocking up to
    /// `timeout` for the first one. An empty vec means the caller should
    /// loop and re-check for stop requests.
    pub fn drain(&self, timeout: Duration) -> Vec<TestPulse> {
        let mut out = Vec::new();
        match self.rx.recv_timeout(timeout) {
            Ok(p) => out.push(p),
            Err(_) => return out,
        }
        out.extend(self.rx.try_iter());
        out
    }

    /// Drain and keep only the most recent pulse; stale pulses are
    /// discarded, not processed.
    pub fn latest(&self, timeout: Duration) -> Option<TestPulse> {
        let pulses = self.drain(timeout);
        if pulses.len() > 1 {
            tracing::trace!(dropped = pulses.len() - 1, "measurement consumer behind");
        }
        pulses.into_iter().next_back()
    }

    /// Install a watch: when a future pulse satisfies `pred`, the given
    /// operations are finished gracefully. Replaces any previous watch.
    pub fn stop_when<F>(&self, ops: &[&OpHandle], pred: F)
    where
        F: Fn(&TestPulse) -> bool + Send + 'static,
    {
        if let Ok(mut g) = self.watch.inner.lock() {
            *g = Some(Watcher {
                pred: Box::new(pred),
                targets: ops.iter().map(|o| o.ctl()).collect(),
            });
        }
    }

    pub fn clear_watch(&self) {
        if let Ok(mut g) = self.watch.inner.lock() {
            *g = None;
        }
    }
}

/// Owns the measurement side of the amplifier and publishes pulses until
/// dropped. One pump per pipette.
pub struct PulsePump {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PulsePump {
    pub fn spawn(mut source: Box<dyn PulseSource>, hub: MeasurementHub) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let join = std::thread::spawn(move || {
            loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                match source.read_pulse(Duration::from_millis(200)) {
                    Ok(Some(pulse)) => hub.publish(pulse),
                    // Producer quiet (test pulse off, mode switch); consumers
                    // apply their own timeouts.
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "pulse source read failed");
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            tracing::trace!("pulse pump exiting");
        });
        Self {
            shutdown,
            join: Some(join),
        }
    }
}

impl Drop for PulsePump {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join.take()
            && let Err(e) = handle.join()
        {
            tracing::warn!(?e, "pulse pump thread panicked during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopatch_traits::TestPulseAnalysis;

    fn pulse(t: f64, r: f64) -> TestPulse {
        TestPulse {
            start_time: t,
            analysis: TestPulseAnalysis {
                steady_state_resistance: r,
                capacitance: 3e-12,
                baseline_current: 0.0,
            },
        }
    }

    #[test]
    fn drain_returns_everything_since_last_drain() {
        let hub = MeasurementHub::new();
        let q = hub.subscribe();
        for i in 0..3 {
            hub.publish(pulse(i as f64, 5e6));
        }
        let got = q.drain(Duration::from_millis(10));
        assert_eq!(got.len(), 3);
        assert!(q.drain(Duration::from_millis(1)).is_empty());
    }

    #[test]
    fn latest_keeps_only_the_newest() {
        let hub = MeasurementHub::new();
        let q = hub.subscribe();
        hub.publish(pulse(0.0, 5e6));
        hub.publish(pulse(0.2, 6e6));
        let p = q.latest(Duration::from_millis(10)).unwrap();
        assert_eq!(p.start_time, 0.2);
    }

    #[test]
    fn dropped_queue_is_pruned_on_publish() {
        let hub = MeasurementHub::new();
        let q = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(q);
        hub.publish(pulse(0.0, 5e6));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn watch_finishes_target_and_fires_once() {
        use crate::task::{OpHandle, TaskStatus};
        use autopatch_traits::MonotonicClock;

        let hub = MeasurementHub::new();
        let q = hub.subscribe();
        let op = OpHandle::spawn("advance", Arc::new(MonotonicClock::new()), |t| {
            t.sleep(Duration::from_secs(30))?;
            Ok(())
        });
        q.stop_when(&[&op], |p| p.analysis.steady_state_resistance > 6e6);
        // Re-registering without a match is idempotent.
        q.stop_when(&[&op], |p| p.analysis.steady_state_resistance > 6e6);

        hub.publish(pulse(0.0, 5e6));
        assert_eq!(op.status(), TaskStatus::Running);
        hub.publish(pulse(0.2, 6.5e6));
        op.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(op.status(), TaskStatus::Done);
    }
}
