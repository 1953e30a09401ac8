//! Streaming detectors over the test-pulse resistance series.
//!
//! All detectors are plain structs fed one sample at a time; none of them
//! touch devices. The states own the policy of what to do when a detector
//! fires.

use std::collections::VecDeque;

/// Latching edge detector for a sudden resistance drop (pipette tip broke).
///
/// Fires once when resistance falls below `initial + threshold` (threshold
/// negative).
#[derive(Debug)]
pub struct BreakDetector {
    initial: f64,
    threshold: f64,
    fired: bool,
}

impl BreakDetector {
    pub fn new(initial: f64, threshold: f64) -> Self {
        Self {
            initial,
            threshold,
            fired: false,
        }
    }

    pub fn update(&mut self, resistance: f64) -> bool {
        if self.fired {
            return false;
        }
        if resistance < self.initial + self.threshold {
            self.fired = true;
            tracing::debug!(
                resistance,
                initial = self.initial,
                "tip break detected"
            );
            return true;
        }
        false
    }
}

/// Which proximity rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proximity {
    /// Single sample exceeded the fast threshold.
    Fast,
    /// Strict monotonic rise over the window plus the slow threshold.
    Slow,
}

#[derive(Debug, Clone)]
pub struct ProximityConfig {
    /// Fast rule: fire when `r > initial + fast_threshold`.
    pub fast_threshold: f64,
    /// Slow rule: fire when the last `steps` samples are strictly
    /// increasing and `r > initial + slow_threshold`.
    pub slow_threshold: f64,
    pub steps: usize,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 1e6,
            slow_threshold: 0.2e6,
            steps: 3,
        }
    }
}

/// Cell-proximity detector: two parallel rules over the resistance stream.
#[derive(Debug)]
pub struct ProximityDetector {
    initial: f64,
    cfg: ProximityConfig,
    window: VecDeque<f64>,
}

impl ProximityDetector {
    pub fn new(initial: f64, cfg: ProximityConfig) -> Self {
        let cap = cfg.steps.max(1);
        Self {
            initial,
            cfg,
            window: VecDeque::with_capacity(cap),
        }
    }

    pub fn update(&mut self, resistance: f64) -> Option<Proximity> {
        if resistance > self.initial + self.cfg.fast_threshold {
            return Some(Proximity::Fast);
        }
        let steps = self.cfg.steps.max(1);
        self.window.push_back(resistance);
        if self.window.len() > steps {
            self.window.pop_front();
        }
        if self.window.len() == steps
            && self
                .window
                .iter()
                .zip(self.window.iter().skip(1))
                .all(|(a, b)| b > a)
            && resistance > self.initial + self.cfg.slow_threshold
        {
            return Some(Proximity::Slow);
        }
        None
    }
}

/// Least-squares slope of `(t, r)` pairs over a rolling window, in ohms per
/// second. `None` until two samples with distinct timestamps are present.
#[derive(Debug)]
pub struct SlopeWindow {
    window: VecDeque<(f64, f64)>,
    len: usize,
}

impl SlopeWindow {
    pub fn new(len: usize) -> Self {
        let len = len.max(2);
        Self {
            window: VecDeque::with_capacity(len),
            len,
        }
    }

    pub fn push(&mut self, t: f64, r: f64) {
        self.window.push_back((t, r));
        if self.window.len() > self.len {
            self.window.pop_front();
        }
    }

    pub fn slope(&self) -> Option<f64> {
        let n = self.window.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let (mut st, mut sr) = (0.0, 0.0);
        for &(t, r) in &self.window {
            st += t;
            sr += r;
        }
        let (tm, rm) = (st / nf, sr / nf);
        let (mut num, mut den) = (0.0, 0.0);
        for &(t, r) in &self.window {
            num += (t - tm) * (r - rm);
            den += (t - tm) * (t - tm);
        }
        if den <= 0.0 { None } else { Some(num / den) }
    }
}

/// What the seal controller wants done with the regulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SealAction {
    /// Command this setpoint (already clamped to `[pressure_limit, 0]`).
    Set(f64),
    /// Suction floor reached while still sealing: vent to atmosphere, wait
    /// the reset delay, resume at the starting pressure.
    CycleReset,
}

#[derive(Debug, Clone)]
pub struct SealRateConfig {
    /// Piecewise table `(max_slope, pressure_delta)`. Sorted ascending by
    /// `max_slope` at construction; the first row whose `max_slope` exceeds
    /// the observed slope contributes its delta.
    pub change_rates: Vec<(f64, f64)>,
    /// Most negative allowed setpoint while sealing.
    pub pressure_limit: f64,
    pub slope_samples: usize,
}

impl Default for SealRateConfig {
    fn default() -> Self {
        Self {
            change_rates: vec![(-1e6, 200.0), (0.5e6, -100.0), (100e6, 0.0)],
            pressure_limit: -3e3,
            slope_samples: 4,
        }
    }
}

/// Slope-driven suction controller for seal formation.
#[derive(Debug)]
pub struct SealRateController {
    rates: Vec<(f64, f64)>,
    limit: f64,
    window: SlopeWindow,
}

impl SealRateController {
    pub fn new(cfg: SealRateConfig) -> Self {
        let mut rates = cfg.change_rates;
        rates.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            rates,
            limit: cfg.pressure_limit.min(0.0),
            window: SlopeWindow::new(cfg.slope_samples),
        }
    }

    /// Feed one sample and decide the next regulator action from `current`
    /// setpoint. Returns `None` until a slope is available.
    pub fn update(&mut self, t: f64, r: f64, current: f64) -> Option<SealAction> {
        self.window.push(t, r);
        let slope = self.window.slope()?;
        let delta = self
            .rates
            .iter()
            .find(|(max_slope, _)| *max_slope > slope)
            .map(|(_, d)| *d)
            .unwrap_or(0.0);
        let next = (current + delta).clamp(self.limit, 0.0);
        tracing::trace!(slope, delta, next, "seal pressure update");
        if next <= self.limit && delta < 0.0 {
            Some(SealAction::CycleReset)
        } else {
            Some(SealAction::Set(next))
        }
    }
}

/// Exponential moving average with a time constant rather than a fixed
/// per-sample weight: `alpha = 1 - exp(-dt / tau)`.
#[derive(Debug, Clone)]
pub struct TimeConstantEma {
    tau: f64,
    value: Option<f64>,
    last_t: f64,
}

impl TimeConstantEma {
    pub fn new(tau: f64) -> Self {
        Self {
            tau: tau.max(1e-9),
            value: None,
            last_t: 0.0,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Update with a sample at time `t`; returns
    /// `log10(avg_new / avg_old)` (0 on the first sample).
    pub fn update(&mut self, t: f64, x: f64) -> f64 {
        match self.value {
            None => {
                self.value = Some(x);
                self.last_t = t;
                0.0
            }
            Some(old) => {
                let dt = (t - self.last_t).max(0.0);
                self.last_t = t;
                let alpha = 1.0 - (-dt / self.tau).exp();
                let new = old * (1.0 - alpha) + x * alpha;
                self.value = Some(new);
                if old > 0.0 && new > 0.0 {
                    (new / old).log10()
                } else {
                    0.0
                }
            }
        }
    }
}

/// Membrane trend during retraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembraneTrend {
    Steady,
    /// Resistance climbing: membrane is stretching; pause the retraction.
    Stretching,
    /// Resistance collapsing: membrane is tearing; back off and let it
    /// recover.
    Tearing,
}

#[derive(Debug, Clone)]
pub struct ResealConfig {
    /// Fast time constant, catches acute changes.
    pub detection_tau: f64,
    /// Slow time constant, tracks the repairing baseline.
    pub repair_tau: f64,
    /// Positive log10-ratio above which the membrane counts as stretching.
    pub stretch_threshold: f64,
    /// Negative log10-ratio below which it counts as tearing.
    pub tear_threshold: f64,
}

impl Default for ResealConfig {
    fn default() -> Self {
        Self {
            detection_tau: 1.0,
            repair_tau: 10.0,
            stretch_threshold: 1e-3,
            tear_threshold: -1e-3,
        }
    }
}

/// Dual-timescale reseal monitor: either EMA crossing its ratio threshold
/// reports the corresponding trend.
#[derive(Debug)]
pub struct ResealMonitor {
    cfg: ResealConfig,
    detection: TimeConstantEma,
    repair: TimeConstantEma,
}

impl ResealMonitor {
    pub fn new(cfg: ResealConfig) -> Self {
        let detection = TimeConstantEma::new(cfg.detection_tau);
        let repair = TimeConstantEma::new(cfg.repair_tau);
        Self {
            cfg,
            detection,
            repair,
        }
    }

    pub fn update(&mut self, t: f64, r: f64) -> MembraneTrend {
        let rd = self.detection.update(t, r);
        let rr = self.repair.update(t, r);
        if rd > self.cfg.stretch_threshold || rr > self.cfg.stretch_threshold {
            MembraneTrend::Stretching
        } else if rd < self.cfg.tear_threshold || rr < self.cfg.tear_threshold {
            MembraneTrend::Tearing
        } else {
            MembraneTrend::Steady
        }
    }

    pub fn detection_value(&self) -> Option<f64> {
        self.detection.value()
    }

    pub fn repair_value(&self) -> Option<f64> {
        self.repair.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_detector_fires_once_on_drop() {
        let mut d = BreakDetector::new(10e6, -1e6);
        assert!(!d.update(10.2e6));
        assert!(!d.update(9.5e6));
        assert!(d.update(8.5e6));
        assert!(!d.update(7.0e6));
    }

    #[test]
    fn fast_proximity_fires_on_single_jump() {
        let mut d = ProximityDetector::new(5e6, ProximityConfig::default());
        for r in [5.0e6, 5.1e6, 5.2e6] {
            assert_eq!(d.update(r), None);
        }
        assert_eq!(d.update(6.3e6), Some(Proximity::Fast));
    }

    #[test]
    fn slow_proximity_needs_monotonic_window_and_threshold() {
        let mut d = ProximityDetector::new(5e6, ProximityConfig::default());
        for r in [5.00e6, 5.05e6, 5.10e6, 5.15e6] {
            assert_eq!(d.update(r), None);
        }
        assert_eq!(d.update(5.22e6), Some(Proximity::Slow));
    }

    #[test]
    fn slow_proximity_rejects_non_monotonic_windows() {
        let mut d = ProximityDetector::new(5e6, ProximityConfig::default());
        for r in [5.0e6, 5.3e6, 5.25e6, 5.28e6] {
            assert_eq!(d.update(r), None);
        }
    }

    #[test]
    fn slope_window_matches_exact_line() {
        let mut w = SlopeWindow::new(4);
        for i in 0..4 {
            let t = i as f64 * 0.2;
            w.push(t, 5e6 + 0.2e6 * t);
        }
        let s = w.slope().unwrap();
        assert!((s - 0.2e6).abs() < 1.0, "slope {s}");
    }

    #[test]
    fn seal_controller_applies_first_matching_row() {
        let mut c = SealRateController::new(SealRateConfig {
            change_rates: vec![(0.5e6, -100.0), (100e6, 0.0), (-1e6, 200.0)],
            pressure_limit: -3e3,
            slope_samples: 4,
        });
        // Feed a 0.2 MOhm/s line.
        let mut action = None;
        for i in 0..4 {
            let t = i as f64 * 0.2;
            action = c.update(t, 5e6 + 0.2e6 * t, -1000.0);
        }
        assert_eq!(action, Some(SealAction::Set(-1100.0)));
    }

    #[test]
    fn seal_controller_releases_when_resistance_falls() {
        let mut c = SealRateController::new(SealRateConfig::default());
        let mut action = None;
        for i in 0..4 {
            let t = i as f64 * 0.2;
            action = c.update(t, 100e6 - 2e6 * t, -1000.0);
        }
        // Slope -2 MOhm/s is below the -1 MOhm/s row: release by +200 Pa.
        assert_eq!(action, Some(SealAction::Set(-800.0)));
    }

    #[test]
    fn seal_controller_cycles_at_the_suction_floor() {
        let mut c = SealRateController::new(SealRateConfig {
            change_rates: vec![(0.5e6, -100.0)],
            pressure_limit: -1000.0,
            slope_samples: 2,
        });
        c.update(0.0, 5e6, -950.0);
        let action = c.update(0.2, 5.01e6, -950.0);
        assert_eq!(action, Some(SealAction::CycleReset));
    }

    #[test]
    fn ema_converges_within_three_tau() {
        let mut ema = TimeConstantEma::new(1.0);
        ema.update(0.0, 1e6);
        let mut t = 0.0;
        while t < 3.0 {
            t += 0.1;
            ema.update(t, 2e6);
        }
        let v = ema.value().unwrap();
        assert!(
            (v - 2e6).abs() / 2e6 < 0.06,
            "after 3 tau expected convergence, got {v}"
        );
    }

    #[test]
    fn reseal_monitor_is_steady_on_constant_input() {
        let mut m = ResealMonitor::new(ResealConfig::default());
        let mut t = 0.0;
        for _ in 0..300 {
            t += 0.1;
            assert_eq!(m.update(t, 1e9), MembraneTrend::Steady);
        }
        let d = m.detection_value().unwrap();
        let r = m.repair_value().unwrap();
        assert!((d - 1e9).abs() < 1.0);
        assert!((r - 1e9).abs() / 1e9 < 0.06);
    }

    #[test]
    fn reseal_monitor_reports_stretch_and_tear() {
        let cfg = ResealConfig::default();
        let mut m = ResealMonitor::new(cfg.clone());
        m.update(0.0, 1e9);
        // Sharp climb: detection EMA ratio goes positive.
        assert_eq!(m.update(0.5, 2e9), MembraneTrend::Stretching);

        let mut m = ResealMonitor::new(cfg);
        m.update(0.0, 1e9);
        assert_eq!(m.update(0.5, 0.2e9), MembraneTrend::Tearing);
    }
}
