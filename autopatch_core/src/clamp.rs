//! Clamp facade: mode routing, per-mode holding cache, test-pulse control.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use autopatch_traits::{ClampAmplifier, ClampMode, TestPulseParams};
use eyre::WrapErr;

use crate::dev_error::map_dev_error;
use crate::error::{Report, Result};

#[derive(Debug, Default)]
struct ClampCache {
    mode: Option<ClampMode>,
    holding: [Option<f64>; 3],
    test_pulse: Option<bool>,
    auto_bias: Option<bool>,
}

pub struct ClampFacade {
    dev: Mutex<Box<dyn ClampAmplifier>>,
    cache: Mutex<ClampCache>,
    mode_transitions: AtomicUsize,
}

impl ClampFacade {
    pub fn new(dev: Box<dyn ClampAmplifier>) -> Self {
        Self {
            dev: Mutex::new(dev),
            cache: Mutex::new(ClampCache::default()),
            mode_transitions: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> Option<ClampMode> {
        self.lock_cache().mode
    }

    /// Count of mode changes actually pushed to the amplifier. Repeated
    /// commands for the current mode emit nothing.
    pub fn mode_transition_count(&self) -> usize {
        self.mode_transitions.load(Ordering::Relaxed)
    }

    /// Switch clamp mode. A direct VC<->IC change routes through I=0 with
    /// the destination holding reset to zero before committing; the cached
    /// per-mode holding is restored after the switch.
    pub fn set_mode(&self, mode: ClampMode) -> Result<()> {
        let current = self.mode();
        if current == Some(mode) {
            tracing::trace!(%mode, "clamp mode unchanged, skipping");
            return Ok(());
        }
        let crossing = matches!(
            (current, mode),
            (Some(ClampMode::Vc), ClampMode::Ic) | (Some(ClampMode::Ic), ClampMode::Vc)
        );
        if crossing {
            self.push_holding(mode, 0.0)?;
            self.push_mode(ClampMode::I0)?;
        }
        self.push_mode(mode)?;
        let cached_holding = self.lock_cache().holding[mode.index()];
        if let Some(h) = cached_holding {
            self.push_holding(mode, h)?;
        }
        self.lock_cache().mode = Some(mode);
        tracing::debug!(%mode, "clamp mode changed");
        Ok(())
    }

    /// Set the holding value for a mode; cached so later mode switches
    /// restore it automatically.
    pub fn set_holding(&self, mode: ClampMode, value: f64) -> Result<()> {
        self.lock_cache().holding[mode.index()] = Some(value);
        self.push_holding(mode, value)
    }

    pub fn holding(&self, mode: ClampMode) -> Option<f64> {
        self.lock_cache().holding[mode.index()]
    }

    pub fn enable_test_pulse(&self, enabled: bool) -> Result<()> {
        if self.lock_cache().test_pulse == Some(enabled) {
            return Ok(());
        }
        self.lock_dev()
            .enable_test_pulse(enabled)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("enable test pulse")?;
        self.lock_cache().test_pulse = Some(enabled);
        Ok(())
    }

    pub fn set_test_pulse_params(&self, params: TestPulseParams) -> Result<()> {
        self.lock_dev()
            .set_test_pulse_params(params)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("set test pulse parameters")
    }

    pub fn enable_auto_bias(&self, enabled: bool) -> Result<()> {
        if self.lock_cache().auto_bias == Some(enabled) {
            return Ok(());
        }
        self.lock_dev()
            .enable_auto_bias(enabled)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("enable auto bias")?;
        self.lock_cache().auto_bias = Some(enabled);
        Ok(())
    }

    pub fn set_auto_bias_target(&self, volts: f64) -> Result<()> {
        self.lock_dev()
            .set_auto_bias_target(volts)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("set auto bias target")
    }

    pub fn auto_pipette_offset(&self) -> Result<()> {
        self.lock_dev()
            .auto_pipette_offset()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("auto pipette offset")
    }

    pub fn auto_cap_comp(&self) -> Result<()> {
        self.lock_dev()
            .auto_cap_comp()
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("auto cap comp")
    }

    fn push_mode(&self, mode: ClampMode) -> Result<()> {
        self.lock_dev()
            .set_mode(mode)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("set clamp mode")?;
        self.mode_transitions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn push_holding(&self, mode: ClampMode, value: f64) -> Result<()> {
        self.lock_dev()
            .set_holding(mode, value)
            .map_err(|e| Report::new(map_dev_error(&*e)))
            .wrap_err("set holding")
    }

    fn lock_dev(&self) -> MutexGuard<'_, Box<dyn ClampAmplifier>> {
        match self.dev.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, ClampCache> {
        match self.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
