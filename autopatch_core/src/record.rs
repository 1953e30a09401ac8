//! Append-only record of one patch attempt's outcomes.
//!
//! States write timestamps, resistances at key moments and success flags;
//! nothing in the engine reads them back for control decisions. The record
//! persists for one attempt and is archived and cleared when a new attempt
//! begins.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A value stored in the patch record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Position([f64; 3]),
}

impl From<bool> for RecordValue {
    fn from(v: bool) -> Self {
        RecordValue::Bool(v)
    }
}
impl From<f64> for RecordValue {
    fn from(v: f64) -> Self {
        RecordValue::Number(v)
    }
}
impl From<&str> for RecordValue {
    fn from(v: &str) -> Self {
        RecordValue::Text(v.to_string())
    }
}
impl From<[f64; 3]> for RecordValue {
    fn from(v: [f64; 3]) -> Self {
        RecordValue::Position(v)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: BTreeMap<String, RecordValue>,
    attempt: u64,
    open: bool,
}

/// Shared handle to the current attempt's record. Cheap to clone; writes are
/// serialized internally.
#[derive(Debug, Clone, Default)]
pub struct PatchRecord {
    inner: Arc<Mutex<Inner>>,
}

impl PatchRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new attempt, clearing any previous values.
    pub fn begin(&self, start_time: f64) {
        let mut g = self.lock();
        g.values.clear();
        g.attempt += 1;
        g.open = true;
        let attempt = g.attempt;
        drop(g);
        self.set("startTime", start_time);
        tracing::info!(attempt, "patch attempt started");
    }

    /// Close the current attempt. The values stay readable until the next
    /// `begin`; a storage collaborator would snapshot them here.
    pub fn finish(&self) {
        let mut g = self.lock();
        if !g.open {
            return;
        }
        g.open = false;
        tracing::info!(attempt = g.attempt, keys = g.values.len(), "patch attempt finished");
    }

    pub fn set(&self, key: &str, value: impl Into<RecordValue>) {
        let value = value.into();
        let mut g = self.lock();
        if g.values.insert(key.to_string(), value.clone()).is_some() {
            tracing::debug!(key, "patch record key overwritten");
        }
        tracing::trace!(key, ?value, "patch record write");
    }

    pub fn get(&self, key: &str) -> Option<RecordValue> {
        self.lock().values.get(key).cloned()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(RecordValue::Number(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(RecordValue::Bool(v)) => Some(v),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, RecordValue> {
        self.lock().values.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_clears_previous_attempt() {
        let r = PatchRecord::new();
        r.begin(0.0);
        r.set("detectedCell", true);
        assert_eq!(r.get_bool("detectedCell"), Some(true));

        r.finish();
        r.begin(10.0);
        assert_eq!(r.get_bool("detectedCell"), None);
        assert_eq!(r.get_number("startTime"), Some(10.0));
    }

    #[test]
    fn values_round_trip_by_kind() {
        let r = PatchRecord::new();
        r.begin(0.0);
        r.set("sealResistance", 1.5e9);
        r.set("note", "ok");
        r.set("tipPosition", [1.0, 2.0, 3.0]);
        assert_eq!(r.get_number("sealResistance"), Some(1.5e9));
        assert_eq!(r.get("note"), Some(RecordValue::Text("ok".into())));
        assert_eq!(
            r.get("tipPosition"),
            Some(RecordValue::Position([1.0, 2.0, 3.0]))
        );
    }
}
