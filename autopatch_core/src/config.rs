//! Key-level merge of user overrides onto per-state config defaults.
//!
//! Every state declares its recognized keys as a serde struct with a
//! `Default` impl; user TOML tables are overlaid key by key and unknown
//! keys are rejected, so a typo fails at `initialize` instead of silently
//! falling back to a default.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{PatchError, Result};

/// Build a state config: serialize the defaults, overlay `overrides`
/// table-by-table, deserialize the result back into the typed struct.
///
/// Unknown keys are caught at the deserialization step (the config structs
/// carry `deny_unknown_fields`), so a typo fails loudly instead of
/// silently falling back to a default. Keys absent from the serialized
/// defaults (optional fields) merge cleanly.
pub fn merged_config<T>(overrides: Option<&toml::Value>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let Some(overrides) = overrides else {
        return Ok(T::default());
    };
    let base = toml::Value::try_from(T::default()).map_err(|e| {
        eyre::Report::new(PatchError::Config(format!("defaults not serializable: {e}")))
    })?;
    let merged = merge(base, overrides);
    merged
        .try_into()
        .map_err(|e| eyre::Report::new(PatchError::Config(format!("invalid state config: {e}"))))
}

fn merge(base: toml::Value, overrides: &toml::Value) -> toml::Value {
    match (base, overrides) {
        (toml::Value::Table(mut base), toml::Value::Table(over)) => {
            for (key, value) in over {
                let merged = match base.remove(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            toml::Value::Table(base)
        }
        // Scalars and arrays are replaced wholesale.
        (_, value) => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default, deny_unknown_fields)]
    struct Demo {
        threshold: f64,
        steps: u32,
        label: String,
        baseline: Option<f64>,
    }

    impl Default for Demo {
        fn default() -> Self {
            Self {
                threshold: 1e6,
                steps: 3,
                label: "demo".into(),
                baseline: None,
            }
        }
    }

    fn table(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn no_overrides_yields_defaults() {
        let d: Demo = merged_config(None).unwrap();
        assert_eq!(d, Demo::default());
    }

    #[test]
    fn overrides_replace_only_named_keys() {
        let v = table("threshold = 5e5\n");
        let d: Demo = merged_config(Some(&v)).unwrap();
        assert_eq!(d.threshold, 5e5);
        assert_eq!(d.steps, 3);
        assert_eq!(d.label, "demo");
    }

    #[test]
    fn optional_keys_absent_from_defaults_still_merge() {
        let v = table("baseline = 7e6\n");
        let d: Demo = merged_config(Some(&v)).unwrap();
        assert_eq!(d.baseline, Some(7e6));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let v = table("treshold = 5e5\n");
        let e = merged_config::<Demo>(Some(&v)).unwrap_err();
        assert!(e.to_string().contains("treshold"));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let v = table("steps = \"three\"\n");
        assert!(merged_config::<Demo>(Some(&v)).is_err());
    }
}
