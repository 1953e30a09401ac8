//! Maps `Box<dyn Error>` from the device trait boundaries to typed
//! `PatchError`.
//!
//! The traits in `autopatch_traits` use `Box<dyn Error + Send + Sync>` for
//! maximum flexibility; this module converts those to our typed error enum,
//! with an optional feature-gated path for `autopatch_hardware::HwError`
//! downcasting.

use crate::error::PatchError;

/// Map a trait-boundary error to a typed `PatchError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_dev_error(e: &(dyn std::error::Error + 'static)) -> PatchError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<autopatch_hardware::HwError>() {
            return match hw {
                autopatch_hardware::HwError::Timeout => {
                    PatchError::Timeout("device timeout".into())
                }
                autopatch_hardware::HwError::Travel(msg) => PatchError::OutOfRange(msg.clone()),
                other => PatchError::Device(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        PatchError::Timeout(s)
    } else {
        PatchError::Device(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_timeout_heuristic() {
        let e = std::io::Error::other("read Timeout waiting for DAQ");
        assert!(matches!(map_dev_error(&e), PatchError::Timeout(_)));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_travel_maps_to_out_of_range() {
        let e = autopatch_hardware::HwError::Travel("axis 2".into());
        assert!(matches!(map_dev_error(&e), PatchError::OutOfRange(_)));
    }
}
