use thiserror::Error;

/// Typed error conditions of the patch engine.
///
/// `StopRequested` and `Timeout` are ordinary control flow: a task that ends
/// with either becomes `Interrupted`, not `Errored`, and cleanup still runs.
#[derive(Debug, Error, Clone)]
pub enum PatchError {
    #[error("stop requested")]
    StopRequested,
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("target outside stage travel: {0}")]
    OutOfRange(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

/// Find the first typed `PatchError` in a report's cause chain.
pub fn patch_error(report: &Report) -> Option<&PatchError> {
    report
        .chain()
        .find_map(|e| e.downcast_ref::<PatchError>())
}

/// Shorthand for raising a typed error as a report.
pub(crate) fn err<T>(e: PatchError) -> Result<T> {
    Err(Report::new(e))
}
