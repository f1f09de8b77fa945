use thiserror::Error;

/// Failure kinds callers need to tell apart. Everything else travels as a
/// plain `anyhow::Error`.
#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("ambient light sample failed: {0}")]
    SampleFailed(String),
    #[error("calibration curve folds back on itself")]
    CurveInvalid,
}

impl Error {
    pub(crate) fn of(err: &anyhow::Error) -> Option<&Error> {
        err.downcast_ref::<Error>()
    }
}
