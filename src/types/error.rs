//! Error taxonomy for the runtime.

use thiserror::Error;

/// Main runtime error type.
///
/// Variants map onto the surface behavior of the serving layer: validation
/// and auth errors become 4xx responses, `JobBusy` becomes 409, upstream and
/// integrity failures terminate pipeline jobs as `failed`.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("another pipeline job is already running")]
    JobBusy,

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("model returned non-parsable output: {0}")]
    ModelFormat(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Shorthand used by services that reject malformed identifiers.
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InputValidation(format!("{}: {}", field, reason.into()))
    }
}

impl From<rusqlite::Error> for RuntimeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("json: {e}"))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;
