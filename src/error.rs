use thiserror::Error;

/// Failure taxonomy shared across the session, location, and report layers.
///
/// Telemetry decode problems and location fetch failures never surface here
/// to callers of those subsystems; they are logged and absorbed at the source
/// per the resilience rules of each component.
#[derive(Debug, Error)]
pub enum Error {
    /// A required session field is missing or a report filter is malformed
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend refused a context switch for this company/role pair
    #[error("no access to the requested company/role pair")]
    Permission,

    /// Transport-level failure on an HTTP call
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Malformed token or malformed JSON body, always recoverable
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A context switch failed for a reason other than permissions
    #[error("context switch failed: {0}")]
    ContextSwitch(String),

    /// Start of a date range is after its end
    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    /// Persistent storage read/write failure
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}
