//! Executor error types.
//!
//! Errors are categorized by how a caller is expected to react:
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | **Validation** | `InvalidArgument` | Fix the request shape |
//! | **Lookup** | `NotFound` | Register the policy / provider first |
//! | **Initialization** | `Initialization`, `Import`, `Configuration` | Fix setup, or run with `raise_exc = false` |
//! | **Transient** | `Unavailable`, `Timeout` | Retry later |
//! | **Runtime** | `Submission`, `JobFailed`, `JobCancelled` | Inspect the collector |
//! | **I/O** | `Io`, `Serialization` | Fix the environment |
//!
//! Validation errors are always returned to the caller that triggered them.
//! Initialization and runtime errors are governed by the executor-wide
//! `raise_exc` flag: when it is off they are logged and the offending
//! provider, policy or job is skipped or recorded as a failed outcome.

use thiserror::Error;

/// Errors that can occur while building dispatches or running jobs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecError {
    /// Malformed request: mismatched task/shots cardinality, bad shots, bad seed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown policy, provider, backend or device.
    #[error("{0}")]
    NotFound(String),

    /// A provider or policy could not be constructed.
    #[error("{0}")]
    Initialization(String),

    /// A policy unit is malformed or does not expose both entry points.
    #[error("Import error: {0}")]
    Import(String),

    /// Backend is not online.
    #[error("{0}")]
    Unavailable(String),

    /// Timed out waiting for a job or a collector.
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// A backend rejected a submission.
    #[error("Job submission failed: {0}")]
    Submission(String),

    /// A submitted job finished in a failed state.
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// A submitted job was cancelled by its backend.
    #[error("Job cancelled")]
    JobCancelled,

    /// Invalid executor or provider configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecError {
    /// Returns `true` if the operation may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Returns `true` for unknown policy / provider / backend lookups.
    pub fn is_lookup(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for executor operations.
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ExecError::Unavailable("offline".into()).is_transient());
        assert!(ExecError::Timeout("job-123".into()).is_transient());
        assert!(!ExecError::InvalidArgument("bad".into()).is_transient());
        assert!(ExecError::NotFound("Split policy 'x' not found".into()).is_lookup());
        assert!(!ExecError::JobCancelled.is_lookup());
    }

    #[test]
    fn test_error_display() {
        let err = ExecError::InvalidArgument("shots must be specified".into());
        assert_eq!(err.to_string(), "Invalid argument: shots must be specified");

        let err = ExecError::NotFound("Provider 'ionq' not initialized.".into());
        assert_eq!(err.to_string(), "Provider 'ionq' not initialized.");
    }
}
