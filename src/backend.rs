//! Backend contract consumed by the executor.
//!
//! ```text
//!   status() ──→ submit() ──→ job_status() ──→ result()
//!    (sync)       (async)       (async)         (async)
//! ```
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `name()` | sync | yes | `&str` |
//! | `status()` | sync | yes | `BackendStatus` |
//! | `submit()` | async | yes | `ExecResult<JobHandle>` |
//! | `job_status()` | async | yes | `ExecResult<HandleStatus>` |
//! | `result()` | async | yes | `ExecResult<Vec<ExecutionResult>>` |
//! | `wait()` | async | provided | `ExecResult<Vec<ExecutionResult>>` |
//!
//! `status()` is synchronous so split policies, which are plain functions,
//! can consult it through the [`VirtualProvider`](crate::VirtualProvider).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};
use crate::handle::{HandleStatus, JobHandle};
use crate::job::Configuration;
use crate::result::ExecutionResult;

pub const SHOTS_MISSING: &str = "shots must be specified";
pub const SEED_NEGATIVE: &str = "seed must be a non-negative integer";
pub const INVALID_RUN_INPUT: &str = "Invalid run_input";

/// Reachability of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendStatus {
    Online,
    Offline,
    Unknown,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStatus::Online => write!(f, "ONLINE"),
            BackendStatus::Offline => write!(f, "OFFLINE"),
            BackendStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// An execution target for tasks of type `C`.
///
/// # Contract
///
/// - `submit()` validates its arguments with [`validate_run_args`] and
///   returns a handle whose initial status is `Queued` (or later).
/// - `result()` returns one [`ExecutionResult`] per submitted task, in
///   submission order, and MUST only be called once the handle is
///   `Completed`.
/// - `wait()` polls `job_status()` every [`poll_interval`](Backend::poll_interval)
///   for at most [`max_wait`](Backend::max_wait).
#[async_trait]
pub trait Backend<C>: Send + Sync {
    fn name(&self) -> &str;

    fn status(&self) -> BackendStatus;

    /// Submit `tasks` for `shots` repetitions each.
    async fn submit(
        &self,
        tasks: &[C],
        shots: Option<i64>,
        seed: Option<i64>,
        configuration: &Configuration,
    ) -> ExecResult<JobHandle>;

    async fn job_status(&self, handle: &JobHandle) -> ExecResult<HandleStatus>;

    async fn result(&self, handle: &JobHandle) -> ExecResult<Vec<ExecutionResult>>;

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn max_wait(&self) -> Duration {
        Duration::from_secs(300)
    }

    /// Block until `handle` reaches a terminal state and return its results.
    async fn wait(&self, handle: &JobHandle) -> ExecResult<Vec<ExecutionResult>> {
        let deadline = tokio::time::Instant::now() + self.max_wait();

        loop {
            if let Some(settled) = self.job_status(handle).await?.settled() {
                settled?;
                return self.result(handle).await;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExecError::Timeout(format!("job {handle}")));
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}

/// Validate submission arguments, returning the shot count.
pub fn validate_run_args(shots: Option<i64>, seed: Option<i64>) -> ExecResult<u32> {
    let shots = shots.ok_or_else(|| ExecError::InvalidArgument(SHOTS_MISSING.into()))?;
    let shots = u32::try_from(shots)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ExecError::InvalidArgument(crate::dispatch::POSITIVE_SHOTS.into()))?;
    if seed.is_some_and(|s| s < 0) {
        return Err(ExecError::InvalidArgument(SEED_NEGATIVE.into()));
    }
    Ok(shots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_run_args() {
        assert_eq!(validate_run_args(Some(100), Some(42)).unwrap(), 100);
        assert_eq!(validate_run_args(Some(1), None).unwrap(), 1);

        let err = validate_run_args(None, None).unwrap_err();
        assert!(err.to_string().contains("shots must be specified"));

        for shots in [0, -5] {
            let err = validate_run_args(Some(shots), None).unwrap_err();
            assert!(err.to_string().contains("shots must be a positive integer"));
        }

        let err = validate_run_args(Some(100), Some(-1)).unwrap_err();
        assert!(err.to_string().contains("seed must be a non-negative integer"));
    }

    #[test]
    fn test_backend_status_display() {
        assert_eq!(BackendStatus::Online.to_string(), "ONLINE");
        assert_eq!(
            serde_json::to_value(BackendStatus::Offline).unwrap(),
            serde_json::json!("OFFLINE")
        );
    }
}
