//! Backend-side submission handles.
//!
//! `submit()` returns a [`JobHandle`]; the executor then polls
//! [`HandleStatus`] until the submission settles:
//!
//! | Status | Settled | `wait()` yields |
//! |--------|---------|-----------------|
//! | `Queued`, `Running` | no | keeps polling |
//! | `Completed` | yes | `result()` |
//! | `Failed(reason)` | yes | `ExecError::JobFailed(reason)` |
//! | `Cancelled` | yes | `ExecError::JobCancelled` |
//!
//! A settled handle never becomes pending again.

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};

/// Identifier of one submission, unique per backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<backend>-<seq>`, the form handed out by backends that number
    /// their submissions.
    pub fn sequenced(backend: &str, seq: u64) -> Self {
        Self(format!("{backend}-{seq}"))
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a submission stands on its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandleStatus {
    /// Accepted, not started.
    Queued,
    /// Executing on the device.
    Running,
    /// Results are ready to fetch.
    Completed,
    /// The backend gave up on the submission.
    Failed(String),
    /// Withdrawn before completion.
    Cancelled,
}

impl HandleStatus {
    /// `None` while the submission is pending; otherwise `Ok` when results
    /// can be fetched and the matching error when they never will be.
    pub fn settled(&self) -> Option<ExecResult<()>> {
        match self {
            HandleStatus::Queued | HandleStatus::Running => None,
            HandleStatus::Completed => Some(Ok(())),
            HandleStatus::Failed(reason) => Some(Err(ExecError::JobFailed(reason.clone()))),
            HandleStatus::Cancelled => Some(Err(ExecError::JobCancelled)),
        }
    }
}

impl std::fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleStatus::Queued => f.write_str("QUEUED"),
            HandleStatus::Running => f.write_str("RUNNING"),
            HandleStatus::Completed => f.write_str("COMPLETED"),
            HandleStatus::Failed(reason) => write!(f, "FAILED ({reason})"),
            HandleStatus::Cancelled => f.write_str("CANCELLED"),
        }
    }
}
