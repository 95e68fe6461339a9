//! Units of work.
//!
//! A [`Job`] pairs one task with a shot count and a configuration bag. Jobs
//! are immutable once built: the configuration is copied in at construction,
//! so later edits to the caller's map never leak into a dispatched job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-job configuration forwarded to the backend on submission.
///
/// The executor only ever looks at the `seed` key; everything else is opaque.
pub type Configuration = serde_json::Map<String, serde_json::Value>;

/// One task instance bound for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct Job<C> {
    id: String,
    task: C,
    shots: u32,
    configuration: Configuration,
    created_at: DateTime<Utc>,
}

impl<C> Job<C> {
    /// Create a job with a freshly generated id.
    pub fn new(task: C, shots: u32, configuration: &Configuration) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), task, shots, configuration)
    }

    /// Create a job keeping `id` verbatim.
    pub fn with_id(id: impl Into<String>, task: C, shots: u32, configuration: &Configuration) -> Self {
        Self {
            id: id.into(),
            task,
            shots,
            configuration: configuration.clone(),
            created_at: Utc::now(),
        }
    }

    /// Caller-supplied or generated (UUID v4) identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The task submitted to the backend.
    pub fn task(&self) -> &C {
        &self.task
    }

    /// Repetitions requested for the task.
    pub fn shots(&self) -> u32 {
        self.shots
    }

    /// The job's own copy of the configuration it was built with.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// When the job was constructed.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Submission seed taken from `configuration["seed"]`, if it is an integer.
    pub fn seed(&self) -> Option<i64> {
        self.configuration.get("seed").and_then(serde_json::Value::as_i64)
    }
}

impl<C> From<JobRecord<C>> for Job<C> {
    fn from(record: JobRecord<C>) -> Self {
        let JobRecord {
            id,
            task,
            shots,
            configuration,
        } = record;
        match id {
            Some(id) => Job::with_id(id, task, shots, &configuration),
            None => Job::new(task, shots, &configuration),
        }
    }
}

impl<C> std::fmt::Display for Job<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job(id={}, shots={})", self.id, self.shots)
    }
}

/// Serialized form of a job, as found in nested dispatch records.
///
/// `id` is generated when absent and `configuration` defaults to empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord<C> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub task: C,
    pub shots: u32,
    #[serde(default)]
    pub configuration: Configuration,
}

impl<C> JobRecord<C> {
    pub fn new(task: C, shots: u32) -> Self {
        Self {
            id: None,
            task,
            shots,
            configuration: Configuration::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }
}
