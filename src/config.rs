//! Executor and run configuration.
//!
//! ```toml
//! policies_dir = "/var/lib/quantum-executor/policies"
//! raise_exc = true
//! max_workers = 8
//! default_timeout_secs = 600
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecError, ExecResult};

/// Executor-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Where loaded policy units are persisted and picked up from.
    pub policies_dir: Option<PathBuf>,
    /// Propagate initialization, import and submission errors instead of
    /// logging and continuing.
    pub raise_exc: bool,
    /// Upper bound on concurrent workers in parallel mode.
    pub max_workers: Option<usize>,
    /// Wait bound applied when a parallel run waits without its own timeout.
    pub default_timeout_secs: Option<u64>,
}

impl ExecutorConfig {
    pub fn from_toml_str(text: &str) -> ExecResult<Self> {
        toml::from_str(text).map_err(|e| ExecError::Configuration(e.to_string()))
    }

    pub fn with_policies_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.policies_dir = Some(dir.into());
        self
    }

    pub fn raise_exc(mut self, raise_exc: bool) -> Self {
        self.raise_exc = raise_exc;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    /// Worker pool size: the configured bound, else available parallelism.
    pub fn worker_count(&self) -> usize {
        self.max_workers
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1)
            .max(1)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }
}

/// How one dispatch is executed.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Run jobs on the worker pool instead of one after another.
    pub multiprocess: bool,
    /// Return only once every job has reported (parallel mode).
    pub wait: bool,
    /// Bound on waiting; falls back to `default_timeout_secs`.
    pub timeout: Option<Duration>,
    /// Merge policy applied once the collector completes.
    pub merge_policy: Option<String>,
    /// Initial policy data handed to the merge.
    pub merge_data: Option<Value>,
}

impl RunOptions {
    /// Sequential, waiting, no merge.
    pub fn sequential() -> Self {
        Self {
            wait: true,
            ..Self::default()
        }
    }

    /// Worker pool; `wait` decides whether the call returns before completion.
    pub fn parallel(wait: bool) -> Self {
        Self {
            multiprocess: true,
            wait,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_merge(mut self, policy: impl Into<String>, data: Option<Value>) -> Self {
        self.merge_policy = Some(policy.into());
        self.merge_data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert!(!config.raise_exc);
        assert!(config.policies_dir.is_none());
        assert!(config.worker_count() >= 1);
        assert_eq!(ExecutorConfig::default().with_max_workers(0).worker_count(), 1);
    }

    #[test]
    fn test_from_toml() {
        let config = ExecutorConfig::from_toml_str(
            r#"
            policies_dir = "/tmp/policies"
            raise_exc = true
            max_workers = 3
            default_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.policies_dir, Some(PathBuf::from("/tmp/policies")));
        assert!(config.raise_exc);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(60)));

        assert_eq!(ExecutorConfig::from_toml_str("").unwrap(), ExecutorConfig::default());
        let err = ExecutorConfig::from_toml_str("workers = 3").unwrap_err();
        assert!(matches!(err, ExecError::Configuration(_)));
    }

    #[test]
    fn test_run_options() {
        let options = RunOptions::parallel(false).with_merge("uniform", None);
        assert!(options.multiprocess);
        assert!(!options.wait);
        assert_eq!(options.merge_policy.as_deref(), Some("uniform"));
        assert!(RunOptions::sequential().wait);
    }
}
