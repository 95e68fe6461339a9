//! In-process reference provider.
//!
//! [`LocalSimulator`] samples GHZ-style measurement counts for any task that
//! knows its qubit count. It is deterministic for a given seed, can add
//! readout noise, and can pretend to be slow so that non-blocking runs have
//! something to wait for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{Backend, BackendStatus, INVALID_RUN_INPUT, validate_run_args};
use crate::error::{ExecError, ExecResult};
use crate::handle::{HandleStatus, JobHandle};
use crate::job::Configuration;
use crate::provider::{Provider, ProviderCatalog};
use crate::result::{Counts, ExecutionResult};

/// Catalog name of the local provider.
pub const LOCAL_PROVIDER: &str = "local";

/// Tasks the local simulator can run.
pub trait Sampleable: Send + Sync + 'static {
    fn num_qubits(&self) -> u32;

    /// Reject malformed tasks before anything is sampled.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Minimal circuit description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    pub num_qubits: u32,
    #[serde(default)]
    pub gates: Vec<String>,
}

impl Circuit {
    pub fn new(num_qubits: u32) -> Self {
        Self {
            num_qubits,
            gates: Vec::new(),
        }
    }

    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gates.push(gate.into());
        self
    }
}

impl Sampleable for Circuit {
    fn num_qubits(&self) -> u32 {
        self.num_qubits
    }

    fn validate(&self) -> Result<(), String> {
        if self.num_qubits == 0 {
            return Err("circuit has no qubits".into());
        }
        if self.gates.iter().any(|g| g.trim().is_empty()) {
            return Err("circuit contains an unnamed gate".into());
        }
        Ok(())
    }
}

struct LocalJob {
    ready_at: Instant,
    results: Vec<ExecutionResult>,
}

/// In-memory simulator backend.
pub struct LocalSimulator {
    name: String,
    status: BackendStatus,
    readout_error: f64,
    latency: Duration,
    failure: Option<String>,
    jobs: Mutex<FxHashMap<String, LocalJob>>,
    next_id: AtomicU64,
}

impl LocalSimulator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BackendStatus::Online,
            readout_error: 0.0,
            latency: Duration::ZERO,
            failure: None,
            jobs: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Probability of flipping each measured bit.
    pub fn with_readout_error(mut self, probability: f64) -> Self {
        self.readout_error = probability.clamp(0.0, 1.0);
        self
    }

    /// Jobs report `Running` until `latency` has elapsed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_status(mut self, status: BackendStatus) -> Self {
        self.status = status;
        self
    }

    /// Every submitted job ends `Failed(reason)`.
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Submissions whose results have not been handed out yet.
    pub fn open_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn sample(&self, num_qubits: u32, shots: u32, readout_error: f64, rng: &mut StdRng) -> Counts {
        let width = num_qubits as usize;
        let mut counts = Counts::new();
        for _ in 0..shots {
            let base = rng.random_bool(0.5);
            let bits: String = (0..width)
                .map(|_| {
                    let flipped = readout_error > 0.0 && rng.random_bool(readout_error);
                    if base ^ flipped { '1' } else { '0' }
                })
                .collect();
            counts.insert(bits, 1);
        }
        counts
    }
}

#[async_trait]
impl<C: Sampleable> Backend<C> for LocalSimulator {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> BackendStatus {
        self.status
    }

    async fn submit(
        &self,
        tasks: &[C],
        shots: Option<i64>,
        seed: Option<i64>,
        configuration: &Configuration,
    ) -> ExecResult<JobHandle> {
        let shots = validate_run_args(shots, seed)?;
        if tasks.is_empty() {
            return Err(ExecError::InvalidArgument(format!("{INVALID_RUN_INPUT}: no tasks")));
        }
        for task in tasks {
            task.validate()
                .map_err(|reason| ExecError::InvalidArgument(format!("{INVALID_RUN_INPUT}: {reason}")))?;
        }

        let readout_error = configuration
            .get("readout_error")
            .and_then(serde_json::Value::as_f64)
            .map_or(self.readout_error, |p| p.clamp(0.0, 1.0));
        // Non-negative, checked by validate_run_args.
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.unsigned_abs()),
            None => StdRng::seed_from_u64(rand::random()),
        };

        let started = std::time::Instant::now();
        let results = tasks
            .iter()
            .map(|task| {
                let counts = self.sample(task.num_qubits(), shots, readout_error, &mut rng);
                ExecutionResult::new(counts, shots)
            })
            .collect::<Vec<_>>();
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let results = results
            .into_iter()
            .map(|r| {
                r.with_execution_time(elapsed)
                    .with_metadata(serde_json::json!({ "backend": self.name }))
            })
            .collect();

        let handle = JobHandle::sequenced(&self.name, self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(
            handle.id().to_string(),
            LocalJob {
                ready_at: Instant::now() + self.latency,
                results,
            },
        );
        debug!(backend = %self.name, %handle, shots, "local job accepted");
        Ok(handle)
    }

    async fn job_status(&self, handle: &JobHandle) -> ExecResult<HandleStatus> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get(handle.id())
            .ok_or_else(|| ExecError::NotFound(format!("Job '{handle}' not found")))?;
        if Instant::now() < job.ready_at {
            return Ok(HandleStatus::Running);
        }
        match &self.failure {
            Some(reason) => {
                // A failed job has no results to fetch.
                jobs.remove(handle.id());
                Ok(HandleStatus::Failed(reason.clone()))
            }
            None => Ok(HandleStatus::Completed),
        }
    }

    /// Hands the results out once; the handle is forgotten afterwards.
    async fn result(&self, handle: &JobHandle) -> ExecResult<Vec<ExecutionResult>> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get(handle.id())
            .ok_or_else(|| ExecError::NotFound(format!("Job '{handle}' not found")))?;
        if Instant::now() < job.ready_at {
            return Err(ExecError::JobFailed(format!("job {handle} has not completed yet")));
        }
        let job = jobs.remove(handle.id());
        if let Some(reason) = &self.failure {
            return Err(ExecError::JobFailed(reason.clone()));
        }
        Ok(job.map(|job| job.results).unwrap_or_default())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}

impl std::fmt::Display for LocalSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalSimulator('{}')", self.name)
    }
}

/// Provider serving [`LocalSimulator`] devices.
pub struct LocalProvider {
    backends: Vec<Arc<LocalSimulator>>,
}

impl LocalProvider {
    /// Ideal `simulator` and a `noisy_simulator` with 2% readout error.
    pub fn new() -> Self {
        Self::empty()
            .with_backend(LocalSimulator::new("simulator"))
            .with_backend(LocalSimulator::new("noisy_simulator").with_readout_error(0.02))
    }

    pub fn empty() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn with_backend(mut self, backend: LocalSimulator) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    fn find(&self, name: &str) -> Option<&Arc<LocalSimulator>> {
        self.backends.iter().find(|b| b.name == name)
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Sampleable> Provider<C> for LocalProvider {
    fn get_backend(&self, name: &str) -> ExecResult<Arc<dyn Backend<C>>> {
        let backend = self.find(name).ok_or_else(|| {
            ExecError::NotFound(format!("Device '{name}' not found in local backends"))
        })?;
        Ok(backend.clone() as Arc<dyn Backend<C>>)
    }

    fn get_backends(&self) -> ExecResult<Vec<Arc<dyn Backend<C>>>> {
        Ok(self
            .backends
            .iter()
            .map(|b| b.clone() as Arc<dyn Backend<C>>)
            .collect())
    }
}

impl<C: Sampleable> ProviderCatalog<C> {
    /// Catalog containing the local provider.
    ///
    /// Its `providers_info` entry may set `latency_ms` for every device.
    pub fn with_local() -> Self {
        Self::new().with_factory(LOCAL_PROVIDER, |info| {
            let latency = info
                .and_then(|v| v.get("latency_ms"))
                .and_then(serde_json::Value::as_u64)
                .map(Duration::from_millis)
                .unwrap_or_default();
            let provider = LocalProvider::empty()
                .with_backend(LocalSimulator::new("simulator").with_latency(latency))
                .with_backend(
                    LocalSimulator::new("noisy_simulator")
                        .with_readout_error(0.02)
                        .with_latency(latency),
                );
            Ok(Arc::new(provider) as Arc<dyn Provider<C>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bell() -> Circuit {
        Circuit::new(2).with_gate("h").with_gate("cx")
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let sim = LocalSimulator::new("simulator");
        let handle = Backend::<Circuit>::submit(&sim, &[bell()], Some(100), Some(42), &Configuration::new())
            .await
            .unwrap();
        assert!(handle.id().starts_with("simulator-"));

        let results = Backend::<Circuit>::wait(&sim, &handle).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].shots, 100);
        assert_eq!(results[0].counts.total_shots(), 100);
        assert_eq!(results[0].counts.get("00") + results[0].counts.get("11"), 100);
    }

    #[tokio::test]
    async fn test_seed_is_deterministic() {
        let sim = LocalSimulator::new("simulator").with_readout_error(0.1);
        let cfg = Configuration::new();
        let a = Backend::<Circuit>::submit(&sim, &[bell(), Circuit::new(3)], Some(200), Some(7), &cfg)
            .await
            .unwrap();
        let b = Backend::<Circuit>::submit(&sim, &[bell(), Circuit::new(3)], Some(200), Some(7), &cfg)
            .await
            .unwrap();
        assert_ne!(a, b);

        let a = Backend::<Circuit>::result(&sim, &a).await.unwrap();
        let b = Backend::<Circuit>::result(&sim, &b).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].counts, b[0].counts);
        assert_eq!(a[1].counts, b[1].counts);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_arguments() {
        let sim = LocalSimulator::new("simulator");
        let cfg = Configuration::new();

        let err = Backend::<Circuit>::submit(&sim, &[bell()], None, None, &cfg).await.unwrap_err();
        assert!(err.to_string().contains("shots must be specified"));

        let err = Backend::<Circuit>::submit(&sim, &[bell()], Some(0), None, &cfg).await.unwrap_err();
        assert!(err.to_string().contains("shots must be a positive integer"));

        let err = Backend::<Circuit>::submit(&sim, &[bell()], Some(-5), None, &cfg).await.unwrap_err();
        assert!(err.to_string().contains("shots must be a positive integer"));

        let err = Backend::<Circuit>::submit(&sim, &[bell()], Some(100), Some(-1), &cfg).await.unwrap_err();
        assert!(err.to_string().contains("seed must be a non-negative integer"));

        let err = Backend::<Circuit>::submit(&sim, &[bell(), Circuit::new(0)], Some(10), None, &cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid run_input"));
    }

    #[tokio::test]
    async fn test_latency_and_failure() {
        let sim = LocalSimulator::new("slow").with_latency(Duration::from_millis(50));
        let handle = Backend::<Circuit>::submit(&sim, &[bell()], Some(10), None, &Configuration::new())
            .await
            .unwrap();
        assert_eq!(
            Backend::<Circuit>::job_status(&sim, &handle).await.unwrap(),
            HandleStatus::Running
        );
        assert!(Backend::<Circuit>::wait(&sim, &handle).await.is_ok());

        let broken = LocalSimulator::new("broken").with_failure("calibration lost");
        let handle = Backend::<Circuit>::submit(&broken, &[bell()], Some(10), None, &Configuration::new())
            .await
            .unwrap();
        let err = Backend::<Circuit>::wait(&broken, &handle).await.unwrap_err();
        assert_eq!(err.to_string(), "Job failed: calibration lost");
        assert_eq!(broken.open_jobs(), 0);
    }

    #[tokio::test]
    async fn test_results_are_handed_out_once() {
        let sim = LocalSimulator::new("simulator");
        let cfg = Configuration::new();
        for _ in 0..3 {
            let handle = Backend::<Circuit>::submit(&sim, &[bell()], Some(10), None, &cfg)
                .await
                .unwrap();
            Backend::<Circuit>::wait(&sim, &handle).await.unwrap();
            let err = Backend::<Circuit>::result(&sim, &handle).await.unwrap_err();
            assert!(err.is_lookup(), "{err}");
        }
        assert_eq!(sim.open_jobs(), 0);
    }

    #[test]
    fn test_provider_lookup() {
        let provider = LocalProvider::new();
        let sim = Provider::<Circuit>::get_backend(&provider, "simulator").unwrap();
        assert_eq!(sim.status(), BackendStatus::Online);
        assert_eq!(Provider::<Circuit>::get_backends(&provider).unwrap().len(), 2);

        let err = Provider::<Circuit>::get_backend(&provider, "non_existent_device").err().unwrap();
        assert!(err.to_string().contains("Device 'non_existent_device' not found"));
        assert_eq!(LocalSimulator::new("simulator").to_string(), "LocalSimulator('simulator')");
    }
}
