//! Run one experiment on the local provider plus a hand-written mock
//! provider, sequentially and on the worker pool.
//!
//! `RUST_LOG=quantum_executor=debug cargo run` shows the executor's logs.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use quantum_executor::{
    Backend, BackendStatus, BackendsMap, Circuit, Configuration, ExecError, ExecResult,
    ExecutionResult, Executor, ExecutorConfig, Experiment, HandleStatus, JobHandle,
    MergedResultCollector, Provider, ProviderCatalog, ProviderOptions, RunOptions, Tasks,
    Counts, validate_run_args,
};
use tracing_subscriber::EnvFilter;

/// Backend that answers half all-zeros, half all-ones, instantly.
struct MockBackend {
    jobs: Mutex<Vec<Vec<ExecutionResult>>>,
}

#[async_trait]
impl Backend<Circuit> for MockBackend {
    fn name(&self) -> &str {
        "mock-simulator"
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::Online
    }

    async fn submit(
        &self,
        tasks: &[Circuit],
        shots: Option<i64>,
        seed: Option<i64>,
        _: &Configuration,
    ) -> ExecResult<JobHandle> {
        let shots = validate_run_args(shots, seed)?;
        let results = tasks
            .iter()
            .map(|circuit| {
                let width = circuit.num_qubits as usize;
                let mut counts = Counts::new();
                counts.insert("0".repeat(width), u64::from(shots / 2));
                counts.insert("1".repeat(width), u64::from(shots - shots / 2));
                ExecutionResult::new(counts, shots).with_execution_time(42)
            })
            .collect();

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.push(results);
        Ok(JobHandle::new(format!("mock-{}", jobs.len())))
    }

    async fn job_status(&self, _: &JobHandle) -> ExecResult<HandleStatus> {
        Ok(HandleStatus::Completed)
    }

    async fn result(&self, handle: &JobHandle) -> ExecResult<Vec<ExecutionResult>> {
        let index = handle
            .id()
            .strip_prefix("mock-")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| ExecError::NotFound(format!("Job '{handle}' not found")))?;
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        index
            .checked_sub(1)
            .and_then(|i| jobs.get(i))
            .cloned()
            .ok_or_else(|| ExecError::NotFound(format!("Job '{handle}' not found")))
    }
}

struct MockProvider {
    backend: Arc<MockBackend>,
}

impl Provider<Circuit> for MockProvider {
    fn get_backend(&self, name: &str) -> ExecResult<Arc<dyn Backend<Circuit>>> {
        if name == self.backend.name() {
            Ok(self.backend.clone() as Arc<dyn Backend<Circuit>>)
        } else {
            Err(ExecError::NotFound(format!("Device '{name}' not found in mock backends")))
        }
    }

    fn get_backends(&self) -> ExecResult<Vec<Arc<dyn Backend<Circuit>>>> {
        Ok(vec![self.backend.clone() as Arc<dyn Backend<Circuit>>])
    }
}

fn report(label: &str, merged: &MergedResultCollector<Circuit>) -> Result<(), Box<dyn std::error::Error>> {
    println!("== {label}: {} jobs", merged.collector().total_jobs());
    let Some(value) = merged.get_merged_results() else {
        println!("   (no merged results)");
        return Ok(());
    };
    let per_task: Vec<Option<ExecutionResult>> = serde_json::from_value(value)?;
    for (index, result) in per_task.iter().enumerate() {
        let Some(result) = result else {
            println!("   task {index}: every job failed");
            continue;
        };
        println!("   task {index}: {} shots", result.shots);
        for (bitstring, count) in result.counts.sorted().into_iter().take(4) {
            println!("     {bitstring}: {count}");
        }
        if let Some((bitstring, prob)) = result.most_frequent() {
            println!("     most frequent: {bitstring} ({:.1}%)", prob * 100.0);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let catalog = ProviderCatalog::with_local().with_factory("mock", |_| {
        let backend = Arc::new(MockBackend {
            jobs: Mutex::new(Vec::new()),
        });
        Ok(Arc::new(MockProvider { backend }) as Arc<dyn Provider<Circuit>>)
    });
    let options = ProviderOptions::default().with_info("local", serde_json::json!({"latency_ms": 20}));
    let executor = Executor::from_catalog(&catalog, &options, ExecutorConfig::default().with_max_workers(4))?;

    let backends = BackendsMap::new()
        .with("local", ["simulator", "noisy_simulator"])
        .with("mock", ["mock-simulator"]);
    let circuits = vec![
        Circuit::new(2).with_gate("h").with_gate("cx"),
        Circuit::new(3).with_gate("h").with_gate("cx").with_gate("cx"),
    ];
    let experiment = Experiment::new(Tasks::Batch(circuits), [1000, 600], backends, "uniform")
        .with_split_data(serde_json::json!({"configuration": {"seed": 7}}));

    let merged = executor
        .run_experiment(experiment.clone(), RunOptions::sequential())
        .await?;
    report("sequential", &merged)?;

    let merged = executor
        .run_experiment(experiment, RunOptions::parallel(false))
        .await?;
    println!("{merged}");
    merged.wait_for_completion(None).await;
    report("parallel", &merged)?;

    Ok(())
}
