//! The orchestrator.
//!
//! ```text
//!   generate_dispatch ──→ Dispatch ──→ run_dispatch ──→ MergedResultCollector
//!   (validate + split)                (resolve, submit,     (merge once
//!                                      collect)              complete)
//! ```
//!
//! Sequential runs submit job after job and return a complete collector.
//! Parallel runs hand the jobs to a worker pool; with `wait = false` the
//! collector is returned while it is still being filled and the merge is
//! deferred until completion is observed.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::collector::{MergedResultCollector, ResultCollector};
use crate::config::{ExecutorConfig, RunOptions};
use crate::dispatch::{Dispatch, Shots, Tasks, validate_shape};
use crate::error::{ExecError, ExecResult};
use crate::job::Job;
use crate::nested::Nested;
use crate::policies;
use crate::policy::{BackendsMap, MergeFn, PolicyRegistry, SplitFn};
use crate::provider::{ProviderCatalog, ProviderOptions, VirtualProvider};
use crate::result::JobOutcome;
use crate::worker::{WorkItem, fan_out, submit_and_wait};

/// A split / run / merge request.
#[derive(Debug, Clone)]
pub struct Experiment<C> {
    pub tasks: Tasks<C>,
    pub shots: Shots,
    pub backends: BackendsMap,
    pub split_policy: String,
    /// Defaults to the split policy name.
    pub merge_policy: Option<String>,
    pub split_data: Option<Value>,
}

impl<C> Experiment<C> {
    pub fn new(
        tasks: impl Into<Tasks<C>>,
        shots: impl Into<Shots>,
        backends: BackendsMap,
        split_policy: impl Into<String>,
    ) -> Self {
        Self {
            tasks: tasks.into(),
            shots: shots.into(),
            backends,
            split_policy: split_policy.into(),
            merge_policy: None,
            split_data: None,
        }
    }

    pub fn with_merge_policy(mut self, name: impl Into<String>) -> Self {
        self.merge_policy = Some(name.into());
        self
    }

    pub fn with_split_data(mut self, data: Value) -> Self {
        self.split_data = Some(data);
        self
    }

    fn merge_policy(&self) -> &str {
        self.merge_policy.as_deref().unwrap_or(&self.split_policy)
    }
}

/// Jobs bound for one resolved backend.
struct Route<C> {
    provider: String,
    backend_name: String,
    backend: Arc<dyn Backend<C>>,
    jobs: Vec<Job<C>>,
}

/// Splits requests into dispatches, runs them and merges their results.
pub struct Executor<C> {
    provider: VirtualProvider<C>,
    policies: PolicyRegistry<C>,
    config: ExecutorConfig,
}

impl<C> Executor<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Build an executor over `provider`.
    ///
    /// The built-in policies are registered first, then every policy unit
    /// found in `config.policies_dir`.
    pub fn new(provider: VirtualProvider<C>, config: ExecutorConfig) -> ExecResult<Self> {
        let mut registry = PolicyRegistry::new();
        policies::register_builtin(&mut registry);
        if let Some(dir) = &config.policies_dir {
            let loaded = registry.load_dir(dir, config.raise_exc)?;
            if !loaded.is_empty() {
                info!(dir = %dir.display(), policies = ?loaded, "policy units loaded");
            }
        }
        info!(
            providers = ?provider.provider_names(),
            policies = registry.names().len(),
            "executor ready"
        );
        Ok(Self {
            provider,
            policies: registry,
            config,
        })
    }

    /// Initialize providers from `catalog`, then build the executor.
    pub fn from_catalog(
        catalog: &ProviderCatalog<C>,
        options: &ProviderOptions,
        config: ExecutorConfig,
    ) -> ExecResult<Self> {
        let provider = VirtualProvider::new(catalog, options)?;
        Self::new(provider, config)
    }

    pub fn virtual_provider(&self) -> &VirtualProvider<C> {
        &self.provider
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Register `name`, replacing any previous pair with that name.
    pub fn add_policy<S, M>(&mut self, name: impl Into<String>, split: S, merge: M)
    where
        S: Fn(Tasks<C>, Shots, &BackendsMap, Value, &VirtualProvider<C>) -> ExecResult<(Dispatch<C>, Value)>
            + Send
            + Sync
            + 'static,
        M: Fn(&Nested<JobOutcome>, Value) -> ExecResult<(Value, Value)> + Send + Sync + 'static,
    {
        self.policies.add_policy(name, split, merge);
    }

    /// Load a policy unit and persist it into the policies directory.
    ///
    /// With `raise_exc = false` a broken unit is logged and `Ok(None)` is
    /// returned, independently of the executor-wide setting.
    pub fn add_policy_from_file(&mut self, path: impl AsRef<Path>, raise_exc: bool) -> ExecResult<Option<String>> {
        self.policies
            .add_policy_from_file(path.as_ref(), self.config.policies_dir.as_deref(), raise_exc)
    }

    pub fn get_split_policy(&self, name: &str) -> ExecResult<SplitFn<C>> {
        self.policies.get_split_policy(name)
    }

    pub fn get_merge_policy(&self, name: &str) -> ExecResult<MergeFn> {
        self.policies.get_merge_policy(name)
    }

    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.names()
    }

    /// Validate the request and route it with `split_policy`.
    ///
    /// The shape is checked before the policy runs, so malformed requests
    /// never reach user code. `split_data` defaults to an empty object.
    pub fn generate_dispatch(
        &self,
        tasks: impl Into<Tasks<C>>,
        shots: impl Into<Shots>,
        backends: &BackendsMap,
        split_policy: &str,
        split_data: Option<Value>,
    ) -> ExecResult<(Dispatch<C>, Value)> {
        let split = self.policies.get_split_policy(split_policy)?;
        let (tasks, shots) = (tasks.into(), shots.into());
        let requested = validate_shape(&tasks, &shots)?;

        let data = split_data.unwrap_or_else(|| Value::Object(Map::new()));
        let (dispatch, data) = split(tasks, shots, backends, data, &self.provider)?;
        debug!(
            policy = split_policy,
            requested,
            jobs = dispatch.len(),
            "dispatch generated"
        );
        Ok((dispatch, data))
    }

    /// Submit every job of `dispatch` and collect the outcomes.
    ///
    /// When `options.merge_policy` is set, the merge runs once the collector
    /// completes, seeded with `options.merge_data` (default `{}`).
    pub async fn run_dispatch(
        &self,
        dispatch: Dispatch<C>,
        options: RunOptions,
    ) -> ExecResult<MergedResultCollector<C>> {
        let collector = ResultCollector::new();
        let merged = match options.merge_policy.as_deref() {
            Some(name) => {
                let merge = self.policies.get_merge_policy(name)?;
                let data = options
                    .merge_data
                    .clone()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                MergedResultCollector::with_policy(collector.clone(), merge, data)
            }
            None => MergedResultCollector::new(collector.clone()),
        };

        if dispatch.is_empty() {
            debug!("empty dispatch");
            merged.try_merge()?;
            return Ok(merged);
        }

        let routes = self.resolve(dispatch)?;
        if options.multiprocess {
            self.run_parallel(routes, merged, &options).await
        } else {
            self.run_sequential(routes, merged).await
        }
    }

    /// Generate a dispatch for `experiment`, run it and merge the results.
    ///
    /// The policy data returned by the split seeds the merge and is what
    /// [`get_initial_policy_data`](MergedResultCollector::get_initial_policy_data)
    /// reports.
    pub async fn run_experiment(
        &self,
        experiment: Experiment<C>,
        options: RunOptions,
    ) -> ExecResult<MergedResultCollector<C>> {
        let merge_policy = experiment.merge_policy().to_string();
        let (dispatch, data) = self.generate_dispatch(
            experiment.tasks,
            experiment.shots,
            &experiment.backends,
            &experiment.split_policy,
            experiment.split_data,
        )?;
        let options = RunOptions {
            merge_policy: Some(merge_policy),
            merge_data: Some(data),
            ..options
        };
        self.run_dispatch(dispatch, options).await
    }

    fn resolve(&self, dispatch: Dispatch<C>) -> ExecResult<Vec<Route<C>>> {
        let mut routes = Vec::new();
        for (provider, backend_name, jobs) in dispatch.into_nested().into_buckets() {
            match self.provider.get_backend(&provider, &backend_name, true) {
                Ok(backend) => routes.push(Route {
                    provider,
                    backend_name,
                    backend,
                    jobs,
                }),
                Err(e) if self.config.raise_exc => return Err(e),
                Err(e) => {
                    error!(
                        provider = %provider,
                        backend = %backend_name,
                        skipped = jobs.len(),
                        "Unable to resolve backend: {e}"
                    );
                }
            }
        }
        Ok(routes)
    }

    async fn run_sequential(
        &self,
        routes: Vec<Route<C>>,
        merged: MergedResultCollector<C>,
    ) -> ExecResult<MergedResultCollector<C>> {
        let collector = merged.collector();
        for route in routes {
            for job in route.jobs {
                let job = Arc::new(job);
                let outcome = match submit_and_wait(route.backend.as_ref(), &job).await {
                    Ok(result) => JobOutcome::Success(result),
                    Err(e) if self.config.raise_exc => return Err(e),
                    Err(e) => {
                        warn!(
                            provider = %route.provider,
                            backend = %route.backend_name,
                            job_id = job.id(),
                            "job failed: {e}"
                        );
                        JobOutcome::failure(e)
                    }
                };
                collector.push_completed(&route.provider, &route.backend_name, job, outcome);
            }
        }
        info!(jobs = collector.total_jobs(), "sequential run finished");

        match merged.try_merge() {
            Err(e) if self.config.raise_exc => Err(e),
            _ => Ok(merged),
        }
    }

    async fn run_parallel(
        &self,
        routes: Vec<Route<C>>,
        merged: MergedResultCollector<C>,
        options: &RunOptions,
    ) -> ExecResult<MergedResultCollector<C>> {
        let collector = merged.collector().clone();
        let mut items = Vec::new();
        for route in routes {
            for job in route.jobs {
                let job = Arc::new(job);
                let slot = collector.pending(&route.provider, &route.backend_name, job.clone());
                items.push(WorkItem {
                    provider: route.provider.clone(),
                    backend_name: route.backend_name.clone(),
                    slot,
                    job,
                    backend: route.backend.clone(),
                });
            }
        }
        if items.is_empty() {
            merged.try_merge()?;
            return Ok(merged);
        }

        let workers = self.config.worker_count();
        info!(jobs = items.len(), workers, "parallel run started");
        let ingest = fan_out(items, merged.clone(), workers);
        if !options.wait {
            return Ok(merged);
        }

        let finished = match options.timeout.or_else(|| self.config.default_timeout()) {
            Some(limit) => tokio::time::timeout(limit, ingest).await.ok(),
            None => Some(ingest.await),
        };
        match finished {
            None => {
                warn!(
                    complete = collector.complete_jobs(),
                    total = collector.total_jobs(),
                    "timed out waiting for workers"
                );
                return Ok(merged);
            }
            Some(Err(e)) => error!("ingest task failed: {e}"),
            Some(Ok(())) => {}
        }

        if self.config.raise_exc {
            if let Some((provider, backend, reason)) = collector.first_failure() {
                return Err(ExecError::Submission(format!(
                    "job on {provider}/{backend} failed: {reason}"
                )));
            }
            if let Some(reason) = merged.merge_error() {
                return Err(ExecError::JobFailed(format!("merge policy failed: {reason}")));
            }
        }
        Ok(merged)
    }
}
