//! Result collection and completion tracking.
//!
//! A [`ResultCollector`] mirrors the shape of the dispatch it was built from,
//! holding one [`JobResult`] per job. It is a cheap, cloneable handle: the
//! executor's ingest path writes into it while callers read or wait on it.
//!
//! ```text
//!   pending ──record()──→ complete
//! ```
//!
//! A [`MergedResultCollector`] wraps a collector and runs the merge policy
//! exactly once, the first time completion is observed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::ExecResult;
use crate::job::Job;
use crate::nested::Nested;
use crate::policy::MergeFn;
use crate::result::JobOutcome;

/// One job and its outcome, once known.
#[derive(Debug)]
pub struct JobResult<C> {
    job: Arc<Job<C>>,
    data: Option<JobOutcome>,
    completed_at: Option<DateTime<Utc>>,
}

impl<C> Clone for JobResult<C> {
    fn clone(&self) -> Self {
        Self {
            job: self.job.clone(),
            data: self.data.clone(),
            completed_at: self.completed_at,
        }
    }
}

impl<C> JobResult<C> {
    /// A submitted job whose outcome is not yet available.
    pub fn pending(job: Arc<Job<C>>) -> Self {
        Self {
            job,
            data: None,
            completed_at: None,
        }
    }

    pub fn completed(job: Arc<Job<C>>, outcome: JobOutcome) -> Self {
        let mut result = Self::pending(job);
        result.complete_with(outcome);
        result
    }

    fn complete_with(&mut self, outcome: JobOutcome) {
        self.data = Some(outcome);
        self.completed_at = Some(Utc::now());
    }

    pub fn job(&self) -> &Job<C> {
        &self.job
    }

    pub fn data(&self) -> Option<&JobOutcome> {
        self.data.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.data.is_some()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl<C> std::fmt::Display for JobResult<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_complete() { "Complete" } else { "Pending" };
        write!(f, "JobResult(job_id={}, status={status})", self.job.id())
    }
}

struct Jobs<C> {
    results: Nested<JobResult<C>>,
    total: usize,
    complete: usize,
}

impl<C> Jobs<C> {
    fn is_complete(&self) -> bool {
        self.complete == self.total
    }
}

struct Shared<C> {
    jobs: Mutex<Jobs<C>>,
    done: watch::Sender<bool>,
}

/// Per-job results of one run, shaped like its dispatch.
pub struct ResultCollector<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ResultCollector<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> Default for ResultCollector<C> {
    fn default() -> Self {
        let (done, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(Jobs {
                    results: Nested::new(),
                    total: 0,
                    complete: 0,
                }),
                done,
            }),
        }
    }
}

impl<C> ResultCollector<C> {
    /// An empty collector, complete by definition.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Jobs<C>> {
        self.shared.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, jobs: &Jobs<C>) {
        self.shared.done.send_replace(jobs.is_complete());
    }

    /// Add a pending entry for `job`, returning its slot in the bucket.
    pub(crate) fn pending(&self, provider: &str, backend: &str, job: Arc<Job<C>>) -> usize {
        let mut jobs = self.lock();
        let slot = jobs.results.push(provider, backend, JobResult::pending(job));
        jobs.total += 1;
        self.publish(&jobs);
        slot
    }

    /// Add an entry that is already complete.
    pub(crate) fn push_completed(&self, provider: &str, backend: &str, job: Arc<Job<C>>, outcome: JobOutcome) {
        let mut jobs = self.lock();
        jobs.results
            .push(provider, backend, JobResult::completed(job, outcome));
        jobs.total += 1;
        jobs.complete += 1;
        self.publish(&jobs);
    }

    /// Complete the pending entry at `slot`.
    ///
    /// Returns `false`, leaving the collector untouched, when the slot does
    /// not exist or already holds an outcome.
    pub(crate) fn record(&self, provider: &str, backend: &str, slot: usize, outcome: JobOutcome) -> bool {
        let mut jobs = self.lock();
        let Some(entry) = jobs
            .results
            .bucket_mut(provider, backend)
            .and_then(|bucket| bucket.get_mut(slot))
        else {
            warn!(provider, backend, slot, "result for unknown slot dropped");
            return false;
        };
        if entry.is_complete() {
            warn!(provider, backend, slot, job_id = %entry.job.id(), "duplicate result dropped");
            return false;
        }
        entry.complete_with(outcome);
        jobs.complete += 1;
        self.publish(&jobs);
        true
    }

    /// Complete every entry still pending with a failure carrying `reason`.
    pub(crate) fn fail_pending(&self, reason: &str) -> usize {
        let mut jobs = self.lock();
        let mut failed = 0;
        for entry in jobs.results.values_mut().filter(|e| !e.is_complete()) {
            entry.complete_with(JobOutcome::failure(reason));
            failed += 1;
        }
        jobs.complete += failed;
        self.publish(&jobs);
        failed
    }

    /// `true` iff every entry holds an outcome; `true` for no entries.
    pub fn is_complete(&self) -> bool {
        self.lock().is_complete()
    }

    pub fn total_jobs(&self) -> usize {
        self.lock().total
    }

    pub fn complete_jobs(&self) -> usize {
        self.lock().complete
    }

    /// Snapshot of every [`JobResult`].
    pub fn get_jobs(&self) -> Nested<JobResult<C>> {
        self.lock().results.clone()
    }

    /// Snapshot with each entry reduced to its outcome (`None` while pending).
    pub fn get_results(&self) -> Nested<Option<JobOutcome>> {
        self.lock().results.map(|entry| entry.data.clone())
    }

    /// Every outcome, or `None` while any entry is pending.
    pub fn outcomes(&self) -> Option<Nested<JobOutcome>> {
        let jobs = self.lock();
        if !jobs.is_complete() {
            return None;
        }
        let mut outcomes = Nested::new();
        for (provider, backend, entry) in jobs.results.iter() {
            if let Some(outcome) = &entry.data {
                outcomes.push(provider, backend, outcome.clone());
            }
        }
        Some(outcomes)
    }

    /// Outcome of the first failed entry, in dispatch order.
    pub fn first_failure(&self) -> Option<(String, String, String)> {
        let jobs = self.lock();
        jobs.results.iter().find_map(|(provider, backend, entry)| {
            entry
                .data
                .as_ref()
                .and_then(JobOutcome::error)
                .map(|e| (provider.to_string(), backend.to_string(), e.to_string()))
        })
    }

    /// Wait until every entry holds an outcome.
    ///
    /// Returns whether completion was observed before `timeout` elapsed.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.shared.done.subscribe();
        let completed = async move { done.wait_for(|complete| *complete).await.is_ok() };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, completed).await.unwrap_or(false),
            None => completed.await,
        }
    }
}

impl<C> std::fmt::Display for ResultCollector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.lock();
        write!(f, "ResultCollector(")?;
        if !jobs.is_complete() {
            write!(f, "complete=false, ")?;
        }
        write!(f, "{{")?;
        for (i, (provider, buckets)) in jobs.results.entries().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{provider}: {{")?;
            for (j, (backend, entries)) in buckets.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                let rendered: Vec<String> = entries.iter().map(ToString::to_string).collect();
                write!(f, "{backend}: [{}]", rendered.join(", "))?;
            }
            write!(f, "}}")?;
        }
        write!(f, "}})")
    }
}

enum MergeState {
    Pending,
    Merged { results: Value, final_data: Value },
    Failed(String),
    Skipped,
}

struct Merger<C> {
    collector: ResultCollector<C>,
    merge: Option<MergeFn>,
    initial_data: Value,
    state: Mutex<MergeState>,
}

/// A [`ResultCollector`] plus the merge policy applied once it completes.
pub struct MergedResultCollector<C> {
    inner: Arc<Merger<C>>,
}

impl<C> Clone for MergedResultCollector<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> MergedResultCollector<C> {
    /// Wrap `collector` without a merge policy; merged getters stay `None`.
    pub fn new(collector: ResultCollector<C>) -> Self {
        Self::build(collector, None, Value::Null)
    }

    /// Wrap `collector`, merging with `merge` seeded with `initial_data`.
    pub fn with_policy(collector: ResultCollector<C>, merge: MergeFn, initial_data: Value) -> Self {
        Self::build(collector, Some(merge), initial_data)
    }

    fn build(collector: ResultCollector<C>, merge: Option<MergeFn>, initial_data: Value) -> Self {
        Self {
            inner: Arc::new(Merger {
                collector,
                merge,
                initial_data,
                state: Mutex::new(MergeState::Pending),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MergeState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn collector(&self) -> &ResultCollector<C> {
        &self.inner.collector
    }

    /// Run the merge if the collector is complete and it has not run yet.
    ///
    /// Returns whether the merge has executed (now or earlier). A merge
    /// function error is returned once and remembered in
    /// [`merge_error`](Self::merge_error).
    pub fn try_merge(&self) -> ExecResult<bool> {
        let mut state = self.state();
        if !matches!(*state, MergeState::Pending) {
            return Ok(true);
        }
        let Some(outcomes) = self.inner.collector.outcomes() else {
            return Ok(false);
        };
        let Some(merge) = &self.inner.merge else {
            *state = MergeState::Skipped;
            return Ok(true);
        };
        if outcomes.is_empty() {
            debug!("nothing to merge");
            *state = MergeState::Skipped;
            return Ok(true);
        }

        match merge(&outcomes, self.inner.initial_data.clone()) {
            Ok((results, final_data)) => {
                debug!(jobs = outcomes.total(), "merge policy applied");
                *state = MergeState::Merged { results, final_data };
                Ok(true)
            }
            Err(e) => {
                error!("merge policy failed: {e}");
                *state = MergeState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(*self.state(), MergeState::Merged { .. })
    }

    pub fn merge_error(&self) -> Option<String> {
        match &*self.state() {
            MergeState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn get_merged_results(&self) -> Option<Value> {
        match &*self.state() {
            MergeState::Merged { results, .. } => Some(results.clone()),
            _ => None,
        }
    }

    pub fn get_initial_policy_data(&self) -> Option<Value> {
        match &*self.state() {
            MergeState::Merged { .. } => Some(self.inner.initial_data.clone()),
            _ => None,
        }
    }

    pub fn get_final_policy_data(&self) -> Option<Value> {
        match &*self.state() {
            MergeState::Merged { final_data, .. } => Some(final_data.clone()),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.collector.is_complete()
    }

    pub fn get_jobs(&self) -> Nested<JobResult<C>> {
        self.inner.collector.get_jobs()
    }

    pub fn get_results(&self) -> Nested<Option<JobOutcome>> {
        self.inner.collector.get_results()
    }

    /// Wait for the collector, then make sure the merge has run.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        if !self.inner.collector.wait_for_completion(timeout).await {
            return false;
        }
        if let Err(e) = self.try_merge() {
            warn!("completion observed but merge failed: {e}");
        }
        true
    }
}

impl<C> std::fmt::Display for MergedResultCollector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state() {
            MergeState::Merged { results, .. } => {
                write!(f, "MergedResultCollector(merged_results={results})")
            }
            _ => write!(
                f,
                "MergedResultCollector(complete_jobs={}/total_jobs={})",
                self.inner.collector.complete_jobs(),
                self.inner.collector.total_jobs()
            ),
        }
    }
}
