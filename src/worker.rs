//! Job submission and the parallel worker pool.
//!
//! ```text
//!   queue ──→ worker 0..n ──report──→ ingest ──→ ResultCollector ──→ merge
//! ```
//!
//! Workers pull [`WorkItem`]s from a shared queue, submit and wait, then send
//! a [`Report`] back. A job that panics fails its own slot and the worker
//! moves on to the next item. The ingest task is the only writer into the
//! collector. When every worker has exited, slots that never received a
//! report are failed so the collector always completes.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::collector::MergedResultCollector;
use crate::error::{ExecError, ExecResult};
use crate::job::Job;
use crate::result::{ExecutionResult, JobOutcome};

pub(crate) const WORKER_LOST: &str = "worker exited before reporting";
pub(crate) const JOB_CRASHED: &str = "job crashed before reporting";

/// One job, its resolved backend and its reserved collector slot.
pub(crate) struct WorkItem<C> {
    pub provider: String,
    pub backend_name: String,
    pub slot: usize,
    pub job: Arc<Job<C>>,
    pub backend: Arc<dyn Backend<C>>,
}

pub(crate) struct Report {
    provider: String,
    backend: String,
    slot: usize,
    job_id: String,
    outcome: JobOutcome,
}

/// Submit one job and wait for its result.
pub(crate) async fn submit_and_wait<C>(backend: &dyn Backend<C>, job: &Job<C>) -> ExecResult<ExecutionResult>
where
    C: Send + Sync + 'static,
{
    let handle = backend
        .submit(
            std::slice::from_ref(job.task()),
            Some(i64::from(job.shots())),
            job.seed(),
            job.configuration(),
        )
        .await?;
    debug!(backend = backend.name(), job_id = job.id(), handle = %handle, "job submitted");

    let mut results = backend.wait(&handle).await?;
    if results.is_empty() {
        return Err(ExecError::Submission(format!(
            "backend '{}' returned no result for job {}",
            backend.name(),
            job.id()
        )));
    }
    Ok(results.swap_remove(0))
}

/// Run `items` on at most `workers` concurrent workers.
///
/// Returns the ingest task, which finishes once every item is accounted for
/// and the merge has been attempted.
pub(crate) fn fan_out<C>(
    items: Vec<WorkItem<C>>,
    merged: MergedResultCollector<C>,
    workers: usize,
) -> JoinHandle<()>
where
    C: Send + Sync + 'static,
{
    let workers = workers.clamp(1, items.len().max(1));
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    for item in items {
        // The receiver is alive in this scope, so sending cannot fail.
        let _ = queue_tx.send(item);
    }
    drop(queue_tx);
    let queue = Arc::new(Mutex::new(queue_rx));

    let (report_tx, report_rx) = mpsc::unbounded_channel();
    for worker_id in 0..workers {
        tokio::spawn(work(worker_id, queue.clone(), report_tx.clone()));
    }
    drop(report_tx);

    tokio::spawn(ingest(report_rx, merged))
}

async fn work<C>(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem<C>>>>,
    reports: mpsc::UnboundedSender<Report>,
) where
    C: Send + Sync + 'static,
{
    loop {
        let next = queue.lock().await.recv().await;
        let Some(item) = next else {
            break;
        };

        // A panic inside the job's own task fails only this slot.
        let backend = item.backend.clone();
        let job = item.job.clone();
        let attempt = tokio::spawn(async move { submit_and_wait(backend.as_ref(), &job).await });
        let outcome = match attempt.await {
            Ok(Ok(result)) => JobOutcome::Success(result),
            Ok(Err(e)) => {
                warn!(
                    worker_id,
                    provider = %item.provider,
                    backend = %item.backend_name,
                    job_id = item.job.id(),
                    "job failed: {e}"
                );
                JobOutcome::failure(e)
            }
            Err(e) => {
                error!(
                    worker_id,
                    provider = %item.provider,
                    backend = %item.backend_name,
                    job_id = item.job.id(),
                    "job crashed: {e}"
                );
                JobOutcome::failure(format!("{JOB_CRASHED}: {e}"))
            }
        };

        let report = Report {
            provider: item.provider,
            backend: item.backend_name,
            slot: item.slot,
            job_id: item.job.id().to_string(),
            outcome,
        };
        if reports.send(report).is_err() {
            break;
        }
    }
    debug!(worker_id, "worker finished");
}

async fn ingest<C>(mut reports: mpsc::UnboundedReceiver<Report>, merged: MergedResultCollector<C>) {
    let collector = merged.collector();
    while let Some(report) = reports.recv().await {
        if collector.record(&report.provider, &report.backend, report.slot, report.outcome) {
            debug!(
                provider = %report.provider,
                backend = %report.backend,
                job_id = %report.job_id,
                "result ingested"
            );
        }
    }

    let lost = collector.fail_pending(WORKER_LOST);
    if lost > 0 {
        error!(lost, "{WORKER_LOST}");
    }
    if let Err(e) = merged.try_merge() {
        error!("deferred merge failed: {e}");
    }
}
