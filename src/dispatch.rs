//! Dispatches: which jobs go to which backend.
//!
//! A [`Dispatch`] is an insertion-ordered `provider → backend → [Job]` map.
//! Jobs are added in one of four request shapes:
//!
//! | tasks | shots | jobs |
//! |-------|-------|------|
//! | single | single | 1 |
//! | single | list of length 1 | 1 |
//! | list | single | one per task, shots broadcast |
//! | list | list of same length | one per (task, shots) pair |
//!
//! Every other combination is rejected with [`ExecError::InvalidArgument`].

use serde::de::DeserializeOwned;

use crate::error::{ExecError, ExecResult};
use crate::job::{Configuration, Job, JobRecord};
use crate::nested::Nested;

pub const SINGLE_TASK_SHOTS: &str =
    "single task: shots must be a single integer or list of length 1";
pub const TASKS_SHOTS_LENGTH: &str = "length of tasks list must match length of shots list";
pub const POSITIVE_SHOTS: &str = "shots must be a positive integer";

/// One task or a batch of tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Tasks<C> {
    /// A lone task, run with one shot count.
    Single(C),
    /// Tasks run in order; paired with shots by [`pair_up`].
    Batch(Vec<C>),
}

impl<C> Tasks<C> {
    /// Number of tasks; a `Single` counts as one.
    pub fn len(&self) -> usize {
        match self {
            Tasks::Single(_) => 1,
            Tasks::Batch(tasks) => tasks.len(),
        }
    }

    /// Only an empty `Batch` is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks in request order.
    pub fn iter(&self) -> std::slice::Iter<'_, C> {
        match self {
            Tasks::Single(task) => std::slice::from_ref(task).iter(),
            Tasks::Batch(tasks) => tasks.iter(),
        }
    }

    pub fn into_vec(self) -> Vec<C> {
        match self {
            Tasks::Single(task) => vec![task],
            Tasks::Batch(tasks) => tasks,
        }
    }
}

impl<C> From<Vec<C>> for Tasks<C> {
    fn from(tasks: Vec<C>) -> Self {
        Tasks::Batch(tasks)
    }
}

/// One shot count, or one per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shots {
    /// The same count for every task.
    Single(u32),
    /// One count per task of a batch, in task order.
    Batch(Vec<u32>),
}

impl From<u32> for Shots {
    fn from(shots: u32) -> Self {
        Shots::Single(shots)
    }
}

impl From<Vec<u32>> for Shots {
    fn from(shots: Vec<u32>) -> Self {
        Shots::Batch(shots)
    }
}

impl<const N: usize> From<[u32; N]> for Shots {
    fn from(shots: [u32; N]) -> Self {
        Shots::Batch(shots.to_vec())
    }
}

/// Check that `tasks` and `shots` form one of the accepted shapes.
///
/// Returns the number of jobs the pair expands to.
pub fn validate_shape<C>(tasks: &Tasks<C>, shots: &Shots) -> ExecResult<usize> {
    let jobs = match (tasks, shots) {
        (Tasks::Single(_), Shots::Single(_)) => 1,
        (Tasks::Single(_), Shots::Batch(list)) if list.len() == 1 => 1,
        (Tasks::Single(_), Shots::Batch(_)) => {
            return Err(ExecError::InvalidArgument(SINGLE_TASK_SHOTS.into()));
        }
        (Tasks::Batch(list), Shots::Single(_)) => list.len(),
        (Tasks::Batch(list), Shots::Batch(counts)) if list.len() == counts.len() => list.len(),
        (Tasks::Batch(list), Shots::Batch(counts)) => {
            return Err(ExecError::InvalidArgument(format!(
                "{TASKS_SHOTS_LENGTH} (got {} tasks and {} shot counts)",
                list.len(),
                counts.len()
            )));
        }
    };

    let positive = match shots {
        Shots::Single(n) => *n > 0,
        Shots::Batch(counts) => counts.iter().all(|n| *n > 0),
    };
    if !positive {
        return Err(ExecError::InvalidArgument(POSITIVE_SHOTS.into()));
    }
    Ok(jobs)
}

/// Expand a validated request into `(task, shots)` pairs.
pub fn pair_up<C>(tasks: Tasks<C>, shots: Shots) -> ExecResult<Vec<(C, u32)>> {
    validate_shape(&tasks, &shots)?;
    let pairs = match shots {
        Shots::Single(n) => tasks.into_vec().into_iter().map(|t| (t, n)).collect(),
        Shots::Batch(counts) => tasks.into_vec().into_iter().zip(counts).collect(),
    };
    Ok(pairs)
}

/// Jobs grouped by provider and backend.
#[derive(Debug, Clone)]
pub struct Dispatch<C> {
    jobs: Nested<Job<C>>,
}

impl<C> Default for Dispatch<C> {
    fn default() -> Self {
        Self {
            jobs: Nested::new(),
        }
    }
}

impl<C> Dispatch<C> {
    /// An empty dispatch; running it yields a complete, empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dispatch from `provider → backend → [record]` entries.
    pub fn from_records<P, B>(records: P) -> Self
    where
        P: IntoIterator<Item = (String, B)>,
        B: IntoIterator<Item = (String, Vec<JobRecord<C>>)>,
    {
        let mut dispatch = Self::new();
        for (provider, backends) in records {
            for (backend, jobs) in backends {
                let bucket = dispatch.jobs.entry(&provider, &backend);
                bucket.extend(jobs.into_iter().map(Job::from));
            }
        }
        dispatch
    }

    /// Build a dispatch from a JSON object of the same nested shape.
    pub fn from_json(value: serde_json::Value) -> ExecResult<Self>
    where
        C: DeserializeOwned,
    {
        let records: serde_json::Map<String, serde_json::Value> = serde_json::from_value(value)?;
        let mut nested = Vec::with_capacity(records.len());
        for (provider, backends) in records {
            let backends: serde_json::Map<String, serde_json::Value> =
                serde_json::from_value(backends)?;
            let mut entries = Vec::with_capacity(backends.len());
            for (backend, jobs) in backends {
                let jobs: Vec<JobRecord<C>> = serde_json::from_value(jobs)?;
                entries.push((backend, jobs));
            }
            nested.push((provider, entries));
        }
        Ok(Self::from_records(nested))
    }

    /// Add one job per `(task, shots)` pair to the `provider → backend` bucket.
    ///
    /// The bucket is created if absent. Nothing is added when the shape is
    /// rejected.
    pub fn add_job(
        &mut self,
        provider: &str,
        backend: &str,
        tasks: impl Into<Tasks<C>>,
        shots: impl Into<Shots>,
        configuration: &Configuration,
    ) -> ExecResult<()> {
        let pairs = pair_up(tasks.into(), shots.into())?;
        let bucket = self.jobs.entry(provider, backend);
        bucket.extend(
            pairs
                .into_iter()
                .map(|(task, shots)| Job::new(task, shots, configuration)),
        );
        Ok(())
    }

    /// Append an already-built job.
    pub fn push_job(&mut self, provider: &str, backend: &str, job: Job<C>) {
        self.jobs.push(provider, backend, job);
    }

    /// The full nested mapping.
    pub fn items(&self) -> &Nested<Job<C>> {
        &self.jobs
    }

    /// `(provider, backend, job)` in insertion order. Restartable.
    pub fn all_jobs(&self) -> impl Iterator<Item = (&str, &str, &Job<C>)> {
        self.jobs.iter()
    }

    /// Number of jobs over all buckets.
    pub fn len(&self) -> usize {
        self.jobs.total()
    }

    /// True when no bucket holds a job.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_nested(self) -> Nested<Job<C>> {
        self.jobs
    }
}

impl<C> std::fmt::Display for Dispatch<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatch({{")?;
        for (i, (provider, buckets)) in self.jobs.entries().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{provider}: {{")?;
            for (j, (backend, jobs)) in buckets.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{backend}: [")?;
                for (k, job) in jobs.iter().enumerate() {
                    if k > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{job}")?;
                }
                write!(f, "]")?;
            }
            write!(f, "}}")?;
        }
        write!(f, "}})")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cfg(value: serde_json::Value) -> Configuration {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_add_single_job() {
        let mut dispatch = Dispatch::new();
        dispatch
            .add_job("local", "simulator", Tasks::Single("qc1"), 10, &Configuration::new())
            .unwrap();

        let jobs: Vec<_> = dispatch.all_jobs().collect();
        assert_eq!(jobs.len(), 1);
        let (provider, backend, job) = jobs[0];
        assert_eq!((provider, backend), ("local", "simulator"));
        assert_eq!(job.shots(), 10);
    }

    #[test]
    fn test_add_pairwise_jobs() {
        let mut dispatch = Dispatch::new();
        dispatch
            .add_job("p", "b", vec!["c1", "c2"], [10, 20], &Configuration::new())
            .unwrap();

        let jobs = &dispatch.items()["p"]["b"];
        assert_eq!(jobs.len(), 2);
        let shots: Vec<_> = jobs.iter().map(Job::shots).collect();
        assert_eq!(shots, vec![10, 20]);
        assert_eq!(*jobs[1].task(), "c2");
    }

    #[test]
    fn test_add_broadcast_shots() {
        let mut dispatch = Dispatch::new();
        dispatch
            .add_job("prov", "backend", vec!["a", "b"], 50, &cfg(json!({"key": "value"})))
            .unwrap();

        for job in &dispatch.items()["prov"]["backend"] {
            assert_eq!(job.shots(), 50);
            assert_eq!(job.configuration()["key"], "value");
        }
    }

    #[test]
    fn test_single_task_with_one_element_shots() {
        let mut dispatch = Dispatch::new();
        dispatch
            .add_job("prov", "backend", Tasks::Single("a"), [30], &cfg(json!({"flag": true})))
            .unwrap();

        let jobs = &dispatch.items()["prov"]["backend"];
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].shots(), 30);
        assert_eq!(jobs[0].configuration()["flag"], true);
    }

    #[test]
    fn test_single_task_with_many_shots_is_rejected() {
        let mut dispatch = Dispatch::new();
        let err = dispatch
            .add_job("prov", "backend", Tasks::Single("a"), [5, 10], &Configuration::new())
            .unwrap_err();

        assert!(matches!(err, ExecError::InvalidArgument(_)));
        assert!(err.to_string().contains(SINGLE_TASK_SHOTS));
        assert!(dispatch.is_empty());
        assert!(dispatch.items().is_empty());
    }

    #[test]
    fn test_mismatched_lists_are_rejected() {
        let mut dispatch = Dispatch::new();
        let err = dispatch
            .add_job("p", "b", vec!["a", "b"], [10], &Configuration::new())
            .unwrap_err();
        assert!(err.to_string().contains(TASKS_SHOTS_LENGTH));
    }

    #[test]
    fn test_zero_shots_are_rejected() {
        let err = validate_shape(&Tasks::Batch(vec![1, 2]), &Shots::Batch(vec![3, 0])).unwrap_err();
        assert!(err.to_string().contains(POSITIVE_SHOTS));
    }

    #[test]
    fn test_validate_shape_counts_jobs() {
        assert_eq!(validate_shape(&Tasks::Single(1), &Shots::Single(5)).unwrap(), 1);
        assert_eq!(validate_shape(&Tasks::Batch(vec![1, 2, 3]), &Shots::Single(5)).unwrap(), 3);
        assert_eq!(validate_shape(&Tasks::<u8>::Batch(vec![]), &Shots::Batch(vec![])).unwrap(), 0);
    }

    #[test]
    fn test_multiple_calls_and_iteration_order() {
        let mut dispatch = Dispatch::new();
        let empty = Configuration::new();
        dispatch.add_job("p1", "b1", Tasks::Single(1), 10, &empty).unwrap();
        dispatch.add_job("p1", "b1", Tasks::Single(2), 20, &empty).unwrap();
        dispatch.add_job("p2", "b2", Tasks::Single(3), 30, &empty).unwrap();

        let first: Vec<_> = dispatch
            .all_jobs()
            .map(|(p, b, j)| (p.to_string(), b.to_string(), j.id().to_string()))
            .collect();
        let second: Vec<_> = dispatch
            .all_jobs()
            .map(|(p, b, j)| (p.to_string(), b.to_string(), j.id().to_string()))
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!((first[2].0.as_str(), first[2].1.as_str()), ("p2", "b2"));
        assert_eq!(dispatch.len(), 3);
    }

    #[test]
    fn test_configuration_is_copied_per_job() {
        let mut config = cfg(json!({"param": 1}));
        let mut dispatch = Dispatch::new();
        dispatch.add_job("p", "b", Tasks::Single(()), 1, &config).unwrap();
        config.insert("param".into(), json!(2));

        assert_eq!(dispatch.items()["p"]["b"][0].configuration()["param"], 1);
    }

    #[test]
    fn test_from_records() {
        let dispatch = Dispatch::from_records(vec![(
            "provA".to_string(),
            vec![(
                "be1".to_string(),
                vec![
                    JobRecord::new("c1", 5).with_id("test-id-123"),
                    JobRecord::new("c2", 10).with_configuration(cfg(json!({"a": 1}))),
                ],
            )],
        )]);

        let jobs = &dispatch.items()["provA"]["be1"];
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id(), "test-id-123");
        assert!(jobs[0].configuration().is_empty());
        assert!(!jobs[1].id().is_empty());
        assert_eq!(jobs[1].configuration()["a"], 1);
    }

    #[test]
    fn test_from_json() {
        let dispatch: Dispatch<String> = Dispatch::from_json(json!({
            "provX": {
                "backendY": [
                    {"id": "abc", "task": "qc", "shots": 7, "configuration": {"param": 42}}
                ],
                "backendZ": [{"task": "qc2", "shots": 3}]
            }
        }))
        .unwrap();

        let backends: Vec<_> = dispatch.items()["provX"].names().collect();
        assert_eq!(backends, vec!["backendY", "backendZ"]);
        let job = &dispatch.items()["provX"]["backendY"][0];
        assert_eq!(job.id(), "abc");
        assert_eq!(job.shots(), 7);
        assert_eq!(job.configuration()["param"], 42);

        assert!(Dispatch::<String>::from_json(json!({"p": {"b": [{"shots": 1}]}})).is_err());
    }

    #[test]
    fn test_display() {
        let mut dispatch = Dispatch::new();
        dispatch
            .add_job("local", "simulator", Tasks::Single(1), 5, &Configuration::new())
            .unwrap();
        let text = dispatch.to_string();
        assert!(text.starts_with("Dispatch({local: {simulator: [Job(id="));
        assert!(text.ends_with("shots=5)]}})"));
    }
}
