//! Built-in split / merge policies.
//!
//! | name | split | merge |
//! |------|-------|-------|
//! | `uniform` | shots of each task divided evenly over every listed backend | counts summed per task |
//! | `multiplier` | every listed backend runs every task with the full shot count | counts summed per task |
//! | `simple_aggregate` | everything to the first listed backend | counts summed per task |
//!
//! Every split records the layout it produced under the `"layout"` key of
//! the policy data (`provider → backend → [task index]`), which the merge
//! uses to group outcomes by originating task. An optional `"configuration"`
//! object in the policy data is attached to every generated job.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::dispatch::{Dispatch, Shots, Tasks, pair_up};
use crate::error::ExecResult;
use crate::job::{Configuration, Job};
use crate::nested::Nested;
use crate::policy::{BackendsMap, PolicyRegistry};
use crate::provider::VirtualProvider;
use crate::result::{ExecutionResult, JobOutcome};

pub const UNIFORM: &str = "uniform";
pub const MULTIPLIER: &str = "multiplier";
pub const SIMPLE_AGGREGATE: &str = "simple_aggregate";

const LAYOUT_KEY: &str = "layout";
const CONFIGURATION_KEY: &str = "configuration";

/// Register the built-in policies into `registry`.
pub fn register_builtin<C>(registry: &mut PolicyRegistry<C>)
where
    C: Clone + Send + Sync + 'static,
{
    registry.add_policy(UNIFORM, uniform_split::<C>, aggregate_merge);
    registry.add_policy(MULTIPLIER, multiplier_split::<C>, aggregate_merge);
    registry.add_policy(SIMPLE_AGGREGATE, simple_aggregate_split::<C>, aggregate_merge);
}

/// Divide each task's shots evenly across every listed backend.
///
/// The remainder goes to the first backends, one shot each; a backend whose
/// share is zero receives no job for that task.
pub fn uniform_split<C: Clone>(
    tasks: Tasks<C>,
    shots: Shots,
    backends: &BackendsMap,
    data: Value,
    _: &VirtualProvider<C>,
) -> ExecResult<(Dispatch<C>, Value)> {
    let targets: Vec<_> = backends.pairs().collect();
    let pairs = pair_up(tasks, shots)?;
    let mut builder = Builder::new(data);
    if targets.is_empty() {
        return Ok(builder.finish());
    }

    let n = u32::try_from(targets.len()).unwrap_or(u32::MAX);
    for (index, (task, shots)) in pairs.into_iter().enumerate() {
        let (base, remainder) = (shots / n, shots % n);
        for (k, (provider, backend)) in targets.iter().enumerate() {
            let share = base + u32::from((k as u32) < remainder);
            if share > 0 {
                builder.push(provider, backend, index, task.clone(), share);
            }
        }
    }
    Ok(builder.finish())
}

/// Run every task with its full shot count on every listed backend.
pub fn multiplier_split<C: Clone>(
    tasks: Tasks<C>,
    shots: Shots,
    backends: &BackendsMap,
    data: Value,
    _: &VirtualProvider<C>,
) -> ExecResult<(Dispatch<C>, Value)> {
    let pairs = pair_up(tasks, shots)?;
    let mut builder = Builder::new(data);
    for (provider, backend) in backends.pairs() {
        for (index, (task, shots)) in pairs.iter().enumerate() {
            builder.push(provider, backend, index, task.clone(), *shots);
        }
    }
    Ok(builder.finish())
}

/// Send every task to the first listed backend.
pub fn simple_aggregate_split<C>(
    tasks: Tasks<C>,
    shots: Shots,
    backends: &BackendsMap,
    data: Value,
    _: &VirtualProvider<C>,
) -> ExecResult<(Dispatch<C>, Value)> {
    let pairs = pair_up(tasks, shots)?;
    let mut builder = Builder::new(data);
    if let Some((provider, backend)) = backends.pairs().next() {
        for (index, (task, shots)) in pairs.into_iter().enumerate() {
            builder.push(provider, backend, index, task, shots);
        }
    }
    Ok(builder.finish())
}

/// Sum the counts of every successful outcome per originating task.
///
/// Returns a JSON array with one aggregated [`ExecutionResult`] per task
/// (`null` for a task none of whose jobs succeeded). The policy data gains
/// `failed_jobs`, the number of failed outcomes.
pub fn aggregate_merge(results: &Nested<JobOutcome>, mut data: Value) -> ExecResult<(Value, Value)> {
    let layout = data.get(LAYOUT_KEY);
    // Every task owns at least one job, so no valid task index reaches this.
    let bound: usize = results.buckets().map(|(_, _, outcomes)| outcomes.len()).sum();
    let mut per_task: Vec<Option<ExecutionResult>> = Vec::new();
    let mut failed = 0usize;

    for (provider, backend, outcomes) in results.buckets() {
        let indices = layout
            .and_then(|l| l.get(provider))
            .and_then(|b| b.get(backend))
            .and_then(Value::as_array);
        for (position, outcome) in outcomes.iter().enumerate() {
            let index = indices
                .and_then(|list| list.get(position))
                .and_then(Value::as_u64)
                .and_then(|i| usize::try_from(i).ok())
                .filter(|&i| {
                    let valid = i < bound;
                    if !valid {
                        warn!(provider, backend, position, index = i, "layout index out of range");
                    }
                    valid
                })
                .unwrap_or(position);
            let result = match outcome {
                JobOutcome::Success(result) => result,
                JobOutcome::Failure { error } => {
                    warn!(provider, backend, position, "skipping failed job in merge: {error}");
                    failed += 1;
                    continue;
                }
            };
            if per_task.len() <= index {
                per_task.resize(index + 1, None);
            }
            if let Some(acc) = &mut per_task[index] {
                acc.combine(result);
            } else {
                per_task[index] = Some(result.clone());
            }
        }
    }

    let merged = serde_json::to_value(&per_task)?;
    if !data.is_object() {
        data = Value::Object(Map::new());
    }
    data["failed_jobs"] = json!(failed);
    debug!(tasks = per_task.len(), failed, "aggregate merge done");
    Ok((merged, data))
}

/// Accumulates a dispatch together with its layout.
struct Builder<C> {
    dispatch: Dispatch<C>,
    layout: Map<String, Value>,
    configuration: Configuration,
    data: Value,
}

impl<C> Builder<C> {
    fn new(data: Value) -> Self {
        let configuration = data
            .get(CONFIGURATION_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            dispatch: Dispatch::new(),
            layout: Map::new(),
            configuration,
            data,
        }
    }

    fn push(&mut self, provider: &str, backend: &str, index: usize, task: C, shots: u32) {
        self.dispatch
            .push_job(provider, backend, Job::new(task, shots, &self.configuration));
        let backends = self
            .layout
            .entry(provider)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(backends) = backends {
            if let Value::Array(indices) = backends.entry(backend).or_insert_with(|| json!([])) {
                indices.push(json!(index));
            }
        }
    }

    fn finish(self) -> (Dispatch<C>, Value) {
        let mut data = match self.data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        data.insert(LAYOUT_KEY.into(), Value::Object(self.layout));
        (self.dispatch, Value::Object(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Counts;

    fn backends() -> BackendsMap {
        BackendsMap::new().with("p", ["a", "b"]).with("q", ["c"])
    }

    fn shots_of(dispatch: &Dispatch<&'static str>) -> Vec<(String, String, u32)> {
        dispatch
            .all_jobs()
            .map(|(p, b, job)| (p.to_string(), b.to_string(), job.shots()))
            .collect()
    }

    fn outcome(pairs: &[(&str, u64)]) -> JobOutcome {
        let counts = Counts::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)));
        let shots = u32::try_from(counts.total_shots()).unwrap();
        JobOutcome::Success(ExecutionResult::new(counts, shots))
    }

    #[test]
    fn test_uniform_distributes_remainder() {
        let vp = VirtualProvider::empty();
        let (dispatch, data) =
            uniform_split(Tasks::Single("c"), Shots::Single(10), &backends(), json!({}), &vp).unwrap();
        assert_eq!(
            shots_of(&dispatch),
            vec![
                ("p".into(), "a".into(), 4),
                ("p".into(), "b".into(), 3),
                ("q".into(), "c".into(), 3)
            ]
        );
        assert_eq!(data["layout"], json!({"p": {"a": [0], "b": [0]}, "q": {"c": [0]}}));

        let (dispatch, _) =
            uniform_split(Tasks::Single("c"), Shots::Single(2), &backends(), json!(null), &vp).unwrap();
        assert_eq!(dispatch.len(), 2);
        assert!(dispatch.items().bucket("q", "c").is_none());
    }

    #[test]
    fn test_empty_backends_give_empty_dispatch() {
        let vp = VirtualProvider::empty();
        type Split = fn(
            Tasks<&'static str>,
            Shots,
            &BackendsMap,
            Value,
            &VirtualProvider<&'static str>,
        ) -> ExecResult<(Dispatch<&'static str>, Value)>;
        let splits: [Split; 3] = [uniform_split, multiplier_split, simple_aggregate_split];
        for split in splits {
            let (dispatch, data) =
                split(Tasks::Single("c"), Shots::Single(10), &BackendsMap::new(), json!({"k": 1}), &vp).unwrap();
            assert!(dispatch.is_empty());
            assert_eq!(data["k"], 1);
        }
    }

    #[test]
    fn test_multiplier_and_simple_aggregate() {
        let vp = VirtualProvider::empty();
        let tasks = Tasks::Batch(vec!["x", "y"]);
        let (dispatch, data) =
            multiplier_split(tasks.clone(), Shots::Batch(vec![5, 7]), &backends(), json!({}), &vp).unwrap();
        assert_eq!(dispatch.len(), 6);
        assert_eq!(data["layout"]["q"]["c"], json!([0, 1]));

        let data = json!({"configuration": {"seed": 3}});
        let (dispatch, _) =
            simple_aggregate_split(tasks, Shots::Single(9), &backends(), data, &vp).unwrap();
        let jobs: Vec<_> = dispatch.all_jobs().collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|(p, b, _)| *p == "p" && *b == "a"));
        assert_eq!(jobs[0].2.seed(), Some(3));
    }

    #[test]
    fn test_split_rejects_bad_shapes() {
        let vp = VirtualProvider::empty();
        let err = uniform_split(Tasks::Single("c"), Shots::Batch(vec![1, 2]), &backends(), json!({}), &vp)
            .unwrap_err();
        assert!(err.to_string().contains("single task"));
    }

    #[test]
    fn test_aggregate_merge_uses_layout() {
        let mut results = Nested::new();
        results.push("p", "a", outcome(&[("00", 3), ("11", 1)]));
        results.push("p", "a", outcome(&[("0", 2)]));
        results.push("q", "c", outcome(&[("00", 1), ("11", 5)]));
        results.push("q", "c", JobOutcome::failure("device lost"));
        let data = json!({"layout": {"p": {"a": [0, 1]}, "q": {"c": [0, 1]}}});

        let (merged, data) = aggregate_merge(&results, data).unwrap();
        let merged: Vec<Option<ExecutionResult>> = serde_json::from_value(merged).unwrap();
        assert_eq!(merged.len(), 2);
        let first = merged[0].as_ref().unwrap();
        assert_eq!(first.counts.get("00"), 4);
        assert_eq!(first.counts.get("11"), 6);
        assert_eq!(first.shots, 10);
        assert_eq!(merged[1].as_ref().unwrap().counts.get("0"), 2);
        assert_eq!(data["failed_jobs"], 1);
    }

    #[test]
    fn test_aggregate_merge_without_layout() {
        let mut results = Nested::new();
        results.push("p", "a", outcome(&[("1", 4)]));
        results.push("p", "b", outcome(&[("1", 6)]));
        let (merged, data) = aggregate_merge(&results, Value::Null).unwrap();
        assert_eq!(merged[0]["counts"]["1"], 10);
        assert_eq!(data["failed_jobs"], 0);
    }

    #[test]
    fn test_aggregate_merge_ignores_out_of_range_layout() {
        let mut results = Nested::new();
        results.push("p", "a", outcome(&[("0", 2)]));
        results.push("p", "a", outcome(&[("1", 3)]));
        let data = json!({"layout": {"p": {"a": [1_000_000_000_000u64, 2]}}});

        let (merged, _) = aggregate_merge(&results, data).unwrap();
        let merged: Vec<Option<ExecutionResult>> = serde_json::from_value(merged).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].as_ref().unwrap().counts.get("0"), 2);
        assert_eq!(merged[1].as_ref().unwrap().counts.get("1"), 3);
    }
}
