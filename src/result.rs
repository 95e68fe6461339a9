//! Raw execution payloads.
//!
//! A backend returns one [`ExecutionResult`] per submitted task. The executor
//! wraps it into a [`JobOutcome`], which is the payload merge policies see.
//!
//! Bitstrings follow the OpenQASM 3 convention: the rightmost bit is the
//! lowest-indexed qubit.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Measurement counts: bitstring → number of occurrences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counts {
    counts: FxHashMap<String, u64>,
}

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build counts from `(bitstring, count)` pairs. Duplicates are summed.
    pub fn from_pairs(iter: impl IntoIterator<Item = (impl Into<String>, u64)>) -> Self {
        let mut counts = Self::new();
        for (k, v) in iter {
            counts.insert(k, v);
        }
        counts
    }

    /// Add `count` occurrences of `bitstring`.
    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        *self.counts.entry(bitstring.into()).or_default() += count;
    }

    /// Accumulate every entry of `other` into `self`.
    pub fn merge_from(&mut self, other: &Counts) {
        for (k, v) in &other.counts {
            *self.counts.entry(k.clone()).or_default() += v;
        }
    }

    pub fn get(&self, bitstring: &str) -> u64 {
        self.counts.get(bitstring).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counts.iter()
    }

    /// Total number of recorded shots.
    pub fn total_shots(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn most_frequent(&self) -> Option<(&String, &u64)> {
        self.counts.iter().max_by_key(|&(_, count)| count)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn probabilities(&self) -> FxHashMap<String, f64> {
        let total = self.total_shots() as f64;
        if total == 0.0 {
            return FxHashMap::default();
        }
        self.counts
            .iter()
            .map(|(k, &v)| (k.clone(), v as f64 / total))
            .collect()
    }

    /// Counts sorted by count descending, ties broken by bitstring.
    pub fn sorted(&self) -> Vec<(&String, &u64)> {
        let mut items: Vec<_> = self.counts.iter().collect();
        items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        items
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl FromIterator<(String, u64)> for Counts {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// Result of running one task on one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub counts: Counts,
    /// Number of shots executed.
    pub shots: u32,
    /// Wall-clock execution time in milliseconds, if the backend reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Backend-specific extras.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExecutionResult {
    pub fn new(counts: Counts, shots: u32) -> Self {
        Self {
            counts,
            shots,
            execution_time_ms: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_execution_time(mut self, time_ms: u64) -> Self {
        self.execution_time_ms = Some(time_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Fold another run of the same task into this one.
    ///
    /// Counts and shots are summed; execution time keeps the slowest run
    /// since the runs happened concurrently on distinct backends.
    pub fn combine(&mut self, other: &ExecutionResult) {
        self.counts.merge_from(&other.counts);
        self.shots = self.shots.saturating_add(other.shots);
        self.execution_time_ms = match (self.execution_time_ms, other.execution_time_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn probabilities(&self) -> FxHashMap<String, f64> {
        self.counts.probabilities()
    }

    /// Most frequent bitstring with its relative frequency.
    #[allow(clippy::cast_precision_loss)]
    pub fn most_frequent(&self) -> Option<(&String, f64)> {
        let total = self.counts.total_shots() as f64;
        if total == 0.0 {
            return None;
        }
        self.counts
            .most_frequent()
            .map(|(s, &c)| (s, c as f64 / total))
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::new(Counts::new(), 0)
    }
}

/// Raw payload of a finished job, as handed to merge policies.
///
/// Backend failures are encoded as `Failure` rather than dropped, so the
/// shape of a collector always mirrors its dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The backend returned a result.
    Success(ExecutionResult),
    /// Submission, execution or fetching failed with `error`.
    Failure { error: String },
}

impl JobOutcome {
    pub fn failure(error: impl ToString) -> Self {
        Self::Failure {
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            JobOutcome::Success(result) => Some(result),
            JobOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Success(_) => None,
            JobOutcome::Failure { error } => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate() {
        let mut counts = Counts::from_pairs([("00", 300), ("11", 200), ("00", 100)]);
        assert_eq!(counts.get("00"), 400);
        assert_eq!(counts.total_shots(), 600);

        counts.merge_from(&Counts::from_pairs([("11", 50), ("01", 5)]));
        assert_eq!(counts.get("11"), 250);
        assert_eq!(counts.get("01"), 5);
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn test_counts_probabilities_and_sorted() {
        let counts = Counts::from_pairs([("00", 30), ("01", 20), ("10", 30), ("11", 20)]);
        let probs = counts.probabilities();
        assert!((probs["00"] - 0.3).abs() < 1e-10);

        let sorted = counts.sorted();
        assert_eq!(sorted[0].0, "00");
        assert_eq!(sorted[1].0, "10");
        assert!(Counts::new().probabilities().is_empty());
    }

    #[test]
    fn test_execution_result_combine() {
        let mut left = ExecutionResult::new(Counts::from_pairs([("00", 25)]), 25)
            .with_execution_time(10);
        let right = ExecutionResult::new(Counts::from_pairs([("00", 20), ("11", 6)]), 26)
            .with_execution_time(42);

        left.combine(&right);
        assert_eq!(left.shots, 51);
        assert_eq!(left.counts.get("00"), 45);
        assert_eq!(left.execution_time_ms, Some(42));

        let (most, prob) = left.most_frequent().unwrap();
        assert_eq!(most, "00");
        assert!((prob - 45.0 / 51.0).abs() < 1e-10);
    }

    #[test]
    fn test_outcome_serde_shape() {
        let failure = JobOutcome::failure("backend exploded");
        assert_eq!(failure.error(), Some("backend exploded"));
        assert!(!failure.is_success());

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["failure"]["error"], "backend exploded");

        let success = JobOutcome::Success(ExecutionResult::new(Counts::from_pairs([("1", 3)]), 3));
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["success"]["counts"]["1"], 3);
    }
}
