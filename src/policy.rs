//! Split / merge policy registry.
//!
//! A policy is a named pair of functions:
//!
//! ```text
//!   split(tasks, shots, backends, policy_data, virtual_provider) -> (Dispatch, policy_data)
//!   merge(nested_results, policy_data)                           -> (merged, policy_data)
//! ```
//!
//! Pairs are registered in-process with [`PolicyRegistry::add_policy`] or
//! loaded from a policy unit file with [`PolicyRegistry::add_policy_from_file`].
//! A unit is a JSON document naming an already-registered split function and
//! an already-registered merge function:
//!
//! ```json
//! { "split": "uniform", "merge": "simple_aggregate" }
//! ```
//!
//! Both entry points are resolved when the unit is loaded, never at call time.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::dispatch::{Dispatch, Shots, Tasks};
use crate::error::{ExecError, ExecResult};
use crate::nested::Nested;
use crate::provider::VirtualProvider;
use crate::result::JobOutcome;

/// File extension of policy units.
pub const POLICY_UNIT_EXTENSION: &str = "json";

/// Insertion-ordered `provider → [backend]` selection handed to split policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendsMap {
    entries: Vec<(String, Vec<String>)>,
}

impl BackendsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add backends for `provider`, extending an existing entry.
    pub fn with<I, S>(mut self, provider: impl Into<String>, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = provider.into();
        let backends = backends.into_iter().map(Into::into);
        match self.entries.iter_mut().find(|(name, _)| *name == provider) {
            Some((_, existing)) => existing.extend(backends),
            None => self.entries.push((provider, backends.collect())),
        }
        self
    }

    pub fn get(&self, provider: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == provider)
            .map(|(_, backends)| backends.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, backends)| (name.as_str(), backends.as_slice()))
    }

    /// Every `(provider, backend)` pair, in order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().flat_map(|(provider, backends)| {
            backends.iter().map(move |backend| (provider, backend.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, backends)| backends.is_empty())
    }
}

impl<P, I, S> FromIterator<(P, I)> for BackendsMap
where
    P: Into<String>,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (P, I)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (provider, backends)| map.with(provider, backends))
    }
}

/// Routes a request onto backends.
pub type SplitFn<C> = Arc<
    dyn Fn(Tasks<C>, Shots, &BackendsMap, Value, &VirtualProvider<C>) -> ExecResult<(Dispatch<C>, Value)>
        + Send
        + Sync,
>;

/// Reduces per-backend outcomes into one result.
pub type MergeFn = Arc<dyn Fn(&Nested<JobOutcome>, Value) -> ExecResult<(Value, Value)> + Send + Sync>;

/// A registered split / merge pair.
pub struct Policy<C> {
    pub split: SplitFn<C>,
    pub merge: MergeFn,
}

impl<C> Clone for Policy<C> {
    fn clone(&self) -> Self {
        Self {
            split: self.split.clone(),
            merge: self.merge.clone(),
        }
    }
}

/// On-disk policy unit.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyUnit {
    split: Option<String>,
    merge: Option<String>,
}

/// Named split / merge pairs.
pub struct PolicyRegistry<C> {
    policies: FxHashMap<String, Policy<C>>,
}

impl<C> Default for PolicyRegistry<C> {
    fn default() -> Self {
        Self {
            policies: FxHashMap::default(),
        }
    }
}

impl<C> PolicyRegistry<C> {
    pub fn new() -> Self {
        Self::default()
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
        self.insert(
            name.into(),
            Policy {
                split: Arc::new(split),
                merge: Arc::new(merge),
            },
        );
    }

    pub fn insert(&mut self, name: String, policy: Policy<C>) {
        debug!(policy = %name, "policy registered");
        self.policies.insert(name, policy);
    }

    pub fn get_split_policy(&self, name: &str) -> ExecResult<SplitFn<C>> {
        self.policies
            .get(name)
            .map(|p| p.split.clone())
            .ok_or_else(|| ExecError::NotFound(format!("Split policy '{name}' not found")))
    }

    pub fn get_merge_policy(&self, name: &str) -> ExecResult<MergeFn> {
        self.policies
            .get(name)
            .map(|p| p.merge.clone())
            .ok_or_else(|| ExecError::NotFound(format!("Merge policy '{name}' not found")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Load the unit at `path` and register it under its file stem.
    ///
    /// On success the unit is copied into `policies_dir` (when given) so
    /// that later executors pick it up. Failures are returned when
    /// `raise_exc` is set and logged otherwise; the returned name is `None`
    /// when nothing was registered.
    pub fn add_policy_from_file(
        &mut self,
        path: &Path,
        policies_dir: Option<&Path>,
        raise_exc: bool,
    ) -> ExecResult<Option<String>> {
        match self.load_unit(path, policies_dir) {
            Ok(name) => Ok(Some(name)),
            Err(e) if raise_exc => Err(e),
            Err(e) => {
                error!(path = %path.display(), "Unable to load policy unit: {e}");
                Ok(None)
            }
        }
    }

    /// Load every unit found directly under `dir`.
    pub fn load_dir(&mut self, dir: &Path, raise_exc: bool) -> ExecResult<Vec<String>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == POLICY_UNIT_EXTENSION))
            .collect();
        paths.sort();

        let mut loaded = Vec::new();
        for path in paths {
            if let Some(name) = self.add_policy_from_file(&path, None, raise_exc)? {
                loaded.push(name);
            }
        }
        Ok(loaded)
    }

    fn load_unit(&mut self, path: &Path, policies_dir: Option<&Path>) -> ExecResult<String> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExecError::Import(format!("cannot derive a policy name from {}", path.display())))?
            .to_string();

        let text = fs::read_to_string(path)
            .map_err(|e| ExecError::Import(format!("cannot read policy unit {}: {e}", path.display())))?;
        let unit: PolicyUnit = serde_json::from_str(&text)
            .map_err(|e| ExecError::Import(format!("malformed policy unit {}: {e}", path.display())))?;

        let split_name = unit
            .split
            .ok_or_else(|| ExecError::Import(format!("policy unit '{name}' does not define 'split'")))?;
        let merge_name = unit
            .merge
            .ok_or_else(|| ExecError::Import(format!("policy unit '{name}' does not define 'merge'")))?;
        let split = self.policies.get(&split_name).map(|p| p.split.clone()).ok_or_else(|| {
            ExecError::Import(format!("policy unit '{name}': split entry point '{split_name}' is not registered"))
        })?;
        let merge = self.policies.get(&merge_name).map(|p| p.merge.clone()).ok_or_else(|| {
            ExecError::Import(format!("policy unit '{name}': merge entry point '{merge_name}' is not registered"))
        })?;

        if let Some(dir) = policies_dir {
            persist_unit(path, dir)?;
        }
        self.insert(name.clone(), Policy { split, merge });
        info!(policy = %name, split = %split_name, merge = %merge_name, "policy unit loaded");
        Ok(name)
    }
}

fn persist_unit(path: &Path, dir: &Path) -> ExecResult<()> {
    fs::create_dir_all(dir)?;
    let Some(file_name) = path.file_name() else {
        return Ok(());
    };
    let target = dir.join(file_name);
    let same = match (fs::canonicalize(path), fs::canonicalize(&target)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same {
        fs::copy(path, &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::job::Configuration;

    fn registry() -> PolicyRegistry<u8> {
        let mut registry = PolicyRegistry::new();
        registry.add_policy(
            "first",
            |tasks: Tasks<u8>, shots: Shots, backends: &BackendsMap, data: Value, _: &VirtualProvider<u8>| {
                let mut dispatch = Dispatch::new();
                if let Some((provider, backend)) = backends.pairs().next() {
                    dispatch.add_job(provider, backend, tasks, shots, &Configuration::new())?;
                }
                Ok((dispatch, data))
            },
            |results: &Nested<JobOutcome>, mut data: Value| {
                data["merged"] = json!(true);
                Ok((json!(results.total()), data))
            },
        );
        registry
    }

    #[test]
    fn test_backends_map() {
        let map: BackendsMap = [("p", vec!["a", "b"]), ("q", vec!["c"]), ("p", vec!["d"])]
            .into_iter()
            .collect();
        assert_eq!(map.get("p").unwrap(), ["a", "b", "d"]);
        let pairs: Vec<_> = map.pairs().collect();
        assert_eq!(pairs, vec![("p", "a"), ("p", "b"), ("p", "d"), ("q", "c")]);
        assert!(!map.is_empty());
        assert!(BackendsMap::new().with("p", Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_lookup_and_overwrite() {
        let mut registry = registry();
        let split = registry.get_split_policy("first").unwrap();
        let vp = VirtualProvider::empty();
        let backends = BackendsMap::new().with("p", ["b"]);
        let (dispatch, data) = split(Tasks::Single(1), Shots::Single(5), &backends, json!({}), &vp).unwrap();
        assert_eq!(dispatch.len(), 1);
        assert_eq!(data, json!({}));

        let err = registry.get_split_policy("nope").err().unwrap();
        assert!(err.is_lookup());
        assert_eq!(err.to_string(), "Split policy 'nope' not found");
        let err = registry.get_merge_policy("nope").err().unwrap();
        assert_eq!(err.to_string(), "Merge policy 'nope' not found");

        registry.add_policy(
            "first",
            |_: Tasks<u8>, _: Shots, _: &BackendsMap, data: Value, _: &VirtualProvider<u8>| {
                Ok((Dispatch::new(), data))
            },
            |_: &Nested<JobOutcome>, data: Value| Ok((Value::Null, data)),
        );
        let split = registry.get_split_policy("first").unwrap();
        let (dispatch, _) = split(Tasks::Single(1), Shots::Single(5), &backends, json!({}), &vp).unwrap();
        assert!(dispatch.is_empty());
        assert_eq!(registry.names(), vec!["first"]);
    }

    #[test]
    fn test_load_unit_and_persist() {
        let files = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let path = files.path().join("valid_policy.json");
        fs::write(&path, r#"{"split": "first", "merge": "first"}"#).unwrap();

        let mut policies = registry();
        let name = policies
            .add_policy_from_file(&path, Some(store.path()), true)
            .unwrap();
        assert_eq!(name.as_deref(), Some("valid_policy"));
        assert!(store.path().join("valid_policy.json").exists());

        let merge = policies.get_merge_policy("valid_policy").unwrap();
        let (_, data) = merge(&Nested::new(), json!({"info": "test"})).unwrap();
        assert_eq!(data["merged"], true);
        assert_eq!(data["info"], "test");

        let mut fresh = registry();
        let loaded = fresh.load_dir(store.path(), true).unwrap();
        assert_eq!(loaded, vec!["valid_policy".to_string()]);
    }

    #[test]
    fn test_load_unit_failures() {
        let files = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let missing_merge = files.path().join("invalid_policy.json");
        fs::write(&missing_merge, r#"{"split": "first"}"#).unwrap();
        let unknown = files.path().join("unknown_entry.json");
        fs::write(&unknown, r#"{"split": "first", "merge": "ghost"}"#).unwrap();
        let garbage = files.path().join("garbage.json");
        fs::write(&garbage, "def split(): pass").unwrap();

        let mut registry = registry();
        for path in [&missing_merge, &unknown, &garbage] {
            let err = registry
                .add_policy_from_file(path, Some(store.path()), true)
                .unwrap_err();
            assert!(matches!(err, ExecError::Import(_)), "{err}");
        }
        let err = registry
            .add_policy_from_file(&missing_merge, None, true)
            .unwrap_err();
        assert!(err.to_string().contains("does not define 'merge'"));

        let skipped = registry
            .add_policy_from_file(&missing_merge, Some(store.path()), false)
            .unwrap();
        assert!(skipped.is_none());
        assert!(!registry.contains("invalid_policy"));
        assert!(!store.path().join("invalid_policy.json").exists());
    }
}
