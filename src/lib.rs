//! Quantum executor: split / merge orchestration of circuit jobs.
//!
//! Callers describe *what* to run (tasks) and *how often* (shots). A named
//! **split policy** routes the request onto backends grouped under providers,
//! producing a [`Dispatch`]; the [`Executor`] submits every job, sequentially
//! or through a worker pool, collects outcomes in a [`ResultCollector`] and
//! finally applies the matching **merge policy** once, producing a
//! [`MergedResultCollector`].
//!
//! # Overview
//!
//! - [`Job`] / [`Dispatch`] for the unit of work and its routing
//! - [`PolicyRegistry`] with the built-in `uniform`, `multiplier` and
//!   `simple_aggregate` policies, plus JSON policy units
//! - [`VirtualProvider`] resolving `(provider, backend)` names to live
//!   [`Backend`]s
//! - [`ResultCollector`] / [`MergedResultCollector`] for completion tracking
//! - [`ExecError`] with categorized error variants
//!
//! # Lifecycle
//!
//! ```text
//!   generate_dispatch() ──→ run_dispatch() ──→ wait_for_completion() ──→ get_merged_results()
//!    (sync, validates)       (async)            (async, optional)          (merged once)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use quantum_executor::{BackendsMap, Circuit, Executor, ExecutorConfig, Experiment,
//!     ProviderCatalog, ProviderOptions, RunOptions, Tasks};
//!
//! let executor = Executor::from_catalog(
//!     &ProviderCatalog::with_local(),
//!     &ProviderOptions::default(),
//!     ExecutorConfig::default(),
//! )?;
//! let backends = BackendsMap::new().with("local", ["simulator", "noisy_simulator"]);
//! let experiment = Experiment::new(Tasks::Single(Circuit::new(3)), 1000, backends, "uniform");
//! let merged = executor.run_experiment(experiment, RunOptions::parallel(true)).await?;
//! println!("{merged}");
//! ```

pub mod backend;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod handle;
pub mod job;
pub mod local;
pub mod nested;
pub mod policies;
pub mod policy;
pub mod provider;
pub mod result;
mod worker;

pub use backend::{Backend, BackendStatus, validate_run_args};
pub use collector::{JobResult, MergedResultCollector, ResultCollector};
pub use config::{ExecutorConfig, RunOptions};
pub use dispatch::{Dispatch, Shots, Tasks};
pub use error::{ExecError, ExecResult};
pub use executor::{Executor, Experiment};
pub use handle::{HandleStatus, JobHandle};
pub use job::{Configuration, Job, JobRecord};
pub use local::{Circuit, LocalProvider, LocalSimulator, Sampleable};
pub use nested::{Buckets, Nested};
pub use policy::{BackendsMap, MergeFn, PolicyRegistry, SplitFn};
pub use provider::{Provider, ProviderCatalog, ProviderOptions, VirtualProvider};
pub use result::{Counts, ExecutionResult, JobOutcome};
