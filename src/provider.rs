//! Backend registry.
//!
//! A [`Provider`] groups backends under one administration. The
//! [`VirtualProvider`] resolves `(provider, backend)` names to live backends
//! for the executor and for split policies.
//!
//! Providers are built from an explicit [`ProviderCatalog`] handed to
//! [`VirtualProvider::new`]; there is no process-wide default registry.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::backend::{Backend, BackendStatus};
use crate::error::{ExecError, ExecResult};
use crate::nested::Nested;

/// A named group of backends.
pub trait Provider<C>: Send + Sync {
    /// Look up one backend by name.
    ///
    /// Unknown names yield a `NotFound` error mentioning
    /// `Device '<name>' not found`.
    fn get_backend(&self, name: &str) -> ExecResult<Arc<dyn Backend<C>>>;

    /// Every backend this provider exposes.
    fn get_backends(&self) -> ExecResult<Vec<Arc<dyn Backend<C>>>>;
}

/// Builds a provider from its optional `providers_info` entry.
pub type ProviderFactory<C> =
    Arc<dyn Fn(Option<&Value>) -> ExecResult<Arc<dyn Provider<C>>> + Send + Sync>;

/// Known provider constructors, by name.
pub struct ProviderCatalog<C> {
    factories: Vec<(String, ProviderFactory<C>)>,
}

impl<C> Default for ProviderCatalog<C> {
    fn default() -> Self {
        Self {
            factories: Vec::new(),
        }
    }
}

impl<C> Clone for ProviderCatalog<C> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

impl<C> ProviderCatalog<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `name`.
    pub fn with_factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Option<&Value>) -> ExecResult<Arc<dyn Provider<C>>> + Send + Sync + 'static,
    {
        let name = name.into();
        self.factories.retain(|(existing, _)| *existing != name);
        self.factories.push((name, Arc::new(factory)));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(name, _)| name.as_str())
    }

    fn factory(&self, name: &str) -> Option<&ProviderFactory<C>> {
        self.factories
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, factory)| factory)
    }
}

/// Which providers to initialize and how.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Providers to initialize; every catalog entry when `None`.
    pub include: Option<Vec<String>>,
    /// Per-provider configuration handed to its factory.
    pub providers_info: FxHashMap<String, Value>,
    /// Fail on the first provider error instead of logging and skipping it.
    pub raise_exc: bool,
}

impl ProviderOptions {
    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_info(mut self, provider: impl Into<String>, info: Value) -> Self {
        self.providers_info.insert(provider.into(), info);
        self
    }

    pub fn raise_exc(mut self, raise_exc: bool) -> Self {
        self.raise_exc = raise_exc;
        self
    }
}

/// Registry of initialized providers.
pub struct VirtualProvider<C> {
    providers: Vec<(String, Arc<dyn Provider<C>>)>,
}

impl<C> Default for VirtualProvider<C> {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
        }
    }
}

impl<C> VirtualProvider<C> {
    /// Initialize the providers selected by `options` from `catalog`.
    pub fn new(catalog: &ProviderCatalog<C>, options: &ProviderOptions) -> ExecResult<Self> {
        let names: Vec<String> = match &options.include {
            Some(include) => include.clone(),
            None => catalog.names().map(str::to_string).collect(),
        };

        let mut registry = Self::default();
        for name in names {
            let Some(factory) = catalog.factory(&name) else {
                let message = format!("Provider '{name}' is not available.");
                if options.raise_exc {
                    return Err(ExecError::NotFound(message));
                }
                warn!(provider = %name, "{message}");
                continue;
            };

            match factory(options.providers_info.get(&name)) {
                Ok(provider) => {
                    debug!(provider = %name, "provider initialized");
                    registry.providers.push((name, provider));
                }
                Err(e) => {
                    let message = format!("Unable to initialize provider {name}: {e}");
                    if options.raise_exc {
                        return Err(ExecError::Initialization(message));
                    }
                    error!(provider = %name, "{message}");
                }
            }
        }
        Ok(registry)
    }

    /// Registry with no providers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register an already-built provider under `name`.
    pub fn add_provider(&mut self, name: impl Into<String>, provider: Arc<dyn Provider<C>>) -> ExecResult<()> {
        let name = name.into();
        if self.provider(&name).is_some() {
            return Err(ExecError::Configuration(format!(
                "Provider '{name}' is already initialized."
            )));
        }
        self.providers.push((name, provider));
        Ok(())
    }

    /// Initialized providers, in initialization order.
    pub fn get_providers(&self) -> impl Iterator<Item = (&str, &Arc<dyn Provider<C>>)> {
        self.providers
            .iter()
            .map(|(name, provider)| (name.as_str(), provider))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<dyn Provider<C>>> {
        self.providers
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, provider)| provider)
    }

    /// Resolve a backend, optionally requiring it to be online.
    pub fn get_backend(&self, provider: &str, name: &str, online: bool) -> ExecResult<Arc<dyn Backend<C>>> {
        let owner = self
            .provider(provider)
            .ok_or_else(|| ExecError::NotFound(format!("Provider '{provider}' not initialized.")))?;
        let backend = owner.get_backend(name)?;
        if online && backend.status() != BackendStatus::Online {
            return Err(ExecError::Unavailable(format!(
                "The backend '{name}' is not online."
            )));
        }
        Ok(backend)
    }

    /// Every reachable backend, grouped by provider.
    ///
    /// Providers that fail to list their backends are logged and left out.
    pub fn get_backends(&self, online: bool) -> Nested<Arc<dyn Backend<C>>> {
        let mut backends = Nested::new();
        for (provider_name, provider) in &self.providers {
            let listed = match provider.get_backends() {
                Ok(listed) => listed,
                Err(e) => {
                    error!(provider = %provider_name, "Unable to retrieve backends from provider {provider_name}: {e}");
                    continue;
                }
            };
            for backend in listed {
                if online && backend.status() != BackendStatus::Online {
                    continue;
                }
                let name = backend.name().to_string();
                backends.push(provider_name, &name, backend);
            }
        }
        backends
    }

    /// Status of one backend, `Unknown` when it cannot be resolved.
    pub fn backend_status(&self, provider: &str, name: &str) -> BackendStatus {
        self.get_backend(provider, name, false)
            .map(|backend| backend.status())
            .unwrap_or(BackendStatus::Unknown)
    }
}
