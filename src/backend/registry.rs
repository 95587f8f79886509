use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::config::{BackendDescriptor, Config, ConfigError};

/// Errors from runtime registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The requested backend does not exist.
    #[error("Backend '{backend}' not found")]
    BackendNotFound { backend: String },
    /// A backend with this name is already registered.
    #[error("Backend '{backend}' already exists")]
    DuplicateBackend { backend: String },
    /// The descriptor failed validation.
    #[error("Backend '{backend}' is invalid: {reason}")]
    InvalidBackend { backend: String, reason: String },
}

/// Which backends an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendSelector {
    /// Every backend.
    #[default]
    All,
    /// Only backends marked `primary`.
    Primary,
    /// Exactly these backends, by name.
    Named(Vec<String>),
}

/// Whether the operation places a new credential or touches existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Requires `enabled && accepts_new`.
    New,
    /// Requires `enabled`.
    Existing,
}

/// A backend excluded because its descriptor is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedBackend {
    pub name: String,
    pub reason: String,
}

/// Thread-safe registry of backend descriptors.
///
/// Readers get cloned snapshots, so a descriptor never changes underneath an
/// operation that already selected it.
#[derive(Clone)]
pub struct BackendRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

struct RegistryInner {
    backends: Vec<BackendDescriptor>,
    rejected: Vec<RejectedBackend>,
}

impl RegistryInner {
    fn build(descriptors: Vec<BackendDescriptor>) -> Self {
        let mut backends = Vec::with_capacity(descriptors.len());
        let mut rejected = Vec::new();

        for descriptor in descriptors {
            match descriptor.validate() {
                Ok(()) => backends.push(descriptor),
                Err(err) => {
                    tracing::warn!(backend = %descriptor.name, error = %err, "Skipping invalid backend");
                    rejected.push(RejectedBackend {
                        name: descriptor.name.clone(),
                        reason: rejection_reason(err),
                    });
                }
            }
        }

        Self { backends, rejected }
    }

    fn position(&self, name: &str) -> Result<usize, RegistryError> {
        self.backends
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| RegistryError::BackendNotFound {
                backend: name.to_string(),
            })
    }
}

fn rejection_reason(err: ConfigError) -> String {
    match err {
        ConfigError::InvalidBackend { reason, .. } => reason,
        other => other.to_string(),
    }
}

impl BackendRegistry {
    /// Build a registry from loaded configuration.
    ///
    /// Malformed backends are set aside (see [`BackendRegistry::rejected`])
    /// instead of failing the whole registry.
    pub fn from_config(config: &Config) -> Self {
        Self::from_backends(config.backends.clone())
    }

    /// Build a registry from an explicit descriptor list.
    pub fn from_backends(backends: Vec<BackendDescriptor>) -> Self {
        let inner = RegistryInner::build(backends);
        tracing::info!(
            backends = inner.backends.len(),
            rejected = inner.rejected.len(),
            "Backend registry loaded"
        );
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Snapshot of every usable backend, in configuration order.
    pub fn list(&self) -> Vec<BackendDescriptor> {
        self.inner.read().backends.clone()
    }

    /// Get the descriptor for a backend by name.
    pub fn get(&self, name: &str) -> Result<BackendDescriptor, RegistryError> {
        let inner = self.inner.read();
        let index = inner.position(name)?;
        Ok(inner.backends[index].clone())
    }

    /// Backends taking part in an operation, primary backends first.
    ///
    /// Disabled backends are never returned. For `Placement::New`, backends
    /// that do not accept new credentials are skipped as well.
    pub fn select(
        &self,
        selector: &BackendSelector,
        placement: Placement,
    ) -> Vec<BackendDescriptor> {
        let inner = self.inner.read();
        let mut selected: Vec<BackendDescriptor> = inner
            .backends
            .iter()
            .filter(|b| b.enabled)
            .filter(|b| placement == Placement::Existing || b.accepts_new)
            .filter(|b| match selector {
                BackendSelector::All => true,
                BackendSelector::Primary => b.primary,
                BackendSelector::Named(names) => names.iter().any(|n| n == &b.name),
            })
            .cloned()
            .collect();

        // Stable: configuration order is kept within each group.
        selected.sort_by_key(|b| !b.primary);
        selected
    }

    /// Backends that could not be used, limited to those the selector names.
    ///
    /// Named backends that are not configured at all are reported too.
    pub fn rejected_for(&self, selector: &BackendSelector) -> Vec<RejectedBackend> {
        let inner = self.inner.read();
        match selector {
            BackendSelector::All => inner.rejected.clone(),
            BackendSelector::Primary => Vec::new(),
            BackendSelector::Named(names) => names
                .iter()
                .filter_map(|name| {
                    if let Some(rejected) = inner.rejected.iter().find(|r| &r.name == name) {
                        return Some(rejected.clone());
                    }
                    if inner.backends.iter().any(|b| &b.name == name) {
                        return None;
                    }
                    Some(RejectedBackend {
                        name: name.clone(),
                        reason: "backend is not configured".to_string(),
                    })
                })
                .collect(),
        }
    }

    /// Every backend set aside at load time.
    pub fn rejected(&self) -> Vec<RejectedBackend> {
        self.inner.read().rejected.clone()
    }

    /// Register a backend at runtime.
    pub fn add_backend(&self, descriptor: BackendDescriptor) -> Result<(), RegistryError> {
        descriptor
            .validate()
            .map_err(|err| RegistryError::InvalidBackend {
                backend: descriptor.name.clone(),
                reason: rejection_reason(err),
            })?;

        let mut inner = self.inner.write();
        if inner.backends.iter().any(|b| b.name == descriptor.name) {
            return Err(RegistryError::DuplicateBackend {
                backend: descriptor.name,
            });
        }

        tracing::info!(backend = %descriptor.name, "Backend added");
        inner.rejected.retain(|r| r.name != descriptor.name);
        inner.backends.push(descriptor);
        Ok(())
    }

    /// Include or exclude a backend from every operation.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let index = inner.position(name)?;
        inner.backends[index].enabled = enabled;
        tracing::info!(backend = %name, enabled, "Backend toggled");
        Ok(())
    }

    /// Include or exclude a backend from new placements.
    pub fn set_accepts_new(&self, name: &str, accepts_new: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let index = inner.position(name)?;
        inner.backends[index].accepts_new = accepts_new;
        tracing::info!(backend = %name, accepts_new, "Backend placement toggled");
        Ok(())
    }

    /// Replace every descriptor (used when the config file is reloaded).
    pub fn update_config(&self, config: &Config) {
        let rebuilt = RegistryInner::build(config.backends.clone());
        *self.inner.write() = rebuilt;
    }
}
