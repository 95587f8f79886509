//! Customer store: point lookups of provisioned customers and linked identities.
//!
//! A customer (master identity) may have secondary identities linked to it so
//! that one subscription serves all of them. The store owns those pairs and
//! the few customer fields the orchestrator reads and writes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// What the orchestrator remembers about a provisioned customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub identity: Uuid,
    pub label: String,
    /// Unix milliseconds.
    pub expiry_ms: i64,
    /// Backends that accepted the credential.
    #[serde(default)]
    pub backends: Vec<String>,
    /// Backend preferred for usage reporting.
    #[serde(default)]
    pub home_backend: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Identity {identity} cannot be linked to itself")]
    SelfLink { identity: Uuid },

    #[error("Identity {identity} is a master for other identities; unlink those first")]
    AlreadyMaster { identity: Uuid },

    #[error("Identity {identity} is already linked to {master}")]
    AlreadyLinked { identity: Uuid, master: Uuid },

    #[error("Identity {identity} is not linked")]
    LinkNotFound { identity: Uuid },

    #[error("Failed to access customer store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse customer store {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Local store collaborator. Implementations must be safe to share.
pub trait CustomerStore: Send + Sync {
    /// Insert or replace the record for `record.identity`.
    fn record(&self, record: CustomerRecord) -> Result<(), StoreError>;

    fn by_identity(&self, identity: Uuid) -> Option<CustomerRecord>;

    fn by_label(&self, label: &str) -> Option<CustomerRecord>;

    /// Remove a customer together with every link it takes part in.
    fn remove(&self, identity: Uuid) -> Result<Option<CustomerRecord>, StoreError>;

    /// Returns false when the customer is unknown.
    fn set_expiry(&self, identity: Uuid, expiry_ms: i64) -> Result<bool, StoreError>;

    /// Link `linked` to `master`.
    fn link(&self, master: Uuid, linked: Uuid) -> Result<(), StoreError>;

    fn unlink(&self, linked: Uuid) -> Result<(), StoreError>;

    /// Identities linked to `master`, in a stable order.
    fn linked(&self, master: Uuid) -> Vec<Uuid>;

    fn master_of(&self, linked: Uuid) -> Option<Uuid>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    customers: BTreeMap<Uuid, CustomerRecord>,
    /// linked identity -> master identity
    #[serde(default)]
    links: BTreeMap<Uuid, Uuid>,
}

/// In-memory store, optionally mirrored to a JSON file after every change.
pub struct MemoryStore {
    data: RwLock<StoreData>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store that lives only as long as the process.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            path: None,
        }
    }

    /// Store backed by `path`. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            StoreData::default()
        };

        tracing::debug!(path = %path.display(), customers = data.customers.len(), "Customer store opened");
        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_error)?;
        fs::rename(&tmp, path).map_err(io_error)
    }
}

impl CustomerStore for MemoryStore {
    fn record(&self, record: CustomerRecord) -> Result<(), StoreError> {
        let mut data = self.data.write();
        data.customers.insert(record.identity, record);
        self.persist(&data)
    }

    fn by_identity(&self, identity: Uuid) -> Option<CustomerRecord> {
        self.data.read().customers.get(&identity).cloned()
    }

    fn by_label(&self, label: &str) -> Option<CustomerRecord> {
        self.data
            .read()
            .customers
            .values()
            .find(|c| c.label == label)
            .cloned()
    }

    fn remove(&self, identity: Uuid) -> Result<Option<CustomerRecord>, StoreError> {
        let mut data = self.data.write();
        let removed = data.customers.remove(&identity);
        data.links
            .retain(|linked, master| *linked != identity && *master != identity);
        self.persist(&data)?;
        Ok(removed)
    }

    fn set_expiry(&self, identity: Uuid, expiry_ms: i64) -> Result<bool, StoreError> {
        let mut data = self.data.write();
        let Some(customer) = data.customers.get_mut(&identity) else {
            return Ok(false);
        };
        customer.expiry_ms = expiry_ms;
        self.persist(&data)?;
        Ok(true)
    }

    fn link(&self, master: Uuid, linked: Uuid) -> Result<(), StoreError> {
        if master == linked {
            return Err(StoreError::SelfLink { identity: master });
        }

        let mut data = self.data.write();
        if data.links.values().any(|m| *m == linked) {
            return Err(StoreError::AlreadyMaster { identity: linked });
        }
        if let Some(existing) = data.links.get(&linked) {
            return Err(StoreError::AlreadyLinked {
                identity: linked,
                master: *existing,
            });
        }
        if let Some(outer) = data.links.get(&master) {
            // The master is itself linked; chains are not followed.
            return Err(StoreError::AlreadyLinked {
                identity: master,
                master: *outer,
            });
        }

        data.links.insert(linked, master);
        tracing::info!(master = %master, linked = %linked, "Identities linked");
        self.persist(&data)
    }

    fn unlink(&self, linked: Uuid) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if data.links.remove(&linked).is_none() {
            return Err(StoreError::LinkNotFound { identity: linked });
        }
        tracing::info!(linked = %linked, "Identity unlinked");
        self.persist(&data)
    }

    fn linked(&self, master: Uuid) -> Vec<Uuid> {
        self.data
            .read()
            .links
            .iter()
            .filter(|(_, m)| **m == master)
            .map(|(linked, _)| *linked)
            .collect()
    }

    fn master_of(&self, linked: Uuid) -> Option<Uuid> {
        self.data.read().links.get(&linked).copied()
    }
}
