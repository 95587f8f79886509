//! Transport executors.
//!
//! Both transports implement [`CredentialExecutor`]; which one serves a
//! backend is decided once, from its descriptor, by [`TransportFactory`].

mod error;
#[cfg(test)]
pub(crate) mod fake;
mod panel;
mod panel_api;
mod remote;
mod shell;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BackendDescriptor, Defaults, EndpointProfile, TransportConfig};
use crate::session::SessionManager;

pub use error::{ErrorCategory, ExecutorError, DUPLICATE_MARKER};
pub use panel::PanelExecutor;
pub use remote::{CommandRunner, RemoteOp, RemoteReply, SshRunner, PROTOCOL_VERSION};
pub use shell::ShellExecutor;

/// Stable token of one provisioned credential.
pub type Identity = Uuid;

/// A credential as stored on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identity: Identity,
    /// Human-chosen identifier used for duplicate detection.
    pub label: String,
    /// Backend-local endpoint the credential belongs to.
    pub endpoint_id: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Expiry as unix milliseconds; 0 means never.
    #[serde(default)]
    pub expiry_ms: i64,
    #[serde(default)]
    pub ip_limit: u32,
    /// Traffic quota in bytes; 0 means unlimited.
    #[serde(default)]
    pub quota_bytes: u64,
    #[serde(default)]
    pub flow: Option<String>,
    /// Bytes sent by the client.
    #[serde(default)]
    pub upload: u64,
    /// Bytes received by the client.
    #[serde(default)]
    pub download: u64,
}

fn default_enabled() -> bool {
    true
}

/// Everything a backend needs to place a new credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub identity: Identity,
    pub label: String,
    pub expiry_ms: i64,
    pub ip_limit: u32,
    pub quota_bytes: u64,
}

/// How a caller refers to a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    Identity(Identity),
    Label(String),
}

impl CredentialKey {
    /// UUID-shaped input is an identity, anything else a label.
    pub fn parse(input: &str) -> Self {
        match Uuid::parse_str(input.trim()) {
            Ok(identity) => CredentialKey::Identity(identity),
            Err(_) => CredentialKey::Label(input.trim().to_string()),
        }
    }

    pub fn matches(&self, credential: &Credential) -> bool {
        match self {
            CredentialKey::Identity(identity) => &credential.identity == identity,
            CredentialKey::Label(label) => &credential.label == label,
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKey::Identity(identity) => write!(f, "{}", identity),
            CredentialKey::Label(label) => write!(f, "{}", label),
        }
    }
}

/// Credential operations against one backend.
///
/// Implementations perform a single attempt per call. Retrying, duplicate
/// resolution and aggregation belong to the orchestrator.
#[async_trait]
pub trait CredentialExecutor: Send + Sync {
    /// Descriptor this executor was built from.
    fn backend(&self) -> &BackendDescriptor;

    /// Place a credential on the backend's `main` endpoint.
    ///
    /// A label collision surfaces as a duplicate `BackendRejected`.
    async fn create(&self, request: &ProvisionRequest) -> Result<(), ExecutorError>;

    /// Remove every credential matching the key. `Ok(false)` when absent.
    async fn delete(&self, key: &CredentialKey) -> Result<bool, ExecutorError>;

    async fn find_by_label(&self, label: &str) -> Result<Option<Credential>, ExecutorError>;

    async fn find_by_identity(
        &self,
        identity: Identity,
    ) -> Result<Option<Credential>, ExecutorError>;

    async fn list(&self) -> Result<Vec<Credential>, ExecutorError>;

    /// Endpoint profile as currently configured on the backend.
    async fn live_profile(
        &self,
        endpoint_id: u32,
    ) -> Result<Option<EndpointProfile>, ExecutorError>;

    /// Set a new expiry on every copy of the credential. `Ok(false)` when absent.
    async fn update_expiry(
        &self,
        identity: Identity,
        expiry_ms: i64,
    ) -> Result<bool, ExecutorError>;

    /// Forget any authentication state so the next call starts fresh.
    fn reset_session(&self) {}

    async fn find(&self, key: &CredentialKey) -> Result<Option<Credential>, ExecutorError> {
        match key {
            CredentialKey::Identity(identity) => self.find_by_identity(*identity).await,
            CredentialKey::Label(label) => self.find_by_label(label).await,
        }
    }
}

/// Source of executors for backend descriptors.
pub trait ExecutorFactory: Send + Sync {
    fn executor_for(&self, backend: &BackendDescriptor) -> Arc<dyn CredentialExecutor>;
}

/// Builds the executor matching each descriptor's transport.
///
/// Executors are cached by backend name and rebuilt only when the
/// descriptor changes.
pub struct TransportFactory {
    sessions: Arc<SessionManager>,
    verifying_client: Client,
    lenient_client: Client,
    request_timeout: Duration,
    shell_timeout: Duration,
    cache: Mutex<HashMap<String, Arc<dyn CredentialExecutor>>>,
}

impl TransportFactory {
    pub fn new(defaults: &Defaults, sessions: Arc<SessionManager>) -> Result<Self, reqwest::Error> {
        let verifying_client = Client::builder()
            .connect_timeout(defaults.connect_timeout())
            .build()?;
        let lenient_client = Client::builder()
            .connect_timeout(defaults.connect_timeout())
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            sessions,
            verifying_client,
            lenient_client,
            request_timeout: defaults.request_timeout(),
            shell_timeout: defaults.shell_timeout(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn build(&self, backend: &BackendDescriptor) -> Arc<dyn CredentialExecutor> {
        match &backend.transport {
            TransportConfig::Panel(panel) => {
                let client = if panel.verify_tls {
                    self.verifying_client.clone()
                } else {
                    self.lenient_client.clone()
                };
                Arc::new(PanelExecutor::new(
                    backend.clone(),
                    panel.clone(),
                    client,
                    self.sessions.clone(),
                    self.request_timeout,
                ))
            }
            TransportConfig::Shell(shell) => {
                let runner = SshRunner::new(
                    &backend.name,
                    &backend.address,
                    shell.clone(),
                    self.shell_timeout,
                );
                Arc::new(ShellExecutor::new(backend.clone(), Arc::new(runner)))
            }
        }
    }
}

impl ExecutorFactory for TransportFactory {
    fn executor_for(&self, backend: &BackendDescriptor) -> Arc<dyn CredentialExecutor> {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&backend.name) {
            if existing.backend() == backend {
                return existing.clone();
            }
        }

        let executor = self.build(backend);
        cache.insert(backend.name.clone(), executor.clone());
        executor
    }
}
