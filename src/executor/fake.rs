//! In-memory executor used by unit tests across the crate.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    Credential, CredentialExecutor, CredentialKey, ExecutorError, ExecutorFactory, Identity,
    ProvisionRequest,
};
use crate::config::{
    BackendDescriptor, EndpointProfile, SecurityMode, ShellConfig, TransportConfig, MAIN_PROFILE,
};

/// Descriptor with a reality `main` profile on endpoint 1.
pub(crate) fn backend(name: &str) -> BackendDescriptor {
    let mut main = EndpointProfile::new(1);
    main.security = SecurityMode::Reality;
    main.sni = Some("www.example.com".to_string());
    main.public_key = Some("pbk".to_string());
    main.short_id = Some("ab12".to_string());
    main.fingerprint = Some("chrome".to_string());
    main.flow = Some("xtls-rprx-vision".to_string());
    main.name_prefix = Some(name.to_string());

    let mut profiles = BTreeMap::new();
    profiles.insert(MAIN_PROFILE.to_string(), main);

    BackendDescriptor {
        name: name.to_string(),
        address: format!("{}.example.net", name.to_lowercase()),
        domain: None,
        port: 443,
        enabled: true,
        accepts_new: true,
        primary: false,
        transport: TransportConfig::Shell(ShellConfig {
            user: "root".to_string(),
            port: 22,
            password: None,
            identity_file: Some("/root/.ssh/id_ed25519".into()),
            agent_command: "keyfleet-agent".to_string(),
            ssh_binary: "ssh".to_string(),
        }),
        profiles,
    }
}

pub(crate) fn credential(identity: Identity, label: &str) -> Credential {
    Credential {
        identity,
        label: label.to_string(),
        endpoint_id: 1,
        enabled: true,
        expiry_ms: 0,
        ip_limit: 2,
        quota_bytes: 0,
        flow: None,
        upload: 0,
        download: 0,
    }
}

/// Backend whose credential store is a vector.
///
/// Injected failures are returned, in order, before any real work happens.
/// A sticky failure is returned by every call. A lost reply is returned by
/// `create` after the credential has been stored.
pub(crate) struct FakeExecutor {
    backend: BackendDescriptor,
    pub credentials: Mutex<Vec<Credential>>,
    failures: Mutex<VecDeque<ExecutorError>>,
    sticky: Mutex<Option<ExecutorError>>,
    lost_replies: Mutex<VecDeque<ExecutorError>>,
    pub live: Mutex<Option<EndpointProfile>>,
    calls: AtomicU32,
    resets: AtomicU32,
}

impl FakeExecutor {
    pub fn new(backend: BackendDescriptor) -> Self {
        Self {
            backend,
            credentials: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            sticky: Mutex::new(None),
            lost_replies: Mutex::new(VecDeque::new()),
            live: Mutex::new(None),
            calls: AtomicU32::new(0),
            resets: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, error: ExecutorError) {
        self.failures.lock().push_back(error);
    }

    pub fn fail_always(&self, error: ExecutorError) {
        *self.sticky.lock() = Some(error);
    }

    /// The next successful create still stores the credential but fails.
    pub fn lose_next_reply(&self, error: ExecutorError) {
        self.lost_replies.lock().push_back(error);
    }

    pub fn insert(&self, credential: Credential) {
        self.credentials.lock().push(credential);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.sticky.lock().clone() {
            return Err(error);
        }
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CredentialExecutor for FakeExecutor {
    fn backend(&self) -> &BackendDescriptor {
        &self.backend
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<(), ExecutorError> {
        self.enter()?;
        let mut credentials = self.credentials.lock();
        if credentials.iter().any(|c| c.label == request.label) {
            return Err(ExecutorError::BackendRejected {
                backend: self.backend.name.clone(),
                reason: format!("Duplicate email: {}", request.label),
            });
        }
        credentials.push(Credential {
            expiry_ms: request.expiry_ms,
            ip_limit: request.ip_limit,
            quota_bytes: request.quota_bytes,
            ..credential(request.identity, &request.label)
        });
        match self.lost_replies.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn delete(&self, key: &CredentialKey) -> Result<bool, ExecutorError> {
        self.enter()?;
        let mut credentials = self.credentials.lock();
        let before = credentials.len();
        credentials.retain(|c| !key.matches(c));
        Ok(credentials.len() != before)
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<Credential>, ExecutorError> {
        self.enter()?;
        Ok(self
            .credentials
            .lock()
            .iter()
            .find(|c| c.label == label)
            .cloned())
    }

    async fn find_by_identity(
        &self,
        identity: Identity,
    ) -> Result<Option<Credential>, ExecutorError> {
        self.enter()?;
        Ok(self
            .credentials
            .lock()
            .iter()
            .find(|c| c.identity == identity)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Credential>, ExecutorError> {
        self.enter()?;
        Ok(self.credentials.lock().clone())
    }

    async fn live_profile(
        &self,
        endpoint_id: u32,
    ) -> Result<Option<EndpointProfile>, ExecutorError> {
        self.enter()?;
        if let Some(live) = self.live.lock().clone() {
            return Ok(Some(live));
        }
        Ok(self.backend.profile_for_endpoint(endpoint_id).cloned())
    }

    async fn update_expiry(
        &self,
        identity: Identity,
        expiry_ms: i64,
    ) -> Result<bool, ExecutorError> {
        self.enter()?;
        let mut updated = false;
        for credential in self.credentials.lock().iter_mut() {
            if credential.identity == identity {
                credential.expiry_ms = expiry_ms;
                updated = true;
            }
        }
        Ok(updated)
    }

    fn reset_session(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one [`FakeExecutor`] per backend name.
#[derive(Default)]
pub(crate) struct FakeFactory {
    executors: Mutex<HashMap<String, Arc<FakeExecutor>>>,
}

impl FakeFactory {
    /// The executor for `name`, created on first use.
    pub fn fake(&self, descriptor: &BackendDescriptor) -> Arc<FakeExecutor> {
        self.executors
            .lock()
            .entry(descriptor.name.clone())
            .or_insert_with(|| Arc::new(FakeExecutor::new(descriptor.clone())))
            .clone()
    }

    /// Executor previously handed out for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<FakeExecutor>> {
        self.executors.lock().get(name).cloned()
    }
}

impl ExecutorFactory for FakeFactory {
    fn executor_for(&self, backend: &BackendDescriptor) -> Arc<dyn CredentialExecutor> {
        self.fake(backend)
    }
}
