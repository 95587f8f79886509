//! Multi-backend credential orchestration.
//!
//! Every operation selects backends from the registry, runs the per-backend
//! call through the shared [`RetryPolicy`] with bounded fan-out, and folds
//! the per-backend outcomes into one result.

mod labels;
mod outcome;
mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use uuid::Uuid;

use crate::backend::{BackendRegistry, BackendSelector, Placement};
use crate::config::{BackendDescriptor, Config, EndpointProfile, SuccessPolicy};
use crate::executor::{
    Credential, CredentialExecutor, CredentialKey, ErrorCategory, ExecutorError, ExecutorFactory,
    Identity, ProvisionRequest,
};
use crate::store::{CustomerRecord, CustomerStore};

use labels::LabelLocks;
use outcome::Tracker;
pub use outcome::{
    BackendOutcome, BackendReport, CreateRequest, FoundCredential, OperationState,
    ProvisioningResult,
};
pub use retry::{Attempted, RetryPolicy};

/// One day in milliseconds.
pub const DAY_MS: i64 = 86_400_000;

/// Default number of backends contacted at once.
const DEFAULT_FANOUT: usize = 4;

/// Current time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expiry `days` after `from_ms`.
pub fn expiry_after(from_ms: i64, days: u32) -> i64 {
    from_ms.saturating_add(i64::from(days).saturating_mul(DAY_MS))
}

/// Drives credential operations across the backend fleet.
pub struct Orchestrator {
    registry: BackendRegistry,
    executors: Arc<dyn ExecutorFactory>,
    store: Arc<dyn CustomerStore>,
    retry: RetryPolicy,
    success_policy: SuccessPolicy,
    fanout: usize,
    labels: LabelLocks,
}

impl Orchestrator {
    pub fn new(
        registry: BackendRegistry,
        executors: Arc<dyn ExecutorFactory>,
        store: Arc<dyn CustomerStore>,
    ) -> Self {
        Self {
            registry,
            executors,
            store,
            retry: RetryPolicy::default(),
            success_policy: SuccessPolicy::default(),
            fanout: DEFAULT_FANOUT,
            labels: LabelLocks::default(),
        }
    }

    /// Orchestrator tuned by the `[defaults]` section.
    pub fn from_config(
        config: &Config,
        registry: BackendRegistry,
        executors: Arc<dyn ExecutorFactory>,
        store: Arc<dyn CustomerStore>,
    ) -> Self {
        Self::new(registry, executors, store)
            .with_retry_policy(RetryPolicy::from_defaults(&config.defaults))
            .with_success_policy(config.defaults.success_policy)
            .with_fanout_limit(config.defaults.fanout_limit)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_success_policy(mut self, policy: SuccessPolicy) -> Self {
        self.success_policy = policy;
        self
    }

    pub fn with_fanout_limit(mut self, limit: usize) -> Self {
        self.fanout = limit.max(1);
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CustomerStore> {
        &self.store
    }

    /// Backends contacted at once by fan-out operations.
    pub fn fanout_limit(&self) -> usize {
        self.fanout
    }

    /// Create a credential for `request.label` on every eligible backend.
    ///
    /// The label is looked up on every target first. When any backend
    /// already holds it, that identity is reused for the backends that lack
    /// it, so one identity reaches the customer everywhere, and
    /// `already_existed` is set. Creations of the same label through this
    /// orchestrator run one at a time.
    pub async fn create_credential(
        &self,
        request: &CreateRequest,
        selector: &BackendSelector,
    ) -> ProvisioningResult {
        let _held = self.labels.lock(&request.label).await;

        let fresh = Uuid::new_v4();
        let expiry_ms = expiry_after(now_ms(), request.days);
        let targets = self.registry.select(selector, Placement::New);
        let rejected = self.registry.rejected_for(selector);

        if targets.is_empty() {
            let error = rejected
                .first()
                .map(|r| ErrorCategory::ConfigurationInvalid(r.reason.clone()))
                .unwrap_or(ErrorCategory::NoEligibleBackend);
            tracing::warn!(label = %request.label, error = %error, "No backend eligible for creation");
            return ProvisioningResult {
                success: false,
                identity: fresh,
                label: request.label.clone(),
                expiry_ms,
                already_existed: false,
                error: Some(error),
                backends: rejected.into_iter().map(BackendOutcome::rejected).collect(),
            };
        }

        let swept: Vec<(&BackendDescriptor, Attempted<Option<Credential>>)> =
            stream::iter(targets.iter().map(|backend| async move {
                let executor = self.executors.executor_for(backend);
                let found = self
                    .retry
                    .run(executor.as_ref(), || executor.find_by_label(&request.label))
                    .await;
                (backend, found)
            }))
            .buffered(self.fanout)
            .collect()
            .await;

        let existing = swept.iter().find_map(|(_, found)| match &found.result {
            Ok(Some(credential)) => Some(credential.identity),
            _ => None,
        });

        let provision = ProvisionRequest {
            identity: existing.unwrap_or(fresh),
            label: request.label.clone(),
            expiry_ms,
            ip_limit: request.ip_limit,
            quota_bytes: request.quota_bytes,
        };

        let mut outcomes: Vec<BackendOutcome> = stream::iter(
            swept
                .into_iter()
                .map(|(backend, found)| self.place_on(backend, &provision, found)),
        )
        .buffered(self.fanout)
        .collect()
        .await;

        let success = self.policy_satisfied(&targets, &outcomes);
        outcomes.extend(rejected.into_iter().map(BackendOutcome::rejected));

        // A label placed concurrently from elsewhere after the sweep.
        let raced = outcomes
            .iter()
            .find(|o| o.state == OperationState::DuplicateResolved)
            .and_then(|o| o.identity);
        let effective = existing.or(raced).unwrap_or(provision.identity);

        for diverged in outcomes
            .iter()
            .filter(|o| o.state.is_success() && o.identity != Some(effective))
        {
            tracing::warn!(
                backend = %diverged.backend,
                label = %request.label,
                identity = ?diverged.identity,
                effective = %effective,
                "Backend holds the label under another identity"
            );
        }

        let error = if success {
            None
        } else {
            Some(most_specific(&outcomes))
        };
        let result = ProvisioningResult {
            success,
            identity: effective,
            label: request.label.clone(),
            expiry_ms,
            already_existed: existing.is_some() || raced.is_some(),
            error,
            backends: outcomes,
        };

        if success {
            self.remember(&result);
            tracing::info!(
                label = %result.label,
                identity = %result.identity,
                already_existed = result.already_existed,
                accepted = ?result.accepted_by(),
                "Credential provisioned"
            );
        } else {
            tracing::warn!(
                label = %result.label,
                error = ?result.error,
                "Credential provisioning failed"
            );
        }
        result
    }

    /// Finish one backend after the label sweep: keep what it holds, or
    /// create the credential there.
    async fn place_on(
        &self,
        backend: &BackendDescriptor,
        request: &ProvisionRequest,
        swept: Attempted<Option<Credential>>,
    ) -> BackendOutcome {
        let executor = self.executors.executor_for(backend);
        let mut tracker = Tracker::new(&backend.name);
        if backend.is_panel() {
            tracker.advance(OperationState::Authenticating);
        }
        tracker.advance(OperationState::Executing);
        let mut attempts = swept.attempts;

        let (identity, error) = match swept.result {
            Ok(Some(held)) => {
                tracing::info!(backend = %backend.name, label = %request.label, identity = %held.identity, "Label already present");
                tracker.advance(OperationState::DuplicateResolved);
                (Some(held.identity), None)
            }
            Err(e) => {
                tracker.advance(OperationState::Failed);
                (None, Some(e.category()))
            }
            Ok(None) => {
                let created = self
                    .retry
                    .run(executor.as_ref(), || executor.create(request))
                    .await;
                attempts += created.attempts;

                match created.result {
                    Ok(()) => {
                        tracker.advance(OperationState::Success);
                        (Some(request.identity), None)
                    }
                    Err(e) if e.is_duplicate() => {
                        tracing::info!(backend = %backend.name, label = %request.label, "Label exists, resolving");
                        let found = self
                            .retry
                            .run(executor.as_ref(), || executor.find_by_label(&request.label))
                            .await;
                        attempts += found.attempts;
                        match found.result {
                            // An earlier attempt landed but its reply was lost.
                            Ok(Some(held)) if held.identity == request.identity => {
                                tracker.advance(OperationState::Success);
                                (Some(held.identity), None)
                            }
                            Ok(Some(held)) => {
                                tracker.advance(OperationState::DuplicateResolved);
                                (Some(held.identity), None)
                            }
                            Ok(None) => {
                                tracker.advance(OperationState::Failed);
                                (None, Some(e.category()))
                            }
                            Err(lookup) => {
                                tracker.advance(OperationState::Failed);
                                (None, Some(lookup.category()))
                            }
                        }
                    }
                    Err(e) => {
                        tracker.advance(OperationState::Failed);
                        (None, Some(e.category()))
                    }
                }
            }
        };

        BackendOutcome {
            backend: backend.name.clone(),
            state: tracker.state(),
            identity,
            error,
            attempts,
        }
    }

    fn policy_satisfied(&self, targets: &[BackendDescriptor], outcomes: &[BackendOutcome]) -> bool {
        let accepted = |name: &str| {
            outcomes
                .iter()
                .any(|o| o.backend == name && o.state.is_success())
        };
        let any_accepted = outcomes.iter().any(|o| o.state.is_success());

        match self.success_policy {
            SuccessPolicy::Any => any_accepted,
            SuccessPolicy::Primary => {
                let mut primaries = targets.iter().filter(|b| b.primary).peekable();
                if primaries.peek().is_none() {
                    any_accepted
                } else {
                    primaries.any(|b| accepted(&b.name))
                }
            }
            SuccessPolicy::All => targets.iter().all(|b| accepted(&b.name)),
        }
    }

    fn remember(&self, result: &ProvisioningResult) {
        let accepted: Vec<String> = result.accepted_by().into_iter().map(String::from).collect();
        let expiry_ms = self
            .store
            .by_identity(result.identity)
            .map(|existing| existing.expiry_ms)
            .unwrap_or(result.expiry_ms);

        let record = CustomerRecord {
            identity: result.identity,
            label: result.label.clone(),
            expiry_ms,
            home_backend: accepted.first().cloned(),
            backends: accepted,
        };
        if let Err(e) = self.store.record(record) {
            tracing::warn!(identity = %result.identity, error = %e, "Failed to record customer");
        }
    }

    /// Delete the credential from every selected backend holding it.
    ///
    /// Absence is reported as `false`, never as an error.
    pub async fn delete_credential(
        &self,
        key: &CredentialKey,
        selector: &BackendSelector,
    ) -> BackendReport {
        let targets = self.registry.select(selector, Placement::Existing);

        let results: Vec<(String, Result<bool, ExecutorError>)> =
            stream::iter(targets.iter().map(|backend| async move {
                let executor = self.executors.executor_for(backend);
                let deleted = self
                    .retry
                    .run(executor.as_ref(), || executor.delete(key))
                    .await;
                (backend.name.clone(), deleted.result)
            }))
            .buffered(self.fanout)
            .collect()
            .await;

        let mut report = BackendReport::default();
        for (backend, result) in results {
            match result {
                Ok(deleted) => {
                    report.results.insert(backend, deleted);
                }
                Err(e) => {
                    report.results.insert(backend.clone(), false);
                    report.errors.insert(backend, e.category());
                }
            }
        }
        for rejected in self.registry.rejected_for(selector) {
            report.skipped(rejected);
        }

        if report.any() {
            if let Some(identity) = self.resolve_identity(key) {
                if let Err(e) = self.store.remove(identity) {
                    tracing::warn!(identity = %identity, error = %e, "Failed to forget customer");
                }
            }
        }

        tracing::info!(key = %key, results = ?report.results, "Credential deleted");
        report
    }

    fn resolve_identity(&self, key: &CredentialKey) -> Option<Identity> {
        match key {
            CredentialKey::Identity(identity) => Some(*identity),
            CredentialKey::Label(label) => self.store.by_label(label).map(|c| c.identity),
        }
    }

    /// First match on the enabled backends, primary first, with its live profile.
    pub async fn find_credential(&self, key: &CredentialKey) -> Option<FoundCredential> {
        for backend in self
            .registry
            .select(&BackendSelector::All, Placement::Existing)
        {
            let executor = self.executors.executor_for(&backend);
            let found = self
                .retry
                .run(executor.as_ref(), || executor.find(key))
                .await;

            match found.result {
                Ok(Some(credential)) => {
                    let profile = self
                        .profile_for(executor.as_ref(), credential.endpoint_id)
                        .await;
                    return Some(FoundCredential {
                        backend: backend.name.clone(),
                        credential,
                        profile,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backend = %backend.name, key = %key, error = %e, "Lookup failed");
                }
            }
        }
        None
    }

    /// Every enabled backend holding the credential, primary first.
    pub async fn find_everywhere(&self, key: &CredentialKey) -> Vec<(String, Credential)> {
        self.scan(key)
            .await
            .0
            .into_iter()
            .map(|(backend, credential)| (backend.name, credential))
            .collect()
    }

    /// Push the expiry of every copy of the credential to
    /// `max(now, current) + days`.
    pub async fn extend_credential(&self, key: &CredentialKey, days: u32) -> BackendReport {
        let (located, mut report) = self.scan(key).await;
        let now = now_ms();

        let updates: Vec<(String, Identity, i64, Result<bool, ExecutorError>)> =
            stream::iter(located.iter().map(|(backend, credential)| async move {
                let expiry_ms = expiry_after(credential.expiry_ms.max(now), days);
                let executor = self.executors.executor_for(backend);
                let updated = self
                    .retry
                    .run(executor.as_ref(), || {
                        executor.update_expiry(credential.identity, expiry_ms)
                    })
                    .await;
                (
                    backend.name.clone(),
                    credential.identity,
                    expiry_ms,
                    updated.result,
                )
            }))
            .buffered(self.fanout)
            .collect()
            .await;

        let mut latest: BTreeMap<Identity, i64> = BTreeMap::new();
        for (backend, identity, expiry_ms, result) in updates {
            match result {
                Ok(updated) => {
                    if updated {
                        let entry = latest.entry(identity).or_insert(expiry_ms);
                        *entry = (*entry).max(expiry_ms);
                    }
                    report.results.insert(backend, updated);
                }
                Err(e) => {
                    report.results.insert(backend.clone(), false);
                    report.errors.insert(backend, e.category());
                }
            }
        }

        for (identity, expiry_ms) in latest {
            if let Err(e) = self.store.set_expiry(identity, expiry_ms) {
                tracing::warn!(identity = %identity, error = %e, "Failed to record new expiry");
            }
        }

        tracing::info!(key = %key, days, results = ?report.results, "Credential extended");
        report
    }

    /// Locate the credential on every enabled backend.
    async fn scan(
        &self,
        key: &CredentialKey,
    ) -> (Vec<(BackendDescriptor, Credential)>, BackendReport) {
        let targets = self
            .registry
            .select(&BackendSelector::All, Placement::Existing);

        let lookups: Vec<(BackendDescriptor, Result<Option<Credential>, ExecutorError>)> =
            stream::iter(targets.into_iter().map(|backend| async move {
                let executor = self.executors.executor_for(&backend);
                let found = self
                    .retry
                    .run(executor.as_ref(), || executor.find(key))
                    .await;
                (backend, found.result)
            }))
            .buffered(self.fanout)
            .collect()
            .await;

        let mut located = Vec::new();
        let mut report = BackendReport::default();
        for (backend, result) in lookups {
            match result {
                Ok(Some(credential)) => located.push((backend, credential)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backend = %backend.name, key = %key, error = %e, "Lookup failed");
                    report.results.insert(backend.name.clone(), false);
                    report.errors.insert(backend.name, e.category());
                }
            }
        }
        (located, report)
    }

    /// Credential with `identity` on one backend, with its live profile.
    pub async fn lookup_on(
        &self,
        backend: &BackendDescriptor,
        identity: Identity,
    ) -> Result<Option<(Credential, EndpointProfile)>, ExecutorError> {
        let executor = self.executors.executor_for(backend);
        let found = self
            .retry
            .run(executor.as_ref(), || executor.find_by_identity(identity))
            .await
            .result?;

        match found {
            Some(credential) => {
                let profile = self
                    .profile_for(executor.as_ref(), credential.endpoint_id)
                    .await;
                Ok(Some((credential, profile)))
            }
            None => Ok(None),
        }
    }

    /// Live profile, else the static profile for the endpoint, else `main`.
    async fn profile_for(
        &self,
        executor: &dyn CredentialExecutor,
        endpoint_id: u32,
    ) -> EndpointProfile {
        let live = self
            .retry
            .run(executor, || executor.live_profile(endpoint_id))
            .await;

        let backend = executor.backend();
        match live.result {
            Ok(Some(profile)) => profile,
            other => {
                if let Err(e) = other {
                    tracing::warn!(backend = %backend.name, error = %e, "Using static profile");
                }
                backend
                    .profile_for_endpoint(endpoint_id)
                    .or_else(|| backend.main_profile())
                    .cloned()
                    .unwrap_or_else(|| EndpointProfile::new(endpoint_id))
            }
        }
    }
}

/// The most informative failure among the outcomes.
fn most_specific(outcomes: &[BackendOutcome]) -> ErrorCategory {
    outcomes
        .iter()
        .filter_map(|o| o.error.as_ref())
        .max_by_key(|e| e.specificity())
        .cloned()
        .unwrap_or(ErrorCategory::NoEligibleBackend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fake::{backend, credential, FakeFactory};
    use crate::store::MemoryStore;

    struct Harness {
        factory: Arc<FakeFactory>,
        orchestrator: Orchestrator,
    }

    fn harness(backends: Vec<BackendDescriptor>) -> Harness {
        let factory = Arc::new(FakeFactory::default());
        for b in &backends {
            factory.fake(b);
        }
        let orchestrator = Orchestrator::new(
            BackendRegistry::from_backends(backends),
            factory.clone(),
            Arc::new(MemoryStore::new()),
        )
        .with_retry_policy(RetryPolicy::immediate(3));
        Harness {
            factory,
            orchestrator,
        }
    }

    fn unreachable(name: &str) -> ExecutorError {
        ExecutorError::Unreachable {
            backend: name.to_string(),
            reason: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_on_single_backend() {
        let h = harness(vec![backend("EU1")]);
        let before = now_ms();

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("alice", 30, 2), &BackendSelector::All)
            .await;

        assert!(result.success);
        assert!(!result.already_existed);
        assert!(result.error.is_none());
        assert_eq!(result.accepted_by(), vec!["EU1"]);

        let expected = before + 30 * DAY_MS;
        assert!((result.expiry_ms - expected).abs() < 5_000);

        let stored = h.orchestrator.store().by_identity(result.identity).unwrap();
        assert_eq!(stored.label, "alice");
        assert_eq!(stored.home_backend.as_deref(), Some("EU1"));
    }

    #[tokio::test]
    async fn test_second_create_resolves_duplicate() {
        let h = harness(vec![backend("EU1")]);
        let request = CreateRequest::new("alice", 30, 2);

        let first = h
            .orchestrator
            .create_credential(&request, &BackendSelector::All)
            .await;
        let second = h
            .orchestrator
            .create_credential(&request, &BackendSelector::All)
            .await;

        assert!(second.success);
        assert!(second.already_existed);
        assert_eq!(second.identity, first.identity);
        assert_eq!(
            second.outcome("EU1").unwrap().state,
            OperationState::DuplicateResolved
        );
        let eu1 = h.factory.get("EU1").unwrap();
        assert_eq!(eu1.credentials.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_backend_makes_no_calls() {
        let mut eu1 = backend("EU1");
        eu1.enabled = false;
        let h = harness(vec![eu1]);

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("alice", 30, 2), &BackendSelector::All)
            .await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCategory::NoEligibleBackend));
        assert_eq!(h.factory.get("EU1").unwrap().calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_on_unreachable() {
        let h = harness(vec![backend("EU1")]);
        let eu1 = h.factory.get("EU1").unwrap();
        eu1.fail_always(unreachable("EU1"));

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("alice", 30, 2), &BackendSelector::All)
            .await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCategory::Unreachable));
        assert_eq!(eu1.calls(), 3);
        assert_eq!(result.outcome("EU1").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_partial_success_and_policies() {
        let mut eu1 = backend("EU1");
        eu1.primary = true;
        let us1 = backend("US1");

        let h = harness(vec![us1.clone(), eu1.clone()]);
        h.factory
            .get("EU1")
            .unwrap()
            .fail_always(unreachable("EU1"));

        let any = h
            .orchestrator
            .create_credential(&CreateRequest::new("bob", 7, 1), &BackendSelector::All)
            .await;
        assert!(any.success);
        // Primary backends come first.
        assert_eq!(any.backends[0].backend, "EU1");
        assert_eq!(any.accepted_by(), vec!["US1"]);

        let h = harness(vec![us1, eu1]);
        h.factory
            .get("EU1")
            .unwrap()
            .fail_always(unreachable("EU1"));
        let orchestrator = h.orchestrator.with_success_policy(SuccessPolicy::Primary);
        let primary = orchestrator
            .create_credential(&CreateRequest::new("bob", 7, 1), &BackendSelector::All)
            .await;
        assert!(!primary.success);
        assert_eq!(primary.error, Some(ErrorCategory::Unreachable));
    }

    #[tokio::test]
    async fn test_all_policy_requires_every_backend() {
        let h = harness(vec![backend("EU1"), backend("US1")]);
        h.factory
            .get("US1")
            .unwrap()
            .fail_next(ExecutorError::BackendRejected {
                backend: "US1".to_string(),
                reason: "inbound disabled".to_string(),
            });
        let orchestrator = h.orchestrator.with_success_policy(SuccessPolicy::All);

        let result = orchestrator
            .create_credential(&CreateRequest::new("carol", 7, 1), &BackendSelector::All)
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some(ErrorCategory::BackendRejected(
                "inbound disabled".to_string()
            ))
        );
        assert_eq!(result.accepted_by(), vec!["EU1"]);
    }

    #[tokio::test]
    async fn test_auth_failure_resets_and_retries() {
        let h = harness(vec![backend("EU1")]);
        let eu1 = h.factory.get("EU1").unwrap();
        eu1.fail_next(ExecutorError::AuthenticationFailure {
            backend: "EU1".to_string(),
            reason: "HTTP 401".to_string(),
        });

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("dave", 1, 1), &BackendSelector::All)
            .await;
        assert!(result.success);
        assert_eq!(eu1.resets(), 1);
        // Two lookups around the reset, then one create.
        assert_eq!(result.outcome("EU1").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_held_label_identity_reaches_every_backend() {
        let h = harness(vec![backend("A"), backend("B")]);
        let held = Uuid::new_v4();
        h.factory
            .get("A")
            .unwrap()
            .insert(credential(held, "alice"));

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("alice", 30, 2), &BackendSelector::All)
            .await;

        assert!(result.success);
        assert!(result.already_existed);
        assert_eq!(result.identity, held);
        assert_eq!(
            result.outcome("A").unwrap().state,
            OperationState::DuplicateResolved
        );
        let b = result.outcome("B").unwrap();
        assert_eq!(b.state, OperationState::Success);
        assert_eq!(b.identity, Some(held));

        let on_b = h.factory.get("B").unwrap().credentials.lock().clone();
        assert_eq!(on_b.len(), 1);
        assert_eq!(on_b[0].identity, held);

        let subscription = crate::subscription::Aggregator::new(&h.orchestrator)
            .build(held, &[])
            .await;
        assert_eq!(subscription.descriptors.len(), 2);
    }

    #[tokio::test]
    async fn test_lost_reply_after_commit_is_success() {
        let h = harness(vec![backend("EU1")]);
        let eu1 = h.factory.get("EU1").unwrap();
        eu1.lose_next_reply(ExecutorError::Timeout {
            backend: "EU1".to_string(),
            seconds: 15,
        });

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("alice", 30, 2), &BackendSelector::All)
            .await;

        assert!(result.success);
        assert!(!result.already_existed);
        let outcome = result.outcome("EU1").unwrap();
        assert_eq!(outcome.state, OperationState::Success);
        assert_eq!(outcome.identity, Some(result.identity));
        assert_eq!(eu1.credentials.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_identity() {
        let h = harness(vec![backend("A"), backend("B")]);
        let request = CreateRequest::new("alice", 30, 2);

        let (first, second) = tokio::join!(
            h.orchestrator
                .create_credential(&request, &BackendSelector::All),
            h.orchestrator
                .create_credential(&request, &BackendSelector::All),
        );

        assert!(first.success && second.success);
        assert_eq!(first.identity, second.identity);
        for name in ["A", "B"] {
            let held = h.factory.get(name).unwrap().credentials.lock().clone();
            assert_eq!(held.len(), 1);
            assert_eq!(held[0].identity, first.identity);
        }
    }

    #[tokio::test]
    async fn test_failed_lookup_skips_create() {
        let h = harness(vec![backend("EU1"), backend("US1")]);
        let us1 = h.factory.get("US1").unwrap();
        us1.fail_next(ExecutorError::BackendRejected {
            backend: "US1".to_string(),
            reason: "inbound disabled".to_string(),
        });

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("alice", 30, 2), &BackendSelector::All)
            .await;

        assert!(result.success);
        let outcome = result.outcome("US1").unwrap();
        assert_eq!(outcome.state, OperationState::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(us1.calls(), 1);
        assert!(us1.credentials.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_backend_reported_not_fatal() {
        let mut broken = backend("BROKEN");
        broken.profiles.clear();
        let h = harness(vec![backend("EU1"), broken]);

        let result = h
            .orchestrator
            .create_credential(&CreateRequest::new("erin", 1, 1), &BackendSelector::All)
            .await;
        assert!(result.success);
        let skipped = result.outcome("BROKEN").unwrap();
        assert_eq!(skipped.state, OperationState::Failed);
        assert!(matches!(
            skipped.error,
            Some(ErrorCategory::ConfigurationInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_find_everywhere() {
        let h = harness(vec![backend("EU1"), backend("US1")]);
        let created = h
            .orchestrator
            .create_credential(
                &CreateRequest::new("alice", 30, 2),
                &BackendSelector::Named(vec!["EU1".to_string()]),
            )
            .await;

        let found = h
            .orchestrator
            .find_everywhere(&CredentialKey::Label("alice".to_string()))
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "EU1");
        assert_eq!(found[0].1.identity, created.identity);

        let missing = h
            .orchestrator
            .find_everywhere(&CredentialKey::Label("nobody".to_string()))
            .await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_find_returns_live_profile() {
        let h = harness(vec![backend("EU1")]);
        let eu1 = h.factory.get("EU1").unwrap();
        let identity = Uuid::new_v4();
        eu1.insert(credential(identity, "alice"));

        let mut drifted = backend("EU1").main_profile().unwrap().clone();
        drifted.public_key = Some("rotated".to_string());
        *eu1.live.lock() = Some(drifted);

        let found = h
            .orchestrator
            .find_credential(&CredentialKey::Identity(identity))
            .await
            .unwrap();
        assert_eq!(found.backend, "EU1");
        assert_eq!(found.profile.public_key.as_deref(), Some("rotated"));

        assert!(h
            .orchestrator
            .find_credential(&CredentialKey::Label("ghost".to_string()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_per_backend() {
        let h = harness(vec![backend("EU1"), backend("US1"), backend("NL1")]);
        let identity = Uuid::new_v4();
        h.factory
            .get("EU1")
            .unwrap()
            .insert(credential(identity, "alice"));
        h.factory
            .get("NL1")
            .unwrap()
            .fail_always(unreachable("NL1"));

        let report = h
            .orchestrator
            .delete_credential(&CredentialKey::Identity(identity), &BackendSelector::All)
            .await;

        assert_eq!(report.results["EU1"], true);
        assert_eq!(report.results["US1"], false);
        assert_eq!(report.results["NL1"], false);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors["NL1"], ErrorCategory::Unreachable);
        assert!(h.factory.get("EU1").unwrap().credentials.lock().is_empty());
    }

    #[tokio::test]
    async fn test_extend_from_current_expiry() {
        let h = harness(vec![backend("EU1")]);
        let eu1 = h.factory.get("EU1").unwrap();
        let identity = Uuid::new_v4();
        let far_future = now_ms() + 100 * DAY_MS;
        eu1.insert(Credential {
            expiry_ms: far_future,
            ..credential(identity, "alice")
        });

        let report = h
            .orchestrator
            .extend_credential(&CredentialKey::Label("alice".to_string()), 30)
            .await;
        assert!(report.any());
        assert_eq!(
            eu1.credentials.lock()[0].expiry_ms,
            far_future + 30 * DAY_MS
        );
    }

    #[tokio::test]
    async fn test_extend_lapsed_starts_from_now() {
        let h = harness(vec![backend("EU1")]);
        let eu1 = h.factory.get("EU1").unwrap();
        let identity = Uuid::new_v4();
        eu1.insert(Credential {
            expiry_ms: 1_000,
            ..credential(identity, "alice")
        });

        let before = now_ms();
        h.orchestrator
            .extend_credential(&CredentialKey::Identity(identity), 10)
            .await;
        let expiry = eu1.credentials.lock()[0].expiry_ms;
        assert!(expiry >= before + 10 * DAY_MS);
    }
}
