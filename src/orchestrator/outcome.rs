//! Result types handed to collaborators.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::backend::RejectedBackend;
use crate::config::EndpointProfile;
use crate::executor::{Credential, ErrorCategory};

/// Per-backend progress of one orchestrated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Init,
    Authenticating,
    Executing,
    Success,
    DuplicateResolved,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Success | OperationState::DuplicateResolved | OperationState::Failed
        )
    }

    /// The backend holds the credential at the end of the call.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            OperationState::Success | OperationState::DuplicateResolved
        )
    }
}

/// Walks one backend through [`OperationState`], logging each transition.
pub(crate) struct Tracker<'a> {
    backend: &'a str,
    state: OperationState,
}

impl<'a> Tracker<'a> {
    pub fn new(backend: &'a str) -> Self {
        Self {
            backend,
            state: OperationState::Init,
        }
    }

    pub fn advance(&mut self, next: OperationState) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!(backend = %self.backend, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    pub fn state(&self) -> OperationState {
        self.state
    }
}

/// What happened on one backend during an aggregate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendOutcome {
    pub backend: String,
    pub state: OperationState,
    /// Identity the backend now holds, when it holds one.
    pub identity: Option<Uuid>,
    pub error: Option<ErrorCategory>,
    pub attempts: u32,
}

impl BackendOutcome {
    /// Outcome for a backend skipped because its descriptor is unusable.
    pub fn rejected(rejected: RejectedBackend) -> Self {
        Self {
            backend: rejected.name,
            state: OperationState::Failed,
            identity: None,
            error: Some(ErrorCategory::ConfigurationInvalid(rejected.reason)),
            attempts: 0,
        }
    }
}

/// Aggregate result of a credential creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningResult {
    pub success: bool,
    /// Effective identity. Differs from the generated one when an existing
    /// credential with the same label was reused.
    pub identity: Uuid,
    pub label: String,
    /// Requested expiry, unix milliseconds.
    pub expiry_ms: i64,
    pub already_existed: bool,
    /// Most specific failure when `success` is false.
    pub error: Option<ErrorCategory>,
    /// Breakdown in primary-first order; skipped backends last.
    pub backends: Vec<BackendOutcome>,
}

impl ProvisioningResult {
    /// Names of the backends holding the credential.
    pub fn accepted_by(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|o| o.state.is_success())
            .map(|o| o.backend.as_str())
            .collect()
    }

    pub fn outcome(&self, backend: &str) -> Option<&BackendOutcome> {
        self.backends.iter().find(|o| o.backend == backend)
    }
}

/// Per-backend result of a delete or expiry update.
///
/// `results[name]` is false both when the credential was absent and when the
/// backend failed; failures also appear in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendReport {
    pub results: BTreeMap<String, bool>,
    pub errors: BTreeMap<String, ErrorCategory>,
}

impl BackendReport {
    pub fn any(&self) -> bool {
        self.results.values().any(|changed| *changed)
    }

    /// Every contacted backend answered.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn skipped(&mut self, rejected: RejectedBackend) {
        self.results.insert(rejected.name.clone(), false);
        self.errors.insert(
            rejected.name,
            ErrorCategory::ConfigurationInvalid(rejected.reason),
        );
    }
}

/// A located credential with the profile needed to connect to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoundCredential {
    pub backend: String,
    pub credential: Credential,
    /// Live profile of the credential's endpoint, falling back to the
    /// statically configured one when the backend cannot report it.
    pub profile: EndpointProfile,
}

/// Operator input for a new credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub label: String,
    pub days: u32,
    pub ip_limit: u32,
    /// 0 means unlimited.
    pub quota_bytes: u64,
}

impl CreateRequest {
    pub fn new(label: impl Into<String>, days: u32, ip_limit: u32) -> Self {
        Self {
            label: label.into(),
            days,
            ip_limit,
            quota_bytes: 0,
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_stops_at_terminal_state() {
        let mut tracker = Tracker::new("EU1");
        tracker.advance(OperationState::Executing);
        tracker.advance(OperationState::Success);
        tracker.advance(OperationState::Failed);
        assert_eq!(tracker.state(), OperationState::Success);
    }

    #[test]
    fn test_report_accounting() {
        let mut report = BackendReport::default();
        report.results.insert("EU1".to_string(), true);
        report.skipped(RejectedBackend {
            name: "US1".to_string(),
            reason: "missing main profile".to_string(),
        });

        assert!(report.any());
        assert!(!report.is_complete());
        assert_eq!(report.results["US1"], false);
        assert_eq!(
            report.errors["US1"],
            ErrorCategory::ConfigurationInvalid("missing main profile".to_string())
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_value(OperationState::DuplicateResolved).unwrap();
        assert_eq!(json, "duplicate_resolved");
    }
}
