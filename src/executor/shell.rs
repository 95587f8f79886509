//! Executor for backends reached by remote command execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::remote::{CommandRunner, RemoteOp, RemoteReply};
use super::{
    Credential, CredentialExecutor, CredentialKey, ExecutorError, Identity, ProvisionRequest,
};
use crate::config::{BackendDescriptor, EndpointProfile};

pub struct ShellExecutor {
    backend: BackendDescriptor,
    runner: Arc<dyn CommandRunner>,
}

impl ShellExecutor {
    pub fn new(backend: BackendDescriptor, runner: Arc<dyn CommandRunner>) -> Self {
        Self { backend, runner }
    }

    fn name(&self) -> &str {
        &self.backend.name
    }

    fn rejected(&self, reason: impl Into<String>) -> ExecutorError {
        ExecutorError::BackendRejected {
            backend: self.name().to_string(),
            reason: reason.into(),
        }
    }

    fn unexpected(&self, op: &RemoteOp, reply: &RemoteReply) -> ExecutorError {
        self.rejected(format!("unexpected agent reply to {:?}: {:?}", op, reply))
    }

    /// Send one operation. `ERROR:` replies become `BackendRejected`.
    async fn call(&self, op: &RemoteOp) -> Result<RemoteReply, ExecutorError> {
        let request = op
            .encode()
            .map_err(|e| self.rejected(format!("cannot encode request: {}", e)))?;
        let output = self.runner.run(&request).await?;

        match RemoteReply::parse(&output) {
            Some(RemoteReply::Error(reason)) => Err(self.rejected(reason)),
            Some(reply) => Ok(reply),
            None => Err(self.rejected(format!("unrecognised agent reply: {}", output.trim()))),
        }
    }

    /// Mutation followed by a service restart so the change takes effect.
    ///
    /// A failed restart is logged, not reported: the store already changed.
    async fn mutate(&self, op: &RemoteOp) -> Result<RemoteReply, ExecutorError> {
        let reply = self.call(op).await?;
        if matches!(reply, RemoteReply::Ok(n) if n > 0) && op.is_mutation() {
            match self.call(&RemoteOp::Restart).await {
                Ok(_) => tracing::debug!(backend = %self.name(), "Service restarted"),
                Err(e) => {
                    tracing::warn!(backend = %self.name(), error = %e, "Service restart failed")
                }
            }
        }
        Ok(reply)
    }

    fn decode<T: DeserializeOwned>(&self, value: Value) -> Result<T, ExecutorError> {
        serde_json::from_value(value)
            .map_err(|e| self.rejected(format!("malformed agent data: {}", e)))
    }

    async fn find_one(&self, op: RemoteOp) -> Result<Option<Credential>, ExecutorError> {
        match self.call(&op).await? {
            RemoteReply::Data(Value::Null) | RemoteReply::NotFound => Ok(None),
            RemoteReply::Data(value) => self.decode(value).map(Some),
            other => Err(self.unexpected(&op, &other)),
        }
    }
}

#[async_trait]
impl CredentialExecutor for ShellExecutor {
    fn backend(&self) -> &BackendDescriptor {
        &self.backend
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<(), ExecutorError> {
        let main = self
            .backend
            .main_profile()
            .ok_or_else(|| ExecutorError::NotFound {
                backend: self.name().to_string(),
                what: "endpoint profile 'main'".to_string(),
            })?;

        let op = RemoteOp::Create {
            endpoint_id: main.id,
            identity: request.identity,
            label: request.label.clone(),
            expiry_ms: request.expiry_ms,
            ip_limit: request.ip_limit,
            quota_bytes: request.quota_bytes,
            flow: main.flow.clone(),
        };

        match self.mutate(&op).await? {
            RemoteReply::Ok(_) => {
                tracing::info!(backend = %self.name(), label = %request.label, "Credential created");
                Ok(())
            }
            RemoteReply::Exists => {
                Err(self.rejected(format!("Duplicate label '{}'", request.label)))
            }
            RemoteReply::NotFound => Err(ExecutorError::NotFound {
                backend: self.name().to_string(),
                what: format!("endpoint {}", main.id),
            }),
            other => Err(self.unexpected(&op, &other)),
        }
    }

    async fn delete(&self, key: &CredentialKey) -> Result<bool, ExecutorError> {
        let op = match key {
            CredentialKey::Identity(identity) => RemoteOp::Delete {
                identity: Some(*identity),
                label: None,
            },
            CredentialKey::Label(label) => RemoteOp::Delete {
                identity: None,
                label: Some(label.clone()),
            },
        };

        match self.mutate(&op).await? {
            RemoteReply::Ok(count) => {
                if count > 0 {
                    tracing::info!(backend = %self.name(), key = %key, count, "Credential deleted");
                }
                Ok(count > 0)
            }
            RemoteReply::NotFound => Ok(false),
            other => Err(self.unexpected(&op, &other)),
        }
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<Credential>, ExecutorError> {
        self.find_one(RemoteOp::Find {
            identity: None,
            label: Some(label.to_string()),
        })
        .await
    }

    async fn find_by_identity(
        &self,
        identity: Identity,
    ) -> Result<Option<Credential>, ExecutorError> {
        self.find_one(RemoteOp::Find {
            identity: Some(identity),
            label: None,
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Credential>, ExecutorError> {
        match self.call(&RemoteOp::List).await? {
            RemoteReply::Data(value) => self.decode(value),
            RemoteReply::NotFound => Ok(Vec::new()),
            other => Err(self.unexpected(&RemoteOp::List, &other)),
        }
    }

    async fn live_profile(
        &self,
        endpoint_id: u32,
    ) -> Result<Option<EndpointProfile>, ExecutorError> {
        let op = RemoteOp::Profile { endpoint_id };
        let mut live: EndpointProfile = match self.call(&op).await? {
            RemoteReply::Data(Value::Null) | RemoteReply::NotFound => return Ok(None),
            RemoteReply::Data(value) => self.decode(value)?,
            other => return Err(self.unexpected(&op, &other)),
        };

        if let Some(configured) = self.backend.profile_for_endpoint(endpoint_id) {
            live.name_prefix = configured.name_prefix.clone();
            if live.port.is_none() {
                live.port = configured.port;
            }
        }
        Ok(Some(live))
    }

    async fn update_expiry(
        &self,
        identity: Identity,
        expiry_ms: i64,
    ) -> Result<bool, ExecutorError> {
        let op = RemoteOp::UpdateExpiry {
            identity,
            expiry_ms,
        };
        match self.mutate(&op).await? {
            RemoteReply::Ok(count) => Ok(count > 0),
            RemoteReply::NotFound => Ok(false),
            other => Err(self.unexpected(&op, &other)),
        }
    }
}
