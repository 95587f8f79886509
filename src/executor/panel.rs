//! Executor for backends managed through the HTTP panel API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::panel_api::{ClientsPayload, Envelope, Inbound, PanelClient};
use super::{
    Credential, CredentialExecutor, CredentialKey, ExecutorError, Identity, ProvisionRequest,
};
use crate::config::{BackendDescriptor, EndpointProfile, PanelConfig};
use crate::session::{transport_error, Session, SessionManager};

const LIST_INBOUNDS: &str = "panel/api/inbounds/list";
const ADD_CLIENT: &str = "panel/api/inbounds/addClient";

pub struct PanelExecutor {
    backend: BackendDescriptor,
    panel: PanelConfig,
    client: Client,
    sessions: Arc<SessionManager>,
    timeout: Duration,
}

impl PanelExecutor {
    pub fn new(
        backend: BackendDescriptor,
        panel: PanelConfig,
        client: Client,
        sessions: Arc<SessionManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            panel,
            client,
            sessions,
            timeout,
        }
    }

    fn name(&self) -> &str {
        &self.backend.name
    }

    async fn session(&self) -> Result<Session, ExecutorError> {
        self.sessions
            .acquire(&self.client, self.name(), &self.panel)
            .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Envelope<T>, ExecutorError> {
        let session = self.session().await?;
        let request = self.client.get(format!("{}/{}", session.base_url, path));
        self.send(request, &session).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<Envelope<T>, ExecutorError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let session = self.session().await?;
        let request = self
            .client
            .post(format!("{}/{}", session.base_url, path))
            .json(body);
        self.send(request, &session).await
    }

    /// One exchange. Anything that looks like a lost session invalidates it
    /// and surfaces as `AuthenticationFailure` for the caller to retry.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        session: &Session,
    ) -> Result<Envelope<T>, ExecutorError> {
        let response = request
            .header(COOKIE, session.cookie_header())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.sessions.invalidate(self.name());
                transport_error(self.name(), &e, self.timeout)
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.lost_session(format!("HTTP {}", status.as_u16())));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ExecutorError::NotFound {
                backend: self.name().to_string(),
                what: response.url().path().to_string(),
            });
        }
        if !status.is_success() {
            return Err(ExecutorError::BackendRejected {
                backend: self.name().to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        if !is_json {
            return Err(self.lost_session("login page returned instead of data".to_string()));
        }

        response
            .json::<Envelope<T>>()
            .await
            .map_err(|_| self.lost_session("malformed JSON reply".to_string()))
    }

    fn lost_session(&self, reason: String) -> ExecutorError {
        self.sessions.invalidate(self.name());
        ExecutorError::AuthenticationFailure {
            backend: self.name().to_string(),
            reason,
        }
    }

    fn accepted<T>(&self, envelope: Envelope<T>) -> Result<Option<T>, ExecutorError> {
        if envelope.success {
            return Ok(envelope.obj);
        }
        let reason = if envelope.msg.is_empty() {
            "request refused".to_string()
        } else {
            envelope.msg
        };
        Err(ExecutorError::BackendRejected {
            backend: self.name().to_string(),
            reason,
        })
    }

    fn encode_error(&self, err: serde_json::Error) -> ExecutorError {
        ExecutorError::BackendRejected {
            backend: self.name().to_string(),
            reason: format!("cannot encode request: {}", err),
        }
    }

    async fn inbounds(&self) -> Result<Vec<Inbound>, ExecutorError> {
        let envelope = self.get::<Vec<Inbound>>(LIST_INBOUNDS).await?;
        Ok(self.accepted(envelope)?.unwrap_or_default())
    }

    async fn inbound(&self, id: u32) -> Result<Option<Inbound>, ExecutorError> {
        match self
            .get::<Inbound>(&format!("panel/api/inbounds/get/{}", id))
            .await
        {
            Ok(envelope) if !envelope.success => Ok(None),
            Ok(envelope) => Ok(envelope.obj),
            Err(ExecutorError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CredentialExecutor for PanelExecutor {
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

        // Clients on the inbound carry the flow the panel actually serves.
        let flow = match self.live_profile(main.id).await {
            Ok(Some(live)) => live.flow,
            Ok(None) => main.flow.clone(),
            Err(e) => {
                tracing::debug!(backend = %self.name(), error = %e, "Live profile unavailable, using configured flow");
                main.flow.clone()
            }
        };

        let client = PanelClient::from_request(request, flow.as_deref());
        let client = serde_json::to_value(client).map_err(|e| self.encode_error(e))?;
        let payload = ClientsPayload::new(main.id, &[client]).map_err(|e| self.encode_error(e))?;

        let envelope = self.post::<Value, _>(ADD_CLIENT, &payload).await?;
        self.accepted(envelope)?;

        tracing::info!(
            backend = %self.name(),
            label = %request.label,
            endpoint = main.id,
            "Credential created"
        );
        Ok(())
    }

    async fn delete(&self, key: &CredentialKey) -> Result<bool, ExecutorError> {
        let targets: Vec<Credential> = self
            .list()
            .await?
            .into_iter()
            .filter(|c| key.matches(c))
            .collect();

        for credential in &targets {
            let path = format!(
                "panel/api/inbounds/{}/delClient/{}",
                credential.endpoint_id, credential.identity
            );
            let envelope = self.post::<Value, _>(&path, &Value::Null).await?;
            self.accepted(envelope)?;
            tracing::info!(
                backend = %self.name(),
                label = %credential.label,
                endpoint = credential.endpoint_id,
                "Credential deleted"
            );
        }

        Ok(!targets.is_empty())
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<Credential>, ExecutorError> {
        Ok(self.list().await?.into_iter().find(|c| c.label == label))
    }

    async fn find_by_identity(
        &self,
        identity: Identity,
    ) -> Result<Option<Credential>, ExecutorError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|c| c.identity == identity))
    }

    async fn list(&self) -> Result<Vec<Credential>, ExecutorError> {
        Ok(self
            .inbounds()
            .await?
            .iter()
            .flat_map(Inbound::credentials)
            .collect())
    }

    async fn live_profile(
        &self,
        endpoint_id: u32,
    ) -> Result<Option<EndpointProfile>, ExecutorError> {
        let inbound = self.inbound(endpoint_id).await?;
        Ok(inbound.map(|i| i.live_profile(self.backend.profile_for_endpoint(endpoint_id))))
    }

    async fn update_expiry(
        &self,
        identity: Identity,
        expiry_ms: i64,
    ) -> Result<bool, ExecutorError> {
        let id = identity.to_string();
        let mut updated = false;

        for inbound in self.inbounds().await? {
            for mut raw in inbound.raw_clients() {
                if raw.get("id").and_then(Value::as_str) != Some(id.as_str()) {
                    continue;
                }
                let Some(fields) = raw.as_object_mut() else {
                    continue;
                };
                fields.insert("expiryTime".to_string(), Value::from(expiry_ms));
                let payload =
                    ClientsPayload::new(inbound.id, &[raw]).map_err(|e| self.encode_error(e))?;
                let path = format!("panel/api/inbounds/updateClient/{}", id);
                let envelope = self.post::<Value, _>(&path, &payload).await?;
                self.accepted(envelope)?;
                updated = true;
            }
        }

        if updated {
            tracing::info!(backend = %self.name(), identity = %identity, expiry_ms, "Expiry updated");
        }
        Ok(updated)
    }

    fn reset_session(&self) {
        self.sessions.invalidate(self.name());
    }
}
