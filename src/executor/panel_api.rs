//! Wire types of the panel management API.
//!
//! Inbound `settings` and `streamSettings` arrive as JSON encoded strings and
//! are decoded in a second pass.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Credential, ProvisionRequest};
use crate::config::{EndpointProfile, SecurityMode};

/// Envelope wrapping every panel reply.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub obj: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Inbound {
    pub id: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub settings: String,
    #[serde(default)]
    pub stream_settings: String,
    #[serde(default)]
    pub client_stats: Option<Vec<ClientTraffic>>,
}

/// Per-client traffic counters reported next to an inbound.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClientTraffic {
    pub email: String,
    #[serde(default)]
    pub up: u64,
    #[serde(default)]
    pub down: u64,
}

#[derive(Debug, Default, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<Value>,
}

/// A client entry inside an inbound's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PanelClient {
    pub id: String,
    #[serde(default)]
    pub alter_id: u32,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub limit_ip: u32,
    #[serde(rename = "totalGB", default)]
    pub total_gb: u64,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub tg_id: Value,
    #[serde(default)]
    pub sub_id: String,
    #[serde(default)]
    pub flow: String,
}

fn default_enable() -> bool {
    true
}

impl PanelClient {
    pub fn from_request(request: &ProvisionRequest, flow: Option<&str>) -> Self {
        Self {
            id: request.identity.to_string(),
            alter_id: 0,
            email: request.label.clone(),
            limit_ip: request.ip_limit,
            total_gb: request.quota_bytes,
            expiry_time: request.expiry_ms,
            enable: true,
            tg_id: Value::String(String::new()),
            sub_id: String::new(),
            flow: flow.unwrap_or_default().to_string(),
        }
    }
}

/// Body of `addClient` / `updateClient`: the inbound id plus a JSON encoded
/// `{"clients": [...]}` document.
#[derive(Debug, Serialize)]
pub(crate) struct ClientsPayload {
    pub id: u32,
    pub settings: String,
}

impl ClientsPayload {
    pub fn new(inbound_id: u32, clients: &[Value]) -> Result<Self, serde_json::Error> {
        let settings = serde_json::to_string(&serde_json::json!({ "clients": clients }))?;
        Ok(Self {
            id: inbound_id,
            settings,
        })
    }
}

impl Inbound {
    /// Raw client entries, kept as JSON so updates round-trip unknown fields.
    pub fn raw_clients(&self) -> Vec<Value> {
        if self.settings.trim().is_empty() {
            return Vec::new();
        }
        serde_json::from_str::<InboundSettings>(&self.settings)
            .map(|s| s.clients)
            .unwrap_or_default()
    }

    /// Clients of this inbound projected onto [`Credential`].
    ///
    /// Entries whose id is not a UUID are skipped.
    pub fn credentials(&self) -> Vec<Credential> {
        self.raw_clients()
            .into_iter()
            .filter_map(|raw| serde_json::from_value::<PanelClient>(raw).ok())
            .filter_map(|client| self.to_credential(client))
            .collect()
    }

    fn to_credential(&self, client: PanelClient) -> Option<Credential> {
        let identity = Uuid::parse_str(&client.id).ok()?;
        let (upload, download) = self
            .client_stats
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|t| t.email == client.email)
            .map(|t| (t.up, t.down))
            .unwrap_or((0, 0));

        Some(Credential {
            identity,
            label: client.email,
            endpoint_id: self.id,
            enabled: client.enable,
            expiry_ms: client.expiry_time,
            ip_limit: client.limit_ip,
            quota_bytes: client.total_gb,
            flow: Some(client.flow).filter(|f| !f.is_empty()),
            upload,
            download,
        })
    }

    /// Live endpoint profile read from `streamSettings`, layered over the
    /// statically configured one. Static values survive where the panel is
    /// silent; the naming prefix is always static.
    pub fn live_profile(&self, fallback: Option<&EndpointProfile>) -> EndpointProfile {
        let mut profile = fallback
            .cloned()
            .unwrap_or_else(|| EndpointProfile::new(self.id));
        profile.id = self.id;
        if self.port != 0 {
            profile.port = Some(self.port);
        }

        let stream: StreamSettings =
            serde_json::from_str(&self.stream_settings).unwrap_or_default();
        if let Some(network) = stream.network.filter(|n| !n.is_empty()) {
            profile.network = network;
        }
        if let Some(security) = stream.security {
            profile.security = SecurityMode::from_panel(&security);
        }

        match profile.security {
            SecurityMode::Reality => {
                let reality = stream.reality_settings.unwrap_or_default();
                override_with(&mut profile.sni, reality.server_names.into_iter().next());
                override_with(&mut profile.short_id, reality.short_ids.into_iter().next());
                override_with(&mut profile.public_key, reality.settings.public_key);
                override_with(&mut profile.fingerprint, reality.settings.fingerprint);
            }
            SecurityMode::Tls => {
                let tls = stream.tls_settings.unwrap_or_default();
                override_with(&mut profile.sni, tls.server_name);
                override_with(&mut profile.fingerprint, tls.settings.fingerprint);
            }
            SecurityMode::None => {}
        }

        if let Some(grpc) = stream.grpc_settings {
            override_with(&mut profile.service_name, grpc.service_name);
        }
        if let Some(ws) = stream.ws_settings {
            override_with(&mut profile.path, ws.path);
            override_with(&mut profile.host, ws.headers.host);
        }

        // Flow lives on clients, not on the inbound.
        if let Some(flow) = self.credentials().into_iter().find_map(|c| c.flow) {
            profile.flow = Some(flow);
        }

        profile
    }
}

fn override_with(slot: &mut Option<String>, live: Option<String>) {
    if let Some(value) = live.filter(|v| !v.is_empty()) {
        *slot = Some(value);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamSettings {
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    security: Option<String>,
    #[serde(default)]
    reality_settings: Option<RealitySettings>,
    #[serde(default)]
    tls_settings: Option<TlsSettings>,
    #[serde(default)]
    grpc_settings: Option<GrpcSettings>,
    #[serde(default)]
    ws_settings: Option<WsSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealitySettings {
    #[serde(default)]
    server_names: Vec<String>,
    #[serde(default)]
    short_ids: Vec<String>,
    #[serde(default)]
    settings: RealityClientSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealityClientSettings {
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    fingerprint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlsSettings {
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default)]
    settings: TlsClientSettings,
}

#[derive(Debug, Default, Deserialize)]
struct TlsClientSettings {
    #[serde(default)]
    fingerprint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrpcSettings {
    #[serde(default)]
    service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WsSettings {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    headers: WsHeaders,
}

#[derive(Debug, Default, Deserialize)]
struct WsHeaders {
    #[serde(rename = "Host", default)]
    host: Option<String>,
}
