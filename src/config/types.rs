use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::credentials::SecureString;

/// Name of the endpoint profile every backend must define.
pub const MAIN_PROFILE: &str = "main";

/// Root configuration container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

/// Orchestration defaults shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Total timeout for one HTTP exchange with a panel (default: 15).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u32,
    /// Connection timeout for panel requests (default: 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    /// Timeout for one remote command execution (default: 30).
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_seconds: u32,
    /// Attempts per backend before an operation gives up (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds (default: 1000).
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Delay schedule between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Age after which a cached panel session is re-authenticated (default: 3600).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    /// Maximum number of backends contacted concurrently (default: 4).
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
    /// When an aggregate creation counts as successful.
    #[serde(default)]
    pub success_policy: SuccessPolicy,
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// Policy deciding whether a multi-backend creation succeeded overall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// At least one targeted backend accepted the credential.
    #[default]
    Any,
    /// A backend marked `primary` must have accepted it. Falls back to
    /// `Any` when no primary backend was targeted.
    Primary,
    /// Every targeted backend accepted it.
    All,
}

/// Subscription HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (host:port).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Value of the `profile-update-interval` header, in hours.
    #[serde(default = "default_update_interval")]
    pub update_interval_hours: u32,
}

/// Customer store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON file backing the store; in-memory only when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// One independently managed backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique, human-readable name (e.g. "EU1").
    pub name: String,
    /// Host or IP of the server.
    pub address: String,
    /// Domain used in connection descriptors instead of the address.
    #[serde(default)]
    pub domain: Option<String>,
    /// Public port used when a profile does not carry its own.
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Excluded from every operation when false.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Excluded from new placements (but still queried) when false.
    #[serde(default = "default_true")]
    pub accepts_new: bool,
    /// Home backend: ordered first and consulted by the `primary` policy.
    #[serde(default)]
    pub primary: bool,
    /// How the backend's credential store is reached.
    pub transport: TransportConfig,
    /// Named endpoint profiles; `main` is mandatory.
    #[serde(default)]
    pub profiles: BTreeMap<String, EndpointProfile>,
}

/// Transport selector, fixed per backend at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Stateful HTTP management panel.
    Panel(PanelConfig),
    /// Remote command execution over ssh.
    Shell(ShellConfig),
}

/// Panel management API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Base URL including the panel's secret path
    /// (e.g. "https://203.0.113.10:2053/abc").
    pub url: String,
    pub username: String,
    pub password: SecureString,
    /// Verify the panel's TLS certificate. Panels commonly run self-signed.
    #[serde(default)]
    pub verify_tls: bool,
}

/// Remote command execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Password authentication through `sshpass`.
    #[serde(default)]
    pub password: Option<SecureString>,
    /// Private key for key authentication.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Agent invoked on the remote side.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    /// Local ssh client binary.
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
}

/// Security layer of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    Tls,
    Reality,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::None => "none",
            SecurityMode::Tls => "tls",
            SecurityMode::Reality => "reality",
        }
    }

    /// Parse the panel's spelling; unknown values map to `None`.
    pub fn from_panel(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "tls" => SecurityMode::Tls,
            "reality" => SecurityMode::Reality,
            _ => SecurityMode::None,
        }
    }
}

/// Protocol and security parameters of one endpoint on a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointProfile {
    /// Backend-local endpoint (inbound) id.
    pub id: u32,
    /// Listening port; the backend port is used when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Stream transport kind ("tcp", "grpc", "ws").
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub short_id: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub flow: Option<String>,
    /// Prefix of the display name in connection descriptors.
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// gRPC service name.
    #[serde(default)]
    pub service_name: Option<String>,
    /// WebSocket path.
    #[serde(default)]
    pub path: Option<String>,
    /// WebSocket host header.
    #[serde(default)]
    pub host: Option<String>,
}

impl EndpointProfile {
    /// A bare tcp endpoint with no security layer.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            port: None,
            network: default_network(),
            security: SecurityMode::None,
            sni: None,
            public_key: None,
            short_id: None,
            fingerprint: None,
            flow: None,
            name_prefix: None,
            service_name: None,
            path: None,
            host: None,
        }
    }
}

impl BackendDescriptor {
    /// Host placed in connection descriptors.
    pub fn public_host(&self) -> &str {
        self.domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.address)
    }

    /// The mandatory `main` profile.
    pub fn main_profile(&self) -> Option<&EndpointProfile> {
        self.profiles.get(MAIN_PROFILE)
    }

    /// Static profile configured for a backend-local endpoint id.
    pub fn profile_for_endpoint(&self, endpoint_id: u32) -> Option<&EndpointProfile> {
        self.profiles.values().find(|p| p.id == endpoint_id)
    }

    /// Whether this backend is reached through the panel API.
    pub fn is_panel(&self) -> bool {
        matches!(self.transport, TransportConfig::Panel(_))
    }
}

impl Defaults {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.request_timeout_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_seconds))
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.shell_timeout_seconds))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }
}

fn default_request_timeout() -> u32 {
    15
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_shell_timeout() -> u32 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_base_ms() -> u64 {
    1000
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_fanout_limit() -> usize {
    4
}

fn default_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_update_interval() -> u32 {
    12
}

fn default_backend_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_agent_command() -> String {
    "keyfleet-agent".to_string()
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_network() -> String {
    "tcp".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            shell_timeout_seconds: default_shell_timeout(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            backoff: BackoffKind::default(),
            session_ttl_seconds: default_session_ttl(),
            fanout_limit: default_fanout_limit(),
            success_policy: SuccessPolicy::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            update_interval_hours: default_update_interval(),
        }
    }
}
