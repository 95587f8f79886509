//! Shared test utilities and mock infrastructure.

#![allow(dead_code, unused_imports)]

pub mod mock_panel;

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;

use keyfleet::backend::BackendRegistry;
use keyfleet::config::{
    BackendDescriptor, Defaults, EndpointProfile, PanelConfig, SecureString, SecurityMode,
    TransportConfig, MAIN_PROFILE,
};
use keyfleet::executor::TransportFactory;
use keyfleet::orchestrator::{Orchestrator, RetryPolicy};
use keyfleet::session::SessionManager;
use keyfleet::store::MemoryStore;

pub use mock_panel::MockPanel;

/// Find an available port for testing.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to free port");
    listener.local_addr().unwrap().port()
}

/// Reality profile matching the mock panel's inbound 1.
pub fn reality_profile(prefix: &str) -> EndpointProfile {
    let mut profile = EndpointProfile::new(1);
    profile.security = SecurityMode::Reality;
    profile.sni = Some("www.example.com".to_string());
    profile.public_key = Some("static-pbk".to_string());
    profile.short_id = Some("ab12".to_string());
    profile.fingerprint = Some("chrome".to_string());
    profile.flow = Some("xtls-rprx-vision".to_string());
    profile.name_prefix = Some(prefix.to_string());
    profile
}

/// Panel-managed backend whose panel lives at `url`.
pub fn panel_backend(name: &str, url: &str) -> BackendDescriptor {
    let mut profiles = BTreeMap::new();
    profiles.insert(MAIN_PROFILE.to_string(), reality_profile(name));

    BackendDescriptor {
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        domain: Some(format!("{}.example.net", name.to_lowercase())),
        port: 443,
        enabled: true,
        accepts_new: true,
        primary: false,
        transport: TransportConfig::Panel(PanelConfig {
            url: url.to_string(),
            username: mock_panel::USERNAME.to_string(),
            password: SecureString::new(mock_panel::PASSWORD),
            verify_tls: true,
        }),
        profiles,
    }
}

/// Backend pointing at a port nothing listens on.
pub fn dead_backend(name: &str) -> BackendDescriptor {
    panel_backend(name, &format!("http://127.0.0.1:{}/xui", free_port()))
}

/// Short timeouts so failure paths finish quickly.
pub fn test_defaults() -> Defaults {
    Defaults {
        request_timeout_seconds: 2,
        connect_timeout_seconds: 1,
        shell_timeout_seconds: 5,
        ..Defaults::default()
    }
}

/// Real transports over `backends`, with immediate retries.
pub fn orchestrator(
    backends: Vec<BackendDescriptor>,
    attempts: u32,
) -> (Orchestrator, Arc<SessionManager>) {
    let defaults = test_defaults();
    let sessions = Arc::new(SessionManager::new(
        defaults.session_ttl(),
        defaults.request_timeout(),
    ));
    let executors = TransportFactory::new(&defaults, sessions.clone()).unwrap();
    let orchestrator = Orchestrator::new(
        BackendRegistry::from_backends(backends),
        Arc::new(executors),
        Arc::new(MemoryStore::new()),
    )
    .with_retry_policy(RetryPolicy::immediate(attempts));
    (orchestrator, sessions)
}
