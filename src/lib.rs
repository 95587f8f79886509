//! Proxy-credential provisioning across a fleet of independently managed
//! backends, with a subscription endpoint for client software.

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod executor;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod subscription;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}
