//! Configuration loading and storage.
//!
//! The TOML file describes orchestration defaults, the subscription HTTP
//! surface, the customer store location and every backend server.

mod credentials;
mod loader;
mod store;
mod types;

pub use credentials::SecureString;
pub use loader::ConfigError;
pub use store::ConfigStore;
pub use types::{
    BackendDescriptor, BackoffKind, Config, Defaults, EndpointProfile, PanelConfig, SecurityMode,
    ServerConfig, ShellConfig, StoreConfig, SuccessPolicy, TransportConfig, MAIN_PROFILE,
};
