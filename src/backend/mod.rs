//! Backend registry.
//!
//! Holds the loaded backend descriptors and answers "which backends take
//! part in this operation". The operator front end may append backends or
//! toggle their flags at runtime; the orchestrator only reads snapshots.

mod registry;

pub use registry::{BackendRegistry, BackendSelector, Placement, RegistryError, RejectedBackend};
