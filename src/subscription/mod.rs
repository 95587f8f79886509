//! Subscription aggregation and the HTTP surface serving it to client software.

mod aggregator;
mod error;
mod server;
mod shutdown;

pub use aggregator::{Aggregator, Subscription, Usage};
pub use error::SubscriptionError;
pub use server::{
    build_router, HealthStatus, ServerHandle, SubscriptionServer, UPDATE_INTERVAL_HEADER,
    USERINFO_HEADER,
};
pub use shutdown::ShutdownManager;
