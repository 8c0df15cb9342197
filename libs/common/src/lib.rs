//! Shared basic library for the production line services
//!
//! Provides the functions every service binary needs at startup:
//! - logging bootstrap
//! - layered configuration value lookup
//! - shutdown signal handling
//! - startup banner metadata

pub mod config_loader;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

/// Default bind host for service APIs
pub const DEFAULT_API_HOST: &str = "0.0.0.0";

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;
