//! Unified service bootstrap utilities
//!
//! Startup banner and service metadata.

use tracing::info;

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "linesrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
    /// Default API port
    pub default_port: u16,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        default_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            default_port,
        }
    }
}

/// Print unified startup banner for any service
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ██╗     ██╗███╗   ██╗███████╗███████╗██████╗ ██╗   ██╗
 ██║     ██║████╗  ██║██╔════╝██╔════╝██╔══██╗██║   ██║
 ██║     ██║██╔██╗ ██║█████╗  ███████╗██████╔╝██║   ██║
 ██║     ██║██║╚██╗██║██╔══╝  ╚════██║██╔══██╗╚██╗ ██╔╝
 ███████╗██║██║ ╚████║███████╗███████║██║  ██║ ╚████╔╝
 ╚══════╝╚═╝╚═╝  ╚═══╝╚══════╝╚══════╝╚═╝  ╚═╝  ╚═══╝
"#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Default Port: {}", service.default_port);
}
