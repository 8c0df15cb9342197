//! Service bootstrap: command line, logging and bind address

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use common::logging::{self, LogConfig};
use common::service_bootstrap::ServiceInfo;
use common::DEFAULT_API_HOST;
use errors::{LineError, LineResult};

use crate::config::{AppConfig, DEFAULT_API_PORT, DEFAULT_CONFIG_PATH};

/// Command-line arguments for linesrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "linesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Production Line Orchestration Service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Bind address for the API server
    #[arg(short = 'b', long)]
    pub bind_address: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "linesrv",
        env!("CARGO_PKG_VERSION"),
        "Production Line Orchestration Service - Scanner, PLC, Programmer, EMS",
        DEFAULT_API_PORT,
    )
}

/// Initialize logging from the CLI and the `service` config section
///
/// Log root priority: `LINESRV_LOG_DIR`, then `service.log_dir`, then `logs`.
pub fn initialize_logging(
    args: &Args,
    service_info: &ServiceInfo,
    config: &AppConfig,
) -> LineResult<()> {
    logging::init_log_root(Some(config.service.log_dir.as_str()));

    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.service.log_level.as_str());

    logging::init_with_config(LogConfig {
        service_name: service_info.name.clone(),
        log_dir: logging::get_log_root().join(&service_info.name),
        console_level: logging::parse_level(level),
        enable_file: true,
        ansi: !args.no_color,
    })
    .map_err(|e| LineError::Configuration(format!("Failed to init logging: {}", e)))
}

/// Print what a validated configuration would connect to
pub fn describe_configuration(config: &AppConfig) {
    info!("Service: {}", config.service.name);
    info!(
        "  PLC: {}:{} (reconnect {} ms)",
        config.plc.host, config.plc.port, config.plc.reconnect_delay_ms
    );
    info!(
        "  Upper computer: {}:{} (reconnect {} ms)",
        config.upper_computer.host,
        config.upper_computer.port,
        config.upper_computer.reconnect_delay_ms
    );
    info!(
        "  EMS: {} ({} workers, retry every {} ms)",
        config.ems.url, config.ems.workers, config.ems.retry_delay_ms
    );
    info!(
        "  Scanners: {} port(s), default device {}",
        config.barcode.ports.len(),
        config.barcode.default_device_id
    );
    for port in &config.barcode.ports {
        info!("    {} @ {} baud", port.name, port.baud_rate);
    }
    info!("  Journal: {}", config.persistence.journal_path);
}

/// Determine bind address from multiple sources
/// Priority: CLI > Config > ENV > Default
pub fn determine_bind_address(cli_arg: Option<String>, config_host: &str, config_port: u16) -> String {
    if let Some(addr) = cli_arg {
        info!("Using bind address from command line: {}", addr);
        return addr;
    }

    let is_config_default = config_port == DEFAULT_API_PORT || config_port == 0;
    if !is_config_default {
        let config_addr = format!("{}:{}", config_host, config_port);
        info!("Using bind address from configuration: {}", config_addr);
        return config_addr;
    }

    let port = common::config_loader::get_config_value(
        Some(config_port),
        is_config_default,
        "SERVICE_PORT",
        DEFAULT_API_PORT,
    );
    let host = common::config_loader::get_string_config(
        Some(config_host.to_string()),
        config_host.is_empty(),
        "SERVICE_HOST",
        DEFAULT_API_HOST.to_string(),
    );

    format!("{}:{}", host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["linesrv"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.log_level.is_none());
        assert!(!args.validate);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::parse_from([
            "linesrv",
            "--config",
            "/etc/linesrv.yaml",
            "-l",
            "debug",
            "--no-color",
            "--validate",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/linesrv.yaml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.no_color);
        assert!(args.validate);
    }

    #[test]
    fn test_bind_address_priority() {
        assert_eq!(
            determine_bind_address(Some("127.0.0.1:7000".into()), "0.0.0.0", 6011),
            "127.0.0.1:7000"
        );
        assert_eq!(determine_bind_address(None, "10.0.0.2", 6011), "10.0.0.2:6011");
    }
}
