//! linesrv configuration
//!
//! Layered with figment: built-in defaults, then `config/linesrv.yaml` (or
//! the `--config` path), then `LINESRV_` environment variables using `__`
//! as the section separator (`LINESRV_PLC__HOST=10.0.0.5`).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::barcode::SerialPortConfig;
use crate::ems::EmsConfig;
use crate::error::{LineSrvError, Result};
use crate::runtime::retry::RetryPolicy;
use crate::transport::ConnectionConfig;
use crate::workflow::StallLimits;

pub const DEFAULT_CONFIG_PATH: &str = "config/linesrv.yaml";
pub const ENV_PREFIX: &str = "LINESRV_";
pub const DEFAULT_API_PORT: u16 = 6010;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
    pub log_dir: String,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "linesrv".to_string(),
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            api_host: common::DEFAULT_API_HOST.to_string(),
            api_port: DEFAULT_API_PORT,
        }
    }
}

/// TCP peer endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl PeerConfig {
    fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: default_timeout_ms(),
            reconnect_delay_ms: default_timeout_ms(),
        }
    }

    pub fn connection_config(&self, name: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(name, self.host.clone(), self.port);
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.reconnect = RetryPolicy::fixed(Duration::from_millis(self.reconnect_delay_ms));
        config
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LineSrvError::config(format!("{}.host cannot be empty", section)));
        }
        if self.port == 0 {
            return Err(LineSrvError::config(format!("{}.port cannot be zero", section)));
        }
        if self.connect_timeout_ms == 0 {
            return Err(LineSrvError::config(format!(
                "{}.connect_timeout_ms must be greater than zero",
                section
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmsSection {
    pub url: String,
    pub request_timeout_ms: u64,
    pub retry_delay_ms: u64,
    /// 0 retries forever
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub workers: usize,
}

impl Default for EmsSection {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/api/results".to_string(),
            request_timeout_ms: 5000,
            retry_delay_ms: 5000,
            max_attempts: 0,
            backoff_multiplier: 1.0,
            max_retry_delay_ms: 60_000,
            workers: 5,
        }
    }
}

impl EmsSection {
    pub fn ems_config(&self) -> EmsConfig {
        let mut config = EmsConfig::new(self.url.clone());
        config.request_timeout = Duration::from_millis(self.request_timeout_ms);
        config.retry = RetryPolicy::from_config(
            self.max_attempts,
            self.retry_delay_ms,
            self.max_retry_delay_ms,
            self.backoff_multiplier,
        );
        config.workers = self.workers;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarcodeSection {
    pub default_device_id: String,
    pub ports: Vec<SerialPortConfig>,
    /// Delay before reopening a failed serial port
    pub reopen_delay_ms: u64,
}

impl Default for BarcodeSection {
    fn default() -> Self {
        Self {
            default_device_id: "PLC_DEVICE_001".to_string(),
            ports: Vec::new(),
            reopen_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// 0 disables the WAITING_COMMAND watchdog
    pub waiting_command_timeout_secs: u64,
    /// 0 disables the PROGRAMMING watchdog
    pub programming_timeout_secs: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            waiting_command_timeout_secs: 0,
            programming_timeout_secs: 0,
            watchdog_interval_ms: 1000,
        }
    }
}

impl WorkflowSection {
    pub fn stall_limits(&self) -> StallLimits {
        let limit = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        StallLimits {
            waiting_command: limit(self.waiting_command_timeout_secs),
            programming: limit(self.programming_timeout_secs),
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub journal_path: String,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            journal_path: "data/linesrv-journal.jsonl".to_string(),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub plc: PeerConfig,
    pub upper_computer: PeerConfig,
    pub ems: EmsSection,
    pub barcode: BarcodeSection,
    pub workflow: WorkflowSection,
    pub persistence: PersistenceSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            plc: PeerConfig::local(502),
            upper_computer: PeerConfig::local(9000),
            ems: EmsSection::default(),
            barcode: BarcodeSection::default(),
            workflow: WorkflowSection::default(),
            persistence: PersistenceSection::default(),
        }
    }
}

impl AppConfig {
    /// Load from the default YAML path plus environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` plus environment; a missing file falls back to defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: AppConfig = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        self.plc.validate("plc")?;
        self.upper_computer.validate("upper_computer")?;

        if self.ems.url.trim().is_empty() {
            return Err(LineSrvError::config("ems.url cannot be empty"));
        }
        if !(self.ems.url.starts_with("http://") || self.ems.url.starts_with("https://")) {
            return Err(LineSrvError::config(format!(
                "ems.url must be an http(s) URL, got '{}'",
                self.ems.url
            )));
        }
        if self.ems.workers == 0 {
            return Err(LineSrvError::config("ems.workers must be greater than zero"));
        }
        if self.ems.retry_delay_ms == 0 {
            return Err(LineSrvError::config("ems.retry_delay_ms must be greater than zero"));
        }
        if self.service.api_port == 0 {
            return Err(LineSrvError::config("service.api_port cannot be zero"));
        }
        if self.barcode.default_device_id.trim().is_empty() {
            return Err(LineSrvError::config("barcode.default_device_id cannot be empty"));
        }
        if let Some(port) = self.barcode.ports.iter().find(|p| p.name.trim().is_empty()) {
            return Err(LineSrvError::config(format!(
                "barcode.ports entry with baud rate {} has no name",
                port.baud_rate
            )));
        }
        Ok(())
    }

    /// Dotted-path lookup (`"plc.host"`), rendered as a string
    pub fn get(&self, key: &str) -> Option<String> {
        let root = serde_json::to_value(self).ok()?;
        let value = key
            .split('.')
            .try_fold(&root, |node, segment| match node {
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => node.get(segment),
            })?;

        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
