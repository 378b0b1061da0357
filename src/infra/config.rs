//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed by the binary)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::SwitchId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Baud rates accepted for any link
pub const STANDARD_BAUD_RATES: [u32; 11] =
    [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

pub fn is_standard_baud(baud: u32) -> bool {
    STANDARD_BAUD_RATES.contains(&baud)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port name, empty when unused
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self { port: String::new(), baud: default_baud() }
    }
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Relay targeted by a successful scan (1 or 2)
    #[serde(default = "default_switch")]
    pub switch: u8,
    /// How long the relay stays energized
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: default_baud(),
            switch: default_switch(),
            dwell_ms: default_dwell_ms(),
        }
    }
}

fn default_switch() -> u8 {
    1
}

fn default_dwell_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after an I/O error before the next cycle
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Bound on waiting for the loop to exit on stop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    1500
}

fn default_read_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Stored barcodes are truncated to this many characters
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    /// Drop entries from the sequence once matched instead of keeping them as matched
    #[serde(default)]
    pub remove_matched: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self { max_len: default_max_len(), remove_matched: false }
    }
}

fn default_max_len() -> usize {
    crate::domain::master::DEFAULT_MAX_LEN
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// File path for the event log (JSONL format), empty to disable
    #[serde(default = "default_event_log_file")]
    pub file: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self { file: default_event_log_file() }
    }
}

fn default_event_log_file() -> String {
    "scans.jsonl".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Summary logging interval, 0 to disable
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

/// On-disk layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub ingest: PortConfig,
    #[serde(default)]
    pub validate: PortConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub printer: PortConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    ingest_port: String,
    ingest_baud: u32,
    validate_port: String,
    validate_baud: u32,
    output_port: String,
    output_baud: u32,
    switch: u8,
    dwell_ms: u64,
    printer_port: String,
    printer_baud: u32,
    poll_interval_ms: u64,
    error_backoff_ms: u64,
    stop_timeout_ms: u64,
    read_timeout_ms: u64,
    max_len: usize,
    remove_matched: bool,
    event_log_file: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self::from_toml(TomlConfig::default());
        config.config_file = "default".to_string();
        config
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig) -> Self {
        Self {
            ingest_port: toml_config.ingest.port,
            ingest_baud: toml_config.ingest.baud,
            validate_port: toml_config.validate.port,
            validate_baud: toml_config.validate.baud,
            output_port: toml_config.output.port,
            output_baud: toml_config.output.baud,
            switch: toml_config.output.switch,
            dwell_ms: toml_config.output.dwell_ms,
            printer_port: toml_config.printer.port,
            printer_baud: toml_config.printer.baud,
            poll_interval_ms: toml_config.listener.poll_interval_ms,
            error_backoff_ms: toml_config.listener.error_backoff_ms,
            stop_timeout_ms: toml_config.listener.stop_timeout_ms,
            read_timeout_ms: toml_config.listener.read_timeout_ms,
            max_len: toml_config.master.max_len,
            remove_matched: toml_config.master.remove_matched,
            event_log_file: toml_config.event_log.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: String::new(),
        }
    }

    fn to_toml(&self) -> TomlConfig {
        TomlConfig {
            ingest: PortConfig { port: self.ingest_port.clone(), baud: self.ingest_baud },
            validate: PortConfig { port: self.validate_port.clone(), baud: self.validate_baud },
            output: OutputConfig {
                port: self.output_port.clone(),
                baud: self.output_baud,
                switch: self.switch,
                dwell_ms: self.dwell_ms,
            },
            printer: PortConfig { port: self.printer_port.clone(), baud: self.printer_baud },
            listener: ListenerConfig {
                poll_interval_ms: self.poll_interval_ms,
                error_backoff_ms: self.error_backoff_ms,
                stop_timeout_ms: self.stop_timeout_ms,
                read_timeout_ms: self.read_timeout_ms,
            },
            master: MasterConfig { max_len: self.max_len, remove_matched: self.remove_matched },
            event_log: EventLogConfig { file: self.event_log_file.clone() },
            metrics: MetricsConfig { interval_secs: self.metrics_interval_secs },
        }
    }

    /// Config file path when none is given on the command line
    pub fn resolve_config_path() -> String {
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut config = Self::from_toml(toml_config);
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Persist the configuration as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(&self.to_toml()).context("Failed to encode config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Relay selector as a typed switch, if valid
    pub fn switch_id(&self) -> Option<SwitchId> {
        SwitchId::try_from(self.switch).ok()
    }

    // Getters for all config fields
    pub fn ingest_port(&self) -> &str {
        &self.ingest_port
    }

    pub fn ingest_baud(&self) -> u32 {
        self.ingest_baud
    }

    pub fn validate_port(&self) -> &str {
        &self.validate_port
    }

    pub fn validate_baud(&self) -> u32 {
        self.validate_baud
    }

    pub fn output_port(&self) -> &str {
        &self.output_port
    }

    pub fn output_baud(&self) -> u32 {
        self.output_baud
    }

    pub fn switch(&self) -> u8 {
        self.switch
    }

    pub fn dwell_ms(&self) -> u64 {
        self.dwell_ms
    }

    pub fn printer_port(&self) -> &str {
        &self.printer_port
    }

    pub fn printer_baud(&self) -> u32 {
        self.printer_baud
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn error_backoff_ms(&self) -> u64 {
        self.error_backoff_ms
    }

    pub fn stop_timeout_ms(&self) -> u64 {
        self.stop_timeout_ms
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn remove_matched(&self) -> bool {
        self.remove_matched
    }

    pub fn event_log_file(&self) -> &str {
        &self.event_log_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Builders, used by hosts that pick ports at runtime and by tests
    pub fn with_ingest(mut self, port: &str, baud: u32) -> Self {
        self.ingest_port = port.to_string();
        self.ingest_baud = baud;
        self
    }

    pub fn with_validate(mut self, port: &str, baud: u32) -> Self {
        self.validate_port = port.to_string();
        self.validate_baud = baud;
        self
    }

    pub fn with_output(mut self, port: &str, baud: u32) -> Self {
        self.output_port = port.to_string();
        self.output_baud = baud;
        self
    }

    pub fn with_printer(mut self, port: &str, baud: u32) -> Self {
        self.printer_port = port.to_string();
        self.printer_baud = baud;
        self
    }

    pub fn with_switch(mut self, switch: u8) -> Self {
        self.switch = switch;
        self
    }

    pub fn with_dwell_ms(mut self, ms: u64) -> Self {
        self.dwell_ms = ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_error_backoff_ms(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    pub fn with_stop_timeout_ms(mut self, ms: u64) -> Self {
        self.stop_timeout_ms = ms;
        self
    }

    pub fn with_remove_matched(mut self, remove: bool) -> Self {
        self.remove_matched = remove;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }
}
