//! Bench configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RFBENCH_`, nested keys split on `__`
//!
//! ```text
//! RFBENCH_APPLICATION__LOG_LEVEL=debug
//! RFBENCH_SERVER__PORT=6000
//! RFBENCH_TASKS__MAX_STEPS=500
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rf_bench::config::BenchConfig;
//!
//! let config = BenchConfig::load_from("config/bench.example.toml")?;
//! println!("Instruments: {}", config.instruments.len());
//! # Ok::<(), rf_bench::config::ConfigError>(())
//! ```

use crate::devices::Role;
use crate::link::LinkConfig;
use crate::telemetry::LogFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values are inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// Effective config could not be written back
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level bench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BenchConfig {
    /// Name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Remote-control listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Task engine limits
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Instruments on the bench
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
    /// Named groups of instruments
    #[serde(default)]
    pub device_sets: Vec<DeviceSetConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Bench name shown in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Text or JSON log lines
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Remote-control server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Start the listener
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bind address
    #[serde(default = "default_address")]
    pub address: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_address(),
            port: default_port(),
        }
    }
}

/// Task engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Longest sweep a single task may expand to
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Finished tasks kept for status queries before the oldest are dropped
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            retain_finished: default_retain_finished(),
        }
    }
}

/// How an instrument is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Raw TCP socket
    #[default]
    Tcp,
    /// Serial port
    Serial,
    /// In-process simulator
    Mock,
}

/// One instrument: address, session settings and protocol tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique instrument identifier
    pub id: String,
    /// Positioner, generator or analyzer
    pub role: Role,
    /// Vendor model (tesart, keysight, m9807a, s50244)
    pub model: String,
    /// How the address is reached
    #[serde(default)]
    pub transport: TransportKind,
    /// Resource string. Positioners list one address per axis, separated by `;`.
    #[serde(default)]
    pub address: String,
    /// Disabled instruments are not connected
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Read timeout per reply
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Line terminator, escapes allowed
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Serial speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Identification query
    #[serde(default = "default_idn_query")]
    pub idn_query: String,
    /// Operation-complete query
    #[serde(default = "default_opc_query")]
    pub opc_query: String,
    /// OPC replies that mean done
    #[serde(default = "default_opc_pass_tokens")]
    pub opc_pass_tokens: Vec<String>,
    /// Pause between OPC queries
    #[serde(default = "default_opc_poll_interval_ms")]
    pub opc_poll_interval_ms: u64,
    /// Give up on OPC polling after this long
    #[serde(default = "default_opc_timeout_ms")]
    pub opc_timeout_ms: u64,
    /// Error register query
    #[serde(default = "default_error_query")]
    pub error_query: String,
    /// Error register reply that means no error
    #[serde(default = "default_no_error_reply")]
    pub no_error_reply: String,
    /// Settling pause after enabling a positioner drive
    #[serde(default)]
    pub init_delay_ms: Option<u64>,
    /// Number of simulated axes for a mock positioner
    #[serde(default = "default_mock_axes")]
    pub mock_axes: usize,
}

impl InstrumentConfig {
    /// Minimal definition with bench defaults.
    pub fn new(id: &str, role: Role, model: &str, transport: TransportKind, address: &str) -> Self {
        Self {
            id: id.to_string(),
            role,
            model: model.to_string(),
            transport,
            address: address.to_string(),
            enabled: true,
            timeout_ms: default_timeout_ms(),
            terminator: default_terminator(),
            baud_rate: default_baud_rate(),
            idn_query: default_idn_query(),
            opc_query: default_opc_query(),
            opc_pass_tokens: default_opc_pass_tokens(),
            opc_poll_interval_ms: default_opc_poll_interval_ms(),
            opc_timeout_ms: default_opc_timeout_ms(),
            error_query: default_error_query(),
            no_error_reply: default_no_error_reply(),
            init_delay_ms: None,
            mock_axes: default_mock_axes(),
        }
    }

    /// Read timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Line terminator, with `\n` and `\r` escapes understood.
    pub fn terminator_char(&self) -> Result<char, ConfigError> {
        let unescaped = self.terminator.replace("\\n", "\n").replace("\\r", "\r");
        let mut chars = unescaped.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(ConfigError::ValidationError(format!(
                "instrument '{}': terminator must be a single character, got {:?}",
                self.id, self.terminator
            ))),
        }
    }

    /// Per-axis (or single) addresses.
    pub fn addresses(&self) -> Vec<&str> {
        self.address
            .split(';')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect()
    }

    /// Completion and error tokens for the link.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            idn_query: self.idn_query.clone(),
            opc_query: self.opc_query.clone(),
            opc_pass_tokens: self.opc_pass_tokens.clone(),
            opc_poll_interval: Duration::from_millis(self.opc_poll_interval_ms),
            opc_timeout: Duration::from_millis(self.opc_timeout_ms),
            error_query: self.error_query.clone(),
            no_error_reply: self.no_error_reply.clone(),
        }
    }
}

/// A named group of instruments operated as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSetConfig {
    /// Set name used in task requests
    pub name: String,
    /// Instrument ids, in fan-out order
    pub members: Vec<String>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "RF Bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5006
}

fn default_max_steps() -> usize {
    crate::tasks::DEFAULT_MAX_STEPS
}

fn default_retain_finished() -> usize {
    crate::tasks::DEFAULT_RETAIN_FINISHED
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_idn_query() -> String {
    "*IDN?".to_string()
}

fn default_opc_query() -> String {
    "*OPC?".to_string()
}

fn default_opc_pass_tokens() -> Vec<String> {
    vec!["+1".to_string(), "1".to_string()]
}

fn default_opc_poll_interval_ms() -> u64 {
    250
}

fn default_opc_timeout_ms() -> u64 {
    30_000
}

fn default_error_query() -> String {
    "SYSTEM:ERROR?".to_string()
}

fn default_no_error_reply() -> String {
    "+0,\"No error\"".to_string()
}

fn default_mock_axes() -> usize {
    1
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BenchConfig {
    /// Load configuration from a TOML file and `RFBENCH_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RFBENCH_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument IDs are unique and each model matches its role
    /// - Non-mock instruments have an address, terminators are one character
    /// - OPC poll interval and timeouts are positive
    /// - Device sets are uniquely named, non-empty and reference enabled instruments
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.tasks.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "tasks.max_steps must be > 0".to_string(),
            ));
        }

        if self.tasks.retain_finished == 0 {
            return Err(ConfigError::ValidationError(
                "tasks.retain_finished must be > 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            self.validate_instrument(instrument)?;
        }

        let mut names = HashSet::new();
        for set in &self.device_sets {
            if !names.insert(set.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device set name: '{}'",
                    set.name
                )));
            }
            if set.members.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Device set '{}' has no members",
                    set.name
                )));
            }
            for member in &set.members {
                match self.instruments.iter().find(|i| &i.id == member) {
                    None => {
                        return Err(ConfigError::ValidationError(format!(
                            "Device set '{}' references unknown instrument '{}'",
                            set.name, member
                        )))
                    }
                    Some(instrument) if !instrument.enabled => {
                        return Err(ConfigError::ValidationError(format!(
                            "Device set '{}' references disabled instrument '{}'",
                            set.name, member
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    fn validate_instrument(&self, instrument: &InstrumentConfig) -> Result<(), ConfigError> {
        let models = crate::devices::factory::known_models(instrument.role);
        if !models.contains(&instrument.model.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown {} model '{}' for instrument '{}'. Must be one of: {}",
                instrument.role,
                instrument.model,
                instrument.id,
                models.join(", ")
            )));
        }

        if instrument.transport != TransportKind::Mock && instrument.addresses().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Instrument '{}': 'address' cannot be empty",
                instrument.id
            )));
        }

        instrument.terminator_char()?;

        if instrument.timeout_ms == 0
            || instrument.opc_poll_interval_ms == 0
            || instrument.opc_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(format!(
                "Instrument '{}': timeouts and poll interval must be > 0",
                instrument.id
            )));
        }

        if instrument.opc_pass_tokens.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Instrument '{}': 'opc_pass_tokens' cannot be empty",
                instrument.id
            )));
        }

        Ok(())
    }

    /// Render the effective configuration (file plus environment) as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentConfig> {
        self.instruments.iter().filter(|inst| inst.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[application]
name = "Chamber A"
log_level = "debug"

[server]
port = 6000

[[instruments]]
id = "rbd"
role = "positioner"
model = "tesart"
address = "TCPIP0::10.0.0.5::5002::SOCKET;TCPIP0::10.0.0.6::5002::SOCKET"

[[instruments]]
id = "vna"
role = "analyzer"
model = "m9807a"
address = "TCPIP0::10.0.0.7::5025::SOCKET"
opc_timeout_ms = 5000

[[device_sets]]
name = "chamber"
members = ["rbd", "vna"]
"#;

    fn valid_config() -> BenchConfig {
        BenchConfig {
            instruments: vec![
                InstrumentConfig::new("gen", Role::Generator, "keysight", TransportKind::Mock, ""),
                InstrumentConfig::new("vna", Role::Analyzer, "s50244", TransportKind::Tcp, "10.0.0.9:5025"),
            ],
            device_sets: vec![DeviceSetConfig {
                name: "all".to_string(),
                members: vec!["gen".to_string(), "vna".to_string()],
            }],
            ..BenchConfig::default()
        }
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = BenchConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "Chamber A");
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.tasks.max_steps, 10_000);
        assert_eq!(config.tasks.retain_finished, 1000);

        let rbd = &config.instruments[0];
        assert_eq!(rbd.role, Role::Positioner);
        assert_eq!(rbd.addresses().len(), 2);
        assert_eq!(rbd.timeout_ms, 10_000);
        assert_eq!(rbd.terminator_char().unwrap(), '\n');

        let link = config.instruments[1].link_config();
        assert_eq!(link.opc_timeout, Duration::from_secs(5));
        assert_eq!(link.opc_poll_interval, Duration::from_millis(250));
        assert_eq!(link.no_error_reply, "+0,\"No error\"");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = BenchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.device_sets[0].members, vec!["rbd", "vna"]);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_instrument_id() {
        let mut config = valid_config();
        config.instruments.push(config.instruments[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn test_unknown_model_for_role() {
        let mut config = valid_config();
        config.instruments[0].model = "m9807a".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown generator model"));
    }

    #[test]
    fn test_missing_address() {
        let mut config = valid_config();
        config.instruments[1].address = " ; ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_terminator() {
        let mut config = valid_config();
        config.instruments[1].terminator = "\\r\\n".to_string();
        assert!(config.validate().is_err());
        config.instruments[1].terminator = "\\r".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_device_set() {
        let mut config = valid_config();
        config.device_sets[0].members.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("has no members"));
    }

    #[test]
    fn test_set_references_unknown_instrument() {
        let mut config = valid_config();
        config.device_sets[0].members.push("ghost".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown instrument 'ghost'"));
    }

    #[test]
    fn test_set_references_disabled_instrument() {
        let mut config = valid_config();
        config.instruments[0].enabled = false;
        assert!(config.validate().is_err());
        assert_eq!(config.enabled_instruments().len(), 1);
    }

    #[test]
    fn test_zero_retention() {
        let mut config = valid_config();
        config.tasks.retain_finished = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retain_finished"));
    }

    #[test]
    fn test_zero_opc_timeout() {
        let mut config = valid_config();
        config.instruments[0].opc_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_config_dump_reloads() {
        let mut config = BenchConfig::from_toml_str(SAMPLE).unwrap();
        config.instruments[1].init_delay_ms = Some(250);
        let dumped = config.to_toml_string().unwrap();
        let reloaded = BenchConfig::from_toml_str(&dumped).unwrap();
        assert_eq!(reloaded.server.port, 6000);
        assert_eq!(reloaded.instruments[0].addresses().len(), 2);
        assert_eq!(reloaded.instruments[1].init_delay_ms, Some(250));
        assert_eq!(reloaded.device_sets[0].members, vec!["rbd".to_string(), "vna".to_string()]);
    }
}
