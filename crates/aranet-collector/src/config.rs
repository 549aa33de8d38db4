//! Collector configuration.
//!
//! Loaded from `~/.config/aranet/promsync.toml` by default. Every section and
//! field is optional; command line flags override file values.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8090"
//!
//! [prometheus]
//! url = "http://localhost:9090/"
//! prefix = "aranet4_"
//! job = "aranet4"
//! instance = "living-room"
//! dry_run = false
//!
//! [prometheus.extra_labels]
//! room = "living"
//!
//! [collector]
//! interval_secs = 3600
//!
//! [device]
//! address = "Aranet4 17C3C"
//! source = "service"
//! service_url = "http://localhost:8080"
//!
//! [pairing]
//! terminal_prompt = true
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aranet_promsync::SyncConfig;

/// Collector configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Status page settings.
    pub server: ServerConfig,
    /// Prometheus backend settings.
    pub prometheus: PrometheusConfig,
    /// Refresh loop settings.
    pub collector: CollectorConfig,
    /// Device and reading source settings.
    pub device: DeviceConfig,
    /// Pairing settings.
    pub pairing: PairingConfig,
}

impl Config {
    /// Load configuration from the default path, or defaults if it does not
    /// exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return all errors found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.prometheus.validate());
        errors.extend(self.collector.validate());
        errors.extend(self.device.validate());
        errors.extend(self.pairing.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Sync engine configuration for the configured device.
    ///
    /// Labels are `job`, `instance` and `device_addr` plus any extra labels.
    pub fn sync_config(&self) -> SyncConfig {
        let prom = &self.prometheus;
        let mut config = SyncConfig::new(prom.url.clone())
            .metric_prefix(prom.prefix.clone())
            .dry_run(prom.dry_run);
        for (name, value) in &prom.extra_labels {
            config = config.label(name.clone(), value.clone());
        }
        config = config
            .label("job", prom.job.clone())
            .label("instance", prom.instance_name())
            .label("device_addr", self.device.address.clone());
        config.query_timeout = prom.query_timeout();
        config.write_timeout = prom.write_timeout();
        config
    }
}

/// Status page configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8090").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8090".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
        } else {
            match self.bind.parse::<SocketAddr>() {
                Ok(addr) if addr.port() == 0 => {
                    errors.push(ValidationError::new("server.bind", "port cannot be 0"));
                }
                Ok(_) => {}
                Err(_) => errors.push(ValidationError::new(
                    "server.bind",
                    format!(
                        "invalid bind address '{}': expected format 'ip:port'",
                        self.bind
                    ),
                )),
            }
        }
        errors
    }

    /// Parsed listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::Validation(self.validate()))
    }
}

/// Prometheus backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Base URL of the Prometheus server.
    pub url: String,
    /// Prefix for every metric name.
    pub prefix: String,
    /// Value of the `job` label.
    pub job: String,
    /// Value of the `instance` label. Defaults to the host name.
    pub instance: Option<String>,
    /// Additional constant labels.
    pub extra_labels: BTreeMap<String, String>,
    /// Log writes instead of sending them.
    pub dry_run: bool,
    /// Timeout for the last-sample lookup query, in seconds.
    pub query_timeout_secs: u64,
    /// Timeout for each remote write, in seconds.
    pub write_timeout_secs: u64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090/".to_string(),
            prefix: "aranet4_".to_string(),
            job: "aranet4".to_string(),
            instance: None,
            extra_labels: BTreeMap::new(),
            dry_run: false,
            query_timeout_secs: 30,
            write_timeout_secs: 30,
        }
    }
}

/// Labels the collector always sets itself.
const RESERVED_LABELS: [&str; 3] = ["job", "instance", "device_addr"];

impl PrometheusConfig {
    /// The `instance` label value.
    pub fn instance_name(&self) -> String {
        match &self.instance {
            Some(instance) => instance.clone(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Validate Prometheus configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = SyncConfig::new(self.url.clone()).endpoint_url() {
            errors.push(ValidationError::new("prometheus.url", e.to_string()));
        }
        if !is_valid_metric_prefix(&self.prefix) {
            errors.push(ValidationError::new(
                "prometheus.prefix",
                format!(
                    "'{}' is not a valid metric name prefix (letters, digits, '_' and ':')",
                    self.prefix
                ),
            ));
        }
        if self.job.is_empty() {
            errors.push(ValidationError::new("prometheus.job", "job cannot be empty"));
        }
        if let Some(instance) = &self.instance
            && instance.is_empty()
        {
            errors.push(ValidationError::new(
                "prometheus.instance",
                "instance cannot be empty string (omit it to use the host name)",
            ));
        }
        for name in self.extra_labels.keys() {
            let field = format!("prometheus.extra_labels.{name}");
            if !is_valid_label_name(name) {
                errors.push(ValidationError::new(
                    field,
                    format!("'{name}' is not a valid label name"),
                ));
            } else if name.starts_with("__") || RESERVED_LABELS.contains(&name.as_str()) {
                errors.push(ValidationError::new(
                    field,
                    format!("label '{name}' is reserved"),
                ));
            }
        }
        if self.query_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "prometheus.query_timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        if self.write_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "prometheus.write_timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        errors
    }
}

fn is_valid_metric_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        None => true,
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        Some(_) => false,
    }
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Minimum refresh interval in seconds.
pub const MIN_INTERVAL: u64 = 10;
/// Maximum refresh interval in seconds (1 day).
///
/// An Aranet4 keeps a limited number of records; at its shortest measurement
/// interval a day is about what fits.
pub const MAX_INTERVAL: u64 = 24 * 3600;

/// Refresh loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Time between successful refreshes, in seconds.
    pub interval_secs: u64,
    /// Delay before retrying when behind schedule, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Budget for one whole refresh cycle, in seconds.
    pub cycle_timeout_secs: u64,
    /// Budget for reading from the device, in seconds.
    pub acquire_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retry_backoff_ms: 1000,
            cycle_timeout_secs: 300,
            acquire_timeout_secs: 120,
        }
    }
}

impl CollectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Validate collector configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.interval_secs < MIN_INTERVAL {
            errors.push(ValidationError::new(
                "collector.interval_secs",
                format!(
                    "interval {} is too short (minimum {} seconds)",
                    self.interval_secs, MIN_INTERVAL
                ),
            ));
        } else if self.interval_secs > MAX_INTERVAL {
            errors.push(ValidationError::new(
                "collector.interval_secs",
                format!(
                    "interval {} is too long (maximum {} seconds / 1 day)",
                    self.interval_secs, MAX_INTERVAL
                ),
            ));
        }
        if self.retry_backoff_ms == 0 {
            errors.push(ValidationError::new(
                "collector.retry_backoff_ms",
                "backoff must be positive",
            ));
        }
        if self.cycle_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "collector.cycle_timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        if self.acquire_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "collector.acquire_timeout_secs",
                "timeout must be at least 1 second",
            ));
        } else if self.acquire_timeout_secs > self.cycle_timeout_secs {
            errors.push(ValidationError::new(
                "collector.acquire_timeout_secs",
                format!(
                    "acquire timeout {}s exceeds cycle timeout {}s",
                    self.acquire_timeout_secs, self.cycle_timeout_secs
                ),
            ));
        }
        errors
    }
}

/// Where readings are acquired from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A running aranet-service.
    #[default]
    Service,
    /// Simulated readings.
    Mock,
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device address or name; also the `device_addr` label.
    pub address: String,
    /// Reading source.
    pub source: SourceKind,
    /// Base URL of aranet-service, for `source = "service"`.
    pub service_url: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            source: SourceKind::Service,
            service_url: "http://localhost:8080".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Validate device configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.address.is_empty() {
            errors.push(ValidationError::new(
                "device.address",
                "device address cannot be empty",
            ));
        }
        if self.source == SourceKind::Service
            && !(self.service_url.starts_with("http://") || self.service_url.starts_with("https://"))
        {
            errors.push(ValidationError::new(
                "device.service_url",
                format!(
                    "URL must start with http:// or https://, got: '{}'",
                    self.service_url
                ),
            ));
        }
        errors
    }
}

/// Pairing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Prompt for the passkey on the terminal.
    pub terminal_prompt: bool,
    /// How long a pairing attempt waits for a passkey, in seconds.
    pub timeout_secs: u64,
    /// How long a submitted passkey waits to be claimed, in seconds.
    pub submit_timeout_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            terminal_prompt: true,
            timeout_secs: 120,
            submit_timeout_secs: 5,
        }
    }
}

impl PairingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    /// Validate pairing configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "pairing.timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        if self.submit_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "pairing.submit_timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `prometheus.url`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aranet")
        .join("promsync.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.device.address = "AA:BB:CC:DD:EE:FF".to_string();
        config
    }

    fn fields(config: &Config) -> Vec<String> {
        match config.validate() {
            Ok(()) => Vec::new(),
            Err(ConfigError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0:8090");
        assert_eq!(config.prometheus.url, "http://localhost:9090/");
        assert_eq!(config.prometheus.prefix, "aranet4_");
        assert_eq!(config.prometheus.job, "aranet4");
        assert_eq!(config.collector.interval(), Duration::from_secs(3600));
        assert_eq!(config.collector.retry_backoff(), Duration::from_secs(1));
        assert_eq!(config.pairing.submit_timeout(), Duration::from_secs(5));
        assert_eq!(config.device.source, SourceKind::Service);
    }

    #[test]
    fn test_default_config_needs_device_address() {
        assert_eq!(fields(&Config::default()), ["device.address"]);
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [server]
            bind = "127.0.0.1:9999"

            [prometheus]
            url = "https://prom.example.com/prometheus"
            prefix = "home_"
            job = "sensors"
            instance = "pi"
            dry_run = true

            [prometheus.extra_labels]
            room = "office"

            [collector]
            interval_secs = 600

            [device]
            address = "Aranet4 17C3C"
            source = "mock"

            [pairing]
            terminal_prompt = false
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9999");
        assert_eq!(config.prometheus.instance.as_deref(), Some("pi"));
        assert!(config.prometheus.dry_run);
        assert_eq!(config.collector.interval_secs, 600);
        assert_eq!(config.collector.cycle_timeout_secs, 300);
        assert_eq!(config.device.source, SourceKind::Mock);
        assert!(!config.pairing.terminal_prompt);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_config_labels() {
        let mut config = valid_config();
        config.prometheus.instance = Some("pi".to_string());
        config
            .prometheus
            .extra_labels
            .insert("room".to_string(), "office".to_string());

        let sync = config.sync_config();
        assert_eq!(sync.metric_prefix, "aranet4_");
        let labels: Vec<_> = sync
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            labels,
            [
                ("device_addr", "AA:BB:CC:DD:EE:FF"),
                ("instance", "pi"),
                ("job", "aranet4"),
                ("room", "office"),
            ]
        );
    }

    #[test]
    fn test_instance_defaults_to_hostname() {
        let config = PrometheusConfig::default();
        assert!(!config.instance_name().is_empty());
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/promsync.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("promsync.toml");
        std::fs::write(&path, "[device]\naddress = \"dev\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.device.address, "dev");
        assert_eq!(config.prometheus.prefix, "aranet4_");
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("invalid.toml");
        std::fs::write(&path, "this is not valid { toml").unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_default_config_path() {
        assert!(default_config_path().ends_with("aranet/promsync.toml"));
    }

    #[test]
    fn test_server_bind_validation() {
        let mut config = valid_config();
        for bind in ["", ":9090", "localhost", "0.0.0.0:0", "1.2.3.4:99999"] {
            config.server.bind = bind.to_string();
            assert_eq!(fields(&config), ["server.bind"], "bind {bind:?}");
        }
        config.server.bind = "[::1]:8090".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prometheus_validation() {
        let mut config = valid_config();
        config.prometheus.url = "ftp://prom".to_string();
        config.prometheus.prefix = "9bad".to_string();
        config.prometheus.job = String::new();
        config.prometheus.instance = Some(String::new());
        config
            .prometheus
            .extra_labels
            .insert("__name__".to_string(), "x".to_string());
        config
            .prometheus
            .extra_labels
            .insert("bad-label".to_string(), "x".to_string());
        config
            .prometheus
            .extra_labels
            .insert("job".to_string(), "x".to_string());

        let errors = fields(&config);
        assert_eq!(
            errors,
            [
                "prometheus.url",
                "prometheus.prefix",
                "prometheus.job",
                "prometheus.instance",
                "prometheus.extra_labels.__name__",
                "prometheus.extra_labels.bad-label",
                "prometheus.extra_labels.job",
            ]
        );
    }

    #[test]
    fn test_metric_prefix_rules() {
        assert!(is_valid_metric_prefix(""));
        assert!(is_valid_metric_prefix("aranet4_"));
        assert!(is_valid_metric_prefix("home:aranet_"));
        assert!(!is_valid_metric_prefix("4aranet"));
        assert!(!is_valid_metric_prefix("aranet-"));
    }

    #[test]
    fn test_collector_validation() {
        let mut config = valid_config();
        config.collector.interval_secs = 5;
        assert_eq!(fields(&config), ["collector.interval_secs"]);

        config.collector.interval_secs = MAX_INTERVAL + 1;
        assert_eq!(fields(&config), ["collector.interval_secs"]);

        config.collector.interval_secs = 3600;
        config.collector.acquire_timeout_secs = 600;
        assert_eq!(fields(&config), ["collector.acquire_timeout_secs"]);
    }

    #[test]
    fn test_service_url_only_checked_for_service_source() {
        let mut config = valid_config();
        config.device.service_url = "localhost:8080".to_string();
        assert_eq!(fields(&config), ["device.service_url"]);

        config.device.source = SourceKind::Mock;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError::new("device.address", "device address cannot be empty"),
            ValidationError::new("pairing.timeout_secs", "timeout must be at least 1 second"),
        ]);
        let display = error.to_string();
        assert!(display.contains("  - device.address: device address cannot be empty"));
        assert!(display.contains("  - pairing.timeout_secs"));
    }
}
