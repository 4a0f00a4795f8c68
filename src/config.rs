use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::{BridgeError, Result};
use crate::pipeline::processing::normalize::rules::NormalizationRule;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: SourcesConfig,
    pub tail: TailConfig,
    pub channels: ChannelConfig,
    pub delivery: DeliveryConfig,
    pub normalize: NormalizeConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Interactive serial channel; `None` runs without a device
    pub device_path: Option<PathBuf>,
    /// Mirrored debug log; `None` disables the log ingestion path
    pub log_path: Option<PathBuf>,
}

impl SourcesConfig {
    /// The paths the firmware tooling uses when nothing is configured
    pub fn or_defaults(self) -> Self {
        if self.device_path.is_none() && self.log_path.is_none() {
            return Self {
                device_path: Some(PathBuf::from(constants::DEFAULT_DEVICE_PATH)),
                log_path: Some(PathBuf::from(constants::DEFAULT_LOG_PATH)),
            };
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub log_poll_interval_ms: u64,
    pub device_poll_interval_ms: u64,
    pub reopen_backoff_ms: u64,
    pub read_chunk_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            log_poll_interval_ms: 100,
            device_poll_interval_ms: 50,
            reopen_backoff_ms: 1000,
            read_chunk_bytes: 4096,
            max_line_bytes: 16 * 1024,
        }
    }
}

impl TailConfig {
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms)
    }

    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub output_capacity: usize,
    pub delivery_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            output_capacity: 256,
            delivery_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub data_endpoint: String,
    pub files_endpoint: String,
    pub file_base_url: String,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Where failed deliveries are preserved for resubmission; `None` keeps them in memory only
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            data_endpoint: constants::DEFAULT_DATA_ENDPOINT.to_string(),
            files_endpoint: constants::DEFAULT_FILES_ENDPOINT.to_string(),
            file_base_url: constants::DEFAULT_FILE_BASE_URL.to_string(),
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 5000,
            dead_letter_path: Some(PathBuf::from("data/dead_letter.ndjson")),
        }
    }
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub sentinel: String,
    /// Replaces the built-in rule table when non-empty
    pub rules: Vec<NormalizationRule>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            sentinel: constants::UNAVAILABLE_SENTINEL.to_string(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "sensor_bridge.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint; metrics stay in-process when unset
    pub listen_addr: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let config_content = fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_attempts == 0 {
            return Err(BridgeError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.channels.output_capacity == 0 || self.channels.delivery_capacity == 0 {
            return Err(BridgeError::Config(
                "channel capacities must be greater than zero".to_string(),
            ));
        }
        if self.tail.read_chunk_bytes == 0 || self.tail.max_line_bytes == 0 {
            return Err(BridgeError::Config(
                "tail.read_chunk_bytes and tail.max_line_bytes must be greater than zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.tail.log_poll_interval_ms, 100);
        assert_eq!(config.normalize.sentinel, "N/A");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sources]
log_path = "/tmp/rtt.log"

[delivery]
max_attempts = 5

[[normalize.rules]]
key = "temp"
rename = "Temperature"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sources.log_path, Some(PathBuf::from("/tmp/rtt.log")));
        assert_eq!(config.sources.device_path, None);
        assert_eq!(config.delivery.max_attempts, 5);
        assert_eq!(config.delivery.initial_backoff_ms, 500);
        assert_eq!(config.normalize.rules.len(), 1);
        assert_eq!(config.normalize.rules[0].rename.as_deref(), Some("Temperature"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[delivery]\nmax_attempts = 0").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(BridgeError::Config(_))
        ));
    }
}
