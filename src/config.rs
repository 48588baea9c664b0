//! Runtime configuration (`/etc/sentryedge.toml` by default), overridable by
//! `EDGE_`-prefixed environment variables. Loaded once at startup and again
//! on each hot-reload tick; [`Config::validate`] is the single gate the
//! Orchestrator calls before swapping a reloaded config into effect.

use base::tracing_setup::LogFormat;
use base::{err, Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_data_dir() -> PathBuf {
    "/var/lib/sentryedge".into()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormatConfig,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: LogFormatConfig::default(),
            output: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatConfig {
    #[default]
    Text,
    Json,
    Systemd,
}

impl From<LogFormatConfig> for LogFormat {
    fn from(c: LogFormatConfig) -> LogFormat {
        match c {
            LogFormatConfig::Text => LogFormat::Text,
            LogFormatConfig::Json => LogFormat::Json,
            LogFormatConfig::Systemd => LogFormat::Systemd,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_window")]
    pub probe_window_secs: u64,
    #[serde(default = "default_missing_grace")]
    pub missing_grace_secs: u64,
    #[serde(default = "default_device_root")]
    pub device_root: PathBuf,
}

fn default_discovery_interval() -> u64 {
    300
}
fn default_probe_window() -> u64 {
    3
}
fn default_missing_grace() -> u64 {
    24 * 3600
}
fn default_device_root() -> PathBuf {
    "/dev".into()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            interval_secs: default_discovery_interval(),
            probe_window_secs: default_probe_window(),
            missing_grace_secs: default_missing_grace(),
            device_root: default_device_root(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RtspConfig {
    #[serde(default = "default_connect_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}
fn default_reconnect_interval() -> u64 {
    1
}
fn default_reconnect_max() -> u64 {
    60
}
fn default_stall_timeout() -> u64 {
    15
}

impl Default for RtspConfig {
    fn default() -> Self {
        RtspConfig {
            timeout_secs: default_connect_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
            reconnect_max_secs: default_reconnect_max(),
            stall_timeout_secs: default_stall_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_disk_usage_percent")]
    pub max_disk_usage_percent: u8,
}

fn default_retention_days() -> u32 {
    7
}
fn default_max_disk_usage_percent() -> u8 {
    80
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            retention_days: default_retention_days(),
            max_disk_usage_percent: default_max_disk_usage_percent(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventsConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_transmission_interval")]
    pub transmission_interval_secs: u64,
}

fn default_queue_size() -> usize {
    256
}
fn default_batch_size() -> usize {
    16
}
fn default_transmission_interval() -> u64 {
    5
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            queue_size: default_queue_size(),
            batch_size: default_batch_size(),
            transmission_interval_secs: default_transmission_interval(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    pub user_secret: Option<String>,
    #[serde(default = "default_salt_path")]
    pub salt_path: PathBuf,
}

fn default_salt_path() -> PathBuf {
    "crypto/salt".into()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            enabled: false,
            user_secret: None,
            salt_path: default_salt_path(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    pub endpoint: Option<String>,
    #[serde(default = "default_relay_workers")]
    pub workers: usize,
}

fn default_relay_workers() -> usize {
    2
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            enabled: false,
            endpoint: None,
            workers: default_relay_workers(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub rtsp: RtspConfig,

    #[serde(default = "default_capture_fps")]
    pub capture_fps: u32,
    #[serde(default = "default_inference_interval")]
    pub inference_interval_secs: f64,
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,
    #[serde(default)]
    pub inference_retries: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub enabled_classes: Vec<String>,
    pub inference_endpoint: Option<String>,

    #[serde(default = "default_event_close_gap")]
    pub event_close_gap_secs: f64,
    #[serde(default)]
    pub min_event_duration_secs: f64,
    #[serde(default = "default_max_event_duration")]
    pub max_event_duration_secs: f64,
    #[serde(default = "default_pre_event_duration")]
    pub pre_event_duration_secs: f64,
    #[serde(default = "default_clip_duration")]
    pub clip_duration_secs: f64,

    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default = "default_read_api_bind")]
    pub read_api_bind: String,

    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

fn default_capture_fps() -> u32 {
    10
}
fn default_inference_interval() -> f64 {
    1.0
}
fn default_inference_timeout() -> u64 {
    10
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_event_close_gap() -> f64 {
    5.0
}
fn default_max_event_duration() -> f64 {
    300.0
}
fn default_pre_event_duration() -> f64 {
    2.0
}
fn default_clip_duration() -> f64 {
    10.0
}
fn default_read_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Operator-supplied credentials for a camera discovered without them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    pub camera_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Config {
    /// Loads the TOML file at `path`, then applies any `EDGE_*` environment
    /// overrides recognized below.
    pub fn load(path: &std::path::Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            err!(ConfigInvalid, "reading {}: {e}", path.display())
        })?;
        let mut config: Config = toml::from_str(&text).map_err(|e| {
            err!(ConfigInvalid, "parsing {}: {e}", path.display())
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EDGE_LOG") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("EDGE_DATA_DIR") {
            self.data_dir = v.into();
        }
        if let Ok(v) = std::env::var("EDGE_CONFIDENCE_THRESHOLD") {
            if let Ok(f) = v.parse() {
                self.confidence_threshold = f;
            }
        }
        if let Ok(v) = std::env::var("EDGE_INFERENCE_ENDPOINT") {
            self.inference_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("EDGE_RELAY_ENDPOINT") {
            self.relay.endpoint = Some(v);
        }
    }

    /// Rejects a config that would fail at runtime; the caller (Orchestrator
    /// hot-reload) must leave the prior config untouched on `Err`.
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(err!(
                ConfigInvalid,
                "confidence_threshold must be in [0,1], got {}",
                self.confidence_threshold
            ));
        }
        if self.storage.max_disk_usage_percent == 0 || self.storage.max_disk_usage_percent > 100 {
            return Err(err!(
                ConfigInvalid,
                "storage.max_disk_usage_percent must be in (0,100], got {}",
                self.storage.max_disk_usage_percent
            ));
        }
        if self.relay.enabled && self.relay.endpoint.is_none() {
            return Err(err!(ConfigInvalid, "relay.enabled is true but relay.endpoint is unset"));
        }
        if self.encryption.enabled && self.encryption.user_secret.is_none() {
            return Err(err!(
                ConfigInvalid,
                "encryption.enabled is true but encryption.user_secret is unset"
            ));
        }
        if self.relay.workers == 0 {
            return Err(err!(ConfigInvalid, "relay.workers must be at least 1"));
        }
        Ok(())
    }

    pub fn log_format(&self) -> LogFormat {
        match self.log.format {
            LogFormatConfig::Text => LogFormat::Text,
            LogFormatConfig::Json => LogFormat::Json,
            LogFormatConfig::Systemd => LogFormat::Systemd,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            log: LogConfig::default(),
            discovery: DiscoveryConfig::default(),
            rtsp: RtspConfig::default(),
            capture_fps: default_capture_fps(),
            inference_interval_secs: default_inference_interval(),
            inference_timeout_secs: default_inference_timeout(),
            inference_retries: 0,
            confidence_threshold: default_confidence_threshold(),
            enabled_classes: Vec::new(),
            inference_endpoint: None,
            event_close_gap_secs: default_event_close_gap(),
            min_event_duration_secs: 0.0,
            max_event_duration_secs: default_max_event_duration(),
            pre_event_duration_secs: default_pre_event_duration(),
            clip_duration_secs: default_clip_duration(),
            storage: StorageConfig::default(),
            events: EventsConfig::default(),
            encryption: EncryptionConfig::default(),
            relay: RelayConfig::default(),
            read_api_bind: default_read_api_bind(),
            cameras: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_confidence_threshold() {
        let mut c = Config::default();
        c.confidence_threshold = 1.5;
        assert_eq!(c.validate().unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn rejects_relay_enabled_without_endpoint() {
        let mut c = Config::default();
        c.relay.enabled = true;
        assert_eq!(c.validate().unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
            data_dir = "/tmp/sentryedge"
            [relay]
            enabled = true
            endpoint = "https://relay.example/tunnel"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.data_dir, std::path::PathBuf::from("/tmp/sentryedge"));
        assert!(config.relay.enabled);
        config.validate().unwrap();
    }
}
