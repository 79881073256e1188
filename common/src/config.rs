use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::wire::Framing;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the producer connects and the receiver listens.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_take_timeout_ms")]
    pub take_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// One of `synthetic`, `mjpeg` or `polling`.
    #[serde(default = "default_capture_mode")]
    pub mode: String,
    /// Stream URL for `mjpeg`, snapshot URL for `polling`.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_fps_log_interval_secs")]
    pub fps_log_interval_secs: u64,
    /// Longest wait for a single HTTP read before the camera counts as lost.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Downscale snapshots wider than this. 0 keeps the capture size.
    #[serde(default)]
    pub max_width: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// One of `none` or `replay`.
    #[serde(default = "default_detector_mode")]
    pub mode: String,
    #[serde(default)]
    pub replay_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Write the most recent snapshot here when set.
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default = "default_print_interval_ms")]
    pub print_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            take_timeout_ms: default_take_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: default_capture_mode(),
            url: String::new(),
            width: default_width(),
            height: default_height(),
            min_interval_ms: default_min_interval_ms(),
            fps_log_interval_secs: default_fps_log_interval_secs(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            max_width: 0,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            mode: default_detector_mode(),
            replay_path: None,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            print_interval_ms: default_print_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.queue_capacity == 0 {
            return Err(ConfigError::Invalid("stream.queue_capacity must be at least 1".into()));
        }
        if !(1..=100).contains(&self.snapshot.quality) {
            return Err(ConfigError::Invalid(format!(
                "snapshot.quality must be within 1..=100, got {}",
                self.snapshot.quality
            )));
        }
        if matches!(self.capture.mode.as_str(), "mjpeg" | "polling") && self.capture.url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "capture.url is required for mode '{}'",
                self.capture.mode
            )));
        }
        if self.capture.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("capture.read_timeout_ms must be at least 1".into()));
        }
        if self.detector.mode == "replay" && self.detector.replay_path.is_none() {
            return Err(ConfigError::Invalid(
                "detector.replay_path is required for mode 'replay'".into(),
            ));
        }
        Ok(())
    }
}

impl EndpointConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.take_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    5005
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_take_timeout_ms() -> u64 {
    100
}
fn default_queue_capacity() -> usize {
    2
}
fn default_capture_mode() -> String {
    "synthetic".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_min_interval_ms() -> u64 {
    50
}
fn default_fps_log_interval_secs() -> u64 {
    5
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_quality() -> u8 {
    80
}
fn default_detector_mode() -> String {
    "none".into()
}
fn default_print_interval_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".into()
}
