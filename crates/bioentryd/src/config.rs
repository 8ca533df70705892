use crate::seal::PayloadSealer;
use crate::store::StoreSettings;
use bioentry_core::StabilityConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/bioentry/terminal.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration: TOML file, then `BIOENTRY_*` environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub terminal: TerminalConfig,
    pub remote: RemoteConfig,
    pub capture: CaptureConfig,
    pub store: StoreConfig,
    pub fallback: FallbackConfig,
    pub dbus: DbusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Identifier the remote service knows this terminal by.
    pub id: String,
    pub api_key: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            id: "TERMINAL_001".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub verify_path: String,
    pub probe_path: String,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_interval_secs: u64,
    /// Consecutive failed probes before an online terminal goes offline.
    pub failures_to_offline: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            verify_path: "/verify-terminal/auto".to_string(),
            probe_path: "/version".to_string(),
            request_timeout_secs: 5,
            probe_timeout_secs: 3,
            probe_interval_secs: 10,
            failures_to_offline: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Replay directory used as the frame source.
    pub frame_dir: Option<PathBuf>,
    pub target_fps: u32,
    /// Consecutive samples a face must hold still for (3s at 10fps).
    pub stable_window_frames: usize,
    pub max_center_shift_px: f32,
    pub min_confidence: f32,
    pub loss_gap_ms: u64,
    pub jpeg_quality: u8,
    pub sensor_backoff_initial_ms: u64,
    pub sensor_backoff_max_ms: u64,
    /// Consecutive detector failures treated as a lost sensor.
    pub max_detector_failures: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_dir: None,
            target_fps: 10,
            stable_window_frames: 30,
            max_center_shift_px: 25.0,
            min_confidence: 0.6,
            loss_gap_ms: 800,
            jpeg_quality: 85,
            sensor_backoff_initial_ms: 500,
            sensor_backoff_max_ms: 30_000,
            max_detector_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Failed deliveries before a record needs operator attention.
    pub max_attempts: u32,
    /// Safety timer for sync passes while online.
    pub sync_interval_secs: u64,
    /// When set, queued images are sealed at rest with a key derived from it.
    pub payload_secret: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("terminal_offline.db"),
            max_attempts: 10,
            sync_interval_secs: 60,
            payload_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Minimum score for a local fallback match to count as verified.
    pub acceptance_threshold: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    pub enabled: bool,
    pub bus: BusKind,
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load from `BIOENTRY_CONFIG` (or the default path), apply environment overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("BIOENTRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                tracing::info!(path = %path.display(), "loading config");
                Self::from_toml_str(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `BIOENTRY_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BIOENTRY_TERMINAL_ID") {
            self.terminal.id = v;
        }
        if let Some(v) = lookup("BIOENTRY_API_KEY") {
            self.terminal.api_key = v;
        }
        if let Some(v) = lookup("BIOENTRY_API_URL") {
            self.remote.base_url = v;
        }
        if let Some(v) = lookup("BIOENTRY_DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BIOENTRY_FRAME_DIR") {
            self.capture.frame_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("BIOENTRY_PAYLOAD_SECRET") {
            self.store.payload_secret = Some(v);
        }
        if let Some(v) = lookup("BIOENTRY_DBUS_ENABLED") {
            self.dbus.enabled = v != "0";
        }

        self.remote.request_timeout_secs = env_u64(
            &lookup,
            "BIOENTRY_REQUEST_TIMEOUT_SECS",
            self.remote.request_timeout_secs,
        );
        self.remote.probe_interval_secs = env_u64(
            &lookup,
            "BIOENTRY_PROBE_INTERVAL_SECS",
            self.remote.probe_interval_secs,
        );
        self.store.max_attempts = env_u64(&lookup, "BIOENTRY_MAX_ATTEMPTS", self.store.max_attempts as u64) as u32;
        self.capture.target_fps = env_u64(&lookup, "BIOENTRY_TARGET_FPS", self.capture.target_fps as u64) as u32;
        self.capture.min_confidence = env_f32(&lookup, "BIOENTRY_MIN_CONFIDENCE", self.capture.min_confidence);
        self.fallback.acceptance_threshold = env_f32(
            &lookup,
            "BIOENTRY_FALLBACK_THRESHOLD",
            self.fallback.acceptance_threshold,
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.terminal.id.trim().is_empty() {
            return invalid("terminal.id must not be empty");
        }
        if !self.remote.base_url.starts_with("http://") && !self.remote.base_url.starts_with("https://") {
            return invalid("remote.base_url must be an http(s) URL");
        }
        if self.remote.request_timeout_secs == 0 || self.remote.probe_timeout_secs == 0 {
            return invalid("remote timeouts must be at least 1 second");
        }
        if self.remote.probe_interval_secs == 0 {
            return invalid("remote.probe_interval_secs must be at least 1");
        }
        if self.remote.failures_to_offline == 0 {
            return invalid("remote.failures_to_offline must be at least 1");
        }
        if self.capture.target_fps == 0 {
            return invalid("capture.target_fps must be at least 1");
        }
        if self.capture.stable_window_frames == 0 {
            return invalid("capture.stable_window_frames must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.capture.min_confidence) {
            return invalid("capture.min_confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.fallback.acceptance_threshold) {
            return invalid("fallback.acceptance_threshold must be within [0, 1]");
        }
        if self.store.max_attempts == 0 {
            return invalid("store.max_attempts must be at least 1");
        }
        if self.terminal.api_key.is_empty() {
            tracing::warn!("terminal.api_key is empty; the remote service will likely reject requests");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.remote.probe_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.store.sync_interval_secs.max(1))
    }

    pub fn stability(&self) -> StabilityConfig {
        StabilityConfig {
            window: self.capture.stable_window_frames,
            max_center_shift: self.capture.max_center_shift_px,
            min_confidence: self.capture.min_confidence,
            loss_gap: Duration::from_millis(self.capture.loss_gap_ms),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            max_attempts: self.store.max_attempts,
            sealer: PayloadSealer::from_secret(self.store.payload_secret.as_deref()),
            acceptance_threshold: self.fallback.acceptance_threshold,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("bioentry")
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
