use crate::error::{Result, RolloutError};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Connection settings for the source-of-truth artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_address")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Branch every proposed change is compared against.
    #[serde(default = "default_baseline_branch")]
    pub baseline_branch: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

fn default_store_address() -> String {
    "http://localhost:8000".to_string()
}

fn default_baseline_branch() -> String {
    "main".to_string()
}

fn default_store_timeout() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            api_token: None,
            baseline_branch: default_baseline_branch(),
            timeout_secs: default_store_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceConfig
// ---------------------------------------------------------------------------

/// Management-channel settings shared by every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default = "default_device_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_skip_verify")]
    pub skip_verify: bool,
    #[serde(default = "default_device_timeout")]
    pub timeout_secs: u64,
}

fn default_device_port() -> u16 {
    57400
}

fn default_device_username() -> String {
    "admin".to_string()
}

fn default_skip_verify() -> bool {
    true
}

fn default_device_timeout() -> u64 {
    30
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_device_port(),
            username: default_device_username(),
            password: String::new(),
            skip_verify: default_skip_verify(),
            timeout_secs: default_device_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Interval between checksum polls while a device waits for its render.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on the readiness barrier. `None` waits forever.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: Option<u64>,
    /// How long a readiness signal stays visible to runs started after it.
    #[serde(default = "default_signal_backlog")]
    pub signal_backlog_secs: u64,
    /// Unfinished runs older than this are abandoned instead of resumed.
    #[serde(default = "default_recovery_max_age")]
    pub recovery_max_age_secs: u64,
    #[serde(default)]
    pub activity: RetryPolicy,
}

fn default_database() -> PathBuf {
    PathBuf::from("rollout.db")
}

fn default_poll_interval() -> u64 {
    3_000
}

fn default_readiness_timeout() -> Option<u64> {
    Some(3_600)
}

fn default_signal_backlog() -> u64 {
    600
}

fn default_recovery_max_age() -> u64 {
    86_400
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            poll_interval_ms: default_poll_interval(),
            readiness_timeout_secs: default_readiness_timeout(),
            signal_backlog_secs: default_signal_backlog(),
            recovery_max_age_secs: default_recovery_max_age(),
            activity: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_secs.map(Duration::from_secs)
    }

    pub fn signal_backlog(&self) -> Duration {
        Duration::from_secs(self.signal_backlog_secs)
    }

    pub fn recovery_max_age(&self) -> Duration {
        Duration::from_secs(self.recovery_max_age_secs)
    }
}

// ---------------------------------------------------------------------------
// RolloutConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl RolloutConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RolloutError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: RolloutConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let warn = |level: WarnLevel, message: String| ConfigWarning { level, message };

        if self.store.baseline_branch.trim().is_empty() {
            warnings.push(warn(
                WarnLevel::Error,
                "store.baseline_branch must not be empty".to_string(),
            ));
        }

        if !self.store.address.starts_with("http://") && !self.store.address.starts_with("https://")
        {
            warnings.push(warn(
                WarnLevel::Error,
                format!(
                    "store.address '{}' must start with http:// or https://",
                    self.store.address
                ),
            ));
        }

        let activity = &self.engine.activity;
        if activity.start_to_close_secs > activity.schedule_to_close_secs {
            warnings.push(warn(
                WarnLevel::Warning,
                format!(
                    "engine.activity.start_to_close_secs ({}) exceeds schedule_to_close_secs ({}); \
                     attempts will be cut short",
                    activity.start_to_close_secs, activity.schedule_to_close_secs
                ),
            ));
        }

        if activity.backoff_coefficient < 1.0 {
            warnings.push(warn(
                WarnLevel::Warning,
                format!(
                    "engine.activity.backoff_coefficient {} is below 1.0 and will be treated as 1.0",
                    activity.backoff_coefficient
                ),
            ));
        }

        if self.engine.poll_interval_ms == 0 {
            warnings.push(warn(
                WarnLevel::Error,
                "engine.poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.engine.readiness_timeout_secs.is_none() {
            warnings.push(warn(
                WarnLevel::Warning,
                "engine.readiness_timeout_secs is unset: runs can wait for signals forever"
                    .to_string(),
            ));
        }

        if self.device.password.is_empty() {
            warnings.push(warn(
                WarnLevel::Warning,
                "device.password is empty".to_string(),
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
