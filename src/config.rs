use crate::{Result, WaveError, log_debug};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "wavepilot.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PilotConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub live_sync: LiveSyncConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub stages: StagesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub interval_seconds: u64,
    /// Consecutive failed progress queries before an operation is marked `error`.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Upper bound on how long one operation may stay `running`.
    #[serde(default = "default_operation_timeout_seconds")]
    pub operation_timeout_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval_seconds(),
            max_consecutive_failures: default_max_consecutive_failures(),
            operation_timeout_seconds: default_operation_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSyncConfig {
    #[serde(default = "default_log_interval_seconds")]
    pub log_interval_seconds: u64,
}

impl Default for LiveSyncConfig {
    fn default() -> Self {
        Self {
            log_interval_seconds: default_log_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_watch_interval_seconds")]
    pub watch_interval_seconds: u64,
    #[serde(default = "default_watch_timeout_seconds")]
    pub watch_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            watch_interval_seconds: default_watch_interval_seconds(),
            watch_timeout_seconds: default_watch_timeout_seconds(),
        }
    }
}

/// How the `Install Agent` stage is settled once every VM has been attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStagePolicy {
    /// Stage ends `success` regardless of per-VM results.
    #[default]
    AlwaysSuccess,
    /// Stage ends `failure` when any VM failed.
    Aggregate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default)]
    pub agent_policy: AgentStagePolicy,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    60
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    12
}

fn default_operation_timeout_seconds() -> u64 {
    4 * 60 * 60
}

fn default_step_timeout_seconds() -> u64 {
    2 * 60 * 60
}

fn default_log_interval_seconds() -> u64 {
    3
}

fn default_watch_interval_seconds() -> u64 {
    5
}

fn default_watch_timeout_seconds() -> u64 {
    10 * 60
}

impl PilotConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: PilotConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|_e| WaveError::InvalidConfig)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// `<config dir>/wavepilot/wavepilot.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wavepilot").join(CONFIG_FILE_NAME))
    }

    /// Load an explicit file, else the default location if it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            log_debug!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }

        match Self::default_path().filter(|path| path.exists()) {
            Some(path) => {
                log_debug!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            None => {
                log_debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.backend.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(WaveError::ConfigError(format!(
                "backend.base_url must be an http(s) URL, got '{}'",
                self.backend.base_url
            )));
        }
        let intervals = [
            ("backend.request_timeout_seconds", self.backend.request_timeout_seconds),
            ("polling.interval_seconds", self.polling.interval_seconds),
            ("pipeline.step_timeout_seconds", self.pipeline.step_timeout_seconds),
            ("live_sync.log_interval_seconds", self.live_sync.log_interval_seconds),
            ("shutdown.watch_interval_seconds", self.shutdown.watch_interval_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(WaveError::ConfigError(format!("{} must be greater than zero", name)));
            }
        }
        if self.polling.max_consecutive_failures == 0 {
            return Err(WaveError::ConfigError(
                "polling.max_consecutive_failures must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_seconds)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.operation_timeout_seconds)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.step_timeout_seconds)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.live_sync.log_interval_seconds)
    }

    pub fn shutdown_watch_interval(&self) -> Duration {
        Duration::from_secs(self.shutdown.watch_interval_seconds)
    }

    pub fn shutdown_watch_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.watch_timeout_seconds)
    }
}
