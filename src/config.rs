//! Application configuration
//!
//! Loaded from TOML. Every section has defaults, so a partial file (or no
//! file at all) is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::tracks::EncodingParams;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    /// Encoding requested for outbound publications
    pub publish: EncodingParams,
    pub scheduler: SchedulerConfig,
    pub reconnect: ReconnectConfig,
    pub transform: TransformConfig,
    pub control: ControlConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub server_address: String,
    /// Pre-issued access token
    pub token: String,
    /// Identity this process joins the session as
    pub identity: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            token: String::new(),
            identity: DEFAULT_PROCESSOR_IDENTITY.to_string(),
        }
    }
}

/// Flow-control settings for one track bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frames waiting for the transform (drop-oldest beyond this)
    pub queue_capacity: usize,
    /// Per-frame processing deadline
    pub processing_deadline_ms: u64,
    /// Consecutive timeouts before the bridge reports degraded processing
    pub timeout_streak_threshold: u32,
    /// Capacity of the processed-frame channel feeding the outbound track
    pub output_capacity: usize,
}

impl SchedulerConfig {
    pub fn processing_deadline(&self) -> Duration {
        Duration::from_millis(self.processing_deadline_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            processing_deadline_ms: DEFAULT_PROCESSING_DEADLINE_MS,
            timeout_streak_threshold: DEFAULT_TIMEOUT_STREAK,
            output_capacity: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl ReconnectConfig {
    /// Delay before reconnect `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RECONNECT_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Passthrough,
    #[default]
    Edges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub kind: TransformKind,
    pub edge_threshold: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            kind: TransformKind::Edges,
            edge_threshold: crate::transform::edges::DEFAULT_EDGE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Identity prompts are addressed to
    pub processor_identity: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            processor_identity: DEFAULT_PROCESSOR_IDENTITY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "effects-relay").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` (or the platform default), then apply environment
    /// overrides and validate
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                tracing::info!("Loading config from {}", p.display());
                Self::from_toml(&text)?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Override session settings from `RELAY_SERVER_URL`, `RELAY_TOKEN` and
    /// `RELAY_IDENTITY`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup(ENV_SERVER_URL) {
            self.session.server_address = address;
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.session.token = token;
        }
        if let Some(identity) = lookup(ENV_IDENTITY) {
            self.session.identity = identity;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.server_address.is_empty() {
            return Err(Error::Config("session.server_address is empty".into()));
        }
        if self.session.identity.is_empty() {
            return Err(Error::Config("session.identity is empty".into()));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(Error::Config("scheduler.queue_capacity must be at least 1".into()));
        }
        if self.scheduler.output_capacity == 0 {
            return Err(Error::Config("scheduler.output_capacity must be at least 1".into()));
        }
        if self.scheduler.processing_deadline_ms == 0 {
            return Err(Error::Config("scheduler.processing_deadline_ms must be positive".into()));
        }
        if self.scheduler.timeout_streak_threshold == 0 {
            return Err(Error::Config("scheduler.timeout_streak_threshold must be at least 1".into()));
        }
        if self.publish.frame_rate == 0 || self.publish.width == 0 || self.publish.height == 0 {
            return Err(Error::Config("publish frame rate and resolution must be positive".into()));
        }
        if self.reconnect.backoff_max_ms < self.reconnect.backoff_base_ms {
            return Err(Error::Config("reconnect.backoff_max_ms is below backoff_base_ms".into()));
        }
        Ok(())
    }
}
