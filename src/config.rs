use crate::cloud::{MAX_EVENT_DATA_LEN, MAX_PUBLISH_BURST};
use crate::upload::{chunk_event_len, MAX_CHUNK_SIZE, MAX_IMAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "info,app.cam=trace";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub orchestrator: OrchestratorConfig,
    pub location: LocationConfig,
    pub camera: CameraConfig,
    pub cloud: CloudConfig,
    pub backend: BackendConfig,
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_period_ms: u64,
    /// A tick taking longer than this is counted as an overrun.
    pub tick_budget_us: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub min_publish_interval_s: u32,
    pub max_publish_interval_s: u32,
    pub time_to_fix_ms: u64,
    pub start_lat: f64,
    pub start_lon: f64,
    pub start_alt: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub power_up_ms: u64,
    pub capture_ms: u64,
    pub image_size: usize,
    pub chunk_size: usize,
    pub ack_timeout_ms: u64,
    pub max_start_attempts: u8,
    pub transfer_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub handshake_ms: u64,
    pub publish_burst: u8,
    pub publish_window_ms: u64,
    pub outbox_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub resend_after_ms: u64,
    pub restart_delay_ms: u64,
    /// Delay before re-sending a `camera` call that could not be delivered.
    pub call_retry_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            location: LocationConfig::default(),
            camera: CameraConfig::default(),
            cloud: CloudConfig::default(),
            backend: BackendConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 10,
            tick_budget_us: 5_000,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            min_publish_interval_s: 10,
            max_publish_interval_s: 900,
            time_to_fix_ms: 30_000,
            start_lat: 42.3601,
            start_lon: -71.0589,
            start_alt: 12.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            power_up_ms: 2_000,
            capture_ms: 1_500,
            image_size: 8 * 1024,
            chunk_size: 256,
            ack_timeout_ms: 20_000,
            max_start_attempts: 5,
            transfer_timeout_ms: 120_000,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 3_000,
            publish_burst: 4,
            publish_window_ms: 1_000,
            outbox_capacity: 64,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            resend_after_ms: 20_000,
            restart_delay_ms: 30_000,
            call_retry_ms: 20_000,
        }
    }
}

impl TrackerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be non-zero".into()));
        }

        let location = &self.location;
        if location.min_publish_interval_s > location.max_publish_interval_s {
            return Err(ConfigError::Invalid(format!(
                "min_publish_interval_s {} exceeds max_publish_interval_s {}",
                location.min_publish_interval_s, location.max_publish_interval_s
            )));
        }

        let camera = &self.camera;
        if camera.chunk_size == 0 || camera.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        let event_len = chunk_event_len(camera.chunk_size);
        if event_len > MAX_EVENT_DATA_LEN {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} produces {} byte events, limit is {}",
                camera.chunk_size, event_len, MAX_EVENT_DATA_LEN
            )));
        }
        if camera.image_size == 0 || camera.image_size > MAX_IMAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "image_size must be between 1 and {} bytes",
                MAX_IMAGE_SIZE
            )));
        }
        if camera.max_start_attempts == 0 {
            return Err(ConfigError::Invalid("max_start_attempts must be non-zero".into()));
        }

        let cloud = &self.cloud;
        if cloud.publish_burst == 0 || usize::from(cloud.publish_burst) > MAX_PUBLISH_BURST {
            return Err(ConfigError::Invalid(format!(
                "publish_burst must be between 1 and {}",
                MAX_PUBLISH_BURST
            )));
        }
        if cloud.outbox_capacity == 0 {
            return Err(ConfigError::Invalid("outbox_capacity must be non-zero".into()));
        }

        Ok(())
    }
}
