use serde::{Deserialize, Serialize};
use std::path::Path;

use common::StreamLocator;

use crate::error::IngestError;
use crate::throttle::DEFAULT_DISCRETENESS_HZ;

/// Default target frame rate
pub const DEFAULT_FRAME_RATE: u32 = 25;

/// Default capacity of the ingest queue between capture callbacks and the driver
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Capture engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stream name reported in logs and session summaries
    pub stream_name: String,

    /// Camera stream locator (`rtsp://...` or `stub://...`)
    pub locator: StreamLocator,

    /// Target frame rate (frames per second)
    pub frame_rate: u32,

    /// Number of throttling periods per second
    pub discreteness_hz: u32,

    /// Ingest queue capacity; a full queue blocks the capture callback
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_name: "camera-stream".to_string(),
            locator: StreamLocator::new("stub://camera"),
            frame_rate: DEFAULT_FRAME_RATE,
            discreteness_hz: DEFAULT_DISCRETENESS_HZ,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new(locator: StreamLocator, frame_rate: u32) -> Self {
        Self {
            locator,
            frame_rate,
            ..Self::default()
        }
    }

    pub fn with_discreteness(mut self, discreteness_hz: u32) -> Self {
        self.discreteness_hz = discreteness_hz;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.frame_rate == 0 {
            return Err(IngestError::InvalidRate(self.frame_rate));
        }

        if self.discreteness_hz == 0 || self.discreteness_hz < self.frame_rate {
            return Err(IngestError::InvalidDiscreteness {
                rate: self.frame_rate,
                discreteness: self.discreteness_hz,
            });
        }

        if self.queue_capacity == 0 {
            return Err(IngestError::Configuration(
                "Ingest queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.locator.as_str().is_empty() {
            return Err(IngestError::Configuration(
                "Stream locator cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, IngestError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| IngestError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String, IngestError> {
        toml::to_string_pretty(self)
            .map_err(|e| IngestError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    /// Load configuration from file
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            IngestError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), IngestError> {
        let content = self.to_toml_string()?;
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path.as_ref(), content).await?;
        Ok(())
    }
}
