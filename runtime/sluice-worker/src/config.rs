//! Worker configuration. Every field has a default, so an empty TOML file
//! (or none at all) yields a working setup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sluice_db::EngineConfig;

use crate::backpressure::BackpressureConfig;
use crate::chunk::ChunkLimits;
use crate::transport::{MAX_FRAME_SIZE, WireCodec};

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub chunk: ChunkLimits,
    pub backpressure: BackpressureConfig,
    pub engine: EngineSection,
    pub normalizer: NormalizerConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub memory_limit_bytes: Option<u64>,
    pub threads: Option<usize>,
    pub preserve_insertion_order: bool,
    pub time_zone: Option<String>,
    pub batch_rows: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            memory_limit_bytes: engine.memory_limit_bytes,
            threads: engine.threads,
            preserve_insertion_order: engine.preserve_insertion_order,
            time_zone: engine.time_zone,
            batch_rows: engine.batch_rows,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            memory_limit_bytes: self.memory_limit_bytes,
            threads: self.threads,
            preserve_insertion_order: self.preserve_insertion_order,
            time_zone: self.time_zone.clone(),
            batch_rows: self.batch_rows,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerConfig {
    /// Nesting depth at which composite values are cut off.
    pub max_depth: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { max_depth: 256 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Reply codec until the first inbound frame is seen.
    pub codec: WireCodec,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            codec: WireCodec::Msgpack,
            max_frame_bytes: MAX_FRAME_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 7] = [
            ("chunk.max_bytes", self.chunk.max_bytes as u64),
            ("chunk.max_rows", self.chunk.max_rows as u64),
            ("backpressure.max_outstanding", self.backpressure.max_outstanding as u64),
            ("backpressure.poll_interval_ms", self.backpressure.poll_interval_ms),
            (
                "backpressure.memory_check_interval_ms",
                self.backpressure.memory_check_interval_ms,
            ),
            ("engine.batch_rows", self.engine.batch_rows as u64),
            ("normalizer.max_depth", self.normalizer.max_depth as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        if self.transport.max_frame_bytes == 0 || self.transport.max_frame_bytes > u32::MAX as usize
        {
            return Err(ConfigError::InvalidValue {
                field: "transport.max_frame_bytes",
                reason: format!("must be between 1 and {}", u32::MAX),
            });
        }
        if self.engine.threads == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "engine.threads",
                reason: "must be > 0 when set".to_string(),
            });
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level",
                reason: format!(
                    "'{}' is not one of: {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }
        Ok(())
    }
}
