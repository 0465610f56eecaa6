// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume configuration

use bridgefs_logging::LoggingConfig;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid JSON configuration: {0}")]
    Json(String),
    #[error("invalid TOML configuration: {0}")]
    Toml(String),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Per-volume settings consumed by the create path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Refuse dispositions that would modify the volume
    pub read_only: bool,
    /// Accept `name:stream` paths
    pub alternate_streams: bool,
    /// Mount identity stamped on every open instance and envelope
    pub session_id: u64,
    pub reserved_names: ReservedNames,
    pub gc: CollectionPolicy,
    pub limits: CacheLimits,
    /// Where the embedding host sends this volume's logs
    pub logging: LoggingConfig,
}

/// Paths that open in-kernel channels instead of reaching the worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservedNames {
    pub keepalive: String,
    pub notification: String,
}

/// Deferred deletion of unreferenced control blocks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionPolicy {
    pub enabled: bool,
    pub grace_period_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    /// Upper bound on live control blocks; 0 means unlimited
    pub max_control_blocks: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            alternate_streams: false,
            session_id: 0,
            reserved_names: ReservedNames::default(),
            gc: CollectionPolicy::default(),
            limits: CacheLimits::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ReservedNames {
    fn default() -> Self {
        Self {
            keepalive: "\\__bridgefs_keepalive".to_string(),
            notification: "\\__bridgefs_notification".to_string(),
        }
    }
}

impl Default for CollectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_ms: 2000,
            sweep_interval_ms: 1000,
        }
    }
}

impl BridgeConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_slice(bytes).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Toml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in [&self.reserved_names.keepalive, &self.reserved_names.notification] {
            if !name.starts_with('\\') {
                return Err(ConfigError::Invalid("reserved names must be absolute"));
            }
        }
        if self.gc.enabled && self.gc.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep interval must be non-zero"));
        }
        Ok(())
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn without_gc(mut self) -> Self {
        self.gc.enabled = false;
        self
    }
}
