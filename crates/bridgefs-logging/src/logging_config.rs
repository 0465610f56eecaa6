// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging configuration types

use crate::{init, init_to_file, standard_log_path, LogFormat, LogLevel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Logging configuration
///
/// Console output is used unless `directory` or `file` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,

    #[serde(rename = "log-format", skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,

    /// Directory for log files
    #[serde(rename = "log-dir", skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Log filename, absolute or relative to `directory`
    #[serde(rename = "log-file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl LoggingConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        let level = self.level.unwrap_or_default().into();
        let format = self.format.unwrap_or_default();

        if self.logs_to_file() {
            init_to_file(component, level, format, &self.resolve_log_path(component))
        } else {
            init(component, level, format)
        }
    }

    pub fn logs_to_file(&self) -> bool {
        self.file.is_some() || self.directory.is_some()
    }

    /// Resolve the log file path
    ///
    /// 1. An absolute `file` is used as-is
    /// 2. A relative `file` is joined onto `directory` when one is set
    /// 3. A `directory` alone gets `<component>.log`
    /// 4. Otherwise the platform standard location
    pub fn resolve_log_path(&self, component: &str) -> PathBuf {
        match (&self.file, &self.directory) {
            (Some(file), _) if Path::new(file).is_absolute() => PathBuf::from(file),
            (Some(file), Some(dir)) => Path::new(dir).join(file),
            (Some(file), None) => PathBuf::from(file),
            (None, Some(dir)) => Path::new(dir).join(format!("{}.log", component)),
            (None, None) => standard_log_path(component),
        }
    }
}
