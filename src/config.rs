// SPDX-License-Identifier: Apache-2.0

//! Startup configuration (`key = value` text file).
//!
//! Everything here is daemon-level; per-file tailing tasks arrive later
//! through the coordination service. An invalid or missing file fails
//! startup with a diagnostic, there is no limping along on partial config.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::tail::watcher;

/// Per-line byte cap may not exceed 1 MiB.
pub const HARD_LIMIT_LINE_MAX_BYTES: u64 = 1024 * 1024;

/// Progress uploads may not be spaced further apart than 10 minutes.
pub const HARD_LIMIT_ZOOKEEPER_UPLOAD_INTERVAL_MS: u64 = 600_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file parsing error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("unknown config key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{0}")]
    Limit(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Comma-separated coordination servers.
    pub zk_urls: String,
    /// Position-store file; relative paths resolve against the config
    /// file's directory.
    pub pos_path: PathBuf,
    /// Max bytes per emitted line.
    pub line_max_bytes: u64,
    /// Inactivity threshold for retiring quiet watchers.
    pub stat_silent_max_ms: u64,
    /// Progress-publish period.
    pub zookeeper_upload_interval: Duration,
    /// Desired-state refresh period.
    pub refresh_interval: Duration,
    /// Producer retry bound (message.send.max.retries).
    pub message_send_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zk_urls: "127.0.0.1:2181".to_string(),
            pos_path: PathBuf::from("positions.json"),
            line_max_bytes: HARD_LIMIT_LINE_MAX_BYTES,
            stat_silent_max_ms: 10_000,
            zookeeper_upload_interval: Duration::from_millis(10_000),
            refresh_interval: Duration::from_millis(30_000),
            message_send_max_retries: 3,
        }
    }
}

impl Config {
    /// Load, resolve relative paths, and validate. Any failure here is
    /// fatal to the daemon.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut config = Self::parse(&text)?;

        if config.pos_path.is_relative() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            config.pos_path = dir.join(&config.pos_path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse `key = value` lines. Blank lines and `#` comments are skipped;
    /// unknown keys are rejected rather than silently ignored.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse {
                    line: idx + 1,
                    message: format!("expected `key = value`, got {:?}", raw),
                });
            };

            let key = key.trim();
            let value = unquote(value.trim());

            match key {
                "zk_urls" => config.zk_urls = value.to_string(),
                "pos_path" => config.pos_path = PathBuf::from(value),
                "line_max_bytes" => config.line_max_bytes = parse_int(key, value)?,
                "stat_silent_max_ms" => config.stat_silent_max_ms = parse_int(key, value)?,
                "zookeeper_upload_interval" => {
                    config.zookeeper_upload_interval =
                        Duration::from_millis(parse_int(key, value)?)
                }
                "refresh_interval" => {
                    config.refresh_interval = Duration::from_millis(parse_int(key, value)?)
                }
                "message_send_max_retries" => {
                    config.message_send_max_retries = parse_int(key, value)? as u32
                }
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.line_max_bytes == 0 || self.line_max_bytes > HARD_LIMIT_LINE_MAX_BYTES {
            return Err(ConfigError::Limit(format!(
                "line_max_bytes {} outside (0, {}]",
                self.line_max_bytes, HARD_LIMIT_LINE_MAX_BYTES
            )));
        }

        if !watcher::is_stat_silent_max_ms_valid(self.stat_silent_max_ms) {
            return Err(ConfigError::Limit(format!(
                "stat_silent_max_ms {} must exceed both trigger intervals ({} and {})",
                self.stat_silent_max_ms,
                watcher::STAT_TRIGGER_INTERVAL_MS,
                watcher::TIMER_TRIGGER_REPEAT_MS
            )));
        }

        let upload_ms = self.zookeeper_upload_interval.as_millis() as u64;
        if upload_ms == 0 || upload_ms > HARD_LIMIT_ZOOKEEPER_UPLOAD_INTERVAL_MS {
            return Err(ConfigError::Limit(format!(
                "zookeeper_upload_interval {} outside (0, {}]",
                upload_ms, HARD_LIMIT_ZOOKEEPER_UPLOAD_INTERVAL_MS
            )));
        }

        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Limit(
                "refresh_interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
