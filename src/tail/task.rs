// SPDX-License-Identifier: Apache-2.0

//! Per-path tailing tasks as distributed through the coordination service.
//!
//! The desired-state document is a JSON mapping from `path_pattern` to a
//! [`TaskConfig`]. The pattern may contain strftime-style calendar
//! specifiers which expand against local wall-clock time, so one task can
//! follow day-stamped files like `/var/log/app.%Y%m%d.log`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::tail::error::{Error, Result};

/// Desired set of tailers, keyed by path pattern (the task identity).
pub type DesiredState = BTreeMap<String, TaskConfig>;

/// How records for a task are assigned to partitions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// librdkafka random partitioner.
    #[default]
    Random,
    /// Consistent hash of the message key.
    Consistent,
    /// Murmur2 hash of the message key (Java client compatible).
    Murmur2,
    /// Hash of a fixed per-task key.
    Keyed { key: String },
    /// Pin every record to one partition.
    Fixed { partition: i32 },
}

impl PartitionStrategy {
    /// The librdkafka `partitioner` value, when the strategy maps to one.
    pub fn partitioner(&self) -> Option<&'static str> {
        match self {
            PartitionStrategy::Random => Some("random"),
            PartitionStrategy::Consistent => Some("consistent"),
            PartitionStrategy::Murmur2 => Some("murmur2"),
            PartitionStrategy::Keyed { .. } | PartitionStrategy::Fixed { .. } => None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            PartitionStrategy::Keyed { key } => Some(key),
            _ => None,
        }
    }

    pub fn fixed_partition(&self) -> Option<i32> {
        match self {
            PartitionStrategy::Fixed { partition } => Some(*partition),
            _ => None,
        }
    }
}

/// Compression codec for the task's producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Convert to the string value expected by librdkafka
    pub fn to_kafka_value(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// One desired tailer. Unknown JSON fields are ignored; missing fields take
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub topic: String,

    #[serde(default)]
    pub partition_strategy: PartitionStrategy,

    #[serde(default)]
    pub compression: Compression,

    /// Kafka `acks`: -1 (all in-sync replicas), 0 (none), or 1 (leader).
    #[serde(default = "default_required_acks")]
    pub required_acks: i32,

    /// Producer batch size in bytes.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,

    /// Start at byte 0 for a file seen for the first time; otherwise start
    /// at its current end.
    #[serde(default)]
    pub read_from_head: bool,

    /// Upper bound on lines drained per watcher tick.
    #[serde(default = "default_max_lines_per_tick")]
    pub max_lines_per_tick: usize,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_required_acks() -> i32 {
    1
}

fn default_batch_size() -> u32 {
    1_000_000
}

fn default_message_timeout_ms() -> u32 {
    0 // librdkafka default
}

fn default_max_lines_per_tick() -> usize {
    100
}

fn default_enabled() -> bool {
    true
}

impl TaskConfig {
    /// Fields that can change without rebuilding the producer.
    pub fn same_producer_settings(&self, other: &TaskConfig) -> bool {
        self.compression == other.compression
            && self.required_acks == other.required_acks
            && self.batch_size == other.batch_size
            && self.message_timeout_ms == other.message_timeout_ms
            && self.partition_strategy.partitioner() == other.partition_strategy.partitioner()
            && self.partition_strategy.fixed_partition()
                == other.partition_strategy.fixed_partition()
    }
}

/// Parse the desired-state document. An empty document is `{}`; a missing
/// or null topic is rejected per task by serde.
pub fn parse_desired_state(json: &str) -> Result<DesiredState> {
    let state: DesiredState = serde_json::from_str(json)?;
    for (pattern, conf) in &state {
        if conf.topic.is_empty() {
            return Err(Error::Task(format!("task {} has an empty topic", pattern)));
        }
    }
    Ok(state)
}

/// Expand strftime-style calendar specifiers in a path pattern against the
/// given wall-clock time. Patterns without `%` pass through unchanged;
/// invalid specifiers are an error rather than a panic.
pub fn expand_path_pattern(pattern: &str, now: DateTime<Local>) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    match write!(out, "{}", now.format(pattern)) {
        Ok(()) => Ok(out),
        Err(_) => Err(Error::Pattern(pattern.to_string())),
    }
}
