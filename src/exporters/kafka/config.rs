// SPDX-License-Identifier: Apache-2.0

use rdkafka::ClientConfig;

use crate::tail::task::{Compression, TaskConfig};

/// Producer configuration for one task's Kafka sink.
#[derive(Clone, Debug)]
pub struct KafkaSinkConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Client ID for the Kafka producer
    pub client_id: String,

    /// Compression codec
    pub compression: Compression,

    /// Kafka `acks`: -1, 0, or 1
    pub required_acks: i32,

    /// Batch size in bytes
    pub batch_size: u32,

    /// Message timeout in milliseconds; 0 leaves the librdkafka default
    pub message_timeout_ms: u32,

    /// Number of retries (message.send.max.retries)
    pub retries: u32,

    /// Partitioner name, when the task's strategy maps to one
    pub partitioner: Option<&'static str>,
}

impl KafkaSinkConfig {
    /// Assemble the sink config for one task against the current broker
    /// list.
    pub fn for_task(brokers: impl Into<String>, retries: u32, conf: &TaskConfig) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: "logship".to_string(),
            compression: conf.compression,
            required_acks: conf.required_acks,
            batch_size: conf.batch_size,
            message_timeout_ms: conf.message_timeout_ms,
            retries,
            partitioner: conf.partition_strategy.partitioner(),
        }
    }

    /// Build rdkafka ClientConfig from this configuration
    pub fn build_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.brokers);
        config.set("client.id", &self.client_id);

        config.set("compression.codec", self.compression.to_kafka_value());
        config.set("acks", self.required_acks.to_string());
        config.set("batch.size", self.batch_size.to_string());
        config.set("message.send.max.retries", self.retries.to_string());

        if self.message_timeout_ms > 0 {
            config.set("message.timeout.ms", self.message_timeout_ms.to_string());
        }

        if let Some(partitioner) = self.partitioner {
            config.set("partitioner", partitioner);
        }

        config
    }
}
