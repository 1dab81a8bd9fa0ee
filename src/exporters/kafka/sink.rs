// SPDX-License-Identifier: Apache-2.0

//! Kafka-backed line sink.
//!
//! Wraps a `ThreadedProducer`, whose poll thread handles delivery, retries,
//! and batching. `push` only enqueues: a full local queue maps to
//! `Rejected`, anything enqueued is owned by librdkafka from then on.

use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use crate::exporters::kafka::config::KafkaSinkConfig;
use crate::exporters::kafka::errors::{KafkaSinkError, Result};
use crate::exporters::{BoxError, Output, OutputBuilder, PushOutcome};
use crate::tail::task::TaskConfig;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaSink {
    producer: ThreadedProducer<DefaultProducerContext>,
    /// Partition pin for tasks with a fixed-partition strategy.
    fixed_partition: Option<i32>,
}

impl KafkaSink {
    pub fn new(config: KafkaSinkConfig, fixed_partition: Option<i32>) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(KafkaSinkError::Configuration(
                "no brokers known yet".to_string(),
            ));
        }

        let client_config = config.build_client_config();
        let producer: ThreadedProducer<DefaultProducerContext> = client_config
            .create()
            .map_err(|e| KafkaSinkError::Configuration(format!("failed to create producer: {}", e)))?;

        info!(brokers = %config.brokers, "Kafka sink created");

        Ok(Self {
            producer,
            fixed_partition,
        })
    }
}

impl Output for KafkaSink {
    fn push(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> PushOutcome {
        let mut record = BaseRecord::to(topic).key(key.unwrap_or("")).payload(payload);
        if let Some(partition) = self.fixed_partition {
            record = record.partition(partition);
        }

        match self.producer.send(record) {
            Ok(()) => PushOutcome::Accepted,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                debug!(topic, "producer queue full, rejecting line");
                PushOutcome::Rejected
            }
            Err((e, _)) => {
                error!(topic, error = %e, "failed to enqueue line");
                PushOutcome::Rejected
            }
        }
    }

    fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(CLOSE_FLUSH_TIMEOUT)) {
            error!(error = %e, "failed to flush Kafka sink on close");
        }
    }
}

/// Builds one producer per task from the broker list the coordination
/// client currently knows.
pub struct KafkaOutputBuilder {
    /// Daemon-level `message_send_max_retries`.
    pub retries: u32,
}

impl OutputBuilder for KafkaOutputBuilder {
    fn build(
        &self,
        conf: &TaskConfig,
        brokers: &str,
    ) -> std::result::Result<std::sync::Arc<dyn Output>, BoxError> {
        let sink_config = KafkaSinkConfig::for_task(brokers, self.retries, conf);
        let sink = KafkaSink::new(sink_config, conf.partition_strategy.fixed_partition())?;
        Ok(std::sync::Arc::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::task::parse_desired_state;

    #[test]
    fn creation_without_brokers_fails() {
        let state = parse_desired_state(r#"{"/a.log": {"topic": "t"}}"#).unwrap();
        let conf = KafkaSinkConfig::for_task("", 3, &state["/a.log"]);

        assert!(matches!(
            KafkaSink::new(conf, None),
            Err(KafkaSinkError::Configuration(_))
        ));
    }

    #[test]
    fn creation_with_brokers_succeeds() {
        // Producer creation does not contact the brokers.
        let state = parse_desired_state(r#"{"/a.log": {"topic": "t"}}"#).unwrap();
        let conf = KafkaSinkConfig::for_task("localhost:9092", 3, &state["/a.log"]);

        let sink = KafkaSink::new(conf, Some(2)).unwrap();
        assert_eq!(sink.fixed_partition, Some(2));
    }
}
