// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KafkaSinkError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

pub type Result<T> = std::result::Result<T, KafkaSinkError>;
