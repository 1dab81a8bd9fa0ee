// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod errors;
pub mod sink;

pub use config::KafkaSinkConfig;
pub use errors::{KafkaSinkError, Result};
pub use sink::{KafkaOutputBuilder, KafkaSink};
