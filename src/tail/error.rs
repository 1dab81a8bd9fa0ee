// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Position store error: {0}")]
    Position(String),

    #[error("Invalid path pattern: {0}")]
    Pattern(String),

    #[error("Task config error: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;
