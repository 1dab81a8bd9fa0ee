// SPDX-License-Identifier: Apache-2.0

//! The tail engine: per-path watchers that follow appends across rotation
//! and truncation, checkpoint read positions durably, and hand framed lines
//! to an output sink. All watchers for one daemon are driven by a single
//! engine loop owned by the [`manager::Manager`].

pub mod error;
pub mod manager;
pub mod position;
pub mod reader;
pub mod rotate;
pub mod task;
pub mod watcher;

pub use error::{Error, Result};
pub use manager::{EngineEvent, Manager, ManagerConfig};
pub use position::{PositionEntry, PositionFile, SharedPositionEntry, INO_NONE};
pub use reader::IoReader;
pub use rotate::RotateDetector;
pub use task::{DesiredState, TaskConfig};
pub use watcher::TailWatcher;
