// SPDX-License-Identifier: Apache-2.0

pub mod client;

pub use client::{ZkClientConfig, ZkCoordinator};

/// Contract surface the tail engine needs from the coordination service.
///
/// Reads return consistent snapshots of the last known good values and
/// never block on the network; publishing is fire-and-forget.
pub trait Coordination: Send + Sync {
    /// Comma-separated `host:port` list of the currently known brokers.
    fn broker_urls(&self) -> String;

    /// The desired-state JSON document for this host.
    fn log_config(&self) -> String;

    /// Queue a progress snapshot for upload to this host's client node.
    fn publish_state(&self, payload: Vec<u8>);
}
