// SPDX-License-Identifier: Apache-2.0

pub mod kafka;

/// Result of offering one payload to an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The output has taken ownership of delivery; the caller may advance
    /// its checkpoint past this payload.
    Accepted,
    /// The output could not take the payload (queue full, producer gone).
    /// The caller retries the same bytes on a later tick.
    Rejected,
}

/// Abstract line sink. `push` must not block the engine loop: it either
/// enqueues and returns `Accepted` or returns `Rejected` immediately.
pub trait Output: Send + Sync {
    fn push(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> PushOutcome;

    /// Flush whatever the sink buffered, bounded in time. Safe to call more
    /// than once.
    fn close(&self);
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Builds the sink for one task against the current broker list. The
/// manager calls this at watcher creation and again when producer-level
/// task settings change.
pub trait OutputBuilder: Send + Sync {
    fn build(
        &self,
        conf: &crate::tail::task::TaskConfig,
        brokers: &str,
    ) -> Result<std::sync::Arc<dyn Output>, BoxError>;
}
