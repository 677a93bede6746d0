//! Per-subscription configuration.

use crate::checkpoint::CheckpointPolicy;
use crate::error::{Result, SubscriptionError};
use crate::types::Position;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one persistent subscription.
///
/// Field names on the wire follow the management API (`resolveLinktos`,
/// `messageTimeoutMilliseconds`, ...). Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionConfig {
    /// Ask the log to resolve link events.
    #[serde(rename = "resolveLinktos")]
    pub resolve_link_tos: bool,

    /// First position delivered when no checkpoint exists.
    pub start_from: u64,

    /// Time a consumer has to acknowledge a message. 0 = no timeout.
    #[serde(rename = "messageTimeoutMilliseconds")]
    pub message_timeout_ms: u64,

    /// Collect per-connection latency measurements.
    pub extra_statistics: bool,

    /// Failed deliveries tolerated before a message is parked.
    pub max_retry_count: u32,

    /// Capacity of the catch-up read buffer.
    pub buffer_size: usize,

    /// Capacity of the live buffer.
    pub live_buffer_size: usize,

    /// Events requested per log read.
    pub read_batch_size: usize,

    /// Round-robin dispatch; otherwise first connection with a free slot.
    pub prefer_round_robin: bool,

    /// Checkpoint at least this often while confirmations are pending.
    #[serde(rename = "checkPointAfterMilliseconds")]
    pub check_point_after_ms: u64,

    /// Confirmations that trigger a checkpoint.
    pub min_check_point_count: u64,

    /// Confirmations that force a checkpoint.
    pub max_check_point_count: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            resolve_link_tos: true,
            start_from: 0,
            message_timeout_ms: 0,
            extra_statistics: true,
            max_retry_count: 10,
            buffer_size: 500,
            live_buffer_size: 500,
            read_batch_size: 20,
            prefer_round_robin: true,
            check_point_after_ms: 1000,
            min_check_point_count: 10,
            max_check_point_count: 500,
        }
    }
}

impl SubscriptionConfig {
    /// Parse from a JSON request body. An empty body yields the defaults.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| SubscriptionError::InvalidArgument(format!("bad config: {}", e)))
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SubscriptionError::InvalidArgument(msg.to_string()));

        if self.buffer_size == 0 {
            return invalid("bufferSize must be positive");
        }
        if self.live_buffer_size == 0 {
            return invalid("liveBufferSize must be positive");
        }
        if self.read_batch_size == 0 {
            return invalid("readBatchSize must be positive");
        }
        if self.read_batch_size > self.buffer_size {
            return invalid("readBatchSize may not exceed bufferSize");
        }
        if self.max_check_point_count == 0 {
            return invalid("maxCheckPointCount must be positive");
        }
        if self.min_check_point_count > self.max_check_point_count {
            return invalid("minCheckPointCount may not exceed maxCheckPointCount");
        }
        Ok(())
    }

    pub fn message_timeout(&self) -> Option<Duration> {
        match self.message_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn start_position(&self) -> Position {
        Position(self.start_from)
    }

    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        CheckpointPolicy {
            after: Duration::from_millis(self.check_point_after_ms),
            min_count: self.min_check_point_count,
            max_count: self.max_check_point_count,
        }
    }
}
