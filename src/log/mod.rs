//! Access to the append-only event log.
//!
//! The log itself is an external collaborator reached through the
//! [`EventLog`] trait. Subscriptions read it in batches through a
//! [`LogReader`] and append parked messages to a per-subscription
//! dead-letter stream.

mod memory;
mod reader;

pub use memory::InMemoryLog;
pub use reader::LogReader;

use crate::error::Result;
use crate::types::{EventData, Position, ResolvedEvent};

/// Append-only log of streams.
pub trait EventLog: Send + Sync {
    /// Read up to `max_count` events of `stream_id` starting at `from`, in
    /// position order. An unknown stream reads as empty.
    fn read_forward(
        &self,
        stream_id: &str,
        from: Position,
        max_count: usize,
        resolve_links: bool,
    ) -> Result<Vec<ResolvedEvent>>;

    /// Append events to `stream_id`, returning the position of the last one.
    fn append(&self, stream_id: &str, events: Vec<EventData>) -> Result<Position>;
}
