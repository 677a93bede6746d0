//! In-memory event log.

use super::EventLog;
use crate::error::{Result, SubscriptionError};
use crate::types::{EventData, Position, ResolvedEvent, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Event log kept entirely in memory.
///
/// Positions are assigned contiguously per stream starting at zero. Read and
/// append failures can be injected to exercise retry paths.
#[derive(Default)]
pub struct InMemoryLog {
    streams: RwLock<HashMap<String, Vec<ResolvedEvent>>>,
    failing_reads: AtomicU32,
    failing_appends: AtomicU32,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` appends fail.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of events in a stream.
    pub fn stream_len(&self, stream_id: &str) -> usize {
        self.streams.read().get(stream_id).map_or(0, Vec::len)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EventLog for InMemoryLog {
    fn read_forward(
        &self,
        stream_id: &str,
        from: Position,
        max_count: usize,
        _resolve_links: bool,
    ) -> Result<Vec<ResolvedEvent>> {
        if Self::take_failure(&self.failing_reads) {
            return Err(SubscriptionError::Log(format!(
                "injected read failure on {}",
                stream_id
            )));
        }

        let streams = self.streams.read();
        let Some(events) = streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        let start = (from.0 as usize).min(events.len());
        Ok(events[start..].iter().take(max_count).cloned().collect())
    }

    fn append(&self, stream_id: &str, events: Vec<EventData>) -> Result<Position> {
        if events.is_empty() {
            return Err(SubscriptionError::InvalidArgument(
                "append requires at least one event".into(),
            ));
        }
        if Self::take_failure(&self.failing_appends) {
            return Err(SubscriptionError::Log(format!(
                "injected append failure on {}",
                stream_id
            )));
        }

        let mut streams = self.streams.write();
        let stream = streams.entry(stream_id.to_string()).or_default();

        // Resolve everything first so a bad event leaves the stream untouched.
        let timestamp = Timestamp::now();
        let base = stream.len() as u64;
        let resolved = events
            .into_iter()
            .enumerate()
            .map(|(i, data)| data.into_resolved(Position(base + i as u64), timestamp))
            .collect::<Result<Vec<_>>>()?;

        stream.extend(resolved);
        Ok(Position(stream.len() as u64 - 1))
    }
}
