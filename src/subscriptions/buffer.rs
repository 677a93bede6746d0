//! Read, live and retry buffers feeding dispatch.

use crate::types::ResolvedEvent;
use std::collections::VecDeque;
use std::time::Instant;

/// An event waiting in one of the buffers.
#[derive(Clone, Debug)]
pub struct BufferedEvent {
    pub event: ResolvedEvent,

    /// Attempt number the next delivery carries; a first delivery is 1.
    pub retry_count: u32,

    /// Original delivery time, kept when a detached connection hands the
    /// event back so the timeout clock keeps running.
    pub delivered_at: Option<Instant>,

    /// Whether the event's position counts towards the checkpoint.
    pub tracked: bool,
}

impl BufferedEvent {
    /// An event read from the subscribed stream.
    pub fn fresh(event: ResolvedEvent) -> Self {
        Self {
            event,
            retry_count: 1,
            delivered_at: None,
            tracked: true,
        }
    }

    /// A parked event handed back for replay, with clean retry accounting.
    pub fn replayed(event: ResolvedEvent) -> Self {
        Self {
            event,
            retry_count: 1,
            delivered_at: None,
            tracked: false,
        }
    }
}

/// Which buffer an event came out of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferSource {
    Retry,
    Live,
    Read,
}

/// The live buffer is at capacity.
#[derive(Debug)]
pub struct LiveOverflow(pub ResolvedEvent);

/// Three-stage buffer: retry first, then live, then catch-up reads.
#[derive(Debug)]
pub struct BufferPipeline {
    read: VecDeque<BufferedEvent>,
    live: VecDeque<BufferedEvent>,
    retry: VecDeque<BufferedEvent>,
    read_capacity: usize,
    live_capacity: usize,
}

impl BufferPipeline {
    pub fn new(read_capacity: usize, live_capacity: usize) -> Self {
        Self {
            read: VecDeque::new(),
            live: VecDeque::new(),
            retry: VecDeque::new(),
            read_capacity,
            live_capacity,
        }
    }

    /// Change capacities. Events already buffered are kept.
    pub fn resize(&mut self, read_capacity: usize, live_capacity: usize) {
        self.read_capacity = read_capacity;
        self.live_capacity = live_capacity;
    }

    /// Free space in the read buffer.
    pub fn read_room(&self) -> usize {
        self.read_capacity.saturating_sub(self.read.len())
    }

    pub fn push_read(&mut self, event: ResolvedEvent) {
        self.read.push_back(BufferedEvent::fresh(event));
    }

    pub fn push_live(&mut self, event: ResolvedEvent) -> Result<(), LiveOverflow> {
        if self.live.len() >= self.live_capacity {
            return Err(LiveOverflow(event));
        }
        self.live.push_back(BufferedEvent::fresh(event));
        Ok(())
    }

    /// Queue an event for redelivery. Unbounded.
    pub fn push_retry(&mut self, entry: BufferedEvent) {
        self.retry.push_back(entry);
    }

    /// Take the next event to dispatch.
    pub fn pop_next(&mut self) -> Option<(BufferSource, BufferedEvent)> {
        if let Some(entry) = self.retry.pop_front() {
            return Some((BufferSource::Retry, entry));
        }
        if let Some(entry) = self.live.pop_front() {
            return Some((BufferSource::Live, entry));
        }
        self.read
            .pop_front()
            .map(|entry| (BufferSource::Read, entry))
    }

    pub fn read_len(&self) -> usize {
        self.read.len()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.live.is_empty() && self.retry.is_empty()
    }

    /// Drop everything, returning how many events were released.
    pub fn clear(&mut self) -> usize {
        let released = self.read.len() + self.live.len() + self.retry.len();
        self.read.clear();
        self.live.clear();
        self.retry.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Position;
    use uuid::Uuid;

    fn event(pos: u64) -> ResolvedEvent {
        ResolvedEvent::sample(Uuid::new_v4(), "e", false, None, None, Position(pos)).unwrap()
    }

    #[test]
    fn test_retry_has_priority() {
        let mut buffers = BufferPipeline::new(10, 10);
        buffers.push_read(event(0));
        buffers.push_live(event(5)).unwrap();
        buffers.push_retry(BufferedEvent::fresh(event(3)));

        let order: Vec<_> = std::iter::from_fn(|| buffers.pop_next())
            .map(|(source, entry)| (source, entry.event.position().0))
            .collect();
        assert_eq!(
            order,
            vec![
                (BufferSource::Retry, 3),
                (BufferSource::Live, 5),
                (BufferSource::Read, 0)
            ]
        );
    }

    #[test]
    fn test_live_overflow_returns_event() {
        let mut buffers = BufferPipeline::new(10, 1);
        buffers.push_live(event(0)).unwrap();
        let LiveOverflow(rejected) = buffers.push_live(event(1)).unwrap_err();
        assert_eq!(rejected.position(), Position(1));
        assert_eq!(buffers.live_len(), 1);
    }

    #[test]
    fn test_read_room() {
        let mut buffers = BufferPipeline::new(3, 1);
        buffers.push_read(event(0));
        assert_eq!(buffers.read_room(), 2);
        buffers.resize(1, 1);
        assert_eq!(buffers.read_room(), 0);
    }

    #[test]
    fn test_clear_releases_all() {
        let mut buffers = BufferPipeline::new(3, 3);
        buffers.push_read(event(0));
        buffers.push_live(event(1)).unwrap();
        assert_eq!(buffers.clear(), 2);
        assert!(buffers.is_empty());
    }
}
