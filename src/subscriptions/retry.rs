//! Outstanding deliveries and the retry/park decision.

use super::buffer::BufferedEvent;
use crate::types::{ConnectionId, ResolvedEvent};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// What to do with a delivery that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue for redelivery with the given attempt number.
    Retry(u32),
    /// Move to the parked stream.
    Park(u32),
}

/// Redeliver-or-park policy.
///
/// Deterministic in `(retry_count, max_retry_count)`: the count is bumped by
/// one per failed delivery and the message is parked once it exceeds the
/// maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAndParkingPolicy {
    pub max_retry_count: u32,
}

impl RetryAndParkingPolicy {
    pub fn new(max_retry_count: u32) -> Self {
        Self { max_retry_count }
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next <= self.max_retry_count {
            RetryDecision::Retry(next)
        } else {
            RetryDecision::Park(next)
        }
    }
}

/// How the consumer wants a negatively acknowledged message handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NackAction {
    /// Let the retry policy decide.
    #[default]
    Retry,
    /// Park immediately.
    Park,
    /// Drop it as if it had been processed.
    Skip,
}

/// An event handed to a connection and not yet acknowledged.
#[derive(Clone, Debug)]
pub struct OutstandingMessage {
    pub event: ResolvedEvent,
    pub connection: ConnectionId,
    pub delivered_at: Instant,
    /// Delivery attempt this message represents; a first delivery is 1.
    pub retry_count: u32,
    /// Whether the position counts towards the checkpoint.
    pub tracked: bool,
    /// Ack deadline in force when the message was dispatched. None = never.
    pub timeout: Option<Duration>,
}

impl OutstandingMessage {
    pub fn from_buffered(
        entry: BufferedEvent,
        connection: ConnectionId,
        now: Instant,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            connection,
            timeout,
            delivered_at: entry.delivered_at.unwrap_or(now),
            retry_count: entry.retry_count,
            tracked: entry.tracked,
            event: entry.event,
        }
    }

    /// Back to buffer form, keeping retry count and delivery time.
    pub fn into_buffered(self) -> BufferedEvent {
        BufferedEvent {
            event: self.event,
            retry_count: self.retry_count,
            delivered_at: Some(self.delivered_at),
            tracked: self.tracked,
        }
    }

    /// Buffer form for redelivery after a failure.
    pub fn into_retry(self, retry_count: u32) -> BufferedEvent {
        BufferedEvent {
            event: self.event,
            retry_count,
            delivered_at: None,
            tracked: self.tracked,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.timeout
            .map_or(false, |timeout| now.saturating_duration_since(self.delivered_at) > timeout)
    }
}

/// Outstanding messages keyed by event id.
#[derive(Debug, Default)]
pub struct OutstandingMessages {
    messages: HashMap<Uuid, OutstandingMessage>,
}

impl OutstandingMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.messages.contains_key(id)
    }

    pub fn insert(&mut self, message: OutstandingMessage) {
        self.messages.insert(message.event.event_id(), message);
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<OutstandingMessage> {
        self.messages.remove(id)
    }

    /// Remove and return messages past their own deadline, oldest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<OutstandingMessage> {
        let expired: Vec<Uuid> = self
            .messages
            .iter()
            .filter(|(_, m)| m.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        let mut taken: Vec<_> = expired
            .iter()
            .filter_map(|id| self.messages.remove(id))
            .collect();
        taken.sort_by_key(|m| (m.delivered_at, m.event.position()));
        taken
    }

    /// Remove and return everything held by one connection, oldest first.
    pub fn take_for_connection(&mut self, connection: ConnectionId) -> Vec<OutstandingMessage> {
        let ids: Vec<Uuid> = self
            .messages
            .iter()
            .filter(|(_, m)| m.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        let mut taken: Vec<_> = ids
            .iter()
            .filter_map(|id| self.messages.remove(id))
            .collect();
        taken.sort_by_key(|m| m.event.position());
        taken
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutstandingMessage> {
        self.messages.values()
    }

    pub fn drain(&mut self) -> Vec<OutstandingMessage> {
        self.messages.drain().map(|(_, m)| m).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn count_for(&self, connection: ConnectionId) -> usize {
        self.messages
            .values()
            .filter(|m| m.connection == connection)
            .count()
    }
}
