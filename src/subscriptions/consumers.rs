//! Consumer connections attached to a subscription.

use crate::types::{ConnectionId, ResolvedEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Connection id used for messages handed out by `read_next` (pull) rather
/// than pushed to an attached connection.
pub const PULL_CONNECTION: ConnectionId = ConnectionId(0);

/// A message pushed to a connection.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub event: ResolvedEvent,
    /// Delivery attempt; a first delivery is 1.
    pub retry_count: u32,
}

/// Request to attach a connection.
#[derive(Clone, Debug)]
pub struct ConnectionRequest {
    pub username: String,
    pub from: String,
    /// Maximum unacknowledged messages the connection accepts.
    pub slots: usize,
}

impl ConnectionRequest {
    pub fn new(username: impl Into<String>, from: impl Into<String>, slots: usize) -> Self {
        Self {
            username: username.into(),
            from: from.into(),
            slots,
        }
    }
}

/// Consumer side of an attached connection.
#[derive(Debug)]
pub struct ConsumerHandle {
    pub id: ConnectionId,
    /// Channel to receive deliveries.
    pub receiver: Receiver<Delivery>,
}

impl ConsumerHandle {
    /// Receive the next delivery (blocking).
    pub fn recv(&self) -> Result<Delivery, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a delivery (non-blocking).
    pub fn try_recv(&self) -> Result<Delivery, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Delivery, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<Delivery> {
        self.receiver.try_iter().collect()
    }
}

/// Items-per-second meter with a rolling window.
#[derive(Clone, Debug)]
pub struct ThroughputMeter {
    total: u64,
    count_since_last: u64,
    window_start: Instant,
    last_rate: f64,
}

impl ThroughputMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            total: 0,
            count_since_last: 0,
            window_start: now,
            last_rate: 0.0,
        }
    }

    pub fn record(&mut self, items: u64) {
        self.total += items;
        self.count_since_last += items;
    }

    /// Close the window if it has run for at least `window`.
    pub fn roll(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < window || elapsed.is_zero() {
            return;
        }
        self.last_rate = self.count_since_last as f64 / elapsed.as_secs_f64();
        self.count_since_last = 0;
        self.window_start = now;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count_since_last(&self) -> u64 {
        self.count_since_last
    }

    pub fn rate(&self) -> f64 {
        self.last_rate
    }
}

/// Per-connection statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub username: String,
    pub from: String,
    pub average_items_per_second: f64,
    pub total_items_processed: u64,
    pub count_since_last_measurement: u64,
    pub available_slots: usize,
    pub in_flight: usize,
    pub extra_statistics: BTreeMap<String, i64>,
}

/// An attached connection.
pub struct ConsumerConnection {
    id: ConnectionId,
    username: String,
    from: String,
    slots: usize,
    in_flight: usize,
    sender: Sender<Delivery>,
    meter: ThroughputMeter,
    observed: BTreeMap<String, i64>,
}

impl ConsumerConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn available_slots(&self) -> usize {
        self.slots.saturating_sub(self.in_flight)
    }

    fn stats(&self, include_extra: bool) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            username: self.username.clone(),
            from: self.from.clone(),
            average_items_per_second: self.meter.rate(),
            total_items_processed: self.meter.total(),
            count_since_last_measurement: self.meter.count_since_last(),
            available_slots: self.available_slots(),
            in_flight: self.in_flight,
            extra_statistics: if include_extra {
                self.observed.clone()
            } else {
                BTreeMap::new()
            },
        }
    }
}

/// Attached connections, their free slots and dispatch order.
pub struct ConsumerPool {
    /// In attach order.
    connections: Vec<ConsumerConnection>,
    /// Index where the next round-robin scan starts.
    cursor: usize,
    next_id: u64,
    round_robin: bool,
}

impl ConsumerPool {
    pub fn new(round_robin: bool) -> Self {
        Self {
            connections: Vec::new(),
            cursor: 0,
            next_id: PULL_CONNECTION.0 + 1,
            round_robin,
        }
    }

    pub fn set_round_robin(&mut self, round_robin: bool) {
        self.round_robin = round_robin;
    }

    /// Attach a connection and hand back its receiving side.
    pub fn attach(&mut self, request: ConnectionRequest, now: Instant) -> ConsumerHandle {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let (sender, receiver) = unbounded();

        self.connections.push(ConsumerConnection {
            id,
            username: request.username,
            from: request.from,
            slots: request.slots,
            in_flight: 0,
            sender,
            meter: ThroughputMeter::new(now),
            observed: BTreeMap::new(),
        });

        ConsumerHandle { id, receiver }
    }

    /// Detach a connection. Returns false if it was not attached.
    pub fn detach(&mut self, id: ConnectionId) -> bool {
        let Some(index) = self.connections.iter().position(|c| c.id == id) else {
            return false;
        };
        self.connections.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.connections.len() {
            self.cursor = 0;
        }
        true
    }

    /// Drop every connection; their receivers see a disconnect.
    pub fn clear(&mut self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        self.cursor = 0;
        count
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.iter().any(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn available_slot_count(&self) -> usize {
        self.connections.iter().map(|c| c.available_slots()).sum()
    }

    /// Pick the connection for the next delivery.
    pub fn select(&mut self) -> Option<ConnectionId> {
        let n = self.connections.len();
        if n == 0 {
            return None;
        }

        if !self.round_robin {
            return self
                .connections
                .iter()
                .find(|c| c.available_slots() > 0)
                .map(|c| c.id);
        }

        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            if self.connections[index].available_slots() > 0 {
                self.cursor = (index + 1) % n;
                return Some(self.connections[index].id);
            }
        }
        None
    }

    /// Push a delivery and take a slot. On failure the slot is untouched and
    /// the connection should be detached.
    pub fn deliver(&mut self, id: ConnectionId, delivery: Delivery) -> Result<(), Delivery> {
        let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) else {
            return Err(delivery);
        };
        match conn.sender.try_send(delivery) {
            Ok(()) => {
                conn.in_flight += 1;
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Full(d)) => Err(d),
            Err(crossbeam_channel::TrySendError::Disconnected(d)) => Err(d),
        }
    }

    /// Release a slot after ack, nack or timeout. Acks count as processed.
    pub fn release(&mut self, id: ConnectionId, processed: bool) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            conn.in_flight = conn.in_flight.saturating_sub(1);
            if processed {
                conn.meter.record(1);
            }
        }
    }

    /// Record a named measurement for a connection (extra statistics).
    pub fn observe(&mut self, id: ConnectionId, name: &str, value: i64) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            conn.observed.insert(name.to_string(), value);
        }
    }

    /// Record a measurement, keeping the larger value.
    pub fn observe_max(&mut self, id: ConnectionId, name: &str, value: i64) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            let entry = conn.observed.entry(name.to_string()).or_insert(value);
            *entry = (*entry).max(value);
        }
    }

    pub fn roll_measurements(&mut self, now: Instant, window: Duration) {
        for conn in &mut self.connections {
            conn.meter.roll(now, window);
        }
    }

    pub fn stats(&self, include_extra: bool) -> Vec<ConnectionStats> {
        self.connections
            .iter()
            .map(|c| c.stats(include_extra))
            .collect()
    }
}
