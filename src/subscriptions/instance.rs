//! The per (stream, group) subscription state machine.

use super::buffer::{BufferPipeline, BufferSource, BufferedEvent, LiveOverflow};
use super::config::SubscriptionConfig;
use super::consumers::{
    ConnectionRequest, ConsumerHandle, ConsumerPool, Delivery, ThroughputMeter, PULL_CONNECTION,
};
use super::retry::{
    NackAction, OutstandingMessage, OutstandingMessages, RetryAndParkingPolicy, RetryDecision,
};
use crate::checkpoint::{Checkpoint, CheckpointStore, LowWaterMark};
use crate::config::{Backoff, EngineConfig};
use crate::error::{Result, SubscriptionError};
use crate::log::LogReader;
use crate::types::{ConnectionId, Position, ResolvedEvent, SubscriptionKey};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a subscription instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Checkpoint not loaded yet.
    Initializing,
    /// Reading history from the log.
    CatchingUp,
    /// Caught up; fed by appended events.
    Live,
    /// Deleted; waiting for outstanding messages to resolve.
    Draining,
    Stopped,
}

/// Collaborators shared by every instance of a registry.
#[derive(Clone)]
pub struct InstanceContext {
    pub reader: LogReader,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub engine: EngineConfig,
}

/// One persistent subscription.
///
/// All mutation goes through `&mut self`; the owner serializes access (the
/// registry keeps each instance behind its own mutex).
pub struct SubscriptionInstance {
    key: SubscriptionKey,
    config: SubscriptionConfig,
    ctx: InstanceContext,
    state: InstanceState,
    /// Set while log reads keep failing.
    unavailable: bool,
    read_backoff: Backoff,
    checkpoint_backoff: Backoff,

    buffers: BufferPipeline,
    pool: ConsumerPool,
    outstanding: OutstandingMessages,

    /// Next position to read from the subscribed stream.
    next_read: Position,
    /// Highest position known to exist in the stream.
    last_known: Option<Position>,
    mark: LowWaterMark,

    last_persisted: Option<Position>,
    confirmations_since_persist: u64,
    last_persist_at: Instant,

    parked_count: u64,
    /// Next position of the parked stream not yet replayed.
    parked_replay_from: Position,
    drain_deadline: Option<Instant>,
    processed: ThroughputMeter,
}

impl SubscriptionInstance {
    /// Create an instance and try to load its checkpoint.
    pub fn new(
        key: SubscriptionKey,
        config: SubscriptionConfig,
        ctx: InstanceContext,
        now: Instant,
    ) -> Self {
        let mut instance = Self {
            buffers: BufferPipeline::new(config.buffer_size, config.live_buffer_size),
            pool: ConsumerPool::new(config.prefer_round_robin),
            outstanding: OutstandingMessages::new(),
            next_read: config.start_position(),
            last_known: None,
            mark: LowWaterMark::starting_at(config.start_position().prev()),
            last_persisted: None,
            confirmations_since_persist: 0,
            last_persist_at: now,
            parked_count: 0,
            parked_replay_from: Position(0),
            drain_deadline: None,
            processed: ThroughputMeter::new(now),
            state: InstanceState::Initializing,
            unavailable: false,
            read_backoff: Backoff::default(),
            checkpoint_backoff: Backoff::default(),
            key,
            config,
            ctx,
        };
        instance.initialize(now);
        instance
    }

    fn initialize(&mut self, now: Instant) {
        if !self.checkpoint_backoff.ready(now) {
            return;
        }

        match self.ctx.checkpoints.load(&self.key) {
            Ok(Some(checkpoint)) => {
                self.next_read = checkpoint.position.next();
                self.mark = LowWaterMark::starting_at(Some(checkpoint.position));
                self.last_persisted = Some(checkpoint.position);
                info!(subscription = %self.key, position = checkpoint.position.0, "resuming from checkpoint");
            }
            Ok(None) => {
                info!(subscription = %self.key, start_from = self.config.start_from, "starting without checkpoint");
            }
            Err(e) => {
                let policy = &self.ctx.engine.checkpoint_retry;
                let attempt = self.checkpoint_backoff.record_failure(policy, now);
                warn!(subscription = %self.key, attempt, error = %e, "checkpoint load failed");
                return;
            }
        }

        self.checkpoint_backoff.reset();
        self.last_persist_at = now;
        self.state = InstanceState::CatchingUp;
        self.fill(now);
    }

    // --- Accessors ---

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable
    }

    pub fn is_stopped(&self) -> bool {
        self.state == InstanceState::Stopped
    }

    pub fn buffers(&self) -> &BufferPipeline {
        &self.buffers
    }

    pub fn pool(&self) -> &ConsumerPool {
        &self.pool
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding(&self, id: &Uuid) -> Option<(ConnectionId, u32)> {
        self.outstanding_messages()
            .find(|m| m.event.event_id() == *id)
            .map(|m| (m.connection, m.retry_count))
    }

    fn outstanding_messages(&self) -> impl Iterator<Item = &OutstandingMessage> {
        self.outstanding.iter()
    }

    pub fn parked_count(&self) -> u64 {
        self.parked_count
    }

    /// Highest position every event at or below which is resolved.
    pub fn confirmed_position(&self) -> Option<Position> {
        self.mark.confirmed()
    }

    pub fn last_known_position(&self) -> Option<Position> {
        self.last_known.max(self.mark.highest_read())
    }

    pub fn last_checkpointed_position(&self) -> Option<Position> {
        self.last_persisted
    }

    pub fn throughput(&self) -> &ThroughputMeter {
        &self.processed
    }

    fn accepts_dispatch(&self) -> bool {
        matches!(self.state, InstanceState::CatchingUp | InstanceState::Live)
    }

    // --- Configuration ---

    /// Swap the configuration. Outstanding messages keep their delivery state.
    pub fn update_config(&mut self, config: SubscriptionConfig, now: Instant) {
        self.buffers
            .resize(config.buffer_size, config.live_buffer_size);
        self.pool.set_round_robin(config.prefer_round_robin);
        self.config = config;
        info!(subscription = %self.key, "configuration updated");
        self.dispatch(now);
    }

    // --- Consumers ---

    pub fn attach(&mut self, request: ConnectionRequest, now: Instant) -> ConsumerHandle {
        let handle = self.pool.attach(request, now);
        info!(subscription = %self.key, connection = %handle.id, "connection attached");
        self.dispatch(now);
        handle
    }

    /// Detach a connection; its outstanding messages go back for redelivery
    /// keeping their retry count and delivery time.
    pub fn detach(&mut self, connection: ConnectionId, now: Instant) -> usize {
        if !self.pool.detach(connection) {
            return 0;
        }
        let returned = self.outstanding.take_for_connection(connection);
        let count = returned.len();
        for message in returned {
            self.buffers.push_retry(message.into_buffered());
        }
        info!(subscription = %self.key, connection = %connection, returned = count, "connection detached");
        self.dispatch(now);
        count
    }

    // --- Log input ---

    /// Read from the log while catching up and there is room. After a failed
    /// read nothing is attempted until the backoff delay has passed.
    fn fill(&mut self, now: Instant) {
        if self.state != InstanceState::CatchingUp || !self.read_backoff.ready(now) {
            return;
        }

        while self.buffers.read_room() > 0 {
            let batch = self.config.read_batch_size.min(self.buffers.read_room());
            let events = match self.ctx.reader.read_batch(
                &self.key.stream_id,
                self.next_read,
                batch,
                self.config.resolve_link_tos,
            ) {
                Ok(events) => events,
                Err(e) => {
                    let policy = self.ctx.reader.retry_policy();
                    let attempt = self.read_backoff.record_failure(policy, now);
                    if self.read_backoff.exhausted(policy) {
                        if !self.unavailable {
                            error!(subscription = %self.key, attempt, error = %e, "log unavailable");
                        }
                        self.unavailable = true;
                    } else {
                        warn!(subscription = %self.key, attempt, error = %e, "log read failed");
                    }
                    return;
                }
            };
            if self.read_backoff.reset() > 0 {
                info!(subscription = %self.key, "log reads recovered");
            }
            self.unavailable = false;

            if events.is_empty() {
                if self.buffers.read_len() == 0 {
                    self.state = InstanceState::Live;
                    info!(subscription = %self.key, next = self.next_read.0, "caught up, now live");
                }
                return;
            }

            let got = events.len();
            for event in events {
                let position = event.position();
                if position < self.next_read {
                    continue;
                }
                self.mark.track(position);
                self.next_read = position.next();
                self.note_known(position);
                self.buffers.push_read(event);
            }

            if got < batch {
                return;
            }
        }
    }

    fn note_known(&mut self, position: Position) {
        if self.last_known.map_or(true, |k| position > k) {
            self.last_known = Some(position);
        }
    }

    /// Offer an event just appended to the subscribed stream.
    pub fn on_appended(&mut self, event: ResolvedEvent, now: Instant) {
        let position = event.position();
        self.note_known(position);

        if self.state != InstanceState::Live {
            return;
        }
        if position < self.next_read {
            return;
        }
        if position > self.next_read {
            debug!(subscription = %self.key, expected = self.next_read.0, got = position.0, "gap in live events");
            self.fall_back();
            self.dispatch(now);
            return;
        }

        match self.buffers.push_live(event) {
            Ok(()) => {
                self.mark.track(position);
                self.next_read = position.next();
            }
            Err(LiveOverflow(_)) => {
                warn!(subscription = %self.key, position = position.0, "live buffer full");
                self.fall_back();
            }
        }
        self.dispatch(now);
    }

    fn fall_back(&mut self) {
        self.state = InstanceState::CatchingUp;
        info!(subscription = %self.key, from = self.next_read.0, "falling back to catch-up");
    }

    // --- Dispatch ---

    /// Hand buffered events to connections with free slots.
    pub fn dispatch(&mut self, now: Instant) {
        if !self.accepts_dispatch() {
            return;
        }

        while self.pool.available_slot_count() > 0 {
            if self.buffers.is_empty() {
                self.fill(now);
            }
            let Some((source, entry)) = self.buffers.pop_next() else {
                break;
            };
            if self.state == InstanceState::CatchingUp && self.buffers.read_len() == 0 {
                self.fill(now);
            }
            let Some(connection) = self.pool.select() else {
                self.buffers.push_retry(entry);
                break;
            };
            self.send(connection, source, entry, now);
        }
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        source: BufferSource,
        entry: BufferedEvent,
        now: Instant,
    ) {
        let event_id = entry.event.event_id();
        if self.outstanding.contains(&event_id) {
            // Same event already in flight: this copy is a duplicate.
            debug!(subscription = %self.key, event = %event_id, "duplicate event skipped");
            if entry.tracked {
                self.resolve_position(entry.event.position(), now);
            }
            return;
        }

        let message =
            OutstandingMessage::from_buffered(entry, connection, now, self.config.message_timeout());
        let delivery = Delivery {
            event: message.event.clone(),
            retry_count: message.retry_count,
        };
        debug!(
            subscription = %self.key,
            connection = %connection,
            position = message.event.position().0,
            retry_count = message.retry_count,
            ?source,
            "dispatch"
        );
        self.outstanding.insert(message);

        if self.pool.deliver(connection, delivery).is_err() {
            warn!(subscription = %self.key, connection = %connection, "connection unreachable, detaching");
            self.detach(connection, now);
        }
    }

    /// Pull up to `count` events for a caller without an attached connection.
    pub fn read_next(&mut self, count: usize, now: Instant) -> Vec<ResolvedEvent> {
        if !self.accepts_dispatch() {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(count);
        while events.len() < count {
            if self.buffers.is_empty() {
                self.fill(now);
            }
            let Some((_, entry)) = self.buffers.pop_next() else {
                break;
            };
            if self.outstanding.contains(&entry.event.event_id()) {
                if entry.tracked {
                    self.resolve_position(entry.event.position(), now);
                }
                continue;
            }
            let message = OutstandingMessage::from_buffered(
                entry,
                PULL_CONNECTION,
                now,
                self.config.message_timeout(),
            );
            events.push(message.event.clone());
            self.outstanding.insert(message);
        }
        events
    }

    // --- Acknowledgement ---

    /// Acknowledge messages by event id. Unknown ids are ignored.
    pub fn ack(&mut self, ids: &[Uuid], now: Instant) -> usize {
        let mut resolved = 0;
        for id in ids {
            let Some(message) = self.outstanding.remove(id) else {
                continue;
            };
            resolved += 1;
            self.pool.release(message.connection, true);
            self.processed.record(1);
            if self.config.extra_statistics {
                let latency = now.saturating_duration_since(message.delivered_at);
                let ms = latency.as_millis() as i64;
                self.pool.observe(message.connection, "lastAckLatencyMs", ms);
                self.pool.observe_max(message.connection, "maxAckLatencyMs", ms);
            }
            if message.tracked {
                self.resolve_position(message.event.position(), now);
            }
        }
        self.dispatch(now);
        resolved
    }

    /// Negatively acknowledge messages by event id.
    pub fn nack(&mut self, ids: &[Uuid], action: NackAction, now: Instant) -> usize {
        let mut resolved = 0;
        for id in ids {
            let Some(message) = self.outstanding.remove(id) else {
                continue;
            };
            resolved += 1;
            self.pool.release(message.connection, false);
            match action {
                NackAction::Retry => self.fail(message, now),
                NackAction::Park => {
                    let count = message.retry_count;
                    self.park(message, count, now);
                }
                NackAction::Skip => {
                    if message.tracked {
                        self.resolve_position(message.event.position(), now);
                    }
                }
            }
        }
        self.dispatch(now);
        resolved
    }

    fn fail(&mut self, message: OutstandingMessage, now: Instant) {
        if self.state == InstanceState::Draining {
            return;
        }
        let policy = RetryAndParkingPolicy::new(self.config.max_retry_count);
        match policy.decide(message.retry_count) {
            RetryDecision::Retry(next) => {
                debug!(
                    subscription = %self.key,
                    position = message.event.position().0,
                    retry_count = next,
                    "retrying"
                );
                self.buffers.push_retry(message.into_retry(next));
            }
            RetryDecision::Park(next) => self.park(message, next, now),
        }
    }

    fn park(&mut self, message: OutstandingMessage, retry_count: u32, now: Instant) {
        if self.state == InstanceState::Draining {
            debug!(subscription = %self.key, event = %message.event.event_id(), "draining, message dropped");
            return;
        }
        match self.ctx.reader.park(&self.key, &message.event) {
            Ok(_) => {
                self.parked_count += 1;
                warn!(
                    subscription = %self.key,
                    event = %message.event.event_id(),
                    position = message.event.position().0,
                    retry_count,
                    "message parked"
                );
                if message.tracked {
                    self.resolve_position(message.event.position(), now);
                }
            }
            Err(e) => {
                error!(subscription = %self.key, error = %e, "parking failed, keeping message for retry");
                self.buffers.push_retry(message.into_retry(retry_count));
            }
        }
    }

    /// Re-enqueue every parked message not replayed yet, at its original
    /// position and with a fresh retry count.
    pub fn replay_parked(&mut self, now: Instant) -> Result<usize> {
        if self.state == InstanceState::Initializing {
            return Err(SubscriptionError::Unavailable(self.key.clone()));
        }
        let mut replayed = 0;
        loop {
            let batch = self.ctx.reader.read_parked(
                &self.key,
                self.parked_replay_from,
                self.config.read_batch_size,
            )?;
            if batch.is_empty() {
                break;
            }
            for parked in batch {
                self.parked_replay_from = parked.position().next();
                match LogReader::unpark(&parked) {
                    Ok(event) => {
                        self.buffers.push_retry(BufferedEvent::replayed(event));
                        replayed += 1;
                    }
                    Err(e) => {
                        error!(subscription = %self.key, parked_at = parked.position().0, error = %e, "skipping parked entry");
                    }
                }
            }
        }
        info!(subscription = %self.key, replayed, "parked messages replayed");
        self.dispatch(now);
        Ok(replayed)
    }

    // --- Checkpointing ---

    fn resolve_position(&mut self, position: Position, now: Instant) {
        self.mark.resolve(position);
        self.confirmations_since_persist += 1;
        self.maybe_checkpoint(now);
    }

    fn maybe_checkpoint(&mut self, now: Instant) {
        if !self.accepts_dispatch() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_persist_at);
        let Some(reason) = self
            .config
            .checkpoint_policy()
            .decide(self.confirmations_since_persist, elapsed)
        else {
            return;
        };
        let Some(position) = self.mark.confirmed() else {
            return;
        };
        if self.last_persisted.map_or(false, |p| position <= p) {
            return;
        }

        if !self.checkpoint_backoff.ready(now) {
            return;
        }

        let result = self
            .ctx
            .checkpoints
            .persist(&self.key, Checkpoint::at(position));
        self.last_persist_at = now;

        match result {
            Ok(()) => {
                debug!(subscription = %self.key, position = position.0, ?reason, "checkpointed");
                self.checkpoint_backoff.reset();
                self.last_persisted = Some(position);
                self.confirmations_since_persist = 0;
            }
            Err(e) => {
                let policy = &self.ctx.engine.checkpoint_retry;
                let attempt = self.checkpoint_backoff.record_failure(policy, now);
                if attempt == policy.attempts.max(1) {
                    warn!(
                        subscription = %self.key,
                        position = position.0,
                        error = %e,
                        "checkpoint not durable, a restart will redeliver from the last checkpoint"
                    );
                } else {
                    warn!(subscription = %self.key, attempt, error = %e, "checkpoint persist failed");
                }
            }
        }
    }

    // --- Timers ---

    /// Periodic work: retry initialization, expire deliveries, refill,
    /// dispatch, checkpoint and advance draining.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            InstanceState::Stopped => return,
            InstanceState::Initializing => {
                self.initialize(now);
                if self.state == InstanceState::Initializing {
                    return;
                }
            }
            _ => {}
        }

        let window = self.ctx.engine.measurement_window;
        self.pool.roll_measurements(now, window);
        self.processed.roll(now, window);

        self.expire(now);

        if self.state == InstanceState::Draining {
            self.advance_drain(now);
            return;
        }

        self.fill(now);
        self.dispatch(now);
        self.maybe_checkpoint(now);
    }

    fn expire(&mut self, now: Instant) {
        for message in self.outstanding.take_expired(now) {
            debug!(
                subscription = %self.key,
                connection = %message.connection,
                position = message.event.position().0,
                "delivery timed out"
            );
            self.pool.release(message.connection, false);
            self.fail(message, now);
        }
    }

    // --- Shutdown ---

    /// Stop admitting dispatch and start draining outstanding messages.
    pub fn begin_drain(&mut self, now: Instant) {
        if matches!(self.state, InstanceState::Draining | InstanceState::Stopped) {
            return;
        }
        self.state = InstanceState::Draining;
        let released = self.buffers.clear();
        let grace = self.ctx.engine.drain_grace(self.config.message_timeout());
        self.drain_deadline = Some(now + grace);
        info!(
            subscription = %self.key,
            outstanding = self.outstanding.len(),
            released,
            grace_ms = grace.as_millis() as u64,
            "draining"
        );
        self.advance_drain(now);
    }

    fn advance_drain(&mut self, now: Instant) {
        let expired = self.drain_deadline.map_or(true, |d| now >= d);
        if !self.outstanding.is_empty() && !expired {
            return;
        }
        let discarded = self.outstanding.drain().len();
        if discarded > 0 {
            warn!(subscription = %self.key, discarded, "drain grace elapsed, discarding outstanding messages");
        }
        self.stop();
    }

    /// Stop immediately, dropping connections and buffers.
    pub fn stop(&mut self) {
        if self.state == InstanceState::Stopped {
            return;
        }
        self.buffers.clear();
        self.outstanding.drain();
        let connections = self.pool.clear();
        self.state = InstanceState::Stopped;
        info!(subscription = %self.key, connections, "stopped");
    }
}
