//! Point-in-time statistics for subscriptions.

use crate::subscriptions::{ConnectionStats, InstanceState, SubscriptionConfig, SubscriptionInstance};
use crate::types::SubscriptionKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Reported status of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Initializing,
    CatchingUp,
    Live,
    Draining,
    Stopped,
    /// The log could not be read; retried on every tick.
    Unavailable,
}

/// Which subscriptions a stats request covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatsScope {
    All,
    Stream(String),
    Subscription(SubscriptionKey),
}

impl StatsScope {
    pub fn matches(&self, key: &SubscriptionKey) -> bool {
        match self {
            StatsScope::All => true,
            StatsScope::Stream(stream) => key.stream_id == *stream,
            StatsScope::Subscription(wanted) => wanted == key,
        }
    }

    /// Stream the authorizer is asked about.
    pub fn target(&self) -> Option<&str> {
        match self {
            StatsScope::All => None,
            StatsScope::Stream(stream) => Some(stream.as_str()),
            StatsScope::Subscription(key) => Some(key.stream_id.as_str()),
        }
    }
}

/// Immutable snapshot of one subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    pub event_stream_id: String,
    pub group_name: String,
    pub status: SubscriptionStatus,
    pub config: SubscriptionConfig,
    pub location: String,
    pub parked_message_stream: String,

    pub read_buffer_count: usize,
    pub live_buffer_count: usize,
    pub retry_buffer_count: usize,
    pub outstanding_messages_count: usize,
    pub parked_message_count: u64,

    pub last_processed_event_number: Option<u64>,
    pub last_known_event_number: Option<u64>,
    pub last_checkpointed_event_number: Option<u64>,

    pub average_items_per_second: f64,
    pub total_items_processed: u64,
    pub count_since_last_measurement: u64,

    pub connections: Vec<ConnectionStats>,
}

impl SubscriptionStats {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.event_stream_id.clone(), self.group_name.clone())
    }
}

/// Builds snapshots without mutating instance state.
pub struct StatsCollector;

impl StatsCollector {
    pub fn status(instance: &SubscriptionInstance) -> SubscriptionStatus {
        if instance.is_unavailable() {
            return SubscriptionStatus::Unavailable;
        }
        match instance.state() {
            InstanceState::Initializing => SubscriptionStatus::Initializing,
            InstanceState::CatchingUp => SubscriptionStatus::CatchingUp,
            InstanceState::Live => SubscriptionStatus::Live,
            InstanceState::Draining => SubscriptionStatus::Draining,
            InstanceState::Stopped => SubscriptionStatus::Stopped,
        }
    }

    pub fn snapshot(instance: &SubscriptionInstance) -> SubscriptionStats {
        let key = instance.key();
        let config = instance.config();
        let buffers = instance.buffers();
        let meter = instance.throughput();

        SubscriptionStats {
            event_stream_id: key.stream_id.clone(),
            group_name: key.group_name.clone(),
            status: Self::status(instance),
            config: config.clone(),
            location: key.location(),
            parked_message_stream: key.parked_stream(),
            read_buffer_count: buffers.read_len(),
            live_buffer_count: buffers.live_len(),
            retry_buffer_count: buffers.retry_len(),
            outstanding_messages_count: instance.outstanding_count(),
            parked_message_count: instance.parked_count(),
            last_processed_event_number: instance.confirmed_position().map(|p| p.0),
            last_known_event_number: instance.last_known_position().map(|p| p.0),
            last_checkpointed_event_number: instance.last_checkpointed_position().map(|p| p.0),
            average_items_per_second: meter.rate(),
            total_items_processed: meter.total(),
            count_since_last_measurement: meter.count_since_last(),
            connections: instance.pool().stats(config.extra_statistics),
        }
    }

    /// Lock briefly and copy.
    pub fn collect(instance: &Mutex<SubscriptionInstance>) -> SubscriptionStats {
        Self::snapshot(&instance.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::{EngineConfig, RetryPolicy};
    use crate::log::{EventLog, InMemoryLog, LogReader};
    use crate::subscriptions::{ConnectionRequest, InstanceContext};
    use crate::types::EventData;
    use std::sync::Arc;
    use std::time::Instant;

    fn instance(log: Arc<InMemoryLog>) -> SubscriptionInstance {
        let ctx = InstanceContext {
            reader: LogReader::new(log, RetryPolicy::none()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            engine: EngineConfig::manual(),
        };
        SubscriptionInstance::new(
            SubscriptionKey::new("orders", "billing"),
            SubscriptionConfig::default(),
            ctx,
            Instant::now(),
        )
    }

    #[test]
    fn test_snapshot_without_connections() {
        let log = Arc::new(InMemoryLog::new());
        log.append("orders", (0..3).map(|_| EventData::raw("e", vec![])).collect())
            .unwrap();
        let sub = instance(log);

        let stats = StatsCollector::snapshot(&sub);
        assert_eq!(stats.read_buffer_count, 3);
        assert!(stats.connections.is_empty());
        assert_eq!(stats.status, SubscriptionStatus::CatchingUp);
        assert_eq!(stats.location, "/subscriptions/orders/billing");
        assert_eq!(stats.last_known_event_number, Some(2));
    }

    #[test]
    fn test_snapshot_reports_connections() {
        let log = Arc::new(InMemoryLog::new());
        let mut sub = instance(log);
        sub.attach(ConnectionRequest::new("ops", "10.0.0.1", 7), Instant::now());

        let stats = StatsCollector::snapshot(&sub);
        assert_eq!(stats.status, SubscriptionStatus::Live);
        assert_eq!(stats.connections.len(), 1);
        assert_eq!(stats.connections[0].available_slots, 7);
    }

    #[test]
    fn test_unavailable_overrides_state() {
        let log = Arc::new(InMemoryLog::new());
        log.fail_next_reads(1);
        let sub = instance(log);
        assert_eq!(StatsCollector::status(&sub), SubscriptionStatus::Unavailable);
    }

    #[test]
    fn test_scope_matching() {
        let key = SubscriptionKey::new("orders", "billing");
        assert!(StatsScope::All.matches(&key));
        assert!(StatsScope::Stream("orders".into()).matches(&key));
        assert!(!StatsScope::Stream("Orders".into()).matches(&key));
        assert!(!StatsScope::Subscription(SubscriptionKey::new("orders", "x")).matches(&key));
    }
}
