//! Batch access to the event log and the parked streams.

use super::EventLog;
use crate::config::RetryPolicy;
use crate::error::{Result, SubscriptionError};
use crate::types::{EventData, Position, ResolvedEvent, SubscriptionKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Metadata stored with a parked message so replay restores the original.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParkedEnvelope {
    original_position: Position,
    original_timestamp: Timestamp,
    original_metadata: Vec<u8>,
}

/// Batch reader and parked-stream writer shared by all subscriptions.
///
/// Every call makes a single attempt. Callers track failures against
/// [`LogReader::retry_policy`] and retry on a later tick.
#[derive(Clone)]
pub struct LogReader {
    log: Arc<dyn EventLog>,
    retry: RetryPolicy,
}

impl LogReader {
    pub fn new(log: Arc<dyn EventLog>, retry: RetryPolicy) -> Self {
        Self { log, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Read the next batch of a stream.
    pub fn read_batch(
        &self,
        stream_id: &str,
        from: Position,
        max_count: usize,
        resolve_links: bool,
    ) -> Result<Vec<ResolvedEvent>> {
        let events = self
            .log
            .read_forward(stream_id, from, max_count, resolve_links)?;
        debug!(stream = stream_id, from = from.0, count = events.len(), "read batch");
        Ok(events)
    }

    /// Append a message to the subscription's parked stream, remembering
    /// where it came from.
    pub fn park(&self, key: &SubscriptionKey, event: &ResolvedEvent) -> Result<Position> {
        let envelope = ParkedEnvelope {
            original_position: event.position(),
            original_timestamp: event.timestamp(),
            original_metadata: event.metadata().to_vec(),
        };
        let data = event
            .to_event_data()
            .with_metadata(serde_json::to_vec(&envelope)?);
        self.log.append(&key.parked_stream(), vec![data])
    }

    /// Read raw parked-stream entries starting at `from`.
    pub fn read_parked(
        &self,
        key: &SubscriptionKey,
        from: Position,
        max_count: usize,
    ) -> Result<Vec<ResolvedEvent>> {
        self.read_batch(&key.parked_stream(), from, max_count, false)
    }

    /// Rebuild the original event from a parked-stream entry.
    pub fn unpark(parked: &ResolvedEvent) -> Result<ResolvedEvent> {
        let envelope: ParkedEnvelope = serde_json::from_slice(parked.metadata()).map_err(|e| {
            SubscriptionError::Internal(format!(
                "parked message {} has no origin: {}",
                parked.event_id(),
                e
            ))
        })?;
        ResolvedEvent::new(
            parked.event_id(),
            parked.event_type(),
            parked.is_json(),
            Some(parked.data().to_vec()),
            Some(envelope.original_metadata),
            envelope.original_timestamp,
            envelope.original_position,
        )
    }

    /// Append events to an arbitrary stream.
    pub fn append(&self, stream_id: &str, events: Vec<EventData>) -> Result<Position> {
        self.log.append(stream_id, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;

    fn reader(log: Arc<InMemoryLog>) -> LogReader {
        LogReader::new(log, RetryPolicy::none())
    }

    #[test]
    fn test_read_makes_single_attempt() {
        let log = Arc::new(InMemoryLog::new());
        log.append("s", vec![EventData::raw("e", vec![1])]).unwrap();
        log.fail_next_reads(1);

        let r = reader(log);
        assert!(r.read_batch("s", Position(0), 10, false).is_err());
        assert_eq!(r.read_batch("s", Position(0), 10, false).unwrap().len(), 1);
    }

    #[test]
    fn test_park_writes_to_parked_stream() {
        let log = Arc::new(InMemoryLog::new());
        log.append("orders", vec![EventData::raw("placed", b"x".to_vec())]).unwrap();
        let event = log.read_forward("orders", Position(0), 1, false).unwrap().remove(0);

        let key = SubscriptionKey::new("orders", "billing");
        let r = reader(Arc::clone(&log));
        r.park(&key, &event).unwrap();

        let parked = r.read_parked(&key, Position(0), 10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].event_id(), event.event_id());
        assert_eq!(parked[0].data(), b"x");
    }

    #[test]
    fn test_unpark_restores_origin() {
        let log = Arc::new(InMemoryLog::new());
        let filler = (0..5).map(|_| EventData::raw("noise", vec![])).collect();
        log.append("orders", filler).unwrap();
        log.append(
            "orders",
            vec![EventData::raw("placed", b"body".to_vec()).with_metadata(b"meta".to_vec())],
        )
        .unwrap();
        let event = log.read_forward("orders", Position(5), 1, false).unwrap().remove(0);

        let key = SubscriptionKey::new("orders", "billing");
        let r = reader(Arc::clone(&log));
        r.park(&key, &event).unwrap();

        let parked = r.read_parked(&key, Position(0), 10).unwrap();
        assert_eq!(parked[0].position(), Position(0));
        let restored = LogReader::unpark(&parked[0]).unwrap();
        assert_eq!(restored, event);
        assert_eq!(restored.position(), Position(5));
        assert_eq!(restored.metadata(), b"meta");
    }

    #[test]
    fn test_unpark_rejects_foreign_entry() {
        let log = Arc::new(InMemoryLog::new());
        let key = SubscriptionKey::new("orders", "billing");
        log.append(&key.parked_stream(), vec![EventData::raw("stray", vec![])])
            .unwrap();
        let parked = reader(Arc::clone(&log))
            .read_parked(&key, Position(0), 10)
            .unwrap();

        assert!(matches!(
            LogReader::unpark(&parked[0]),
            Err(SubscriptionError::Internal(_))
        ));
    }
}
