//! Core types for the subscription engine.

use crate::error::{Result, SubscriptionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Position of an event within its stream (zero-based).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position(pub u64);

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Position {
    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Position(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch (UTC).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// An event as read back from the log.
///
/// Immutable once constructed. `data` and `metadata` are never absent, an
/// event without them carries empty buffers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    event_id: Uuid,
    event_type: String,
    is_json: bool,
    data: Vec<u8>,
    metadata: Vec<u8>,
    timestamp: Timestamp,
    position: Position,
}

impl ResolvedEvent {
    /// Build an event, rejecting a nil id or an empty type.
    pub fn new(
        event_id: Uuid,
        event_type: impl Into<String>,
        is_json: bool,
        data: Option<Vec<u8>>,
        metadata: Option<Vec<u8>>,
        timestamp: Timestamp,
        position: Position,
    ) -> Result<Self> {
        if event_id.is_nil() {
            return Err(SubscriptionError::InvalidArgument(
                "Empty eventId provided".into(),
            ));
        }
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(SubscriptionError::InvalidArgument(
                "Empty eventType provided".into(),
            ));
        }

        Ok(Self {
            event_id,
            event_type,
            is_json,
            data: data.unwrap_or_default(),
            metadata: metadata.unwrap_or_default(),
            timestamp,
            position,
        })
    }

    /// Build an event stamped with the current time.
    pub fn sample(
        event_id: Uuid,
        event_type: impl Into<String>,
        is_json: bool,
        data: Option<Vec<u8>>,
        metadata: Option<Vec<u8>>,
        position: Position,
    ) -> Result<Self> {
        Self::new(
            event_id,
            event_type,
            is_json,
            data,
            metadata,
            Timestamp::now(),
            position,
        )
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_json(&self) -> bool {
        self.is_json
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// The appendable form of this event, keeping id, type and content.
    pub fn to_event_data(&self) -> EventData {
        EventData {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            is_json: self.is_json,
            data: self.data.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Input for appending a new event (before position and timestamp are assigned).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl EventData {
    /// Create event data with a JSON payload.
    pub fn json(
        event_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: serde_json::to_vec(payload)?,
            metadata: Vec::new(),
        })
    }

    /// Create event data with raw bytes.
    pub fn raw(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: false,
            data,
            metadata: Vec::new(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Resolve into a stored event at the given position.
    pub fn into_resolved(self, position: Position, timestamp: Timestamp) -> Result<ResolvedEvent> {
        ResolvedEvent::new(
            self.event_id,
            self.event_type,
            self.is_json,
            Some(self.data),
            Some(self.metadata),
            timestamp,
            position,
        )
    }
}

/// Identity of a persistent subscription: one group on one stream.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub stream_id: String,
    pub group_name: String,
}

impl SubscriptionKey {
    pub fn new(stream_id: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            group_name: group_name.into(),
        }
    }

    /// Resource location handed back to management callers.
    pub fn location(&self) -> String {
        format!("/subscriptions/{}/{}", self.stream_id, self.group_name)
    }

    /// Name of the dead-letter stream holding parked messages.
    pub fn parked_stream(&self) -> String {
        format!(
            "$persistentsubscription-{}::{}-parked",
            self.stream_id, self.group_name
        )
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}::{})", self.stream_id, self.group_name)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.stream_id, self.group_name)
    }
}

/// Identifier of an attached consumer connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
