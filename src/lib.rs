//! # Persistent Subscriptions
//!
//! Competing-consumer delivery groups over streams of an append-only event
//! log, with at-least-once delivery.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: a named group on a stream, identified by a
//!   [`SubscriptionKey`]
//! - **Connections**: consumers attached to a group, each with a number of
//!   in-flight slots
//! - **Retry and parking**: failed or timed out deliveries are redelivered,
//!   then moved to a parked stream after `max_retry_count` attempts
//! - **Checkpoints**: the confirmed position is persisted so a restart resumes
//!   without skipping anything
//!
//! ## Example
//!
//! ```ignore
//! use persub::*;
//!
//! let registry = SubscriptionRegistry::new(
//!     Arc::new(InMemoryLog::new()),
//!     Arc::new(FileCheckpointStore::open("./checkpoints")?),
//!     Arc::new(AllowAll),
//!     EngineConfig::default(),
//! );
//!
//! let key = SubscriptionKey::new("orders", "billing");
//! registry.create(key.clone(), SubscriptionConfig::default(), &principal);
//!
//! let consumer = registry.attach(&key, ConnectionRequest::new("svc", "10.0.0.7", 10), &principal)?;
//! let delivery = consumer.recv()?;
//! registry.ack(&key, &[delivery.event.event_id()]);
//! ```

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod log;
pub mod registry;
pub mod stats;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use auth::{Access, AllowAll, Authorizer, Operation, Principal, RoleAuthorizer};
pub use checkpoint::{
    Checkpoint, CheckpointPolicy, CheckpointReason, CheckpointStore, FileCheckpointStore,
    LowWaterMark, MemoryCheckpointStore,
};
pub use config::{Backoff, EngineConfig, RetryPolicy};
pub use error::{Result, SubscriptionError};
pub use log::{EventLog, InMemoryLog, LogReader};
pub use registry::{
    AckOutcome, CreateOutcome, DeleteOutcome, ReadNextOutcome, ReplayOutcome, StatsOutcome,
    SubscriptionRegistry, UpdateOutcome, MAX_READ_NEXT_COUNT,
};
pub use stats::{StatsCollector, StatsScope, SubscriptionStats, SubscriptionStatus};
pub use subscriptions::{
    ConnectionRequest, ConnectionStats, ConsumerHandle, Delivery, NackAction, SubscriptionConfig,
};
pub use types::*;
