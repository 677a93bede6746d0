//! Persistent subscriptions: competing consumers over a stream with
//! at-least-once delivery.
//!
//! Each (stream, group) pair is a [`SubscriptionInstance`]. Events flow from
//! the log into a three-stage buffer, get dispatched to attached connections
//! with free slots, and stay outstanding until acknowledged. Failed or timed
//! out deliveries are retried and eventually parked.
//!
//! ```text
//! log ──read──▶ read buffer ─┐
//! append ─────▶ live buffer ─┼─▶ dispatch ─▶ connection slots ─▶ ack / nack
//! nack/timeout ▶ retry buffer┘        ▲                              │
//!                                     └────────── retry / park ◀─────┘
//! ```

mod buffer;
mod config;
mod consumers;
mod instance;
mod retry;
mod worker;

pub use buffer::{BufferPipeline, BufferSource, BufferedEvent, LiveOverflow};
pub use config::SubscriptionConfig;
pub use consumers::{
    ConnectionRequest, ConnectionStats, ConsumerHandle, ConsumerPool, Delivery, ThroughputMeter,
    PULL_CONNECTION,
};
pub use instance::{InstanceContext, InstanceState, SubscriptionInstance};
pub use retry::{
    NackAction, OutstandingMessage, OutstandingMessages, RetryAndParkingPolicy, RetryDecision,
};
pub use worker::InstanceWorker;
