//! Checkpointing of subscription progress.
//!
//! A checkpoint records the highest log position below which every event
//! has been acknowledged or parked. Restarting from it may redeliver events
//! that were acknowledged after the last persist, never skip one.

mod policy;
mod store;

pub use policy::{CheckpointPolicy, CheckpointReason, LowWaterMark};
pub use store::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
