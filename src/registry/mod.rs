//! Process-wide registry of persistent subscriptions.

mod manager;
mod outcome;

pub use manager::SubscriptionRegistry;
pub use outcome::{
    AckOutcome, CreateOutcome, DeleteOutcome, ReadNextOutcome, ReplayOutcome, StatsOutcome,
    UpdateOutcome,
};

/// Largest batch a single `read_next` may request.
pub const MAX_READ_NEXT_COUNT: usize = 100;
