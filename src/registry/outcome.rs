//! Typed results of management commands.
//!
//! Expected failures (missing key, duplicate, denied) are outcomes rather
//! than errors so callers match on them exhaustively.

use crate::stats::SubscriptionStats;
use crate::types::ResolvedEvent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Success { location: String },
    AlreadyExists,
    AccessDenied,
    InvalidArgument(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success { location: String },
    DoesNotExist,
    AccessDenied,
    InvalidArgument(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Success,
    DoesNotExist,
    AccessDenied,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    Success { replayed: usize },
    DoesNotExist,
    AccessDenied,
    /// The parked stream could not be read.
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadNextOutcome {
    Success(Vec<ResolvedEvent>),
    DoesNotExist,
    AccessDenied,
    InvalidArgument(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// `resolved` counts ids that matched an outstanding message.
    Success { resolved: usize },
    DoesNotExist,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatsOutcome {
    Success(Vec<SubscriptionStats>),
    NotFound,
    /// The subscription has not finished initializing.
    NotReady,
    AccessDenied,
}

impl StatsOutcome {
    /// The snapshots, if the request succeeded.
    pub fn into_stats(self) -> Option<Vec<SubscriptionStats>> {
        match self {
            StatsOutcome::Success(stats) => Some(stats),
            _ => None,
        }
    }
}

impl ReadNextOutcome {
    pub fn into_events(self) -> Option<Vec<ResolvedEvent>> {
        match self {
            ReadNextOutcome::Success(events) => Some(events),
            _ => None,
        }
    }
}
