//! When to checkpoint, and what position is safe to checkpoint.

use crate::types::Position;
use std::collections::BTreeMap;
use std::time::Duration;

/// Why a checkpoint is due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointReason {
    /// The ceiling of unpersisted confirmations was reached.
    MaxCount,
    /// Enough confirmations accumulated.
    MinCount,
    /// The interval elapsed with at least one confirmation pending.
    Interval,
}

/// Checkpoint trigger thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub after: Duration,
    pub min_count: u64,
    pub max_count: u64,
}

impl CheckpointPolicy {
    /// Decide whether `confirmations` accumulated over `elapsed` warrant a persist.
    pub fn decide(&self, confirmations: u64, elapsed: Duration) -> Option<CheckpointReason> {
        if confirmations == 0 {
            return None;
        }
        if confirmations >= self.max_count {
            Some(CheckpointReason::MaxCount)
        } else if confirmations >= self.min_count {
            Some(CheckpointReason::MinCount)
        } else if elapsed >= self.after {
            Some(CheckpointReason::Interval)
        } else {
            None
        }
    }
}

/// Tracks which positions read from the log are still unresolved.
///
/// The confirmed position is the highest position such that every event at
/// or below it was acknowledged, parked or skipped. It never moves backwards.
#[derive(Clone, Debug, Default)]
pub struct LowWaterMark {
    pending: BTreeMap<Position, u32>,
    highest_read: Option<Position>,
    confirmed: Option<Position>,
}

impl LowWaterMark {
    /// Start with everything at or below `confirmed` already done.
    pub fn starting_at(confirmed: Option<Position>) -> Self {
        Self {
            pending: BTreeMap::new(),
            highest_read: confirmed,
            confirmed,
        }
    }

    /// Record a position read from the log.
    pub fn track(&mut self, position: Position) {
        *self.pending.entry(position).or_insert(0) += 1;
        if self.highest_read.map_or(true, |h| position > h) {
            self.highest_read = Some(position);
        }
    }

    /// Resolve a tracked position. Returns true if the confirmed position advanced.
    pub fn resolve(&mut self, position: Position) -> bool {
        match self.pending.get_mut(&position) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pending.remove(&position);
            }
            None => return false,
        }
        self.advance()
    }

    fn advance(&mut self) -> bool {
        let candidate = match self.pending.keys().next() {
            Some(lowest) => lowest.prev(),
            None => self.highest_read,
        };
        match candidate {
            Some(c) if self.confirmed.map_or(true, |cur| c > cur) => {
                self.confirmed = Some(c);
                true
            }
            _ => false,
        }
    }

    pub fn confirmed(&self) -> Option<Position> {
        self.confirmed
    }

    pub fn highest_read(&self) -> Option<Position> {
        self.highest_read
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|c| *c as usize).sum()
    }

    pub fn is_tracked(&self, position: Position) -> bool {
        self.pending.contains_key(&position)
    }
}
