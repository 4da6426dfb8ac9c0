//! Cursor state and pending-cursor recovery planning.
//!
//! A stream's cursor is the highest durably committed position. Before an
//! append starts, a pending cursor records the pre-append ("original") and
//! post-append ("target") positions. If the append is interrupted, recovery
//! compares the pending marker against the positions that actually landed
//! and decides how to proceed. That decision is a pure function
//! ([`plan_recovery`]) so it can be tested without any storage.

use crate::types::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Marker written before an append begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCursor {
    /// Committed cursor at the time the append began.
    pub original: Option<Position>,
    /// Cursor the append will commit once every event landed.
    pub target: Position,
}

impl PendingCursor {
    /// Creates a pending marker.
    pub const fn new(original: Option<Position>, target: Position) -> Self {
        Self { original, target }
    }

    /// First position the append writes.
    pub fn first_intended(&self) -> Position {
        Position::after(self.original)
    }

    /// Every position the append writes, in order.
    pub fn intended_positions(&self) -> impl Iterator<Item = Position> {
        let first = self.first_intended().into_inner();
        let last = self.target.into_inner();
        (first..=last).map(Position::new)
    }

    /// Number of events the append writes.
    pub fn event_count(&self) -> u64 {
        self.target
            .into_inner()
            .checked_sub(self.first_intended().into_inner())
            .map_or(0, |span| span + 1)
    }
}

/// The combined cursor state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No events and no append in flight.
    Empty,
    /// Events up to the position are committed; no append in flight.
    Committed(Position),
    /// An append started and its outcome is not confirmed yet.
    Pending {
        /// Committed cursor as currently stored.
        committed: Option<Position>,
        /// The marker left by the in-flight append.
        pending: PendingCursor,
    },
}

impl CursorState {
    /// Combines the two independently stored documents into one state.
    pub const fn from_parts(committed: Option<Position>, pending: Option<PendingCursor>) -> Self {
        match (committed, pending) {
            (committed, Some(pending)) => Self::Pending { committed, pending },
            (Some(position), None) => Self::Committed(position),
            (None, None) => Self::Empty,
        }
    }

    /// The committed cursor, regardless of any pending append.
    pub const fn committed(&self) -> Option<Position> {
        match self {
            Self::Empty => None,
            Self::Committed(position) => Some(*position),
            Self::Pending { committed, .. } => *committed,
        }
    }
}

/// What recovery should do with a pending cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// The committed cursor already reached the target; only the marker remains.
    ClearStale,
    /// Every intended event landed; commit the cursor to `target`.
    Finalize {
        /// Cursor to commit.
        target: Position,
    },
    /// None of the intended events landed; drop the marker.
    RollBack,
    /// Some events landed; keep the marker until the same batch is resumed.
    AwaitRetry {
        /// Positions already durable.
        landed: Vec<Position>,
        /// Positions still missing.
        missing: Vec<Position>,
    },
}

/// Decides how to reconcile a pending cursor.
///
/// `existing` holds the durable positions found within the pending
/// marker's intended range.
pub fn plan_recovery(
    committed: Option<Position>,
    pending: &PendingCursor,
    existing: &BTreeSet<Position>,
) -> RecoveryPlan {
    if pending.event_count() == 0 || committed.is_some_and(|cursor| cursor >= pending.target) {
        return RecoveryPlan::ClearStale;
    }

    let (landed, missing): (Vec<Position>, Vec<Position>) = pending
        .intended_positions()
        .partition(|position| existing.contains(position));

    if missing.is_empty() {
        RecoveryPlan::Finalize {
            target: pending.target,
        }
    } else if landed.is_empty() {
        RecoveryPlan::RollBack
    } else {
        RecoveryPlan::AwaitRetry { landed, missing }
    }
}
