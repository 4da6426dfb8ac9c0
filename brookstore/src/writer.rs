//! Crash-safe appends.
//!
//! [`BrookWriter`] runs the two-phase append sequence: write a pending
//! cursor, write the events, commit the cursor, drop the pending cursor.
//! Appends to one stream are serialized through [`StreamLocks`]; reads
//! never take a lock.
//!
//! Before every append the writer reconciles any pending cursor left by an
//! interrupted append (see [`plan_recovery`]). A partially landed
//! best-effort append blocks new appends until it is resumed with the same
//! batch via [`BrookWriter::resume_best_effort`].

use crate::cursor::{plan_recovery, PendingCursor, RecoveryPlan};
use crate::document::DocumentStore;
use crate::errors::{BrookError, BrookResult};
use crate::event::BrookEvent;
use crate::repository::BrookRepository;
use crate::types::{Position, StreamKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

/// Registry of per-stream async locks.
#[derive(Debug, Clone, Default)]
pub struct StreamLocks {
    locks: Arc<Mutex<HashMap<StreamKey, Arc<AsyncMutex<()>>>>>,
}

impl StreamLocks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &StreamKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of streams with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no stream holds a lock entry.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Optimistic expectation about the committed cursor before an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedCursor {
    /// Append wherever the stream currently ends.
    #[default]
    Any,
    /// The stream must have no events.
    Empty,
    /// The committed cursor must be exactly this position.
    At(Position),
}

impl ExpectedCursor {
    fn check(self, stream: &StreamKey, actual: Option<Position>) -> BrookResult<()> {
        let expected = match self {
            Self::Any => return Ok(()),
            Self::Empty => None,
            Self::At(position) => Some(position),
        };

        if expected == actual {
            Ok(())
        } else {
            Err(BrookError::CursorConflict {
                stream: stream.clone(),
                expected,
                actual,
            })
        }
    }
}

/// Positions assigned to an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Position of the first appended event.
    pub first: Position,
    /// Position of the last appended event; the committed cursor.
    pub last: Position,
}

/// What recovery did with a stream's pending cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No append was in flight.
    NothingPending,
    /// The cursor had already been committed; the stale marker was removed.
    ClearedStale,
    /// Every intended event had landed; the cursor was committed.
    Finalized {
        /// The committed cursor.
        cursor: Position,
    },
    /// No intended event had landed; the marker was removed.
    RolledBack,
    /// Some events landed; the marker stays until the batch is resumed.
    AwaitingRetry {
        /// The marker left in place.
        pending: PendingCursor,
        /// Positions already durable.
        landed: Vec<Position>,
        /// Positions still missing.
        missing: Vec<Position>,
    },
}

/// Owns the append and recovery sequence of brooks.
pub struct BrookWriter<S: ?Sized> {
    repository: BrookRepository<S>,
    locks: StreamLocks,
}

impl<S: ?Sized> Clone for BrookWriter<S> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S> BrookWriter<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    /// Creates a writer with its own lock registry.
    pub fn new(repository: BrookRepository<S>) -> Self {
        Self::with_locks(repository, StreamLocks::new())
    }

    /// Creates a writer sharing `locks` with other writers.
    pub const fn with_locks(repository: BrookRepository<S>, locks: StreamLocks) -> Self {
        Self { repository, locks }
    }

    /// The repository used for storage.
    pub const fn repository(&self) -> &BrookRepository<S> {
        &self.repository
    }

    /// Appends `events` atomically through a transactional batch.
    #[instrument(
        name = "writer.append",
        skip(self, events),
        fields(stream = %key, count = events.len())
    )]
    pub async fn append(
        &self,
        key: &StreamKey,
        events: &[BrookEvent],
        expected: ExpectedCursor,
    ) -> BrookResult<AppendOutcome> {
        let _guard = self.locks.acquire(key).await;
        let pending = self.begin_append(key, events, expected).await?;

        let batch = self
            .repository
            .execute_transactional_batch(key, events, pending.original, pending.target)
            .await;
        let result = match batch {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    stream = %key,
                    target = %pending.target,
                    error = %error,
                    "[writer.append] transactional batch failed, pending cursor left for recovery"
                );
                return Err(error);
            }
        };

        if let Err(error) = self.repository.delete_pending_cursor(key).await {
            warn!(
                stream = %key,
                error = %error,
                "[writer.append] failed to delete pending cursor after commit"
            );
        }

        Ok(AppendOutcome {
            first: result.first,
            last: result.last,
        })
    }

    /// Appends `events` as individual documents, then commits the cursor.
    ///
    /// Not atomic. If interrupted, recovery finalizes the append when every
    /// event landed; otherwise it must be completed with
    /// [`resume_best_effort`](Self::resume_best_effort).
    #[instrument(
        name = "writer.append_best_effort",
        skip(self, events),
        fields(stream = %key, count = events.len())
    )]
    pub async fn append_best_effort(
        &self,
        key: &StreamKey,
        events: &[BrookEvent],
        expected: ExpectedCursor,
    ) -> BrookResult<AppendOutcome> {
        let _guard = self.locks.acquire(key).await;
        let pending = self.begin_append(key, events, expected).await?;

        self.repository
            .append_event_batch(key, pending.first_intended(), events)
            .await?;
        self.repository.commit_cursor(key, pending.target).await?;

        Ok(AppendOutcome {
            first: pending.first_intended(),
            last: pending.target,
        })
    }

    /// Completes a partially landed best-effort append with the same batch.
    #[instrument(
        name = "writer.resume_best_effort",
        skip(self, events),
        fields(stream = %key, count = events.len())
    )]
    pub async fn resume_best_effort(
        &self,
        key: &StreamKey,
        events: &[BrookEvent],
    ) -> BrookResult<AppendOutcome> {
        let _guard = self.locks.acquire(key).await;
        let Some(pending) = self.repository.get_pending_cursor(key).await? else {
            return Err(BrookError::InvalidBatch(format!(
                "stream '{key}' has no unfinished append to resume"
            )));
        };

        if u64::try_from(events.len()).ok() != Some(pending.event_count()) {
            return Err(BrookError::InvalidBatch(format!(
                "unfinished append expects {} event(s), got {}",
                pending.event_count(),
                events.len()
            )));
        }

        let outcome = AppendOutcome {
            first: pending.first_intended(),
            last: pending.target,
        };
        let committed = self.repository.get_cursor(key).await?;
        if committed.is_some_and(|cursor| cursor >= pending.target) {
            self.repository.delete_pending_cursor(key).await?;
            return Ok(outcome);
        }
        if committed != pending.original {
            return Err(BrookError::CursorConflict {
                stream: key.clone(),
                expected: pending.original,
                actual: committed,
            });
        }

        self.repository
            .append_event_batch(key, outcome.first, events)
            .await?;
        self.repository.commit_cursor(key, pending.target).await?;

        info!(
            stream = %key,
            first = %outcome.first,
            last = %outcome.last,
            "[writer.resume_best_effort] unfinished append completed"
        );
        Ok(outcome)
    }

    /// Reconciles a pending cursor left by an interrupted append.
    #[instrument(name = "writer.recover", skip(self), fields(stream = %key))]
    pub async fn recover(&self, key: &StreamKey) -> BrookResult<RecoveryOutcome> {
        let _guard = self.locks.acquire(key).await;
        self.recover_locked(key).await
    }

    async fn begin_append(
        &self,
        key: &StreamKey,
        events: &[BrookEvent],
        expected: ExpectedCursor,
    ) -> BrookResult<PendingCursor> {
        let count = u64::try_from(events.len()).unwrap_or(u64::MAX);
        if count == 0 {
            return Err(BrookError::InvalidBatch("no events to append".to_string()));
        }

        if let RecoveryOutcome::AwaitingRetry { pending, .. } = self.recover_locked(key).await? {
            return Err(BrookError::PendingAppend {
                stream: key.clone(),
                pending,
            });
        }

        let cursor = self.repository.get_cursor(key).await?;
        expected.check(key, cursor)?;

        let pending = PendingCursor::new(cursor, Position::after(cursor).offset(count - 1));
        self.repository.create_pending_cursor(key, pending).await?;
        Ok(pending)
    }

    async fn recover_locked(&self, key: &StreamKey) -> BrookResult<RecoveryOutcome> {
        let Some(pending) = self.repository.get_pending_cursor(key).await? else {
            return Ok(RecoveryOutcome::NothingPending);
        };

        let committed = self.repository.get_cursor(key).await?;
        let existing = self
            .repository
            .get_existing_positions(key, pending.first_intended(), pending.target)
            .await?;

        let outcome = match plan_recovery(committed, &pending, &existing) {
            RecoveryPlan::ClearStale => {
                self.repository.delete_pending_cursor(key).await?;
                RecoveryOutcome::ClearedStale
            }
            RecoveryPlan::Finalize { target } => {
                self.repository.commit_cursor(key, target).await?;
                RecoveryOutcome::Finalized { cursor: target }
            }
            RecoveryPlan::RollBack => {
                self.repository.delete_pending_cursor(key).await?;
                RecoveryOutcome::RolledBack
            }
            RecoveryPlan::AwaitRetry { landed, missing } => RecoveryOutcome::AwaitingRetry {
                pending,
                landed,
                missing,
            },
        };

        info!(
            stream = %key,
            committed = ?committed,
            target = %pending.target,
            outcome = ?outcome,
            "[writer.recover] pending cursor reconciled"
        );
        Ok(outcome)
    }
}
