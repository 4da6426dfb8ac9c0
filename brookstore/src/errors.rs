//! Error types for the brook storage engine.
//!
//! Two layers of errors exist:
//!
//! - [`StoreError`] is what a [`DocumentStore`](crate::document::DocumentStore)
//!   adapter reports. It is classified as transient (throttling, unavailable,
//!   timeouts) or not, which drives the retry policy.
//! - [`BrookError`] is what the engine reports to its callers. Its variants
//!   follow the failure taxonomy of the engine:
//!
//! | Category | Variants |
//! |---|---|
//! | transient, retries exhausted | `RetryExhausted` |
//! | fatal configuration | `BatchTooLarge`, `InvalidConfiguration` |
//! | caller / precondition | `InvalidRange`, `SliceRangeExceeded`, `InvalidBatch` |
//! | optimistic concurrency | `CursorConflict`, `PositionConflict` |
//! | recovery | `PendingAppend` |
//! | cancellation | `Cancelled` |
//! | everything else | `Store`, `Serialization`, `Deserialization` |
//!
//! Not-found is never an error: point reads return `Option` and deletes of
//! missing documents succeed.

use crate::cursor::PendingCursor;
use crate::types::{Position, StreamKey};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type BrookResult<T> = Result<T, BrookError>;

/// Identifies the engine operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Reading the committed cursor.
    ReadCursor,
    /// Reading the pending cursor.
    ReadPendingCursor,
    /// Writing the pending cursor.
    WritePendingCursor,
    /// Upserting the committed cursor.
    CommitCursor,
    /// Deleting the pending cursor.
    DeletePendingCursor,
    /// Point existence check of one event.
    ReadEvent,
    /// Paged query over events.
    QueryEvents,
    /// Non-transactional append of individual event documents.
    AppendEvents,
    /// Atomic batch of events plus cursor.
    ExecuteBatch,
    /// Reading one snapshot.
    ReadSnapshot,
    /// Writing one snapshot.
    WriteSnapshot,
    /// Deleting one snapshot.
    DeleteSnapshot,
    /// Enumerating snapshots of a stream.
    QuerySnapshots,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadCursor => "read_cursor",
            Self::ReadPendingCursor => "read_pending_cursor",
            Self::WritePendingCursor => "write_pending_cursor",
            Self::CommitCursor => "commit_cursor",
            Self::DeletePendingCursor => "delete_pending_cursor",
            Self::ReadEvent => "read_event",
            Self::QueryEvents => "query_events",
            Self::AppendEvents => "append_events",
            Self::ExecuteBatch => "execute_batch",
            Self::ReadSnapshot => "read_snapshot",
            Self::WriteSnapshot => "write_snapshot",
            Self::DeleteSnapshot => "delete_snapshot",
            Self::QuerySnapshots => "query_snapshots",
        };
        f.write_str(name)
    }
}

/// Failures reported by a document store adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store is rate limiting requests.
    #[error("request throttled (retry after {retry_after:?})")]
    Throttled {
        /// Server supplied hint for when to retry.
        retry_after: Option<Duration>,
    },

    /// The store is temporarily unable to serve requests.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// A document with the same id already exists.
    #[error("document '{id}' already exists")]
    Conflict {
        /// Id of the conflicting document.
        id: String,
    },

    /// An `if-match` precondition did not hold.
    #[error("precondition failed for document '{id}'")]
    PreconditionFailed {
        /// Id of the document whose etag did not match.
        id: String,
    },

    /// The request payload exceeds what the store accepts.
    #[error("request payload too large ({size_bytes} bytes)")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size_bytes: usize,
    },

    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::ServiceUnavailable(_) | Self::Timeout
        )
    }

    /// Server supplied retry hint, if any.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors returned by the brook storage engine.
#[derive(Debug, Error)]
pub enum BrookError {
    /// A transient failure persisted through every permitted attempt.
    #[error(
        "{operation} failed after {attempts} attempt(s){}",
        last_error_suffix(.last_error.as_ref())
    )]
    RetryExhausted {
        /// The operation that was retried.
        operation: Operation,
        /// How many times the operation was invoked.
        attempts: u32,
        /// The error from the final attempt; `None` when no attempt was made.
        last_error: Option<StoreError>,
    },

    /// The store rejected a batch as too large; the caller must split it.
    #[error("batch of {event_count} event(s) for stream '{stream}' exceeds store limits; split it into smaller batches")]
    BatchTooLarge {
        /// Stream the batch was destined for.
        stream: StreamKey,
        /// Number of events in the rejected batch.
        event_count: usize,
    },

    /// Configuration values were rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The requested range is inverted.
    #[error("invalid range: from {from} is after to {to}")]
    InvalidRange {
        /// Requested lower bound.
        from: Position,
        /// Requested upper bound.
        to: Position,
    },

    /// A slice read asked for positions beyond the cached bucket.
    #[error("requested position {requested} exceeds slice upper bound {cached_to:?}")]
    SliceRangeExceeded {
        /// Requested upper bound.
        requested: Position,
        /// Upper bound of the cached bucket; `None` for an empty bucket.
        cached_to: Option<Position>,
    },

    /// A batch was structurally invalid.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// The committed cursor did not have the expected value.
    #[error("cursor conflict on stream '{stream}': expected {expected:?}, found {actual:?}")]
    CursorConflict {
        /// Stream whose cursor moved.
        stream: StreamKey,
        /// Cursor the caller expected.
        expected: Option<Position>,
        /// Cursor actually stored.
        actual: Option<Position>,
    },

    /// An event already exists at a position being written.
    #[error("position {position} of stream '{stream}' is already occupied")]
    PositionConflict {
        /// Stream being appended to.
        stream: StreamKey,
        /// Occupied position.
        position: Position,
    },

    /// A previous append only partially landed and must be resumed first.
    #[error("stream '{stream}' has an unfinished append targeting {}", .pending.target)]
    PendingAppend {
        /// Stream with the unfinished append.
        stream: StreamKey,
        /// The pending marker left behind.
        pending: PendingCursor,
    },

    /// The caller asked the operation to stop.
    #[error("operation cancelled")]
    Cancelled,

    /// A non-retryable store failure.
    #[error("{operation} failed: {source}")]
    Store {
        /// The failed operation.
        operation: Operation,
        /// The underlying store error.
        #[source]
        source: StoreError,
    },

    /// A value could not be serialized into a document.
    #[error("failed to serialize document '{id}': {detail}")]
    Serialization {
        /// Document id.
        id: String,
        /// Serializer message.
        detail: String,
    },

    /// A stored document could not be decoded.
    #[error("failed to deserialize document '{id}' in partition '{partition}': {detail}")]
    Deserialization {
        /// Partition key of the document.
        partition: String,
        /// Document id.
        id: String,
        /// Deserializer message.
        detail: String,
    },
}

fn last_error_suffix(last_error: Option<&StoreError>) -> String {
    last_error.map_or_else(String::new, |error| format!(": {error}"))
}

impl BrookError {
    /// Wraps a store error that is not subject to retry.
    pub const fn store(operation: Operation, source: StoreError) -> Self {
        Self::Store { operation, source }
    }

    /// Whether the caller asked the operation to stop.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error signals a caller or programming mistake.
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidRange { .. } | Self::SliceRangeExceeded { .. } | Self::InvalidBatch(_)
        )
    }

    /// Whether the error is a fatal configuration problem that retrying cannot fix.
    pub const fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            Self::BatchTooLarge { .. } | Self::InvalidConfiguration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_unavailability_are_transient() {
        assert!(StoreError::Throttled { retry_after: None }.is_transient());
        assert!(StoreError::ServiceUnavailable("busy".into()).is_transient());
        assert!(StoreError::Timeout.is_transient());
    }

    #[test]
    fn conflicts_and_size_limits_are_not_transient() {
        assert!(!StoreError::Conflict { id: "1".into() }.is_transient());
        assert!(!StoreError::PreconditionFailed { id: "c".into() }.is_transient());
        assert!(!StoreError::PayloadTooLarge { size_bytes: 10 }.is_transient());
        assert!(!StoreError::Backend("boom".into()).is_transient());
    }

    #[test]
    fn exhausted_retry_message_states_zero_attempts() {
        let error = BrookError::RetryExhausted {
            operation: Operation::ExecuteBatch,
            attempts: 0,
            last_error: None,
        };

        assert_eq!(error.to_string(), "execute_batch failed after 0 attempt(s)");
    }

    #[test]
    fn exhausted_retry_message_includes_last_error() {
        let error = BrookError::RetryExhausted {
            operation: Operation::ReadCursor,
            attempts: 3,
            last_error: Some(StoreError::Timeout),
        };

        assert_eq!(
            error.to_string(),
            "read_cursor failed after 3 attempt(s): request timed out"
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(BrookError::Cancelled.is_cancelled());
        assert!(BrookError::InvalidBatch("empty".into()).is_precondition());
        assert!(BrookError::InvalidConfiguration("slice".into()).is_fatal_configuration());
        assert!(!BrookError::Cancelled.is_precondition());
    }
}
