//! `brookstore` - append-only event brook storage engine
//!
//! A brook is the ordered event log of one entity. This crate stores brooks
//! in any [`DocumentStore`] and provides:
//!
//! - crash-safe appends through a pending cursor and a transactional batch
//!   ([`BrookWriter`], [`BrookRepository`]),
//! - slice-parallel, lazily streamed reads ([`StreamReader`], [`SliceReader`]),
//! - versioned snapshots with retention pruning ([`SnapshotRepository`]).
//!
//! Storage adapters live in `brookstore-memory` and `brookstore-postgres`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod cursor;
pub mod document;
pub mod errors;
pub mod event;
mod paging;
pub mod repository;
pub mod retry;
pub mod sequence;
pub mod slice_reader;
pub mod snapshot;
pub mod stream_reader;
pub mod types;
pub mod writer;

pub use config::{BrookStorageConfig, MaxParallelSlices, QueryPageSize, SliceSize};
pub use cursor::{plan_recovery, CursorState, PendingCursor, RecoveryPlan};
pub use document::{
    BatchItemOutcome, BatchOperation, BatchResponse, BatchStatus, Document, DocumentKind,
    DocumentPage, DocumentQuery, DocumentStore, ETag, ItemStatus, StoreResult,
    CURSOR_DOCUMENT_ID, PENDING_CURSOR_DOCUMENT_ID,
};
pub use errors::{BrookError, BrookResult, Operation, StoreError};
pub use event::{BrookEvent, EventId, StoredEvent};
pub use repository::{BatchResult, BrookRepository};
pub use retry::{BackoffSchedule, RetryError, RetryPolicy, RetryStrategy};
pub use sequence::EventStream;
pub use slice_reader::SliceReader;
pub use snapshot::{
    retained_versions, DeleteFailure, PruneReport, SnapshotEnvelope, SnapshotRepository,
    SweepReport,
};
pub use stream_reader::{buckets_for, SliceBucket, StreamReader};
pub use types::{
    EntityId, KeyError, Position, RangeKey, SnapshotKey, SnapshotStreamKey, SnapshotType,
    StreamKey, StreamType, Timestamp,
};
pub use writer::{AppendOutcome, BrookWriter, ExpectedCursor, RecoveryOutcome, StreamLocks};

/// Re-export so adapters and callers share one cancellation type.
pub use tokio_util::sync::CancellationToken;
