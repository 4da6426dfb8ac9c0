//! Document store port.
//!
//! The engine persists everything as JSON documents addressed by
//! `(partition_key, id)`. This module defines the trait adapters implement
//! and the value types exchanged with them. Adapters include:
//! - `brookstore-memory`: in-memory store for tests and development
//! - `brookstore-postgres`: PostgreSQL store

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Result alias for adapter calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Document id of the committed cursor within a stream partition.
pub const CURSOR_DOCUMENT_ID: &str = "cursor";

/// Document id of the pending cursor within a stream partition.
pub const PENDING_CURSOR_DOCUMENT_ID: &str = "cursor-pending";

/// What a document represents; queries are always scoped to one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    /// One event at one position.
    Event,
    /// The committed cursor.
    Cursor,
    /// The in-flight append marker.
    PendingCursor,
    /// One snapshot version.
    Snapshot,
}

impl DocumentKind {
    /// Stable string form used by adapters.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Cursor => "cursor",
            Self::PendingCursor => "cursor-pending",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(Self::Event),
            "cursor" => Ok(Self::Cursor),
            "cursor-pending" => Ok(Self::PendingCursor),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(StoreError::Backend(format!("unknown document kind '{other}'"))),
        }
    }
}

/// Opaque version tag used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wraps an adapter-specific tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored or to-be-stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Id, unique within the partition.
    pub id: String,
    /// What the document represents.
    pub kind: DocumentKind,
    /// Sortable numeric key (event position, snapshot version).
    pub sequence: Option<i64>,
    /// JSON body.
    pub body: Value,
    /// Version tag assigned by the store; ignored on writes.
    pub etag: Option<ETag>,
}

impl Document {
    /// Creates a document without an etag.
    pub fn new(
        id: impl Into<String>,
        kind: DocumentKind,
        sequence: Option<i64>,
        body: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            sequence,
            body,
            etag: None,
        }
    }

    /// Approximate encoded size, used to enforce payload limits.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.body).map_or(0, |bytes| bytes.len()) + self.id.len()
    }
}

/// A paged query over one kind of document within one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    /// Partition to scan.
    pub partition_key: String,
    /// Kind of document to return.
    pub kind: DocumentKind,
    /// Optional inclusive filter on `sequence`.
    pub sequence_range: Option<RangeInclusive<i64>>,
}

impl DocumentQuery {
    /// All documents of `kind` in the partition.
    pub fn all(partition_key: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            partition_key: partition_key.into(),
            kind,
            sequence_range: None,
        }
    }

    /// Restricts the query to `from..=to` on `sequence`.
    #[must_use]
    pub fn with_sequence_range(mut self, from: i64, to: i64) -> Self {
        self.sequence_range = Some(from..=to);
        self
    }

    /// Whether a document satisfies the query (partition is checked by the caller).
    pub fn matches(&self, document: &Document) -> bool {
        document.kind == self.kind
            && self.sequence_range.as_ref().map_or(true, |range| {
                document.sequence.is_some_and(|sequence| range.contains(&sequence))
            })
    }
}

/// One page of query results, ordered by `(sequence, id)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentPage {
    /// Documents of this page.
    pub documents: Vec<Document>,
    /// Token to fetch the next page; `None` when exhausted.
    pub continuation: Option<String>,
}

/// One operation inside a transactional batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Insert; fails if the id exists.
    Create(Document),
    /// Insert or overwrite.
    Upsert(Document),
    /// Overwrite an existing document, optionally only if its etag matches.
    Replace {
        /// The new content.
        document: Document,
        /// Required current etag.
        if_match: Option<ETag>,
    },
    /// Remove a document; fails if it does not exist.
    Delete {
        /// Id to remove.
        id: String,
    },
}

impl BatchOperation {
    /// The document id this operation targets.
    pub fn id(&self) -> &str {
        match self {
            Self::Create(document) | Self::Upsert(document) => &document.id,
            Self::Replace { document, .. } => &document.id,
            Self::Delete { id } => id,
        }
    }

    /// Approximate encoded size of the operation.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Create(document) | Self::Upsert(document) => document.encoded_len(),
            Self::Replace { document, .. } => document.encoded_len(),
            Self::Delete { id } => id.len(),
        }
    }
}

/// Outcome of one operation of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Applied (or would have been applied had the batch committed).
    Ok,
    /// The id already existed.
    Conflict,
    /// The id did not exist.
    NotFound,
    /// The etag precondition failed.
    PreconditionFailed,
    /// Not attempted because another operation failed.
    FailedDependency,
}

/// Per-operation result of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemOutcome {
    /// Targeted document id.
    pub id: String,
    /// What happened to it.
    pub status: ItemStatus,
}

/// Overall status of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every operation was committed atomically.
    Success,
    /// The store rate limited the batch; nothing was applied.
    Throttled {
        /// Server supplied retry hint.
        retry_after: Option<Duration>,
    },
    /// The batch exceeds store limits; nothing was applied and retrying cannot help.
    TooLarge,
    /// An operation failed; nothing was applied.
    Failed {
        /// Human readable reason.
        reason: String,
    },
}

/// Response of a transactional batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    /// Overall status.
    pub status: BatchStatus,
    /// One entry per submitted operation, in submission order.
    pub outcomes: Vec<BatchItemOutcome>,
}

impl BatchResponse {
    /// Whether the batch committed.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, BatchStatus::Success)
    }

    /// The first operation that did not succeed (ignoring dependency failures).
    pub fn first_failure(&self) -> Option<&BatchItemOutcome> {
        self.outcomes.iter().find(|outcome| {
            !matches!(outcome.status, ItemStatus::Ok | ItemStatus::FailedDependency)
        })
    }
}

/// Port implemented by document store adapters.
///
/// Implementations must be safe for concurrent use. "Not found" is reported
/// through `Option`/`bool`, never as an error.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read.
    async fn read(&self, partition_key: &str, id: &str) -> StoreResult<Option<Document>>;

    /// Inserts a document; `StoreError::Conflict` if the id exists.
    async fn create(&self, partition_key: &str, document: Document) -> StoreResult<()>;

    /// Inserts or overwrites a document.
    async fn upsert(&self, partition_key: &str, document: Document) -> StoreResult<()>;

    /// Deletes a document; returns `false` if it did not exist.
    async fn delete(&self, partition_key: &str, id: &str) -> StoreResult<bool>;

    /// Fetches one page of a query, resuming from `continuation`.
    async fn query_page(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
        page_size: usize,
    ) -> StoreResult<DocumentPage>;

    /// Applies all operations atomically within one partition.
    ///
    /// Business-level outcomes (throttling, size limits, conflicts) are
    /// reported through [`BatchResponse::status`]; `Err` is reserved for
    /// transport failures.
    async fn execute_batch(
        &self,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StoreResult<BatchResponse>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    async fn read(&self, partition_key: &str, id: &str) -> StoreResult<Option<Document>> {
        (**self).read(partition_key, id).await
    }

    async fn create(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        (**self).create(partition_key, document).await
    }

    async fn upsert(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        (**self).upsert(partition_key, document).await
    }

    async fn delete(&self, partition_key: &str, id: &str) -> StoreResult<bool> {
        (**self).delete(partition_key, id).await
    }

    async fn query_page(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
        page_size: usize,
    ) -> StoreResult<DocumentPage> {
        (**self).query_page(query, continuation, page_size).await
    }

    async fn execute_batch(
        &self,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StoreResult<BatchResponse> {
        (**self).execute_batch(partition_key, operations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_matches_kind_and_sequence_range() {
        let query = DocumentQuery::all("p", DocumentKind::Event).with_sequence_range(3, 5);
        let inside = Document::new("4", DocumentKind::Event, Some(4), json!({}));
        let outside = Document::new("6", DocumentKind::Event, Some(6), json!({}));
        let wrong_kind = Document::new("cursor", DocumentKind::Cursor, None, json!({}));

        assert!(query.matches(&inside));
        assert!(!query.matches(&outside));
        assert!(!query.matches(&wrong_kind));
    }

    #[test]
    fn document_kind_parses_its_string_form() {
        for kind in [
            DocumentKind::Event,
            DocumentKind::Cursor,
            DocumentKind::PendingCursor,
            DocumentKind::Snapshot,
        ] {
            assert_eq!(kind.as_str().parse::<DocumentKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<DocumentKind>().is_err());
    }

    #[test]
    fn first_failure_skips_dependency_failures() {
        let response = BatchResponse {
            status: BatchStatus::Failed {
                reason: "conflict".into(),
            },
            outcomes: vec![
                BatchItemOutcome {
                    id: "0".into(),
                    status: ItemStatus::FailedDependency,
                },
                BatchItemOutcome {
                    id: "1".into(),
                    status: ItemStatus::Conflict,
                },
            ],
        };

        assert_eq!(response.first_failure().map(|o| o.id.as_str()), Some("1"));
    }
}
