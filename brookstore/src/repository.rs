//! Storage adapter for brooks.
//!
//! [`BrookRepository`] maps the brook model onto a [`DocumentStore`]: one
//! partition per stream holding a committed cursor document, at most one
//! pending cursor document, and one document per event keyed by its decimal
//! position. Every store call goes through the configured [`RetryPolicy`].

use crate::config::BrookStorageConfig;
use crate::cursor::{CursorState, PendingCursor};
use crate::document::{
    BatchOperation, BatchResponse, BatchStatus, Document, DocumentKind, DocumentQuery,
    DocumentStore, ETag, ItemStatus, CURSOR_DOCUMENT_ID, PENDING_CURSOR_DOCUMENT_ID,
};
use crate::errors::{BrookError, BrookResult, Operation, StoreError};
use crate::event::{BrookEvent, StoredEvent};
use crate::paging::query_documents;
use crate::retry::{RetryError, RetryPolicy};
use crate::sequence::{self, cancellable, EventStream};
use crate::types::{Position, RangeKey, StreamKey};
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorBody {
    position: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingCursorBody {
    position: i64,
    original_position: i64,
}

/// Result of a committed transactional batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    /// Position of the first appended event.
    pub first: Position,
    /// Position of the last appended event; the new committed cursor.
    pub last: Position,
    /// Number of events written.
    pub event_count: usize,
}

/// Repository for the documents of brooks.
pub struct BrookRepository<S: ?Sized> {
    store: Arc<S>,
    retry: RetryPolicy,
    page_size: usize,
}

impl<S: ?Sized> Clone for BrookRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
            page_size: self.page_size,
        }
    }
}

impl<S> BrookRepository<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    /// Creates a repository over `store` using the retry and paging settings of `config`.
    pub fn new(store: Arc<S>, config: &BrookStorageConfig) -> Self {
        Self {
            store,
            retry: config.retry_policy(),
            page_size: config.page_size(),
        }
    }

    /// The underlying document store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Page size used by queries issued by this repository.
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads the committed cursor; `None` for a stream without events.
    #[instrument(name = "repository.get_cursor", skip(self), fields(stream = %key))]
    pub async fn get_cursor(&self, key: &StreamKey) -> BrookResult<Option<Position>> {
        Ok(self.read_cursor_document(key).await?.0)
    }

    /// Reads the pending cursor, if an append is in flight.
    #[instrument(name = "repository.get_pending_cursor", skip(self), fields(stream = %key))]
    pub async fn get_pending_cursor(&self, key: &StreamKey) -> BrookResult<Option<PendingCursor>> {
        let partition = key.partition_key();
        let Some(document) = self
            .read_document(&partition, PENDING_CURSOR_DOCUMENT_ID, Operation::ReadPendingCursor)
            .await?
        else {
            return Ok(None);
        };

        let body: PendingCursorBody = decode(&partition, &document)?;
        let target = Position::from_wire(body.position).ok_or_else(|| BrookError::Deserialization {
            partition: partition.clone(),
            id: document.id.clone(),
            detail: format!("pending cursor target {} is not a valid position", body.position),
        })?;

        Ok(Some(PendingCursor::new(
            Position::from_wire(body.original_position),
            target,
        )))
    }

    /// Reads the committed and pending cursors as one state.
    pub async fn cursor_state(&self, key: &StreamKey) -> BrookResult<CursorState> {
        let committed = self.get_cursor(key).await?;
        let pending = self.get_pending_cursor(key).await?;
        Ok(CursorState::from_parts(committed, pending))
    }

    /// Writes the pending marker before an append; last writer wins.
    #[instrument(name = "repository.create_pending_cursor", skip(self), fields(stream = %key))]
    pub async fn create_pending_cursor(
        &self,
        key: &StreamKey,
        pending: PendingCursor,
    ) -> BrookResult<()> {
        if pending.event_count() == 0 {
            return Err(BrookError::InvalidBatch(format!(
                "pending cursor target {} does not advance original cursor {:?}",
                pending.target, pending.original
            )));
        }

        let body = encode(
            PENDING_CURSOR_DOCUMENT_ID,
            &PendingCursorBody {
                position: Position::to_wire(Some(pending.target)),
                original_position: Position::to_wire(pending.original),
            },
        )?;
        let document = Document::new(
            PENDING_CURSOR_DOCUMENT_ID,
            DocumentKind::PendingCursor,
            None,
            body,
        );

        self.upsert_document(&key.partition_key(), document, Operation::WritePendingCursor)
            .await?;
        debug!(
            stream = %key,
            original = ?pending.original,
            target = %pending.target,
            "[repository.create_pending_cursor] pending cursor written"
        );
        Ok(())
    }

    /// Upserts the committed cursor and removes the pending marker.
    #[instrument(name = "repository.commit_cursor", skip(self), fields(stream = %key))]
    pub async fn commit_cursor(&self, key: &StreamKey, position: Position) -> BrookResult<()> {
        let document = cursor_document(Some(position))?;
        self.upsert_document(&key.partition_key(), document, Operation::CommitCursor)
            .await?;
        self.delete_pending_cursor(key).await?;

        info!(stream = %key, position = %position, "[repository.commit_cursor] cursor committed");
        Ok(())
    }

    /// Removes the pending marker; a missing marker is not an error.
    #[instrument(name = "repository.delete_pending_cursor", skip(self), fields(stream = %key))]
    pub async fn delete_pending_cursor(&self, key: &StreamKey) -> BrookResult<()> {
        let partition = key.partition_key();
        let existed = self
            .retry
            .execute(Operation::DeletePendingCursor, || {
                let store = Arc::clone(&self.store);
                let partition = partition.clone();
                async move { store.delete(&partition, PENDING_CURSOR_DOCUMENT_ID).await }
            })
            .await?;

        if !existed {
            debug!(stream = %key, "[repository.delete_pending_cursor] no pending cursor to delete");
        }
        Ok(())
    }

    /// Whether an event is stored at `position`.
    #[instrument(name = "repository.event_exists", skip(self), fields(stream = %key))]
    pub async fn event_exists(&self, key: &StreamKey, position: Position) -> BrookResult<bool> {
        let document = self
            .read_document(&key.partition_key(), &position.document_id(), Operation::ReadEvent)
            .await?;
        Ok(document.is_some_and(|document| document.kind == DocumentKind::Event))
    }

    /// Positions in `[from, to]` that already hold an event.
    #[instrument(name = "repository.get_existing_positions", skip(self), fields(stream = %key))]
    pub async fn get_existing_positions(
        &self,
        key: &StreamKey,
        from: Position,
        to: Position,
    ) -> BrookResult<BTreeSet<Position>> {
        if from > to {
            return Ok(BTreeSet::new());
        }

        let query = DocumentQuery::all(key.partition_key(), DocumentKind::Event)
            .with_sequence_range(Position::to_wire(Some(from)), Position::to_wire(Some(to)));

        query_documents(
            Arc::clone(&self.store),
            self.retry.clone(),
            query,
            self.page_size,
            Operation::QueryEvents,
        )
        .try_filter_map(|document| async move {
            Ok(document.sequence.and_then(Position::from_wire))
        })
        .try_collect()
        .await
    }

    /// Writes each event as its own document, numbered from `start`.
    ///
    /// Not atomic: a failure part-way leaves a prefix of the batch stored.
    /// Writes are upserts so the same batch can be replayed safely.
    #[instrument(
        name = "repository.append_event_batch",
        skip(self, events),
        fields(stream = %key, count = events.len())
    )]
    pub async fn append_event_batch(
        &self,
        key: &StreamKey,
        start: Position,
        events: &[BrookEvent],
    ) -> BrookResult<()> {
        if events.is_empty() {
            return Err(BrookError::InvalidBatch("no events to append".to_string()));
        }

        let partition = key.partition_key();
        for (position, event) in positions_from(start).zip(events) {
            let document = event_document(position, event)?;
            self.upsert_document(&partition, document, Operation::AppendEvents)
                .await?;
        }

        debug!(
            stream = %key,
            start = %start,
            count = events.len(),
            "[repository.append_event_batch] events written"
        );
        Ok(())
    }

    /// Atomically writes `events` and advances the cursor from
    /// `expected_cursor` to `new_cursor`.
    ///
    /// Throttling is retried per policy. A batch the store rejects as too
    /// large fails with [`BrookError::BatchTooLarge`] without retrying.
    /// When a retried batch conflicts with its own earlier attempt (the
    /// cursor is at `new_cursor` and the stored ids match `events`), the
    /// append counts as committed.
    #[instrument(
        name = "repository.execute_transactional_batch",
        skip(self, events),
        fields(stream = %key, count = events.len())
    )]
    pub async fn execute_transactional_batch(
        &self,
        key: &StreamKey,
        events: &[BrookEvent],
        expected_cursor: Option<Position>,
        new_cursor: Position,
    ) -> BrookResult<BatchResult> {
        let first = Position::after(expected_cursor);
        let count = u64::try_from(events.len()).unwrap_or(u64::MAX);
        if count == 0 {
            return Err(BrookError::InvalidBatch("no events to append".to_string()));
        }
        if first.offset(count - 1) != new_cursor {
            return Err(BrookError::InvalidBatch(format!(
                "{} event(s) after cursor {:?} cannot end at {}",
                events.len(),
                expected_cursor,
                new_cursor
            )));
        }

        let (actual, etag) = self.read_cursor_document(key).await?;
        if actual != expected_cursor {
            return Err(BrookError::CursorConflict {
                stream: key.clone(),
                expected: expected_cursor,
                actual,
            });
        }

        let mut operations = positions_from(first)
            .zip(events)
            .map(|(position, event)| event_document(position, event).map(BatchOperation::Create))
            .collect::<BrookResult<Vec<_>>>()?;
        let cursor = cursor_document(Some(new_cursor))?;
        operations.push(match etag {
            Some(if_match) => BatchOperation::Replace {
                document: cursor,
                if_match: Some(if_match),
            },
            None => BatchOperation::Create(cursor),
        });

        let partition = key.partition_key();
        let mut attempts = 0_u32;
        let outcome = self
            .retry
            .run(Operation::ExecuteBatch, || {
                attempts += 1;
                let store = Arc::clone(&self.store);
                let partition = partition.clone();
                let operations = operations.clone();
                async move {
                    let size_bytes = operations.iter().map(BatchOperation::encoded_len).sum();
                    let response = store.execute_batch(&partition, operations).await?;
                    classify_batch_response(response, size_bytes)
                }
            })
            .await;

        let conflicted = matches!(
            outcome,
            Err(RetryError::NonRetryable(
                StoreError::Conflict { .. } | StoreError::PreconditionFailed { .. }
            ))
        );
        // An earlier attempt may have committed before its acknowledgement was lost.
        let outcome = if conflicted
            && attempts > 1
            && self
                .batch_already_applied(key, events, first, new_cursor)
                .await?
        {
            info!(
                stream = %key,
                attempts,
                "[repository.execute_transactional_batch] batch applied by an earlier attempt"
            );
            Ok(())
        } else {
            outcome
        };

        match outcome {
            Ok(()) => {
                info!(
                    stream = %key,
                    first = %first,
                    last = %new_cursor,
                    "[repository.execute_transactional_batch] batch committed"
                );
                Ok(BatchResult {
                    first,
                    last: new_cursor,
                    event_count: events.len(),
                })
            }
            Err(RetryError::NonRetryable(StoreError::PayloadTooLarge { size_bytes })) => {
                warn!(
                    stream = %key,
                    count = events.len(),
                    size_bytes,
                    "[repository.execute_transactional_batch] batch exceeds store limits"
                );
                Err(BrookError::BatchTooLarge {
                    stream: key.clone(),
                    event_count: events.len(),
                })
            }
            Err(RetryError::NonRetryable(StoreError::Conflict { id }))
                if id != CURSOR_DOCUMENT_ID =>
            {
                let position = id
                    .parse::<u64>()
                    .map(Position::new)
                    .unwrap_or(first);
                Err(BrookError::PositionConflict {
                    stream: key.clone(),
                    position,
                })
            }
            Err(RetryError::NonRetryable(
                StoreError::Conflict { .. } | StoreError::PreconditionFailed { .. },
            )) => {
                let actual = self.get_cursor(key).await?;
                Err(BrookError::CursorConflict {
                    stream: key.clone(),
                    expected: expected_cursor,
                    actual,
                })
            }
            Err(error) => Err(error.into_brook_error(Operation::ExecuteBatch)),
        }
    }

    /// Whether the cursor already sits at `last` with exactly `events`
    /// stored from `first`.
    async fn batch_already_applied(
        &self,
        key: &StreamKey,
        events: &[BrookEvent],
        first: Position,
        last: Position,
    ) -> BrookResult<bool> {
        if self.get_cursor(key).await? != Some(last) {
            return Ok(false);
        }

        let partition = key.partition_key();
        let query = DocumentQuery::all(partition.clone(), DocumentKind::Event)
            .with_sequence_range(Position::to_wire(Some(first)), Position::to_wire(Some(last)));
        let stored: Vec<StoredEvent> = query_documents(
            Arc::clone(&self.store),
            self.retry.clone(),
            query,
            self.page_size,
            Operation::QueryEvents,
        )
        .and_then(|document| {
            let decoded = decode_event(&partition, &document);
            async move { decoded }
        })
        .try_collect()
        .await?;

        Ok(stored.len() == events.len()
            && stored
                .iter()
                .zip(events)
                .all(|(stored, event)| stored.event.id == event.id))
    }

    /// Lazily streams the events of `range` in ascending position order.
    ///
    /// Pages of `page_size` documents are fetched on demand. The token is
    /// checked before every yielded element.
    pub fn query_events(
        &self,
        range: &RangeKey,
        page_size: usize,
        cancel: CancellationToken,
    ) -> EventStream {
        let Some(end) = range.end() else {
            return cancellable(sequence::empty(), cancel);
        };

        let partition = range.stream().partition_key();
        let query = DocumentQuery::all(partition.clone(), DocumentKind::Event).with_sequence_range(
            Position::to_wire(Some(range.start())),
            Position::to_wire(Some(end)),
        );

        debug!(
            range = %range,
            page_size,
            "[repository.query_events] starting paged event query"
        );

        let documents = query_documents(
            Arc::clone(&self.store),
            self.retry.clone(),
            query,
            page_size.max(1),
            Operation::QueryEvents,
        );
        let events = documents
            .and_then(move |document| {
                let decoded = decode_event(&partition, &document);
                async move { decoded }
            })
            .boxed();

        cancellable(events, cancel)
    }

    async fn read_cursor_document(
        &self,
        key: &StreamKey,
    ) -> BrookResult<(Option<Position>, Option<ETag>)> {
        let partition = key.partition_key();
        let Some(document) = self
            .read_document(&partition, CURSOR_DOCUMENT_ID, Operation::ReadCursor)
            .await?
        else {
            return Ok((None, None));
        };

        let body: CursorBody = decode(&partition, &document)?;
        Ok((Position::from_wire(body.position), document.etag))
    }

    async fn read_document(
        &self,
        partition: &str,
        id: &str,
        operation: Operation,
    ) -> BrookResult<Option<Document>> {
        self.retry
            .execute(operation, || {
                let store = Arc::clone(&self.store);
                async move { store.read(partition, id).await }
            })
            .await
    }

    async fn upsert_document(
        &self,
        partition: &str,
        document: Document,
        operation: Operation,
    ) -> BrookResult<()> {
        self.retry
            .execute(operation, || {
                let store = Arc::clone(&self.store);
                let document = document.clone();
                async move { store.upsert(partition, document).await }
            })
            .await
    }
}

/// Maps a batch response onto the store error taxonomy so the retry policy
/// can classify it.
fn classify_batch_response(response: BatchResponse, size_bytes: usize) -> Result<(), StoreError> {
    let failure = response
        .first_failure()
        .map(|outcome| (outcome.id.clone(), outcome.status));

    match response.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::Throttled { retry_after } => Err(StoreError::Throttled { retry_after }),
        BatchStatus::TooLarge => Err(StoreError::PayloadTooLarge { size_bytes }),
        BatchStatus::Failed { reason } => Err(match failure {
            Some((id, ItemStatus::Conflict)) => StoreError::Conflict { id },
            Some((id, ItemStatus::PreconditionFailed | ItemStatus::NotFound)) => {
                StoreError::PreconditionFailed { id }
            }
            _ => StoreError::Backend(reason),
        }),
    }
}

fn positions_from(start: Position) -> impl Iterator<Item = Position> {
    std::iter::successors(Some(start), |position| Some(position.next()))
}

fn cursor_document(position: Option<Position>) -> BrookResult<Document> {
    let body = encode(
        CURSOR_DOCUMENT_ID,
        &CursorBody {
            position: Position::to_wire(position),
        },
    )?;
    Ok(Document::new(CURSOR_DOCUMENT_ID, DocumentKind::Cursor, None, body))
}

fn event_document(position: Position, event: &BrookEvent) -> BrookResult<Document> {
    let id = position.document_id();
    let body = encode(&id, event)?;
    Ok(Document::new(
        id,
        DocumentKind::Event,
        Some(Position::to_wire(Some(position))),
        body,
    ))
}

fn decode_event(partition: &str, document: &Document) -> BrookResult<StoredEvent> {
    let position = document
        .sequence
        .and_then(Position::from_wire)
        .ok_or_else(|| BrookError::Deserialization {
            partition: partition.to_string(),
            id: document.id.clone(),
            detail: "event document has no position".to_string(),
        })?;
    let event: BrookEvent = decode(partition, document)?;
    Ok(StoredEvent::new(position, event))
}

pub(crate) fn encode<T: Serialize>(id: &str, value: &T) -> BrookResult<Value> {
    serde_json::to_value(value).map_err(|error| BrookError::Serialization {
        id: id.to_string(),
        detail: error.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(partition: &str, document: &Document) -> BrookResult<T> {
    serde_json::from_value(document.body.clone()).map_err(|error| BrookError::Deserialization {
        partition: partition.to_string(),
        id: document.id.clone(),
        detail: error.to_string(),
    })
}
