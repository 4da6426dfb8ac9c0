//! In-memory document store for `brookstore`
//!
//! This crate provides an in-memory implementation of the `DocumentStore`
//! trait, useful for testing and development scenarios where persistence is
//! not required. Transactional batches are atomic per partition, documents
//! carry etags for optimistic concurrency and batches are subject to the
//! same kind of size limits a hosted document database enforces.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use brookstore::{
    BatchItemOutcome, BatchOperation, BatchResponse, BatchStatus, Document, DocumentPage,
    DocumentQuery, DocumentStore, ETag, ItemStatus, StoreError, StoreResult,
};
use parking_lot::RwLock;
use tracing::debug;

type Partition = BTreeMap<String, Document>;

// Pending batch writes by id; `None` marks a delete.
type Staged = BTreeMap<String, Option<Document>>;

/// Limits applied to transactional batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreLimits {
    /// Maximum number of operations in one batch.
    pub max_batch_operations: usize,
    /// Maximum encoded size of one batch, and of any single document.
    pub max_batch_bytes: usize,
}

impl Default for MemoryStoreLimits {
    fn default() -> Self {
        Self {
            max_batch_operations: 100,
            max_batch_bytes: 2 * 1024 * 1024,
        }
    }
}

impl MemoryStoreLimits {
    /// No practical limit.
    pub const fn unlimited() -> Self {
        Self {
            max_batch_operations: usize::MAX,
            max_batch_bytes: usize::MAX,
        }
    }
}

/// Thread-safe in-memory document store for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    // Maps partition keys to their documents, ordered by id
    partitions: Arc<RwLock<HashMap<String, Partition>>>,
    etags: Arc<AtomicU64>,
    limits: MemoryStoreLimits,
}

impl InMemoryDocumentStore {
    /// Create a new empty store with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store with the given limits
    pub fn with_limits(limits: MemoryStoreLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// The limits this store enforces.
    pub const fn limits(&self) -> MemoryStoreLimits {
        self.limits
    }

    /// Number of documents stored in `partition_key`.
    pub fn document_count(&self, partition_key: &str) -> usize {
        self.partitions
            .read()
            .get(partition_key)
            .map_or(0, BTreeMap::len)
    }

    /// Ids stored in `partition_key`, in id order.
    pub fn document_ids(&self, partition_key: &str) -> Vec<String> {
        self.partitions
            .read()
            .get(partition_key)
            .map(|partition| partition.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn stamp(&self, mut document: Document) -> Document {
        let tag = self.etags.fetch_add(1, Ordering::Relaxed) + 1;
        document.etag = Some(ETag::new(tag.to_string()));
        document
    }

    fn check_document_size(&self, document: &Document) -> StoreResult<()> {
        let size_bytes = document.encoded_len();
        if size_bytes > self.limits.max_batch_bytes {
            return Err(StoreError::PayloadTooLarge { size_bytes });
        }
        Ok(())
    }

    fn stage(
        &self,
        partition: Option<&Partition>,
        staged: &mut Staged,
        operation: &BatchOperation,
    ) -> ItemStatus {
        match operation {
            BatchOperation::Create(document) => {
                if lookup(partition, staged, &document.id).is_some() {
                    return ItemStatus::Conflict;
                }
                staged.insert(document.id.clone(), Some(self.stamp(document.clone())));
            }
            BatchOperation::Upsert(document) => {
                staged.insert(document.id.clone(), Some(self.stamp(document.clone())));
            }
            BatchOperation::Replace { document, if_match } => {
                let Some(existing) = lookup(partition, staged, &document.id) else {
                    return ItemStatus::NotFound;
                };
                if if_match.as_ref().is_some_and(|tag| existing.etag.as_ref() != Some(tag)) {
                    return ItemStatus::PreconditionFailed;
                }
                staged.insert(document.id.clone(), Some(self.stamp(document.clone())));
            }
            BatchOperation::Delete { id } => {
                if lookup(partition, staged, id).is_none() {
                    return ItemStatus::NotFound;
                }
                staged.insert(id.clone(), None);
            }
        }
        ItemStatus::Ok
    }
}

/// The document `id` as the batch sees it: staged changes over the stored partition.
fn lookup<'a>(
    partition: Option<&'a Partition>,
    staged: &'a Staged,
    id: &str,
) -> Option<&'a Document> {
    match staged.get(id) {
        Some(change) => change.as_ref(),
        None => partition.and_then(|partition| partition.get(id)),
    }
}

fn sort_key(document: &Document) -> (i64, &str) {
    (document.sequence.unwrap_or(i64::MIN), document.id.as_str())
}

fn encode_continuation(document: &Document) -> String {
    let (sequence, id) = sort_key(document);
    format!("{sequence}:{id}")
}

fn decode_continuation(token: &str) -> StoreResult<(i64, String)> {
    token
        .split_once(':')
        .and_then(|(sequence, id)| Some((sequence.parse().ok()?, id.to_string())))
        .ok_or_else(|| StoreError::Backend(format!("invalid continuation token '{token}'")))
}

fn rejected(operations: &[BatchOperation], status: BatchStatus) -> BatchResponse {
    BatchResponse {
        status,
        outcomes: operations
            .iter()
            .map(|operation| BatchItemOutcome {
                id: operation.id().to_string(),
                status: ItemStatus::FailedDependency,
            })
            .collect(),
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, partition_key: &str, id: &str) -> StoreResult<Option<Document>> {
        Ok(self
            .partitions
            .read()
            .get(partition_key)
            .and_then(|partition| partition.get(id))
            .cloned())
    }

    async fn create(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        self.check_document_size(&document)?;
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(partition_key.to_string()).or_default();
        if partition.contains_key(&document.id) {
            return Err(StoreError::Conflict { id: document.id });
        }
        partition.insert(document.id.clone(), self.stamp(document));
        Ok(())
    }

    async fn upsert(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        self.check_document_size(&document)?;
        self.partitions
            .write()
            .entry(partition_key.to_string())
            .or_default()
            .insert(document.id.clone(), self.stamp(document));
        Ok(())
    }

    async fn delete(&self, partition_key: &str, id: &str) -> StoreResult<bool> {
        Ok(self
            .partitions
            .write()
            .get_mut(partition_key)
            .is_some_and(|partition| partition.remove(id).is_some()))
    }

    async fn query_page(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
        page_size: usize,
    ) -> StoreResult<DocumentPage> {
        let after = continuation.as_deref().map(decode_continuation).transpose()?;
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(&query.partition_key) else {
            return Ok(DocumentPage::default());
        };

        let mut matching: Vec<&Document> = partition
            .values()
            .filter(|document| query.matches(document))
            .filter(|document| {
                after.as_ref().map_or(true, |(sequence, id)| {
                    sort_key(document) > (*sequence, id.as_str())
                })
            })
            .collect();
        matching.sort_by(|left, right| sort_key(left).cmp(&sort_key(right)));

        let page_size = page_size.max(1);
        let has_more = matching.len() > page_size;
        matching.truncate(page_size);

        let continuation = if has_more {
            matching.last().map(|document| encode_continuation(document))
        } else {
            None
        };

        Ok(DocumentPage {
            documents: matching.into_iter().cloned().collect(),
            continuation,
        })
    }

    async fn execute_batch(
        &self,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StoreResult<BatchResponse> {
        let size_bytes: usize = operations.iter().map(BatchOperation::encoded_len).sum();
        if operations.len() > self.limits.max_batch_operations
            || size_bytes > self.limits.max_batch_bytes
        {
            debug!(
                partition = partition_key,
                operations = operations.len(),
                size_bytes,
                "[memory.execute_batch] batch exceeds store limits"
            );
            return Ok(rejected(&operations, BatchStatus::TooLarge));
        }

        let mut partitions = self.partitions.write();
        let mut staged = Staged::new();

        for (index, operation) in operations.iter().enumerate() {
            let status = self.stage(partitions.get(partition_key), &mut staged, operation);
            if status != ItemStatus::Ok {
                debug!(
                    partition = partition_key,
                    id = operation.id(),
                    status = ?status,
                    "[memory.execute_batch] batch rolled back"
                );
                let mut response = rejected(
                    &operations,
                    BatchStatus::Failed {
                        reason: format!("operation on '{}' failed: {status:?}", operation.id()),
                    },
                );
                response.outcomes[index].status = status;
                return Ok(response);
            }
        }

        let partition = partitions.entry(partition_key.to_string()).or_default();
        for (id, change) in staged {
            match change {
                Some(document) => {
                    partition.insert(id, document);
                }
                None => {
                    partition.remove(&id);
                }
            }
        }
        Ok(BatchResponse {
            status: BatchStatus::Success,
            outcomes: operations
                .iter()
                .map(|operation| BatchItemOutcome {
                    id: operation.id().to_string(),
                    status: ItemStatus::Ok,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brookstore::DocumentKind;
    use serde_json::json;

    fn event(sequence: i64) -> Document {
        Document::new(
            sequence.to_string(),
            DocumentKind::Event,
            Some(sequence),
            json!({ "n": sequence }),
        )
    }

    #[tokio::test]
    async fn writes_assign_fresh_etags() {
        let store = InMemoryDocumentStore::new();

        store.upsert("p", event(0)).await.unwrap();
        let first = store.read("p", "0").await.unwrap().unwrap().etag;
        store.upsert("p", event(0)).await.unwrap();
        let second = store.read("p", "0").await.unwrap().unwrap().etag;

        assert!(first.is_some());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn query_pages_in_sequence_order() {
        let store = InMemoryDocumentStore::new();
        for sequence in [10, 2, 7, 1, 5] {
            store.upsert("p", event(sequence)).await.unwrap();
        }
        let query = DocumentQuery::all("p", DocumentKind::Event);

        let first = store.query_page(&query, None, 2).await.unwrap();
        let second = store.query_page(&query, first.continuation.clone(), 2).await.unwrap();
        let third = store.query_page(&query, second.continuation.clone(), 2).await.unwrap();

        let ids = |page: &DocumentPage| {
            page.documents.iter().map(|d| d.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), vec!["1", "2"]);
        assert_eq!(ids(&second), vec!["5", "7"]);
        assert_eq!(ids(&third), vec!["10"]);
        assert!(third.continuation.is_none());
    }

    #[tokio::test]
    async fn failed_batch_applies_nothing() {
        let store = InMemoryDocumentStore::new();
        store.upsert("p", event(1)).await.unwrap();

        let response = store
            .execute_batch(
                "p",
                vec![BatchOperation::Create(event(0)), BatchOperation::Create(event(1))],
            )
            .await
            .unwrap();

        assert!(!response.is_success());
        assert_eq!(response.outcomes[0].status, ItemStatus::FailedDependency);
        assert_eq!(response.outcomes[1].status, ItemStatus::Conflict);
        assert!(store.read("p", "0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_operations_see_earlier_writes_of_the_same_batch() {
        let store = InMemoryDocumentStore::new();
        store.upsert("p", event(0)).await.unwrap();
        store.upsert("p", event(9)).await.unwrap();
        let untouched = store.read("p", "9").await.unwrap();

        let response = store
            .execute_batch(
                "p",
                vec![
                    BatchOperation::Delete { id: "0".to_string() },
                    BatchOperation::Create(event(0)),
                    BatchOperation::Create(event(1)),
                    BatchOperation::Replace {
                        document: event(1),
                        if_match: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(store.document_ids("p"), vec!["0", "1", "9"]);
        assert_eq!(store.read("p", "9").await.unwrap(), untouched);

        let rejected = store
            .execute_batch(
                "p",
                vec![
                    BatchOperation::Delete { id: "9".to_string() },
                    BatchOperation::Delete { id: "9".to_string() },
                ],
            )
            .await
            .unwrap();

        assert_eq!(rejected.outcomes[1].status, ItemStatus::NotFound);
        assert_eq!(store.read("p", "9").await.unwrap(), untouched);
    }

    #[tokio::test]
    async fn replace_honours_if_match() {
        let store = InMemoryDocumentStore::new();
        store.upsert("p", event(0)).await.unwrap();
        let stale = ETag::new("stale");

        let response = store
            .execute_batch(
                "p",
                vec![BatchOperation::Replace {
                    document: event(0),
                    if_match: Some(stale),
                }],
            )
            .await
            .unwrap();

        assert_eq!(
            response.first_failure().map(|o| o.status),
            Some(ItemStatus::PreconditionFailed)
        );
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected_as_too_large() {
        let store = InMemoryDocumentStore::with_limits(MemoryStoreLimits {
            max_batch_operations: 2,
            max_batch_bytes: usize::MAX,
        });

        let response = store
            .execute_batch("p", (0..3).map(|n| BatchOperation::Create(event(n))).collect())
            .await
            .unwrap();

        assert_eq!(response.status, BatchStatus::TooLarge);
        assert_eq!(store.document_count("p"), 0);
    }

    #[tokio::test]
    async fn invalid_continuation_is_a_backend_error() {
        let store = InMemoryDocumentStore::new();
        store.upsert("p", event(0)).await.unwrap();

        let result = store
            .query_page(&DocumentQuery::all("p", DocumentKind::Event), Some("garbage".into()), 10)
            .await;

        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
