//! Shared fixtures for the brookstore integration tests.
//!
//! Every fixture wires the engine components over one shared store so that
//! a test can write through one component and observe through another.

use std::sync::Arc;

use brookstore::{
    BrookEvent, BrookRepository, BrookStorageConfig, BrookWriter, DocumentStore, EventId,
    SnapshotRepository, SnapshotStreamKey, SnapshotType, StreamKey, StreamReader,
};
use brookstore_memory::InMemoryDocumentStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload used by the sample events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    /// Sequence of the line within its batch.
    pub line: usize,
    /// Free text.
    pub note: String,
}

/// Engine components sharing one store.
pub struct Engine<S: ?Sized> {
    /// The raw store, for inspecting documents directly.
    pub store: Arc<S>,
    /// Low-level repository.
    pub repository: BrookRepository<S>,
    /// Append and recovery.
    pub writer: BrookWriter<S>,
    /// Slice-parallel reads.
    pub reader: StreamReader<S>,
    /// Snapshot storage.
    pub snapshots: SnapshotRepository<S>,
}

impl<S> Engine<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    /// Wires every component over `store`.
    pub fn new(store: Arc<S>, config: &BrookStorageConfig) -> Self {
        let repository = BrookRepository::new(Arc::clone(&store), config);
        Self {
            writer: BrookWriter::new(repository.clone()),
            reader: StreamReader::new(repository.clone(), config),
            snapshots: SnapshotRepository::new(Arc::clone(&store), config),
            repository,
            store,
        }
    }
}

/// An engine over a fresh in-memory store with fast, deterministic retries.
pub fn memory_engine(config: &BrookStorageConfig) -> Engine<InMemoryDocumentStore> {
    Engine::new(Arc::new(InMemoryDocumentStore::new()), config)
}

/// Configuration with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> BrookStorageConfig {
    BrookStorageConfig::default().with_retry_backoff(brookstore::BackoffSchedule::Fixed {
        delays: vec![std::time::Duration::from_millis(1)],
    })
}

/// A unique stream key, safe for tests running in parallel.
pub fn stream_key(label: &str) -> StreamKey {
    StreamKey::try_new("order", format!("{label}-{}", Uuid::now_v7()))
        .expect("generated stream key is valid")
}

/// A unique snapshot stream derived from a fresh brook.
pub fn snapshot_stream(label: &str) -> SnapshotStreamKey {
    SnapshotStreamKey::new(
        stream_key(label),
        SnapshotType::try_new("order-summary").expect("static snapshot type is valid"),
    )
}

/// `count` JSON events whose payload records their index.
pub fn sample_events(count: usize) -> Vec<BrookEvent> {
    (0..count)
        .map(|line| {
            BrookEvent::json(
                EventId::generate(),
                "order.line-added",
                "integration-tests",
                &LineAdded {
                    line,
                    note: format!("line {line}"),
                },
            )
            .expect("sample payload serializes")
        })
        .collect()
}
