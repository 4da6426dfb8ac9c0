//! Snapshot storage, listing and retention pruning.

use std::collections::BTreeSet;
use std::sync::Arc;

use brookstore::{SnapshotEnvelope, SnapshotKey, SnapshotStreamKey, StoreError};
use brookstore_integration_tests::{fast_config, memory_engine, snapshot_stream, Engine};
use brookstore_memory::InMemoryDocumentStore;
use brookstore_testing::{ChaosConfig, ChaosDocumentStoreExt, Fault, StoreOperation};
use serde_json::json;

async fn write_versions<S>(engine: &Engine<S>, stream: &SnapshotStreamKey, versions: &[u64])
where
    S: brookstore::DocumentStore + ?Sized + 'static,
{
    for &version in versions {
        let envelope = SnapshotEnvelope::json(&json!({ "total": version * 10 })).unwrap();
        engine
            .snapshots
            .write(&SnapshotKey::new(stream.clone(), version), &envelope)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn developer_prunes_snapshots_by_retention_moduli() {
    // Given: Versions 1, 2, 3, 4, 5, 6 and 10
    let engine = memory_engine(&Default::default());
    let stream = snapshot_stream("prune");
    write_versions(&engine, &stream, &[1, 2, 3, 4, 5, 6, 10]).await;

    // When: Pruning with moduli [2, 0]
    let report = engine.snapshots.prune(&stream, &[2, 0]).await.unwrap();

    // Then: Even versions survive and the odd ones are gone
    assert_eq!(report.retained, BTreeSet::from([2, 4, 6, 10]));
    assert_eq!(report.deleted, vec![1, 3, 5]);
    assert!(report.failed.is_empty());
    assert_eq!(
        engine.snapshots.list_versions(&stream).await.unwrap(),
        BTreeSet::from([2, 4, 6, 10])
    );
}

#[tokio::test]
async fn pruning_always_keeps_the_newest_version() {
    let engine = memory_engine(&Default::default());
    let stream = snapshot_stream("newest");
    write_versions(&engine, &stream, &[1, 3, 7]).await;

    let report = engine.snapshots.prune(&stream, &[0]).await.unwrap();

    assert_eq!(report.retained, BTreeSet::from([7]));
    assert_eq!(
        engine.snapshots.list_versions(&stream).await.unwrap(),
        BTreeSet::from([7])
    );
}

#[tokio::test]
async fn pruning_an_empty_stream_is_a_no_op() {
    let engine = memory_engine(&Default::default());
    let stream = snapshot_stream("empty");

    let report = engine.snapshots.prune(&stream, &[5]).await.unwrap();

    assert!(report.retained.is_empty());
    assert!(report.deleted.is_empty());
}

#[tokio::test]
async fn snapshot_envelope_round_trips() {
    let engine = memory_engine(&Default::default());
    let stream = snapshot_stream("round-trip");
    let key = SnapshotKey::new(stream.clone(), 42);
    let envelope = SnapshotEnvelope::json(&json!({ "lines": 3, "total": 99 }))
        .unwrap()
        .with_reducer_hash("sha256:abc123");

    engine.snapshots.write(&key, &envelope).await.unwrap();

    assert_eq!(engine.snapshots.read(&key).await.unwrap(), Some(envelope));
    assert_eq!(
        engine
            .snapshots
            .read(&SnapshotKey::new(stream, 41))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn snapshots_of_different_projections_are_isolated() {
    let engine = memory_engine(&Default::default());
    let summary = snapshot_stream("isolated");
    let audit = SnapshotStreamKey::new(
        summary.brook().clone(),
        brookstore::SnapshotType::try_new("order-audit").unwrap(),
    );
    write_versions(&engine, &summary, &[1, 2]).await;
    write_versions(&engine, &audit, &[5]).await;

    engine.snapshots.delete_all(&summary).await.unwrap();

    assert!(engine.snapshots.list_versions(&summary).await.unwrap().is_empty());
    assert_eq!(
        engine.snapshots.list_versions(&audit).await.unwrap(),
        BTreeSet::from([5])
    );
}

#[tokio::test]
async fn delete_all_continues_past_individual_failures() {
    // Given: Three versions and a store that fails the first delete permanently
    let store = Arc::new(InMemoryDocumentStore::new().with_chaos(ChaosConfig::deterministic()));
    let engine = Engine::new(Arc::clone(&store), &fast_config());
    let stream = snapshot_stream("sweep");
    write_versions(&engine, &stream, &[1, 2, 3]).await;
    store.fail_next(
        StoreOperation::Delete,
        1,
        Fault::Error(StoreError::Backend("disk on fire".to_string())),
    );

    // When: Sweeping every version
    let report = engine.snapshots.delete_all(&stream).await.unwrap();

    // Then: The failure is reported and the remaining versions are still deleted
    assert_eq!(report.deleted, vec![2, 3]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].version, 1);
    assert_eq!(
        engine.snapshots.list_versions(&stream).await.unwrap(),
        BTreeSet::from([1])
    );
}

#[tokio::test]
async fn deleting_a_missing_version_succeeds() {
    let engine = memory_engine(&Default::default());
    let stream = snapshot_stream("missing");

    engine
        .snapshots
        .delete(&SnapshotKey::new(stream, 9))
        .await
        .unwrap();
}
