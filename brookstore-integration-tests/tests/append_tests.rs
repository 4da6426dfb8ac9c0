//! Appending to brooks through the writer.

use std::collections::BTreeSet;
use std::sync::Arc;

use brookstore::{
    BrookError, CancellationToken, ExpectedCursor, Position, PENDING_CURSOR_DOCUMENT_ID,
};
use brookstore_integration_tests::{memory_engine, sample_events, stream_key, LineAdded};
use brookstore_memory::InMemoryDocumentStore;
use futures::TryStreamExt;

#[tokio::test]
async fn developer_appends_batches_at_contiguous_positions() {
    // Given: An empty brook
    let engine = memory_engine(&Default::default());
    let key = stream_key("contiguous");

    // When: Three batches are appended one after another
    let first = engine
        .writer
        .append(&key, &sample_events(3), ExpectedCursor::Empty)
        .await
        .unwrap();
    let second = engine
        .writer
        .append(&key, &sample_events(1), ExpectedCursor::At(first.last))
        .await
        .unwrap();
    let third = engine
        .writer
        .append(&key, &sample_events(4), ExpectedCursor::Any)
        .await
        .unwrap();

    // Then: Positions continue without gaps and the cursor sits on the last event
    assert_eq!((first.first, first.last), (Position::new(0), Position::new(2)));
    assert_eq!((second.first, second.last), (Position::new(3), Position::new(3)));
    assert_eq!((third.first, third.last), (Position::new(4), Position::new(7)));
    assert_eq!(
        engine.repository.get_cursor(&key).await.unwrap(),
        Some(Position::new(7))
    );

    // And: No append is left in flight
    assert!(engine.repository.get_pending_cursor(&key).await.unwrap().is_none());
    assert!(!engine
        .store
        .document_ids(&key.partition_key())
        .contains(&PENDING_CURSOR_DOCUMENT_ID.to_string()));
}

#[tokio::test]
async fn appended_events_round_trip_unchanged() {
    let engine = memory_engine(&Default::default());
    let key = stream_key("round-trip");
    let events = sample_events(5);

    engine
        .writer
        .append(&key, &events, ExpectedCursor::Empty)
        .await
        .unwrap();

    let stored = engine
        .reader
        .read_batch(&key, None, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stored.len(), 5);
    for (index, (stored, original)) in stored.iter().zip(&events).enumerate() {
        assert_eq!(stored.position, Position::new(index as u64));
        assert_eq!(&stored.event, original);
        let payload: LineAdded = serde_json::from_slice(&stored.event.data).unwrap();
        assert_eq!(payload.line, index);
    }
}

#[tokio::test]
async fn stale_expected_cursor_is_a_conflict_and_writes_nothing() {
    let engine = memory_engine(&Default::default());
    let key = stream_key("stale");
    engine
        .writer
        .append(&key, &sample_events(2), ExpectedCursor::Empty)
        .await
        .unwrap();

    let error = engine
        .writer
        .append(&key, &sample_events(1), ExpectedCursor::At(Position::new(0)))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        BrookError::CursorConflict {
            expected: Some(expected),
            actual: Some(actual),
            ..
        } if expected == Position::new(0) && actual == Position::new(1)
    ));
    assert_eq!(
        engine.repository.get_cursor(&key).await.unwrap(),
        Some(Position::new(1))
    );
    assert!(engine.repository.get_pending_cursor(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_batches_are_rejected() {
    let engine = memory_engine(&Default::default());
    let key = stream_key("empty-batch");

    let error = engine
        .writer
        .append(&key, &[], ExpectedCursor::Any)
        .await
        .unwrap_err();

    assert!(matches!(error, BrookError::InvalidBatch(_)));
    assert_eq!(engine.store.document_count(&key.partition_key()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_to_one_stream_are_serialized() {
    // Given: One writer shared by many tasks
    let engine = Arc::new(memory_engine(&Default::default()));
    let key = stream_key("concurrent");

    // When: Eight tasks append five events each without a cursor expectation
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let key = key.clone();
            tokio::spawn(async move {
                engine
                    .writer
                    .append(&key, &sample_events(5), ExpectedCursor::Any)
                    .await
            })
        })
        .collect();

    let mut ranges = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        ranges.push((outcome.first.into_inner(), outcome.last.into_inner()));
    }

    // Then: Every append got its own disjoint block of five positions
    ranges.sort_unstable();
    let expected: Vec<(u64, u64)> = (0..8).map(|i| (i * 5, i * 5 + 4)).collect();
    assert_eq!(ranges, expected);

    let positions: BTreeSet<u64> = engine
        .reader
        .read_all(&key, CancellationToken::new())
        .await
        .unwrap()
        .map_ok(|event| event.position.into_inner())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(positions, (0..40).collect());
}

#[tokio::test]
async fn independent_streams_do_not_share_positions() {
    let engine = memory_engine(&Default::default());
    let orders = stream_key("orders");
    let invoices = stream_key("invoices");

    engine
        .writer
        .append(&orders, &sample_events(3), ExpectedCursor::Empty)
        .await
        .unwrap();
    let outcome = engine
        .writer
        .append(&invoices, &sample_events(2), ExpectedCursor::Empty)
        .await
        .unwrap();

    assert_eq!(outcome.first, Position::first());
    assert_eq!(
        engine.repository.get_cursor(&orders).await.unwrap(),
        Some(Position::new(2))
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn developer_observes_append_logs() {
    let engine = memory_engine(&Default::default());
    let key = stream_key("observed");

    engine
        .writer
        .append(&key, &sample_events(2), ExpectedCursor::Empty)
        .await
        .unwrap();

    assert!(logs_contain("writer.append"));
    assert!(logs_contain("[repository.execute_transactional_batch] batch committed"));
}

#[tokio::test]
async fn stores_without_limits_accept_large_batches() {
    let store = Arc::new(InMemoryDocumentStore::with_limits(
        brookstore_memory::MemoryStoreLimits::unlimited(),
    ));
    let engine = brookstore_integration_tests::Engine::new(store, &Default::default());
    let key = stream_key("unlimited");

    let outcome = engine
        .writer
        .append(&key, &sample_events(250), ExpectedCursor::Empty)
        .await
        .unwrap();

    assert_eq!(outcome.last, Position::new(249));
}
