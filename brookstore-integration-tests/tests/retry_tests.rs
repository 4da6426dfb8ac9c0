//! Retry behaviour of engine calls against a misbehaving store.

use std::sync::Arc;
use std::time::Duration;

use brookstore::{BatchStatus, BrookError, ExpectedCursor, Operation, Position, StoreError};
use brookstore_integration_tests::{fast_config, sample_events, stream_key, Engine};
use brookstore_memory::{InMemoryDocumentStore, MemoryStoreLimits};
use brookstore_testing::{ChaosConfig, ChaosDocumentStoreExt, Fault, StoreOperation};

#[tokio::test]
async fn throttled_batch_is_retried_until_it_commits() {
    // Given: A store that throttles the first transactional batch
    let store = Arc::new(InMemoryDocumentStore::new().with_chaos(ChaosConfig::deterministic()));
    let engine = Engine::new(Arc::clone(&store), &fast_config());
    let key = stream_key("throttled");
    store.fail_next(
        StoreOperation::ExecuteBatch,
        1,
        Fault::BatchStatus(BatchStatus::Throttled {
            retry_after: Some(Duration::from_millis(2)),
        }),
    );

    // When: Appending
    let outcome = engine
        .writer
        .append(&key, &sample_events(3), ExpectedCursor::Empty)
        .await
        .unwrap();

    // Then: The second attempt commits the batch
    assert_eq!(outcome.last, Position::new(2));
    assert_eq!(store.calls(StoreOperation::ExecuteBatch), 2);
}

#[tokio::test]
async fn oversized_batch_fails_without_retrying() {
    let limits = MemoryStoreLimits {
        max_batch_operations: 5,
        ..MemoryStoreLimits::default()
    };
    let store = Arc::new(
        InMemoryDocumentStore::with_limits(limits).with_chaos(ChaosConfig::deterministic()),
    );
    let engine = Engine::new(Arc::clone(&store), &fast_config());
    let key = stream_key("oversized");

    let error = engine
        .writer
        .append(&key, &sample_events(10), ExpectedCursor::Empty)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        BrookError::BatchTooLarge { event_count: 10, .. }
    ));
    assert!(error.is_fatal_configuration());
    assert_eq!(store.calls(StoreOperation::ExecuteBatch), 1);

    // A smaller batch goes through once the abandoned marker is rolled back.
    let outcome = engine
        .writer
        .append(&key, &sample_events(3), ExpectedCursor::Empty)
        .await
        .unwrap();
    assert_eq!(outcome.last, Position::new(2));
}

#[tokio::test]
async fn transient_read_failures_are_absorbed() {
    let store = Arc::new(InMemoryDocumentStore::new().with_chaos(ChaosConfig::deterministic()));
    let engine = Engine::new(Arc::clone(&store), &fast_config());
    let key = stream_key("flaky-read");
    store.fail_next(
        StoreOperation::Read,
        2,
        Fault::Error(StoreError::ServiceUnavailable("failover".to_string())),
    );

    assert_eq!(engine.repository.get_cursor(&key).await.unwrap(), None);
    assert_eq!(store.calls(StoreOperation::Read), 3);
}

#[tokio::test]
async fn persistent_throttling_exhausts_the_budget() {
    let store = Arc::new(InMemoryDocumentStore::new().with_chaos(ChaosConfig::deterministic()));
    let engine = Engine::new(Arc::clone(&store), &fast_config().with_max_retry_attempts(3));
    let key = stream_key("throttled-read");
    store.fail_next(
        StoreOperation::Read,
        10,
        Fault::Error(StoreError::Throttled { retry_after: None }),
    );

    let error = engine.repository.get_cursor(&key).await.unwrap_err();

    assert!(matches!(
        error,
        BrookError::RetryExhausted {
            operation: Operation::ReadCursor,
            attempts: 3,
            last_error: Some(StoreError::Throttled { .. }),
        }
    ));
    assert_eq!(store.calls(StoreOperation::Read), 3);
}

#[tokio::test]
async fn nonpositive_attempt_budget_makes_no_calls() {
    let store = Arc::new(InMemoryDocumentStore::new().with_chaos(ChaosConfig::deterministic()));
    let engine = Engine::new(Arc::clone(&store), &fast_config().with_max_retry_attempts(-1));
    let key = stream_key("no-attempts");

    let error = engine.repository.get_cursor(&key).await.unwrap_err();

    assert!(matches!(
        error,
        BrookError::RetryExhausted {
            attempts: 0,
            last_error: None,
            ..
        }
    ));
    assert_eq!(store.calls(StoreOperation::Read), 0);
}

#[tokio::test]
async fn random_throttling_never_corrupts_the_stream() {
    // Given: A store that throttles a third of all calls
    let store = Arc::new(
        InMemoryDocumentStore::new().with_chaos(
            ChaosConfig::deterministic()
                .with_throttle_probability(0.3)
                .with_throttle_retry_after(Duration::from_millis(1)),
        ),
    );
    let engine = Engine::new(Arc::clone(&store), &fast_config().with_max_retry_attempts(50));
    let key = stream_key("chaotic");

    // When: Appending several batches
    for _ in 0..5 {
        engine
            .writer
            .append(&key, &sample_events(4), ExpectedCursor::Any)
            .await
            .unwrap();
    }

    // Then: The stream holds exactly 20 contiguous events
    let events = engine
        .reader
        .read_batch(&key, None, None, brookstore::CancellationToken::new())
        .await
        .unwrap();
    let positions: Vec<u64> = events.iter().map(|e| e.position.into_inner()).collect();
    assert_eq!(positions, (0..20).collect::<Vec<_>>());
}
