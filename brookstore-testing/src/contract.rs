use brookstore::{
    BatchOperation, Document, DocumentKind, DocumentQuery, DocumentStore, ItemStatus, StoreError,
};
use serde_json::json;
use std::fmt;
use uuid::Uuid;

#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_partition(scenario: &'static str, label: &str) -> String {
    // Include UUID for parallel test execution against shared database
    format!("contract|{scenario}-{label}|{}", Uuid::now_v7())
}

fn event_document(sequence: i64) -> Document {
    Document::new(
        sequence.to_string(),
        DocumentKind::Event,
        Some(sequence),
        json!({ "sequence": sequence }),
    )
}

fn ensure(
    scenario: &'static str,
    condition: bool,
    detail: impl Into<String>,
) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(scenario, detail))
    }
}

pub async fn test_point_read_write<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "point_read_write";

    let store = make_store();
    let partition = contract_partition(SCENARIO, "single");

    let missing = store
        .read(&partition, "0")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?;
    ensure(SCENARIO, missing.is_none(), "read of a missing document returned a value")?;

    store
        .create(&partition, event_document(0))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "create", error))?;

    let stored = store
        .read(&partition, "0")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?
        .ok_or_else(|| {
            ContractTestFailure::assertion(SCENARIO, "created document was not readable")
        })?;

    ensure(SCENARIO, stored.etag.is_some(), "stored document carries no etag")?;
    ensure(
        SCENARIO,
        stored.body == json!({ "sequence": 0 }) && stored.sequence == Some(0),
        format!("stored document differs from the written one: {stored:?}"),
    )
}

pub async fn test_create_conflicts<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "create_conflicts";

    let store = make_store();
    let partition = contract_partition(SCENARIO, "shared");

    store
        .create(&partition, event_document(0))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "create", error))?;

    match store.create(&partition, event_document(0)).await {
        Err(StoreError::Conflict { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(SCENARIO, "create", error)),
        Ok(()) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected conflict but second create succeeded",
        )),
    }
}

pub async fn test_delete_reports_existence<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "delete_reports_existence";

    let store = make_store();
    let partition = contract_partition(SCENARIO, "single");

    store
        .upsert(&partition, event_document(3))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "upsert", error))?;

    let first = store
        .delete(&partition, "3")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;
    let second = store
        .delete(&partition, "3")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;

    ensure(
        SCENARIO,
        first && !second,
        format!("expected delete to report true then false, observed {first} then {second}"),
    )
}

pub async fn test_query_orders_and_pages<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "query_orders_and_pages";

    let store = make_store();
    let partition = contract_partition(SCENARIO, "paged");

    // Written out of order so ordering cannot come from insertion.
    for sequence in (0..25).rev() {
        store
            .upsert(&partition, event_document(sequence))
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "upsert", error))?;
    }
    store
        .upsert(
            &partition,
            Document::new("cursor", DocumentKind::Cursor, None, json!({ "position": 24 })),
        )
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "upsert", error))?;

    let query =
        DocumentQuery::all(partition.clone(), DocumentKind::Event).with_sequence_range(3, 21);
    let mut continuation = None;
    let mut sequences = Vec::new();
    let mut pages = 0;
    loop {
        let page = store
            .query_page(&query, continuation, 7)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "query_page", error))?;
        pages += 1;
        ensure(
            SCENARIO,
            page.documents.len() <= 7,
            format!("page exceeded requested size: {}", page.documents.len()),
        )?;
        sequences.extend(page.documents.iter().filter_map(|document| document.sequence));
        continuation = page.continuation;
        if continuation.is_none() || pages > 10 {
            break;
        }
    }

    ensure(
        SCENARIO,
        sequences == (3..=21).collect::<Vec<_>>(),
        format!("expected sequences 3..=21 in order, observed {sequences:?}"),
    )
}

pub async fn test_missing_partition_queries<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "missing_partition_queries";

    let store = make_store();
    let query = DocumentQuery::all(contract_partition(SCENARIO, "absent"), DocumentKind::Snapshot);

    let page = store
        .query_page(&query, None, 10)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "query_page", error))?;

    ensure(
        SCENARIO,
        page.documents.is_empty() && page.continuation.is_none(),
        "query over a missing partition returned documents",
    )
}

pub async fn test_batch_is_atomic<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "batch_is_atomic";

    let store = make_store();
    let partition = contract_partition(SCENARIO, "shared");

    store
        .create(&partition, event_document(2))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "create", error))?;

    let operations = vec![
        BatchOperation::Create(event_document(1)),
        BatchOperation::Create(event_document(2)),
        BatchOperation::Create(event_document(3)),
    ];
    let response = store
        .execute_batch(&partition, operations)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "execute_batch", error))?;

    ensure(SCENARIO, !response.is_success(), "conflicting batch reported success")?;
    ensure(
        SCENARIO,
        response.outcomes.len() == 3,
        format!("expected one outcome per operation, observed {}", response.outcomes.len()),
    )?;
    ensure(
        SCENARIO,
        response
            .first_failure()
            .is_some_and(|outcome| outcome.id == "2" && outcome.status == ItemStatus::Conflict),
        format!("expected document '2' to be reported as the conflict: {:?}", response.outcomes),
    )?;

    for id in ["1", "3"] {
        let leaked = store
            .read(&partition, id)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?;
        ensure(
            SCENARIO,
            leaked.is_none(),
            format!("document '{id}' from a failed batch was persisted"),
        )?;
    }

    Ok(())
}

pub async fn test_replace_honours_etag<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "replace_honours_etag";

    let store = make_store();
    let partition = contract_partition(SCENARIO, "cursor");
    let cursor = |position: i64| {
        Document::new("cursor", DocumentKind::Cursor, None, json!({ "position": position }))
    };

    store
        .create(&partition, cursor(0))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "create", error))?;
    let original = store
        .read(&partition, "cursor")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?
        .and_then(|document| document.etag)
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "cursor has no etag"))?;

    let first = store
        .execute_batch(
            &partition,
            vec![BatchOperation::Replace {
                document: cursor(1),
                if_match: Some(original.clone()),
            }],
        )
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "execute_batch", error))?;
    ensure(SCENARIO, first.is_success(), "replace with the current etag failed")?;

    let stale = store
        .execute_batch(
            &partition,
            vec![BatchOperation::Replace {
                document: cursor(2),
                if_match: Some(original),
            }],
        )
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "execute_batch", error))?;
    ensure(
        SCENARIO,
        stale
            .first_failure()
            .is_some_and(|outcome| outcome.status == ItemStatus::PreconditionFailed),
        format!("replace with a stale etag was not rejected: {:?}", stale.status),
    )
}

pub async fn test_partition_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: DocumentStore + 'static,
{
    const SCENARIO: &str = "partition_isolation";

    let store = make_store();
    let left = contract_partition(SCENARIO, "left");
    let right = contract_partition(SCENARIO, "right");

    store
        .create(&left, event_document(0))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "create", error))?;
    store
        .create(&right, event_document(0))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "create", error))?;

    let deleted = store
        .delete(&left, "0")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;
    let survivor = store
        .read(&right, "0")
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?;

    ensure(
        SCENARIO,
        deleted && survivor.is_some(),
        "deleting from one partition affected another",
    )
}

#[macro_export]
macro_rules! document_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_batch_is_atomic, test_create_conflicts, test_delete_reports_existence,
                test_missing_partition_queries, test_partition_isolation, test_point_read_write,
                test_query_orders_and_pages, test_replace_honours_etag,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn point_read_write_contract() {
                test_point_read_write($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn create_conflicts_contract() {
                test_create_conflicts($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn delete_reports_existence_contract() {
                test_delete_reports_existence($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn query_orders_and_pages_contract() {
                test_query_orders_and_pages($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_partition_queries_contract() {
                test_missing_partition_queries($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn batch_is_atomic_contract() {
                test_batch_is_atomic($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn replace_honours_etag_contract() {
                test_replace_honours_etag($make_store)
                    .await
                    .expect("document store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn partition_isolation_contract() {
                test_partition_isolation($make_store)
                    .await
                    .expect("document store contract failed");
            }
        }
    };
}

pub use document_store_contract_tests;
