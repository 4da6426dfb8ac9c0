//! PostgreSQL document store for `brookstore`
//!
//! Every document lives in one `brook_documents` table keyed by
//! `(partition_key, id)`, with a JSONB body, an optional numeric `sequence`
//! used for ordered range queries, and a database-assigned etag. Batches run
//! inside a single transaction.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use brookstore::{
    BatchItemOutcome, BatchOperation, BatchResponse, BatchStatus, Document, DocumentKind,
    DocumentPage, DocumentQuery, DocumentStore, ETag, ItemStatus, StoreError, StoreResult,
};
use nutype::nutype;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

/// Errors raised while setting up the store.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema could not be created.
    #[error("failed to apply brook_documents schema")]
    MigrationFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// MaxConnections represents the connection pool size limit. It must be at least 1,
/// enforced by using NonZeroU32 as the underlying type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Configuration for PostgresDocumentStore.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Maximum number of operations accepted in one batch (default: 100)
    pub max_batch_operations: usize,
    /// Maximum encoded size of one batch (default: 2 MiB)
    pub max_batch_bytes: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            max_batch_operations: 100,
            max_batch_bytes: 2 * 1024 * 1024,
        }
    }
}

const SCHEMA: [&str; 3] = [
    "CREATE SEQUENCE IF NOT EXISTS brook_documents_etag_seq",
    r"
    CREATE TABLE IF NOT EXISTS brook_documents (
        partition_key TEXT NOT NULL,
        id TEXT NOT NULL,
        kind TEXT NOT NULL,
        sequence BIGINT,
        body JSONB NOT NULL,
        etag BIGINT NOT NULL DEFAULT nextval('brook_documents_etag_seq'),
        PRIMARY KEY (partition_key, id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS brook_documents_ordered_idx
        ON brook_documents (partition_key, kind, (COALESCE(sequence, -9223372036854775808)), id)
    ",
];

const UPSERT: &str = r"
    INSERT INTO brook_documents (partition_key, id, kind, sequence, body)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (partition_key, id) DO UPDATE
    SET kind = EXCLUDED.kind,
        sequence = EXCLUDED.sequence,
        body = EXCLUDED.body,
        etag = nextval('brook_documents_etag_seq')
";

const INSERT: &str = r"
    INSERT INTO brook_documents (partition_key, id, kind, sequence, body)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (partition_key, id) DO NOTHING
";

/// PostgreSQL-backed [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Pool<Postgres>,
    config: PostgresConfig,
}

impl PostgresDocumentStore {
    /// Create a new PostgresDocumentStore with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new PostgresDocumentStore with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        Ok(Self { pool, config })
    }

    /// Create a store from an existing connection pool.
    ///
    /// Use this when you need full control over pool configuration or want to
    /// share a pool across multiple components.
    pub fn from_pool(pool: Pool<Postgres>, config: PostgresConfig) -> Self {
        Self { pool, config }
    }

    /// Creates the table, index and etag sequence if they do not exist.
    #[instrument(name = "postgres.migrate", skip(self))]
    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        for statement in SCHEMA {
            query(statement)
                .execute(&self.pool)
                .await
                .map_err(PostgresStoreError::MigrationFailed)?;
        }
        Ok(())
    }

    /// Checks connectivity.
    pub async fn ping(&self) -> StoreResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|error| map_sqlx_error(error, "ping", None))
    }

    async fn apply(
        transaction: &mut Transaction<'_, Postgres>,
        partition_key: &str,
        operation: &BatchOperation,
    ) -> StoreResult<ItemStatus> {
        let id = operation.id();
        let status = match operation {
            BatchOperation::Create(document) => {
                let inserted = bind_document(query(INSERT), partition_key, document)
                    .execute(&mut **transaction)
                    .await
                    .map_err(|error| map_sqlx_error(error, "execute_batch", Some(id)))?;
                if inserted.rows_affected() == 0 {
                    ItemStatus::Conflict
                } else {
                    ItemStatus::Ok
                }
            }
            BatchOperation::Upsert(document) => {
                let _ = bind_document(query(UPSERT), partition_key, document)
                    .execute(&mut **transaction)
                    .await
                    .map_err(|error| map_sqlx_error(error, "execute_batch", Some(id)))?;
                ItemStatus::Ok
            }
            BatchOperation::Replace { document, if_match } => {
                let current: Option<i64> = query(
                    "SELECT etag FROM brook_documents WHERE partition_key = $1 AND id = $2 FOR UPDATE",
                )
                .bind(partition_key)
                .bind(id)
                .fetch_optional(&mut **transaction)
                .await
                .map_err(|error| map_sqlx_error(error, "execute_batch", Some(id)))?
                .map(|row| row.try_get("etag"))
                .transpose()
                .map_err(|error| map_sqlx_error(error, "execute_batch", Some(id)))?;

                match current {
                    None => ItemStatus::NotFound,
                    Some(etag)
                        if if_match
                            .as_ref()
                            .is_some_and(|tag| tag.as_str().parse::<i64>().ok() != Some(etag)) =>
                    {
                        ItemStatus::PreconditionFailed
                    }
                    Some(_) => {
                        let _ = bind_document(query(UPSERT), partition_key, document)
                            .execute(&mut **transaction)
                            .await
                            .map_err(|error| map_sqlx_error(error, "execute_batch", Some(id)))?;
                        ItemStatus::Ok
                    }
                }
            }
            BatchOperation::Delete { .. } => {
                let deleted = query(
                    "DELETE FROM brook_documents WHERE partition_key = $1 AND id = $2",
                )
                    .bind(partition_key)
                    .bind(id)
                    .execute(&mut **transaction)
                    .await
                    .map_err(|error| map_sqlx_error(error, "execute_batch", Some(id)))?;
                if deleted.rows_affected() == 0 {
                    ItemStatus::NotFound
                } else {
                    ItemStatus::Ok
                }
            }
        };
        Ok(status)
    }
}

fn bind_document<'q>(
    statement: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    partition_key: &'q str,
    document: &'q Document,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    statement
        .bind(partition_key)
        .bind(document.id.as_str())
        .bind(document.kind.as_str())
        .bind(document.sequence)
        .bind(Json(&document.body))
}

fn row_to_document(row: &PgRow) -> StoreResult<Document> {
    let decode = |error: sqlx::Error| map_sqlx_error(error, "decode_row", None);
    let kind: String = row.try_get("kind").map_err(decode)?;
    let body: Json<Value> = row.try_get("body").map_err(decode)?;
    let etag: i64 = row.try_get("etag").map_err(decode)?;

    Ok(Document {
        id: row.try_get("id").map_err(decode)?,
        kind: kind.parse::<DocumentKind>()?,
        sequence: row.try_get("sequence").map_err(decode)?,
        body: body.0,
        etag: Some(ETag::new(etag.to_string())),
    })
}

fn decode_continuation(token: &str) -> StoreResult<(i64, String)> {
    token
        .split_once(':')
        .and_then(|(sequence, id)| Some((sequence.parse().ok()?, id.to_string())))
        .ok_or_else(|| StoreError::Backend(format!("invalid continuation token '{token}'")))
}

fn failed_response(operations: &[BatchOperation], status: BatchStatus) -> BatchResponse {
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
impl DocumentStore for PostgresDocumentStore {
    #[instrument(name = "postgres.read", skip(self))]
    async fn read(&self, partition_key: &str, id: &str) -> StoreResult<Option<Document>> {
        let row = query(
            "SELECT id, kind, sequence, body, etag FROM brook_documents WHERE partition_key = $1 AND id = $2",
        )
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "read", Some(id)))?;

        row.as_ref().map(row_to_document).transpose()
    }

    #[instrument(name = "postgres.create", skip(self, document), fields(id = %document.id))]
    async fn create(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        let inserted = bind_document(query(INSERT), partition_key, &document)
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, "create", Some(&document.id)))?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Conflict { id: document.id });
        }
        Ok(())
    }

    #[instrument(name = "postgres.upsert", skip(self, document), fields(id = %document.id))]
    async fn upsert(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        bind_document(query(UPSERT), partition_key, &document)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|error| map_sqlx_error(error, "upsert", Some(&document.id)))
    }

    #[instrument(name = "postgres.delete", skip(self))]
    async fn delete(&self, partition_key: &str, id: &str) -> StoreResult<bool> {
        let deleted = query("DELETE FROM brook_documents WHERE partition_key = $1 AND id = $2")
            .bind(partition_key)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, "delete", Some(id)))?;
        Ok(deleted.rows_affected() > 0)
    }

    #[instrument(
        name = "postgres.query_page",
        skip(self, request),
        fields(partition = %request.partition_key, kind = %request.kind)
    )]
    async fn query_page(
        &self,
        request: &DocumentQuery,
        continuation: Option<String>,
        page_size: usize,
    ) -> StoreResult<DocumentPage> {
        let after = continuation.as_deref().map(decode_continuation).transpose()?;
        let (range_from, range_to) = request
            .sequence_range
            .as_ref()
            .map_or((None, None), |range| (Some(*range.start()), Some(*range.end())));
        let page_size = page_size.max(1);
        let limit = i64::try_from(page_size).unwrap_or(i64::MAX).saturating_add(1);

        let rows = query(
            r"
            SELECT id, kind, sequence, body, etag
            FROM brook_documents
            WHERE partition_key = $1
              AND kind = $2
              AND ($3::BIGINT IS NULL OR sequence >= $3)
              AND ($4::BIGINT IS NULL OR sequence <= $4)
              AND ($5::BIGINT IS NULL
                   OR (COALESCE(sequence, -9223372036854775808), id) > ($5, $6::TEXT))
            ORDER BY COALESCE(sequence, -9223372036854775808), id
            LIMIT $7
            ",
        )
        .bind(request.partition_key.as_str())
        .bind(request.kind.as_str())
        .bind(range_from)
        .bind(range_to)
        .bind(after.as_ref().map(|(sequence, _)| *sequence))
        .bind(after.as_ref().map(|(_, id)| id.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "query_page", None))?;

        let has_more = rows.len() > page_size;
        let documents = rows
            .iter()
            .take(page_size)
            .map(row_to_document)
            .collect::<StoreResult<Vec<_>>>()?;

        let continuation = if has_more {
            documents.last().map(|document| {
                format!("{}:{}", document.sequence.unwrap_or(i64::MIN), document.id)
            })
        } else {
            None
        };

        debug!(
            partition = %request.partition_key,
            documents = documents.len(),
            has_more,
            "[postgres.query_page] page fetched"
        );
        Ok(DocumentPage {
            documents,
            continuation,
        })
    }

    #[instrument(
        name = "postgres.execute_batch",
        skip(self, operations),
        fields(count = operations.len())
    )]
    async fn execute_batch(
        &self,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StoreResult<BatchResponse> {
        let size_bytes: usize = operations.iter().map(BatchOperation::encoded_len).sum();
        if operations.len() > self.config.max_batch_operations
            || size_bytes > self.config.max_batch_bytes
        {
            warn!(
                partition = partition_key,
                operations = operations.len(),
                size_bytes,
                "[postgres.execute_batch] batch exceeds configured limits"
            );
            return Ok(failed_response(&operations, BatchStatus::TooLarge));
        }

        let mut transaction = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, "begin", None))?;

        for (index, operation) in operations.iter().enumerate() {
            let status = Self::apply(&mut transaction, partition_key, operation).await?;
            if status != ItemStatus::Ok {
                transaction
                    .rollback()
                    .await
                    .map_err(|error| map_sqlx_error(error, "rollback", None))?;
                debug!(
                    partition = partition_key,
                    id = operation.id(),
                    status = ?status,
                    "[postgres.execute_batch] batch rolled back"
                );
                let mut response = failed_response(
                    &operations,
                    BatchStatus::Failed {
                        reason: format!("operation on '{}' failed: {status:?}", operation.id()),
                    },
                );
                response.outcomes[index].status = status;
                return Ok(response);
            }
        }

        transaction
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, "commit", None))?;

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

fn map_sqlx_error(error: sqlx::Error, operation: &'static str, id: Option<&str>) -> StoreError {
    match &error {
        sqlx::Error::Database(db_error) => {
            match db_error.code().as_deref() {
                // 23505: unique constraint violation
                Some("23505") => {
                    warn!(
                        error = %db_error,
                        operation,
                        "[postgres.conflict] document already exists"
                    );
                    return StoreError::Conflict {
                        id: id.unwrap_or_default().to_string(),
                    };
                }
                // 40001: serialization failure, 40P01: deadlock detected
                Some("40001" | "40P01") => {
                    warn!(
                        error = %db_error,
                        operation,
                        "[postgres.contention] transaction aborted, retryable"
                    );
                    return StoreError::Throttled { retry_after: None };
                }
                // 53300: too many connections, 57P03: cannot connect now
                Some("53300" | "57P03") => {
                    warn!(error = %db_error, operation, "[postgres.unavailable] server busy");
                    return StoreError::ServiceUnavailable(db_error.to_string());
                }
                // 54000: program limit exceeded (e.g. row too large)
                Some("54000") => {
                    return StoreError::PayloadTooLarge { size_bytes: 0 };
                }
                _ => {}
            }
        }
        sqlx::Error::PoolTimedOut => return StoreError::Timeout,
        sqlx::Error::Io(io_error) => return StoreError::ServiceUnavailable(io_error.to_string()),
        _ => {}
    }

    error!(
        error = %error,
        operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::Backend(error.to_string())
}
