//! Versioned snapshots of state derived from a brook.
//!
//! Each snapshot stream has its own partition with one document per
//! version, keyed by the decimal version. Versions need not be dense.
//! [`SnapshotRepository::prune`] keeps the versions selected by a set of
//! retention moduli plus the newest version.

use crate::config::BrookStorageConfig;
use crate::document::{Document, DocumentKind, DocumentQuery, DocumentStore};
use crate::errors::{BrookError, BrookResult, Operation};
use crate::paging::query_documents;
use crate::repository::{decode, encode};
use crate::retry::RetryPolicy;
use crate::types::{SnapshotKey, SnapshotStreamKey};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Serialized snapshot state plus its content metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    /// Serialized state.
    pub data: Vec<u8>,
    /// MIME type of `data`.
    pub data_content_type: String,
    /// Denormalized length of `data`.
    pub data_size_bytes: u64,
    /// Identifies the reducer logic that produced the state, if tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer_hash: Option<String>,
}

impl SnapshotEnvelope {
    /// Wraps a payload, deriving its size.
    pub fn new(data: Vec<u8>, data_content_type: impl Into<String>) -> Self {
        let data_size_bytes = u64::try_from(data.len()).unwrap_or(u64::MAX);
        Self {
            data,
            data_content_type: data_content_type.into(),
            data_size_bytes,
            reducer_hash: None,
        }
    }

    /// Serializes `state` as JSON.
    pub fn json<T: Serialize>(state: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(state)?, "application/json"))
    }

    /// Records the reducer hash.
    #[must_use]
    pub fn with_reducer_hash(mut self, reducer_hash: impl Into<String>) -> Self {
        self.reducer_hash = Some(reducer_hash.into());
        self
    }
}

/// A snapshot version whose delete failed during a sweep.
#[derive(Debug)]
pub struct DeleteFailure {
    /// The version that could not be deleted.
    pub version: u64,
    /// Why.
    pub error: BrookError,
}

/// Outcome of [`SnapshotRepository::delete_all`].
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Versions removed.
    pub deleted: Vec<u64>,
    /// Versions whose delete failed; the sweep continued past them.
    pub failed: Vec<DeleteFailure>,
}

/// Outcome of [`SnapshotRepository::prune`].
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Versions kept by the retention rule.
    pub retained: BTreeSet<u64>,
    /// Versions removed.
    pub deleted: Vec<u64>,
    /// Versions whose delete failed.
    pub failed: Vec<DeleteFailure>,
}

/// Versions that survive pruning.
///
/// A version is retained when any nonzero modulus divides it. The highest
/// version is always retained. Modulus `0` selects nothing.
pub fn retained_versions(versions: &BTreeSet<u64>, retain_moduli: &[u64]) -> BTreeSet<u64> {
    let Some(&max_version) = versions.last() else {
        return BTreeSet::new();
    };

    let moduli: Vec<u64> = retain_moduli.iter().copied().filter(|&m| m != 0).collect();
    versions
        .iter()
        .copied()
        .filter(|version| moduli.iter().any(|modulus| version % modulus == 0))
        .chain(std::iter::once(max_version))
        .collect()
}

/// Keyed storage of snapshot versions.
pub struct SnapshotRepository<S: ?Sized> {
    store: Arc<S>,
    retry: RetryPolicy,
    page_size: usize,
}

impl<S: ?Sized> Clone for SnapshotRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
            page_size: self.page_size,
        }
    }
}

impl<S> SnapshotRepository<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    /// Creates a repository over `store`.
    pub fn new(store: Arc<S>, config: &BrookStorageConfig) -> Self {
        Self {
            store,
            retry: config.retry_policy(),
            page_size: config.page_size(),
        }
    }

    /// Stores `envelope` as `key`, replacing any previous content.
    #[instrument(name = "snapshot.write", skip(self, envelope), fields(snapshot = %key))]
    pub async fn write(&self, key: &SnapshotKey, envelope: &SnapshotEnvelope) -> BrookResult<()> {
        let id = key.version().to_string();
        let sequence = i64::try_from(key.version()).map_err(|_| BrookError::Serialization {
            id: id.clone(),
            detail: "snapshot version exceeds the storable range".to_string(),
        })?;
        let document = Document::new(
            id.clone(),
            DocumentKind::Snapshot,
            Some(sequence),
            encode(&id, envelope)?,
        );

        let partition = key.stream().partition_key();
        self.retry
            .execute(Operation::WriteSnapshot, || {
                let store = Arc::clone(&self.store);
                let document = document.clone();
                let partition = partition.as_str();
                async move { store.upsert(partition, document).await }
            })
            .await?;

        debug!(
            snapshot = %key,
            size = envelope.data_size_bytes,
            "[snapshot.write] snapshot stored"
        );
        Ok(())
    }

    /// Reads one snapshot version.
    #[instrument(name = "snapshot.read", skip(self), fields(snapshot = %key))]
    pub async fn read(&self, key: &SnapshotKey) -> BrookResult<Option<SnapshotEnvelope>> {
        let partition = key.stream().partition_key();
        let id = key.version().to_string();
        let document = self
            .retry
            .execute(Operation::ReadSnapshot, || {
                let store = Arc::clone(&self.store);
                let (partition, id) = (partition.as_str(), id.as_str());
                async move { store.read(partition, id).await }
            })
            .await?;

        document
            .filter(|document| document.kind == DocumentKind::Snapshot)
            .map(|document| decode(&partition, &document))
            .transpose()
    }

    /// Deletes one snapshot version; a missing version is not an error.
    #[instrument(name = "snapshot.delete", skip(self), fields(snapshot = %key))]
    pub async fn delete(&self, key: &SnapshotKey) -> BrookResult<()> {
        self.delete_version(&key.stream().partition_key(), key.version())
            .await
            .map(|_| ())
    }

    /// Versions stored for `stream`, ascending.
    #[instrument(name = "snapshot.list_versions", skip(self), fields(stream = %stream))]
    pub async fn list_versions(&self, stream: &SnapshotStreamKey) -> BrookResult<BTreeSet<u64>> {
        let query = DocumentQuery::all(stream.partition_key(), DocumentKind::Snapshot);
        query_documents(
            Arc::clone(&self.store),
            self.retry.clone(),
            query,
            self.page_size,
            Operation::QuerySnapshots,
        )
        .try_filter_map(|document| async move {
            Ok(document
                .sequence
                .and_then(|sequence| u64::try_from(sequence).ok())
                .or_else(|| document.id.parse().ok()))
        })
        .try_collect()
        .await
    }

    /// Deletes every version of `stream`.
    ///
    /// Individual delete failures are collected and do not stop the sweep.
    #[instrument(name = "snapshot.delete_all", skip(self), fields(stream = %stream))]
    pub async fn delete_all(&self, stream: &SnapshotStreamKey) -> BrookResult<SweepReport> {
        let versions = self.list_versions(stream).await?;
        let (deleted, failed) = self.delete_versions(stream, versions).await;

        info!(
            stream = %stream,
            deleted = deleted.len(),
            failed = failed.len(),
            "[snapshot.delete_all] sweep finished"
        );
        Ok(SweepReport { deleted, failed })
    }

    /// Deletes every version not selected by `retain_moduli`, keeping the newest.
    #[instrument(name = "snapshot.prune", skip(self), fields(stream = %stream))]
    pub async fn prune(
        &self,
        stream: &SnapshotStreamKey,
        retain_moduli: &[u64],
    ) -> BrookResult<PruneReport> {
        let versions = self.list_versions(stream).await?;
        if versions.is_empty() {
            debug!(stream = %stream, "[snapshot.prune] no snapshots to prune");
            return Ok(PruneReport::default());
        }

        let retained = retained_versions(&versions, retain_moduli);
        let doomed: BTreeSet<u64> = versions.difference(&retained).copied().collect();
        let (deleted, failed) = self.delete_versions(stream, doomed).await;

        info!(
            stream = %stream,
            retained = retained.len(),
            deleted = deleted.len(),
            failed = failed.len(),
            "[snapshot.prune] pruning finished"
        );
        Ok(PruneReport {
            retained,
            deleted,
            failed,
        })
    }

    async fn delete_versions(
        &self,
        stream: &SnapshotStreamKey,
        versions: BTreeSet<u64>,
    ) -> (Vec<u64>, Vec<DeleteFailure>) {
        let partition = stream.partition_key();
        let mut deleted = Vec::new();
        let mut failed = Vec::new();

        for version in versions {
            match self.delete_version(&partition, version).await {
                Ok(_) => deleted.push(version),
                Err(error) => {
                    warn!(
                        stream = %stream,
                        version,
                        error = %error,
                        "[snapshot.delete_versions] failed to delete snapshot, continuing"
                    );
                    failed.push(DeleteFailure { version, error });
                }
            }
        }

        (deleted, failed)
    }

    async fn delete_version(&self, partition: &str, version: u64) -> BrookResult<bool> {
        let id = version.to_string();
        self.retry
            .execute(Operation::DeleteSnapshot, || {
                let store = Arc::clone(&self.store);
                let id = id.as_str();
                async move { store.delete(partition, id).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(values: &[u64]) -> BTreeSet<u64> {
        values.iter().copied().collect()
    }

    #[test]
    fn retains_multiples_and_the_newest_version() {
        let retained = retained_versions(&set(&[1, 2, 3, 4, 5, 6, 10]), &[2, 0]);

        assert_eq!(retained, set(&[2, 4, 6, 10]));
    }

    #[test]
    fn newest_version_survives_without_matching_modulus() {
        let retained = retained_versions(&set(&[3, 5, 7]), &[2]);

        assert_eq!(retained, set(&[7]));
    }

    #[test]
    fn zero_modulus_alone_keeps_only_the_newest() {
        assert_eq!(retained_versions(&set(&[1, 2, 3]), &[0]), set(&[3]));
    }

    #[test]
    fn no_versions_retains_nothing() {
        assert!(retained_versions(&BTreeSet::new(), &[1]).is_empty());
    }

    #[test]
    fn envelope_derives_payload_size() {
        let envelope =
            SnapshotEnvelope::new(vec![0; 12], "application/octet-stream").with_reducer_hash("abc");

        assert_eq!(envelope.data_size_bytes, 12);
        assert_eq!(envelope.reducer_hash.as_deref(), Some("abc"));
    }

    proptest! {
        #[test]
        fn retained_set_is_a_subset_holding_the_max(
            versions in proptest::collection::btree_set(0u64..1_000, 1..50),
            moduli in proptest::collection::vec(0u64..20, 0..4),
        ) {
            let retained = retained_versions(&versions, &moduli);

            prop_assert!(retained.is_subset(&versions));
            prop_assert!(retained.contains(versions.last().unwrap()));
            for version in &versions {
                let selected = moduli.iter().any(|&m| m != 0 && version % m == 0);
                if selected {
                    prop_assert!(retained.contains(version));
                }
            }
        }
    }
}
