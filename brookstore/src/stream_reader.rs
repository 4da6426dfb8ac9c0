//! Slice-parallel brook reads.
//!
//! A read of `[from, to]` is split into fixed-size, bucket-aligned slices
//! ([`buckets_for`]). Every bucket is bulk-loaded by its own
//! [`SliceReader`]; loads run concurrently up to the configured bound while
//! the output is reassembled strictly in bucket order.

use crate::config::{BrookStorageConfig, SliceSize};
use crate::document::DocumentStore;
use crate::errors::{BrookError, BrookResult};
use crate::event::StoredEvent;
use crate::repository::BrookRepository;
use crate::sequence::{self, cancellable, EventStream};
use crate::slice_reader::SliceReader;
use crate::types::{Position, RangeKey, StreamKey};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// One bucket of a planned read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceBucket {
    /// Natural first position of the bucket (a multiple of the slice size).
    pub bucket_start: Position,
    /// Natural size of the bucket.
    pub bucket_len: u64,
    /// First position to read, clamped to the request.
    pub from: Position,
    /// Last position to read, clamped to the request.
    pub to: Position,
}

impl SliceBucket {
    /// The full bucket of `stream` a slice reader caches.
    pub fn range(&self, stream: &StreamKey) -> RangeKey {
        RangeKey::new(stream.clone(), self.bucket_start, self.bucket_len)
    }
}

/// Splits `[start, end]` into slice-aligned buckets in ascending order.
///
/// Returns nothing when `end < start`.
pub fn buckets_for(start: Position, end: Position, slice_size: SliceSize) -> Vec<SliceBucket> {
    let size = slice_size.into_inner();
    let (start, end) = (start.into_inner(), end.into_inner());
    if end < start {
        return Vec::new();
    }

    (start / size..=end / size)
        .map(|bucket| {
            let bucket_start = bucket.saturating_mul(size);
            let bucket_end = bucket_start.saturating_add(size - 1);
            SliceBucket {
                bucket_start: Position::new(bucket_start),
                bucket_len: size,
                from: Position::new(bucket_start.max(start)),
                to: Position::new(bucket_end.min(end)),
            }
        })
        .collect()
}

/// Reads brooks through per-bucket slice readers.
pub struct StreamReader<S: ?Sized> {
    repository: BrookRepository<S>,
    slice_size: SliceSize,
    max_parallel_slices: usize,
}

impl<S: ?Sized> Clone for StreamReader<S> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            slice_size: self.slice_size,
            max_parallel_slices: self.max_parallel_slices,
        }
    }
}

impl<S> StreamReader<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    /// Creates a reader using the slicing settings of `config`.
    pub fn new(repository: BrookRepository<S>, config: &BrookStorageConfig) -> Self {
        Self {
            repository,
            slice_size: config.slice_size,
            max_parallel_slices: config.max_parallel_slices.into_inner(),
        }
    }

    /// Streams the events of `key` within `[from, to]` in position order.
    ///
    /// `from` defaults to the first position and `to` to the committed
    /// cursor; an explicit `to` past the cursor is clamped to it. An empty
    /// stream or a range entirely past the cursor yields no events.
    #[instrument(name = "stream_reader.read", skip(self, cancel), fields(stream = %key))]
    pub async fn read(
        &self,
        key: &StreamKey,
        from: Option<Position>,
        to: Option<Position>,
        cancel: CancellationToken,
    ) -> BrookResult<EventStream> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(BrookError::InvalidRange { from, to });
            }
        }

        let Some(cursor) = self.repository.get_cursor(key).await? else {
            debug!(stream = %key, "[stream_reader.read] stream is empty");
            return Ok(cancellable(sequence::empty(), cancel));
        };

        let start = from.unwrap_or_else(Position::first);
        let end = to.map_or(cursor, |to| to.min(cursor));
        let buckets = buckets_for(start, end, self.slice_size);
        debug!(
            stream = %key,
            start = %start,
            end = %end,
            buckets = buckets.len(),
            "[stream_reader.read] planned slice read"
        );

        let repository = self.repository.clone();
        let stream_key = key.clone();
        let slice_cancel = cancel.clone();
        let slices = stream::iter(buckets)
            .map(move |bucket| {
                let repository = repository.clone();
                let range = bucket.range(&stream_key);
                let cancel = slice_cancel.clone();
                async move {
                    let reader = SliceReader::load(&repository, range, cancel.clone()).await?;
                    let events = reader.read(bucket.from, bucket.to, cancel);
                    reader.evict();
                    events
                }
            })
            .buffered(self.max_parallel_slices)
            .try_flatten()
            .boxed();

        Ok(cancellable(slices, cancel))
    }

    /// Reads `[from, to]` eagerly into a vector.
    pub async fn read_batch(
        &self,
        key: &StreamKey,
        from: Option<Position>,
        to: Option<Position>,
        cancel: CancellationToken,
    ) -> BrookResult<Vec<StoredEvent>> {
        self.read(key, from, to, cancel).await?.try_collect().await
    }

    /// Streams every committed event of `key`.
    pub async fn read_all(
        &self,
        key: &StreamKey,
        cancel: CancellationToken,
    ) -> BrookResult<EventStream> {
        self.read(key, None, None, cancel).await
    }
}
