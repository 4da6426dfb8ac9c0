//! One cached slice of a brook.
//!
//! A [`SliceReader`] owns a single [`RangeKey`] bucket. It bulk-reads the
//! whole bucket once when loaded and serves every later read from memory.

use crate::document::DocumentStore;
use crate::errors::{BrookError, BrookResult};
use crate::event::StoredEvent;
use crate::repository::BrookRepository;
use crate::sequence::{cancellable, EventStream};
use crate::types::{Position, RangeKey};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Immutable, position-ordered cache of one bucket.
#[derive(Debug, Clone)]
pub struct SliceReader {
    range: RangeKey,
    events: Arc<[StoredEvent]>,
}

impl SliceReader {
    /// Bulk-reads `range` from storage.
    #[instrument(name = "slice_reader.load", skip_all, fields(range = %range))]
    pub async fn load<S>(
        repository: &BrookRepository<S>,
        range: RangeKey,
        cancel: CancellationToken,
    ) -> BrookResult<Self>
    where
        S: DocumentStore + ?Sized + 'static,
    {
        let events: Vec<StoredEvent> = repository
            .query_events(&range, repository.page_size(), cancel)
            .try_collect()
            .await?;

        debug!(
            range = %range,
            cached = events.len(),
            "[slice_reader.load] slice cached"
        );
        Ok(Self::from_events(range, events))
    }

    /// Builds a reader over already loaded events; entries outside `range` are dropped.
    pub fn from_events(range: RangeKey, mut events: Vec<StoredEvent>) -> Self {
        events.retain(|event| range.contains(event.position));
        events.sort_by_key(|event| event.position);
        events.dedup_by_key(|event| event.position);
        Self {
            range,
            events: events.into(),
        }
    }

    /// The bucket this reader owns.
    pub const fn range(&self) -> &RangeKey {
        &self.range
    }

    /// Number of cached events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Streams cached events within `[min_from, max_to]`.
    ///
    /// `max_to` beyond the bucket's upper bound is a caller error and fails
    /// immediately with [`BrookError::SliceRangeExceeded`].
    pub fn read(
        &self,
        min_from: Position,
        max_to: Position,
        cancel: CancellationToken,
    ) -> BrookResult<EventStream> {
        let cached_to = self.range.end();
        if cached_to.map_or(true, |end| max_to > end) {
            return Err(BrookError::SliceRangeExceeded {
                requested: max_to,
                cached_to,
            });
        }
        if min_from > max_to {
            return Err(BrookError::InvalidRange {
                from: min_from,
                to: max_to,
            });
        }

        let events = Arc::clone(&self.events);
        let start = events.partition_point(|event| event.position < min_from);
        let selected = (start..events.len())
            .map(move |index| events[index].clone())
            .take_while(move |event| event.position <= max_to)
            .map(Ok);

        Ok(cancellable(stream::iter(selected).boxed(), cancel))
    }

    /// Drops the cache. The reader is consumed and cannot be reused.
    pub fn evict(self) {
        debug!(range = %self.range, "[slice_reader.evict] slice evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BrookEvent, EventId};
    use crate::types::StreamKey;

    fn stored(position: u64) -> StoredEvent {
        StoredEvent::new(
            Position::new(position),
            BrookEvent::new(
                EventId::generate(),
                "Tick",
                "tests",
                position.to_le_bytes().to_vec(),
                "application/octet-stream",
            ),
        )
    }

    fn slice(start: u64, count: u64) -> SliceReader {
        let stream = StreamKey::try_new("counter", "c-1").unwrap();
        let range = RangeKey::new(stream, Position::new(start), count);
        let events = (start..start + count).map(stored).collect();
        SliceReader::from_events(range, events)
    }

    async fn positions(reader: &SliceReader, from: u64, to: u64) -> Vec<u64> {
        reader
            .read(Position::new(from), Position::new(to), CancellationToken::new())
            .unwrap()
            .map_ok(|event| event.position.into_inner())
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reads_subrange_in_order() {
        let reader = slice(10, 10);

        assert_eq!(positions(&reader, 12, 15).await, vec![12, 13, 14, 15]);
        assert_eq!(positions(&reader, 0, 19).await, (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn max_to_beyond_bucket_is_rejected() {
        let reader = slice(10, 10);

        let Err(error) = reader.read(Position::new(10), Position::new(20), CancellationToken::new())
        else {
            panic!("expected a range error");
        };

        assert!(matches!(
            error,
            BrookError::SliceRangeExceeded { cached_to: Some(end), .. } if end == Position::new(19)
        ));
        assert!(error.is_precondition());
    }

    #[test]
    fn empty_bucket_rejects_every_read() {
        let reader = slice(0, 0);

        assert!(reader
            .read(Position::new(0), Position::new(0), CancellationToken::new())
            .is_err());
    }

    #[test]
    fn events_outside_the_bucket_are_not_cached() {
        let stream = StreamKey::try_new("counter", "c-1").unwrap();
        let range = RangeKey::new(stream, Position::new(5), 2);

        let reader = SliceReader::from_events(range, (0..10).map(stored).collect());

        assert_eq!(reader.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_read_reports_cancellation() {
        let reader = slice(0, 5);
        let token = CancellationToken::new();
        token.cancel();

        let result: BrookResult<Vec<StoredEvent>> = reader
            .read(Position::new(0), Position::new(4), token)
            .unwrap()
            .try_collect()
            .await;

        assert!(result.unwrap_err().is_cancelled());
    }
}
