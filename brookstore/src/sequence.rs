//! Lazy, cancellable event sequences.
//!
//! Every read API hands out an [`EventStream`]: finite, forward-only and
//! non-restartable. Cancellation is a distinct outcome: once the token is
//! signalled the next poll yields `Err(BrookError::Cancelled)` and the
//! sequence ends. Any other error also ends the sequence.

use crate::errors::{BrookError, BrookResult};
use crate::event::StoredEvent;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

/// A lazy sequence of stored events in ascending position order.
pub type EventStream = BoxStream<'static, BrookResult<StoredEvent>>;

/// Races every element of `inner` against `token`.
pub fn cancellable<T>(
    inner: BoxStream<'static, BrookResult<T>>,
    token: CancellationToken,
) -> BoxStream<'static, BrookResult<T>>
where
    T: Send + 'static,
{
    stream::unfold(Some((inner, token)), |state| async move {
        let (mut inner, token) = state?;
        if token.is_cancelled() {
            return Some((Err(BrookError::Cancelled), None));
        }

        let next = tokio::select! {
            biased;
            () = token.cancelled() => return Some((Err(BrookError::Cancelled), None)),
            next = inner.next() => next,
        };

        match next {
            Some(Ok(item)) => Some((Ok(item), Some((inner, token)))),
            Some(Err(error)) => Some((Err(error), None)),
            None => None,
        }
    })
    .boxed()
}

/// An already exhausted event stream.
pub fn empty() -> EventStream {
    stream::empty().boxed()
}
