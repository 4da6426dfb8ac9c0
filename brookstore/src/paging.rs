//! Paged document enumeration shared by the repositories.

use crate::document::{Document, DocumentQuery, DocumentStore};
use crate::errors::{BrookResult, Operation};
use crate::retry::RetryPolicy;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

enum PageState {
    Start,
    Next(String),
    Done,
}

/// Lazily walks every page of `query`, retrying each page independently.
///
/// Pages are fetched on demand; nothing is requested until the stream is
/// polled and the continuation of a failed page is never skipped.
pub(crate) fn query_documents<S>(
    store: Arc<S>,
    retry: RetryPolicy,
    query: DocumentQuery,
    page_size: usize,
    operation: Operation,
) -> BoxStream<'static, BrookResult<Document>>
where
    S: DocumentStore + ?Sized + 'static,
{
    stream::try_unfold(PageState::Start, move |state| {
        let store = Arc::clone(&store);
        let retry = retry.clone();
        let query = query.clone();
        async move {
            let continuation = match state {
                PageState::Done => return Ok(None),
                PageState::Start => None,
                PageState::Next(token) => Some(token),
            };

            let page = retry
                .execute(operation, || {
                    let store = Arc::clone(&store);
                    let query = query.clone();
                    let continuation = continuation.clone();
                    async move { store.query_page(&query, continuation, page_size).await }
                })
                .await?;

            debug!(
                partition = %query.partition_key,
                kind = %query.kind,
                documents = page.documents.len(),
                has_more = page.continuation.is_some(),
                "[paging.query_documents] fetched page"
            );

            let next = page.continuation.map_or(PageState::Done, PageState::Next);
            Ok(Some((page.documents, next)))
        }
    })
    .map_ok(|documents| stream::iter(documents.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}
