//! Storage engine configuration.
//!
//! Sizes use `nutype` validation so that a constructed configuration is
//! always usable; raw values are checked in the `with_*` setters and
//! reported as [`BrookError::InvalidConfiguration`].

use crate::errors::{BrookError, BrookResult};
use crate::retry::{BackoffSchedule, RetryPolicy, RetryStrategy};
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Number of positions per slice bucket used by the stream reader.
#[nutype(
    validate(greater = 0),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Display,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SliceSize(u64);

/// Paging granularity for event and snapshot queries.
#[nutype(
    validate(greater = 0),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Display,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct QueryPageSize(usize);

/// Upper bound on slices bulk-loaded concurrently by one stream read.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    default = 4,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Display,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxParallelSlices(usize);

/// Configuration shared by the repositories and readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrookStorageConfig {
    /// Bucket size for slice-parallel reads.
    pub slice_size: SliceSize,
    /// Page size for paged queries.
    pub query_page_size: QueryPageSize,
    /// Concurrency bound for slice loading.
    pub max_parallel_slices: MaxParallelSlices,
    /// Retry budget and backoff for store calls.
    pub retry: RetryStrategy,
}

impl BrookStorageConfig {
    /// Sets the slice size; must be greater than zero.
    pub fn with_slice_size(mut self, slice_size: u64) -> BrookResult<Self> {
        self.slice_size = SliceSize::try_new(slice_size)
            .map_err(|error| BrookError::InvalidConfiguration(format!("slice_size: {error}")))?;
        Ok(self)
    }

    /// Sets the query page size; must be greater than zero.
    pub fn with_query_page_size(mut self, page_size: usize) -> BrookResult<Self> {
        self.query_page_size = QueryPageSize::try_new(page_size).map_err(|error| {
            BrookError::InvalidConfiguration(format!("query_page_size: {error}"))
        })?;
        Ok(self)
    }

    /// Sets the slice loading concurrency.
    pub fn with_max_parallel_slices(mut self, parallelism: usize) -> BrookResult<Self> {
        self.max_parallel_slices = MaxParallelSlices::try_new(parallelism).map_err(|error| {
            BrookError::InvalidConfiguration(format!("max_parallel_slices: {error}"))
        })?;
        Ok(self)
    }

    /// Sets the retry attempt budget. Nonpositive values disable all attempts.
    #[must_use]
    pub const fn with_max_retry_attempts(mut self, max_attempts: i32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Sets the retry backoff schedule.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.retry.backoff = backoff;
        self
    }

    /// Builds the retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }

    /// Slice size as a raw number.
    pub fn slice_size(&self) -> u64 {
        self.slice_size.into_inner()
    }

    /// Page size as a raw number.
    pub fn page_size(&self) -> usize {
        self.query_page_size.into_inner()
    }
}
