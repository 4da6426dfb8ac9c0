use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use brookstore::{
    BatchItemOutcome, BatchOperation, BatchResponse, BatchStatus, Document, DocumentPage,
    DocumentQuery, DocumentStore, ItemStatus, StoreError, StoreResult,
};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```
/// use brookstore_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// assert!(Probability::try_new(-0.1).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(probability: f32) -> Self {
        Self::try_new(probability.clamp(0.0, 1.0)).expect("clamped value is always valid")
    }
}

/// The document store calls faults can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `DocumentStore::read`
    Read,
    /// `DocumentStore::create`
    Create,
    /// `DocumentStore::upsert`
    Upsert,
    /// `DocumentStore::delete`
    Delete,
    /// `DocumentStore::query_page`
    QueryPage,
    /// `DocumentStore::execute_batch`
    ExecuteBatch,
}

/// A scripted fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The call fails with this error without reaching the store.
    Error(StoreError),
    /// A batch is answered with this status without reaching the store.
    BatchStatus(BatchStatus),
    /// The call reaches the store, then reports this error (lost acknowledgement).
    ErrorAfterApply(StoreError),
}

#[derive(Debug, Clone)]
enum Step {
    Pass,
    Inject(Fault),
    InjectForever(Fault),
}

/// Random fault rates for a [`ChaosDocumentStore`].
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    throttle_probability: Probability,
    throttle_retry_after: Option<Duration>,
}

impl ChaosConfig {
    /// No random faults and a fixed seed, so runs are reproducible.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Probability of failing any call with `ServiceUnavailable`.
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Probability of throttling any call.
    pub fn with_throttle_probability(mut self, probability: f32) -> Self {
        self.throttle_probability = Probability::clamped(probability);
        self
    }

    /// Retry hint attached to injected throttling.
    pub fn with_throttle_retry_after(mut self, retry_after: Duration) -> Self {
        self.throttle_retry_after = Some(retry_after);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::clamped(0.0),
            throttle_probability: Probability::clamped(0.0),
            throttle_retry_after: None,
        }
    }
}

/// Wraps any document store in a [`ChaosDocumentStore`].
pub trait ChaosDocumentStoreExt: Sized {
    /// Wraps `self` with the given fault configuration.
    fn with_chaos(self, config: ChaosConfig) -> ChaosDocumentStore<Self>;
}

/// Wraps a document store and injects random and scripted faults.
pub struct ChaosDocumentStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    scripts: Mutex<HashMap<StoreOperation, VecDeque<Step>>>,
    calls: Mutex<HashMap<StoreOperation, usize>>,
}

impl<S> ChaosDocumentStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    /// Injects `fault` into the next `times` calls of `operation`.
    pub fn fail_next(&self, operation: StoreOperation, times: usize, fault: Fault) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(operation).or_default();
        script.extend(std::iter::repeat(Step::Inject(fault)).take(times));
    }

    /// Lets `successes` calls of `operation` through, then injects `fault`
    /// into every later call until [`clear_faults`](Self::clear_faults).
    pub fn fail_after(&self, operation: StoreOperation, successes: usize, fault: Fault) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(operation).or_default();
        script.extend(std::iter::repeat(Step::Pass).take(successes));
        script.push_back(Step::InjectForever(fault));
    }

    /// Removes every scripted fault.
    pub fn clear_faults(&self) {
        self.scripts.lock().clear();
    }

    /// How many times `operation` was invoked on this wrapper.
    pub fn calls(&self, operation: StoreOperation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let prob_f32: f32 = probability.into();

        if prob_f32 <= 0.0 {
            return false;
        }

        if prob_f32 >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(prob_f32))
    }

    /// Records the call and picks the fault to inject, if any.
    fn next_fault(&self, operation: StoreOperation) -> Option<Fault> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let scripted = self.scripts.lock().get_mut(&operation).and_then(|script| {
            match script.front() {
                Some(Step::InjectForever(fault)) => Some(Step::Inject(fault.clone())),
                _ => script.pop_front(),
            }
        });
        match scripted {
            Some(Step::Inject(fault) | Step::InjectForever(fault)) => return Some(fault),
            Some(Step::Pass) => return None,
            None => {}
        }

        if self.should_inject(self.config.throttle_probability) {
            return Some(Fault::Error(StoreError::Throttled {
                retry_after: self.config.throttle_retry_after,
            }));
        }
        if self.should_inject(self.config.failure_probability) {
            return Some(Fault::Error(StoreError::ServiceUnavailable(
                "chaos: injected failure".to_string(),
            )));
        }
        None
    }

    async fn guarded<T, Fut>(&self, operation: StoreOperation, call: Fut) -> StoreResult<T>
    where
        Fut: std::future::Future<Output = StoreResult<T>> + Send,
    {
        match self.next_fault(operation) {
            None => call.await,
            Some(Fault::Error(error)) => {
                debug!(?operation, %error, "[chaos.guarded] injecting fault");
                Err(error)
            }
            Some(Fault::ErrorAfterApply(error)) => {
                let _ = call.await;
                debug!(?operation, %error, "[chaos.guarded] injecting fault after apply");
                Err(error)
            }
            Some(Fault::BatchStatus(status)) => Err(StoreError::Backend(format!(
                "batch status {status:?} injected into non-batch call"
            ))),
        }
    }
}

#[async_trait]
impl<S> DocumentStore for ChaosDocumentStore<S>
where
    S: DocumentStore,
{
    async fn read(&self, partition_key: &str, id: &str) -> StoreResult<Option<Document>> {
        self.guarded(StoreOperation::Read, self.store.read(partition_key, id))
            .await
    }

    async fn create(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        self.guarded(StoreOperation::Create, self.store.create(partition_key, document))
            .await
    }

    async fn upsert(&self, partition_key: &str, document: Document) -> StoreResult<()> {
        self.guarded(StoreOperation::Upsert, self.store.upsert(partition_key, document))
            .await
    }

    async fn delete(&self, partition_key: &str, id: &str) -> StoreResult<bool> {
        self.guarded(StoreOperation::Delete, self.store.delete(partition_key, id))
            .await
    }

    async fn query_page(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
        page_size: usize,
    ) -> StoreResult<DocumentPage> {
        self.guarded(
            StoreOperation::QueryPage,
            self.store.query_page(query, continuation, page_size),
        )
        .await
    }

    async fn execute_batch(
        &self,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StoreResult<BatchResponse> {
        let Some(Fault::BatchStatus(status)) = self.peek_batch_status() else {
            return self
                .guarded(
                    StoreOperation::ExecuteBatch,
                    self.store.execute_batch(partition_key, operations),
                )
                .await;
        };

        let _ = self.next_fault(StoreOperation::ExecuteBatch);
        debug!(?status, "[chaos.execute_batch] injecting batch status");
        Ok(BatchResponse {
            status,
            outcomes: operations
                .iter()
                .map(|operation| BatchItemOutcome {
                    id: operation.id().to_string(),
                    status: ItemStatus::FailedDependency,
                })
                .collect(),
        })
    }
}

impl<S> ChaosDocumentStore<S> {
    fn peek_batch_status(&self) -> Option<Fault> {
        self.scripts
            .lock()
            .get(&StoreOperation::ExecuteBatch)
            .and_then(VecDeque::front)
            .and_then(|step| match step {
                Step::Inject(fault @ Fault::BatchStatus(_))
                | Step::InjectForever(fault @ Fault::BatchStatus(_)) => Some(fault.clone()),
                _ => None,
            })
    }
}

impl<S> ChaosDocumentStoreExt for S
where
    S: DocumentStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosDocumentStore<Self> {
        ChaosDocumentStore::new(self, config)
    }
}
