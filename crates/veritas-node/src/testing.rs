//! In-process collaborators for pipeline, ingestion and API tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use veritas_core::{
    Address, InferenceRequest, InferenceResult, LedgerRequest, NodeKey, RequestId, Result,
    StoragePointer, VeritasError, B256,
};
use veritas_state::{InMemoryStateStore, ProcessingGuard, PromptRegistry, RetryPolicy, StateStore};

use crate::ledger::{Ledger, TxReceipt};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::provider::InferenceProvider;
use crate::storage::ContentStore;

pub fn requester() -> Address {
    "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().unwrap()
}

/// Unfulfilled request with an empty model id.
pub fn request(id: RequestId) -> InferenceRequest {
    InferenceRequest {
        id,
        requester: requester(),
        prompt_hash: B256::ZERO,
        model_id: String::new(),
        timestamp: 1_700_000_000 + id,
    }
}

#[derive(Default)]
pub struct MockLedger {
    requests: Mutex<BTreeMap<RequestId, LedgerRequest>>,
    results: Mutex<HashMap<RequestId, InferenceResult>>,
    events: Mutex<Vec<(u64, InferenceRequest)>>,
    failing_reads: Mutex<HashSet<RequestId>>,
    head: AtomicU64,
    submit_count: AtomicUsize,
    fail_submissions: AtomicUsize,
}

impl MockLedger {
    pub fn add_request(&self, request: InferenceRequest) {
        self.requests.lock().unwrap().insert(
            request.id,
            LedgerRequest {
                request,
                fulfilled: false,
            },
        );
    }

    /// Create the request and emit its event in `block`.
    pub fn emit(&self, block: u64, request: InferenceRequest) {
        self.add_request(request.clone());
        self.events.lock().unwrap().push((block, request));
        self.head.fetch_max(block, Ordering::SeqCst);
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    /// Flip the fulfilled flag as if another node had answered.
    pub fn fulfill_elsewhere(&self, id: RequestId) {
        if let Some(entry) = self.requests.lock().unwrap().get_mut(&id) {
            entry.fulfilled = true;
        }
    }

    pub fn fail_reads_for(&self, id: RequestId) {
        self.failing_reads.lock().unwrap().insert(id);
    }

    pub fn fail_next_submissions(&self, n: usize) {
        self.fail_submissions.store(n, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn submitted_pointer(&self, id: RequestId) -> Option<StoragePointer> {
        self.results
            .lock()
            .unwrap()
            .get(&id)
            .map(|r| r.storage_pointer.clone())
    }

    pub fn is_fulfilled(&self, id: RequestId) -> bool {
        self.results.lock().unwrap().contains_key(&id)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn total_requests(&self) -> Result<u64> {
        Ok(self
            .requests
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .map_or(0, |id| id + 1))
    }

    async fn get_request(&self, id: RequestId) -> Result<LedgerRequest> {
        if self.failing_reads.lock().unwrap().contains(&id) {
            return Err(VeritasError::Ledger(format!("read of {id} failed")));
        }
        self.requests
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| VeritasError::NotFound {
                resource_type: "request".to_string(),
                id: id.to_string(),
            })
    }

    async fn get_result(&self, id: RequestId) -> Result<Option<InferenceResult>> {
        Ok(self.results.lock().unwrap().get(&id).cloned())
    }

    async fn submit_result(
        &self,
        id: RequestId,
        result_hash: &B256,
        pointer: &StoragePointer,
    ) -> Result<TxReceipt> {
        let pending_failures = self.fail_submissions.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_submissions.store(pending_failures - 1, Ordering::SeqCst);
            return Err(VeritasError::Submission {
                request_id: id,
                message: "transaction reverted".to_string(),
            });
        }

        let mut results = self.results.lock().unwrap();
        if results.contains_key(&id) {
            return Err(VeritasError::Submission {
                request_id: id,
                message: "already fulfilled".to_string(),
            });
        }
        results.insert(
            id,
            InferenceResult {
                result_hash: *result_hash,
                storage_pointer: pointer.clone(),
                node: requester(),
                timestamp: 1_700_000_500,
            },
        );
        if let Some(entry) = self.requests.lock().unwrap().get_mut(&id) {
            entry.fulfilled = true;
        }
        let count = self.submit_count.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(TxReceipt {
            tx_hash: B256([count as u8; 32]),
            block_number: self.head.load(Ordering::SeqCst),
        })
    }

    async fn latest_block(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn requested_events(&self, from_block: u64, to_block: u64) -> Result<Vec<InferenceRequest>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(block, _)| (from_block..=to_block).contains(block))
            .map(|(_, request)| request.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MockProvider {
    pub calls: AtomicUsize,
    fail_remaining: AtomicUsize,
    fatal_remaining: AtomicUsize,
    delay: Mutex<Duration>,
    prompts: Mutex<Vec<String>>,
    models: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn reply_for(&self, prompt: &str) -> String {
        format!("Answer to: {prompt}")
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with an error classed fatal.
    pub fn fail_fatally_next(&self, n: usize) {
        self.fatal_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.models.lock().unwrap().push(model.to_string());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(VeritasError::Provider {
                model: model.to_string(),
                message: "HTTP 503: overloaded".to_string(),
            });
        }

        let fatal = self.fatal_remaining.load(Ordering::SeqCst);
        if fatal > 0 {
            self.fatal_remaining.store(fatal - 1, Ordering::SeqCst);
            return Err(VeritasError::SerializationError(
                "expected value at line 1 column 1".to_string(),
            ));
        }

        Ok(self.reply_for(prompt))
    }
}

#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<B256, Vec<u8>>>,
    pub uploads: AtomicUsize,
    pub fail: AtomicBool,
    pub report_existing: AtomicBool,
}

impl MockStore {
    pub fn get(&self, root: &B256) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(root).cloned()
    }

    pub fn put(&self, root: B256, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(root, bytes);
    }
}

#[async_trait]
impl ContentStore for MockStore {
    async fn exists(&self, root: &B256) -> Result<bool> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VeritasError::Storage("indexer unreachable".to_string()));
        }
        Ok(self.report_existing.load(Ordering::SeqCst)
            || self.objects.lock().unwrap().contains_key(root))
    }

    async fn upload(&self, root: &B256, bytes: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VeritasError::Storage("indexer unreachable".to_string()));
        }
        self.put(*root, bytes.to_vec());
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(&self, root: &B256) -> Result<Vec<u8>> {
        self.get(root).ok_or_else(|| VeritasError::NotFound {
            resource_type: "content".to_string(),
            id: root.to_hex(),
        })
    }
}

/// A pipeline wired to mocks, with handles to every collaborator.
pub struct Harness {
    pub pipeline: Pipeline,
    pub guard: Arc<ProcessingGuard>,
    pub registry: Arc<PromptRegistry>,
    pub ledger: Arc<MockLedger>,
    pub provider: Arc<MockProvider>,
    pub storage: Arc<MockStore>,
    pub node_key: NodeKey,
}

pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        registry_wait: Duration::from_millis(10),
        registry_wait_attempts: 5,
        provider_timeout: Duration::from_secs(5),
        storage_timeout: Duration::from_secs(5),
        ..PipelineSettings::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_settings())
}

pub fn harness_with(settings: PipelineSettings) -> Harness {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let guard = Arc::new(ProcessingGuard::new(store.clone(), RetryPolicy::immediate()));
    let registry = Arc::new(PromptRegistry::new(store));
    let ledger = Arc::new(MockLedger::default());
    let provider = Arc::new(MockProvider::default());
    let storage = Arc::new(MockStore::default());
    let node_key = NodeKey::random();

    let pipeline = Pipeline::new(
        guard.clone(),
        registry.clone(),
        ledger.clone(),
        provider.clone(),
        storage.clone(),
        node_key.clone(),
        settings,
    );

    Harness {
        pipeline,
        guard,
        registry,
        ledger,
        provider,
        storage,
        node_key,
    }
}

/// Bridge state over a harness. The returned receiver sees every queued trigger.
pub fn app_state(
    harness: &Harness,
    encryption_enabled: bool,
) -> (crate::state::AppState, tokio::sync::mpsc::Receiver<crate::pipeline::Trigger>) {
    let (triggers, receiver) = tokio::sync::mpsc::channel(16);
    let state = crate::state::AppState {
        registry: harness.registry.clone(),
        guard: harness.guard.clone(),
        ledger: harness.ledger.clone(),
        storage: harness.storage.clone(),
        triggers,
        node: harness.node_key.address(),
        public_key: encryption_enabled.then(|| harness.node_key.public_key_hex()),
    };
    (state, receiver)
}
