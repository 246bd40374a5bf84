//! The fulfillment pipeline.
//!
//! One call to [`Pipeline::process`] is one attempt at turning a ledger
//! request into a submitted result. Attempts for the same identifier are
//! serialized by the [`ProcessingGuard`]. The error class decides what a
//! failure does: a transient failure releases the guard so a later trigger can
//! try again, anything else parks the identifier until a manual retry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use veritas_core::envelope::decrypt;
use veritas_core::{
    commit_prompt, AuditPackage, ErrorClass, InferenceRequest, NodeKey, ProcessingStage,
    PromptPayload, RegistryEntry, RequestId, Result, StoragePointer, VeritasError, B256,
};
use veritas_state::{Acquire, ProcessingGuard, PromptRegistry};

use crate::ledger::Ledger;
use crate::provider::InferenceProvider;
use crate::storage::ContentStore;

/// Prompt used when no registration arrives for a request.
pub fn placeholder_prompt(id: RequestId) -> String {
    format!("[Prompt for requestId {id} — register via POST /register-prompt]")
}

/// Which ingestion path produced a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Live,
    Reconcile,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerSource::Live => "live",
            TriggerSource::Reconcile => "reconcile",
            TriggerSource::Manual => "manual",
        })
    }
}

/// A request to process, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub request: InferenceRequest,
    pub source: TriggerSource,
}

impl Trigger {
    pub fn new(request: InferenceRequest, source: TriggerSource) -> Self {
        Self { request, source }
    }
}

/// What happened to one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The result is on the ledger.
    Fulfilled {
        result_hash: B256,
        pointer: StoragePointer,
    },
    /// The guard absorbed the trigger.
    Skipped(Acquire),
    /// The attempt failed and the identifier was released for retry.
    Released {
        stage: ProcessingStage,
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// The attempt failed in a way retrying cannot fix; the identifier waits
    /// for a manual retry.
    Parked {
        stage: ProcessingStage,
        error: String,
    },
    /// The guard itself could not be consulted.
    GuardUnavailable(String),
}

impl Outcome {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled { .. })
    }
}

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Model used when a request names none.
    pub default_model: String,
    pub registry_wait: Duration,
    pub registry_wait_attempts: u32,
    pub provider_timeout: Duration,
    pub storage_timeout: Duration,
    /// Require the recovered prompt to match the on-chain commitment.
    pub verify_prompt_hash: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_model: crate::config::DEFAULT_MODEL.to_string(),
            registry_wait: Duration::from_millis(500),
            registry_wait_attempts: 3,
            provider_timeout: Duration::from_secs(60),
            storage_timeout: Duration::from_secs(30),
            verify_prompt_hash: false,
        }
    }
}

/// Turns ledger requests into submitted, auditable results.
pub struct Pipeline {
    guard: Arc<ProcessingGuard>,
    registry: Arc<PromptRegistry>,
    ledger: Arc<dyn Ledger>,
    provider: Arc<dyn InferenceProvider>,
    storage: Arc<dyn ContentStore>,
    node_key: NodeKey,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        guard: Arc<ProcessingGuard>,
        registry: Arc<PromptRegistry>,
        ledger: Arc<dyn Ledger>,
        provider: Arc<dyn InferenceProvider>,
        storage: Arc<dyn ContentStore>,
        node_key: NodeKey,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            guard,
            registry,
            ledger,
            provider,
            storage,
            node_key,
            settings,
        }
    }

    pub fn guard(&self) -> &Arc<ProcessingGuard> {
        &self.guard
    }

    /// Run one attempt for `trigger`.
    pub async fn process(&self, trigger: &Trigger) -> Outcome {
        let id = trigger.request.id;

        let (attempt, memoized) = match self.guard.try_acquire(id).await {
            Ok(Acquire::Acquired { attempt, memoized }) => (attempt, memoized),
            Ok(other) => {
                debug!("Trigger for request {} ({}) absorbed: {:?}", id, trigger.source, other);
                return Outcome::Skipped(other);
            }
            Err(e) => {
                error!("❌ Guard unavailable for request {}: {}", id, e);
                return Outcome::GuardUnavailable(e.to_string());
            }
        };

        let span = info_span!(
            "fulfill",
            request_id = id,
            attempt,
            source = %trigger.source,
            attempt_id = %Uuid::new_v4(),
        );

        self.run(&trigger.request, memoized).instrument(span).await
    }

    async fn run(&self, request: &InferenceRequest, memoized: Option<AuditPackage>) -> Outcome {
        let id = request.id;
        let mut stage = ProcessingStage::Guarded;
        info!("⚙️  Processing request {}", id);

        match self.fulfill(request, memoized, &mut stage).await {
            Ok((result_hash, pointer)) => {
                if let Err(e) = self.guard.complete(id).await {
                    error!("Result for request {} submitted but guard not updated: {}", id, e);
                }
                info!("✅ Request {} fulfilled ({})", id, pointer);
                Outcome::Fulfilled {
                    result_hash,
                    pointer,
                }
            }
            Err(e) => match e.class() {
                ErrorClass::Transient | ErrorClass::Degraded => self.release(id, stage, e).await,
                ErrorClass::ClientInput | ErrorClass::Fatal => self.park(id, stage, e).await,
            },
        }
    }

    async fn release(&self, id: RequestId, stage: ProcessingStage, e: VeritasError) -> Outcome {
        let message = e.to_string();
        match self.guard.release(id, stage, message.clone()).await {
            Ok(retry_at) => {
                warn!(
                    "🔁 Request {} failed while {} (retry after {}): {}",
                    id, stage, retry_at, message
                );
                Outcome::Released {
                    stage,
                    retry_at,
                    error: message,
                }
            }
            Err(release_error) => {
                error!("❌ Could not release request {}: {}", id, release_error);
                Outcome::GuardUnavailable(release_error.to_string())
            }
        }
    }

    async fn park(&self, id: RequestId, stage: ProcessingStage, e: VeritasError) -> Outcome {
        let message = e.to_string();
        match self.guard.park(id, stage, message.clone()).await {
            Ok(()) => {
                error!(
                    "🛑 Request {} parked while {} until a manual retry: {}",
                    id, stage, message
                );
                Outcome::Parked {
                    stage,
                    error: message,
                }
            }
            Err(park_error) => {
                error!("❌ Could not park request {}: {}", id, park_error);
                Outcome::GuardUnavailable(park_error.to_string())
            }
        }
    }

    async fn fulfill(
        &self,
        request: &InferenceRequest,
        memoized: Option<AuditPackage>,
        stage: &mut ProcessingStage,
    ) -> Result<(B256, StoragePointer)> {
        let id = request.id;

        let package = match memoized {
            Some(package) => {
                info!("💾 Reusing audit package from an earlier attempt");
                package
            }
            None => {
                self.enter(id, stage, ProcessingStage::Decrypting).await?;
                let prompt = self.resolve_prompt(request).await?;
                let model = self.model_for(request);

                self.enter(id, stage, ProcessingStage::Inferring).await?;
                let output = self.infer(&model, &prompt).await?;

                let package = AuditPackage::new(
                    id,
                    request.prompt_hash,
                    prompt,
                    model,
                    output,
                    self.node_key.address(),
                );
                self.guard.remember_output(id, package.clone()).await?;
                package
            }
        };

        self.enter(id, stage, ProcessingStage::Hashing).await?;
        let result_hash = package.result_hash;
        let bytes = package.to_canonical_bytes()?;
        info!("🔏 Result commitment {}", result_hash);

        self.enter(id, stage, ProcessingStage::Publishing).await?;
        let pointer = self.publish(&bytes, &result_hash).await;

        self.enter(id, stage, ProcessingStage::Submitting).await?;
        self.ledger.submit_result(id, &result_hash, &pointer).await?;

        Ok((result_hash, pointer))
    }

    async fn enter(
        &self,
        id: RequestId,
        current: &mut ProcessingStage,
        next: ProcessingStage,
    ) -> Result<()> {
        *current = next;
        self.guard.advance(id, next).await
    }

    fn model_for(&self, request: &InferenceRequest) -> String {
        if request.model_id.trim().is_empty() {
            self.settings.default_model.clone()
        } else {
            request.model_id.clone()
        }
    }

    /// Plaintext prompt for `request`, falling back to the placeholder.
    async fn resolve_prompt(&self, request: &InferenceRequest) -> Result<String> {
        let Some(entry) = self.await_registration(request.id).await else {
            warn!(
                "📭 No prompt registered for request {}, using placeholder",
                request.id
            );
            return Ok(placeholder_prompt(request.id));
        };

        let prompt = match entry.prompt {
            PromptPayload::Plain(text) => text,
            PromptPayload::Encrypted(payload) => {
                let text = decrypt(self.node_key.secret(), &payload)?;
                debug!("Decrypted prompt for request {}", request.id);
                text
            }
        };

        if self.settings.verify_prompt_hash && commit_prompt(&prompt) != request.prompt_hash {
            warn!(
                "🚫 Registered prompt for request {} does not match on-chain promptHash, using placeholder",
                request.id
            );
            return Ok(placeholder_prompt(request.id));
        }

        Ok(prompt)
    }

    async fn await_registration(&self, id: RequestId) -> Option<RegistryEntry> {
        let attempts = self.settings.registry_wait_attempts;
        for waited in 0..=attempts {
            if let Some(entry) = self.registry.get(id).await {
                return Some(entry);
            }
            if waited < attempts {
                debug!("Waiting for prompt registration of request {}", id);
                sleep(self.settings.registry_wait).await;
            }
        }
        None
    }

    async fn infer(&self, model: &str, prompt: &str) -> Result<String> {
        let limit = self.settings.provider_timeout;
        let output = timeout(limit, self.provider.complete(model, prompt))
            .await
            .map_err(|_| VeritasError::Timeout {
                duration_ms: limit.as_millis() as u64,
                message: format!("provider call for model {model}"),
            })??;
        info!("🧠 Inference complete ({} chars)", output.len());
        Ok(output)
    }

    /// Publish the package, degrading to a fallback pointer if storage fails.
    async fn publish(&self, bytes: &[u8], result_hash: &B256) -> StoragePointer {
        let root = self.storage.content_address(bytes);

        let upload = async {
            if self.storage.exists(&root).await? {
                info!("♻️  Package {} already stored, skipping upload", root);
                return Ok(());
            }
            self.storage.upload(&root, bytes).await
        };

        let limit = self.settings.storage_timeout;
        let failure = match timeout(limit, upload).await {
            Ok(Ok(())) => return StoragePointer::ContentAddress(root),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", limit.as_millis()),
        };

        let pointer = StoragePointer::degraded(result_hash);
        warn!(
            "⚠️  Publication failed ({}), result will carry unverifiable pointer {}",
            failure, pointer
        );
        pointer
    }
}
