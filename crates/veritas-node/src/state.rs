//! Application state shared by the HTTP handlers.

use std::sync::Arc;

use tokio::sync::mpsc;
use veritas_core::Address;
use veritas_state::{ProcessingGuard, PromptRegistry};

use crate::ledger::Ledger;
use crate::pipeline::Trigger;
use crate::storage::ContentStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Out-of-band prompts keyed by request id.
    pub registry: Arc<PromptRegistry>,

    /// Per-request processing guard.
    pub guard: Arc<ProcessingGuard>,

    pub ledger: Arc<dyn Ledger>,

    pub storage: Arc<dyn ContentStore>,

    /// Queue feeding the worker pool.
    pub triggers: mpsc::Sender<Trigger>,

    /// Address results are submitted from.
    pub node: Address,

    /// Encryption key advertised to clients, if encryption is enabled.
    pub public_key: Option<String>,
}
