//! # Veritas State
//!
//! Shared mutable state of the worker: the idempotency guard and the prompt
//! registry, both backed by a pluggable [`StateStore`].

pub mod guard;
pub mod registry;
pub mod store;

pub use guard::{Acquire, GuardEntry, ProcessingGuard, RecoveryReport, RetryPolicy};
pub use registry::PromptRegistry;
pub use store::{InMemoryStateStore, SledStateStore, StateEntry, StateStore};
