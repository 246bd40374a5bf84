//! # Veritas SDK
//!
//! Client for the worker's prompt registry bridge, plus offline verification
//! of published audit packages.

pub mod client;
pub mod verify;

pub use client::{NodeHealth, WorkerClient};
pub use verify::{verify_package, Verification};

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::client::WorkerClient;
    pub use crate::verify::{verify_package, Verification};
    pub use veritas_core::prelude::*;
}
