//! HTTP bridge endpoints.

pub mod health;
pub mod registry;
pub mod requests;
