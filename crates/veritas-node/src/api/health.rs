//! Health check and node identity endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub version: String,
}

/// Report liveness, the submitting address and, when enabled, the encryption key.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        node: state.node.to_checksum(),
        public_key: state.public_key.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
