//! Per-request inspection, manual retry and verification.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use veritas_core::{
    content_address, AuditPackage, ProcessingStage, RequestId, StoragePointer, VeritasError, B256,
};

use crate::pipeline::{Trigger, TriggerSource};
use crate::state::AppState;

/// Local view of a request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub request_id: RequestId,
    pub registered: bool,
    pub stage: Option<ProcessingStage>,
    pub held: bool,
    pub parked: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub request_id: RequestId,
    pub queued: bool,
}

/// Outcome of checking a fulfilled request end to end.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub request_id: RequestId,
    pub result_hash: B256,
    pub storage_pointer: StoragePointer,
    /// The pointer refers to published content.
    pub verifiable: bool,
    /// The published output reproduces the on-chain commitment.
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn ledger_error(e: VeritasError) -> (StatusCode, String) {
    match e {
        VeritasError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        other => (StatusCode::BAD_GATEWAY, other.to_string()),
    }
}

/// Guard and registry state for one request.
pub async fn get_request_status(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> Result<Json<RequestStatus>, (StatusCode, String)> {
    let entry = state.guard.entry(id).await;
    let registered = state.registry.contains(id).await;

    if entry.is_none() && !registered {
        return Err((StatusCode::NOT_FOUND, format!("Request {} not seen", id)));
    }

    Ok(Json(RequestStatus {
        request_id: id,
        registered,
        stage: entry.as_ref().map(|e| e.stage),
        held: entry.as_ref().is_some_and(|e| e.held),
        parked: entry.as_ref().is_some_and(|e| e.parked),
        attempts: entry.as_ref().map_or(0, |e| e.attempts),
        last_error: entry.as_ref().and_then(|e| e.last_error.clone()),
        retry_after: entry.as_ref().and_then(|e| e.retry_after),
    }))
}

/// Re-read a request from the ledger and queue it if still open. A parked
/// request becomes eligible again.
pub async fn retry_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> Result<(StatusCode, Json<RetryResponse>), (StatusCode, String)> {
    let record = state.ledger.get_request(id).await.map_err(ledger_error)?;

    if record.fulfilled {
        let _ = state.guard.mark_fulfilled(id).await;
        return Err((
            StatusCode::CONFLICT,
            format!("Request {} is already fulfilled", id),
        ));
    }

    state.guard.unpark(id).await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Could not unpark request {}: {}", id, e),
        )
    })?;

    if !state.guard.mark_queued(id).await {
        info!("🔁 Manual retry for request {} already waiting in the queue", id);
        return Ok((
            StatusCode::ACCEPTED,
            Json(RetryResponse {
                request_id: id,
                queued: true,
            }),
        ));
    }

    if state
        .triggers
        .send(Trigger::new(record.request, TriggerSource::Manual))
        .await
        .is_err()
    {
        state.guard.clear_queued(id).await;
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Worker queue is closed".to_string(),
        ));
    }

    info!("🔁 Manual retry queued for request {}", id);
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            request_id: id,
            queued: true,
        }),
    ))
}

/// Fetch the published package and recompute the on-chain commitment.
pub async fn verify_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> Result<Json<VerifyResponse>, (StatusCode, String)> {
    let result = state
        .ledger
        .get_result(id)
        .await
        .map_err(ledger_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Request {} is not fulfilled", id)))?;

    let mut response = VerifyResponse {
        request_id: id,
        result_hash: result.result_hash,
        storage_pointer: result.storage_pointer.clone(),
        verifiable: result.storage_pointer.is_verifiable(),
        verified: false,
        reason: None,
    };

    let Some(root) = result.storage_pointer.content_address() else {
        response.reason = Some("audit package was never published (fallback pointer)".to_string());
        return Ok(Json(response));
    };

    let bytes = match state.storage.download(root).await {
        Ok(bytes) => bytes,
        Err(e) => {
            response.reason = Some(format!("download failed: {e}"));
            return Ok(Json(response));
        }
    };

    if content_address(&bytes) != *root {
        response.reason = Some("downloaded content does not match its address".to_string());
        return Ok(Json(response));
    }

    match AuditPackage::from_slice(&bytes) {
        Ok(package) if package.verify_against(&result.result_hash) => response.verified = true,
        Ok(_) => response.reason = Some("output does not reproduce the on-chain hash".to_string()),
        Err(e) => response.reason = Some(format!("unreadable audit package: {e}")),
    }

    Ok(Json(response))
}
