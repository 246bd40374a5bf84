//! Prompt registration endpoint.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::warn;
use veritas_core::{PromptPayload, RequestId, B256};

use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

/// Accepts `{requestId, prompt, promptHash?}`. `requestId` may be a number or a
/// decimal string; `prompt` is plaintext or an encrypted envelope.
pub async fn register_prompt(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|_| bad_request("Invalid JSON"))?;

    let request_id = body.get("requestId").and_then(parse_request_id);
    let prompt = body
        .get("prompt")
        .cloned()
        .and_then(|raw| serde_json::from_value::<PromptPayload>(raw).ok())
        .filter(|p| !p.is_empty());

    let (Some(request_id), Some(prompt)) = (request_id, prompt) else {
        return Err(bad_request("Missing requestId or prompt"));
    };

    let prompt_hash = match body.get("promptHash") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(
            raw.parse::<B256>()
                .map_err(|_| bad_request("Invalid promptHash"))?,
        ),
        Some(_) => return Err(bad_request("Invalid promptHash")),
    };

    state
        .registry
        .register(request_id, prompt, prompt_hash)
        .await
        .map_err(|e| {
            warn!("Could not persist registration for {}: {}", request_id, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        })?;

    Ok(Json(json!({ "ok": true })))
}

fn parse_request_id(raw: &Value) -> Option<RequestId> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{app_state, harness};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use veritas_core::envelope::encrypt;
    use veritas_core::{commit_prompt, PromptPayload};

    #[tokio::test]
    async fn test_register_plain_prompt() {
        let h = harness();
        let (state, _rx) = app_state(&h, true);
        let server = TestServer::new(crate::create_router(state)).unwrap();

        let response = server
            .post("/register-prompt")
            .json(&json!({
                "requestId": "3",
                "prompt": "What is 6 x 7?",
                "promptHash": commit_prompt("What is 6 x 7?"),
            }))
            .await;

        response.assert_status_ok();
        response.assert_json(&json!({ "ok": true }));
        let entry = h.registry.get(3).await.unwrap();
        assert_eq!(entry.prompt, PromptPayload::Plain("What is 6 x 7?".into()));
        assert_eq!(entry.prompt_hash, Some(commit_prompt("What is 6 x 7?")));
    }

    #[tokio::test]
    async fn test_register_encrypted_prompt_with_numeric_id() {
        let h = harness();
        let (state, _rx) = app_state(&h, true);
        let server = TestServer::new(crate::create_router(state)).unwrap();
        let payload = encrypt(&h.node_key.public_key(), "private").unwrap();

        server
            .post("/register-prompt")
            .json(&json!({ "requestId": 9, "prompt": payload }))
            .await
            .assert_status_ok();

        assert!(h.registry.get(9).await.unwrap().prompt.is_encrypted());
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let h = harness();
        let (state, _rx) = app_state(&h, true);
        let server = TestServer::new(crate::create_router(state)).unwrap();

        for body in [
            json!({ "prompt": "no id" }),
            json!({ "requestId": 1 }),
            json!({ "requestId": 1, "prompt": "" }),
            json!({ "requestId": -1, "prompt": "negative" }),
        ] {
            let response = server.post("/register-prompt").json(&body).expect_failure().await;
            response.assert_status(StatusCode::BAD_REQUEST);
            let error: Value = response.json();
            assert_eq!(error["error"], "Missing requestId or prompt");
        }
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_json_rejected() {
        let h = harness();
        let (state, _rx) = app_state(&h, true);
        let server = TestServer::new(crate::create_router(state)).unwrap();

        let response = server
            .post("/register-prompt")
            .content_type("application/json")
            .text("{not json")
            .expect_failure()
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        response.assert_json(&json!({ "error": "Invalid JSON" }));
    }
}
