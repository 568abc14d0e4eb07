use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::{engine::EngineError, AppState};

const NOT_FOUND_MESSAGE: &str = "Secret not found or has expired";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub content: Option<String>,
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: String,
    pub url: String,
    pub expires_at: Option<String>,
}

pub async fn create_secret(
    State(state): State<AppState>,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return unprocessable("body", &rejection.body_text()),
    };
    let Some(content) = body.content else {
        return unprocessable("content", "The content field is required.");
    };

    match state.engine.store(&content, body.ttl_minutes) {
        Ok(handle) => {
            info!(ttl_minutes = ?body.ttl_minutes, "secret.create");
            debug!(id = %handle.id, "secret.create");
            let data = CreateResponse {
                expires_at: handle.expires_at.and_then(rfc3339),
                id: handle.id,
                url: handle.url,
            };
            (
                StatusCode::CREATED,
                Json(json!({"success": true, "data": data})),
            )
                .into_response()
        }
        Err(EngineError::Validation { field, message }) => unprocessable(field, &message),
        Err(e) => internal_error(e),
    }
}

// ── Get ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RevealResponse {
    pub content: String,
    pub created_at: Option<String>,
}

pub async fn get_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.retrieve(&id) {
        Ok(Some(revealed)) => {
            info!("secret.burned");
            debug!(id = %id, "secret.burned");
            let data = RevealResponse {
                created_at: rfc3339(revealed.created_at),
                content: revealed.content,
            };
            Json(json!({"success": true, "data": data})).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": NOT_FOUND_MESSAGE})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Purge ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: usize,
}

/// On-demand expiry sweep against the store this server owns.
pub async fn purge_secrets(State(state): State<AppState>) -> Response {
    match state.engine.purge_expired() {
        Ok(deleted) => {
            info!(deleted, "secret.purge");
            let data = PurgeResponse { deleted };
            Json(json!({"success": true, "data": data})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn rfc3339(unix_secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn unprocessable(field: &str, message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "success": false,
            "message": message,
            "errors": { field: [message] },
        })),
    )
        .into_response()
}

fn internal_error(e: EngineError) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "message": "internal server error"})),
    )
        .into_response()
}
