use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use tracing::{error, info};

use crate::error::ChatError;
use crate::model::{ChatRequest, QueryRequest, RejectReason, StreamEvent};
use crate::orchestrator::{Orchestrator, Submission};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/query", post(handle_query))
        .route("/api/health", get(handle_health))
        .with_state(state)
}

/// Streaming chat endpoint. 200 carries the SSE event stream (including
/// cache replays); a duplicate submission is answered immediately with 409
/// so the client knows to wait for the original rather than retry.
pub async fn handle_chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.text.trim().is_empty() || request.request_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "text and request_id are required"})),
        )
            .into_response();
    }

    match state.orchestrator.submit(request).await {
        Submission::Rejected { request_id } => {
            info!(%request_id, "returning 409 for duplicate submission");
            (
                StatusCode::CONFLICT,
                Json(StreamEvent::Rejected {
                    reason: RejectReason::Duplicate,
                }),
            )
                .into_response()
        }
        Submission::Stream(events) => {
            let sse = events.map(|event| {
                match Event::default().json_data(&event) {
                    Ok(sse_event) => Ok::<_, Infallible>(sse_event),
                    Err(e) => {
                        error!(error = %e, "failed to encode stream event");
                        // Comments are the one SSE frame clients ignore.
                        Ok(Event::default().comment("encoding error"))
                    }
                }
            });
            // Keep-alives are explicit heartbeat events from the
            // orchestrator, not transport-level comments.
            Sse::new(sse).into_response()
        }
    }
}

/// Non-streaming query endpoint sharing the same pipeline and caches.
pub async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    if request.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "message is required"})),
        )
            .into_response();
    }

    match state
        .orchestrator
        .query(&request.message, &request.user_id)
        .await
    {
        Ok(payload) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "response": payload.response,
                "structured_data": payload.attachments,
                "language": payload.language,
                "source": payload.source,
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
        Err(error) => {
            error!(%error, "query failed");
            (
                error_status(&error),
                Json(json!({"error": error.to_string(), "kind": error.kind()})),
            )
                .into_response()
        }
    }
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.orchestrator.stats().snapshot();
    let in_flight = state.orchestrator.registry().in_flight();
    (
        StatusCode::OK,
        Json(json!({"upstream": stats, "in_flight": in_flight})),
    )
        .into_response()
}

fn error_status(error: &ChatError) -> StatusCode {
    match error {
        ChatError::DuplicateRequest(_) => StatusCode::CONFLICT,
        ChatError::UpstreamGeneration(_) | ChatError::ResourceConstruction { .. } => {
            StatusCode::BAD_GATEWAY
        }
        ChatError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}
