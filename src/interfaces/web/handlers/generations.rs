use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    response::sse::{Event, Sse},
};
use futures::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

use crate::core::generation::OrchestratorError;
use crate::core::generation::types::{
    ApprovalDecision, AuthOutcome, GenerationEvent, GenerationStatus, StartOptions,
};
use crate::interfaces::web::{AppState, auth};

fn orchestrator_error(e: OrchestratorError) -> axum::response::Response {
    let status = match e {
        OrchestratorError::NotFound => StatusCode::NOT_FOUND,
        OrchestratorError::Forbidden => StatusCode::FORBIDDEN,
        OrchestratorError::ConversationBusy => StatusCode::CONFLICT,
    };
    (
        status,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
        .into_response()
}

#[derive(serde::Deserialize)]
pub struct StartGenerationRequest {
    pub content: String,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub allowed_integrations: Option<Vec<String>>,
}

pub async fn start_generation_endpoint(
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<StartGenerationRequest>,
) -> axum::response::Response {
    let user = auth::user_id(&headers);
    let options = StartOptions {
        auto_approve: payload.auto_approve,
        allowed_integrations: payload.allowed_integrations,
    };
    match state
        .generations
        .start(&conversation_id, &user, &payload.content, options)
        .await
    {
        Ok(generation_id) => (
            StatusCode::CREATED,
            Json(json!({ "generation_id": generation_id, "status": "running" })),
        )
            .into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// Event stream for one generation. For a generation that already reached a
/// terminal state this yields a single synthesized terminal event; otherwise
/// the live stream runs until (and including) the terminal event.
pub async fn generation_events_endpoint(
    Path(generation_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> axum::response::Response {
    let user = auth::user_id(&headers);
    let (status, rx) = match state.generations.subscribe(&generation_id, &user).await {
        Ok(subscription) => subscription,
        Err(e) => return orchestrator_error(e),
    };

    if status.is_terminal() {
        let event = terminal_event(status);
        let stream = tokio_stream::once(Ok::<_, Infallible>(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
        ));
        return Sse::new(stream).into_response();
    }

    let stream = BroadcastStream::new(rx).scan(false, |finished, msg| {
        if *finished {
            return std::future::ready(None);
        }
        let data = match msg {
            Ok(event) => {
                if event.is_terminal() {
                    *finished = true;
                }
                serde_json::to_string(&event).unwrap_or_default()
            }
            Err(_) => json!({ "type": "error", "message": "event stream lagged" }).to_string(),
        };
        std::future::ready(Some(Ok::<_, Infallible>(Event::default().data(data))))
    });
    Sse::new(stream).into_response()
}

fn terminal_event(status: GenerationStatus) -> GenerationEvent {
    match status {
        GenerationStatus::Done => GenerationEvent::Done,
        GenerationStatus::Cancelled => GenerationEvent::Cancelled,
        _ => GenerationEvent::Error {
            message: "generation failed".to_string(),
        },
    }
}

#[derive(serde::Deserialize)]
pub struct ApprovalBody {
    pub decision: ApprovalDecision,
}

pub async fn resolve_approval_endpoint(
    Path(generation_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<ApprovalBody>,
) -> axum::response::Response {
    let user = auth::user_id(&headers);
    match state
        .generations
        .resolve_approval(&generation_id, &user, payload.decision)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

#[derive(serde::Deserialize)]
pub struct AuthResultBody {
    pub integration: String,
    pub success: bool,
    #[serde(default)]
    pub tokens: Option<Value>,
}

pub async fn resolve_auth_endpoint(
    Path(generation_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<AuthResultBody>,
) -> axum::response::Response {
    let user = auth::user_id(&headers);
    let outcome = if payload.success {
        AuthOutcome::Success {
            tokens: payload.tokens.unwrap_or_else(|| json!({})),
        }
    } else {
        AuthOutcome::Failed
    };
    match state
        .generations
        .resolve_auth(&generation_id, &user, &payload.integration, outcome)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

pub async fn cancel_generation_endpoint(
    Path(generation_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> axum::response::Response {
    let user = auth::user_id(&headers);
    match state.generations.cancel(&generation_id, &user).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// Current (most recent) generation for a conversation, with any pending
/// approval or auth request so clients can re-render the prompt after a
/// reconnect.
pub async fn current_generation_endpoint(
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> axum::response::Response {
    let user = auth::user_id(&headers);
    match state
        .generations
        .generation_for_conversation(&conversation_id)
        .await
    {
        Some(generation) if generation.user_id == user => {
            let pending_approval = state.generations.pending_approval(&generation.id).await;
            let pending_auth = state.generations.pending_auth(&generation.id).await;
            Json(json!({
                "id": generation.id,
                "conversation_id": generation.conversation_id,
                "status": generation.status,
                "sandbox_id": generation.sandbox_id,
                "allowed_integrations": generation.allowed_integrations,
                "auto_approve": generation.auto_approve,
                "created_at_ms": generation.created_at_ms,
                "completed_at_ms": generation.completed_at_ms,
                "pending_approval": pending_approval,
                "pending_auth": pending_auth,
            }))
            .into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "no generation for this conversation" })),
        )
            .into_response(),
    }
}
