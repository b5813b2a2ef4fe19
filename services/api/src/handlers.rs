//! Axum Handlers for the REST API
//!
//! Health and conversation-memory endpoints. Each handler carries a
//! `utoipa::path` annotation for the generated OpenAPI document.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    models::{
        AddMessagePayload, ContextResponse, ConversationDocument, ErrorResponse, HealthResponse,
        MessageView,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("Conversation '{id}' not found"))
}

/// Service health, the active-session flag and the summarizer fallback count.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        session_active: state.registry.is_active(),
        summarizer_fallbacks: state.conversations.fallback_count().await,
    })
}

/// Retrieve a conversation document.
#[utoipa::path(
    get,
    path = "/conversations/{id}",
    responses(
        (status = 200, description = "Conversation found", body = ConversationDocument),
        (status = 404, description = "Conversation not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Conversation id")
    )
)]
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDocument>, ApiError> {
    let manager = state.conversations.find(&id).await?.ok_or_else(|| not_found(&id))?;
    Ok(Json(manager.snapshot().await.into()))
}

/// Render the conversation as model context: the summary, then recent messages.
#[utoipa::path(
    get,
    path = "/conversations/{id}/context",
    responses(
        (status = 200, description = "Rendered context", body = ContextResponse),
        (status = 404, description = "Conversation not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Conversation id")
    )
)]
pub async fn get_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContextResponse>, ApiError> {
    let manager = state.conversations.find(&id).await?.ok_or_else(|| not_found(&id))?;
    Ok(Json(ContextResponse {
        context: manager.get_context().await,
    }))
}

/// Append a message, creating the conversation if needed.
#[utoipa::path(
    post,
    path = "/conversations/{id}/messages",
    request_body = AddMessagePayload,
    responses(
        (status = 201, description = "Message recorded", body = MessageView),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Conversation id")
    )
)]
pub async fn add_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<AddMessagePayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.content.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Message content must not be empty".to_string(),
        ));
    }
    let manager = state.conversations.get(&id).await;
    let message = manager.add_message(payload.role, &payload.content).await;
    Ok((StatusCode::CREATED, Json(MessageView::from(message))))
}

/// Clear a conversation's messages and summary.
#[utoipa::path(
    delete,
    path = "/conversations/{id}",
    responses(
        (status = 204, description = "Conversation cleared"),
        (status = 404, description = "Conversation not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Conversation id")
    )
)]
pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let manager = state.conversations.find(&id).await?.ok_or_else(|| not_found(&id))?;
    manager.clear().await;
    info!(conversation_id = %id, "Conversation cleared via API.");
    Ok(StatusCode::NO_CONTENT)
}
