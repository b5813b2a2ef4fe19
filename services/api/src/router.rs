//! Axum Router Configuration
//!
//! Routes for the REST API, the voice WebSocket endpoint and the OpenAPI
//! documentation.

use crate::{
    handlers,
    models::{
        AddMessagePayload, ContextResponse, ConversationDocument, ErrorResponse, HealthResponse,
        MessageView,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::get_conversation,
        handlers::get_context,
        handlers::add_message,
        handlers::delete_conversation,
    ),
    components(
        schemas(ConversationDocument, MessageView, ContextResponse, AddMessagePayload, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Parley API", description = "Voice sessions and conversation memory")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/conversations/{id}",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route("/conversations/{id}/context", get(handlers::get_context))
        .route(
            "/conversations/{id}/messages",
            axum::routing::post(handlers::add_message),
        )
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    // Swagger UI is stateless; merge it alongside the stateful routes.
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
