//! Accepts client WebSocket connections and hands them to a [`SessionBridge`].

use super::bridge::SessionBridge;
use super::protocol::{ClientFrame, ServerMessage};
use crate::state::AppState;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parley_core::{ConversationTools, McpCapabilityExecutor};
use parley_realtime::RealtimeClient;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, instrument, warn};
use uuid::Uuid;

const DEFAULT_CONVERSATION: &str = "default";

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Axum handler to upgrade an HTTP connection to a voice session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let conversation_id = params
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, conversation_id))
}

/// Runs one voice session over an upgraded socket.
///
/// The connection becomes the active session immediately, replacing any
/// session that was active before it.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, conversation_id: String) {
    let session_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("session_id", session_id.as_str());
    info!(%conversation_id, "New voice connection.");

    let lease = state.registry.acquire(&session_id);
    let manager = state.conversations.get(&conversation_id).await;

    let (socket_tx, socket_rx) = socket.split();
    let mut sink = Box::pin(
        socket_tx
            .sink_map_err(anyhow::Error::from)
            .with(|message: ServerMessage| async move {
                let text = serde_json::to_string(&message)?;
                Ok::<_, anyhow::Error>(Message::Text(text.into()))
            }),
    );
    let frames = socket_rx.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => Some(ClientFrame::Text(text.to_string())),
            Ok(Message::Binary(bytes)) => Some(ClientFrame::Binary(bytes.to_vec())),
            Ok(Message::Close(_)) => Some(ClientFrame::Close),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => {
                warn!(error = %e, "Error receiving from client WebSocket.");
                Some(ClientFrame::Close)
            }
        }
    });

    let executor =
        match McpCapabilityExecutor::serve_in_process(ConversationTools::new(Arc::clone(&manager)))
            .await
        {
            Ok(executor) => Arc::new(executor),
            Err(e) => {
                error!(error = %e, "Failed to start conversation tools.");
                let _ = sink
                    .send(ServerMessage::Error {
                        message: "Session tools are unavailable.".into(),
                    })
                    .await;
                lease.release();
                return;
            }
        };

    let client = Arc::new(RealtimeClient::new(
        Arc::clone(&state.connector),
        state.client_config(),
    ));
    let bridge = SessionBridge::new(session_id.as_str(), client, executor, state.bridge_settings())
        .with_conversation(manager);

    let span = info_span!("voice_session", %session_id, %conversation_id);
    match bridge.run(lease, sink, frames).instrument(span).await {
        Ok(()) => info!("Voice session finished."),
        Err(e) => error!(error = ?e, "Voice session terminated with error."),
    }
}
