//! Built-in tools that let the model work with its own conversation memory.
//!
//! The service is exposed over the Model Context Protocol so it can be served
//! next to any other MCP tool server and executed through
//! [`McpCapabilityExecutor`](crate::capability::McpCapabilityExecutor).

use crate::context::ConversationManager;
use crate::conversation::MessageRole;
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

/// Arguments for the `add_note` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct AddNoteArgs {
    #[schemars(description = "A short fact or reminder worth keeping for later in the conversation")]
    pub note: String,
}

#[derive(Clone)]
pub struct ConversationTools {
    manager: Arc<ConversationManager>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for ConversationTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Tools for recalling and annotating the current conversation's memory.".into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl ConversationTools {
    pub fn new(manager: Arc<ConversationManager>) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Recall the conversation so far: a summary of older turns followed by the most recent messages."
    )]
    pub async fn recall_conversation(&self) -> Result<String, String> {
        info!("Executing tool 'recall_conversation'");
        let context = self.manager.get_context().await;
        if context.is_empty() {
            Ok("The conversation has no history yet.".to_string())
        } else {
            Ok(context)
        }
    }

    #[tool(description = "Report how many messages and tokens the conversation memory holds.")]
    pub async fn conversation_stats(&self) -> Result<String, String> {
        info!("Executing tool 'conversation_stats'");
        let snapshot = self.manager.snapshot().await;
        let stats = json!({
            "conversation_id": snapshot.id,
            "messages": snapshot.messages.len(),
            "total_tokens": snapshot.total_token_count,
            "summary_tokens": snapshot.summary_tokens,
            "has_summary": snapshot.summary.is_some(),
            "max_tokens": self.manager.config().max_tokens,
        });
        serde_json::to_string(&stats).map_err(|e| format!("Failed to serialize stats: {e}"))
    }

    #[tool(description = "Save a short note to the conversation memory so it can be recalled later.")]
    pub async fn add_note(&self, args: Parameters<AddNoteArgs>) -> Result<String, String> {
        let note = args.0.note.trim();
        if note.is_empty() {
            return Err("Note must not be empty.".to_string());
        }
        info!(chars = note.len(), "Executing tool 'add_note'");
        let mut metadata = Map::new();
        metadata.insert("source".into(), Value::String("note".into()));
        self.manager
            .add_message_with_metadata(MessageRole::System, note, metadata)
            .await;
        Ok("OK. Note saved.".to_string())
    }
}
