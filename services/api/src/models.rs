//! API Models
//!
//! Request and response bodies for the REST surface, documented with `utoipa`.

use chrono::{DateTime, Utc};
use parley_core::{Conversation, ConversationMessage, MessageRole};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MessageView {
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[schema(value_type = Object)]
    pub metadata: Map<String, Value>,
}

impl From<ConversationMessage> for MessageView {
    fn from(message: ConversationMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            timestamp: message.timestamp,
            token_count: message.token_count,
            metadata: message.metadata,
        }
    }
}

/// A conversation as persisted: recent messages plus the running summary.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ConversationDocument {
    #[schema(example = "default")]
    pub id: String,
    pub messages: Vec<MessageView>,
    pub total_tokens: usize,
    pub summary: Option<String>,
    pub summary_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<Conversation> for ConversationDocument {
    fn from(conversation: Conversation) -> Self {
        Self {
            id: conversation.id,
            messages: conversation.messages.into_iter().map(MessageView::from).collect(),
            total_tokens: conversation.total_token_count,
            summary: conversation.summary,
            summary_tokens: conversation.summary_tokens,
            created_at: conversation.created_at,
            last_activity: conversation.last_activity,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ContextResponse {
    pub context: String,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct AddMessagePayload {
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    #[schema(example = "Remind me to water the plants.")]
    pub content: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub session_active: bool,
    /// Compactions that fell back to truncation since startup.
    pub summarizer_fallbacks: u64,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
