use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, token_count: usize) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            token_count,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The persisted state of one conversation.
///
/// `total_token_count` always equals the summary's tokens plus every verbatim
/// message's tokens. Messages are kept in append order; only compaction removes
/// them, and only from the front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<ConversationMessage>,
    #[serde(rename = "total_tokens")]
    pub total_token_count: usize,
    pub summary: Option<String>,
    #[serde(default)]
    pub summary_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            total_token_count: 0,
            summary: None,
            summary_tokens: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn verbatim_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.token_count).sum()
    }

    pub fn expected_total(&self) -> usize {
        let summary = if self.summary.is_some() {
            self.summary_tokens
        } else {
            0
        };
        summary + self.verbatim_tokens()
    }

    pub fn is_consistent(&self) -> bool {
        self.total_token_count == self.expected_total()
    }

    pub fn recalculate_total(&mut self) {
        if self.summary.is_none() {
            self.summary_tokens = 0;
        }
        self.total_token_count = self.expected_total();
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.total_token_count += message.token_count;
        self.last_activity = message.timestamp;
        self.messages.push(message);
    }

    /// Index of the first message to keep verbatim so that the kept tail holds
    /// at least `keep_tokens` tokens. Zero means nothing is old enough to fold.
    pub fn split_point(&self, keep_tokens: usize) -> usize {
        let mut kept = 0;
        let mut split = self.messages.len();
        for (index, message) in self.messages.iter().enumerate().rev() {
            if kept >= keep_tokens {
                break;
            }
            kept += message.token_count;
            split = index;
        }
        split
    }

    /// The summary (if any) followed by the most recent messages that fit in
    /// what is left of `max_tokens`, oldest first.
    pub fn render(&self, max_tokens: usize) -> String {
        let mut sections = Vec::new();
        let mut budget = max_tokens;

        if let Some(summary) = &self.summary {
            sections.push(format!("Summary of earlier conversation:\n{summary}"));
            budget = budget.saturating_sub(self.summary_tokens);
        }

        let mut window = Vec::new();
        let mut used = 0;
        for message in self.messages.iter().rev() {
            if used + message.token_count > budget {
                break;
            }
            used += message.token_count;
            window.push(format!("{}: {}", message.role, message.content));
        }

        if !window.is_empty() {
            window.reverse();
            sections.push(format!("Recent conversation:\n{}", window.join("\n")));
        }

        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: MessageRole, content: &str, tokens: usize) -> ConversationMessage {
        ConversationMessage::new(role, content, tokens)
    }

    #[test]
    fn test_push_tracks_totals() {
        let mut conversation = Conversation::new("c1");
        conversation.push(message(MessageRole::User, "hi", 3));
        conversation.push(message(MessageRole::Assistant, "hello", 4));
        assert_eq!(conversation.total_token_count, 7);
        assert!(conversation.is_consistent());
        assert_eq!(conversation.last_activity, conversation.messages[1].timestamp);
    }

    #[test]
    fn test_split_point_keeps_at_least_the_requested_tokens() {
        let mut conversation = Conversation::new("c1");
        for _ in 0..10 {
            conversation.push(message(MessageRole::User, "x", 150));
        }
        // Everything fits in the verbatim tail.
        assert_eq!(conversation.split_point(2000), 0);

        let mut long = Conversation::new("c2");
        for _ in 0..40 {
            long.push(message(MessageRole::User, "x", 150));
        }
        // 13 * 150 = 1950 < 2000, so a 14th message is kept.
        let split = long.split_point(2000);
        assert_eq!(split, 26);
        assert!(long.messages[split..].iter().map(|m| m.token_count).sum::<usize>() >= 2000);
    }

    #[test]
    fn test_render_prefers_recent_messages() {
        let mut conversation = Conversation::new("c1");
        conversation.summary = Some("They talked about boats.".into());
        conversation.summary_tokens = 5;
        conversation.push(message(MessageRole::User, "first", 10));
        conversation.push(message(MessageRole::Assistant, "second", 10));
        conversation.push(message(MessageRole::User, "third", 10));
        conversation.recalculate_total();

        let rendered = conversation.render(25);
        assert!(rendered.starts_with("Summary of earlier conversation:\nThey talked about boats."));
        assert!(!rendered.contains("first"));
        assert!(rendered.contains("assistant: second\nuser: third"));
    }

    #[test]
    fn test_render_empty_conversation() {
        assert_eq!(Conversation::new("c1").render(100), "");
    }

    #[test]
    fn test_serialized_shape() {
        let mut conversation = Conversation::new("c1");
        conversation.push(message(MessageRole::Tool, "{}", 1));
        let value = serde_json::to_value(&conversation).unwrap();
        assert_eq!(value["total_tokens"], 1);
        assert_eq!(value["messages"][0]["role"], "tool");
        assert!(value["messages"][0].get("metadata").is_none());
        let back: Conversation = serde_json::from_value(value).unwrap();
        assert_eq!(back, conversation);
    }
}
