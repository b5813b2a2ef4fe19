//! Conversation memory and tool execution for the voice bridge.
//!
//! - `context`: the token-budgeted [`ConversationManager`].
//! - `store`: durable [`ConversationStore`] backends.
//! - `summarizer`: the [`Summarizer`] seam and its chat-completion backend.
//! - `capability`: the [`CapabilityExecutor`] seam and its MCP client backend.
//! - `memory_tools`: MCP tools over the conversation memory itself.

pub mod capability;
pub mod context;
pub mod conversation;
pub mod error;
pub mod memory_tools;
pub mod store;
pub mod summarizer;
pub mod tokens;

pub use capability::{CapabilityExecutor, CapabilitySpec, McpCapabilityExecutor, ToolExecutionError};
pub use context::{ContextConfig, ConversationManager};
pub use conversation::{Conversation, ConversationMessage, MessageRole};
pub use error::ContextError;
pub use memory_tools::ConversationTools;
pub use store::{ConversationStore, FileConversationStore, MemoryConversationStore};
pub use summarizer::{LlmSummarizer, Summarizer};
pub use tokens::{ApproxTokenCounter, TokenCounter};
