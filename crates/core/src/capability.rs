//! The seam between the voice bridge and whatever actually runs tools.

use async_trait::async_trait;
use rmcp::{
    ServerHandler, ServiceExt,
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolExecutionError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool failed: {0}")]
    Failed(String),

    #[error("Tool timed out after {0:?}")]
    Timeout(Duration),
}

/// A tool the model may call, as advertised at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Runs named capabilities with JSON parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// The capabilities this executor can run.
    async fn capabilities(&self) -> Result<Vec<CapabilitySpec>, ToolExecutionError>;

    /// Runs `name` with `params` and returns its JSON result.
    async fn execute(&self, name: &str, params: Value) -> Result<Value, ToolExecutionError>;
}

/// Executes capabilities through an MCP client connection.
pub struct McpCapabilityExecutor {
    client: RunningService<RoleClient, ()>,
    server: Option<JoinHandle<()>>,
    known: Mutex<Option<HashSet<String>>>,
}

impl McpCapabilityExecutor {
    pub fn new(client: RunningService<RoleClient, ()>) -> Self {
        Self {
            client,
            server: None,
            known: Mutex::new(None),
        }
    }

    /// Serves `server` on an in-process duplex and connects a client to it.
    pub async fn serve_in_process<S: ServerHandler>(server: S) -> Result<Self, ToolExecutionError> {
        let (server_transport, client_transport) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            match server.serve(server_transport).await {
                Ok(service) => {
                    let _ = service.waiting().await;
                }
                Err(e) => debug!(error = %e, "In-process tool server failed to start."),
            }
        });
        let client = ()
            .serve(client_transport)
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("tool client failed to start: {e}")))?;
        info!("Connected to in-process tool server.");
        Ok(Self {
            client,
            server: Some(handle),
            known: Mutex::new(None),
        })
    }

    fn is_unknown(&self, name: &str) -> bool {
        self.known
            .lock()
            .ok()
            .and_then(|known| known.as_ref().map(|names| !names.contains(name)))
            .unwrap_or(false)
    }
}

impl Drop for McpCapabilityExecutor {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

#[async_trait]
impl CapabilityExecutor for McpCapabilityExecutor {
    async fn capabilities(&self) -> Result<Vec<CapabilitySpec>, ToolExecutionError> {
        let tools = self
            .client
            .list_all_tools()
            .await
            .map_err(|e| ToolExecutionError::Failed(e.to_string()))?;

        let specs: Vec<CapabilitySpec> = tools
            .into_iter()
            .map(|tool| CapabilitySpec {
                name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object((*tool.input_schema).clone()),
            })
            .collect();

        if let Ok(mut known) = self.known.lock() {
            *known = Some(specs.iter().map(|spec| spec.name.clone()).collect());
        }
        Ok(specs)
    }

    async fn execute(&self, name: &str, params: Value) -> Result<Value, ToolExecutionError> {
        if self.is_unknown(name) {
            return Err(ToolExecutionError::UnknownTool(name.to_string()));
        }
        let arguments = match params {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(ToolExecutionError::Failed(format!(
                    "arguments must be a JSON object, got {other}"
                )));
            }
        };

        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| ToolExecutionError::Failed(e.to_string()))?;

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .filter_map(|content| match content.raw {
                RawContent::Text(text_content) => Some(text_content.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            return Err(ToolExecutionError::Failed(text));
        }
        match result.structured_content {
            Some(structured) if text.is_empty() => Ok(structured),
            _ => Ok(Value::String(text)),
        }
    }
}
