//! Uniform interface to language-model providers.
//!
//! Concrete adapters (HTTP APIs, local runtimes) live outside the core;
//! everything in the pipeline talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Tool definition sent to the model API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from the model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Full `"provider/model"` id; the gateway routes on the prefix.
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// Raw JSON messages for the tool loop (overrides `messages` when set).
    /// Structured content blocks (tool_use, tool_result) can't be
    /// represented as plain strings.
    pub raw_messages: Option<Vec<serde_json::Value>>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
    /// When set, the model MUST call this tool (single-tool extraction
    /// calls like preprocessing).
    pub forced_tool: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: StopReason,
    /// Empty when no tools were called.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    /// Arguments of the single expected tool call, for extraction-style
    /// requests. `None` when the model called nothing.
    pub fn tool_arguments(&self) -> Option<&serde_json::Value> {
        self.tool_calls.first().map(|c| &c.input)
    }
}

/// Events emitted during a streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content.
    TextDelta { text: String },
    /// The model wants to call a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Stream completed.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: StopReason,
    },
    /// Error during streaming.
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("No model produced a response (tried {attempts} models)")]
    Exhausted { attempts: usize },
}

/// Common interface for all model providers.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Gateway name for logging.
    fn name(&self) -> &str;

    /// Send a request and wait for the full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits TextDelta + Done.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        if !resp.content.is_empty() {
            let _ = tx
                .send(StreamEvent::TextDelta {
                    text: resp.content.clone(),
                })
                .await;
        }
        for call in &resp.tool_calls {
            let _ = tx
                .send(StreamEvent::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }
}
