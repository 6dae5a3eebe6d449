//! The model-gateway contract: uniform request/response/stream shapes over
//! any language-model provider, plus fallback-chain calling and token
//! budgeting helpers.

pub mod context;
pub mod fallback;
pub mod gateway;
pub mod scripted;

pub use fallback::send_with_fallbacks;
pub use gateway::{
    ChatMessage, ChatRequest, ChatResponse, ModelGateway, ProviderError, StopReason, StreamEvent,
    ToolCall, ToolDefinition,
};
pub use scripted::ScriptedGateway;
