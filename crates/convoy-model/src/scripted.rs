//! Deterministic gateway double.
//!
//! Used by the pipeline test-suites and by local dry runs: responses are
//! scripted per model id and consumed in order, so a tool loop can be
//! driven through `tool_use → text` sequences without a live provider.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::gateway::{
    ChatRequest, ChatResponse, ModelGateway, ProviderError, StopReason, StreamEvent, ToolCall,
};

#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<HashMap<String, VecDeque<ChatResponse>>>,
    streams: Mutex<HashMap<String, VecDeque<Vec<StreamEvent>>>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text completion for a model.
    pub fn script_text(&self, model: &str, text: &str) {
        self.script_response(
            model,
            ChatResponse {
                content: text.to_string(),
                model: model.to_string(),
                tokens_in: 10,
                tokens_out: 10,
                stop_reason: StopReason::EndTurn,
                tool_calls: Vec::new(),
            },
        );
    }

    /// Queue a single-tool-call completion (e.g. a preprocessing result).
    pub fn script_tool_call(&self, model: &str, name: &str, input: serde_json::Value) {
        self.script_response(
            model,
            ChatResponse {
                content: String::new(),
                model: model.to_string(),
                tokens_in: 10,
                tokens_out: 10,
                stop_reason: StopReason::ToolUse,
                tool_calls: vec![ToolCall {
                    id: format!("call-{name}"),
                    name: name.to_string(),
                    input,
                }],
            },
        );
    }

    pub fn script_response(&self, model: &str, response: ChatResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(response);
    }

    /// Queue an explicit event sequence for one `send_stream` call.
    pub fn script_stream(&self, model: &str, events: Vec<StreamEvent>) {
        self.streams
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(events);
    }

    /// Make every call to this model fail.
    pub fn fail_model(&self, model: &str, _reason: &str) {
        self.failing.lock().unwrap().insert(model.to_string());
    }

    /// Requests seen so far, for assertions.
    pub fn request_log(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, req: &ChatRequest) {
        self.requests.lock().unwrap().push(req.clone());
    }

    fn next_response(&self, model: &str) -> Result<ChatResponse, ProviderError> {
        if self.failing.lock().unwrap().contains(model) {
            return Err(ProviderError::Unavailable(format!(
                "scripted failure for {model}"
            )));
        }
        self.responses
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| {
                ProviderError::Unavailable(format!("no scripted response for {model}"))
            })
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.record(req);
        self.next_response(&req.model)
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let scripted = self
            .streams
            .lock()
            .unwrap()
            .get_mut(&req.model)
            .and_then(|q| q.pop_front());

        if let Some(events) = scripted {
            self.record(req);
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        // No scripted stream: emit the next scripted response as events.
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
