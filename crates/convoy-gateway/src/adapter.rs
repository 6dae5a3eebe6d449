//! Default model-gateway adapter: any OpenAI-compatible chat API.
//!
//! Deployment glue, not part of the core contract — richer provider
//! fan-out lives behind the same `ModelGateway` trait. Model ids arrive as
//! `"provider/model"`; the provider prefix routes (and is stripped) here.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use convoy_model::{
    ChatRequest, ChatResponse, ModelGateway, ProviderError, StopReason, StreamEvent, ToolCall,
};

pub struct OpenAiCompatGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("CONVOY_MODEL_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());
        let api_key = std::env::var("CONVOY_MODEL_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            warn!("CONVOY_MODEL_API_KEY not set, model calls will be unauthenticated");
        }
        Self::new(base_url, api_key)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        // The wire model id is the part after the provider prefix.
        let model = req
            .model
            .split_once('/')
            .map(|(_, m)| m)
            .unwrap_or(&req.model);

        let mut messages = vec![json!({"role": "system", "content": req.system})];
        if let Some(raw) = &req.raw_messages {
            for msg in raw {
                messages.push(wire_message(msg));
            }
        } else {
            for m in &req.messages {
                messages.push(json!({"role": m.role, "content": m.content}));
            }
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": stream,
        });
        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                }))
                .collect::<Vec<_>>());
        }
        if let Some(name) = &req.forced_tool {
            body["tool_choice"] = json!({"type": "function", "function": {"name": name}});
        }
        body
    }

    async fn post(
        &self,
        body: &Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, body = %message, "model API error");
            return Err(ProviderError::Api { status, message });
        }
        Ok(resp)
    }
}

/// Our raw tool-loop messages are nearly wire-shaped already; assistant
/// tool calls get their arguments stringified and tool results drop the
/// internal `is_error` marker.
fn wire_message(msg: &Value) -> Value {
    match msg.get("role").and_then(Value::as_str) {
        Some("assistant") if msg.get("tool_calls").is_some() => {
            let calls: Vec<Value> = msg["tool_calls"]
                .as_array()
                .map(|calls| {
                    calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c["id"],
                                "type": "function",
                                "function": {
                                    "name": c["name"],
                                    "arguments": c["input"].to_string(),
                                }
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            json!({
                "role": "assistant",
                "content": msg.get("content").cloned().unwrap_or(Value::Null),
                "tool_calls": calls,
            })
        }
        Some("tool") => json!({
            "role": "tool",
            "tool_call_id": msg.get("tool_call_id").cloned().unwrap_or_default(),
            "content": msg.get("content").cloned().unwrap_or_default(),
        }),
        _ => msg.clone(),
    }
}

fn map_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("stop") | Some("end_turn") => StopReason::EndTurn,
        Some("tool_calls") | Some("tool_use") => StopReason::ToolUse,
        Some("length") | Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatGateway {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(model = %req.model, "sending model request");
        let resp = self.post(&self.build_body(req, false)).await?;
        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let choice = api.choices.into_iter().next();
        let content = choice
            .as_ref()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let tool_calls = choice
            .as_ref()
            .and_then(|c| c.message.tool_calls.as_ref())
            .map(|calls| {
                calls
                    .iter()
                    .map(|tc| ToolCall {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        input: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let stop_reason = map_stop_reason(choice.and_then(|c| c.finish_reason).as_deref());

        Ok(ChatResponse {
            content,
            model: api.model,
            tokens_in: api.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: api.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            stop_reason,
            tool_calls,
        })
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        debug!(model = %req.model, "sending streaming model request");
        let resp = self.post(&self.build_body(req, true)).await?;

        let model = req.model.clone();
        let mut line_buf = String::new();
        let mut stop_reason = StopReason::EndTurn;
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;
        // Tool calls stream as fragments keyed by index; flushed at the end.
        let mut pending_calls: Vec<(String, String, String)> = Vec::new();

        let mut bytes = resp.bytes_stream();
        'stream: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return Ok(());
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };
            line_buf.push_str(text);

            while let Some(newline) = line_buf.find('\n') {
                let line = line_buf[..newline].trim().to_string();
                line_buf.drain(..=newline);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    break 'stream;
                }
                let Ok(delta) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                if let Some(usage) = &delta.usage {
                    tokens_in = usage.prompt_tokens;
                    tokens_out = usage.completion_tokens;
                }
                for choice in &delta.choices {
                    if let Some(reason) = choice.finish_reason.as_deref() {
                        stop_reason = map_stop_reason(Some(reason));
                    }
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty()
                            && tx
                                .send(StreamEvent::TextDelta {
                                    text: content.clone(),
                                })
                                .await
                                .is_err()
                        {
                            return Ok(());
                        }
                    }
                    for fragment in choice.delta.tool_calls.iter().flatten() {
                        let index = fragment.index.unwrap_or(0);
                        while pending_calls.len() <= index {
                            pending_calls.push((String::new(), String::new(), String::new()));
                        }
                        let slot = &mut pending_calls[index];
                        if let Some(id) = &fragment.id {
                            slot.0 = id.clone();
                        }
                        if let Some(name) = fragment.function.as_ref().and_then(|f| f.name.clone())
                        {
                            slot.1 = name;
                        }
                        if let Some(args) = fragment
                            .function
                            .as_ref()
                            .and_then(|f| f.arguments.clone())
                        {
                            slot.2.push_str(&args);
                        }
                    }
                }
            }
        }

        for (id, name, arguments) in pending_calls {
            if name.is_empty() {
                continue;
            }
            let input = serde_json::from_str(&arguments).unwrap_or(json!({}));
            if tx
                .send(StreamEvent::ToolUse { id, name, input })
                .await
                .is_err()
            {
                return Ok(());
            }
        }

        let _ = tx
            .send(StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            })
            .await;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallFragment>>,
}

#[derive(Deserialize)]
struct StreamToolCallFragment {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionFragment>,
}

#[derive(Deserialize)]
struct StreamFunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_model::ChatMessage;

    #[test]
    fn body_strips_provider_prefix_and_forces_tool() {
        let gateway = OpenAiCompatGateway::new("http://localhost".into(), "k".into());
        let req = ChatRequest {
            model: "mistral/mistral-small-latest".into(),
            system: "sys".into(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            raw_messages: None,
            max_tokens: 100,
            temperature: Some(0.3),
            tools: vec![],
            forced_tool: Some("preprocess_request".into()),
        };
        let body = gateway.build_body(&req, false);
        assert_eq!(body["model"], "mistral-small-latest");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(
            body["tool_choice"]["function"]["name"],
            "preprocess_request"
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn wire_message_converts_tool_shapes() {
        let assistant = json!({
            "role": "assistant",
            "content": "thinking",
            "tool_calls": [{"id": "c1", "name": "web-search", "input": {"q": "x"}}],
        });
        let wired = wire_message(&assistant);
        assert_eq!(wired["tool_calls"][0]["type"], "function");
        assert_eq!(wired["tool_calls"][0]["function"]["name"], "web-search");
        assert_eq!(
            wired["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"x\"}"
        );

        let tool = json!({
            "role": "tool",
            "tool_call_id": "c1",
            "content": "{\"results\":[]}",
            "is_error": false,
        });
        let wired = wire_message(&tool);
        assert!(wired.get("is_error").is_none());
        assert_eq!(wired["tool_call_id"], "c1");
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(map_stop_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(map_stop_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(map_stop_reason(Some("weird")), StopReason::Other);
        assert_eq!(map_stop_reason(None), StopReason::Other);
    }
}
