//! Streaming chat backend.
//!
//! The request carries the full message history as raw content-block JSON
//! (the tool round-trip rebuilds it each continuation), plus tool schemas.
//! The response is a server-sent-event stream: text deltas, reasoning
//! deltas, and tool-call blocks, terminated by a usage summary.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BackendError, Result};

const API_VERSION: &str = "2023-06-01";

/// Schema advertised to the model for one callable tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One streamed completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    /// Raw message objects: `{"role": …, "content": …}` where content is a
    /// string or a content-block array (tool results travel as blocks).
    pub messages: Vec<Value>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Events emitted while a completion streams.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// Incremental answer text.
    Token { text: String },
    /// Incremental reasoning text, when the backend exposes it.
    Reasoning { text: String },
    /// The model requests a tool invocation; input is fully accumulated.
    ToolCall { id: String, name: String, input: Value },
    /// Stream completed.
    Done {
        stop_reason: String,
        tokens_in: u32,
        tokens_out: u32,
    },
    /// Stream failed mid-flight.
    Error { message: String },
}

#[async_trait]
pub trait LanguageBackend: Send + Sync {
    /// Stream a completion, pushing events into `tx` until `Done`/`Error`
    /// or cancellation. Returns once the stream is fully drained.
    async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<LlmEvent>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// HTTP implementation speaking the Anthropic-style messages API.
pub struct HttpLanguageBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLanguageBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn build_body(req: &ChatRequest) -> Value {
        let mut body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": req.messages,
            "stream": true,
        });
        if !req.system.is_empty() {
            body["system"] = Value::String(req.system.clone());
        }
        if !req.tools.is_empty() {
            body["tools"] = serde_json::to_value(&req.tools).unwrap_or(Value::Null);
        }
        body
    }
}

#[async_trait]
impl LanguageBackend for HttpLanguageBackend {
    async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<LlmEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        use futures_util::StreamExt;

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %req.model, "sending streaming chat request");

        let resp = self
            .http
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("x-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&Self::build_body(req))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, "chat backend error");
            return Err(BackendError::Api { status, body });
        }

        let mut sse = SseState::default();
        let mut line_buf = String::new();
        let mut byte_stream = resp.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                chunk = byte_stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(BackendError::Http)?;
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };

            // SSE: several lines per chunk; keep the trailing partial line.
            line_buf.push_str(text);
            while let Some(pos) = line_buf.find('\n') {
                let line = line_buf[..pos].trim().to_string();
                line_buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                if let Some(event) = sse.on_line(&line) {
                    if tx.send(event).await.is_err() {
                        return Ok(()); // receiver dropped
                    }
                }
            }
        }

        let _ = tx
            .send(LlmEvent::Done {
                stop_reason: sse.stop_reason,
                tokens_in: sse.tokens_in,
                tokens_out: sse.tokens_out,
            })
            .await;
        Ok(())
    }
}

/// Accumulates SSE parser state across lines: the current event name, the
/// open content block, and partial tool-call JSON.
#[derive(Default)]
struct SseState {
    event: String,
    block_type: String,
    tool_id: String,
    tool_name: String,
    tool_input_json: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

impl SseState {
    fn on_line(&mut self, line: &str) -> Option<LlmEvent> {
        if let Some(event) = line.strip_prefix("event: ") {
            self.event = event.to_string();
            return None;
        }
        let data = line.strip_prefix("data: ")?;
        self.on_data(data)
    }

    fn on_data(&mut self, data: &str) -> Option<LlmEvent> {
        match self.event.as_str() {
            "message_start" => {
                if let Ok(start) = serde_json::from_str::<MessageStart>(data) {
                    self.tokens_in = start.message.usage.input_tokens;
                }
                None
            }
            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<BlockStart>(data) {
                    self.block_type = start.content_block.block_type.clone();
                    if self.block_type == "tool_use" {
                        self.tool_id = start.content_block.id.unwrap_or_default();
                        self.tool_name = start.content_block.name.unwrap_or_default();
                        self.tool_input_json.clear();
                    }
                }
                None
            }
            "content_block_delta" => {
                let delta = serde_json::from_str::<BlockDelta>(data).ok()?;
                match delta.delta.delta_type.as_str() {
                    "text_delta" => delta.delta.text.map(|text| LlmEvent::Token { text }),
                    "thinking_delta" => delta
                        .delta
                        .thinking
                        .map(|text| LlmEvent::Reasoning { text }),
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            self.tool_input_json.push_str(&partial);
                        }
                        None
                    }
                    other => {
                        debug!(delta_type = other, "unhandled stream delta type");
                        None
                    }
                }
            }
            "content_block_stop" => {
                if self.block_type == "tool_use" {
                    let input = serde_json::from_str(&self.tool_input_json)
                        .unwrap_or(Value::Object(Default::default()));
                    self.block_type.clear();
                    self.tool_input_json.clear();
                    return Some(LlmEvent::ToolCall {
                        id: std::mem::take(&mut self.tool_id),
                        name: std::mem::take(&mut self.tool_name),
                        input,
                    });
                }
                self.block_type.clear();
                None
            }
            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.tokens_out = delta.usage.output_tokens;
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                None
            }
            "error" => {
                warn!(data, "chat stream error event");
                Some(LlmEvent::Error {
                    message: data.to_string(),
                })
            }
            _ => None,
        }
    }
}

// SSE data shapes (deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct BlockStart {
    content_block: BlockMeta,
}

#[derive(Deserialize)]
struct BlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct BlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut SseState, lines: &[&str]) -> Vec<LlmEvent> {
        lines.iter().filter_map(|l| state.on_line(l)).collect()
    }

    #[test]
    fn text_deltas_become_tokens() {
        let mut state = SseState::default();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"text"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"text_delta","text":"Hello"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"text_delta","text":" there."}}"#,
            ],
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], LlmEvent::Token { text } if text == "Hello"));
    }

    #[test]
    fn tool_call_json_accumulates_across_deltas() {
        let mut state = SseState::default();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"tool_use","id":"tu_1","name":"get_weather"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"\"Tokyo\"}"}}"#,
                "event: content_block_stop",
                r#"data: {}"#,
            ],
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            LlmEvent::ToolCall { id, name, input } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Tokyo");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn usage_and_stop_reason_are_captured() {
        let mut state = SseState::default();
        feed(
            &mut state,
            &[
                "event: message_start",
                r#"data: {"message":{"usage":{"input_tokens":12}}}"#,
                "event: message_delta",
                r#"data: {"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":34}}"#,
            ],
        );
        assert_eq!(state.tokens_in, 12);
        assert_eq!(state.tokens_out, 34);
        assert_eq!(state.stop_reason, "end_turn");
    }

    #[test]
    fn reasoning_deltas_surface_separately() {
        let mut state = SseState::default();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"thinking"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"thinking_delta","thinking":"Considering."}}"#,
            ],
        );
        assert!(matches!(&events[0], LlmEvent::Reasoning { text } if text == "Considering."));
    }
}
