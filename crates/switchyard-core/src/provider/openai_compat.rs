use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{Content, FinishReason, Message, OptionBag, Part, Role, StreamEvent, TokenUsage};
use crate::util::http;

use super::{BackendRequest, CompletionStream, LanguageBackend};

/// Message/part option bundle that is spread onto the wire objects.
const WIRE_OPTIONS_KEY: &str = "openaiCompatible";

/// Streaming chat-completions backend.
/// Works with OpenAI, OpenRouter, DeepSeek, Groq, Moonshot, vLLM and any
/// other server speaking the same SSE dialect.
pub struct OpenAiCompatBackend {
    id: String,
    api_key: Option<String>,
    api_base: String,
}

impl OpenAiCompatBackend {
    pub fn new(id: impl Into<String>, api_key: Option<String>, api_base: Option<String>) -> Self {
        let id = id.into();
        let base = api_base.unwrap_or_else(|| default_base(&id).to_string());
        Self {
            id,
            api_key: api_key.filter(|k| !k.is_empty()),
            api_base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Build from `<ID>_API_KEY` and optional `<ID>_API_BASE`.
    pub fn from_env(id: &str) -> Result<Self, ProviderError> {
        let prefix = id.to_uppercase().replace('-', "_");
        let key = std::env::var(format!("{}_API_KEY", prefix))
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::NoApiKey)?;
        let base = std::env::var(format!("{}_API_BASE", prefix)).ok();
        Ok(Self::new(id, Some(key), base))
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

fn default_base(id: &str) -> &'static str {
    match id {
        "openrouter" => "https://openrouter.ai/api/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "moonshot" | "kimi" => "https://api.moonshot.cn/v1",
        "xai" => "https://api.x.ai/v1",
        "mistral" => "https://api.mistral.ai/v1",
        _ => "https://api.openai.com/v1",
    }
}

#[async_trait]
impl LanguageBackend for OpenAiCompatBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = build_body(&request);
        debug!("OpenAI-compat stream to {} with model {}", url, request.model.id);

        let mut builder = http::client()
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let mut bytes = response.bytes_stream();
        let events = async_stream::stream! {
            let mut decoder = ChunkDecoder::default();
            let mut lines = LineBuffer::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = bytes.next() => Some(chunk),
                };
                let Some(chunk) = next else {
                    yield Err(ProviderError::Cancelled);
                    return;
                };
                let chunk = match chunk {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        yield Err(ProviderError::Stream(format!("Stream read error: {}", e)));
                        return;
                    }
                    None => break,
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        None => {}
                        Some(SseLine::Done) => {
                            for ev in decoder.finish() {
                                yield Ok(ev);
                            }
                            return;
                        }
                        Some(SseLine::Data(data)) => match decoder.push(&data) {
                            Ok(evs) => {
                                for ev in evs {
                                    yield Ok(ev);
                                }
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        },
                    }
                }
            }
            if decoder.finished() {
                for ev in decoder.finish() {
                    yield Ok(ev);
                }
            } else {
                yield Err(ProviderError::Stream("Stream ended before completion".to_string()));
            }
        };
        Ok(events.boxed())
    }
}

/// Chat-completions request body for a normalized request.
pub fn build_body(request: &BackendRequest) -> Value {
    let req = &request.request;
    let mut body = json!({
        "model": request.model.id,
        "messages": convert_messages(&req.messages),
        "stream": true,
        "stream_options": {"include_usage": true},
    });

    if let Some(t) = req.params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.params.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(k) = req.params.top_k {
        body["top_k"] = json!(k);
    }
    if let Some(max) = req.params.max_output_tokens {
        body["max_tokens"] = json!(max);
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
        body["tool_choice"] = json!("auto");
    }

    if let Value::Object(map) = &mut body {
        for (key, value) in req.bundle(&request.model.options_key()) {
            map.insert(snake_case(&key), value);
        }
    }
    body
}

/// Convert unified messages to the chat-completions message list. Tool
/// results become separate `tool` messages.
pub fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for msg in messages {
        let mut results: Vec<Value> = Vec::new();
        let mut wire = match (&msg.content, msg.role) {
            (Content::Text(text), Role::Tool) => json!({"role": "tool", "content": text}),
            (Content::Text(text), role) => json!({"role": role.to_string(), "content": text}),
            (Content::Parts(parts), Role::Assistant) => {
                let mut text = String::new();
                let mut reasoning = String::new();
                let mut calls: Vec<Value> = Vec::new();
                for part in parts {
                    match part {
                        Part::Text { text: t, .. } => text.push_str(t),
                        Part::Reasoning { text: t, .. } => reasoning.push_str(t),
                        Part::ToolCall {
                            tool_call_id,
                            tool_name,
                            input,
                            ..
                        } => calls.push(json!({
                            "id": tool_call_id,
                            "type": "function",
                            "function": {"name": tool_name, "arguments": input.to_string()},
                        })),
                        Part::ToolResult { .. } => results.push(tool_message(part)),
                        _ => {}
                    }
                }
                let mut m = json!({"role": "assistant", "content": text});
                if !reasoning.is_empty() {
                    m["reasoning_content"] = json!(reasoning);
                }
                if !calls.is_empty() {
                    m["tool_calls"] = json!(calls);
                }
                m
            }
            (Content::Parts(parts), role) => {
                let mut content: Vec<Value> = Vec::new();
                for part in parts {
                    match part {
                        Part::ToolResult { .. } => results.push(tool_message(part)),
                        _ => {
                            if let Some(v) = content_part(part) {
                                content.push(v);
                            }
                        }
                    }
                }
                if content.is_empty() && !results.is_empty() {
                    out.extend(results);
                    continue;
                }
                json!({"role": role.to_string(), "content": content})
            }
        };
        spread_options(&mut wire, &msg.provider_options);
        out.push(wire);
        out.extend(results);
    }
    out
}

fn content_part(part: &Part) -> Option<Value> {
    let (mut v, options) = match part {
        Part::Text { text, provider_options } => (json!({"type": "text", "text": text}), provider_options),
        Part::Image {
            media_type,
            data,
            provider_options,
        } => (json!({"type": "image_url", "image_url": {"url": data_url(media_type, data)}}), provider_options),
        Part::File {
            media_type,
            data,
            filename,
            provider_options,
        } => (
            json!({"type": "file", "file": {
                "filename": filename.clone().unwrap_or_default(),
                "file_data": data_url(media_type, data),
            }}),
            provider_options,
        ),
        _ => return None,
    };
    spread_options(&mut v, options);
    Some(v)
}

fn tool_message(part: &Part) -> Value {
    match part {
        Part::ToolResult {
            tool_call_id, output, ..
        } => {
            let content = match output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            json!({"role": "tool", "tool_call_id": tool_call_id, "content": content})
        }
        _ => Value::Null,
    }
}

fn data_url(media_type: &str, data: &str) -> String {
    if data.starts_with("data:") || data.starts_with("http://") || data.starts_with("https://") {
        data.to_string()
    } else {
        format!("data:{};base64,{}", media_type, data)
    }
}

fn spread_options(target: &mut Value, options: &OptionBag) {
    if let (Value::Object(map), Some(Value::Object(extra))) = (target, options.get(WIRE_OPTIONS_KEY)) {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
}

/// `reasoningEffort` -> `reasoning_effort`.
pub fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Data(Value),
    Done,
}

/// Parse one SSE line. Comments, blank lines, non-data fields and
/// unparseable payloads are skipped.
/// Splits a byte stream into lines. Bytes are held until their line is
/// complete, so a character split across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, trimmed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }
}

pub fn parse_sse_line(line: &str) -> Option<SseLine> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }
    serde_json::from_str(data).ok().map(SseLine::Data)
}

/// Turns chat-completions chunks into stream events. Tool-call fragments
/// are buffered by index and emitted once the choice finishes.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    tools: BTreeMap<u64, (String, String, String)>,
    reason: Option<FinishReason>,
    usage: TokenUsage,
}

impl ChunkDecoder {
    pub fn push(&mut self, chunk: &Value) -> Result<Vec<StreamEvent>, ProviderError> {
        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(ProviderError::Stream(message));
        }

        if let Some(u) = chunk.get("usage").filter(|u| u.is_object()) {
            let get = |k: &str| u.get(k).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            self.usage = TokenUsage {
                prompt_tokens: get("prompt_tokens"),
                completion_tokens: get("completion_tokens"),
                total_tokens: get("total_tokens"),
            };
        }

        let mut events = Vec::new();
        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return Ok(events);
        };

        if let Some(delta) = choice.get("delta") {
            let reasoning = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(|v| v.as_str());
            if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::ReasoningDelta { text: text.to_string() });
            }
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()).filter(|t| !t.is_empty()) {
                events.push(StreamEvent::TextDelta { text: text.to_string() });
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let entry = self.tools.entry(index).or_default();
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        entry.0 = id.to_string();
                    }
                    if let Some(f) = call.get("function") {
                        if let Some(name) = f.get("name").and_then(|v| v.as_str()) {
                            entry.1.push_str(name);
                        }
                        if let Some(args) = f.get("arguments").and_then(|v| v.as_str()) {
                            entry.2.push_str(args);
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.reason = Some(match reason {
                "tool_calls" | "function_call" => FinishReason::ToolCalls,
                "length" => FinishReason::Length,
                "content_filter" => FinishReason::ContentFilter,
                _ => FinishReason::Stop,
            });
            events.extend(self.drain_tools());
        }
        Ok(events)
    }

    /// Whether a finish reason has been seen.
    pub fn finished(&self) -> bool {
        self.reason.is_some()
    }

    /// Flush buffered tool calls and close with a finish event.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = self.drain_tools();
        events.push(StreamEvent::Finish {
            reason: self.reason.clone().unwrap_or(FinishReason::Stop),
            usage: self.usage.clone(),
        });
        events
    }

    fn drain_tools(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.tools)
            .into_values()
            .map(|(id, name, args)| {
                let input = if args.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&args).unwrap_or(Value::String(args))
                };
                StreamEvent::ToolCall { id, name, input }
            })
            .collect()
    }
}
