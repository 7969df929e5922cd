//! Client for OpenAI-compatible chat completion APIs.
//!
//! Serves every family that speaks `/v1/chat/completions` (DeepSeek, OpenAI,
//! OpenRouter, Groq, Ollama), with or without SSE streaming.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::llm_client::{
    GenerateRequest, LlmClient, ProviderError, ProviderEvent, ProviderEventStream,
    ProviderResponse, ToolDefinition,
};
use crate::logging;
use crate::message::{ContentPart, FinishReason, Message, Role, TokenUsage, ToolCall};
use crate::models::{Model, ModelProvider};

// === Types ===

/// Client for one OpenAI-compatible backend.
#[derive(Clone)]
pub struct OpenAiClient {
    http_client: reqwest::Client,
    base_url: String,
    family: ModelProvider,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    /// Build a client; every family except Ollama needs an API key.
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match settings.api_key.as_deref() {
            Some(key) => {
                let value = HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| ProviderError::Configuration(format!("invalid API key: {e}")))?;
                headers.insert(AUTHORIZATION, value);
            }
            None if settings.family == ModelProvider::Ollama => {}
            None => {
                return Err(ProviderError::Configuration(format!(
                    "missing API key for provider {}",
                    settings.family
                )));
            }
        }

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;

        logging::info(format!(
            "{} base URL: {}",
            settings.family, settings.base_url
        ));

        Ok(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            family: settings.family,
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request_body(request: &GenerateRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.api_model,
            "messages": build_chat_messages(
                request.system_prompt.as_deref(),
                &request.messages,
                &request.model,
            ),
            "max_tokens": request.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools.iter().map(tool_to_chat).collect::<Vec<_>>());
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = self.http_client.post(self.url()).json(body).send() => response?,
        };
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            text = response.text() => text.unwrap_or_default(),
        };
        Err(classify_status(status, &text))
    }
}

// === Trait Implementations ===

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider_name(&self) -> &'static str {
        self.family.as_str()
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);
        let response = self.send(&body, &cancel).await?;
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            text = response.text() => text?,
        };
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Protocol(format!("invalid chat completion JSON: {e}")))?;
        parse_chat_message(&value)
    }

    fn stream(&self, request: GenerateRequest, cancel: CancellationToken) -> ProviderEventStream
    where
        Self: Clone + Sized + 'static,
    {
        let client = self.clone();
        Box::pin(async_stream::stream! {
            let body = Self::request_body(&request, true);
            let response = match client.send(&body, &cancel).await {
                Ok(response) => response,
                Err(err) => {
                    yield ProviderEvent::Error(err);
                    return;
                }
            };

            let mut byte_stream = std::pin::pin!(response.bytes_stream());
            let mut byte_buf = Vec::new();
            let mut line_buf = String::new();
            let mut assembler = StreamAssembler::default();

            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    chunk = byte_stream.next() => Some(chunk),
                };
                let chunk = match next {
                    None => {
                        yield ProviderEvent::Error(ProviderError::Cancelled);
                        return;
                    }
                    Some(None) => break,
                    Some(Some(Ok(bytes))) => bytes,
                    Some(Some(Err(e))) => {
                        yield ProviderEvent::Error(ProviderError::Transport(format!("stream read error: {e}")));
                        return;
                    }
                };
                byte_buf.extend_from_slice(&chunk);

                for data in drain_sse_events(&mut byte_buf, &mut line_buf) {
                    if data.trim() == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&data) {
                        Ok(value) => {
                            for event in assembler.apply(&value) {
                                yield event;
                            }
                        }
                        Err(e) => {
                            yield ProviderEvent::Error(ProviderError::Protocol(format!("invalid SSE chunk: {e}")));
                            return;
                        }
                    }
                }
            }

            yield ProviderEvent::Complete(assembler.finish());
        })
    }
}

/// 429 and 5xx are transient; other statuses are backend rejections.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = api_error_message(body).unwrap_or_else(|| body.trim().to_string());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transport(format!("HTTP {status}: {message}"))
    } else {
        ProviderError::Backend {
            code: Some(i64::from(status.as_u16())),
            message,
        }
    }
}

fn api_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// === Chat Completions Helpers ===

fn requires_reasoning_content(model: &Model) -> bool {
    model.can_reason && model.provider == ModelProvider::DeepSeek
}

fn build_chat_messages(system: Option<&str>, messages: &[Message], model: &Model) -> Vec<Value> {
    let mut out = Vec::new();
    let include_reasoning = requires_reasoning_content(model);
    let mut pending_tool_calls: HashSet<String> = HashSet::new();

    if let Some(system) = system
        && !system.trim().is_empty()
    {
        out.push(json!({ "role": "system", "content": system }));
    }

    for message in messages {
        let mut text_parts = Vec::new();
        let mut reasoning_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for part in &message.parts {
            match part {
                ContentPart::Text { text } => text_parts.push(text.as_str()),
                ContentPart::Reasoning { text } => reasoning_parts.push(text.as_str()),
                ContentPart::ToolCall(call) => tool_calls.push(call),
                ContentPart::ToolResult(result) => {
                    if pending_tool_calls.remove(&result.tool_call_id) {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": result.tool_call_id,
                            "content": result.content,
                        }));
                    } else {
                        logging::warn(format!(
                            "Dropping tool result for unknown tool_call_id: {}",
                            result.tool_call_id
                        ));
                    }
                }
                ContentPart::Attachment { .. } | ContentPart::Finish { .. } => {}
            }
        }

        match message.role {
            Role::Assistant => {
                let content = text_parts.join("\n");
                let mut msg = json!({
                    "role": "assistant",
                    "content": if content.is_empty() { Value::Null } else { json!(content) },
                });
                if include_reasoning {
                    msg["reasoning_content"] = json!(reasoning_parts.join("\n"));
                }
                if tool_calls.is_empty() {
                    pending_tool_calls.clear();
                } else {
                    msg["tool_calls"] = json!(
                        tool_calls
                            .iter()
                            .map(|call| json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.input.to_string(),
                                }
                            }))
                            .collect::<Vec<_>>()
                    );
                    pending_tool_calls = tool_calls.iter().map(|call| call.id.clone()).collect();
                }
                out.push(msg);
            }
            Role::User => {
                let content = text_parts.join("\n");
                if !content.trim().is_empty() {
                    out.push(json!({ "role": "user", "content": content }));
                }
                pending_tool_calls.clear();
            }
            Role::Tool => {}
        }
    }

    out
}

fn tool_to_chat(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_chat_message(payload: &Value) -> Result<ProviderResponse, ProviderError> {
    let choice = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| ProviderError::Protocol("chat response missing choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| ProviderError::Protocol("chat response missing message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reasoning = message
        .get("reasoning_content")
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::Protocol("tool call missing name".to_string()))?;
            tool_calls.push(ToolCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("tool_call")
                    .to_string(),
                name: name.to_string(),
                input: function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .map_or_else(|| json!({}), parse_tool_arguments),
            });
        }
    }

    let finish_reason = FinishReason::from_api(choice.get("finish_reason").and_then(Value::as_str));
    let mut response = ProviderResponse {
        content,
        reasoning,
        tool_calls: Vec::new(),
        usage: parse_usage(payload.get("usage")),
        finish_reason,
    }
    .with_tool_calls(tool_calls);
    if response.tool_calls.is_empty() && response.finish_reason == FinishReason::ToolUse {
        response.finish_reason = FinishReason::EndTurn;
    }
    Ok(response)
}

fn parse_usage(usage: Option<&Value>) -> TokenUsage {
    let field = |names: &[&str]| {
        usage
            .and_then(|u| names.iter().find_map(|name| u.get(*name)))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let cached = usage
        .and_then(|u| u.get("prompt_tokens_details"))
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or_else(|| field(&["prompt_cache_hit_tokens"]));
    let input = field(&["input_tokens", "prompt_tokens"]);
    TokenUsage {
        input_tokens: input.saturating_sub(cached),
        output_tokens: field(&["output_tokens", "completion_tokens"]),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    }
}

// === Streaming Helpers ===

/// Split buffered SSE bytes into complete `data:` payloads.
fn drain_sse_events(byte_buf: &mut Vec<u8>, line_buf: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(newline_pos) = byte_buf.iter().position(|b| *b == b'\n') {
        let line_bytes: Vec<u8> = byte_buf.drain(..=newline_pos).collect();
        let line = String::from_utf8_lossy(&line_bytes);
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() {
            if !line_buf.is_empty() {
                events.push(std::mem::take(line_buf));
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            line_buf.push_str(data.strip_prefix(' ').unwrap_or(data));
        }
        // Other SSE fields (event:, id:, retry:) are ignored.
    }
    events
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds streaming chunks into deltas and the final response.
#[derive(Default)]
struct StreamAssembler {
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl StreamAssembler {
    fn apply(&mut self, chunk: &Value) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(Some(usage));
        }
        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            return events;
        };

        for choice in choices {
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(FinishReason::from_api(Some(reason)));
            }
            let Some(delta) = choice.get("delta") else {
                continue;
            };

            if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str)
                && !reasoning.is_empty()
            {
                self.reasoning.push_str(reasoning);
                events.push(ProviderEvent::ReasoningDelta(reasoning.to_string()));
            }
            if let Some(content) = delta.get("content").and_then(Value::as_str)
                && !content.is_empty()
            {
                self.content.push_str(content);
                events.push(ProviderEvent::ContentDelta(content.to_string()));
            }
            for call in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                let function = call.get("function");
                if let Some(name) = function.and_then(|f| f.get("name")).and_then(Value::as_str)
                    && entry.name.is_empty()
                {
                    entry.name = name.to_string();
                    events.push(ProviderEvent::ToolCallStarted {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                    });
                }
                if let Some(arguments) = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                {
                    entry.arguments.push_str(arguments);
                }
            }
        }
        events
    }

    fn finish(self) -> ProviderResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall {
                input: parse_tool_arguments(&call.arguments),
                id: call.id,
                name: call.name,
            })
            .collect();
        let finish_reason = self.finish_reason.unwrap_or(FinishReason::EndTurn);
        ProviderResponse {
            content: self.content,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls: Vec::new(),
            usage: self.usage,
            finish_reason,
        }
        .with_tool_calls(tool_calls)
    }
}
