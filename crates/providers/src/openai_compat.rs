//! OpenAI-compatible model service.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Function calling, with the request's declared functions sent as tools
//! - Content-filter finishes surfaced as [`ProviderError::Blocked`]

use async_trait::async_trait;
use devassist_core::error::ProviderError;
use devassist_core::fact::Fact;
use devassist_core::function::FunctionDeclaration;
use devassist_core::message::{Message, MessageToolCall, Role};
use devassist_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{debug, trace, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const CONTENT_FILTER: &str = "content_filter";

/// An OpenAI-compatible model provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: build_client(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.client = build_client(secs);
        self
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Render preamble and facts as the leading system message text.
    fn system_text(preamble: Option<&str>, facts: &[Fact]) -> Option<String> {
        let mut sections: Vec<&str> = Vec::new();
        if let Some(preamble) = preamble.filter(|p| !p.is_empty()) {
            sections.push(preamble);
        }
        sections.extend(facts.iter().map(|f| f.text.as_str()));
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// Convert a request's transcript to OpenAI API format.
    fn to_api_messages(request: &ModelRequest) -> Vec<ApiMessage> {
        let system = Self::system_text(request.preamble.as_deref(), &request.facts).map(|text| {
            ApiMessage {
                role: "system".into(),
                content: Some(text),
                tool_calls: None,
                tool_call_id: None,
            }
        });

        system
            .into_iter()
            .chain(request.messages.iter().map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    Role::Tool => "tool".into(),
                },
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            }))
            .collect()
    }

    /// Convert function declarations to OpenAI tool definitions.
    fn to_api_tools(functions: &[FunctionDeclaration]) -> Vec<ApiToolDefinition> {
        functions
            .iter()
            .map(|f| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: f.name.clone(),
                    description: f.description.clone(),
                    parameters: f.parameters.to_json_schema(),
                },
            })
            .collect()
    }

    fn request_body(request: &ModelRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.functions.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.functions));
        }

        body
    }

    /// Map a non-success HTTP status to a provider error.
    async fn status_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        match status {
            429 => ProviderError::RateLimited {
                retry_after_secs: 5,
            },
            401 | 403 => ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ),
            _ => {
                let error_body = response.text().await.unwrap_or_default();
                warn!(status, body = %error_body, "Provider returned error");
                ProviderError::ApiError {
                    status_code: status,
                    message: error_body,
                }
            }
        }
    }

    async fn post(&self, body: &serde_json::Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        if response.status().as_u16() != 200 {
            return Err(Self::status_error(response).await);
        }
        Ok(response)
    }
}

fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to configure HTTP client, using defaults");
            reqwest::Client::new()
        })
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        let body = Self::request_body(&request, false);
        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&body, false).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        if choice.finish_reason.as_deref() == Some(CONTENT_FILTER) {
            return Err(ProviderError::Blocked(CONTENT_FILTER.into()));
        }

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            tool_call_id: None,
            timestamp: chrono::Utc::now(),
        };

        let usage = api_response.usage.map(ApiUsage::into_usage);

        Ok(ModelResponse {
            message,
            usage,
            model: api_response.model,
        })
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        let body = Self::request_body(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        // Read the SSE byte stream and forward parsed chunks
        tokio::spawn(forward_sse(response.bytes_stream(), tx, self.name.clone()));

        Ok(rx)
    }
}

type ChunkSender = tokio::sync::mpsc::Sender<Result<StreamChunk, ProviderError>>;

/// Forward an SSE body as stream chunks until `[DONE]`, a usage chunk, an
/// error, or the receiver going away. A body that ends before any of those
/// is reported as [`ProviderError::StreamInterrupted`].
async fn forward_sse<S, B, E>(mut byte_stream: S, tx: ChunkSender, provider_name: String)
where
    S: futures::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut lines = SseLines::default();
    let mut reader = SseReader {
        provider_name,
        calls: ToolCallAccumulators::default(),
    };

    while let Some(chunk_result) = byte_stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };

        lines.push(bytes.as_ref());
        while let Some(line) = lines.next_line() {
            if reader.line(&line, &tx).await.is_break() {
                return;
            }
        }
    }

    if let Some(line) = lines.remainder() {
        if reader.line(&line, &tx).await.is_break() {
            return;
        }
    }

    warn!(provider = %reader.provider_name, "Stream ended before [DONE]");
    let _ = tx
        .send(Err(ProviderError::StreamInterrupted(
            "stream ended before [DONE]".into(),
        )))
        .await;
}

/// Splits raw bytes into lines. Only complete lines are decoded, so a
/// multi-byte character split across reads stays intact.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let line_end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
        Some(Self::decode(&line[..line_end]))
    }

    /// The unterminated tail left when the body ends.
    fn remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(Self::decode(&line))
    }

    fn decode(line: &[u8]) -> String {
        String::from_utf8_lossy(line).trim_end_matches('\r').to_string()
    }
}

struct SseReader {
    provider_name: String,
    calls: ToolCallAccumulators,
}

impl SseReader {
    /// Handle one SSE line. `Break` ends the stream.
    async fn line(&mut self, line: &str, tx: &ChunkSender) -> ControlFlow<()> {
        // Skip empty lines and SSE comments
        if line.is_empty() || line.starts_with(':') {
            return ControlFlow::Continue(());
        }

        let Some(data) = line.strip_prefix("data:") else {
            return ControlFlow::Continue(());
        };
        let data = data.trim();

        if data == "[DONE]" {
            let _ = tx.send(Ok(StreamChunk::finish(self.calls.finish()))).await;
            return ControlFlow::Break(());
        }

        let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(
                    provider = %self.provider_name,
                    data = %data,
                    error = %e,
                    "Ignoring unparseable SSE chunk"
                );
                return ControlFlow::Continue(());
            }
        };

        if let Some(choice) = stream_resp.choices.first() {
            if choice.finish_reason.as_deref() == Some(CONTENT_FILTER) {
                let _ = tx
                    .send(Err(ProviderError::Blocked(CONTENT_FILTER.into())))
                    .await;
                return ControlFlow::Break(());
            }

            if let Some(ref deltas) = choice.delta.tool_calls {
                self.calls.apply(deltas);
            }

            if let Some(content) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
                if tx.send(Ok(StreamChunk::text(content.clone()))).await.is_err() {
                    return ControlFlow::Break(()); // receiver dropped
                }
            }
        }

        // Usage arrives in the last chunk (stream_options)
        if let Some(usage) = stream_resp.usage {
            let mut chunk = StreamChunk::finish(self.calls.finish());
            chunk.usage = Some(usage.into_usage());
            let _ = tx.send(Ok(chunk)).await;
            return ControlFlow::Break(());
        }

        ControlFlow::Continue(())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl ApiUsage {
    fn into_usage(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta. Arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Partial tool calls keyed by their stream index, so the final list keeps
/// the order the model emitted them in.
#[derive(Default)]
struct ToolCallAccumulators {
    calls: BTreeMap<u32, MessageToolCall>,
}

impl ToolCallAccumulators {
    fn apply(&mut self, deltas: &[StreamToolCallDelta]) {
        for delta in deltas {
            let acc = self.calls.entry(delta.index).or_insert_with(|| MessageToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });

            if let Some(ref id) = delta.id {
                acc.id = id.clone();
            }
            if let Some(ref func) = delta.function {
                if let Some(ref name) = func.name {
                    acc.name = name.clone();
                }
                if let Some(ref args) = func.arguments {
                    acc.arguments.push_str(args);
                }
            }
        }
    }

    fn finish(&mut self) -> Vec<MessageToolCall> {
        std::mem::take(&mut self.calls).into_values().collect()
    }
}
