//! NDJSON streaming protocol (Ollama-style chat endpoint).
//!
//! The backend answers one JSON object per line:
//! `{"message":{"role":"assistant","content":...},"thinking":...,"done":false}`
//! terminated by a `{"done":true,"done_reason":...}` line. Empty and
//! malformed lines are skipped with a warning; a line larger than 1 MiB is
//! a parse failure.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::session::{Message, Role};

use super::{
    Completion, DeliveryGate, GenerationParams, ReasonerClient, StreamConfig, StreamHandler,
    StreamStats,
};

use async_trait::async_trait;

/// Maximum accepted line length.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of a non-streamed chat carrying tool definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatToolOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tokens: u64,
    pub duration: Duration,
}

#[derive(Debug, Deserialize)]
struct NdjsonChunk {
    #[serde(default)]
    message: Option<NdjsonMessage>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NdjsonMessage {
    #[serde(default)]
    #[allow(dead_code)]
    role: String,
    #[serde(default)]
    content: String,
}

/// Decode an NDJSON byte stream, delivering events through the gate.
///
/// This is the wire-level core of [`OllamaClient::stream`]; tests drive it
/// directly with in-memory chunks. The loop polls cancellation between
/// lines; on cancellation a final Error event is delivered best-effort and
/// a cancellation error is returned.
pub async fn stream_ndjson<S, E>(
    ctx: &CancellationToken,
    mut stream: S,
    config: &StreamConfig,
    handler: StreamHandler<'_>,
) -> Result<StreamStats>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut gate = DeliveryGate::new(config);
    let mut buffer: Vec<u8> = Vec::new();
    let mut done = false;

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let message = err.to_string();
                let _ = gate.error(ctx, message.clone(), handler).await;
                return Err(Error::transient("reasoner", message));
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            if ctx.is_cancelled() {
                let _ = gate.error(ctx, "stream cancelled".into(), handler).await;
                return Err(Error::cancelled("ndjson stream"));
            }
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = trim_line(&line[..line.len() - 1]);
            if handle_line(ctx, line, &mut gate, handler).await? {
                done = true;
                break 'outer;
            }
        }

        if buffer.len() > MAX_LINE_BYTES {
            return Err(Error::parse(
                "ndjson stream",
                format!("line exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }
        if ctx.is_cancelled() {
            let _ = gate.error(ctx, "stream cancelled".into(), handler).await;
            return Err(Error::cancelled("ndjson stream"));
        }
    }

    // A final payload without a trailing newline is still a line.
    if !done {
        let trailing: Vec<u8> = std::mem::take(&mut buffer);
        handle_line(ctx, trim_line(&trailing), &mut gate, handler).await?;
    }

    Ok(gate.finish())
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    line
}

/// Process one line. Returns true when the terminal done line was seen.
async fn handle_line(
    ctx: &CancellationToken,
    line: &[u8],
    gate: &mut DeliveryGate<'_>,
    handler: StreamHandler<'_>,
) -> Result<bool> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(false);
    }

    let chunk: NdjsonChunk = match serde_json::from_slice(line) {
        Ok(chunk) => chunk,
        Err(err) => {
            tracing::warn!(error = %err, "skipping malformed ndjson line");
            return Ok(false);
        }
    };

    if let Some(error) = chunk.error {
        let _ = gate.error(ctx, error.clone(), handler).await;
        return Err(Error::transient("reasoner", error));
    }

    if let Some(thinking) = chunk.thinking {
        if !thinking.is_empty() {
            gate.thinking(ctx, thinking, handler).await?;
        }
    }

    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            gate.token(ctx, message.content, handler).await?;
        }
    }

    if chunk.done {
        tracing::debug!(
            done_reason = chunk.done_reason.as_deref().unwrap_or(""),
            eval_count = chunk.eval_count.unwrap_or(0),
            "ndjson stream complete"
        );
        return Ok(true);
    }
    Ok(false)
}

fn build_http_client(timeout: Duration) -> Client {
    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// Reasoner backend speaking the NDJSON chat protocol.
pub struct OllamaClient {
    base_url: String,
    default_model: String,
    http: Client,
}

impl OllamaClient {
    const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
            // Streaming responses can take minutes; the per-request timeout
            // covers connection and header time, reads are unbounded.
            http: build_http_client(Duration::from_secs(600)),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn chat_body(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        stream: bool,
        tools: Option<&[serde_json::Value]>,
    ) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut options = serde_json::Map::new();
        if let Some(t) = params.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(k) = params.top_k {
            options.insert("top_k".into(), json!(k));
        }
        if let Some(p) = params.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if !params.stop.is_empty() {
            options.insert("stop".into(), json!(params.stop));
        }
        if let Some(max) = params.effective_max_tokens() {
            options.insert("num_predict".into(), json!(max));
        }
        // The backend defaults to a small context window unless num_ctx is
        // sent explicitly.
        if let Some(window) = params.context_window {
            options.insert("num_ctx".into(), json!(window));
        }

        let mut body = serde_json::Map::new();
        body.insert("model".into(), json!(model));
        body.insert("messages".into(), json!(messages));
        body.insert("stream".into(), json!(stream));
        if !options.is_empty() {
            body.insert("options".into(), json!(options));
        }
        if let Some(keep_alive) = &params.keep_alive {
            body.insert("keep_alive".into(), json!(keep_alive));
        }
        if params.thinking_budget.is_some() {
            body.insert("think".into(), json!(true));
        }
        if let Some(tools) = tools {
            body.insert("tools".into(), json!(tools));
        }
        serde_json::Value::Object(body)
    }

    async fn post_chat(
        &self,
        ctx: &CancellationToken,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::cancelled("reasoner request")),
            result = self.http.post(&url).json(&body).send() => result
                .map_err(|e| Error::transient("ollama", e.to_string()))?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(Error::permanent("ollama", format!("{status}: {text}")))
        } else {
            Err(Error::transient("ollama", format!("{status}: {text}")))
        }
    }

    /// One non-streamed chat against a named model.
    pub async fn chat_model(
        &self,
        ctx: &CancellationToken,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion> {
        let start = Instant::now();
        let body = self.chat_body(model, messages, params, false, None);
        let response = self.post_chat(ctx, body).await?;

        #[derive(Deserialize)]
        struct ChatResponse {
            #[serde(default)]
            message: Option<NdjsonMessage>,
            #[serde(default)]
            eval_count: Option<u64>,
            #[serde(default)]
            error: Option<String>,
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::parse("chat response", e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(Error::transient("ollama", error));
        }
        let content = parsed.message.map(|m| m.content).unwrap_or_default();
        let tokens = parsed
            .eval_count
            .unwrap_or_else(|| (content.len() / 4) as u64);
        Ok(Completion {
            content,
            tokens,
            duration: start.elapsed(),
        })
    }

    /// One non-streamed chat with tool definitions forwarded.
    pub async fn chat_model_with_tools(
        &self,
        ctx: &CancellationToken,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        tools: &[serde_json::Value],
    ) -> Result<ChatToolOutcome> {
        let start = Instant::now();
        let body = self.chat_body(model, messages, params, false, Some(tools));
        let response = self.post_chat(ctx, body).await?;

        #[derive(Deserialize)]
        struct ToolChatResponse {
            #[serde(default)]
            message: Option<ToolChatMessage>,
            #[serde(default)]
            eval_count: Option<u64>,
            #[serde(default)]
            error: Option<String>,
        }
        #[derive(Deserialize)]
        struct ToolChatMessage {
            #[serde(default)]
            content: String,
            #[serde(default)]
            tool_calls: Vec<RawToolCall>,
        }
        #[derive(Deserialize)]
        struct RawToolCall {
            function: RawFunction,
        }
        #[derive(Deserialize)]
        struct RawFunction {
            name: String,
            #[serde(default)]
            arguments: serde_json::Value,
        }

        let parsed: ToolChatResponse = response
            .json()
            .await
            .map_err(|e| Error::parse("chat response", e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(Error::transient("ollama", error));
        }
        let (content, tool_calls) = match parsed.message {
            Some(message) => (
                message.content,
                message
                    .tool_calls
                    .into_iter()
                    .map(|call| ToolCallRequest {
                        name: call.function.name,
                        arguments: call.function.arguments,
                    })
                    .collect(),
            ),
            None => (String::new(), Vec::new()),
        };
        let tokens = parsed
            .eval_count
            .unwrap_or_else(|| (content.len() / 4) as u64);
        Ok(ChatToolOutcome {
            content,
            tool_calls,
            tokens,
            duration: start.elapsed(),
        })
    }

    /// Streamed chat against a named model.
    pub async fn stream_model(
        &self,
        ctx: &CancellationToken,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        config: &StreamConfig,
        handler: StreamHandler<'_>,
    ) -> Result<StreamStats> {
        let body = self.chat_body(model, messages, params, true, None);
        let response = self.post_chat(ctx, body).await?;
        stream_ndjson(ctx, Box::pin(response.bytes_stream()), config, handler).await
    }
}

#[async_trait]
impl ReasonerClient for OllamaClient {
    async fn complete(
        &self,
        ctx: &CancellationToken,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion> {
        self.chat_model(ctx, &self.default_model, messages, params)
            .await
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        messages: &[Message],
        params: &GenerationParams,
        config: &StreamConfig,
        handler: StreamHandler<'_>,
    ) -> Result<StreamStats> {
        self.stream_model(ctx, &self.default_model, messages, params, config, handler)
            .await
    }
}
