//! Streaming reasoner contract and safety caps.
//!
//! The reasoner is the large model that turns collected evidence into an
//! answer. Streaming delivers [`StreamEvent`]s to a callback strictly in
//! arrival order from a single task; a callback error aborts the stream.
//! Wire formats are pluggable per vendor: NDJSON lines ([`ndjson`]) and
//! server-sent events ([`sse`]).

mod limiter;
pub mod ndjson;
pub mod sse;

pub use limiter::TokenBucket;
pub use ndjson::{ChatToolOutcome, OllamaClient, ToolCallRequest};
pub use sse::AnthropicClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::session::Message;

/// Default cap on delivered response text.
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 100 * 1024;

/// Default cap on delivered thinking text.
pub const DEFAULT_MAX_THINKING_LEN: usize = 32 * 1024;

/// Output budget reserved for the answer when thinking is enabled.
pub const THINKING_ANSWER_RESERVE: u32 = 2048;

/// One event produced by a streaming reasoner call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of answer text
    Token(String),
    /// A chunk of thinking text
    Thinking(String),
    /// A terminal error message
    Error(String),
}

/// Callback receiving stream events in arrival order.
///
/// Returning an error aborts the stream; the abort surfaces as a
/// callback-abort error from the streaming call.
pub type StreamHandler<'a> = &'a mut (dyn FnMut(StreamEvent) -> Result<()> + Send);

/// Safety caps applied to one streaming call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Suppress Thinking callbacks entirely
    pub redact_thinking: bool,
    /// Silently truncate thinking beyond this many bytes
    pub max_thinking_len: usize,
    /// Silently truncate response text beyond this many bytes
    pub max_response_len: usize,
    /// Token-bucket rate applied before each callback invocation
    pub rate_limit_per_second: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            redact_thinking: false,
            max_thinking_len: DEFAULT_MAX_THINKING_LEN,
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
            rate_limit_per_second: None,
        }
    }
}

impl StreamConfig {
    pub fn redacting_thinking(mut self) -> Self {
        self.redact_thinking = true;
        self
    }

    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len;
        self
    }

    pub fn with_max_thinking_len(mut self, len: usize) -> Self {
        self.max_thinking_len = len;
        self
    }

    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit_per_second = Some(per_second);
        self
    }
}

/// Generation parameters forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
    pub max_tokens: Option<u32>,
    /// Thinking-token budget; enables thinking mode when set
    pub thinking_budget: Option<u32>,
    /// Backend keep-alive directive
    pub keep_alive: Option<String>,
    /// Explicit context-window size. Critical for backends that otherwise
    /// default to a small context.
    pub context_window: Option<u32>,
}

impl GenerationParams {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// Max-output adjusted for thinking mode: at least
    /// `thinking_budget + 2048` so the answer has room after thinking.
    pub fn effective_max_tokens(&self) -> Option<u32> {
        match (self.max_tokens, self.thinking_budget) {
            (Some(max), Some(budget)) => Some(max.max(budget + THINKING_ANSWER_RESERVE)),
            (None, Some(budget)) => Some(budget + THINKING_ANSWER_RESERVE),
            (max, None) => max,
        }
    }
}

/// Result of a non-streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Full response text
    pub content: String,
    /// Tokens reported or estimated for the call
    pub tokens: u64,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Statistics for one streaming call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Number of Token callbacks delivered
    pub token_count: u64,
    /// Number of Thinking callbacks delivered
    pub thinking_count: u64,
    /// Bytes of response text delivered
    pub response_bytes: usize,
    /// Whether any text was dropped by a length cap
    pub truncated: bool,
}

/// Behavioural contract for a reasoner backend.
#[async_trait]
pub trait ReasonerClient: Send + Sync {
    /// One non-streamed request returning the full text.
    async fn complete(
        &self,
        ctx: &CancellationToken,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion>;

    /// Streamed request delivering events to `handler` in arrival order.
    async fn stream(
        &self,
        ctx: &CancellationToken,
        messages: &[Message],
        params: &GenerationParams,
        config: &StreamConfig,
        handler: StreamHandler<'_>,
    ) -> Result<StreamStats>;
}

/// Applies the stream safety caps between a wire decoder and the caller's
/// callback: redaction, silent truncation, and the per-callback rate limit.
pub(crate) struct DeliveryGate<'a> {
    config: &'a StreamConfig,
    limiter: Option<TokenBucket>,
    response_len: usize,
    thinking_len: usize,
    stats: StreamStats,
}

impl<'a> DeliveryGate<'a> {
    pub(crate) fn new(config: &'a StreamConfig) -> Self {
        Self {
            config,
            limiter: config.rate_limit_per_second.map(TokenBucket::per_second),
            response_len: 0,
            thinking_len: 0,
            stats: StreamStats::default(),
        }
    }

    /// Deliver a token chunk, applying the response length cap.
    pub(crate) async fn token(
        &mut self,
        ctx: &CancellationToken,
        text: String,
        handler: &mut (dyn FnMut(StreamEvent) -> Result<()> + Send),
    ) -> Result<()> {
        let remaining = self.config.max_response_len.saturating_sub(self.response_len);
        let text = match clip(text, remaining) {
            Clipped::Whole(text) => text,
            Clipped::Partial(text) => {
                self.stats.truncated = true;
                text
            }
            Clipped::Nothing => {
                self.stats.truncated = true;
                return Ok(());
            }
        };
        self.response_len += text.len();
        self.stats.response_bytes += text.len();
        self.stats.token_count += 1;
        self.deliver(ctx, StreamEvent::Token(text), handler).await
    }

    /// Deliver a thinking chunk, honouring redaction and the thinking cap.
    pub(crate) async fn thinking(
        &mut self,
        ctx: &CancellationToken,
        text: String,
        handler: &mut (dyn FnMut(StreamEvent) -> Result<()> + Send),
    ) -> Result<()> {
        if self.config.redact_thinking {
            return Ok(());
        }
        let remaining = self.config.max_thinking_len.saturating_sub(self.thinking_len);
        let text = match clip(text, remaining) {
            Clipped::Whole(text) => text,
            Clipped::Partial(text) => {
                self.stats.truncated = true;
                text
            }
            Clipped::Nothing => {
                self.stats.truncated = true;
                return Ok(());
            }
        };
        self.thinking_len += text.len();
        self.stats.thinking_count += 1;
        self.deliver(ctx, StreamEvent::Thinking(text), handler).await
    }

    /// Deliver an error event. Not subject to length caps.
    pub(crate) async fn error(
        &mut self,
        ctx: &CancellationToken,
        message: String,
        handler: &mut (dyn FnMut(StreamEvent) -> Result<()> + Send),
    ) -> Result<()> {
        self.deliver(ctx, StreamEvent::Error(message), handler).await
    }

    pub(crate) fn finish(self) -> StreamStats {
        self.stats
    }

    async fn deliver(
        &mut self,
        ctx: &CancellationToken,
        event: StreamEvent,
        handler: &mut (dyn FnMut(StreamEvent) -> Result<()> + Send),
    ) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(ctx).await?;
        }
        handler(event).map_err(|err| match err {
            Error::CallbackAbort(_) => err,
            other => Error::CallbackAbort(other.to_string()),
        })
    }
}

enum Clipped {
    Whole(String),
    Partial(String),
    Nothing,
}

/// Clip text to at most `remaining` bytes on a char boundary.
fn clip(text: String, remaining: usize) -> Clipped {
    if remaining == 0 {
        return Clipped::Nothing;
    }
    if text.len() <= remaining {
        return Clipped::Whole(text);
    }
    let mut end = remaining;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        Clipped::Nothing
    } else {
        Clipped::Partial(text[..end].to_string())
    }
}
