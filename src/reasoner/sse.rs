//! Server-sent-events streaming protocol (Anthropic-style messages API).
//!
//! Events arrive as `event: <type>` / `data: <json>` pairs. Delta events
//! emit token/thinking; informational events (message_start, ping,
//! content_block_start/stop, message_delta, message_stop) are silently
//! ignored.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
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

#[derive(Debug, Deserialize)]
struct DeltaEvent {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type", default)]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// Decode an SSE byte stream, delivering events through the gate.
///
/// Wire-level core of [`AnthropicClient::stream`]; tests drive it directly
/// with in-memory chunks.
pub async fn stream_sse<S, B, E>(
    ctx: &CancellationToken,
    stream: S,
    config: &StreamConfig,
    handler: StreamHandler<'_>,
) -> Result<StreamStats>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error,
{
    let mut gate = DeliveryGate::new(config);
    let events = stream.eventsource();
    futures::pin_mut!(events);

    loop {
        let event = tokio::select! {
            _ = ctx.cancelled() => {
                let _ = gate.error(ctx, "stream cancelled".into(), handler).await;
                return Err(Error::cancelled("sse stream"));
            }
            event = events.next() => event,
        };
        let Some(event) = event else { break };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed sse event");
                continue;
            }
        };

        match event.event.as_str() {
            "content_block_delta" => {
                let parsed: DeltaEvent = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping unreadable delta event");
                        continue;
                    }
                };
                let Some(delta) = parsed.delta else { continue };
                match delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.text {
                            if !text.is_empty() {
                                gate.token(ctx, text, handler).await?;
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) = delta.thinking {
                            if !thinking.is_empty() {
                                gate.thinking(ctx, thinking, handler).await?;
                            }
                        }
                    }
                    _ => {}
                }
            }
            "error" => {
                let message = serde_json::from_str::<ErrorEvent>(&event.data)
                    .ok()
                    .and_then(|e| e.error)
                    .map(|d| d.message)
                    .unwrap_or_else(|| "unknown stream error".to_string());
                let _ = gate.error(ctx, message.clone(), handler).await;
                return Err(Error::transient("anthropic", message));
            }
            "message_stop" => break,
            // message_start, ping, content_block_start, content_block_stop,
            // message_delta: informational only.
            _ => {}
        }
    }

    Ok(gate.finish())
}

fn build_http_client(timeout: Duration) -> Client {
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

/// Reasoner backend speaking the SSE messages protocol.
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    default_model: String,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
            http: build_http_client(Duration::from_secs(600)),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn request_body(
        &self,
        messages: &[Message],
        params: &GenerationParams,
        stream: bool,
    ) -> serde_json::Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let chat: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::Assistant => "assistant",
                        // Tool output is evidence presented to the model.
                        _ => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".into(), json!(self.default_model));
        body.insert("messages".into(), json!(chat));
        body.insert(
            "max_tokens".into(),
            json!(params.effective_max_tokens().unwrap_or(4096)),
        );
        body.insert("stream".into(), json!(stream));
        if !system.is_empty() {
            body.insert("system".into(), json!(system.join("\n\n")));
        }
        if let Some(t) = params.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(k) = params.top_k {
            body.insert("top_k".into(), json!(k));
        }
        if let Some(p) = params.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if !params.stop.is_empty() {
            body.insert("stop_sequences".into(), json!(params.stop));
        }
        if let Some(budget) = params.thinking_budget {
            body.insert(
                "thinking".into(),
                json!({"type": "enabled", "budget_tokens": budget}),
            );
        }
        serde_json::Value::Object(body)
    }

    async fn post_messages(
        &self,
        ctx: &CancellationToken,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&body);

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::cancelled("reasoner request")),
            result = request.send() => result
                .map_err(|e| Error::transient("anthropic", e.to_string()))?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(Error::permanent("anthropic", format!("{status}: {text}")))
        } else {
            Err(Error::transient("anthropic", format!("{status}: {text}")))
        }
    }
}

#[async_trait]
impl ReasonerClient for AnthropicClient {
    async fn complete(
        &self,
        ctx: &CancellationToken,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion> {
        let start = Instant::now();
        let body = self.request_body(messages, params, false);
        let response = self.post_messages(ctx, body).await?;

        #[derive(Deserialize)]
        struct MessagesResponse {
            #[serde(default)]
            content: Vec<ContentBlock>,
            #[serde(default)]
            usage: Option<Usage>,
        }
        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(rename = "type", default)]
            block_type: String,
            #[serde(default)]
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            output_tokens: u64,
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::parse("messages response", e.to_string()))?;
        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        let tokens = parsed
            .usage
            .map(|u| u.output_tokens)
            .unwrap_or_else(|| (content.len() / 4) as u64);
        Ok(Completion {
            content,
            tokens,
            duration: start.elapsed(),
        })
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        messages: &[Message],
        params: &GenerationParams,
        config: &StreamConfig,
        handler: StreamHandler<'_>,
    ) -> Result<StreamStats> {
        let body = self.request_body(messages, params, true);
        let response = self.post_messages(ctx, body).await?;
        stream_sse(ctx, Box::pin(response.bytes_stream()), config, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::StreamEvent;
    use bytes::Bytes;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;

    fn sse(frames: &[(&str, &str)]) -> Vec<std::result::Result<Bytes, Infallible>> {
        frames
            .iter()
            .map(|(event, data)| {
                Ok(Bytes::from(format!("event: {event}\ndata: {data}\n\n")))
            })
            .collect()
    }

    async fn collect(
        input: Vec<std::result::Result<Bytes, Infallible>>,
        config: StreamConfig,
    ) -> (Result<StreamStats>, Vec<StreamEvent>) {
        let ctx = CancellationToken::new();
        let mut events = Vec::new();
        let mut handler = |event: StreamEvent| {
            events.push(event);
            Ok(())
        };
        let result = stream_sse(&ctx, stream::iter(input), &config, &mut handler).await;
        (result, events)
    }

    #[tokio::test]
    async fn test_text_and_thinking_deltas() {
        let input = sse(&[
            ("message_start", r#"{"message":{"id":"msg_1"}}"#),
            ("content_block_start", r#"{"index":0}"#),
            (
                "content_block_delta",
                r#"{"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"delta":{"type":"text_delta","text":"Hello"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"delta":{"type":"text_delta","text":" world"}}"#,
            ),
            ("content_block_stop", r#"{"index":0}"#),
            ("message_delta", r#"{"delta":{"stop_reason":"end_turn"}}"#),
            ("message_stop", r#"{}"#),
        ]);
        let (result, events) = collect(input, StreamConfig::default()).await;
        let stats = result.unwrap();

        assert_eq!(
            events,
            vec![
                StreamEvent::Thinking("hmm".into()),
                StreamEvent::Token("Hello".into()),
                StreamEvent::Token(" world".into()),
            ]
        );
        assert_eq!(stats.token_count, 2);
        assert_eq!(stats.thinking_count, 1);
    }

    #[tokio::test]
    async fn test_ping_and_informational_events_ignored() {
        let input = sse(&[
            ("ping", r#"{}"#),
            (
                "content_block_delta",
                r#"{"delta":{"type":"text_delta","text":"ok"}}"#,
            ),
            ("message_stop", r#"{}"#),
        ]);
        let (result, events) = collect(input, StreamConfig::default()).await;
        result.unwrap();
        assert_eq!(events, vec![StreamEvent::Token("ok".into())]);
    }

    #[tokio::test]
    async fn test_error_event_terminates() {
        let input = sse(&[
            (
                "content_block_delta",
                r#"{"delta":{"type":"text_delta","text":"partial"}}"#,
            ),
            ("error", r#"{"error":{"message":"overloaded"}}"#),
        ]);
        let (result, events) = collect(input, StreamConfig::default()).await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), "transient_backend");
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("partial".into()),
                StreamEvent::Error("overloaded".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_redaction_applies_to_sse_thinking() {
        let input = sse(&[
            (
                "content_block_delta",
                r#"{"delta":{"type":"thinking_delta","thinking":"secret"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"delta":{"type":"text_delta","text":"answer"}}"#,
            ),
            ("message_stop", r#"{}"#),
        ]);
        let (result, events) =
            collect(input, StreamConfig::default().redacting_thinking()).await;
        result.unwrap();
        assert_eq!(events, vec![StreamEvent::Token("answer".into())]);
    }

    #[test]
    fn test_request_body_shape() {
        let client = AnthropicClient::new("key", "claude-3-5-haiku-20241022");
        let params = GenerationParams::default()
            .with_temperature(0.1)
            .with_max_tokens(2048)
            .with_thinking_budget(8192);
        let body = client.request_body(
            &[Message::system("be brief"), Message::user("hi")],
            &params,
            true,
        );

        assert_eq!(body["model"], "claude-3-5-haiku-20241022");
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["stream"], true);
        // Thinking budget forces room for the answer.
        assert_eq!(body["max_tokens"], 8192 + 2048);
        assert_eq!(body["thinking"]["budget_tokens"], 8192);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
