//! HTTP client for the insight-generation chat completion backend (spec.md §4.6).
//!
//! Two request shapes share one transport: a buffered JSON mode for short
//! completions and a server-sent-events streaming mode for longer ones. The
//! backend tier is picked by the caller from an estimated prompt token
//! count; this client only turns that tier into a model name.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures_util::{Stream, StreamExt};

mod response;

pub use response::{ChatCompletionResponse, ChatStreamChunk};

const RATE_LIMIT_RETRY_DELAY_MS: u64 = 500;

/// Which model tier a request should be routed to, selected by the caller
/// from an estimated prompt token count (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatBackend {
    Fast,
    Balanced,
    HighContext,
}

/// Token-count boundaries for [`ChatBackend`] selection, tunable via the
/// gateway's `LLM_ROUTING_THRESHOLDS` env var (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatBackendThresholds {
    pub fast_ceiling: u32,
    pub balanced_ceiling: u32,
    pub max_context: u32,
}

impl Default for ChatBackendThresholds {
    fn default() -> Self {
        Self {
            fast_ceiling: 2_000,
            balanced_ceiling: 8_000,
            max_context: 32_000,
        }
    }
}

impl ChatBackend {
    pub fn for_prompt_tokens(
        tokens: u32,
        thresholds: &ChatBackendThresholds,
    ) -> Result<Self, ChatError> {
        if tokens > thresholds.max_context {
            return Err(ChatError::ContextTooLarge);
        }
        Ok(if tokens < thresholds.fast_ceiling {
            ChatBackend::Fast
        } else if tokens < thresholds.balanced_ceiling {
            ChatBackend::Balanced
        } else {
            ChatBackend::HighContext
        })
    }
}

/// Maps each backend tier to a concrete model name. Populated from
/// [`sig_config`](../sig_config) at startup.
#[derive(Debug, Clone)]
pub struct BackendModels {
    pub fast: String,
    pub balanced: String,
    pub high_context: String,
}

impl BackendModels {
    fn resolve(&self, backend: ChatBackend) -> &str {
        match backend {
            ChatBackend::Fast => &self.fast,
            ChatBackend::Balanced => &self.balanced,
            ChatBackend::HighContext => &self.high_context,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone)]
pub struct ChatDelta {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat backend rate-limited the request")]
    RateLimited,
    #[error("chat backend returned a transient error: {0}")]
    Transient(String),
    #[error("chat backend rejected the request: {0}")]
    Fatal(String),
    #[error("chat backend response could not be parsed: {0}")]
    Malformed(String),
    #[error("prompt exceeds the largest available context window")]
    ContextTooLarge,
    #[error("structured output failed validation: {0}")]
    InvalidStructuredOutput(String),
}

impl ChatError {
    /// Only rate-limit and transient-5xx responses get the one retry
    /// spec.md §4.6 allows; everything else is fatal to the calling job.
    fn is_retryable(&self) -> bool {
        matches!(self, ChatError::RateLimited | ChatError::Transient(_))
    }
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    models: BackendModels,
    thresholds: ChatBackendThresholds,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, models: BackendModels) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            models,
            thresholds: ChatBackendThresholds::default(),
        }
    }

    /// Overrides the default token-routing thresholds, mirroring
    /// [`sig_worker_client::WorkerClient::with_retry_policy`]'s
    /// builder-after-construction shape.
    pub fn with_thresholds(mut self, thresholds: ChatBackendThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn backend_for_prompt_tokens(&self, tokens: u32) -> Result<ChatBackend, ChatError> {
        ChatBackend::for_prompt_tokens(tokens, &self.thresholds)
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        backend: ChatBackend,
        max_tokens: u32,
        temperature: f32,
        stream: bool,
        json_object: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.models.resolve(backend),
            "messages": messages.iter().map(|m| serde_json::json!({
                "role": m.role,
                "content": m.content,
            })).collect::<Vec<_>>(),
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": stream,
        });
        if json_object {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }

    /// Buffered completion. One retry for rate-limit/5xx, everything else
    /// fatal; `deadline` bounds the whole attempt sequence per call.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        backend: ChatBackend,
        max_tokens: u32,
        temperature: f32,
        deadline: Duration,
    ) -> Result<ChatResponse, ChatError> {
        let body = self.build_body(messages, backend, max_tokens, temperature, false, false);
        self.send_buffered_with_retry(&body, deadline).await
    }

    /// Like [`Self::complete`], but requests strict JSON and validates the
    /// reply is a JSON object before returning it.
    pub async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        backend: ChatBackend,
        max_tokens: u32,
        temperature: f32,
        deadline: Duration,
    ) -> Result<serde_json::Value, ChatError> {
        let body = self.build_body(messages, backend, max_tokens, temperature, false, true);
        let response = self.send_buffered_with_retry(&body, deadline).await?;
        let value: serde_json::Value = serde_json::from_str(&response.text)
            .map_err(|e| ChatError::InvalidStructuredOutput(e.to_string()))?;
        if !value.is_object() {
            return Err(ChatError::InvalidStructuredOutput(
                "reply was not a JSON object".to_string(),
            ));
        }
        Ok(value)
    }

    async fn send_buffered_with_retry(
        &self,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<ChatResponse, ChatError> {
        let backoff = ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(RATE_LIMIT_RETRY_DELAY_MS))
            .with_max_times(1);

        (|| async { self.send_buffered(body, deadline).await })
            .retry(backoff)
            .when(ChatError::is_retryable)
            .await
    }

    async fn send_buffered(
        &self,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<ChatResponse, ChatError> {
        let send = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send();

        let resp = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| ChatError::Transient("deadline exceeded".to_string()))?
            .map_err(|e| ChatError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ChatError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ChatError::Transient(format!("status {status}")));
        }
        if status.is_client_error() {
            return Err(ChatError::Fatal(format!("status {status}")));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Malformed(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Malformed("response had no choices".to_string()))?;

        Ok(ChatResponse {
            text: choice.message.content,
            prompt_tokens: parsed.usage.map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: parsed.usage.map(|u| u.completion_tokens).unwrap_or(0),
        })
    }

    /// Streaming completion. No automatic retry: once bytes start flowing,
    /// a mid-stream error is surfaced as an item rather than replayed.
    pub async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        backend: ChatBackend,
        max_tokens: u32,
        temperature: f32,
        deadline: Duration,
    ) -> Result<impl Stream<Item = Result<ChatDelta, ChatError>>, ChatError> {
        let body = self.build_body(messages, backend, max_tokens, temperature, true, false);

        let send = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| ChatError::Transient("deadline exceeded".to_string()))?
            .map_err(|e| ChatError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ChatError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ChatError::Transient(format!("status {status}")));
        }
        if status.is_client_error() {
            return Err(ChatError::Fatal(format!("status {status}")));
        }

        let mut byte_stream = resp.bytes_stream();
        Ok(async_stream::stream! {
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(ChatError::Transient(e.to_string()));
                        return;
                    }
                };
                let Ok(text) = std::str::from_utf8(&bytes) else {
                    continue;
                };
                buf.push_str(text);

                while let Some(line_end) = buf.find('\n') {
                    let line = buf[..line_end].trim_end_matches('\r').to_string();
                    buf.drain(..=line_end);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        yield Ok(ChatDelta { text: String::new(), done: true });
                        return;
                    }
                    let Ok(parsed) = serde_json::from_str::<ChatStreamChunk>(data) else {
                        continue;
                    };
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };
                    let done = choice.finish_reason.is_some();
                    if let Some(content) = choice.delta.content {
                        yield Ok(ChatDelta { text: content, done });
                    } else if done {
                        yield Ok(ChatDelta { text: String::new(), done: true });
                    }
                }
            }
        })
    }
}
