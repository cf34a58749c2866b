//! OpenAI-Compatible Generator
//!
//! Streams chat completions from any endpoint that speaks the OpenAI
//! `/chat/completions` API with `stream: true`.
//!
//! # Wire format
//!
//! The response is server-sent events, one JSON object per `data:` line:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//! data: [DONE]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{
    ConfigurationError, GenerationError, GenerationRequest, StreamingToken, TextGenerator,
};

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Default endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// One parsed SSE line
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    /// Content fragment
    Delta(String),
    /// `[DONE]`
    Done,
    /// Provider-reported error object
    Failed(String),
    /// Comment, keep-alive, role-only delta or other line with no text
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseEvent::Skip;
    };
    if let Some(message) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return SseEvent::Failed(message.to_string());
    }

    match value
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.is_empty() => SseEvent::Delta(content.to_string()),
        _ => SseEvent::Skip,
    }
}

/// Accumulates raw response bytes and yields complete lines
///
/// Lines are decoded only once their terminating `\n` has arrived, so a
/// multi-byte character split across network reads is decoded whole.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        match std::str::from_utf8(&line) {
            Ok(text) => Some(text.to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable stream line");
                Some(String::new())
            }
        }
    }
}

/// Streaming chat-completions client
#[derive(Clone)]
pub struct OpenAiGenerator {
    api_key: Option<String>,
    base_url: String,
    http_client: reqwest::Client,
}

impl OpenAiGenerator {
    /// Create a generator for `base_url`
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }

    /// Create with the key from `OPENAI_API_KEY`
    #[must_use]
    pub fn from_env(base_url: impl Into<String>) -> Self {
        Self::new(std::env::var(API_KEY_ENV).ok(), base_url)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": true,
        })
    }
}

impl std::fmt::Debug for OpenAiGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGenerator")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn name(&self) -> &'static str {
        "OpenAI"
    }

    fn ensure_configured(&self) -> Result<(), ConfigurationError> {
        if self.api_key.is_none() {
            return Err(ConfigurationError::MissingCredential {
                provider: "OpenAI",
                env_var: API_KEY_ENV,
            });
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigurationError::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(())
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, GenerationError> {
        self.ensure_configured()?;
        let api_key = self.api_key.clone().unwrap_or_default();

        let response = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(api_key)
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status { status, body });
        }

        tracing::debug!(model = %request.model, "Generation stream opened");

        let (tx, rx) = mpsc::channel(100);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.extend(&bytes);

                while let Some(line) = buffer.next_line() {
                    match parse_sse_line(line.trim()) {
                        SseEvent::Delta(token) => {
                            full_response.push_str(&token);
                            if tx.send(StreamingToken::Token(token)).await.is_err() {
                                return;
                            }
                        }
                        SseEvent::Done => {
                            let _ = tx
                                .send(StreamingToken::Complete {
                                    message: full_response,
                                })
                                .await;
                            return;
                        }
                        SseEvent::Failed(message) => {
                            let _ = tx.send(StreamingToken::Error(message)).await;
                            return;
                        }
                        SseEvent::Skip => {}
                    }
                }
            }

            // Stream ended without [DONE]
            if full_response.is_empty() {
                let _ = tx
                    .send(StreamingToken::Error(
                        "stream ended before any output".to_string(),
                    ))
                    .await;
            } else {
                let _ = tx
                    .send(StreamingToken::Complete {
                        message: full_response,
                    })
                    .await;
            }
        });

        Ok(rx)
    }
}
