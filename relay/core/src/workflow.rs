//! Turn Workflow
//!
//! The producer side of one turn: validate the input, announce the turn,
//! stream the generated answer onto the session channel and close the turn
//! with a result.
//!
//! # Message sequence
//!
//! ```text
//! progress  initialization running  10   awaited
//! progress  processing     running  30   awaited
//! text-chunk × N                          best-effort
//!   progress streaming running min(50+n, 90) every K chunks, best-effort
//! text-chunk terminal                     awaited
//! result    {response, model, chunks}     awaited
//! progress  complete       completed 100  awaited
//! ```
//!
//! Any failure after the turn has begun first attempts a best-effort `error`
//! publish, so an attached consumer never waits forever on a turn that will
//! not finish.
//!
//! # Demo sequence
//!
//! [`DemoRunner`] exercises the channel without a generator. Every message
//! is awaited, with pauses between the steps:
//!
//! ```text
//! progress  initialization running   0
//! progress  processing     running  33
//! text-chunk × 6, then terminal
//! progress  finalizing     running  90
//! result    {message, sessionId, duration}
//! progress  complete       completed 100
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;

use crate::channel::ChannelAddress;
use crate::generation::{
    ConfigurationError, GenerationError, GenerationRequest, StreamingToken, TextGenerator,
    DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, DEMO_FRAGMENTS,
};
use crate::messages::{ErrorPayload, MetadataValue, ProgressUpdate, ResultPayload, StepStatus, TextChunk};
use crate::publisher::{PublishError, Publisher};

/// Why a turn did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    /// Session id was empty
    #[error("session id must not be empty")]
    InvalidSession,

    /// Question was empty
    #[error("question must not be empty")]
    EmptyQuestion,

    /// Generator is not usable; reported as a non-recoverable error message
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Generation failed mid-turn; reported as a recoverable error message
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// An awaited control message was not acknowledged
    #[error("control message not delivered: {0}")]
    Publish(#[from] PublishError),
}

/// "Start a new turn with input X for session S"
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRequest {
    /// Session the turn belongs to
    pub session_id: String,
    /// User input
    pub question: String,
}

impl TurnRequest {
    /// Create a request
    pub fn new(session_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            question: question.into(),
        }
    }

    fn validate(&self) -> Result<ChannelAddress, TurnError> {
        if self.session_id.trim().is_empty() {
            return Err(TurnError::InvalidSession);
        }
        if self.question.trim().is_empty() {
            return Err(TurnError::EmptyQuestion);
        }
        Ok(ChannelAddress::for_session(&self.session_id))
    }
}

/// Summary of a completed turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Channel the turn was published on
    pub channel: ChannelAddress,
    /// Full generated text
    pub response: String,
    /// Fragments published
    pub chunks: usize,
    /// Model reported in the result
    pub model: String,
    /// Sequence number of the final message
    pub last_seq: u64,
}

/// Producer settings
#[derive(Clone, Debug, PartialEq)]
pub struct TurnConfig {
    /// Publish a streaming progress tick every this many chunks (0 disables)
    pub progress_every_chunks: usize,
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// System prompt
    pub system_prompt: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            progress_every_chunks: 10,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Runs turns against a generator and a publisher
pub struct TurnRunner {
    publisher: Publisher,
    generator: Arc<dyn TextGenerator>,
    config: TurnConfig,
}

impl TurnRunner {
    /// Create a runner
    #[must_use]
    pub fn new(publisher: Publisher, generator: Arc<dyn TextGenerator>, config: TurnConfig) -> Self {
        Self {
            publisher,
            generator,
            config,
        }
    }

    /// Run one turn to completion
    ///
    /// # Errors
    ///
    /// Returns a [`TurnError`] after publishing a best-effort `error` message
    /// for every failure except input validation, which publishes nothing.
    pub async fn run(&self, request: &TurnRequest) -> Result<TurnOutcome, TurnError> {
        let channel = request.validate()?;

        if let Err(e) = self.generator.ensure_configured() {
            tracing::error!(channel = %channel, error = %e, "Generator not configured");
            self.publisher
                .publish_error(&channel, ErrorPayload::new(e.to_string(), false))
                .await;
            return Err(e.into());
        }

        tracing::info!(channel = %channel, generator = self.generator.name(), "Turn started");

        match self.stream_turn(&channel, &request.question).await {
            Ok(outcome) => {
                tracing::info!(
                    channel = %channel,
                    chunks = outcome.chunks,
                    last_seq = outcome.last_seq,
                    "Turn complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Turn failed");
                self.publisher
                    .publish_error(&channel, ErrorPayload::new(e.to_string(), true))
                    .await;
                Err(e)
            }
        }
    }

    async fn stream_turn(
        &self,
        channel: &ChannelAddress,
        question: &str,
    ) -> Result<TurnOutcome, TurnError> {
        self.publisher
            .publish(
                channel,
                ProgressUpdate::new(
                    "initialization",
                    StepStatus::Running,
                    "Thinking about your question...",
                    10,
                ),
            )
            .await?;

        self.publisher
            .publish(
                channel,
                ProgressUpdate::new(
                    "processing",
                    StepStatus::Running,
                    "Processing your question...",
                    30,
                )
                .with_metadata("generator", MetadataValue::Text(self.generator.name().to_string())),
            )
            .await?;

        let request = GenerationRequest::new(question)
            .with_model(self.config.model.clone())
            .with_temperature(self.config.temperature)
            .with_system(self.config.system_prompt.clone());
        let mut tokens = self.generator.stream(&request).await?;

        let mut response = String::new();
        let mut chunks = 0usize;
        let mut completed = false;

        while let Some(token) = tokens.recv().await {
            match token {
                StreamingToken::Token(fragment) => {
                    response.push_str(&fragment);
                    chunks += 1;
                    self.publisher
                        .publish_detached(channel, TextChunk::fragment(fragment));

                    let every = self.config.progress_every_chunks;
                    if every > 0 && chunks % every == 0 {
                        let pct = u8::try_from((50 + chunks).min(90)).unwrap_or(90);
                        self.publisher.publish_detached(
                            channel,
                            ProgressUpdate::new(
                                "streaming",
                                StepStatus::Running,
                                "Streaming response...",
                                pct,
                            ),
                        );
                    }
                }
                StreamingToken::Complete { .. } => {
                    completed = true;
                    break;
                }
                StreamingToken::Error(message) => {
                    return Err(GenerationError::Stream(message).into());
                }
            }
        }

        if !completed && chunks == 0 {
            return Err(GenerationError::Empty.into());
        }

        self.publisher.publish(channel, TextChunk::terminal()).await?;

        self.publisher
            .publish(
                channel,
                ResultPayload::new(json!({
                    "response": response,
                    "model": self.config.model,
                    "chunks": chunks,
                })),
            )
            .await?;

        let last_seq = self
            .publisher
            .publish(
                channel,
                ProgressUpdate::new("complete", StepStatus::Completed, "Response complete! ✨", 100),
            )
            .await?;

        Ok(TurnOutcome {
            channel: channel.clone(),
            response,
            chunks,
            model: self.config.model.clone(),
            last_seq,
        })
    }
}

// ============================================================================
// Demo
// ============================================================================

/// Pauses between the steps of the demo sequence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemoConfig {
    /// Pause after the first progress and after the text stream
    pub step_pause: Duration,
    /// Pause after each text fragment
    pub chunk_delay: Duration,
    /// Pause between `finalizing` and the result
    pub finalize_pause: Duration,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            step_pause: Duration::from_secs(1),
            chunk_delay: Duration::from_millis(200),
            finalize_pause: Duration::from_millis(500),
        }
    }
}

impl DemoConfig {
    /// No pauses at all
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            step_pause: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            finalize_pause: Duration::ZERO,
        }
    }
}

/// Summary of a finished demo
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemoOutcome {
    /// Channel the demo was published on
    pub channel: ChannelAddress,
    /// Time from the first publish to the result
    pub duration: Duration,
    /// Sequence number of the final message
    pub last_seq: u64,
}

/// Publishes the fixed demo sequence on a session channel
pub struct DemoRunner {
    publisher: Publisher,
    config: DemoConfig,
}

impl DemoRunner {
    /// Create a runner
    #[must_use]
    pub fn new(publisher: Publisher, config: DemoConfig) -> Self {
        Self { publisher, config }
    }

    /// Run the demo for `session_id`
    ///
    /// # Errors
    ///
    /// [`TurnError::InvalidSession`] for an empty session id (nothing is
    /// published), otherwise [`TurnError::Publish`] after a best-effort
    /// recoverable `error` message.
    pub async fn run(&self, session_id: &str) -> Result<DemoOutcome, TurnError> {
        if session_id.trim().is_empty() {
            return Err(TurnError::InvalidSession);
        }
        let channel = ChannelAddress::for_session(session_id);
        tracing::info!(channel = %channel, "Demo started");

        match self.publish_demo(&channel, session_id).await {
            Ok(outcome) => {
                tracing::info!(
                    channel = %channel,
                    duration_ms = outcome.duration.as_millis(),
                    "Demo complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Demo failed");
                self.publisher
                    .publish_error(&channel, ErrorPayload::new(e.to_string(), true))
                    .await;
                Err(e)
            }
        }
    }

    async fn publish_demo(
        &self,
        channel: &ChannelAddress,
        session_id: &str,
    ) -> Result<DemoOutcome, TurnError> {
        let started = Instant::now();

        self.publisher
            .publish(
                channel,
                ProgressUpdate::new(
                    "initialization",
                    StepStatus::Running,
                    "Starting realtime demo...",
                    0,
                ),
            )
            .await?;
        pause(self.config.step_pause).await;

        self.publisher
            .publish(
                channel,
                ProgressUpdate::new(
                    "processing",
                    StepStatus::Running,
                    "Processing your request...",
                    33,
                ),
            )
            .await?;

        for fragment in DEMO_FRAGMENTS {
            self.publisher
                .publish(channel, TextChunk::fragment(fragment))
                .await?;
            pause(self.config.chunk_delay).await;
        }
        self.publisher.publish(channel, TextChunk::terminal()).await?;
        pause(self.config.step_pause).await;

        self.publisher
            .publish(
                channel,
                ProgressUpdate::new(
                    "finalizing",
                    StepStatus::Running,
                    "Finalizing results...",
                    90,
                ),
            )
            .await?;
        pause(self.config.finalize_pause).await;

        let duration = started.elapsed();
        self.publisher
            .publish(
                channel,
                ResultPayload::new(json!({
                    "message": "Demo completed successfully!",
                    "sessionId": session_id,
                    "duration": format!("{:.1}s", duration.as_secs_f64()),
                })),
            )
            .await?;

        let last_seq = self
            .publisher
            .publish(
                channel,
                ProgressUpdate::new("complete", StepStatus::Completed, "All done! ✅", 100),
            )
            .await?;

        Ok(DemoOutcome {
            channel: channel.clone(),
            duration,
            last_seq,
        })
    }
}

/// Scripted pause between demo steps
async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InProcessBroker};
    use crate::channel::TopicSet;
    use crate::generation::{OpenAiGenerator, ScriptedGenerator};
    use crate::messages::ChannelMessage;
    use std::time::Duration;

    struct Harness {
        broker: Arc<InProcessBroker>,
        publisher: Publisher,
    }

    impl Harness {
        fn new() -> Self {
            let broker = Arc::new(InProcessBroker::new());
            let publisher = Publisher::spawn(broker.clone());
            Self { broker, publisher }
        }

        fn runner(&self, generator: impl TextGenerator + 'static, every: usize) -> TurnRunner {
            TurnRunner::new(
                self.publisher.clone(),
                Arc::new(generator),
                TurnConfig {
                    progress_every_chunks: every,
                    ..TurnConfig::default()
                },
            )
        }

        /// Everything published on the channel, read back from the start
        async fn published(&self, session: &str) -> Vec<ChannelMessage> {
            self.publisher.flush().await;
            let channel = ChannelAddress::for_session(session);
            let token = self
                .broker
                .issue_token(&channel, &TopicSet::all(), Duration::from_secs(5))
                .await
                .unwrap();
            let mut sub = self.broker.subscribe(&token.token, Some(0)).await.unwrap();

            let mut out = Vec::new();
            for _ in 0..self.broker.head_seq(&channel) {
                let delivery = sub.recv().await.unwrap();
                out.push(ChannelMessage::from_raw(&delivery.message).unwrap());
            }
            out
        }
    }

    fn describe(message: &ChannelMessage) -> String {
        match message {
            ChannelMessage::Progress(p) => format!("progress:{}:{}", p.step, p.progress),
            ChannelMessage::TextChunk(c) if c.is_complete => "chunk:<end>".to_string(),
            ChannelMessage::TextChunk(c) => format!("chunk:{}", c.chunk),
            ChannelMessage::Result(_) => "result".to_string(),
            ChannelMessage::Error(e) => format!("error:{}", e.recoverable),
        }
    }

    #[tokio::test]
    async fn test_turn_message_sequence() {
        let h = Harness::new();
        let runner = h.runner(ScriptedGenerator::new(["He", "llo"]), 10);

        let outcome = runner
            .run(&TurnRequest::new("s1", "Say hello"))
            .await
            .unwrap();
        assert_eq!(outcome.response, "Hello");
        assert_eq!(outcome.chunks, 2);
        assert_eq!(outcome.last_seq, 7);

        let sequence: Vec<String> = h.published("s1").await.iter().map(describe).collect();
        assert_eq!(
            sequence,
            vec![
                "progress:initialization:10",
                "progress:processing:30",
                "chunk:He",
                "chunk:llo",
                "chunk:<end>",
                "result",
                "progress:complete:100",
            ]
        );
    }

    #[tokio::test]
    async fn test_result_payload() {
        let h = Harness::new();
        let runner = h.runner(ScriptedGenerator::new(["a", "b", "c"]), 10);
        runner.run(&TurnRequest::new("s1", "q")).await.unwrap();

        let messages = h.published("s1").await;
        let result = messages
            .iter()
            .find_map(|m| match m {
                ChannelMessage::Result(r) => Some(r.data.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            result,
            json!({"response": "abc", "model": "gpt-4o-mini", "chunks": 3})
        );
    }

    #[tokio::test]
    async fn test_streaming_progress_ticks() {
        let h = Harness::new();
        let fragments: Vec<String> = (0..5).map(|n| n.to_string()).collect();
        let runner = h.runner(ScriptedGenerator::new(fragments), 2);
        runner.run(&TurnRequest::new("s1", "q")).await.unwrap();

        let ticks: Vec<u8> = h
            .published("s1")
            .await
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::Progress(p) if p.step == "streaming" => Some(p.progress),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![52, 54]);
    }

    #[tokio::test]
    async fn test_demo_message_sequence() {
        let h = Harness::new();
        let runner = DemoRunner::new(h.publisher.clone(), DemoConfig::immediate());

        let outcome = runner.run("demo-1").await.unwrap();
        assert_eq!(outcome.last_seq, 12);

        let messages = h.published("demo-1").await;
        let sequence: Vec<String> = messages.iter().map(describe).collect();
        assert_eq!(
            sequence,
            vec![
                "progress:initialization:0",
                "progress:processing:33",
                "chunk:Hello, ",
                "chunk:this is ",
                "chunk:a realtime ",
                "chunk:streaming ",
                "chunk:demo! ",
                "chunk:✨",
                "chunk:<end>",
                "progress:finalizing:90",
                "result",
                "progress:complete:100",
            ]
        );

        let ChannelMessage::Result(result) = &messages[10] else {
            panic!("expected result, got {:?}", messages[10]);
        };
        assert_eq!(result.data["message"], "Demo completed successfully!");
        assert_eq!(result.data["sessionId"], "demo-1");
        assert!(result.data["duration"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_pacing() {
        let h = Harness::new();
        let runner = DemoRunner::new(h.publisher.clone(), DemoConfig::default());

        let outcome = runner.run("demo-2").await.unwrap();
        // 1s + 6 × 200ms + 1s + 500ms
        assert!(outcome.duration >= Duration::from_millis(3700));
    }

    #[tokio::test]
    async fn test_demo_rejects_empty_session() {
        let h = Harness::new();
        let runner = DemoRunner::new(h.publisher.clone(), DemoConfig::immediate());

        assert_eq!(runner.run(" ").await, Err(TurnError::InvalidSession));
        assert!(!h.broker.channel_exists(&ChannelAddress::for_session(" ")));
    }

    #[tokio::test]
    async fn test_empty_question_publishes_nothing() {
        let h = Harness::new();
        let runner = h.runner(ScriptedGenerator::new(["x"]), 10);

        let result = runner.run(&TurnRequest::new("s1", "   ")).await;
        assert_eq!(result, Err(TurnError::EmptyQuestion));
        assert_eq!(
            h.broker.head_seq(&ChannelAddress::for_session("s1")),
            0
        );

        let result = runner.run(&TurnRequest::new("", "hi")).await;
        assert_eq!(result, Err(TurnError::InvalidSession));
    }

    #[tokio::test]
    async fn test_missing_credential_publishes_fatal_error() {
        let h = Harness::new();
        let runner = h.runner(OpenAiGenerator::new(None, "https://api.openai.com/v1"), 10);

        let result = runner.run(&TurnRequest::new("s1", "hi")).await;
        assert!(matches!(result, Err(TurnError::Configuration(_))));

        let sequence: Vec<String> = h.published("s1").await.iter().map(describe).collect();
        assert_eq!(sequence, vec!["error:false"]);
    }

    #[tokio::test]
    async fn test_generation_failure_publishes_recoverable_error() {
        let h = Harness::new();
        let runner = h.runner(
            ScriptedGenerator::new(["a", "b"]).failing_after(1, "model overloaded"),
            10,
        );

        let result = runner.run(&TurnRequest::new("s1", "hi")).await;
        assert_eq!(
            result,
            Err(TurnError::Generation(GenerationError::Stream(
                "model overloaded".to_string()
            )))
        );

        let sequence: Vec<String> = h.published("s1").await.iter().map(describe).collect();
        assert_eq!(
            sequence,
            vec![
                "progress:initialization:10",
                "progress:processing:30",
                "chunk:a",
                "error:true",
            ]
        );
    }

    #[tokio::test]
    async fn test_control_publish_failure_is_fatal() {
        let h = Harness::new();
        let runner = h.runner(ScriptedGenerator::new(["a"]), 10);

        h.broker.fail_next_publishes(1);
        let result = runner.run(&TurnRequest::new("s1", "hi")).await;
        assert!(matches!(result, Err(TurnError::Publish(_))));

        // The start message was lost; the error message still went out.
        let sequence: Vec<String> = h.published("s1").await.iter().map(describe).collect();
        assert_eq!(sequence, vec!["error:true"]);
    }
}
