//! Scripted Generator
//!
//! Replays a fixed list of fragments with a delay between them. Drives
//! `ask --scripted` and the tests; it never needs credentials.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::{
    ConfigurationError, GenerationError, GenerationRequest, StreamingToken, TextGenerator,
};

/// Fragments of the demo response
pub const DEMO_FRAGMENTS: [&str; 6] = [
    "Hello, ",
    "this is ",
    "a realtime ",
    "streaming ",
    "demo! ",
    "✨",
];

/// Generator that replays fixed fragments
#[derive(Clone, Debug)]
pub struct ScriptedGenerator {
    fragments: Vec<String>,
    delay: Duration,
    failure: Option<(usize, String)>,
}

impl ScriptedGenerator {
    /// Replay `fragments` with no delay
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    /// The demo script: six fragments, 200ms apart
    #[must_use]
    pub fn demo() -> Self {
        Self::new(DEMO_FRAGMENTS).with_delay(Duration::from_millis(200))
    }

    /// Wait `delay` before each fragment
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail with `message` after `after` fragments
    #[must_use]
    pub fn failing_after(mut self, after: usize, message: impl Into<String>) -> Self {
        self.failure = Some((after, message.into()));
        self
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn ensure_configured(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    async fn stream(
        &self,
        _request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, GenerationError> {
        let (tx, rx) = mpsc::channel(self.fragments.len().max(1));
        let script = self.clone();

        tokio::spawn(async move {
            let mut full = String::new();
            for (index, fragment) in script.fragments.into_iter().enumerate() {
                if let Some((after, ref message)) = script.failure {
                    if index == after {
                        let _ = tx.send(StreamingToken::Error(message.clone())).await;
                        return;
                    }
                }
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                full.push_str(&fragment);
                if tx.send(StreamingToken::Token(fragment)).await.is_err() {
                    return;
                }
            }
            if let Some((_, message)) = script.failure {
                let _ = tx.send(StreamingToken::Error(message)).await;
                return;
            }
            let _ = tx.send(StreamingToken::Complete { message: full }).await;
        });

        Ok(rx)
    }
}
