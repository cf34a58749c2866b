//! Stream Reducer
//!
//! Folds delivered messages into a [`SessionView`]. The fold is total and
//! strictly sequential: every message is applied, one at a time, in delivery
//! order. Timestamps are producer wall-clock and never used for ordering.
//!
//! | Topic        | Effect                                                  |
//! |--------------|---------------------------------------------------------|
//! | `progress`   | upsert by `step`; last value wins                       |
//! | `text-chunk` | append while streaming; terminal chunk stops streaming  |
//! | `result`     | overwrite                                               |
//! | `error`      | overwrite                                               |

use serde::{Deserialize, Serialize};

use crate::messages::{
    ChannelMessage, ErrorPayload, ProgressUpdate, ResultPayload, StepStatus, TextChunk,
};

/// What happens to the text buffer when a new turn starts streaming
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextBufferPolicy {
    /// A non-terminal chunk after a terminal one starts a fresh buffer
    #[default]
    ResetPerTurn,
    /// Keep appending across turns
    Accumulate,
}

impl std::str::FromStr for TextBufferPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset-per-turn" => Ok(Self::ResetPerTurn),
            "accumulate" => Ok(Self::Accumulate),
            other => Err(format!("unknown text buffer policy: {other}")),
        }
    }
}

/// Effect of applying one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewChange {
    /// A progress record was inserted or replaced
    Progress {
        /// Step key
        step: String,
        /// New status
        status: StepStatus,
        /// New percentage
        progress: u8,
    },
    /// Text was appended
    TextAppended {
        /// Bytes appended
        len: usize,
        /// Whether this chunk started a new stream
        new_turn: bool,
    },
    /// A terminal chunk ended the stream
    TextCompleted,
    /// The result was replaced
    ResultSet,
    /// The error was replaced
    ErrorSet {
        /// Whether the producer flagged it recoverable
        recoverable: bool,
    },
}

/// Client-side accumulated state of one session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionView {
    progress: Vec<ProgressUpdate>,
    text_buffer: String,
    is_streaming_text: bool,
    result: Option<ResultPayload>,
    error: Option<ErrorPayload>,
    policy: TextBufferPolicy,
}

impl SessionView {
    /// Empty view with the given buffer policy
    #[must_use]
    pub fn new(policy: TextBufferPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Apply one message
    pub fn apply(&mut self, message: &ChannelMessage) -> ViewChange {
        match message {
            ChannelMessage::Progress(update) => self.apply_progress(update),
            ChannelMessage::TextChunk(chunk) => self.apply_chunk(chunk),
            ChannelMessage::Result(result) => {
                self.result = Some(result.clone());
                ViewChange::ResultSet
            }
            ChannelMessage::Error(error) => {
                self.error = Some(error.clone());
                ViewChange::ErrorSet {
                    recoverable: error.recoverable,
                }
            }
        }
    }

    fn apply_progress(&mut self, update: &ProgressUpdate) -> ViewChange {
        match self.progress.iter_mut().find(|p| p.step == update.step) {
            Some(existing) => *existing = update.clone(),
            None => self.progress.push(update.clone()),
        }
        ViewChange::Progress {
            step: update.step.clone(),
            status: update.status,
            progress: update.progress,
        }
    }

    fn apply_chunk(&mut self, chunk: &TextChunk) -> ViewChange {
        if chunk.is_complete {
            self.is_streaming_text = false;
            return ViewChange::TextCompleted;
        }

        let new_turn = !self.is_streaming_text;
        if new_turn && self.policy == TextBufferPolicy::ResetPerTurn {
            self.text_buffer.clear();
        }
        self.text_buffer.push_str(&chunk.chunk);
        self.is_streaming_text = true;

        ViewChange::TextAppended {
            len: chunk.chunk.len(),
            new_turn,
        }
    }

    /// Fold a batch, consuming and returning the view
    #[must_use]
    pub fn fold(mut self, batch: &[ChannelMessage]) -> Self {
        for message in batch {
            self.apply(message);
        }
        self
    }

    /// Fold a batch in place and report each message's effect
    pub fn fold_with_changes(&mut self, batch: &[ChannelMessage]) -> Vec<ViewChange> {
        batch.iter().map(|message| self.apply(message)).collect()
    }

    /// Progress records in first-seen order
    #[must_use]
    pub fn progress_entries(&self) -> &[ProgressUpdate] {
        &self.progress
    }

    /// Latest record for a step
    #[must_use]
    pub fn progress(&self, step: &str) -> Option<&ProgressUpdate> {
        self.progress.iter().find(|p| p.step == step)
    }

    /// Accumulated text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text_buffer
    }

    /// Whether text is still streaming
    #[must_use]
    pub fn is_streaming_text(&self) -> bool {
        self.is_streaming_text
    }

    /// Last result
    #[must_use]
    pub fn result(&self) -> Option<&ResultPayload> {
        self.result.as_ref()
    }

    /// Last error
    #[must_use]
    pub fn error(&self) -> Option<&ErrorPayload> {
        self.error.as_ref()
    }

    /// Whether presentation should treat the turn as failed
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Buffer policy in effect
    #[must_use]
    pub fn policy(&self) -> TextBufferPolicy {
        self.policy
    }
}

/// `fold(view, batch) -> view'`
#[must_use]
pub fn fold(view: &SessionView, batch: &[ChannelMessage]) -> SessionView {
    view.clone().fold(batch)
}
