//! Channel Message Types
//!
//! Typed payloads for each topic, and the untyped `(topic, payload)` shape the
//! transport moves around.
//!
//! Field names on the wire are camelCase and timestamps are RFC 3339 UTC.
//! Timestamps are producer wall-clock and carry no ordering meaning; the
//! transport's delivery order is authoritative.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{RegistryError, Topic};

/// Status of a workflow step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not started yet
    Pending,
    /// In progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
}

/// Flat metadata value attached to a progress record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag
    Flag(bool),
    /// Number
    Number(serde_json::Number),
    /// Text
    Text(String),
}

/// `progress` payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Step key, unique within the channel's lifetime
    pub step: String,
    /// Step status
    pub status: StepStatus,
    /// Human-readable status line
    pub message: String,
    /// Percent complete, 0-100
    pub progress: u8,
    /// Producer wall-clock time
    pub timestamp: DateTime<Utc>,
    /// Optional flat metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, MetadataValue>>,
}

impl ProgressUpdate {
    /// Create a progress record stamped with the current time
    ///
    /// `progress` is clamped to 100.
    pub fn new(
        step: impl Into<String>,
        status: StepStatus,
        message: impl Into<String>,
        progress: u8,
    ) -> Self {
        Self {
            step: step.into(),
            status,
            message: message.into(),
            progress: progress.min(100),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }
}

/// `text-chunk` payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    /// Fragment text (empty on the terminal chunk)
    pub chunk: String,
    /// Whether this chunk ends the text stream for the turn
    pub is_complete: bool,
    /// Producer wall-clock time
    pub timestamp: DateTime<Utc>,
}

impl TextChunk {
    /// A non-terminal fragment
    pub fn fragment(chunk: impl Into<String>) -> Self {
        Self {
            chunk: chunk.into(),
            is_complete: false,
            timestamp: Utc::now(),
        }
    }

    /// The terminal chunk: empty text, `is_complete = true`
    #[must_use]
    pub fn terminal() -> Self {
        Self {
            chunk: String::new(),
            is_complete: true,
            timestamp: Utc::now(),
        }
    }
}

/// `result` payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Opaque structured value; never inspected by the core
    pub data: serde_json::Value,
    /// Producer wall-clock time
    pub timestamp: DateTime<Utc>,
}

impl ResultPayload {
    /// Wrap a structured value
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
        }
    }
}

/// `error` payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error description
    pub error: String,
    /// Whether a retry of the turn may succeed
    pub recoverable: bool,
    /// Producer wall-clock time
    pub timestamp: DateTime<Utc>,
}

impl ErrorPayload {
    /// Create an error payload stamped with the current time
    pub fn new(error: impl Into<String>, recoverable: bool) -> Self {
        Self {
            error: error.into(),
            recoverable,
            timestamp: Utc::now(),
        }
    }
}

/// A typed message on a session channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    /// `progress`
    Progress(ProgressUpdate),
    /// `text-chunk`
    TextChunk(TextChunk),
    /// `result`
    Result(ResultPayload),
    /// `error`
    Error(ErrorPayload),
}

impl ChannelMessage {
    /// Topic this message is published on
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Progress(_) => Topic::Progress,
            Self::TextChunk(_) => Topic::TextChunk,
            Self::Result(_) => Topic::Result,
            Self::Error(_) => Topic::Error,
        }
    }

    /// Decode a payload for a known topic, enforcing its schema
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPayload`] if the payload does not fit.
    pub fn decode(topic: Topic, payload: serde_json::Value) -> Result<Self, RegistryError> {
        let invalid = |e: serde_json::Error| RegistryError::InvalidPayload {
            topic,
            reason: e.to_string(),
        };

        let message = match topic {
            Topic::Progress => {
                let update: ProgressUpdate = serde_json::from_value(payload).map_err(invalid)?;
                if update.progress > 100 {
                    return Err(RegistryError::InvalidPayload {
                        topic,
                        reason: format!("progress {} out of range 0-100", update.progress),
                    });
                }
                Self::Progress(update)
            }
            Topic::TextChunk => Self::TextChunk(serde_json::from_value(payload).map_err(invalid)?),
            Topic::Result => Self::Result(serde_json::from_value(payload).map_err(invalid)?),
            Topic::Error => Self::Error(serde_json::from_value(payload).map_err(invalid)?),
        };
        Ok(message)
    }

    /// Decode a raw transport message
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTopic`] or
    /// [`RegistryError::InvalidPayload`].
    pub fn from_raw(raw: &RawMessage) -> Result<Self, RegistryError> {
        let topic: Topic = raw.topic.parse()?;
        Self::decode(topic, raw.payload.clone())
    }

    /// Encode for the transport
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPayload`] if serialization fails.
    pub fn to_raw(&self) -> Result<RawMessage, RegistryError> {
        let topic = self.topic();
        let payload = match self {
            Self::Progress(p) => serde_json::to_value(p),
            Self::TextChunk(c) => serde_json::to_value(c),
            Self::Result(r) => serde_json::to_value(r),
            Self::Error(e) => serde_json::to_value(e),
        }
        .map_err(|e| RegistryError::InvalidPayload {
            topic,
            reason: e.to_string(),
        })?;

        Ok(RawMessage {
            topic: topic.as_str().to_string(),
            payload,
        })
    }
}

impl From<ProgressUpdate> for ChannelMessage {
    fn from(update: ProgressUpdate) -> Self {
        Self::Progress(update)
    }
}

impl From<TextChunk> for ChannelMessage {
    fn from(chunk: TextChunk) -> Self {
        Self::TextChunk(chunk)
    }
}

impl From<ResultPayload> for ChannelMessage {
    fn from(result: ResultPayload) -> Self {
        Self::Result(result)
    }
}

impl From<ErrorPayload> for ChannelMessage {
    fn from(error: ErrorPayload) -> Self {
        Self::Error(error)
    }
}

/// Untyped message as moved by the transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Topic wire name
    pub topic: String,
    /// JSON payload
    pub payload: serde_json::Value,
}
