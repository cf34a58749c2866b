//! Channel and Topic Registry
//!
//! Pure naming and schema functions for the per-session channels.
//!
//! A channel is addressed by a session id and is never provisioned: it comes
//! into existence the first time anything publishes to it or subscribes to it.
//! Each channel multiplexes the same closed set of topics.
//!
//! ```text
//! session id "abc"  ──→  ChannelAddress("session-abc")
//!                              │
//!          ┌──────────┬────────┴───┬──────────┐
//!      progress   text-chunk    result      error
//! ```
//!
//! Nothing in this module holds state. Resolving an address or a schema twice
//! always gives the same answer.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::ChannelMessage;

/// Prefix of every session channel address
pub const SESSION_CHANNEL_PREFIX: &str = "session-";

/// Errors raised by the registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Topic name outside the closed topic set
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Address string that does not name a session channel
    #[error("invalid channel address: {0}")]
    InvalidAddress(String),

    /// Payload does not match the topic's schema
    #[error("invalid {topic} payload: {reason}")]
    InvalidPayload {
        /// Topic the payload was validated against
        topic: Topic,
        /// What was wrong with it
        reason: String,
    },
}

// ============================================================================
// Channel addresses
// ============================================================================

/// Address of a session channel
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelAddress(String);

impl ChannelAddress {
    /// Channel address for a session id
    ///
    /// Deterministic: the same session id always maps to the same address.
    #[must_use]
    pub fn for_session(session_id: &str) -> Self {
        Self(format!("{SESSION_CHANNEL_PREFIX}{session_id}"))
    }

    /// Parse a raw address string
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidAddress`] if the string is not
    /// `session-<id>` with a non-empty id.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        match raw.strip_prefix(SESSION_CHANNEL_PREFIX) {
            Some(id) if !id.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(RegistryError::InvalidAddress(raw.to_string())),
        }
    }

    /// The session id this channel belongs to
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.0
            .strip_prefix(SESSION_CHANNEL_PREFIX)
            .unwrap_or(&self.0)
    }

    /// Address as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Topics
// ============================================================================

/// The closed set of topics carried on every session channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Step-keyed progress records
    Progress,
    /// Partial text of a streamed answer
    TextChunk,
    /// Final structured result of a turn
    Result,
    /// Turn failure
    Error,
}

impl Topic {
    /// Every topic, in wire order
    pub const ALL: [Topic; 4] = [Topic::Progress, Topic::TextChunk, Topic::Result, Topic::Error];

    /// Wire name of the topic
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::TextChunk => "text-chunk",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    /// Payload schema for this topic
    #[must_use]
    pub fn schema(self) -> PayloadSchema {
        let required_fields: &'static [&'static str] = match self {
            Self::Progress => &["step", "status", "message", "progress", "timestamp"],
            Self::TextChunk => &["chunk", "isComplete", "timestamp"],
            Self::Result => &["data", "timestamp"],
            Self::Error => &["error", "recoverable", "timestamp"],
        };
        PayloadSchema {
            topic: self,
            required_fields,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownTopic(s.to_string()))
    }
}

/// Look up the payload schema for a topic name
///
/// # Errors
///
/// Returns [`RegistryError::UnknownTopic`] for names outside the topic set.
pub fn schema_for(topic_name: &str) -> Result<PayloadSchema, RegistryError> {
    topic_name.parse::<Topic>().map(Topic::schema)
}

/// Payload schema of a topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadSchema {
    /// Topic this schema belongs to
    pub topic: Topic,
    /// Field names every payload must carry
    pub required_fields: &'static [&'static str],
}

impl PayloadSchema {
    /// Validate a payload against this schema
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPayload`] when a field is missing, has
    /// the wrong type, or is out of range.
    pub fn validate(&self, payload: &serde_json::Value) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidPayload {
            topic: self.topic,
            reason,
        };

        let Some(fields) = payload.as_object() else {
            return Err(invalid("payload must be an object".to_string()));
        };
        if let Some(missing) = self
            .required_fields
            .iter()
            .find(|name| !fields.contains_key(**name))
        {
            return Err(invalid(format!("missing field `{missing}`")));
        }

        ChannelMessage::decode(self.topic, payload.clone()).map(|_| ())
    }
}

// ============================================================================
// Topic sets
// ============================================================================

/// A set of topics, as granted by a subscription token
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicSet(BTreeSet<Topic>);

impl TopicSet {
    /// Every topic of the session channel
    #[must_use]
    pub fn all() -> Self {
        Self(Topic::ALL.into_iter().collect())
    }

    /// Whether `topic` is part of the set
    #[must_use]
    pub fn contains(&self, topic: Topic) -> bool {
        self.0.contains(&topic)
    }

    /// Whether every topic of `self` is also in `other`
    #[must_use]
    pub fn is_subset(&self, other: &TopicSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the topics in wire order
    pub fn iter(&self) -> impl Iterator<Item = Topic> + '_ {
        self.0.iter().copied()
    }

    /// Parse a list of topic names
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTopic`] for the first unknown name.
    pub fn parse<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, RegistryError> {
        names
            .into_iter()
            .map(str::parse)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<Topic> for TopicSet {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TopicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Topic::as_str).collect();
        write!(f, "[{}]", names.join(","))
    }
}
