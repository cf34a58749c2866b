//! Broker Traits
//!
//! The transport collaborator as seen from the core: publish a message onto a
//! channel, mint a scoped token, and open a subscription with one.
//!
//! Implementations own fan-out, retention and token verification. The core
//! only relies on per-channel delivery order and on the sequence numbers the
//! broker assigns at publish time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{ChannelAddress, TopicSet};
use crate::messages::RawMessage;
use crate::token::SubscriptionToken;

/// Errors reported by the transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Broker could not accept the request
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Token signature or scope rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Token expired before use
    #[error("token expired")]
    TokenExpired,

    /// Subscription or publish lane closed
    #[error("channel closed")]
    ChannelClosed,

    /// Message or token could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    /// Whether the failure is about the credential rather than connectivity
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::TokenExpired)
    }
}

/// A message as delivered to a subscriber, with its channel sequence number
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Sequence number assigned at publish time (first message is 1)
    pub seq: u64,
    /// The message
    pub message: RawMessage,
}

/// Live subscription handed out by a broker
///
/// Yields deliveries in channel order. The stream ends when the connection
/// drops or the token expires.
pub struct BrokerSubscription {
    channel: ChannelAddress,
    topics: TopicSet,
    expires_at: DateTime<Utc>,
    head_seq: u64,
    rx: mpsc::Receiver<Delivery>,
}

impl BrokerSubscription {
    /// Wrap a delivery receiver
    ///
    /// `head_seq` is the channel's last sequence number at the moment the
    /// subscription was opened.
    #[must_use]
    pub fn new(
        channel: ChannelAddress,
        topics: TopicSet,
        expires_at: DateTime<Utc>,
        head_seq: u64,
        rx: mpsc::Receiver<Delivery>,
    ) -> Self {
        Self {
            channel,
            topics,
            expires_at,
            head_seq,
            rx,
        }
    }

    /// Channel this subscription reads
    #[must_use]
    pub fn channel(&self) -> &ChannelAddress {
        &self.channel
    }

    /// Topics this subscription receives
    #[must_use]
    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    /// When the token behind this subscription expires
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Last sequence number on the channel when the subscription opened
    #[must_use]
    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }

    /// Wait for the next delivery; `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Take a delivery if one is already buffered
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for BrokerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSubscription")
            .field("channel", &self.channel)
            .field("topics", &self.topics)
            .field("expires_at", &self.expires_at)
            .field("head_seq", &self.head_seq)
            .finish_non_exhaustive()
    }
}

/// Transport collaborator
///
/// Implement this trait to run the core over a different broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker name for logs
    fn name(&self) -> &str;

    /// Publish a message and wait for the enqueue acknowledgment
    ///
    /// Returns the sequence number assigned to the message.
    async fn publish(
        &self,
        channel: &ChannelAddress,
        message: RawMessage,
    ) -> Result<u64, TransportError>;

    /// Mint an opaque token scoped to `channel` and `topics`
    async fn issue_token(
        &self,
        channel: &ChannelAddress,
        topics: &TopicSet,
        ttl: Duration,
    ) -> Result<SubscriptionToken, TransportError>;

    /// Open a subscription with a token
    ///
    /// With `resume_after = Some(seq)` the broker first replays retained
    /// messages newer than `seq`. With `None` only messages published after
    /// the call are delivered.
    async fn subscribe(
        &self,
        token: &str,
        resume_after: Option<u64>,
    ) -> Result<BrokerSubscription, TransportError>;
}
