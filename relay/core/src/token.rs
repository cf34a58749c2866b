//! Subscription Token Issuer
//!
//! The only authorization boundary of the system. Before a token is minted,
//! an external [`Authorizer`] decides whether the requester may read the
//! channel. Without an authorizer every request is refused.
//!
//! # Token lifetime
//!
//! Tokens expire after [`TokenConfig::ttl`]. Shorter lifetimes narrow the
//! exposure window at the cost of more refresh traffic. Subscribers refresh
//! [`TokenConfig::refresh_margin`] before expiry through a [`TokenRefresher`].
//!
//! Issuing again for the same channel and topics is always allowed and has no
//! effect on the channel.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{Broker, TransportError};
use crate::channel::{ChannelAddress, TopicSet};

/// Errors raised when minting a token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    /// No authorization hook configured
    #[error("no authorization hook configured; refusing to issue tokens")]
    HookMissing,

    /// The hook refused the request
    #[error("requester {requester} may not subscribe to {channel}")]
    Denied {
        /// Requester id
        requester: String,
        /// Channel that was requested
        channel: ChannelAddress,
    },

    /// A token must grant at least one topic
    #[error("empty topic set")]
    EmptyTopicSet,

    /// The transport failed to mint the token
    #[error("transport failed to issue token: {0}")]
    Transport(#[from] TransportError),
}

/// A minted subscription token
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionToken {
    /// Opaque credential presented to the broker
    pub token: String,
    /// Channel the token is scoped to
    pub channel: ChannelAddress,
    /// Topics the token is scoped to
    pub topics: TopicSet,
    /// When the token was minted
    pub issued_at: DateTime<Utc>,
    /// When the token stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl SubscriptionToken {
    /// Whether the token is expired at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry (zero once expired)
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("token", &"<redacted>")
            .field("channel", &self.channel)
            .field("topics", &self.topics)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Identity asking for a token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requester {
    /// Stable requester id
    pub id: String,
    /// Expiry of the requester's own credential, if it has one
    pub credential_expires_at: Option<DateTime<Utc>>,
}

impl Requester {
    /// A requester whose credential does not expire
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential_expires_at: None,
        }
    }

    /// Set the credential expiry
    #[must_use]
    pub fn with_credential_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.credential_expires_at = Some(expires_at);
        self
    }

    /// Whether the requester's credential has expired at `now`
    #[must_use]
    pub fn credential_expired(&self, now: DateTime<Utc>) -> bool {
        self.credential_expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Authorization hook consulted before every token is minted
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `requester` may subscribe to `channel`
    async fn authorize(&self, requester: &Requester, channel: &ChannelAddress) -> bool;
}

/// Authorizer backed by an explicit requester → sessions grant list
///
/// Requesters with an expired credential are always refused.
#[derive(Default)]
pub struct AllowListAuthorizer {
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl AllowListAuthorizer {
    /// Create an empty allow list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `requester_id` to read `session_id`
    pub fn grant(&self, requester_id: impl Into<String>, session_id: impl Into<String>) {
        self.grants
            .write()
            .entry(requester_id.into())
            .or_default()
            .insert(session_id.into());
    }

    /// Withdraw a grant
    pub fn revoke(&self, requester_id: &str, session_id: &str) {
        if let Some(sessions) = self.grants.write().get_mut(requester_id) {
            sessions.remove(session_id);
        }
    }
}

#[async_trait]
impl Authorizer for AllowListAuthorizer {
    async fn authorize(&self, requester: &Requester, channel: &ChannelAddress) -> bool {
        if requester.credential_expired(Utc::now()) {
            return false;
        }
        self.grants
            .read()
            .get(&requester.id)
            .is_some_and(|sessions| sessions.contains(channel.session_id()))
    }
}

/// Token lifetime settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenConfig {
    /// How long a minted token stays valid
    pub ttl: Duration,
    /// How long before expiry subscribers refresh
    pub refresh_margin: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            refresh_margin: Duration::from_secs(10),
        }
    }
}

/// Mints subscription tokens after consulting the authorization hook
pub struct TokenIssuer {
    broker: Arc<dyn Broker>,
    authorizer: Option<Arc<dyn Authorizer>>,
    config: TokenConfig,
}

impl TokenIssuer {
    /// Create an issuer with no authorizer (refuses everything until one is set)
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: TokenConfig) -> Self {
        Self {
            broker,
            authorizer: None,
            config,
        }
    }

    /// Install the authorization hook
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Token settings
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Mint a token for `channel` and `topics`
    ///
    /// # Errors
    ///
    /// - [`AuthorizationError::HookMissing`] without an authorizer
    /// - [`AuthorizationError::Denied`] if the authorizer refuses
    /// - [`AuthorizationError::EmptyTopicSet`] for an empty topic set
    /// - [`AuthorizationError::Transport`] if the broker cannot mint
    pub async fn issue(
        &self,
        channel: &ChannelAddress,
        topics: &TopicSet,
        requester: &Requester,
    ) -> Result<SubscriptionToken, AuthorizationError> {
        let Some(authorizer) = &self.authorizer else {
            tracing::warn!(channel = %channel, requester = %requester.id, "Token refused: no authorization hook");
            return Err(AuthorizationError::HookMissing);
        };

        if topics.is_empty() {
            return Err(AuthorizationError::EmptyTopicSet);
        }

        if !authorizer.authorize(requester, channel).await {
            tracing::warn!(channel = %channel, requester = %requester.id, "Token refused by authorizer");
            return Err(AuthorizationError::Denied {
                requester: requester.id.clone(),
                channel: channel.clone(),
            });
        }

        let token = self
            .broker
            .issue_token(channel, topics, self.config.ttl)
            .await?;

        tracing::debug!(
            channel = %channel,
            topics = %topics,
            requester = %requester.id,
            expires_at = %token.expires_at,
            "Issued subscription token"
        );
        Ok(token)
    }
}

/// Source of replacement tokens for a live subscription
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Mint a fresh token for the same scope
    async fn refresh(&self) -> Result<SubscriptionToken, AuthorizationError>;
}

/// Refresher that asks a [`TokenIssuer`] for a fixed scope
pub struct IssuerRefresher {
    issuer: Arc<TokenIssuer>,
    channel: ChannelAddress,
    topics: TopicSet,
    requester: Requester,
}

impl IssuerRefresher {
    /// Bind an issuer to one channel, topic set and requester
    #[must_use]
    pub fn new(
        issuer: Arc<TokenIssuer>,
        channel: ChannelAddress,
        topics: TopicSet,
        requester: Requester,
    ) -> Self {
        Self {
            issuer,
            channel,
            topics,
            requester,
        }
    }
}

#[async_trait]
impl TokenRefresher for IssuerRefresher {
    async fn refresh(&self) -> Result<SubscriptionToken, AuthorizationError> {
        self.issuer
            .issue(&self.channel, &self.topics, &self.requester)
            .await
    }
}
