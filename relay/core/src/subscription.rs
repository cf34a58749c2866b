//! Subscription Client
//!
//! Holds one live broker subscription for a channel and turns it into a
//! serial stream of incremental [`Batch`]es plus a [`ConnectionState`]
//! signal.
//!
//! # Connection state machine
//!
//! ```text
//!              ┌──────────── transport drop ───────────┐
//!              ▼                                        │
//! Connecting ──→ Connected ⇄ Reconnecting{n} ──→ Connected
//!     │              │               │
//!     └──────────────┴───────────────┴──→ Errored   (refresh refused,
//!                                                    retries exhausted)
//! detach ──→ Closed
//! ```
//!
//! # Delivery cursor
//!
//! Every delivery carries the broker's per-channel sequence number. The
//! client remembers the last sequence it handed out and drops anything at or
//! below it. The cursor starts at the channel head when the first
//! subscription opens, so a fresh subscriber only sees what is published
//! after it attached.
//!
//! # Token swap
//!
//! Before the token expires the client mints a replacement through its
//! [`TokenRefresher`], opens a second subscription resuming after the cursor,
//! drains whatever the old one had buffered, then drops the old one. The
//! cursor makes the overlap invisible to the consumer: nothing is lost and
//! nothing is delivered twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::{Broker, BrokerSubscription, Delivery};
use crate::channel::ChannelAddress;
use crate::messages::ChannelMessage;
use crate::token::{SubscriptionToken, TokenRefresher};

// ============================================================================
// Configuration
// ============================================================================

/// Backoff policy for reconnecting after a transport drop
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }
}

/// Subscription client settings
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionConfig {
    /// Refresh this long before the token expires
    pub refresh_margin: Duration,
    /// Deadline for one refresh call (also capped by the token's lifetime)
    pub refresh_timeout: Duration,
    /// Reconnection backoff
    pub reconnect: ReconnectPolicy,
    /// Most messages in one batch
    pub max_batch: usize,
    /// Batches buffered ahead of the consumer
    pub batch_buffer: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            max_batch: 256,
            batch_buffer: 16,
        }
    }
}

// ============================================================================
// Public types
// ============================================================================

/// Connection status surfaced to presentation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the first subscription
    Connecting,
    /// Receiving
    Connected,
    /// Transport dropped; retrying
    Reconnecting {
        /// Current attempt (1-based)
        attempt: u32,
    },
    /// Refresh refused or retries exhausted; no more batches will arrive
    Errored {
        /// What went wrong
        reason: String,
    },
    /// Detached by the caller
    Closed,
}

impl ConnectionState {
    /// Whether the client has stopped for good
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Errored { .. } | Self::Closed)
    }

    /// Whether presentation should show a degraded-but-alive connection
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Errored { reason } => write!(f, "errored: {reason}"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Messages not previously delivered to this subscriber, in channel order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Decoded messages
    pub messages: Vec<ChannelMessage>,
    /// Sequence number of the first message
    pub first_seq: u64,
    /// Sequence number of the last message
    pub last_seq: u64,
}

impl Batch {
    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Starts subscription drivers
pub struct SubscriptionClient;

impl SubscriptionClient {
    /// Attach to the token's channel
    ///
    /// `token` is the initial credential; `refresher` mints replacements.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn attach(
        broker: Arc<dyn Broker>,
        token: SubscriptionToken,
        refresher: Arc<dyn TokenRefresher>,
        config: SubscriptionConfig,
    ) -> SubscriptionHandle {
        let channel = token.channel.clone();
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(channel = %channel, topics = %token.topics, "Subscriber attaching");

        let driver = Driver {
            broker,
            refresher,
            config,
            channel: channel.clone(),
            batches: batch_tx,
            state: state_tx,
            shutdown: shutdown_rx,
            cursor: None,
        };
        let task = tokio::spawn(driver.run(token));

        SubscriptionHandle {
            channel,
            batches: batch_rx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Consumer side of an attached subscription
///
/// Dropping the handle stops the driver; [`SubscriptionHandle::detach`] also
/// waits for it to finish.
pub struct SubscriptionHandle {
    channel: ChannelAddress,
    batches: mpsc::Receiver<Batch>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Channel being read
    #[must_use]
    pub fn channel(&self) -> &ChannelAddress {
        &self.channel
    }

    /// Wait for the next batch; `None` once the client has stopped
    pub async fn next_batch(&mut self) -> Option<Batch> {
        self.batches.recv().await
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop token refresh, release the connection and wait for the driver
    pub async fn detach(mut self) {
        let _ = self.shutdown.send(true);
        self.batches.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(channel = %self.channel, error = %e, "Subscription driver ended abnormally");
            }
        }
        tracing::info!(channel = %self.channel, "Subscriber detached");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.channel)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Driver
// ============================================================================

enum Event {
    Shutdown,
    RefreshDue,
    Received(Option<Delivery>),
}

enum Stop {
    Shutdown,
    Failed,
    ConsumerGone,
}

struct Driver {
    broker: Arc<dyn Broker>,
    refresher: Arc<dyn TokenRefresher>,
    config: SubscriptionConfig,
    channel: ChannelAddress,
    batches: mpsc::Sender<Batch>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    cursor: Option<u64>,
}

impl Driver {
    async fn run(mut self, token: SubscriptionToken) {
        let mut token = token;
        match self.session(&mut token).await {
            Stop::Shutdown | Stop::ConsumerGone => self.set_state(ConnectionState::Closed),
            Stop::Failed => {}
        }
        tracing::debug!(channel = %self.channel, cursor = ?self.cursor, "Subscription driver stopped");
    }

    async fn session(&mut self, token: &mut SubscriptionToken) -> Stop {
        let mut sub = match self.connect(token, 0).await {
            Ok(sub) => sub,
            Err(stop) => return stop,
        };

        loop {
            let refresh_at = self.refresh_deadline(token);
            let event = tokio::select! {
                biased;
                _ = self.shutdown.changed() => Event::Shutdown,
                () = tokio::time::sleep_until(refresh_at) => Event::RefreshDue,
                delivery = sub.recv() => Event::Received(delivery),
            };

            match event {
                Event::Shutdown => return Stop::Shutdown,
                Event::Received(Some(first)) => {
                    let mut deliveries = vec![first];
                    while deliveries.len() < self.config.max_batch {
                        match sub.try_recv() {
                            Some(d) => deliveries.push(d),
                            None => break,
                        }
                    }
                    if !self.deliver(deliveries).await {
                        return Stop::ConsumerGone;
                    }
                }
                Event::Received(None) => {
                    tracing::warn!(channel = %self.channel, cursor = ?self.cursor, "Transport dropped subscription");
                    sub = match self.connect(token, 1).await {
                        Ok(sub) => sub,
                        Err(stop) => return stop,
                    };
                }
                Event::RefreshDue => {
                    if let Err(stop) = self.refresh(token).await {
                        return stop;
                    }
                    match self.broker.subscribe(&token.token, self.cursor).await {
                        Ok(next) => {
                            let old = std::mem::replace(&mut sub, next);
                            if !self.drain(old).await {
                                return Stop::ConsumerGone;
                            }
                            tracing::debug!(
                                channel = %self.channel,
                                cursor = ?self.cursor,
                                expires_at = %token.expires_at,
                                "Swapped subscription token"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(channel = %self.channel, error = %e, "Resubscribe with refreshed token failed");
                            if !self.drain(sub).await {
                                return Stop::ConsumerGone;
                            }
                            sub = match self.connect(token, 1).await {
                                Ok(sub) => sub,
                                Err(stop) => return stop,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Open a subscription, retrying with backoff from `attempt`
    async fn connect(
        &mut self,
        token: &mut SubscriptionToken,
        mut attempt: u32,
    ) -> Result<BrokerSubscription, Stop> {
        loop {
            if attempt > 0 {
                if attempt > self.config.reconnect.max_attempts {
                    self.fail(format!(
                        "reconnect attempts exhausted after {}",
                        self.config.reconnect.max_attempts
                    ));
                    return Err(Stop::Failed);
                }
                self.set_state(ConnectionState::Reconnecting { attempt });
                let delay = self.config.reconnect.delay_for(attempt);
                tokio::select! {
                    _ = self.shutdown.changed() => return Err(Stop::Shutdown),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;

            if token.remaining(Utc::now()) <= self.config.refresh_margin {
                self.refresh(token).await?;
            }

            match self.broker.subscribe(&token.token, self.cursor).await {
                Ok(sub) => {
                    if self.cursor.is_none() {
                        self.cursor = Some(sub.head_seq());
                    }
                    self.set_state(ConnectionState::Connected);
                    return Ok(sub);
                }
                Err(e) if e.is_auth() => {
                    tracing::debug!(channel = %self.channel, error = %e, "Token rejected on subscribe, refreshing");
                    self.refresh(token).await?;
                }
                Err(e) => {
                    tracing::warn!(channel = %self.channel, attempt = attempt, error = %e, "Subscribe failed");
                }
            }
        }
    }

    /// Replace `token` through the refresher, within the refresh deadline
    async fn refresh(&mut self, token: &mut SubscriptionToken) -> Result<(), Stop> {
        let remaining = token.remaining(Utc::now());
        let deadline = if remaining.is_zero() {
            self.config.refresh_timeout
        } else {
            self.config.refresh_timeout.min(remaining)
        };

        let outcome = tokio::select! {
            _ = self.shutdown.changed() => return Err(Stop::Shutdown),
            outcome = tokio::time::timeout(deadline, self.refresher.refresh()) => outcome,
        };

        match outcome {
            Ok(Ok(fresh)) => {
                tracing::debug!(channel = %self.channel, expires_at = %fresh.expires_at, "Refreshed subscription token");
                *token = fresh;
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail(format!("token refresh refused: {e}"));
                Err(Stop::Failed)
            }
            Err(_) => {
                self.fail("token refresh timed out".to_string());
                Err(Stop::Failed)
            }
        }
    }

    /// When to start refreshing: `refresh_margin` before expiry, but never
    /// before half of the remaining lifetime has passed
    fn refresh_deadline(&self, token: &SubscriptionToken) -> Instant {
        let remaining = token.remaining(Utc::now());
        let lead = remaining
            .saturating_sub(self.config.refresh_margin)
            .max(remaining / 2);
        Instant::now() + lead
    }

    async fn drain(&mut self, mut old: BrokerSubscription) -> bool {
        let mut buffered = Vec::new();
        while let Some(d) = old.try_recv() {
            buffered.push(d);
        }
        drop(old);

        let chunk = self.config.max_batch.max(1);
        let mut rest = buffered;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(chunk));
            if !self.deliver(rest).await {
                return false;
            }
            rest = tail;
        }
        true
    }

    /// Hand the not-yet-delivered part of `deliveries` to the consumer
    ///
    /// Returns `false` once the consumer has gone away.
    async fn deliver(&mut self, deliveries: Vec<Delivery>) -> bool {
        let mut messages = Vec::with_capacity(deliveries.len());
        let mut first_seq = None;
        let mut last_seq = 0;

        for delivery in deliveries {
            if self.cursor.is_some_and(|cursor| delivery.seq <= cursor) {
                tracing::trace!(channel = %self.channel, seq = delivery.seq, "Skipping already-delivered message");
                continue;
            }
            self.cursor = Some(delivery.seq);

            match ChannelMessage::from_raw(&delivery.message) {
                Ok(message) => {
                    first_seq.get_or_insert(delivery.seq);
                    last_seq = delivery.seq;
                    messages.push(message);
                }
                Err(e) => {
                    tracing::warn!(channel = %self.channel, seq = delivery.seq, error = %e, "Dropping undecodable message");
                }
            }
        }

        let Some(first_seq) = first_seq else {
            return true;
        };

        tracing::trace!(channel = %self.channel, first_seq, last_seq, count = messages.len(), "Delivering batch");
        self.batches
            .send(Batch {
                messages,
                first_seq,
                last_seq,
            })
            .await
            .is_ok()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            tracing::debug!(channel = %self.channel, state = %next, "Connection state changed");
        }
    }

    fn fail(&self, reason: String) {
        tracing::error!(channel = %self.channel, reason = %reason, "Subscription failed");
        self.set_state(ConnectionState::Errored { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InProcessBroker;
    use crate::channel::TopicSet;
    use crate::messages::{ProgressUpdate, StepStatus, TextChunk};
    use crate::publisher::Publisher;
    use crate::token::{AllowListAuthorizer, AuthorizationError, IssuerRefresher, Requester, TokenConfig, TokenIssuer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRefresher {
        inner: IssuerRefresher,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<SubscriptionToken, AuthorizationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.refresh().await
        }
    }

    struct Fixture {
        broker: Arc<InProcessBroker>,
        publisher: Publisher,
        channel: ChannelAddress,
        refresher: Arc<CountingRefresher>,
        token: SubscriptionToken,
    }

    async fn fixture(session: &str, ttl: Duration, requester: Requester) -> Fixture {
        let broker = Arc::new(InProcessBroker::new());
        let authorizer = Arc::new(AllowListAuthorizer::new());
        authorizer.grant(requester.id.clone(), session);
        let issuer = Arc::new(
            TokenIssuer::new(
                broker.clone(),
                TokenConfig {
                    ttl,
                    refresh_margin: ttl / 2,
                },
            )
            .with_authorizer(authorizer),
        );

        let channel = ChannelAddress::for_session(session);
        let token = issuer
            .issue(&channel, &TopicSet::all(), &requester)
            .await
            .unwrap();
        let refresher = Arc::new(CountingRefresher {
            inner: IssuerRefresher::new(issuer, channel.clone(), TopicSet::all(), requester),
            calls: AtomicU32::new(0),
        });

        Fixture {
            publisher: Publisher::spawn(broker.clone()),
            broker,
            channel,
            refresher,
            token,
        }
    }

    fn config(ttl: Duration) -> SubscriptionConfig {
        SubscriptionConfig {
            refresh_margin: ttl / 2,
            refresh_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
            max_batch: 64,
            batch_buffer: 8,
        }
    }

    async fn wait_connected(handle: &SubscriptionHandle) {
        let mut watch = handle.state_watch();
        watch
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    fn progress(n: u8) -> ProgressUpdate {
        ProgressUpdate::new(format!("step-{n}"), StepStatus::Running, "tick", n)
    }

    async fn collect(handle: &mut SubscriptionHandle, count: usize) -> Vec<u64> {
        let mut seqs = Vec::new();
        while seqs.len() < count {
            let batch = tokio::time::timeout(Duration::from_secs(5), handle.next_batch())
                .await
                .unwrap()
                .unwrap();
            assert!(!batch.is_empty());
            assert_eq!(batch.last_seq - batch.first_seq + 1, batch.len() as u64);
            seqs.extend(batch.first_seq..=batch.last_seq);
        }
        seqs
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_state_classification() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Errored {
            reason: "x".to_string()
        }
        .is_terminal());
        assert!(ConnectionState::Reconnecting { attempt: 1 }.is_degraded());
        assert!(!ConnectionState::Connected.is_degraded());
    }

    #[tokio::test]
    async fn test_incremental_batches_for_fresh_subscriber() {
        let ttl = Duration::from_secs(60);
        let f = fixture("fresh", ttl, Requester::new("alice")).await;

        f.publisher.publish(&f.channel, progress(1)).await.unwrap();

        let mut handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&handle).await;

        f.publisher.publish(&f.channel, progress(2)).await.unwrap();
        f.publisher.publish(&f.channel, progress(3)).await.unwrap();

        // Message 1 predates the attach and is never delivered.
        assert_eq!(collect(&mut handle, 2).await, vec![2, 3]);
        handle.detach().await;
    }

    #[tokio::test]
    async fn test_token_swap_has_no_gap_or_duplicate() {
        let ttl = Duration::from_millis(300);
        let f = fixture("swap", ttl, Requester::new("alice")).await;

        let mut handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&handle).await;

        let publisher = f.publisher.clone();
        let channel = f.channel.clone();
        let producer = tokio::spawn(async move {
            for n in 0..40u8 {
                publisher.publish_detached(&channel, TextChunk::fragment(n.to_string()));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            publisher.flush().await;
        });

        let seqs = collect(&mut handle, 40).await;
        producer.await.unwrap();

        assert_eq!(seqs, (1..=40).collect::<Vec<u64>>());
        assert!(f.refresher.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(handle.state(), ConnectionState::Connected);
        handle.detach().await;
    }

    #[tokio::test]
    async fn test_reconnect_after_transport_drop() {
        let ttl = Duration::from_secs(60);
        let f = fixture("drop", ttl, Requester::new("alice")).await;

        let mut handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&handle).await;

        f.publisher.publish(&f.channel, progress(1)).await.unwrap();
        assert_eq!(collect(&mut handle, 1).await, vec![1]);

        let mut states = handle.state_watch();
        f.broker.sever(&f.channel);
        // Published while the client is between subscriptions.
        f.publisher.publish(&f.channel, progress(2)).await.unwrap();

        states
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();
        wait_connected(&handle).await;

        f.publisher.publish(&f.channel, progress(3)).await.unwrap();
        assert_eq!(collect(&mut handle, 2).await, vec![2, 3]);
        handle.detach().await;
    }

    #[tokio::test]
    async fn test_expired_credential_errors_and_stops_delivery() {
        let ttl = Duration::from_millis(200);
        let requester = Requester::new("bob")
            .with_credential_expiry(Utc::now() + chrono::Duration::milliseconds(50));
        let f = fixture("expired", ttl, requester).await;

        let mut handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );

        let mut states = handle.state_watch();
        let state = states
            .wait_for(|s| s.is_terminal())
            .await
            .unwrap()
            .clone();
        assert!(matches!(state, ConnectionState::Errored { .. }));

        f.publisher.publish(&f.channel, progress(1)).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(200), handle.next_batch()).await;
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_errors_and_stops_delivery() {
        let ttl = Duration::from_secs(60);
        let f = fixture("outage", ttl, Requester::new("alice")).await;

        let mut handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&handle).await;

        let mut states = handle.state_watch();
        f.broker.set_outage(true);
        f.broker.sever(&f.channel);

        let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        match state {
            ConnectionState::Errored { reason } => assert!(reason.contains("exhausted"), "{reason}"),
            other => panic!("expected errored, got {other:?}"),
        }

        f.broker.set_outage(false);
        f.publisher.publish(&f.channel, progress(1)).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(200), handle.next_batch()).await;
        assert!(matches!(next, Ok(None)));
    }

    struct StalledRefresher;

    #[async_trait]
    impl TokenRefresher for StalledRefresher {
        async fn refresh(&self) -> Result<SubscriptionToken, AuthorizationError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_refresh_past_deadline_errors() {
        let ttl = Duration::from_millis(400);
        let f = fixture("stalled", ttl, Requester::new("alice")).await;

        let mut handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            Arc::new(StalledRefresher),
            config(ttl),
        );
        wait_connected(&handle).await;

        let mut states = handle.state_watch();
        let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        match state {
            ConnectionState::Errored { reason } => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("expected errored, got {other:?}"),
        }

        f.publisher.publish(&f.channel, progress(1)).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(200), handle.next_batch()).await;
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let ttl = Duration::from_secs(60);
        let f = fixture("tabs", ttl, Requester::new("alice")).await;

        let mut first = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&first).await;
        f.publisher.publish(&f.channel, progress(1)).await.unwrap();

        let mut second = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&second).await;
        f.publisher.publish(&f.channel, progress(2)).await.unwrap();

        assert_eq!(collect(&mut first, 2).await, vec![1, 2]);
        assert_eq!(collect(&mut second, 1).await, vec![2]);

        first.detach().await;
        second.detach().await;
    }

    #[tokio::test]
    async fn test_detach_closes_and_releases_connection() {
        let ttl = Duration::from_secs(60);
        let f = fixture("detach", ttl, Requester::new("alice")).await;

        let handle = SubscriptionClient::attach(
            f.broker.clone(),
            f.token.clone(),
            f.refresher.clone(),
            config(ttl),
        );
        wait_connected(&handle).await;
        assert_eq!(f.broker.subscriber_count(&f.channel), 1);

        let states = handle.state_watch();
        handle.detach().await;
        assert_eq!(*states.borrow(), ConnectionState::Closed);

        // The broker's forwarder notices the dropped receiver on its next wakeup.
        f.publisher.publish(&f.channel, progress(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.broker.subscriber_count(&f.channel), 0);
    }
}
