//! In-Process Broker
//!
//! A broker living inside the current process, built on tokio channels.
//! Used when producer and subscribers share a process (the daemon, tests).
//!
//! # Per-channel state
//!
//! ```text
//! ChannelAddress ──→ ChannelState
//!                     ├─ log: next_seq + retained window (VecDeque)
//!                     ├─ live: broadcast::Sender<Delivery>
//!                     └─ severed: watch epoch (bumped to drop subscribers)
//! ```
//!
//! Channels are created on first touch. Each subscription gets a forwarding
//! task that filters by the token's topics and closes the stream when the
//! token expires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use crate::channel::{ChannelAddress, Topic, TopicSet};
use crate::messages::RawMessage;
use crate::token::SubscriptionToken;

use super::signing::{TokenClaims, TokenSigner};
use super::traits::{Broker, BrokerSubscription, Delivery, TransportError};

/// Configuration for the in-process broker
#[derive(Clone, Debug)]
pub struct InProcessBrokerConfig {
    /// Messages retained per channel for resuming subscriptions
    pub retention: usize,
    /// Capacity of each channel's live broadcast buffer
    pub live_capacity: usize,
    /// Capacity of each subscriber's delivery buffer
    pub subscriber_buffer: usize,
}

impl Default for InProcessBrokerConfig {
    fn default() -> Self {
        Self {
            retention: 1024,
            live_capacity: 1024,
            subscriber_buffer: 256,
        }
    }
}

struct ChannelLog {
    next_seq: u64,
    retained: VecDeque<Delivery>,
}

struct ChannelState {
    log: Mutex<ChannelLog>,
    live: broadcast::Sender<Delivery>,
    severed: watch::Sender<u64>,
}

impl ChannelState {
    fn new(config: &InProcessBrokerConfig) -> Self {
        let (live, _) = broadcast::channel(config.live_capacity.max(1));
        let (severed, _) = watch::channel(0);
        Self {
            log: Mutex::new(ChannelLog {
                next_seq: 0,
                retained: VecDeque::new(),
            }),
            live,
            severed,
        }
    }
}

#[derive(Default)]
struct FaultInjection {
    failing_publishes: AtomicU32,
    outage: AtomicBool,
}

impl FaultInjection {
    fn in_outage(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.in_outage() {
            return true;
        }
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Broker that moves messages between tasks of one process
pub struct InProcessBroker {
    config: InProcessBrokerConfig,
    signer: TokenSigner,
    channels: DashMap<ChannelAddress, Arc<ChannelState>>,
    faults: FaultInjection,
}

impl InProcessBroker {
    /// Create a broker with default configuration and a random signing key
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(InProcessBrokerConfig::default())
    }

    /// Create a broker with custom configuration
    #[must_use]
    pub fn with_config(config: InProcessBrokerConfig) -> Self {
        Self {
            config,
            signer: TokenSigner::generate(),
            channels: DashMap::new(),
            faults: FaultInjection::default(),
        }
    }

    fn channel(&self, address: &ChannelAddress) -> Arc<ChannelState> {
        let entry = self
            .channels
            .entry(address.clone())
            .or_insert_with(|| Arc::new(ChannelState::new(&self.config)));
        Arc::clone(entry.value())
    }

    /// Whether the channel has been touched yet
    #[must_use]
    pub fn channel_exists(&self, address: &ChannelAddress) -> bool {
        self.channels.contains_key(address)
    }

    /// Last sequence number published on a channel (0 if none)
    #[must_use]
    pub fn head_seq(&self, address: &ChannelAddress) -> u64 {
        self.channels
            .get(address)
            .map_or(0, |state| state.log.lock().next_seq)
    }

    /// Number of live subscriptions on a channel
    #[must_use]
    pub fn subscriber_count(&self, address: &ChannelAddress) -> usize {
        self.channels
            .get(address)
            .map_or(0, |state| state.live.receiver_count())
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.faults.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Reject every publish and subscribe until cleared
    pub fn set_outage(&self, outage: bool) {
        self.faults.outage.store(outage, Ordering::SeqCst);
    }

    /// Drop every live subscription on a channel, as a connection loss would
    pub fn sever(&self, address: &ChannelAddress) {
        if let Some(state) = self.channels.get(address) {
            state.severed.send_modify(|epoch| *epoch += 1);
            tracing::debug!(channel = %address, "Severed live subscriptions");
        }
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn publish(
        &self,
        channel: &ChannelAddress,
        message: RawMessage,
    ) -> Result<u64, TransportError> {
        if self.faults.should_fail() {
            return Err(TransportError::Unavailable(
                "publish rejected by broker".to_string(),
            ));
        }

        let state = self.channel(channel);
        let seq = {
            let mut log = state.log.lock();
            log.next_seq += 1;
            let delivery = Delivery {
                seq: log.next_seq,
                message,
            };
            log.retained.push_back(delivery.clone());
            while log.retained.len() > self.config.retention {
                log.retained.pop_front();
            }
            // Sent under the lock so live order always matches sequence order.
            let _ = state.live.send(delivery);
            log.next_seq
        };

        tracing::trace!(channel = %channel, seq = seq, "Published");
        Ok(seq)
    }

    async fn issue_token(
        &self,
        channel: &ChannelAddress,
        topics: &TopicSet,
        ttl: Duration,
    ) -> Result<SubscriptionToken, TransportError> {
        let now = Utc::now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let claims = TokenClaims {
            channel: channel.clone(),
            topics: topics.clone(),
            iat: now.timestamp_millis(),
            exp: now.timestamp_millis().saturating_add(ttl_ms),
            nonce: hex::encode(nonce),
        };
        let token = self.signer.sign(&claims)?;

        Ok(SubscriptionToken {
            token,
            channel: claims.channel.clone(),
            topics: claims.topics.clone(),
            issued_at: claims.issued_at(),
            expires_at: claims.expires_at(),
        })
    }

    async fn subscribe(
        &self,
        token: &str,
        resume_after: Option<u64>,
    ) -> Result<BrokerSubscription, TransportError> {
        let claims = self.signer.verify(token, Utc::now())?;
        if self.faults.in_outage() {
            return Err(TransportError::Unavailable(
                "subscribe rejected by broker".to_string(),
            ));
        }
        let state = self.channel(&claims.channel);

        let (live, replay, head_seq) = {
            let log = state.log.lock();
            let live = state.live.subscribe();
            let replay: Vec<Delivery> = match resume_after {
                Some(after) => {
                    if let Some(oldest) = log.retained.front() {
                        if oldest.seq > after + 1 {
                            tracing::warn!(
                                channel = %claims.channel,
                                resume_after = after,
                                oldest_retained = oldest.seq,
                                "Resume point fell outside retention; messages were lost"
                            );
                        }
                    }
                    log.retained
                        .iter()
                        .filter(|d| d.seq > after)
                        .cloned()
                        .collect()
                }
                None => Vec::new(),
            };
            (live, replay, log.next_seq)
        };

        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let remaining = (claims.expires_at() - Utc::now())
            .to_std()
            .unwrap_or_default();
        let deadline = tokio::time::Instant::now() + remaining;

        tracing::debug!(
            channel = %claims.channel,
            topics = %claims.topics,
            head_seq = head_seq,
            replayed = replay.len(),
            "Subscription opened"
        );

        tokio::spawn(forward(Forwarder {
            channel: claims.channel.clone(),
            topics: claims.topics.clone(),
            live,
            replay,
            severed: state.severed.subscribe(),
            deadline,
            tx,
        }));

        Ok(BrokerSubscription::new(
            claims.channel.clone(),
            claims.topics.clone(),
            claims.expires_at(),
            head_seq,
            rx,
        ))
    }
}

struct Forwarder {
    channel: ChannelAddress,
    topics: TopicSet,
    live: broadcast::Receiver<Delivery>,
    replay: Vec<Delivery>,
    severed: watch::Receiver<u64>,
    deadline: tokio::time::Instant,
    tx: mpsc::Sender<Delivery>,
}

fn admits(topics: &TopicSet, delivery: &Delivery) -> bool {
    delivery
        .message
        .topic
        .parse::<Topic>()
        .is_ok_and(|topic| topics.contains(topic))
}

async fn forward(mut f: Forwarder) {
    let mut last_seq = 0;

    for delivery in std::mem::take(&mut f.replay) {
        last_seq = delivery.seq;
        if admits(&f.topics, &delivery) && f.tx.send(delivery).await.is_err() {
            return;
        }
    }

    let expiry = tokio::time::sleep_until(f.deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            () = &mut expiry => {
                tracing::debug!(channel = %f.channel, "Token expired, closing subscription");
                break;
            }
            _ = f.severed.changed() => {
                tracing::debug!(channel = %f.channel, "Subscription severed");
                break;
            }
            () = f.tx.closed() => break,
            received = f.live.recv() => match received {
                Ok(delivery) => {
                    if delivery.seq <= last_seq {
                        continue;
                    }
                    last_seq = delivery.seq;
                    if admits(&f.topics, &delivery) && f.tx.send(delivery).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        channel = %f.channel,
                        skipped = skipped,
                        "Subscriber lagged, closing so it can resume"
                    );
                    break;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(topic: &str, n: u64) -> RawMessage {
        RawMessage {
            topic: topic.to_string(),
            payload: json!({ "n": n }),
        }
    }

    async fn token(broker: &InProcessBroker, session: &str, topics: TopicSet) -> String {
        broker
            .issue_token(
                &ChannelAddress::for_session(session),
                &topics,
                Duration::from_secs(60),
            )
            .await
            .unwrap()
            .token
    }

    #[tokio::test]
    async fn test_channel_created_implicitly() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");
        assert!(!broker.channel_exists(&channel));

        assert_eq!(broker.publish(&channel, raw("progress", 1)).await.unwrap(), 1);
        assert_eq!(broker.publish(&channel, raw("progress", 2)).await.unwrap(), 2);
        assert!(broker.channel_exists(&channel));
        assert_eq!(broker.head_seq(&channel), 2);
    }

    #[tokio::test]
    async fn test_fresh_subscriber_sees_only_new_messages() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");
        broker.publish(&channel, raw("progress", 1)).await.unwrap();

        let mut sub = broker
            .subscribe(&token(&broker, "a", TopicSet::all()).await, None)
            .await
            .unwrap();
        assert_eq!(sub.head_seq(), 1);

        broker.publish(&channel, raw("progress", 2)).await.unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.seq, 2);
    }

    #[tokio::test]
    async fn test_resume_replays_after_cursor() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");
        for n in 1..=5 {
            broker.publish(&channel, raw("text-chunk", n)).await.unwrap();
        }

        let mut sub = broker
            .subscribe(&token(&broker, "a", TopicSet::all()).await, Some(3))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().seq, 4);
        assert_eq!(sub.recv().await.unwrap().seq, 5);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");
        let topics: TopicSet = [Topic::Result].into_iter().collect();
        let mut sub = broker
            .subscribe(&token(&broker, "a", topics).await, None)
            .await
            .unwrap();

        broker.publish(&channel, raw("text-chunk", 1)).await.unwrap();
        broker.publish(&channel, raw("result", 2)).await.unwrap();

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.seq, 2);
        assert_eq!(delivery.message.topic, "result");
    }

    #[tokio::test]
    async fn test_token_scoped_to_channel() {
        let broker = InProcessBroker::new();
        let mut sub = broker
            .subscribe(&token(&broker, "a", TopicSet::all()).await, None)
            .await
            .unwrap();

        broker
            .publish(&ChannelAddress::for_session("b"), raw("result", 1))
            .await
            .unwrap();
        broker
            .publish(&ChannelAddress::for_session("a"), raw("result", 2))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().message.payload["n"], json!(2));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let broker = InProcessBroker::new();
        let token = broker
            .issue_token(
                &ChannelAddress::for_session("a"),
                &TopicSet::all(),
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = broker.subscribe(&token.token, None).await;
        assert!(matches!(result, Err(TransportError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_subscription_closes_at_expiry() {
        let broker = InProcessBroker::new();
        let token = broker
            .issue_token(
                &ChannelAddress::for_session("a"),
                &TopicSet::all(),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        let mut sub = broker.subscribe(&token.token, None).await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await;
        assert!(matches!(ended, Ok(None)));
    }

    #[tokio::test]
    async fn test_sever_ends_stream() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");
        let mut sub = broker
            .subscribe(&token(&broker, "a", TopicSet::all()).await, None)
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(&channel), 1);

        broker.sever(&channel);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");

        broker.fail_next_publishes(1);
        assert!(broker.publish(&channel, raw("progress", 1)).await.is_err());
        assert!(broker.publish(&channel, raw("progress", 2)).await.is_ok());

        let token = token(&broker, "a", TopicSet::all()).await;
        broker.set_outage(true);
        assert!(broker.publish(&channel, raw("progress", 3)).await.is_err());
        assert!(matches!(
            broker.subscribe(&token, None).await,
            Err(TransportError::Unavailable(_))
        ));
        broker.set_outage(false);
        assert!(broker.subscribe(&token, None).await.is_ok());
        assert_eq!(broker.publish(&channel, raw("progress", 4)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reissue_has_no_side_effect() {
        let broker = InProcessBroker::new();
        let channel = ChannelAddress::for_session("a");
        let first = token(&broker, "a", TopicSet::all()).await;
        let second = token(&broker, "a", TopicSet::all()).await;

        assert_ne!(first, second);
        assert_eq!(broker.head_seq(&channel), 0);
        assert!(broker.subscribe(&first, None).await.is_ok());
        assert!(broker.subscribe(&second, None).await.is_ok());
    }
}
