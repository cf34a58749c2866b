//! Publisher
//!
//! Turns domain events into topic-tagged messages and hands them to the
//! broker. The reliability tier is chosen per call through [`Discipline`]:
//!
//! - [`Discipline::Awaited`]: the caller suspends until the broker
//!   acknowledges the enqueue; failures propagate.
//! - [`Discipline::BestEffort`]: the caller never suspends; failures are
//!   logged at `warn` and dropped.
//!
//! # Ordering
//!
//! ```text
//! publish()          ─┐
//! publish_detached() ─┼──→ unbounded lane ──→ lane task ──→ Broker::publish
//! flush()            ─┘     (FIFO)            (one at a time)
//! ```
//!
//! Every call goes through one FIFO lane drained by a single task, so a
//! best-effort chunk queued before an awaited result reaches the broker
//! before it, even though the chunk's caller never waited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::broker::{Broker, TransportError};
use crate::channel::{schema_for, ChannelAddress, RegistryError, Topic};
use crate::messages::{ChannelMessage, ErrorPayload, RawMessage};

/// How a call site wants its publish delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// Wait for the broker acknowledgment and propagate failures
    Awaited,
    /// Queue and return immediately; failures are logged and dropped
    BestEffort,
}

/// Errors from an awaited publish
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Message failed registry validation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Broker rejected the publish
    #[error("publish failed: {0}")]
    Transport(#[from] TransportError),

    /// The publish lane is gone (runtime shutting down)
    #[error("publisher lane closed")]
    Closed,
}

/// Counters for the publish lane
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Messages the broker acknowledged
    pub acknowledged: u64,
    /// Awaited publishes that failed
    pub failed_awaited: u64,
    /// Best-effort publishes that were dropped
    pub dropped_best_effort: u64,
}

#[derive(Default)]
struct Counters {
    acknowledged: AtomicU64,
    failed_awaited: AtomicU64,
    dropped_best_effort: AtomicU64,
}

enum LaneRequest {
    Publish {
        channel: ChannelAddress,
        topic: Topic,
        message: RawMessage,
        ack: Option<oneshot::Sender<Result<u64, TransportError>>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the publish lane
///
/// Cheap to clone; the lane task exits once every clone is dropped and the
/// queue is drained.
#[derive(Clone)]
pub struct Publisher {
    lane: mpsc::UnboundedSender<LaneRequest>,
    counters: Arc<Counters>,
}

impl Publisher {
    /// Start a publish lane over `broker`
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(broker: Arc<dyn Broker>) -> Self {
        let (lane, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(drain_lane(broker, rx, Arc::clone(&counters)));
        Self { lane, counters }
    }

    /// Publish and wait for the broker acknowledgment
    ///
    /// Returns the sequence number the broker assigned.
    ///
    /// # Errors
    ///
    /// [`PublishError::Transport`] if the broker rejects the message,
    /// [`PublishError::Registry`] if it fails validation.
    pub async fn publish(
        &self,
        channel: &ChannelAddress,
        message: impl Into<ChannelMessage>,
    ) -> Result<u64, PublishError> {
        let message = message.into();
        let topic = message.topic();
        let raw = message.to_raw()?;
        self.enqueue_awaited(channel, topic, raw).await
    }

    /// Queue a publish without waiting; never fails from the caller's view
    pub fn publish_detached(&self, channel: &ChannelAddress, message: impl Into<ChannelMessage>) {
        let message = message.into();
        let topic = message.topic();
        match message.to_raw() {
            Ok(raw) => self.enqueue_detached(channel, topic, raw),
            Err(e) => {
                self.counters
                    .dropped_best_effort
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %channel, topic = %topic, error = %e, "Dropped best-effort publish");
            }
        }
    }

    /// Publish under the given discipline
    ///
    /// Best-effort calls always return `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Only awaited calls can fail; see [`Publisher::publish`].
    pub async fn dispatch(
        &self,
        discipline: Discipline,
        channel: &ChannelAddress,
        message: impl Into<ChannelMessage>,
    ) -> Result<Option<u64>, PublishError> {
        match discipline {
            Discipline::Awaited => self.publish(channel, message).await.map(Some),
            Discipline::BestEffort => {
                self.publish_detached(channel, message);
                Ok(None)
            }
        }
    }

    /// Publish an untyped payload addressed by topic name
    ///
    /// The name and payload are validated against the registry before
    /// anything is queued, for both disciplines.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownTopic`] for names outside the topic set,
    /// [`RegistryError::InvalidPayload`] for payloads that fail the schema,
    /// plus the awaited failures of [`Publisher::publish`].
    pub async fn publish_raw(
        &self,
        discipline: Discipline,
        channel: &ChannelAddress,
        topic_name: &str,
        payload: serde_json::Value,
    ) -> Result<Option<u64>, PublishError> {
        let schema = schema_for(topic_name)?;
        schema.validate(&payload)?;

        let topic = schema.topic;
        let raw = RawMessage {
            topic: topic.as_str().to_string(),
            payload,
        };
        match discipline {
            Discipline::Awaited => self.enqueue_awaited(channel, topic, raw).await.map(Some),
            Discipline::BestEffort => {
                self.enqueue_detached(channel, topic, raw);
                Ok(None)
            }
        }
    }

    /// Publish an `error` message, logging instead of returning a failure
    ///
    /// There is no fallback channel for a failed error publish. Returns
    /// whether the broker acknowledged it.
    pub async fn publish_error(&self, channel: &ChannelAddress, error: ErrorPayload) -> bool {
        let recoverable = error.recoverable;
        match self.publish(channel, error).await {
            Ok(seq) => {
                tracing::debug!(channel = %channel, seq = seq, recoverable = recoverable, "Published error");
                true
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Failed to publish error message");
                false
            }
        }
    }

    /// Wait until everything queued so far has been handed to the broker
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.lane.send(LaneRequest::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Snapshot of the lane counters
    #[must_use]
    pub fn stats(&self) -> PublishStats {
        PublishStats {
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            failed_awaited: self.counters.failed_awaited.load(Ordering::Relaxed),
            dropped_best_effort: self.counters.dropped_best_effort.load(Ordering::Relaxed),
        }
    }

    async fn enqueue_awaited(
        &self,
        channel: &ChannelAddress,
        topic: Topic,
        message: RawMessage,
    ) -> Result<u64, PublishError> {
        let (ack, rx) = oneshot::channel();
        self.lane
            .send(LaneRequest::Publish {
                channel: channel.clone(),
                topic,
                message,
                ack: Some(ack),
            })
            .map_err(|_| PublishError::Closed)?;

        let seq = rx.await.map_err(|_| PublishError::Closed)??;
        Ok(seq)
    }

    fn enqueue_detached(&self, channel: &ChannelAddress, topic: Topic, message: RawMessage) {
        let sent = self.lane.send(LaneRequest::Publish {
            channel: channel.clone(),
            topic,
            message,
            ack: None,
        });
        if sent.is_err() {
            self.counters
                .dropped_best_effort
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(channel = %channel, topic = %topic, "Publisher lane closed; dropped best-effort publish");
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

async fn drain_lane(
    broker: Arc<dyn Broker>,
    mut rx: mpsc::UnboundedReceiver<LaneRequest>,
    counters: Arc<Counters>,
) {
    tracing::debug!(broker = broker.name(), "Publish lane started");

    while let Some(request) = rx.recv().await {
        match request {
            LaneRequest::Publish {
                channel,
                topic,
                message,
                ack,
            } => {
                let result = broker.publish(&channel, message).await;
                match (&result, ack) {
                    (Ok(seq), ack) => {
                        counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(channel = %channel, topic = %topic, seq = *seq, "Acknowledged");
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                    }
                    (Err(_), Some(ack)) => {
                        counters.failed_awaited.fetch_add(1, Ordering::Relaxed);
                        let _ = ack.send(result);
                    }
                    (Err(e), None) => {
                        counters.dropped_best_effort.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            channel = %channel,
                            topic = %topic,
                            error = %e,
                            "Best-effort publish failed; dropped"
                        );
                    }
                }
            }
            LaneRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("Publish lane stopped");
}
