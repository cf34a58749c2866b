//! Session Subscriber
//!
//! Wires the consumer pipeline for one session and exposes its outputs as
//! watch channels:
//!
//! ```text
//! SubscriptionClient ──Batch──→ SessionView::fold_with_changes ──→ AnimationDriver
//!        │                              │                               │
//!        ▼                              ▼                               ▼
//!  ConnectionState               SessionView snapshot            AnimationState
//! ```
//!
//! Batches are folded one at a time by a single task, so the reducer never
//! runs concurrently with itself.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::animation::{AnimationConfig, AnimationDriver, AnimationState};
use crate::broker::Broker;
use crate::channel::ChannelAddress;
use crate::reducer::{SessionView, TextBufferPolicy};
use crate::subscription::{ConnectionState, SubscriptionClient, SubscriptionConfig};
use crate::token::{SubscriptionToken, TokenRefresher};

/// Consumer pipeline settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionConfig {
    /// Subscription client settings
    pub subscription: SubscriptionConfig,
    /// Animation settings
    pub animation: AnimationConfig,
    /// Text buffer lifecycle across turns
    pub text_buffer: TextBufferPolicy,
}

/// An attached subscriber for one session
pub struct SessionSubscriber {
    channel: ChannelAddress,
    view: watch::Receiver<SessionView>,
    connection: watch::Receiver<ConnectionState>,
    animation: AnimationDriver,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SessionSubscriber {
    /// Attach to the token's channel with an empty view
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn attach(
        broker: Arc<dyn Broker>,
        token: SubscriptionToken,
        refresher: Arc<dyn TokenRefresher>,
        config: SessionConfig,
    ) -> Self {
        let channel = token.channel.clone();
        let mut subscription =
            SubscriptionClient::attach(broker, token, refresher, config.subscription);
        let connection = subscription.state_watch();
        let animation = AnimationDriver::new(config.animation);
        let (view_tx, view_rx) = watch::channel(SessionView::new(config.text_buffer));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let driver = animation.clone();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    batch = subscription.next_batch() => batch,
                };
                let Some(batch) = batch else {
                    break;
                };

                let mut changes = Vec::new();
                view_tx.send_modify(|view| changes = view.fold_with_changes(&batch.messages));
                driver.observe(&changes);

                tracing::trace!(
                    channel = %task_channel,
                    first_seq = batch.first_seq,
                    last_seq = batch.last_seq,
                    animation = %driver.state(),
                    "Folded batch"
                );
            }
            subscription.detach().await;
            driver.cancel();
        });

        Self {
            channel,
            view: view_rx,
            connection,
            animation,
            shutdown,
            task: Some(task),
        }
    }

    /// Channel being read
    #[must_use]
    pub fn channel(&self) -> &ChannelAddress {
        &self.channel
    }

    /// Snapshot of the session view
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Watch the session view
    #[must_use]
    pub fn view_watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Current animation state
    #[must_use]
    pub fn animation_state(&self) -> AnimationState {
        self.animation.state()
    }

    /// Watch the animation state
    #[must_use]
    pub fn animation_watch(&self) -> watch::Receiver<AnimationState> {
        self.animation.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// Watch the connection state
    #[must_use]
    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Stop refresh, release the connection and cancel the quiescence timer
    pub async fn detach(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(channel = %self.channel, error = %e, "Session task ended abnormally");
            }
        }
        self.animation.cancel();
    }
}

impl Drop for SessionSubscriber {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for SessionSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSubscriber")
            .field("channel", &self.channel)
            .field("connection", &*self.connection.borrow())
            .field("animation", &self.animation.state())
            .finish_non_exhaustive()
    }
}
