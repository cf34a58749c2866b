//! Relay Core - Session-Scoped Realtime Event Distribution
//!
//! This crate carries the progress, streamed text, results and errors of one
//! conversational turn from the producer that runs it to every client
//! watching that session. Each session gets its own channel; subscribers get
//! short-lived, topic-scoped tokens; the client folds what it receives into a
//! view and drives a small animation state machine from it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────── PRODUCER ───────────────────────────┐
//! │                                                                 │
//! │  TurnRunner ──→ TextGenerator (OpenAI / Scripted)               │
//! │      │                                                          │
//! │      ▼                                                          │
//! │  Publisher ── awaited / best-effort, one FIFO lane ──┐          │
//! └──────────────────────────────────────────────────────┼──────────┘
//!                                                        │
//!                     ┌──────────────────────────────────┼─────┐
//!                     │  Broker ("session-<id>" channels) ▼     │
//!                     │  TokenIssuer ──→ Authorizer hook        │
//!                     └──────────────────────────────────┬─────┘
//!                                                        │
//! ┌─────────────────────────── CONSUMER ─────────────────┼──────────┐
//! │                                                      ▼          │
//! │  SubscriptionClient ── token refresh, reconnect ──→ Batch       │
//! │      │                                                          │
//! │      ▼                                                          │
//! │  SessionView::fold ──→ ViewChange ──→ AnimationStateMachine     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChannelAddress`] / [`Topic`]: the naming registry
//! - [`ChannelMessage`]: the four typed payloads
//! - [`TokenIssuer`]: authorizes requesters and mints [`SubscriptionToken`]s
//! - [`Publisher`]: ordered publishing under two delivery disciplines
//! - [`SubscriptionClient`]: token-refreshing, reconnecting subscriber
//! - [`SessionView`]: the client-side fold
//! - [`AnimationStateMachine`]: idle / processing / streaming / complete
//! - [`SessionSubscriber`]: the consumer pipeline wired together
//! - [`TurnRunner`]: one producer turn, start to finish
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     ChannelAddress, InProcessBroker, Publisher, ScriptedGenerator, TurnConfig,
//!     TurnRequest, TurnRunner,
//! };
//!
//! let broker = Arc::new(InProcessBroker::new());
//! let runner = TurnRunner::new(
//!     Publisher::spawn(broker),
//!     Arc::new(ScriptedGenerator::demo()),
//!     TurnConfig::default(),
//! );
//! let outcome = runner.run(&TurnRequest::new("abc", "Hello?")).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod animation;
pub mod broker;
pub mod channel;
pub mod config;
pub mod generation;
pub mod messages;
pub mod publisher;
pub mod reducer;
pub mod session;
pub mod subscription;
pub mod token;
pub mod workflow;

// Registry and message exports
pub use channel::{schema_for, ChannelAddress, PayloadSchema, RegistryError, Topic, TopicSet};
pub use messages::{
    ChannelMessage, ErrorPayload, MetadataValue, ProgressUpdate, RawMessage, ResultPayload,
    StepStatus, TextChunk,
};

// Transport exports
pub use broker::{
    Broker, BrokerSubscription, Delivery, InProcessBroker, InProcessBrokerConfig, TransportError,
};

// Token exports
pub use token::{
    AllowListAuthorizer, AuthorizationError, Authorizer, IssuerRefresher, Requester,
    SubscriptionToken, TokenConfig, TokenIssuer, TokenRefresher,
};

// Producer exports
pub use generation::{OpenAiGenerator, ScriptedGenerator, TextGenerator};
pub use publisher::{Discipline, PublishError, PublishStats, Publisher};
pub use workflow::{
    DemoConfig, DemoOutcome, DemoRunner, TurnConfig, TurnError, TurnOutcome, TurnRequest,
    TurnRunner,
};

// Consumer exports
pub use animation::{
    AnimationConfig, AnimationDriver, AnimationState, AnimationStateMachine, RenderParams,
};
pub use reducer::{SessionView, TextBufferPolicy, ViewChange};
pub use session::{SessionConfig, SessionSubscriber};
pub use subscription::{
    Batch, ConnectionState, ReconnectPolicy, SubscriptionClient, SubscriptionConfig,
    SubscriptionHandle,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, RelayToml,
};
