//! Animation State Machine
//!
//! Derives a small presentation state from session view changes plus one
//! timer. The machine never looks at raw messages; it consumes the
//! [`ViewChange`]s the reducer reports for each batch.
//!
//! # Transitions
//!
//! ```text
//!            progress running (< threshold)
//!   Idle ─────────────────────────────────→ Processing
//!    ▲  ╲                                      │
//!    │   ╲ non-terminal chunk                  │ non-terminal chunk
//!    │    ╲                                    ▼
//!    │     ╰─────────────────────────────→ Streaming
//!    │                                         │
//!    │ quiescence timer                        │ terminal chunk / result /
//!    │ (error: immediately)                    │ progress completed
//!    │                                         ▼
//!    └───────────────────────────────────── Complete
//! ```
//!
//! # Timer
//!
//! [`AnimationStateMachine`] is pure: it returns a [`TimerAction`] and the
//! caller owns the clock. Every observed batch bumps an epoch, so a timer
//! armed before a newer batch is ignored when it fires.
//! [`AnimationDriver`] is the tokio owner of that timer; it aborts the
//! pending task on every observation and re-arms it when the machine asks.

pub mod presets;
pub mod timing;

pub use presets::{render_params, PresetTransition, RenderParams};
pub use timing::{EasingFunction, TransitionTiming};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::messages::StepStatus;
use crate::reducer::ViewChange;

/// Presentation state of the orb
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationState {
    /// Resting
    #[default]
    Idle,
    /// Working before any text
    Processing,
    /// Text is arriving
    Streaming,
    /// Turn finished; reverts to idle after quiescence
    Complete,
}

impl AnimationState {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for AnimationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Animation settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnimationConfig {
    /// Idle time in `Complete` before reverting to `Idle`
    pub quiescence: Duration,
    /// Running progress at or above this does not force `Processing`
    pub streaming_threshold: u8,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_millis(3000),
            streaming_threshold: 50,
        }
    }
}

/// What the owner of the clock should do after an observation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// Cancel any pending timer
    Cancel,
    /// Cancel any pending timer and start a new one
    Arm {
        /// Epoch to hand back to [`AnimationStateMachine::fire`]
        epoch: u64,
        /// Delay before firing
        after: Duration,
    },
}

/// Result of observing a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before the batch
    pub from: AnimationState,
    /// State after the batch
    pub to: AnimationState,
    /// Timer instruction
    pub timer: TimerAction,
}

impl Transition {
    /// Whether the state changed
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Pure animation state machine
#[derive(Clone, Debug, Default)]
pub struct AnimationStateMachine {
    state: AnimationState,
    config: AnimationConfig,
    epoch: u64,
}

impl AnimationStateMachine {
    /// Start in `Idle`
    #[must_use]
    pub fn new(config: AnimationConfig) -> Self {
        Self {
            state: AnimationState::Idle,
            config,
            epoch: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> AnimationState {
        self.state
    }

    /// Current epoch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Observe the changes produced by one delivered batch
    ///
    /// An error anywhere in the batch leaves the machine in `Idle` at the end
    /// of the batch, whatever else the batch contained.
    pub fn observe(&mut self, changes: &[ViewChange]) -> Transition {
        let from = self.state;
        self.epoch += 1;

        let mut saw_error = false;
        for change in changes {
            if let Some(next) = self.next_state(change) {
                self.state = next;
            }
            saw_error |= matches!(change, ViewChange::ErrorSet { .. });
        }
        if saw_error {
            self.state = AnimationState::Idle;
        }

        let timer = if self.state == AnimationState::Complete {
            TimerAction::Arm {
                epoch: self.epoch,
                after: self.config.quiescence,
            }
        } else {
            TimerAction::Cancel
        };

        Transition {
            from,
            to: self.state,
            timer,
        }
    }

    fn next_state(&self, change: &ViewChange) -> Option<AnimationState> {
        match change {
            ViewChange::Progress {
                status: StepStatus::Running,
                progress,
                ..
            } if *progress < self.config.streaming_threshold => Some(AnimationState::Processing),
            ViewChange::Progress {
                status: StepStatus::Completed,
                ..
            }
            | ViewChange::TextCompleted
            | ViewChange::ResultSet => Some(AnimationState::Complete),
            ViewChange::TextAppended { .. } => Some(AnimationState::Streaming),
            ViewChange::ErrorSet { .. } => Some(AnimationState::Idle),
            ViewChange::Progress { .. } => None,
        }
    }

    /// Quiescence timer fired
    ///
    /// Returns the new state if the timer was still current.
    pub fn fire(&mut self, epoch: u64) -> Option<AnimationState> {
        if epoch != self.epoch || self.state != AnimationState::Complete {
            return None;
        }
        self.state = AnimationState::Idle;
        Some(self.state)
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the machine, its quiescence timer and a watchable state
#[derive(Clone)]
pub struct AnimationDriver {
    machine: Arc<Mutex<AnimationStateMachine>>,
    state: Arc<watch::Sender<AnimationState>>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AnimationDriver {
    /// Create a driver starting in `Idle`
    #[must_use]
    pub fn new(config: AnimationConfig) -> Self {
        let (state, _) = watch::channel(AnimationState::Idle);
        Self {
            machine: Arc::new(Mutex::new(AnimationStateMachine::new(config))),
            state: Arc::new(state),
            timer: Arc::new(Mutex::new(None)),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> AnimationState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AnimationState> {
        self.state.subscribe()
    }

    /// Feed one batch's changes; must be called from within a tokio runtime
    pub fn observe(&self, changes: &[ViewChange]) -> Transition {
        let transition = {
            let mut machine = self.machine.lock();
            let transition = machine.observe(changes);
            self.state.send_replace(transition.to);
            transition
        };
        if transition.changed() {
            tracing::debug!(from = %transition.from, to = %transition.to, "Animation state changed");
        }

        let mut timer = self.timer.lock();
        if let Some(pending) = timer.take() {
            pending.abort();
        }
        if let TimerAction::Arm { epoch, after } = transition.timer {
            let machine = Arc::clone(&self.machine);
            let state = Arc::clone(&self.state);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let mut machine = machine.lock();
                if let Some(next) = machine.fire(epoch) {
                    state.send_replace(next);
                    drop(machine);
                    tracing::debug!(to = %next, "Quiescence elapsed");
                }
            }));
        }
        transition
    }

    /// Cancel the pending timer, if any
    pub fn cancel(&self) {
        if let Some(pending) = self.timer.lock().take() {
            pending.abort();
        }
    }
}

impl std::fmt::Debug for AnimationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationDriver")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
