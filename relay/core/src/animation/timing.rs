//! Transition Timing
//!
//! Step-based timing for moving render parameters from one preset to the
//! next. A transition is a fixed number of steps at a fixed step interval;
//! each step's progress is shaped by an easing function.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Easing functions for smooth transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EasingFunction {
    /// No easing (constant speed)
    Linear,

    /// Quadratic ease out
    EaseOutQuad,

    /// Quadratic ease in and out
    #[default]
    EaseInOutQuad,

    /// Cubic ease in and out
    EaseInOutCubic,
}

impl EasingFunction {
    /// Apply the easing function to a progress value (0.0 to 1.0)
    #[must_use]
    pub fn apply(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);

        match self {
            Self::Linear => t,
            Self::EaseOutQuad => 1.0 - (1.0 - t) * (1.0 - t),
            Self::EaseInOutQuad => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
            Self::EaseInOutCubic => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
        }
    }
}

/// Shape of a preset-to-preset transition
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionTiming {
    /// Number of steps from start to target
    pub steps: u32,
    /// Time between steps
    #[serde(with = "millis")]
    pub step_interval: Duration,
    /// Easing applied to each step's linear progress
    pub easing: EasingFunction,
}

impl Default for TransitionTiming {
    /// 60 steps at 16ms (about one second at 60fps), ease-in-out-quad
    fn default() -> Self {
        Self {
            steps: 60,
            step_interval: Duration::from_millis(16),
            easing: EasingFunction::EaseInOutQuad,
        }
    }
}

impl TransitionTiming {
    /// Eased progress after `step` steps (clamped to 1.0 past the end)
    #[must_use]
    pub fn progress_at(&self, step: u32) -> f32 {
        if self.steps == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let linear = step.min(self.steps) as f32 / self.steps as f32;
        self.easing.apply(linear)
    }

    /// Total transition duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.step_interval * self.steps
    }

    /// Eased progress after `elapsed` wall time
    #[must_use]
    pub fn progress_after(&self, elapsed: Duration) -> f32 {
        if self.step_interval.is_zero() {
            return 1.0;
        }
        let step = elapsed.as_nanos() / self.step_interval.as_nanos();
        self.progress_at(u32::try_from(step).unwrap_or(u32::MAX))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
