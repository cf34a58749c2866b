//! Render Presets
//!
//! Maps an [`AnimationState`] to the parameters a particle renderer consumes.
//! The renderer itself lives outside this crate; these are plain numbers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::timing::TransitionTiming;
use super::AnimationState;

/// Parameters handed to the renderer
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    /// Depth-of-field focus distance
    pub focus: f32,
    /// Particle speed
    pub speed: f32,
    /// Depth-of-field aperture
    pub aperture: f32,
    /// Field of view
    pub fov: f32,
    /// Flow-field curl
    pub curl: f32,
}

impl RenderParams {
    /// Resting orb
    pub const IDLE: Self = Self {
        focus: 9.5,
        speed: 6.9,
        aperture: 3.6,
        fov: 14.0,
        curl: 0.30,
    };

    /// Thinking
    pub const PROCESSING: Self = Self {
        focus: 9.4,
        speed: 7.2,
        aperture: 3.5,
        fov: 14.5,
        curl: 0.32,
    };

    /// Responding
    pub const STREAMING: Self = Self {
        focus: 9.3,
        speed: 7.5,
        aperture: 3.4,
        fov: 15.0,
        curl: 0.35,
    };

    /// Done; same as resting
    pub const COMPLETE: Self = Self::IDLE;

    /// Preset for a state
    #[must_use]
    pub const fn for_state(state: AnimationState) -> Self {
        match state {
            AnimationState::Idle => Self::IDLE,
            AnimationState::Processing => Self::PROCESSING,
            AnimationState::Streaming => Self::STREAMING,
            AnimationState::Complete => Self::COMPLETE,
        }
    }

    /// Linear blend toward `target` by `t` (0.0 to 1.0)
    #[must_use]
    pub fn lerp(self, target: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: f32, b: f32| a + (b - a) * t;
        Self {
            focus: mix(self.focus, target.focus),
            speed: mix(self.speed, target.speed),
            aperture: mix(self.aperture, target.aperture),
            fov: mix(self.fov, target.fov),
            curl: mix(self.curl, target.curl),
        }
    }

    /// Gentle breathing applied while streaming (fov and curl only)
    #[must_use]
    pub fn pulsate(self, elapsed: Duration) -> Self {
        let wave = elapsed.as_secs_f32().sin() * 0.5 + 0.5;
        Self {
            curl: self.curl + wave * 0.02,
            fov: self.fov + wave * 0.2,
            ..self
        }
    }
}

impl Default for RenderParams {
    fn default() -> Self {
        Self::IDLE
    }
}

/// An in-flight move from the current parameters to a state's preset
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresetTransition {
    from: RenderParams,
    to: RenderParams,
    timing: TransitionTiming,
}

impl PresetTransition {
    /// Start a transition from `from` toward the preset for `target`
    #[must_use]
    pub fn toward(from: RenderParams, target: AnimationState, timing: TransitionTiming) -> Self {
        Self {
            from,
            to: RenderParams::for_state(target),
            timing,
        }
    }

    /// Parameters after `elapsed`
    #[must_use]
    pub fn sample(&self, elapsed: Duration) -> RenderParams {
        self.from.lerp(self.to, self.timing.progress_after(elapsed))
    }

    /// Whether the transition has reached its target
    #[must_use]
    pub fn is_finished(&self, elapsed: Duration) -> bool {
        elapsed >= self.timing.duration()
    }

    /// Target parameters
    #[must_use]
    pub fn target(&self) -> RenderParams {
        self.to
    }
}

/// Render parameters for `state`, `elapsed` into a transition from `from`
///
/// Streaming adds the breathing offset on top of the transition.
#[must_use]
pub fn render_params(
    from: RenderParams,
    state: AnimationState,
    timing: TransitionTiming,
    elapsed: Duration,
) -> RenderParams {
    let params = PresetTransition::toward(from, state, timing).sample(elapsed);
    if state == AnimationState::Streaming {
        params.pulsate(elapsed)
    } else {
        params
    }
}
