//! Temporal low-pass filter for the tracked face box.
//!
//! Bridges short detection dropouts, damps single-frame jitter with a
//! per-coordinate exponential moving average, and caps the update rate.

use crate::clock::Clock;
use crate::types::BoundingBox;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherSettings {
    /// Upper bound on accepted updates per second.
    pub max_updates_per_sec: f32,
    /// Consecutive empty frames tolerated before tracking is dropped.
    pub max_misses: u32,
    /// Fraction of the way each coordinate moves toward a new sample.
    pub blend: f32,
    /// Capacity of the stable-box history.
    pub history_len: usize,
}

impl Default for SmootherSettings {
    fn default() -> Self {
        Self {
            max_updates_per_sec: 30.0,
            max_misses: 5,
            blend: 0.3,
            history_len: 5,
        }
    }
}

impl SmootherSettings {
    pub fn min_update_interval(&self) -> Duration {
        if self.max_updates_per_sec > 0.0 {
            Duration::from_secs_f32(1.0 / self.max_updates_per_sec)
        } else {
            Duration::ZERO
        }
    }
}

/// Per-stream smoother state. Replaced as a whole on every accepted update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmootherState {
    pub last_valid: Option<BoundingBox>,
    pub history: VecDeque<BoundingBox>,
    pub misses: u32,
    pub last_update: Option<Instant>,
}

pub struct BoxSmoother {
    settings: SmootherSettings,
    clock: Arc<dyn Clock>,
    state: SmootherState,
}

impl BoxSmoother {
    pub fn new(settings: SmootherSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            state: SmootherState::default(),
        }
    }

    /// Feed this tick's detection (or `None`) and get the stable box to draw.
    pub fn smooth(&mut self, sample: Option<BoundingBox>) -> Option<BoundingBox> {
        let now = self.clock.now();
        if let Some(last) = self.state.last_update {
            if now.saturating_duration_since(last) < self.settings.min_update_interval() {
                return self.state.last_valid;
            }
        }

        let (next, output) = self.advance(sample, now);
        self.state = next;
        output
    }

    fn advance(&self, sample: Option<BoundingBox>, now: Instant) -> (SmootherState, Option<BoundingBox>) {
        let Some(sample) = sample else {
            let misses = self.state.misses + 1;
            if misses > self.settings.max_misses {
                tracing::debug!(misses, "face lost; resetting smoother");
                return (SmootherState::default(), None);
            }
            let next = SmootherState {
                misses,
                last_update: Some(now),
                ..self.state.clone()
            };
            return (next, self.state.last_valid);
        };

        let (stable, mut history) = match self.state.last_valid {
            Some(prev) => (prev.lerp(&sample, self.settings.blend), self.state.history.clone()),
            None => (sample, VecDeque::with_capacity(self.settings.history_len)),
        };
        history.push_back(stable);
        while history.len() > self.settings.history_len {
            history.pop_front();
        }

        let next = SmootherState {
            last_valid: Some(stable),
            history,
            misses: 0,
            last_update: Some(now),
        };
        (next, Some(stable))
    }

    pub fn reset(&mut self) {
        self.state = SmootherState::default();
    }

    pub fn state(&self) -> &SmootherState {
        &self.state
    }

    pub fn settings(&self) -> &SmootherSettings {
        &self.settings
    }
}
