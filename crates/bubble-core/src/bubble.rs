//! Secure-bubble presence classification.
//!
//! Distances are classified with two thresholds. At or below the inner
//! threshold the occupant is `Inside`; at or above the outer threshold they
//! are `Outside`; anything in between keeps the previous classification so the
//! state cannot flicker around a single boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};
use utoipa::ToSchema;

use crate::config::{BubbleConfig, ConfigError};
use crate::types::DistanceSample;

/// Presence relative to the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BubbleState {
    /// Within the bubble.
    Inside,
    /// Outside the bubble. Nothing is assumed until presence is proven.
    #[default]
    Outside,
}

/// A change of the published bubble state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BubbleTransition {
    /// State before the sample.
    pub from: BubbleState,
    /// State after the sample.
    pub to: BubbleState,
    /// Distance that caused the change.
    pub distance_m: f32,
    /// When the sample was taken.
    pub at: DateTime<Utc>,
}

/// Hysteresis classifier over a stream of distance samples.
#[derive(Debug, Clone)]
pub struct PresenceClassifier {
    inner_threshold_m: f32,
    outer_threshold_m: f32,
    classified: BubbleState,
    published: BubbleState,
}

impl PresenceClassifier {
    /// Create a classifier starting `Outside`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] unless
    /// `0 < inner_threshold_m < outer_threshold_m`.
    pub fn new(inner_threshold_m: f32, outer_threshold_m: f32) -> Result<Self, ConfigError> {
        if !(inner_threshold_m > 0.0 && inner_threshold_m < outer_threshold_m) {
            return Err(ConfigError::ValidationError {
                field: "bubble.inner_threshold_m".to_string(),
                message: format!(
                    "must be positive and below the outer threshold \
                     (inner {inner_threshold_m} m, outer {outer_threshold_m} m)"
                ),
            });
        }
        Ok(Self {
            inner_threshold_m,
            outer_threshold_m,
            classified: BubbleState::Outside,
            published: BubbleState::Outside,
        })
    }

    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn from_config(config: &BubbleConfig) -> Result<Self, ConfigError> {
        Self::new(config.inner_threshold_m, config.outer_threshold_m)
    }

    /// Currently published state.
    #[must_use]
    pub const fn state(&self) -> BubbleState {
        self.published
    }

    /// Classify one distance against the previous classification.
    pub fn classify(&mut self, distance_m: f32) -> BubbleState {
        if distance_m <= self.inner_threshold_m {
            self.classified = BubbleState::Inside;
        } else if distance_m >= self.outer_threshold_m {
            self.classified = BubbleState::Outside;
        }
        self.classified
    }

    /// Feed a sample; returns a transition when the published state changes.
    pub fn observe(&mut self, sample: &DistanceSample) -> Option<BubbleTransition> {
        let classified = self.classify(sample.distance_m);
        trace!(accessory = %sample.accessory, distance_m = sample.distance_m, ?classified, "Distance sample");

        if classified == self.published {
            return None;
        }

        let transition = BubbleTransition {
            from: self.published,
            to: classified,
            distance_m: sample.distance_m,
            at: sample.timestamp,
        };
        self.published = classified;
        info!(from = ?transition.from, to = ?transition.to, distance_m = sample.distance_m, "Bubble state changed");
        Some(transition)
    }

    /// Forget the distance history when another session takes over.
    ///
    /// The published state is left untouched; the successor's samples move it.
    pub fn reset_history(&mut self) {
        self.classified = self.published;
    }

    /// Drop all evidence when no session is ranging. Presence is never
    /// assumed without ranging, so the state falls back to `Outside`.
    /// Returns `true` when the published state changed.
    pub fn reset(&mut self) -> bool {
        self.classified = BubbleState::Outside;
        if self.published == BubbleState::Outside {
            return false;
        }
        self.published = BubbleState::Outside;
        info!(from = ?BubbleState::Inside, to = ?BubbleState::Outside, "Bubble state reset, no ranging evidence");
        true
    }
}

/// Delay-and-recheck gate in front of side effects driven by bubble
/// transitions.
///
/// Each transition arms a new generation. When the delay elapses the caller
/// settles that generation; it only commits if no newer transition arrived and
/// the state has not reverted in the meantime.
#[derive(Debug, Clone, Default)]
pub struct Debounce {
    generation: u64,
    pending: Option<BubbleState>,
}

impl Debounce {
    /// Arm the gate for `state`, superseding any pending transition.
    pub fn arm(&mut self, state: BubbleState) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.pending = Some(state);
        self.generation
    }

    /// Settle a generation against the current published state.
    pub fn settle(&mut self, generation: u64, current: BubbleState) -> Option<BubbleState> {
        if generation != self.generation {
            debug!(generation, latest = self.generation, "Superseded debounce");
            return None;
        }
        let pending = self.pending.take()?;
        if pending == current {
            Some(pending)
        } else {
            debug!(?pending, ?current, "Bubble state reverted during debounce");
            None
        }
    }

    /// Whether a transition is waiting to settle.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
