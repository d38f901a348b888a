//! Debounced presence state machine.
//!
//! Turns the per-frame "any face detected" signal into edge-triggered
//! Absent/Present transitions. A transition needs `threshold` consecutive
//! readings that disagree with the current state, so a single missed or
//! spurious detection never flips the display.

use crate::types::{PresenceEdge, PresenceSnapshot, PresenceState};
use std::time::Instant;

/// Consecutive agreeing frames needed to change state.
pub const DEFAULT_DEBOUNCE_FRAMES: u32 = 3;

#[derive(Debug)]
pub struct PresenceAggregator {
    threshold: u32,
    current: PresenceSnapshot,
    /// Consecutive readings contradicting `current.state`.
    streak: u32,
}

impl PresenceAggregator {
    /// `threshold` of 1 mirrors the raw per-frame signal; 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            current: PresenceSnapshot::default(),
            streak: 0,
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.current
    }

    /// Feed one processed frame's detection result.
    ///
    /// Returns the new snapshot when this reading confirms a transition.
    pub fn observe(&mut self, detected: bool, at: Instant) -> Option<PresenceEdge> {
        let reading = if detected {
            PresenceState::Present
        } else {
            PresenceState::Absent
        };

        if reading == self.current.state {
            self.streak = 0;
            return None;
        }

        self.streak += 1;
        if self.streak < self.threshold {
            return None;
        }

        self.streak = 0;
        self.current = PresenceSnapshot {
            state: reading,
            sequence: self.current.sequence + 1,
            since: Some(at),
        };
        tracing::info!(state = ?reading, sequence = self.current.sequence, "presence changed");
        Some(self.current)
    }
}

impl Default for PresenceAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_FRAMES)
    }
}
