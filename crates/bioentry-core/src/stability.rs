//! Temporal debouncing of face detections.
//!
//! The tracker fires once per presence: a face must be present, confident and
//! still for a full window of consecutive samples, after which the tracker
//! latches until the face has been gone for longer than the loss gap.

use crate::types::{BoundingBox, Detection};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tuning for [`StabilityTracker`].
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Number of consecutive samples that make up the window.
    pub window: usize,
    /// Maximum center movement between consecutive samples, in pixels.
    pub max_center_shift: f32,
    /// Detections below this confidence count as no face.
    pub min_confidence: f32,
    /// Absence longer than this resets the tracker and releases the latch.
    pub loss_gap: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            // 3 seconds at 10 fps
            window: 30,
            max_center_shift: 25.0,
            min_confidence: 0.6,
            loss_gap: Duration::from_millis(800),
        }
    }
}

/// Emitted once when a face becomes stable.
#[derive(Debug, Clone)]
pub struct Trigger {
    /// Sequence number of the frame that completed the window.
    pub sequence: u64,
    pub face: BoundingBox,
    /// Time between the first and last sample of the window.
    pub dwell: Duration,
}

pub struct StabilityTracker {
    config: StabilityConfig,
    window: VecDeque<(Instant, BoundingBox)>,
    last_seen: Option<Instant>,
    latched: bool,
    /// Set after a capture; the next sample re-anchors absence timing.
    resuming: bool,
}

impl StabilityTracker {
    pub fn new(config: StabilityConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            last_seen: None,
            latched: false,
            resuming: false,
        }
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Feed one sampled frame's detection. Returns a trigger when stability is newly reached.
    pub fn observe(&mut self, detection: &Detection, now: Instant) -> Option<Trigger> {
        if detection.is_ambiguous() {
            tracing::debug!(
                seq = detection.sequence,
                faces = detection.face_count,
                "ambiguous scene; tracking largest face only"
            );
        }

        // Samples were not observed while the capture was handled; that time is not absence.
        if self.resuming {
            self.resuming = false;
            if self.latched {
                self.last_seen = Some(now);
            }
        }

        // Anything gone for longer than the loss gap is a new presence.
        if let Some(last) = self.last_seen {
            if now.saturating_duration_since(last) > self.config.loss_gap {
                if self.latched || !self.window.is_empty() {
                    tracing::debug!(seq = detection.sequence, "face lost; stability reset");
                }
                self.reset();
            }
        }

        let face = match detection.face {
            Some(face) if face.confidence >= self.config.min_confidence => face,
            _ => {
                // Every sample of the window must contain a face.
                self.window.clear();
                return None;
            }
        };
        self.last_seen = Some(now);

        if self.latched {
            return None;
        }

        if let Some((_, previous)) = self.window.back() {
            let shift = previous.center_distance(&face);
            if shift > self.config.max_center_shift {
                tracing::trace!(seq = detection.sequence, shift, "face moved; window restarted");
                self.window.clear();
            }
        }

        self.window.push_back((now, face));
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }

        if self.window.len() < self.config.window.max(1) {
            return None;
        }

        let dwell = self
            .window
            .front()
            .map(|(first, _)| now.saturating_duration_since(*first))
            .unwrap_or_default();
        self.window.clear();
        self.latched = true;

        Some(Trigger {
            sequence: detection.sequence,
            face,
            dwell,
        })
    }

    /// True while a face is accumulating or a capture for the current presence already fired.
    pub fn is_tracking(&self) -> bool {
        self.latched || !self.window.is_empty()
    }

    /// True after a trigger until the face leaves.
    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Fraction of the window filled, in [0, 1].
    pub fn progress(&self) -> f32 {
        self.window.len() as f32 / self.config.window.max(1) as f32
    }

    /// Resume observing after the caller stopped feeding samples, e.g. while a
    /// capture was being verified. Absence is timed from the next sample.
    pub fn resume(&mut self) {
        self.resuming = true;
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.last_seen = None;
        self.latched = false;
        self.resuming = false;
    }
}
