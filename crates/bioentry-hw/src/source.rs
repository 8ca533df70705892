//! Seams for the camera and the face detector.
//!
//! Sensor drivers and detection models live outside this workspace; the
//! capture loop only sees these traits.

use crate::frame::Frame;
use bioentry_core::BoundingBox;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SensorError {
    /// The sensor is gone; the capture loop backs off and reacquires.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
    /// One unusable frame; skipped.
    #[error("bad frame: {0}")]
    BadFrame(String),
}

/// Produces frames at a fixed target rate.
pub trait FrameSource: Send {
    /// Block up to one frame interval for the next frame.
    fn next_frame(&mut self) -> Result<Frame, SensorError>;

    /// Try to reopen the sensor after [`SensorError::Unavailable`].
    fn reacquire(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn frame_interval(&self) -> Duration;
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector unavailable: {0}")]
    Unavailable(String),
}

/// Frame → face boxes. Implementations must not retain the frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Sleeps so that successive calls to [`FramePacer::wait`] are one interval apart.
pub struct FramePacer {
    interval: Duration,
    next: Option<Instant>,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / fps.max(1),
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn wait(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.next {
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }
        // Re-anchor after a stall instead of bursting to catch up.
        let base = self.next.map(|d| d.max(now)).unwrap_or(now);
        self.next = Some(base + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_interval() {
        assert_eq!(FramePacer::new(10).interval(), Duration::from_millis(100));
        assert_eq!(FramePacer::new(0).interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_pacer_spaces_calls() {
        let mut pacer = FramePacer::new(50);
        let start = Instant::now();
        for _ in 0..4 {
            pacer.wait();
        }
        // first call returns immediately, the next three wait 20ms each
        assert!(start.elapsed() >= Duration::from_millis(55));
    }
}
