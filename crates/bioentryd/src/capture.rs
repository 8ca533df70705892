//! Capture pipeline: a sampler thread feeding the async capture loop.
//!
//! The sampler owns the blocking frame source and detector and never waits
//! on the capture loop: while a verification is in flight, samples are
//! dropped rather than queued.

use crate::dispatch::{Dispatcher, Outcome};
use crate::presenter::FeedbackPresenter;
use bioentry_core::{
    BoundingBox, CaptureEvent, Detection, FailureReason, StabilityConfig, StabilityTracker,
    TerminalStatus,
};
use bioentry_hw::{FaceDetector, Frame, FrameSource, SensorError};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Messages from the sampler thread.
pub enum SensorEvent {
    Sample { frame: Frame, faces: Vec<BoundingBox> },
    Unavailable(String),
    Recovered,
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive detector failures treated as a lost sensor.
    pub max_detector_failures: u32,
}

/// Exponential backoff with up to 50% random jitter.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        (base + Duration::from_millis(jitter_ms)).min(self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sleep in short slices so cancellation is noticed promptly.
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) {
    let slice = Duration::from_millis(50);
    let mut left = total;
    while !left.is_zero() && !cancel.is_cancelled() {
        let step = left.min(slice);
        std::thread::sleep(step);
        left -= step;
    }
}

struct Sampler {
    source: Box<dyn FrameSource>,
    detector: Box<dyn FaceDetector>,
    settings: SamplerSettings,
    tx: mpsc::Sender<SensorEvent>,
    cancel: CancellationToken,
    backoff: Backoff,
}

/// Spawn the sampler on a dedicated OS thread.
pub fn spawn_sampler(
    source: Box<dyn FrameSource>,
    detector: Box<dyn FaceDetector>,
    settings: SamplerSettings,
    tx: mpsc::Sender<SensorEvent>,
    cancel: CancellationToken,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
    let sampler = Sampler {
        source,
        detector,
        settings,
        tx,
        cancel,
        backoff,
    };
    std::thread::Builder::new()
        .name("bioentry-sampler".into())
        .spawn(move || sampler.run())
}

impl Sampler {
    fn run(mut self) {
        tracing::info!(interval = ?self.source.frame_interval(), "sampler thread started");
        let mut detector_failures = 0u32;

        while !self.cancel.is_cancelled() {
            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(SensorError::BadFrame(e)) => {
                    tracing::debug!(error = %e, "bad frame skipped");
                    continue;
                }
                Err(SensorError::Unavailable(e)) => {
                    if !self.recover(e) {
                        break;
                    }
                    continue;
                }
            };

            let faces = if frame.is_dark {
                tracing::trace!(seq = frame.sequence, "dark frame; no detection");
                Vec::new()
            } else {
                match self.detector.detect(&frame) {
                    Ok(faces) => {
                        detector_failures = 0;
                        faces
                    }
                    Err(e) => {
                        detector_failures += 1;
                        tracing::debug!(error = %e, failures = detector_failures, "detection failed");
                        if detector_failures >= self.settings.max_detector_failures {
                            detector_failures = 0;
                            if !self.recover(format!("detector failing: {e}")) {
                                break;
                            }
                        }
                        continue;
                    }
                }
            };

            match self.tx.try_send(SensorEvent::Sample { frame, faces }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("capture loop busy; sample dropped");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        tracing::info!("sampler thread exiting");
    }

    /// Report the sensor lost and reacquire it. Returns false if shutting down first.
    fn recover(&mut self, reason: String) -> bool {
        tracing::warn!(reason = %reason, "sensor unavailable");
        if self.tx.blocking_send(SensorEvent::Unavailable(reason)).is_err() {
            return false;
        }

        loop {
            let delay = self.backoff.next_delay();
            tracing::debug!(delay = ?delay, "reacquiring sensor");
            sleep_unless_cancelled(delay, &self.cancel);
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.source.reacquire() {
                Ok(()) => {
                    self.backoff.reset();
                    tracing::info!("sensor reacquired");
                    return self.tx.blocking_send(SensorEvent::Recovered).is_ok();
                }
                Err(e) => tracing::warn!(error = %e, "sensor reacquire failed"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Idle,
    Detecting,
    /// Captured for the current presence; the result stays on screen.
    Captured,
}

/// Turns samples into at most one capture per presence and hands it to the dispatcher.
pub struct CaptureLoop {
    tracker: StabilityTracker,
    dispatcher: Dispatcher,
    presenter: Arc<dyn FeedbackPresenter>,
    terminal_id: String,
    jpeg_quality: u8,
    presence: Presence,
    sensor_down: bool,
}

impl CaptureLoop {
    pub fn new(
        stability: StabilityConfig,
        dispatcher: Dispatcher,
        presenter: Arc<dyn FeedbackPresenter>,
        terminal_id: String,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            tracker: StabilityTracker::new(stability),
            dispatcher,
            presenter,
            terminal_id,
            jpeg_quality,
            presence: Presence::Idle,
            sensor_down: false,
        }
    }

    /// Runs until cancelled or the sampler goes away. A dispatch in flight is awaited.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SensorEvent>, cancel: CancellationToken) {
        tracing::info!(window = self.tracker.config().window, "capture loop started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SensorEvent::Unavailable(_) => {
                    self.tracker.reset();
                    self.presence = Presence::Idle;
                    self.sensor_down = true;
                    self.presenter
                        .show(TerminalStatus::Failure(FailureReason::SensorUnavailable));
                }
                SensorEvent::Recovered => {
                    self.sensor_down = false;
                    self.presenter.show(TerminalStatus::Idle);
                }
                SensorEvent::Sample { frame, faces } => {
                    self.on_sample(frame, faces).await;
                }
            }
        }
        tracing::info!("capture loop stopped");
    }

    async fn on_sample(&mut self, frame: Frame, faces: Vec<BoundingBox>) -> Option<Outcome> {
        if self.sensor_down {
            self.sensor_down = false;
            self.presenter.show(TerminalStatus::Idle);
        }

        let detection = Detection::from_faces(frame.sequence, frame.timestamp, &faces);
        if let Some(trigger) = self.tracker.observe(&detection, frame.timestamp) {
            tracing::info!(seq = trigger.sequence, dwell = ?trigger.dwell, "face stable; capturing");
            self.presence = Presence::Captured;
            let outcome = self.capture(&frame).await;
            // samples were dropped while dispatching; that is not the face leaving
            self.tracker.resume();
            return Some(outcome);
        }

        let presence = if self.tracker.is_latched() {
            Presence::Captured
        } else if self.tracker.is_tracking() {
            Presence::Detecting
        } else {
            Presence::Idle
        };
        if presence != self.presence {
            match presence {
                Presence::Detecting => self.presenter.show(TerminalStatus::Detecting),
                Presence::Idle => self.presenter.show(TerminalStatus::Idle),
                Presence::Captured => {}
            }
            self.presence = presence;
        }
        None
    }

    async fn capture(&self, frame: &Frame) -> Outcome {
        self.presenter.show(TerminalStatus::Capturing);
        let jpeg = match frame.encode_jpeg(self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::error!(seq = frame.sequence, error = %e, "capture encoding failed");
                self.presenter
                    .show(TerminalStatus::Failure(FailureReason::CaptureFailed));
                return Outcome::Failed(FailureReason::CaptureFailed);
            }
        };

        let event = CaptureEvent::new(self.terminal_id.clone(), jpeg, Utc::now());
        tracing::debug!(token = %event.token(), bytes = event.image().len(), "capture created");
        self.dispatcher.dispatch(event).await
    }
}
