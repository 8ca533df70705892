//! Test doubles shared by the daemon's unit tests.

use crate::presenter::FeedbackPresenter;
use crate::remote::{RemoteService, VerifyError};
use bioentry_core::{
    BoundingBox, CaptureEvent, FallbackCandidate, FallbackError, FallbackIdentityStore,
    IdempotencyToken, ResultSource, TerminalStatus, VerificationResult,
};
use bioentry_hw::{DetectorError, FaceDetector, Frame, FrameSource, SensorError};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Verified(&'static str),
    NotRecognized,
    Unreachable,
    Timeout,
    Rejected(&'static str),
}

#[derive(Default)]
struct RemoteLog {
    calls: Vec<IdempotencyToken>,
    answered: HashMap<IdempotencyToken, VerificationResult>,
}

/// Scripted remote service that behaves idempotently per token, like the real one.
pub struct FakeRemote {
    default: Reply,
    script: Mutex<VecDeque<Reply>>,
    log: Mutex<RemoteLog>,
    reachable: AtomicBool,
    probes: AtomicUsize,
    delay: Duration,
}

impl FakeRemote {
    pub fn new(default: Reply) -> Self {
        Self {
            default,
            script: Mutex::new(VecDeque::new()),
            log: Mutex::new(RemoteLog::default()),
            reachable: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a one-off reply, used before the default.
    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn verify_calls(&self) -> usize {
        self.log.lock().unwrap().calls.len()
    }

    pub fn probe_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn submitted_tokens(&self) -> Vec<IdempotencyToken> {
        self.log.lock().unwrap().calls.clone()
    }

    /// Distinct records the service has created.
    pub fn records(&self) -> usize {
        self.log.lock().unwrap().answered.len()
    }
}

pub fn remote_result(verified: bool, subject: Option<&str>) -> VerificationResult {
    VerificationResult {
        record_id: Some(format!("rec-{}", subject.unwrap_or("none"))),
        verified,
        subject_id: subject.map(String::from),
        score: 0.25,
        event_type: None,
        timestamp: Utc::now(),
        message: if verified { "Welcome" } else { "Not recognized" }.to_string(),
        source: ResultSource::Remote,
    }
}

impl RemoteService for FakeRemote {
    fn verify(&self, event: &CaptureEvent) -> Result<VerificationResult, VerifyError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut log = self.log.lock().unwrap();
        log.calls.push(event.token().clone());
        if let Some(original) = log.answered.get(event.token()) {
            return Ok(original.clone());
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        let result = match reply {
            Reply::Verified(subject) => remote_result(true, Some(subject)),
            Reply::NotRecognized => remote_result(false, None),
            Reply::Unreachable => return Err(VerifyError::Unreachable("connection refused".into())),
            Reply::Timeout => return Err(VerifyError::Timeout),
            Reply::Rejected(detail) => return Err(VerifyError::Rejected(detail.into())),
        };
        log.answered.insert(event.token().clone(), result.clone());
        Ok(result)
    }

    fn probe(&self) -> Result<(), VerifyError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VerifyError::Unreachable("probe refused".into()))
        }
    }
}

/// Records every status shown.
#[derive(Default)]
pub struct RecordingPresenter {
    shown: Mutex<Vec<TerminalStatus>>,
}

impl RecordingPresenter {
    pub fn shown(&self) -> Vec<TerminalStatus> {
        self.shown.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.shown().iter().map(TerminalStatus::name).collect()
    }

    pub fn last(&self) -> Option<TerminalStatus> {
        self.shown().last().cloned()
    }
}

impl FeedbackPresenter for RecordingPresenter {
    fn show(&self, status: TerminalStatus) {
        self.shown.lock().unwrap().push(status);
    }
}

pub enum FixedFallback {
    Candidate(Option<FallbackCandidate>),
    Unavailable,
}

impl FixedFallback {
    pub fn subject(id: &str, score: f32) -> Self {
        FixedFallback::Candidate(Some(FallbackCandidate {
            subject_id: id.to_string(),
            score,
        }))
    }

    pub fn unavailable() -> Self {
        FixedFallback::Unavailable
    }
}

impl FallbackIdentityStore for FixedFallback {
    fn match_sample(&self, _sample: &[u8]) -> Result<Option<FallbackCandidate>, FallbackError> {
        match self {
            FixedFallback::Candidate(c) => Ok(c.clone()),
            FixedFallback::Unavailable => Err(FallbackError::Unavailable("reader offline".into())),
        }
    }
}

/// Mid-gray frames, optionally failing as a lost sensor for the first `outages` calls.
pub struct ScriptedSource {
    sequence: u64,
    outages: usize,
    pub reacquired: Arc<Mutex<usize>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::with_outages(0)
    }

    pub fn with_outages(outages: usize) -> Self {
        Self {
            sequence: 0,
            outages,
            reacquired: Arc::new(Mutex::new(0)),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, SensorError> {
        std::thread::sleep(Duration::from_millis(1));
        if self.outages > 0 {
            self.outages -= 1;
            return Err(SensorError::Unavailable("usb disconnect".into()));
        }
        let frame = Frame::new(vec![128u8; 16 * 12], 16, 12, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn reacquire(&mut self) -> Result<(), SensorError> {
        *self.reacquired.lock().unwrap() += 1;
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(1)
    }
}

/// Detector that always reports one steady face.
pub struct SteadyFace;

pub fn face() -> BoundingBox {
    BoundingBox {
        x: 4.0,
        y: 2.0,
        width: 8.0,
        height: 8.0,
        confidence: 0.95,
    }
}

impl FaceDetector for SteadyFace {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(vec![face()])
    }
}

/// Detector that always fails.
pub struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        Err(DetectorError::InferenceFailed("model crashed".into()))
    }
}
