use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Center point of the box.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Euclidean distance between the centers of two boxes.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// Per-frame detector output reduced to the single face the terminal tracks.
#[derive(Debug, Clone)]
pub struct Detection {
    pub sequence: u64,
    pub timestamp: Instant,
    /// Largest face in the frame, if any.
    pub face: Option<BoundingBox>,
    /// Number of faces the detector reported before reduction.
    pub face_count: usize,
}

impl Detection {
    /// Reduce a detector's raw output to the largest face.
    pub fn from_faces(sequence: u64, timestamp: Instant, faces: &[BoundingBox]) -> Self {
        let face = faces
            .iter()
            .copied()
            .max_by(|a, b| {
                a.area()
                    .partial_cmp(&b.area())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        Self {
            sequence,
            timestamp,
            face,
            face_count: faces.len(),
        }
    }

    /// A frame in which nothing was detected.
    pub fn empty(sequence: u64, timestamp: Instant) -> Self {
        Self {
            sequence,
            timestamp,
            face: None,
            face_count: 0,
        }
    }

    pub fn confidence(&self) -> f32 {
        self.face.map(|f| f.confidence).unwrap_or(0.0)
    }

    /// More than one face was in view; only the largest is tracked.
    pub fn is_ambiguous(&self) -> bool {
        self.face_count > 1
    }
}

/// Client-generated token that lets the remote service recognise a resubmission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdempotencyToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image selected for verification. Immutable once created.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    token: IdempotencyToken,
    terminal_id: String,
    captured_at: DateTime<Utc>,
    image: Arc<[u8]>,
}

impl CaptureEvent {
    /// Create a new capture with a fresh idempotency token.
    pub fn new(terminal_id: impl Into<String>, image: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self {
            token: IdempotencyToken::generate(),
            terminal_id: terminal_id.into(),
            captured_at,
            image: image.into(),
        }
    }

    /// Rebuild a capture that was persisted earlier, keeping its original token.
    pub fn restore(
        token: IdempotencyToken,
        terminal_id: impl Into<String>,
        captured_at: DateTime<Utc>,
        image: Vec<u8>,
    ) -> Self {
        Self {
            token,
            terminal_id: terminal_id.into(),
            captured_at,
            image: image.into(),
        }
    }

    pub fn token(&self) -> &IdempotencyToken {
        &self.token
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Shared handle to the image bytes, for handing to a worker thread.
    pub fn image_shared(&self) -> Arc<[u8]> {
        Arc::clone(&self.image)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Entry,
    Exit,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Entry => f.write_str("entry"),
            EventType::Exit => f.write_str("exit"),
        }
    }
}

/// Where a verification result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    #[default]
    Remote,
    /// Provisional result from the local fallback store; superseded on sync.
    LocalFallback,
}

/// Outcome of a verification, from the remote service or local fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    #[serde(default)]
    pub record_id: Option<String>,
    pub verified: bool,
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Distance or confidence score as reported by the matcher.
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub event_type: Option<EventType>,
    /// Time of receipt when the service does not report one.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Operator-facing text; the service may send it as `mensaje`.
    #[serde(default, alias = "mensaje")]
    pub message: String,
    #[serde(default)]
    pub source: ResultSource,
}

impl VerificationResult {
    /// Explicit "offline, cannot verify" result used when no fallback is available.
    pub fn offline_unverified(now: DateTime<Utc>) -> Self {
        Self {
            record_id: None,
            verified: false,
            subject_id: None,
            score: 0.0,
            event_type: None,
            timestamp: now,
            message: "offline, cannot verify".to_string(),
            source: ResultSource::LocalFallback,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.source == ResultSource::LocalFallback
    }
}

/// Lifecycle of a record in the offline store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Synced,
    /// Terminal: excluded from automatic sync, kept for operator inspection.
    NeedsAttention,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Synced => "synced",
            RecordStatus::NeedsAttention => "needs_attention",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "synced" => Ok(RecordStatus::Synced),
            "needs_attention" => Ok(RecordStatus::NeedsAttention),
            other => Err(format!("unknown record status '{other}'")),
        }
    }
}

/// A capture waiting in the offline store for delivery to the remote service.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub event: CaptureEvent,
    pub status: RecordStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Subject matched by the local fallback store, if any.
    pub credential_id: Option<String>,
    pub provisional_score: Option<f32>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingRecord {
    pub fn new(event: CaptureEvent, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            event,
            status: RecordStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            credential_id: None,
            provisional_score: None,
            enqueued_at,
        }
    }

    /// Account for a delivery attempt that already failed on the capture path.
    pub fn with_failed_attempt(mut self, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.attempts += 1;
        self.last_attempt_at = Some(at);
        self.last_error = Some(error.into());
        self
    }

    /// Attach a provisional local fallback match.
    pub fn with_provisional(mut self, result: &VerificationResult) -> Self {
        if result.verified {
            self.credential_id = result.subject_id.clone();
            self.provisional_score = Some(result.score);
        }
        self
    }

    pub fn token(&self) -> &IdempotencyToken {
        self.event.token()
    }
}

/// Why a capture ended without a successful verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The service answered but did not verify the person.
    NotRecognized { message: String },
    /// The service refused the request outright.
    Rejected { detail: String },
    CaptureFailed,
    SensorUnavailable,
    StoreUnavailable,
}

/// Discrete status emitted to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TerminalStatus {
    Idle,
    Detecting,
    Capturing,
    Verifying,
    Success(VerificationResult),
    Failure(FailureReason),
    Offline,
    /// Offline store unusable; only live verification is attempted.
    Degraded,
}

impl TerminalStatus {
    /// Short name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TerminalStatus::Idle => "idle",
            TerminalStatus::Detecting => "detecting",
            TerminalStatus::Capturing => "capturing",
            TerminalStatus::Verifying => "verifying",
            TerminalStatus::Success(_) => "success",
            TerminalStatus::Failure(_) => "failure",
            TerminalStatus::Offline => "offline",
            TerminalStatus::Degraded => "degraded",
        }
    }
}
