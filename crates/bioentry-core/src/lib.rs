//! bioentry-core: Capture and verification domain for the BioEntry terminal.
//!
//! Pure logic only: stability debouncing of face detections, the
//! connectivity hysteresis machine and the records exchanged between the
//! capture path, the offline store and the remote service.

pub mod connectivity;
pub mod fallback;
pub mod stability;
pub mod types;

pub use connectivity::{ConnectivitySnapshot, ConnectivityState, Hysteresis, Transition};
pub use fallback::{FallbackCandidate, FallbackError, FallbackIdentityStore};
pub use stability::{StabilityConfig, StabilityTracker, Trigger};
pub use types::{
    BoundingBox, CaptureEvent, Detection, EventType, FailureReason, IdempotencyToken,
    PendingRecord, RecordStatus, ResultSource, TerminalStatus, VerificationResult,
};
