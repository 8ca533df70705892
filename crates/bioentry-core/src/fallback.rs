//! Local fallback identification used while the remote service is unreachable.

use crate::types::{ResultSource, VerificationResult};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("fallback store unavailable: {0}")]
    Unavailable(String),
    #[error("sample could not be read: {0}")]
    BadSample(String),
}

/// Best candidate returned by a fallback identity store.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackCandidate {
    pub subject_id: String,
    /// Similarity score, higher is better.
    pub score: f32,
}

/// Read-only lookup against a locally cached identity set.
///
/// Implementations may use a secondary modality and ignore the image.
pub trait FallbackIdentityStore: Send + Sync {
    fn match_sample(&self, sample: &[u8]) -> Result<Option<FallbackCandidate>, FallbackError>;
}

/// Interpret a candidate against the acceptance threshold.
pub fn interpret(
    candidate: Option<FallbackCandidate>,
    threshold: f32,
    now: DateTime<Utc>,
) -> VerificationResult {
    match candidate {
        Some(c) if c.score >= threshold => VerificationResult {
            record_id: None,
            verified: true,
            message: "verified offline".to_string(),
            subject_id: Some(c.subject_id),
            score: c.score,
            event_type: None,
            timestamp: now,
            source: ResultSource::LocalFallback,
        },
        Some(c) => VerificationResult {
            record_id: None,
            verified: false,
            subject_id: None,
            score: c.score,
            event_type: None,
            timestamp: now,
            message: "not recognized offline".to_string(),
            source: ResultSource::LocalFallback,
        },
        None => VerificationResult {
            message: "not recognized offline".to_string(),
            ..VerificationResult::offline_unverified(now)
        },
    }
}
