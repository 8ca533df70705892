//! Durable queue of captures awaiting delivery, plus the local fallback lookup.
//!
//! SQLite in WAL mode with `synchronous=FULL`: `enqueue` returns only after
//! the row is on disk. The connection mutex is the single writer lock and is
//! held for one statement at a time, never across a network call.

mod migrations;

use crate::seal::{PayloadSealer, SealError};
use bioentry_core::fallback::{self, FallbackError};
use bioentry_core::{
    CaptureEvent, FallbackIdentityStore, IdempotencyToken, PendingRecord, RecordStatus,
    VerificationResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store corrupted: {0}")]
    Corruption(String),
    #[error("payload sealing: {0}")]
    Seal(SealError),
    #[error("schema: {0}")]
    Schema(String),
}

impl From<SealError> for StoreError {
    fn from(e: SealError) -> Self {
        match e {
            SealError::Decrypt | SealError::DigestMismatch | SealError::Truncated(_) => {
                StoreError::Corruption(e.to_string())
            }
            other => StoreError::Seal(other),
        }
    }
}

/// Store behaviour that does not come from the database file itself.
pub struct StoreSettings {
    /// Failed deliveries before a record needs attention.
    pub max_attempts: u32,
    pub sealer: PayloadSealer,
    /// Minimum fallback score accepted as a provisional match.
    pub acceptance_threshold: f32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            sealer: PayloadSealer::plain(),
            acceptance_threshold: 0.8,
        }
    }
}

/// Listing row for operators. Carries no image.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub token: String,
    pub terminal_id: String,
    pub captured_at: DateTime<Utc>,
    pub status: RecordStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub credential_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: u64,
    pub synced: u64,
    pub needs_attention: u64,
}

/// How a delivered record's remote result relates to its offline match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    NoProvisional,
    Confirmed,
    /// The remote result named someone else, or no one. The remote result stands.
    Superseded { provisional: String },
}

pub struct OfflineStore {
    conn: Mutex<Connection>,
    settings: StoreSettings,
    fallback: Option<Arc<dyn FallbackIdentityStore>>,
}

impl OfflineStore {
    pub fn open(path: &Path, settings: StoreSettings) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Schema(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn, settings)?;
        tracing::info!(
            path = %path.display(),
            sealed = store.settings.sealer.is_sealing(),
            "offline store opened"
        );
        Ok(store)
    }

    pub fn open_in_memory(settings: StoreSettings) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, settings)
    }

    fn init(mut conn: Connection, settings: StoreSettings) -> Result<Self, StoreError> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        tracing::debug!(journal_mode = %mode, "store pragmas set");

        migrations::run_migrations(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            settings,
            fallback: None,
        })
    }

    /// Attach the local identity lookup used while offline. Candidates are
    /// judged against `StoreSettings::acceptance_threshold`.
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackIdentityStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Corruption("store lock poisoned".into()))
    }

    /// Persist a record. Returns `false` if its token is already stored.
    pub fn enqueue(&self, record: &PendingRecord) -> Result<bool, StoreError> {
        let event = &record.event;
        let payload = self.settings.sealer.seal(event.image())?;
        let now = Utc::now().to_rfc3339();

        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO pending_records
                (token, terminal_id, captured_at, payload, payload_digest, sealed, status,
                 attempts, last_attempt_at, last_error, credential_id, provisional_score,
                 enqueued_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event.token().as_str(),
                event.terminal_id(),
                event.captured_at().to_rfc3339(),
                payload.bytes,
                payload.digest,
                payload.sealed,
                record.status.as_str(),
                record.attempts,
                record.last_attempt_at.map(|t| t.to_rfc3339()),
                record.last_error,
                record.credential_id,
                record.provisional_score,
                record.enqueued_at.to_rfc3339(),
                now,
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(token = %event.token(), "duplicate enqueue ignored");
            return Ok(false);
        }
        tracing::info!(token = %event.token(), attempts = record.attempts, "capture queued");
        Ok(true)
    }

    /// Match a sample against the local identity set.
    ///
    /// Without a configured fallback this is an explicit "offline, cannot verify".
    pub fn local_match(&self, image: &[u8]) -> VerificationResult {
        let now = Utc::now();
        let Some(lookup) = &self.fallback else {
            return VerificationResult::offline_unverified(now);
        };

        match lookup.match_sample(image) {
            Ok(candidate) => fallback::interpret(candidate, self.settings.acceptance_threshold, now),
            Err(FallbackError::BadSample(e)) => {
                tracing::debug!(error = %e, "fallback could not read sample");
                fallback::interpret(None, self.settings.acceptance_threshold, now)
            }
            Err(e @ FallbackError::Unavailable(_)) => {
                tracing::warn!(error = %e, "fallback identity store unavailable");
                VerificationResult::offline_unverified(now)
            }
        }
    }

    /// Records awaiting delivery, oldest first, with their images.
    pub fn pending(&self) -> Result<Vec<PendingRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT token, terminal_id, captured_at, payload, payload_digest, sealed, status,
                    attempts, last_attempt_at, last_error, credential_id, provisional_score,
                    enqueued_at
             FROM pending_records WHERE status = 'pending' ORDER BY seq",
        )?;
        let raw = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        raw.into_iter().map(|r| r.into_record(&self.settings.sealer)).collect()
    }

    pub fn needs_attention(&self) -> Result<Vec<RecordSummary>, StoreError> {
        self.list(RecordStatus::NeedsAttention)
    }

    /// Summaries of records in `status`, oldest first.
    pub fn list(&self, status: RecordStatus) -> Result<Vec<RecordSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT token, terminal_id, captured_at, status, attempts, last_attempt_at,
                    last_error, credential_id, enqueued_at
             FROM pending_records WHERE status = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([status.as_str()], RawSummary::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawSummary::into_summary).collect()
    }

    /// Record the authoritative result for a delivered capture.
    pub fn mark_synced(
        &self,
        token: &IdempotencyToken,
        result: &VerificationResult,
    ) -> Result<Reconciliation, StoreError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| StoreError::Corruption(format!("unserializable result: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn()?;
        let provisional: Option<String> = conn
            .query_row(
                "SELECT credential_id FROM pending_records WHERE token = ?1",
                [token.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();

        let updated = conn.execute(
            "UPDATE pending_records
             SET status = 'synced', remote_result = ?1, synced_at = ?2, updated_at = ?2
             WHERE token = ?3",
            params![result_json, now, token.as_str()],
        )?;
        drop(conn);

        if updated == 0 {
            tracing::warn!(token = %token, "mark_synced for unknown token");
            return Ok(Reconciliation::NoProvisional);
        }

        let reconciliation = match provisional {
            None => Reconciliation::NoProvisional,
            Some(p) if result.verified && result.subject_id.as_deref() == Some(p.as_str()) => {
                Reconciliation::Confirmed
            }
            Some(p) => {
                tracing::warn!(
                    token = %token,
                    provisional = %p,
                    remote = result.subject_id.as_deref().unwrap_or("-"),
                    remote_verified = result.verified,
                    "offline match superseded by remote result"
                );
                Reconciliation::Superseded { provisional: p }
            }
        };
        tracing::info!(token = %token, verified = result.verified, "record synced");
        Ok(reconciliation)
    }

    /// Permanently fail a record. It stays for inspection and is never retried automatically.
    pub fn mark_failed(&self, token: &IdempotencyToken, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "UPDATE pending_records
             SET status = 'needs_attention', last_error = ?1, last_attempt_at = ?2, updated_at = ?2
             WHERE token = ?3",
            params![reason, now, token.as_str()],
        )?;
        tracing::warn!(token = %token, reason, "record needs attention");
        Ok(())
    }

    /// Count a failed delivery. Past the retry ceiling the record needs attention.
    pub fn record_attempt(
        &self,
        token: &IdempotencyToken,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<RecordStatus, StoreError> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "UPDATE pending_records
                 SET attempts = attempts + 1,
                     last_attempt_at = ?1,
                     last_error = ?2,
                     updated_at = ?1,
                     status = CASE WHEN attempts + 1 >= ?3 THEN 'needs_attention' ELSE status END
                 WHERE token = ?4 AND status = 'pending'
                 RETURNING status",
                params![at.to_rfc3339(), error, self.settings.max_attempts, token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        let status = match status {
            Some(s) => parse_status(&s)?,
            None => return Err(StoreError::Corruption(format!("no pending record {token}"))),
        };
        if status == RecordStatus::NeedsAttention {
            tracing::warn!(token = %token, max_attempts = self.settings.max_attempts, "retry ceiling reached");
        }
        Ok(status)
    }

    /// Return a needs-attention record to the queue with a fresh attempt budget.
    pub fn requeue(&self, token: &IdempotencyToken) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn()?.execute(
            "UPDATE pending_records
             SET status = 'pending', attempts = 0, last_error = NULL, updated_at = ?1
             WHERE token = ?2 AND status = 'needs_attention'",
            params![now, token.as_str()],
        )?;
        if updated > 0 {
            tracing::info!(token = %token, "record requeued by operator");
        }
        Ok(updated > 0)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM pending_records GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = StoreStats::default();
        for (status, count) in rows {
            match parse_status(&status)? {
                RecordStatus::Pending => stats.pending = count,
                RecordStatus::Synced => stats.synced = count,
                RecordStatus::NeedsAttention => stats.needs_attention = count,
            }
        }
        Ok(stats)
    }
}

/// A row read under the lock; decoded after it is released.
struct RawRecord {
    token: String,
    terminal_id: String,
    captured_at: String,
    payload: Vec<u8>,
    payload_digest: String,
    sealed: bool,
    status: String,
    attempts: u32,
    last_attempt_at: Option<String>,
    last_error: Option<String>,
    credential_id: Option<String>,
    provisional_score: Option<f32>,
    enqueued_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get("token")?,
            terminal_id: row.get("terminal_id")?,
            captured_at: row.get("captured_at")?,
            payload: row.get("payload")?,
            payload_digest: row.get("payload_digest")?,
            sealed: row.get("sealed")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            last_attempt_at: row.get("last_attempt_at")?,
            last_error: row.get("last_error")?,
            credential_id: row.get("credential_id")?,
            provisional_score: row.get("provisional_score")?,
            enqueued_at: row.get("enqueued_at")?,
        })
    }

    fn into_record(self, sealer: &PayloadSealer) -> Result<PendingRecord, StoreError> {
        let image = sealer
            .open(&self.payload, self.sealed, &self.payload_digest)
            .map_err(|e| {
                tracing::error!(token = %self.token, error = %e, "queued payload unreadable");
                StoreError::from(e)
            })?;
        let event = CaptureEvent::restore(
            IdempotencyToken::from(self.token),
            self.terminal_id,
            parse_datetime(&self.captured_at, "captured_at")?,
            image,
        );
        Ok(PendingRecord {
            event,
            status: parse_status(&self.status)?,
            attempts: self.attempts,
            last_attempt_at: parse_optional_datetime(self.last_attempt_at, "last_attempt_at")?,
            last_error: self.last_error,
            credential_id: self.credential_id,
            provisional_score: self.provisional_score,
            enqueued_at: parse_datetime(&self.enqueued_at, "enqueued_at")?,
        })
    }
}

struct RawSummary {
    token: String,
    terminal_id: String,
    captured_at: String,
    status: String,
    attempts: u32,
    last_attempt_at: Option<String>,
    last_error: Option<String>,
    credential_id: Option<String>,
    enqueued_at: String,
}

impl RawSummary {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get("token")?,
            terminal_id: row.get("terminal_id")?,
            captured_at: row.get("captured_at")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            last_attempt_at: row.get("last_attempt_at")?,
            last_error: row.get("last_error")?,
            credential_id: row.get("credential_id")?,
            enqueued_at: row.get("enqueued_at")?,
        })
    }

    fn into_summary(self) -> Result<RecordSummary, StoreError> {
        Ok(RecordSummary {
            captured_at: parse_datetime(&self.captured_at, "captured_at")?,
            status: parse_status(&self.status)?,
            last_attempt_at: parse_optional_datetime(self.last_attempt_at, "last_attempt_at")?,
            enqueued_at: parse_datetime(&self.enqueued_at, "enqueued_at")?,
            token: self.token,
            terminal_id: self.terminal_id,
            attempts: self.attempts,
            last_error: self.last_error,
            credential_id: self.credential_id,
        })
    }
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corruption(format!("invalid {field} '{value}': {e}")))
}

fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| parse_datetime(&v, field)).transpose()
}

fn parse_status(value: &str) -> Result<RecordStatus, StoreError> {
    value.parse().map_err(StoreError::Corruption)
}
