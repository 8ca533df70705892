use crate::store::StoreError;
use crate::terminal::TerminalHandle;
use bioentry_core::{IdempotencyToken, RecordStatus, TerminalStatus};
use tokio_util::sync::CancellationToken;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface, Connection};

pub const BUS_NAME: &str = "org.bioentry.Terminal1";
pub const OBJECT_PATH: &str = "/org/bioentry/Terminal1";

/// Operator interface of the BioEntry terminal daemon.
///
/// Bus name: org.bioentry.Terminal1
/// Object path: /org/bioentry/Terminal1
pub struct TerminalService {
    terminal: TerminalHandle,
}

impl TerminalService {
    pub fn new(terminal: TerminalHandle) -> Self {
        Self { terminal }
    }
}

fn store_failure(e: StoreError) -> fdo::Error {
    tracing::error!(error = %e, "store request failed");
    fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.bioentry.Terminal1")]
impl TerminalService {
    /// Terminal status report as JSON.
    async fn status(&self) -> fdo::Result<String> {
        to_json(&self.terminal.report())
    }

    /// Records still waiting for delivery, oldest first.
    async fn list_pending(&self) -> fdo::Result<String> {
        let records = self
            .terminal
            .store
            .list(RecordStatus::Pending)
            .map_err(store_failure)?;
        to_json(&records)
    }

    /// Records parked after rejection or too many attempts.
    async fn list_attention(&self) -> fdo::Result<String> {
        let records = self.terminal.store.needs_attention().map_err(store_failure)?;
        to_json(&records)
    }

    /// Put a parked record back in the queue and wake the sync loop.
    async fn requeue(&self, token: &str) -> fdo::Result<bool> {
        tracing::info!(token, "requeue requested");
        let requeued = self
            .terminal
            .store
            .requeue(&IdempotencyToken::from(token))
            .map_err(store_failure)?;
        if requeued {
            self.terminal.sync.request_pass();
        }
        Ok(requeued)
    }

    /// Run a sync pass now and return its report as JSON.
    async fn sync_now(&self) -> fdo::Result<String> {
        tracing::info!("sync requested");
        let report = self.terminal.sync.run_pass().await.map_err(store_failure)?;
        to_json(&report)
    }

    /// Probe the remote service now; returns the resulting state name.
    async fn probe_now(&self) -> fdo::Result<String> {
        let snapshot = self.terminal.connectivity.probe_now().await;
        Ok(snapshot.state.to_string())
    }

    /// Emitted on every change of the displayed status, as JSON.
    #[zbus(signal)]
    async fn status_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;
}

/// Forward status board changes as `StatusChanged` signals until cancelled.
pub async fn forward_status(
    conn: Connection,
    terminal: TerminalHandle,
    cancel: CancellationToken,
) -> zbus::Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, TerminalService>(OBJECT_PATH)
        .await?;
    let mut rx = terminal.board.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let status: TerminalStatus = rx.borrow_and_update().clone();
        let payload = match serde_json::to_string(&status) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "status not serializable");
                continue;
            }
        };
        if let Err(e) = TerminalService::status_changed(iface.signal_emitter(), &payload).await {
            tracing::warn!(error = %e, status = status.name(), "failed to emit status signal");
        }
    }
    Ok(())
}
