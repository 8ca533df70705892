use crate::client::VerificationClient;
use crate::connectivity::ConnectivityHandle;
use crate::presenter::FeedbackPresenter;
use crate::remote::VerifyError;
use crate::store::{OfflineStore, StoreError};
use bioentry_core::{ConnectivityState, TerminalStatus};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub synced: usize,
    pub rejected: usize,
    /// The pass stopped on a network failure with records left.
    pub interrupted: bool,
    /// Another pass was running, or the terminal was not online.
    pub skipped: bool,
}

/// Drains the offline store while online, oldest first, one pass at a time.
pub struct SyncScheduler {
    store: Arc<OfflineStore>,
    client: VerificationClient,
    connectivity: ConnectivityHandle,
    presenter: Arc<dyn FeedbackPresenter>,
    pass_lock: Mutex<()>,
    wake: Notify,
    cancel: CancellationToken,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<OfflineStore>,
        client: VerificationClient,
        connectivity: ConnectivityHandle,
        presenter: Arc<dyn FeedbackPresenter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            connectivity,
            presenter,
            pass_lock: Mutex::new(()),
            wake: Notify::new(),
            cancel,
        }
    }

    /// Ask the run loop for a pass as soon as possible.
    pub fn request_pass(&self) {
        self.wake.notify_one();
    }

    /// Run one pass unless one is already running or the terminal is not online.
    pub async fn run_pass(&self) -> Result<PassReport, StoreError> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            tracing::debug!("sync pass already running");
            return Ok(PassReport {
                skipped: true,
                ..PassReport::default()
            });
        };
        if self.connectivity.state() != ConnectivityState::Online {
            return Ok(PassReport {
                skipped: true,
                ..PassReport::default()
            });
        }

        let records = self.store.pending()?;
        if records.is_empty() {
            return Ok(PassReport::default());
        }
        tracing::info!(pending = records.len(), "sync pass started");

        let mut report = PassReport::default();
        for record in records {
            // the submission in flight completes; nothing new starts after shutdown
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let token = record.token().clone();
            match self.client.submit(&record.event).await {
                Ok(result) => {
                    self.store.mark_synced(&token, &result)?;
                    report.synced += 1;
                }
                Err(VerifyError::Rejected(detail)) => {
                    self.store.mark_failed(&token, &detail)?;
                    report.rejected += 1;
                }
                Err(e) => {
                    let status = self.store.record_attempt(&token, &e.to_string(), Utc::now())?;
                    tracing::info!(
                        token = %token,
                        error = %e,
                        status = status.as_str(),
                        "sync pass stopped; remote unavailable"
                    );
                    report.interrupted = true;
                    break;
                }
            }
        }

        tracing::info!(
            synced = report.synced,
            rejected = report.rejected,
            interrupted = report.interrupted,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Pass on every transition to online, on the safety timer and on request.
    pub async fn run(self: Arc<Self>, safety_interval: Duration) {
        let cancel = self.cancel.clone();
        let mut connectivity = self.connectivity.subscribe();
        let mut ticker = tokio::time::interval(safety_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?safety_interval, "sync scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if connectivity.borrow_and_update().state != ConnectivityState::Online {
                        continue;
                    }
                    tracing::info!("back online; draining offline queue");
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.run_pass().await {
                tracing::error!(error = %e, "sync pass failed on store error");
                self.presenter.show(TerminalStatus::Degraded);
            }
        }
        tracing::info!("sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreSettings;
    use crate::testing::{FakeRemote, RecordingPresenter, Reply};
    use bioentry_core::{CaptureEvent, PendingRecord, RecordStatus};
    use tokio::sync::watch;

    struct Rig {
        remote: Arc<FakeRemote>,
        store: Arc<OfflineStore>,
        scheduler: Arc<SyncScheduler>,
        state: watch::Sender<bioentry_core::ConnectivitySnapshot>,
    }

    fn rig(state: ConnectivityState, reply: Reply) -> Rig {
        let remote = Arc::new(FakeRemote::new(reply));
        let store = Arc::new(
            OfflineStore::open_in_memory(StoreSettings {
                max_attempts: 3,
                ..StoreSettings::default()
            })
            .unwrap(),
        );
        let (handle, tx) = ConnectivityHandle::manual(state);
        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            VerificationClient::new(remote.clone(), Duration::from_secs(1)),
            handle,
            Arc::new(RecordingPresenter::default()),
            CancellationToken::new(),
        ));
        Rig {
            remote,
            store,
            scheduler,
            state: tx,
        }
    }

    fn enqueue(store: &OfflineStore, n: usize) -> Vec<bioentry_core::IdempotencyToken> {
        (0..n)
            .map(|i| {
                let event = CaptureEvent::new("T1", vec![i as u8], Utc::now());
                let record = PendingRecord::new(event, Utc::now());
                store.enqueue(&record).unwrap();
                record.token().clone()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_drains_in_order_once_each() {
        let rig = rig(ConnectivityState::Online, Reply::Verified("1712"));
        let tokens = enqueue(&rig.store, 3);

        let report = rig.scheduler.run_pass().await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(rig.remote.submitted_tokens(), tokens);
        assert_eq!(rig.store.stats().unwrap().synced, 3);

        let again = rig.scheduler.run_pass().await.unwrap();
        assert_eq!(again, PassReport::default());
        assert_eq!(rig.remote.verify_calls(), 3);
    }

    #[tokio::test]
    async fn test_skips_while_offline() {
        let rig = rig(ConnectivityState::Offline, Reply::Verified("1712"));
        enqueue(&rig.store, 1);
        assert!(rig.scheduler.run_pass().await.unwrap().skipped);
        assert_eq!(rig.remote.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_network_failure_stops_the_pass() {
        let rig = rig(ConnectivityState::Online, Reply::Verified("1712"));
        let tokens = enqueue(&rig.store, 3);
        rig.remote.push(Reply::Verified("1712"));
        rig.remote.push(Reply::Unreachable);

        let report = rig.scheduler.run_pass().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.interrupted);
        assert_eq!(rig.remote.submitted_tokens(), tokens[..2].to_vec());

        let pending = rig.store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].token(), &tokens[1]);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_rejected_record_is_terminal() {
        let rig = rig(ConnectivityState::Online, Reply::Verified("1712"));
        let tokens = enqueue(&rig.store, 3);
        rig.remote.push(Reply::Verified("1712"));
        rig.remote.push(Reply::Rejected("image unreadable"));

        let report = rig.scheduler.run_pass().await.unwrap();
        assert_eq!((report.synced, report.rejected), (2, 1));

        let attention = rig.store.needs_attention().unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].token, tokens[1].as_str());
        assert_eq!(attention[0].status, RecordStatus::NeedsAttention);

        rig.scheduler.run_pass().await.unwrap();
        assert_eq!(rig.remote.verify_calls(), 3, "rejected record is never resubmitted");
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let rig = rig(ConnectivityState::Online, Reply::Verified("1712"));
        let tokens = enqueue(&rig.store, 1);

        // the service records the capture but the reply is lost
        let event = rig.store.pending().unwrap().remove(0).event;
        let client = VerificationClient::new(rig.remote.clone(), Duration::from_secs(1));
        let first = client.submit(&event).await.unwrap();

        rig.scheduler.run_pass().await.unwrap();
        assert_eq!(rig.remote.submitted_tokens(), vec![tokens[0].clone(), tokens[0].clone()]);
        assert_eq!(rig.remote.records(), 1);

        assert_eq!(rig.store.stats().unwrap().synced, 1);
        assert!(first.verified);
    }

    #[tokio::test]
    async fn test_retry_ceiling_reached_through_passes() {
        let rig = rig(ConnectivityState::Online, Reply::Timeout);
        enqueue(&rig.store, 1);
        for _ in 0..3 {
            rig.scheduler.run_pass().await.unwrap();
        }
        assert_eq!(rig.store.stats().unwrap().needs_attention, 1);
        rig.scheduler.run_pass().await.unwrap();
        assert_eq!(rig.remote.verify_calls(), 3);
    }

    #[tokio::test]
    async fn test_transition_to_online_triggers_pass() {
        let rig = rig(ConnectivityState::Offline, Reply::Verified("1712"));
        enqueue(&rig.store, 3);
        let task = tokio::spawn(rig.scheduler.clone().run(Duration::from_secs(3600)));

        rig.state.send_modify(|s| s.state = ConnectivityState::Online);
        for _ in 0..100 {
            if rig.store.stats().unwrap().synced == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.store.stats().unwrap().synced, 3);
        assert_eq!(rig.remote.verify_calls(), 3);

        rig.scheduler.cancel.cancel();
        task.await.unwrap();
    }
}
