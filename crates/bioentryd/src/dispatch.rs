//! Routes a capture to the remote service or the offline store.
//!
//! Every capture ends in exactly one of: a remote result, a durable queued
//! record, or a failure shown to the user.

use crate::client::VerificationClient;
use crate::connectivity::ConnectivityHandle;
use crate::presenter::FeedbackPresenter;
use crate::remote::VerifyError;
use crate::store::OfflineStore;
use bioentry_core::{
    CaptureEvent, FailureReason, PendingRecord, TerminalStatus, VerificationResult,
};
use chrono::Utc;
use std::sync::Arc;

/// Terminal outcome of one capture.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The service answered, verified or not.
    Remote(VerificationResult),
    Rejected(String),
    /// Persisted for later delivery; carries the provisional local result.
    Queued(VerificationResult),
    Failed(FailureReason),
}

#[derive(Clone)]
pub struct Dispatcher {
    client: VerificationClient,
    connectivity: ConnectivityHandle,
    store: Arc<OfflineStore>,
    presenter: Arc<dyn FeedbackPresenter>,
}

impl Dispatcher {
    pub fn new(
        client: VerificationClient,
        connectivity: ConnectivityHandle,
        store: Arc<OfflineStore>,
        presenter: Arc<dyn FeedbackPresenter>,
    ) -> Self {
        Self {
            client,
            connectivity,
            store,
            presenter,
        }
    }

    pub async fn dispatch(&self, event: CaptureEvent) -> Outcome {
        self.presenter.show(TerminalStatus::Verifying);

        let connectivity = self.connectivity.probe_now().await;
        if !connectivity.is_online() {
            tracing::info!(token = %event.token(), state = %connectivity.state, "offline; queueing capture");
            return self.fall_back(PendingRecord::new(event, Utc::now()));
        }

        match self.client.submit(&event).await {
            Ok(result) => {
                if result.verified {
                    self.presenter.show(TerminalStatus::Success(result.clone()));
                } else {
                    self.presenter
                        .show(TerminalStatus::Failure(FailureReason::NotRecognized {
                            message: result.message.clone(),
                        }));
                }
                Outcome::Remote(result)
            }
            Err(VerifyError::Rejected(detail)) => {
                self.presenter
                    .show(TerminalStatus::Failure(FailureReason::Rejected {
                        detail: detail.clone(),
                    }));
                Outcome::Rejected(detail)
            }
            Err(e) => {
                let now = Utc::now();
                let record = PendingRecord::new(event, now).with_failed_attempt(e.to_string(), now);
                self.fall_back(record)
            }
        }
    }

    fn fall_back(&self, record: PendingRecord) -> Outcome {
        let provisional = self.store.local_match(record.event.image());
        let record = record.with_provisional(&provisional);

        match self.store.enqueue(&record) {
            Ok(_) => {
                if provisional.verified {
                    self.presenter.show(TerminalStatus::Success(provisional.clone()));
                } else {
                    self.presenter.show(TerminalStatus::Offline);
                }
                Outcome::Queued(provisional)
            }
            Err(e) => {
                tracing::error!(token = %record.token(), error = %e, "capture could not be queued");
                self.presenter
                    .show(TerminalStatus::Failure(FailureReason::StoreUnavailable));
                Outcome::Failed(FailureReason::StoreUnavailable)
            }
        }
    }
}
