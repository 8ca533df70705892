use crate::remote::{RemoteService, VerifyError};
use bioentry_core::{CaptureEvent, VerificationResult};
use std::sync::Arc;
use std::time::Duration;

/// Submits captures to the remote service with a hard deadline.
///
/// Never retries: network failures are returned so the caller can route
/// the capture to the offline store.
#[derive(Clone)]
pub struct VerificationClient {
    remote: Arc<dyn RemoteService>,
    timeout: Duration,
}

impl VerificationClient {
    pub fn new(remote: Arc<dyn RemoteService>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub async fn submit(&self, event: &CaptureEvent) -> Result<VerificationResult, VerifyError> {
        let remote = Arc::clone(&self.remote);
        let owned = event.clone();
        let call = tokio::task::spawn_blocking(move || remote.verify(&owned));

        // The blocking call keeps running after a deadline miss; its result is discarded.
        let result = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(VerifyError::Timeout),
            Ok(Err(join)) => Err(VerifyError::Unreachable(format!("verify task failed: {join}"))),
            Ok(Ok(result)) => result,
        };

        match &result {
            Ok(r) => tracing::info!(
                token = %event.token(),
                verified = r.verified,
                subject = r.subject_id.as_deref().unwrap_or("-"),
                "verification answered"
            ),
            Err(e) => tracing::warn!(token = %event.token(), error = %e, "verification failed"),
        }
        result
    }
}
