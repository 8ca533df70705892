//! Wires the terminal's four activities together and owns their lifetimes.

use crate::capture::{spawn_sampler, CaptureLoop, SamplerSettings};
use crate::client::VerificationClient;
use crate::config::Config;
use crate::connectivity::{spawn_monitor, ConnectivityHandle, MonitorSettings};
use crate::dispatch::Dispatcher;
use crate::presenter::{FeedbackPresenter, StatusBoard};
use crate::remote::RemoteService;
use crate::store::{OfflineStore, StoreStats};
use crate::sync::SyncScheduler;
use bioentry_core::{ConnectivitySnapshot, ConnectivityState, TerminalStatus};
use bioentry_hw::{FaceDetector, FrameSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Samples buffered between the sampler thread and the capture loop.
const SAMPLE_BUFFER: usize = 2;

/// Status report for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub terminal_id: String,
    pub status: TerminalStatus,
    pub connectivity: ConnectivitySnapshot,
    pub degraded: bool,
    /// Absent when the store cannot be read.
    pub store: Option<StoreStats>,
}

/// Cheap clones of everything the operator surface needs.
#[derive(Clone)]
pub struct TerminalHandle {
    pub terminal_id: String,
    pub board: Arc<StatusBoard>,
    pub connectivity: ConnectivityHandle,
    pub store: Arc<OfflineStore>,
    pub sync: Arc<SyncScheduler>,
}

impl TerminalHandle {
    pub fn report(&self) -> StatusReport {
        let store = match self.store.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "store stats unavailable");
                None
            }
        };
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            terminal_id: self.terminal_id.clone(),
            status: self.board.current(),
            connectivity: self.connectivity.current(),
            degraded: self.board.is_degraded(),
            store,
        }
    }
}

pub struct Terminal {
    handle: TerminalHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    sampler: Option<std::thread::JoinHandle<()>>,
}

impl Terminal {
    /// Start probing, syncing and capturing. Must be called inside a tokio runtime.
    pub fn start(
        config: &Config,
        remote: Arc<dyn RemoteService>,
        store: Arc<OfflineStore>,
        source: Box<dyn FrameSource>,
        detector: Box<dyn FaceDetector>,
    ) -> std::io::Result<Self> {
        let cancel = CancellationToken::new();
        let board = Arc::new(StatusBoard::new());
        let presenter: Arc<dyn FeedbackPresenter> = board.clone();

        let (connectivity, monitor_task) = spawn_monitor(
            Arc::clone(&remote),
            MonitorSettings {
                interval: config.probe_interval(),
                probe_timeout: config.probe_timeout(),
                failures_to_offline: config.remote.failures_to_offline,
            },
            cancel.child_token(),
        );

        let client = VerificationClient::new(remote, config.request_timeout());
        let sync = Arc::new(SyncScheduler::new(
            Arc::clone(&store),
            client.clone(),
            connectivity.clone(),
            Arc::clone(&presenter),
            cancel.child_token(),
        ));
        let sync_task = tokio::spawn(Arc::clone(&sync).run(config.sync_interval()));

        let display_task = tokio::spawn(track_connectivity(
            connectivity.clone(),
            Arc::clone(&board),
            cancel.child_token(),
        ));

        let dispatcher = Dispatcher::new(
            client,
            connectivity.clone(),
            Arc::clone(&store),
            Arc::clone(&presenter),
        );
        let capture = CaptureLoop::new(
            config.stability(),
            dispatcher,
            presenter,
            config.terminal.id.clone(),
            config.capture.jpeg_quality,
        );

        let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
        let sampler = spawn_sampler(
            source,
            detector,
            SamplerSettings {
                backoff_initial: Duration::from_millis(config.capture.sensor_backoff_initial_ms),
                backoff_max: Duration::from_millis(config.capture.sensor_backoff_max_ms),
                max_detector_failures: config.capture.max_detector_failures,
            },
            tx,
            cancel.child_token(),
        )?;
        let capture_task = tokio::spawn(capture.run(rx, cancel.child_token()));

        tracing::info!(terminal_id = %config.terminal.id, "terminal started");
        Ok(Self {
            handle: TerminalHandle {
                terminal_id: config.terminal.id.clone(),
                board,
                connectivity,
                store,
                sync,
            },
            cancel,
            tasks: vec![monitor_task, sync_task, display_task, capture_task],
            sampler: Some(sampler),
        })
    }

    pub fn handle(&self) -> TerminalHandle {
        self.handle.clone()
    }

    /// Stop taking new work and wait for in-flight verifications to finish.
    pub async fn shutdown(mut self) {
        tracing::info!("terminal shutting down");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "terminal task ended abnormally");
            }
        }
        if let Some(sampler) = self.sampler.take() {
            let joined = tokio::task::spawn_blocking(move || sampler.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("sampler thread ended abnormally");
            }
        }
        tracing::info!("terminal stopped");
    }
}

/// Reflect connectivity on the resting display.
async fn track_connectivity(
    connectivity: ConnectivityHandle,
    board: Arc<StatusBoard>,
    cancel: CancellationToken,
) {
    let mut rx = connectivity.subscribe();
    loop {
        let state = rx.borrow_and_update().state;
        board.set_offline(state == ConnectivityState::Offline);
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreSettings;
    use crate::testing::{FakeRemote, Reply, ScriptedSource, SteadyFace};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.terminal.id = "BENCH".into();
        config.capture.stable_window_frames = 5;
        config.remote.probe_interval_secs = 3600;
        config.store.sync_interval_secs = 3600;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_online_capture() {
        let remote = Arc::new(FakeRemote::new(Reply::Verified("1712")));
        let store = Arc::new(OfflineStore::open_in_memory(StoreSettings::default()).unwrap());
        let terminal = Terminal::start(
            &fast_config(),
            remote.clone(),
            store,
            Box::new(ScriptedSource::new()),
            Box::new(SteadyFace),
        )
        .unwrap();

        let handle = terminal.handle();
        let mut status = handle.board.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, TerminalStatus::Success(_))),
        )
        .await
        .expect("no success within 5s")
        .unwrap();

        terminal.shutdown().await;
        // steady face, one presence: exactly one submission
        assert_eq!(remote.verify_calls(), 1);

        let report = handle.report();
        assert_eq!(report.terminal_id, "BENCH");
        assert!(report.connectivity.is_online());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verification_slower_than_loss_gap_captures_once() {
        let config = fast_config();
        // each remote call outlasts the loss gap
        let delay = Duration::from_millis(config.capture.loss_gap_ms + 200);
        let remote = Arc::new(FakeRemote::new(Reply::Verified("1712")).with_delay(delay));
        let store = Arc::new(OfflineStore::open_in_memory(StoreSettings::default()).unwrap());
        let terminal = Terminal::start(
            &config,
            remote.clone(),
            store,
            Box::new(ScriptedSource::new()),
            Box::new(SteadyFace),
        )
        .unwrap();

        let mut status = terminal.handle().board.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| matches!(s, TerminalStatus::Success(_))),
        )
        .await
        .expect("no success within 10s")
        .unwrap();

        // the face stays in view; a released latch would trigger again within a few frames
        tokio::time::sleep(Duration::from_millis(300)).await;
        terminal.shutdown().await;
        assert_eq!(remote.verify_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_offline_then_sync() {
        let remote = Arc::new(FakeRemote::new(Reply::Verified("1712")));
        remote.set_reachable(false);
        let store = Arc::new(OfflineStore::open_in_memory(StoreSettings::default()).unwrap());
        let terminal = Terminal::start(
            &fast_config(),
            remote.clone(),
            store.clone(),
            Box::new(ScriptedSource::new()),
            Box::new(SteadyFace),
        )
        .unwrap();
        let handle = terminal.handle();

        let mut status = handle.board.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|_| store.stats().map(|s| s.pending == 1).unwrap_or(false)),
        )
        .await
        .expect("capture not queued within 5s")
        .unwrap();
        assert_eq!(remote.verify_calls(), 0);

        remote.set_reachable(true);
        assert!(handle.connectivity.probe_now().await.is_online());
        for _ in 0..200 {
            if store.stats().unwrap().synced == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.stats().unwrap().synced, 1);

        terminal.shutdown().await;
    }
}
