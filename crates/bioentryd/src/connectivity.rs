//! Probe loop owning the terminal's single connectivity state.
//!
//! Other tasks read the state through a [`ConnectivityHandle`]; only the
//! monitor task writes it.

use crate::remote::RemoteService;
use bioentry_core::{ConnectivitySnapshot, ConnectivityState, Hysteresis};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type ProbeReply = oneshot::Sender<ConnectivitySnapshot>;

#[derive(Clone)]
pub struct ConnectivityHandle {
    state: watch::Receiver<ConnectivitySnapshot>,
    requests: Option<mpsc::Sender<ProbeReply>>,
}

impl ConnectivityHandle {
    /// Current snapshot. Cheap; never waits on a probe.
    pub fn current(&self) -> ConnectivitySnapshot {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.borrow().state
    }

    /// Probe now and return the resulting state. Concurrent requests share one probe.
    pub async fn probe_now(&self) -> ConnectivitySnapshot {
        let Some(requests) = &self.requests else {
            return self.current();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if requests.send(reply_tx).await.is_err() {
            return self.current();
        }
        reply_rx.await.unwrap_or_else(|_| self.current())
    }

    /// Receiver notified on state transitions only.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.state.clone()
    }

    /// Handle whose state is set directly by the test.
    #[cfg(test)]
    pub fn manual(state: ConnectivityState) -> (Self, watch::Sender<ConnectivitySnapshot>) {
        let (tx, rx) = watch::channel(ConnectivitySnapshot {
            state,
            since: Utc::now(),
            consecutive_failures: 0,
        });
        (
            Self {
                state: rx,
                requests: None,
            },
            tx,
        )
    }
}

pub struct MonitorSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failures_to_offline: u32,
}

struct ConnectivityMonitor {
    remote: Arc<dyn RemoteService>,
    settings: MonitorSettings,
    machine: Hysteresis,
    state_tx: watch::Sender<ConnectivitySnapshot>,
    requests: mpsc::Receiver<ProbeReply>,
}

/// Start the probe loop. The first probe runs immediately.
pub fn spawn_monitor(
    remote: Arc<dyn RemoteService>,
    settings: MonitorSettings,
    cancel: CancellationToken,
) -> (ConnectivityHandle, JoinHandle<()>) {
    let machine = Hysteresis::new(settings.failures_to_offline, Utc::now());
    let (state_tx, state_rx) = watch::channel(machine.snapshot().clone());
    let (req_tx, req_rx) = mpsc::channel(8);

    let monitor = ConnectivityMonitor {
        remote,
        settings,
        machine,
        state_tx,
        requests: req_rx,
    };
    let task = tokio::spawn(monitor.run(cancel));

    (
        ConnectivityHandle {
            state: state_rx,
            requests: Some(req_tx),
        },
        task,
    )
}

impl ConnectivityMonitor {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.settings.interval, "connectivity monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.probe().await;
                    self.answer_queued(Vec::new(), &snapshot);
                }
                Some(first) = self.requests.recv() => {
                    let snapshot = self.probe().await;
                    self.answer_queued(vec![first], &snapshot);
                    ticker.reset();
                }
            }
        }
        tracing::info!("connectivity monitor stopped");
    }

    /// Requests that arrived while a probe was in flight share its result.
    fn answer_queued(&mut self, mut waiters: Vec<ProbeReply>, snapshot: &ConnectivitySnapshot) {
        while let Ok(more) = self.requests.try_recv() {
            waiters.push(more);
        }
        for waiter in waiters {
            let _ = waiter.send(snapshot.clone());
        }
    }

    async fn probe(&mut self) -> ConnectivitySnapshot {
        let remote = Arc::clone(&self.remote);
        let call = tokio::task::spawn_blocking(move || remote.probe());
        let reachable = match tokio::time::timeout(self.settings.probe_timeout, call).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                tracing::debug!(error = %e, "probe failed");
                false
            }
            Ok(Err(join)) => {
                tracing::warn!(error = %join, "probe task failed");
                false
            }
            Err(_) => {
                tracing::debug!("probe timed out");
                false
            }
        };

        if let Some(t) = self.machine.record(reachable, Utc::now()) {
            tracing::info!(from = %t.from, to = %t.to, "connectivity changed");
        } else if !reachable && self.machine.state() == ConnectivityState::Online {
            tracing::warn!(
                failures = self.machine.snapshot().consecutive_failures,
                "probe failed; still online"
            );
        }

        let snapshot = self.machine.snapshot().clone();
        let next = snapshot.clone();
        self.state_tx.send_if_modified(move |current| {
            let transitioned = current.state != next.state;
            *current = next;
            transitioned
        });
        snapshot
    }
}
