use bioentry_core::{FailureReason, TerminalStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Receives the discrete status the touchscreen renders.
pub trait FeedbackPresenter: Send + Sync {
    fn show(&self, status: TerminalStatus);
}

/// Publishes statuses on a watch channel for the UI consumer and D-Bus.
///
/// `Idle` is shown as the terminal's resting status: `Degraded` once the
/// offline store has failed, `Offline` while unreachable, `Idle` otherwise.
pub struct StatusBoard {
    tx: watch::Sender<TerminalStatus>,
    offline: AtomicBool,
    degraded: AtomicBool,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TerminalStatus::Idle);
        Self {
            tx,
            offline: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TerminalStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> TerminalStatus {
        self.tx.borrow().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Track connectivity; refreshes the display if it is at rest.
    pub fn set_offline(&self, offline: bool) {
        if self.offline.swap(offline, Ordering::SeqCst) == offline {
            return;
        }
        if is_resting(&self.current()) {
            self.publish(self.resting());
        }
    }

    fn resting(&self) -> TerminalStatus {
        if self.is_degraded() {
            TerminalStatus::Degraded
        } else if self.offline.load(Ordering::SeqCst) {
            TerminalStatus::Offline
        } else {
            TerminalStatus::Idle
        }
    }

    fn publish(&self, status: TerminalStatus) {
        let name = status.name();
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::info!(status = name, "terminal status");
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn is_resting(status: &TerminalStatus) -> bool {
    matches!(
        status,
        TerminalStatus::Idle | TerminalStatus::Offline | TerminalStatus::Degraded
    )
}

impl FeedbackPresenter for StatusBoard {
    fn show(&self, status: TerminalStatus) {
        let status = match status {
            TerminalStatus::Degraded
            | TerminalStatus::Failure(FailureReason::StoreUnavailable) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    tracing::error!("offline store failed; terminal degraded to live verification only");
                }
                status
            }
            TerminalStatus::Idle => self.resting(),
            other => other,
        };
        self.publish(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_reflects_connectivity() {
        let board = StatusBoard::new();
        board.set_offline(true);
        assert_eq!(board.current(), TerminalStatus::Offline);

        board.show(TerminalStatus::Detecting);
        board.set_offline(false);
        assert_eq!(board.current(), TerminalStatus::Detecting, "busy display is not overwritten");

        board.show(TerminalStatus::Idle);
        assert_eq!(board.current(), TerminalStatus::Idle);
    }

    #[test]
    fn test_store_failure_is_persistent() {
        let board = StatusBoard::new();
        board.show(TerminalStatus::Failure(FailureReason::StoreUnavailable));
        assert!(board.is_degraded());
        board.show(TerminalStatus::Idle);
        assert_eq!(board.current(), TerminalStatus::Degraded);
        board.set_offline(true);
        assert_eq!(board.current(), TerminalStatus::Degraded);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_only() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.show(TerminalStatus::Idle);
        assert!(!rx.has_changed().unwrap());
        board.show(TerminalStatus::Detecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), TerminalStatus::Detecting);
    }
}
