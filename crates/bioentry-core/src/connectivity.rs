//! Online/offline state machine with hysteresis.
//!
//! One successful probe brings the terminal online; going offline takes
//! `failures_to_offline` consecutive failures so a single dropped probe does
//! not flap the state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
    /// No probe has completed yet.
    Probing,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => f.write_str("online"),
            ConnectivityState::Offline => f.write_str("offline"),
            ConnectivityState::Probing => f.write_str("probing"),
        }
    }
}

/// Current connectivity plus when it last changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    pub state: ConnectivityState,
    pub since: DateTime<Utc>,
    pub consecutive_failures: u32,
}

impl ConnectivitySnapshot {
    pub fn is_online(&self) -> bool {
        self.state == ConnectivityState::Online
    }
}

/// A state change produced by [`Hysteresis::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
}

pub struct Hysteresis {
    failures_to_offline: u32,
    snapshot: ConnectivitySnapshot,
}

impl Hysteresis {
    pub fn new(failures_to_offline: u32, now: DateTime<Utc>) -> Self {
        Self {
            failures_to_offline: failures_to_offline.max(1),
            snapshot: ConnectivitySnapshot {
                state: ConnectivityState::Probing,
                since: now,
                consecutive_failures: 0,
            },
        }
    }

    pub fn snapshot(&self) -> &ConnectivitySnapshot {
        &self.snapshot
    }

    pub fn state(&self) -> ConnectivityState {
        self.snapshot.state
    }

    /// Record one probe outcome. Returns the transition, if the state changed.
    pub fn record(&mut self, reachable: bool, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.snapshot.state;

        let to = if reachable {
            self.snapshot.consecutive_failures = 0;
            ConnectivityState::Online
        } else {
            self.snapshot.consecutive_failures = self.snapshot.consecutive_failures.saturating_add(1);
            match from {
                ConnectivityState::Online
                    if self.snapshot.consecutive_failures < self.failures_to_offline =>
                {
                    ConnectivityState::Online
                }
                // Nothing established yet, so there is nothing to protect from flapping.
                _ => ConnectivityState::Offline,
            }
        };

        if to == from {
            return None;
        }

        self.snapshot.state = to;
        self.snapshot.since = now;
        Some(Transition { from, to })
    }
}
