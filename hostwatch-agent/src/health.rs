//! Connection health state machine
//!
//! `disconnected -> connecting -> {connected, error}`, `connected -> connecting`,
//! `error -> connecting`. The only way into `connected` or `error` is
//! through a [`ConnectAttempt`] handed out by [`HealthTracker::begin_attempt`],
//! so no caller can skip `connecting`. A failure on an already
//! established link goes through [`EstablishedLink::failed`].
//!
//! Reads never block writers for longer than a clone: the status sits
//! behind a `parking_lot::RwLock` and is mirrored to a `watch` channel
//! for displays that prefer to be notified.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Error(message) => write!(f, "error: {message}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug)]
struct HealthState {
    status: ConnectionStatus,
    last_error: Option<String>,
    last_publish: Option<DateTime<Utc>>,
    history: VecDeque<ConnectionStatus>,
}

#[derive(Clone)]
pub struct HealthTracker {
    state: Arc<RwLock<HealthState>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(ConnectionStatus::Disconnected);

        Self {
            state: Arc::new(RwLock::new(HealthState {
                status: ConnectionStatus::Disconnected,
                last_error: None,
                last_publish: None,
                history,
            })),
            status_tx: Arc::new(status_tx),
        }
    }

    /// Enter `connecting` right before a connection attempt
    pub fn begin_attempt(&self) -> ConnectAttempt {
        self.set(ConnectionStatus::Connecting);
        ConnectAttempt {
            tracker: self.clone(),
        }
    }

    /// Back to the initial state (agent shutdown)
    pub fn mark_disconnected(&self) {
        self.set(ConnectionStatus::Disconnected);
    }

    pub fn record_publish(&self, at: DateTime<Utc>) {
        self.state.write().last_publish = Some(at);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn last_publish(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_publish
    }

    /// Most recent statuses, oldest first
    pub fn recent(&self) -> Vec<ConnectionStatus> {
        self.state.read().history.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn set(&self, status: ConnectionStatus) {
        {
            let mut state = self.state.write();
            if let ConnectionStatus::Error(message) = &status {
                state.last_error = Some(message.clone());
            }
            if state.history.len() == HISTORY_LEN {
                state.history.pop_front();
            }
            state.history.push_back(status.clone());
            state.status = status.clone();
            // mirror updated in lock order
            self.status_tx.send_replace(status.clone());
        }
        debug!("Connection status -> {}", status);
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that `connecting` was entered for this attempt
#[must_use = "an attempt must end in established() or failed()"]
pub struct ConnectAttempt {
    tracker: HealthTracker,
}

impl ConnectAttempt {
    pub fn established(self) -> EstablishedLink {
        self.tracker.set(ConnectionStatus::Connected);
        EstablishedLink {
            tracker: self.tracker,
        }
    }

    pub fn failed(self, message: impl Into<String>) {
        self.tracker.set(ConnectionStatus::Error(message.into()));
    }
}

/// A connection that reached `connected`
pub struct EstablishedLink {
    tracker: HealthTracker,
}

impl EstablishedLink {
    pub fn failed(self, message: impl Into<String>) {
        self.tracker.set(ConnectionStatus::Error(message.into()));
    }
}
