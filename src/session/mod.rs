//! # Session Module
//!
//! Owns the logging pipeline's lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming <-> Reconnecting -> ShuttingDown -> Stopped
//! ```
//!
//! The [`SessionController`] runs the ingestion loop on one task. External
//! consumers talk to it through a cloneable [`SessionHandle`]: statistics
//! snapshots, a reading feed, the current state, a stats-dump trigger and
//! shutdown. Hooks that need every event implement [`SessionObserver`].

pub mod backoff;
pub mod controller;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};

use crate::sensor::protocol::Reading;
use crate::stats::{StatsHandle, StatsSnapshot};

pub use backoff::Backoff;
pub use controller::{SessionController, SessionSettings};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::ShuttingDown => "shutting down",
            SessionState::Stopped => "stopped",
        })
    }
}

/// Receiver of session events
///
/// Called synchronously on the ingestion task; implementations must not block.
pub trait SessionObserver: Send {
    fn on_state(&mut self, _state: SessionState) {}

    fn on_reading(&mut self, _reading: &Reading) {}

    /// Called for every statistics dump, including the final one
    fn on_stats(&mut self, _snapshot: &StatsSnapshot) {}
}

/// Summary returned when a session ends
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub final_snapshot: Arc<StatsSnapshot>,
    pub readings_logged: u64,
    pub readings_lost: u64,
    /// Data files created, in creation order
    pub files: Vec<PathBuf>,
    pub stats_file: Option<PathBuf>,
    pub reconnects: u64,
}

/// Cloneable consumer interface to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    stats: StatsHandle,
    readings: broadcast::Sender<Arc<Reading>>,
    state: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
    dump: Arc<Notify>,
}

impl SessionHandle {
    /// Latest statistics snapshot; never blocks ingestion
    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        self.stats.snapshot()
    }

    /// Feed of every reading (valid and invalid) from now on
    ///
    /// A subscriber that falls behind loses the oldest readings
    /// (`RecvError::Lagged`); ingestion never waits for it.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Reading>> {
        self.readings.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ask the session to write a statistics dump
    pub fn dump_stats(&self) {
        self.dump.notify_one();
    }

    /// Ask the session to stop
    ///
    /// Observed at the next suspension point (read, connect or backoff).
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
