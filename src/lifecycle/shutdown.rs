//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::server::ServerEngine;

/// Coordinator for graceful shutdown.
///
/// Background tasks (config watcher, event printers) subscribe and exit
/// when it fires. Only the first trigger is broadcast.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let receivers = self.tx.send(()).unwrap_or(0);
        tracing::debug!(receivers, "Shutdown triggered");
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop `server`, giving up after `deadline`. Returns `false` on timeout,
/// in which case the caller should exit anyway.
pub async fn stop_within(server: &ServerEngine, deadline: Duration) -> bool {
    match tokio::time::timeout(deadline, server.stop()).await {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(deadline = ?deadline, "Server did not stop in time, forcing exit");
            false
        }
    }
}
