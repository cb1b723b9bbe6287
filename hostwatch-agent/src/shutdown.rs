//! Process-wide running flag
//!
//! Loops poll [`ShutdownSignal::is_running`] at their boundaries (top of
//! each tick, top of each reconnect attempt). Backoff sleeps wake early
//! on shutdown; in-flight network calls are left to finish or time out.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Owner side: clears the running flag once.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Observer side, cloned into every task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Clear the running flag. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(false);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the running flag is cleared. Never resolves if the
    /// owner is dropped without triggering.
    pub async fn cancelled(&mut self) {
        while self.is_running() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`; returns `false` if shutdown interrupted it.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => self.is_running(),
            _ = self.cancelled() => false,
        }
    }
}
