//! Graceful shutdown signalling for long-running loops.
//!
//! A [`ShutdownController`] owns the switch; any number of cloned
//! [`ShutdownToken`]s observe it. The worker checks its token between
//! envelopes and drains the one in flight before exiting, so nothing is
//! dropped; uncommitted entries fall back to the consumer group's claim
//! timeout.

use tokio::sync::watch;
use tracing::info;

/// Owning side of the shutdown switch.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    /// Create a controller and its first token.
    #[must_use]
    pub fn new() -> (Self, ShutdownToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownToken { rx })
    }

    /// Flip the switch; all tokens observe it.
    pub fn trigger(&self) {
        info!("Shutdown triggered");
        let _ = self.tx.send(true);
    }

    /// A fresh token observing this controller.
    #[must_use]
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of the shutdown switch.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Whether shutdown has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until shutdown is triggered.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Controller dropped; treat as shutdown.
                return;
            }
        }
    }
}

/// Suspend until the process receives SIGTERM or ctrl-c.
///
/// Binaries pair this with a [`ShutdownController`]:
/// `wait_for_signal().await; controller.trigger();`
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("Received ctrl-c");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn tokens_observe_the_trigger() {
        let (controller, token) = ShutdownController::new();
        let second = controller.token();
        assert!(!token.is_triggered());

        controller.trigger();
        assert!(token.is_triggered());
        assert!(second.is_triggered());
    }

    #[tokio::test]
    async fn triggered_wait_completes() {
        let (controller, token) = ShutdownController::new();
        let waiter = tokio::spawn(async move { token.triggered().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn dropped_controller_releases_waiters() {
        let (controller, token) = ShutdownController::new();
        drop(controller);
        tokio::time::timeout(Duration::from_secs(1), token.triggered())
            .await
            .expect("wait should end when controller drops");
    }
}
