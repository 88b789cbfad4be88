//! Session shutdown signal
//!
//! One cancellation token per session, shared by every loop that can block.
//! Operator interrupts and natural completion race to trigger it; only the
//! first trigger records a reason.

use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl-C from the operator
    Interrupted,
    /// SIGTERM
    Terminated,
    /// The remote side ended the session
    SessionEnded,
}

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown. Returns `false` if it was already triggered, in
    /// which case the first reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            debug!("Shutdown triggered: {:?}", reason);
        }
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been triggered
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Watch SIGINT/SIGTERM until the signal fires or shutdown happens for
    /// another reason.
    pub fn spawn_signal_watcher(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = wait_for_os_signal() => {
                    if let Some(reason) = reason {
                        info!("Received {:?}, closing session", reason);
                        signal.trigger(reason);
                    }
                }
                _ = signal.triggered() => {}
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> Option<ShutdownReason> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGINT handler: {}", e);
            return std::future::pending().await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            return sigint.recv().await.map(|_| ShutdownReason::Interrupted);
        }
    };

    tokio::select! {
        r = sigint.recv() => r.map(|_| ShutdownReason::Interrupted),
        r = sigterm.recv() => r.map(|_| ShutdownReason::Terminated),
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> Option<ShutdownReason> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(ShutdownReason::Interrupted),
        Err(e) => {
            warn!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_trigger_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert_eq!(signal.reason(), None);

        assert!(signal.trigger(ShutdownReason::Interrupted));
        assert!(!signal.trigger(ShutdownReason::SessionEnded));

        assert!(signal.is_triggered());
        assert_eq!(signal.reason(), Some(ShutdownReason::Interrupted));
    }

    #[tokio::test]
    async fn test_clones_observe_trigger() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();

        let waiter = tokio::spawn(async move {
            observer.triggered().await;
            observer.reason()
        });

        signal.trigger(ShutdownReason::Terminated);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some(ShutdownReason::Terminated));
    }

    #[tokio::test]
    async fn test_signal_watcher_exits_on_completion() {
        let signal = ShutdownSignal::new();
        let watcher = signal.spawn_signal_watcher();

        signal.trigger(ShutdownReason::SessionEnded);
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), Some(ShutdownReason::SessionEnded));
    }
}
