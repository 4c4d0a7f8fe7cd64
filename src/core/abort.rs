//! Purpose: Caller-owned cancellation signals for RPC calls and pool tasks.
//! Exports: `AbortController`, `AbortSignal`.
//! Role: Lets a caller give up on an in-flight operation without touching the transport.
//! Invariants: Aborting is sticky; every signal clone observes it, including late subscribers.

use tokio::sync::watch;

#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted. Never resolves if the controller is dropped un-aborted.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AbortController;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_resolves_after_abort() {
        let controller = AbortController::new();
        let mut signal = controller.signal();
        assert!(!signal.is_aborted());
        let waiter = tokio::spawn(async move {
            signal.aborted().await;
        });
        controller.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resolved")
            .expect("join");
        assert!(controller.is_aborted());
    }

    #[tokio::test]
    async fn late_subscriber_sees_abort() {
        let controller = AbortController::new();
        controller.abort();
        let mut signal = controller.signal();
        assert!(signal.is_aborted());
        tokio::time::timeout(Duration::from_millis(100), signal.aborted())
            .await
            .expect("already aborted");
    }

    #[tokio::test]
    async fn dropped_controller_never_fires() {
        let controller = AbortController::new();
        let mut signal = controller.signal();
        drop(controller);
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(waited.is_err());
    }
}
