//! Purpose: Typed control pipe used once per worker to configure it and learn it is ready.
//! Exports: `ControlMessage`, `WorkerStatus`, `ControlLink`, `ControlEndpoint`, `control_pipe`.
//! Role: Keeps setup traffic off the data port, so task ids and RPC ids never see it.
//! Invariants: The controller posts no task before it has read `Ready` for that worker.

use std::sync::mpsc;
use std::time::Duration;

use crate::core::error::{Error, ErrorBody, ErrorKind};
use crate::core::worker::WorkerConfig;

pub enum ControlMessage {
    Configure(Box<WorkerConfig>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready { worker_id: usize },
    SetupFailed { worker_id: usize, error: ErrorBody },
}

/// Controller end.
pub struct ControlLink {
    tx: mpsc::Sender<ControlMessage>,
    rx: mpsc::Receiver<WorkerStatus>,
}

/// Worker end.
pub struct ControlEndpoint {
    rx: mpsc::Receiver<ControlMessage>,
    tx: mpsc::Sender<WorkerStatus>,
}

pub fn control_pipe() -> (ControlLink, ControlEndpoint) {
    let (config_tx, config_rx) = mpsc::channel();
    let (status_tx, status_rx) = mpsc::channel();
    (
        ControlLink {
            tx: config_tx,
            rx: status_rx,
        },
        ControlEndpoint {
            rx: config_rx,
            tx: status_tx,
        },
    )
}

impl ControlLink {
    pub fn configure(&self, config: WorkerConfig) -> Result<(), Error> {
        self.tx
            .send(ControlMessage::Configure(Box::new(config)))
            .map_err(|_| {
                Error::new(ErrorKind::Transport)
                    .with_message("worker exited before it could be configured")
            })
    }

    /// Block until the worker reports; setup failures come back as their original kind.
    pub fn wait_ready(&self, timeout: Duration) -> Result<usize, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(WorkerStatus::Ready { worker_id }) => Ok(worker_id),
            Ok(WorkerStatus::SetupFailed { worker_id, error }) => {
                Err(Error::from_body(error).with_worker(worker_id))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::new(ErrorKind::Timeout)
                .with_message(format!("worker not ready after {}ms", timeout.as_millis()))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::new(ErrorKind::Transport)
                .with_message("worker exited before reporting ready")),
        }
    }
}

impl ControlEndpoint {
    /// `None` when the controller went away without configuring.
    pub fn recv_configure(&self) -> Option<WorkerConfig> {
        match self.rx.recv() {
            Ok(ControlMessage::Configure(config)) => Some(*config),
            Err(_) => None,
        }
    }

    pub fn report(&self, status: WorkerStatus) {
        if self.tx.send(status).is_err() {
            tracing::debug!("controller stopped listening for worker status");
        }
    }
}
