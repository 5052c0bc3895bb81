use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ClientMessage, PoolStatus};

/// Requests serviced by the coordinator's control loop.
#[derive(Debug)]
pub(super) enum Command {
    Client(ClientMessage),
    Status(oneshot::Sender<PoolStatus>),
    Stop,
}

/// Cheap, cloneable handle onto a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub(super) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    /// Queue a client request for the control loop.
    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(Command::Client(msg))
            .map_err(|_| anyhow::anyhow!("coordinator is not running"))
    }

    /// Snapshot of the pool counters, taken by the control loop.
    pub async fn status(&self) -> Result<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status(reply))
            .map_err(|_| anyhow::anyhow!("coordinator is not running"))?;
        rx.await.context("coordinator stopped before replying")
    }

    /// Ask the control loop to shut the engine down and exit. Safe to call
    /// more than once.
    pub fn stop(&self) {
        if self.tx.send(Command::Stop).is_err() {
            tracing::debug!("coordinator already stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
