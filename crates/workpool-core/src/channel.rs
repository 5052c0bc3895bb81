//! Private duplex channel between the coordinator and one job's worker.
//!
//! Worker events flow coordinator-ward as [`ServerMessage`]s; the only
//! traffic in the other direction is a forwarded [`ClientMessage::Cancel`].
//! Both directions are unbounded so neither side ever blocks on a send,
//! and both ends can be used from synchronous worker threads.

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::protocol::{ClientMessage, JobId, ServerMessage};

/// Errors from sending or receiving on a job channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel for job {0} is closed")]
    Closed(JobId),
}

/// Create a fresh channel pair for job `id`.
pub fn duplex(id: JobId) -> (CoordinatorEnd, WorkerEnd) {
    let (to_worker, from_coordinator) = mpsc::unbounded_channel();
    let (to_coordinator, from_worker) = mpsc::unbounded_channel();
    (
        CoordinatorEnd {
            job_id: id,
            to_worker,
            from_worker,
            closed: false,
        },
        WorkerEnd {
            job_id: id,
            to_coordinator,
            from_coordinator,
        },
    )
}

/// The coordinator's end, kept in the registry entry.
#[derive(Debug)]
pub struct CoordinatorEnd {
    job_id: JobId,
    to_worker: UnboundedSender<ClientMessage>,
    from_worker: UnboundedReceiver<ServerMessage>,
    closed: bool,
}

impl CoordinatorEnd {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Send a message to the worker. Fails once the worker end is gone.
    pub fn send(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        self.to_worker
            .send(msg)
            .map_err(|_| ChannelError::Closed(self.job_id))
    }

    /// Non-blocking receive.
    ///
    /// Returns `Ok(None)` when nothing is buffered and
    /// `Err(ChannelError::Closed)` once the buffer is drained and every
    /// worker-side sender has been dropped. The first such error marks
    /// the channel closed.
    pub fn try_recv(&mut self) -> Result<Option<ServerMessage>, ChannelError> {
        match self.from_worker.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Err(ChannelError::Closed(self.job_id))
            }
        }
    }

    /// Wait for the next message. Cancel safe.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        let msg = self.from_worker.recv().await;
        if msg.is_none() {
            self.closed = true;
        }
        msg
    }

    /// Whether the worker side has been observed to hang up.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// The worker's end, handed to the execution engine at submission.
#[derive(Debug)]
pub struct WorkerEnd {
    job_id: JobId,
    to_coordinator: UnboundedSender<ServerMessage>,
    from_coordinator: UnboundedReceiver<ClientMessage>,
}

impl WorkerEnd {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Send an event to the coordinator.
    pub fn send(&self, msg: ServerMessage) -> Result<(), ChannelError> {
        self.to_coordinator
            .send(msg)
            .map_err(|_| ChannelError::Closed(self.job_id))
    }

    /// Non-blocking receive of the next coordinator message, if any.
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.from_coordinator.try_recv().ok()
    }

    /// Drain pending coordinator messages and report whether any of them
    /// is a cancel addressed to this job (its own id, or no id at all).
    pub fn cancel_requested(&mut self) -> bool {
        let mut requested = false;
        while let Some(msg) = self.try_recv() {
            match msg {
                ClientMessage::Cancel { id: None } => requested = true,
                ClientMessage::Cancel { id: Some(id) } if id == self.job_id => requested = true,
                other => {
                    tracing::debug!(job_id = self.job_id, msg = ?other, "worker ignoring message");
                }
            }
        }
        requested
    }

    /// A detached sender for reporting on the worker's behalf (used by
    /// engines when a worker body dies without a terminal message).
    pub fn reporter(&self) -> Reporter {
        Reporter {
            job_id: self.job_id,
            tx: self.to_coordinator.clone(),
        }
    }
}

/// Send-only handle onto a job's coordinator-bound stream.
#[derive(Debug, Clone)]
pub struct Reporter {
    job_id: JobId,
    tx: UnboundedSender<ServerMessage>,
}

impl Reporter {
    pub fn send(&self, msg: ServerMessage) -> Result<(), ChannelError> {
        self.tx
            .send(msg)
            .map_err(|_| ChannelError::Closed(self.job_id))
    }
}
