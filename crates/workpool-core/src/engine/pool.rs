//! Fixed-size pool engine.
//!
//! Each submitted job waits on the async runtime for one of `size` slots,
//! then runs its worker body on a blocking OS thread. A job cancelled
//! before it claims a slot never runs.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{Engine, SlotHandle, SlotState, SubmitError, TaskHandle};
use crate::channel::WorkerEnd;
use crate::protocol::{JobId, ServerMessage};
use crate::worker::Worker;

/// Engine backed by a semaphore of worker slots and tokio's blocking pool.
///
/// Must be used from within a tokio runtime.
#[derive(Debug)]
pub struct PoolEngine {
    size: usize,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl PoolEngine {
    /// Create a pool with `size` concurrent worker slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of slots not currently held by a running job.
    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Engine for PoolEngine {
    fn name(&self) -> &str {
        "pool"
    }

    fn submit(
        &self,
        worker: Arc<dyn Worker>,
        id: JobId,
        channel: WorkerEnd,
    ) -> Result<Box<dyn TaskHandle>, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShutDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| SubmitError::Rejected {
            id,
            reason: e.to_string(),
        })?;

        let state = Arc::new(SlotState::new());
        let slot = Arc::clone(&state);
        let slots = Arc::clone(&self.slots);
        let shutdown = self.shutdown.clone();

        runtime.spawn(async move {
            let permit = tokio::select! {
                permit = slots.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        slot.try_cancel();
                        return;
                    }
                },
                _ = shutdown.cancelled() => {
                    slot.try_cancel();
                    tracing::debug!(job_id = id, "engine shut down before job started");
                    return;
                }
            };

            if !slot.try_claim() {
                tracing::debug!(job_id = id, "job cancelled before claiming a slot");
                return;
            }

            tracing::debug!(job_id = id, "job claimed a worker slot");
            let reporter = channel.reporter();
            let result = tokio::task::spawn_blocking(move || worker.run(id, channel)).await;
            slot.mark_done();
            drop(permit);

            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(job_id = id, "worker panicked; reporting error on its behalf");
                    let _ = reporter.send(ServerMessage::Error { id });
                } else {
                    tracing::warn!(job_id = id, error = %e, "worker thread was cancelled");
                }
            }
        });

        Ok(Box::new(SlotHandle::new(state)))
    }

    fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(size = self.size, "shutting down worker pool");
        }
        self.shutdown.cancel();
        self.slots.close();
    }
}
