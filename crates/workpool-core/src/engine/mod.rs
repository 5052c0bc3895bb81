//! Execution engine abstraction.
//!
//! The coordinator treats the engine as an opaque pool of worker slots:
//! it submits jobs and, for jobs that have not started yet, may try to
//! cancel them. Once a job's body is running, only the worker itself can
//! end it (cooperatively, via its channel).
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!     |
//!     |  submit(worker, id, worker_end) ------> Engine
//!     |                                           |
//!     |  <------------------- Box<dyn TaskHandle> |
//!     |                                           v
//!     |                                   slot acquired?
//!     |   handle.cancel() --- pending --> cancelled (never runs)
//!     |                   \-- claimed --> worker.run(id, worker_end)
//! ```

pub mod pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::channel::WorkerEnd;
use crate::protocol::JobId;
use crate::worker::Worker;

pub use pool::PoolEngine;

/// Errors returned by [`Engine::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("execution engine is shut down")]
    ShutDown,

    #[error("execution engine rejected job {id}: {reason}")]
    Rejected { id: JobId, reason: String },
}

/// Handle to one submitted job.
pub trait TaskHandle: Send + Sync {
    /// Try to cancel the job. Returns `true` only if the job had not begun
    /// running and now never will.
    fn cancel(&self) -> bool;

    /// Whether the worker body is currently executing.
    fn is_running(&self) -> bool;

    /// Whether the job has left the engine (ran to completion or was
    /// cancelled before starting).
    fn is_done(&self) -> bool;
}

/// A pool of worker slots.
pub trait Engine: Send + Sync {
    /// Human-readable name of this engine (e.g. "pool").
    fn name(&self) -> &str;

    /// Submit `worker` to run job `id` with the worker end of its channel.
    fn submit(
        &self,
        worker: Arc<dyn Worker>,
        id: JobId,
        channel: WorkerEnd,
    ) -> Result<Box<dyn TaskHandle>, SubmitError>;

    /// Stop accepting work and abandon anything still queued or running.
    fn shutdown(&self);
}

// Compile-time assertion: the engine traits must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Engine, _: &dyn TaskHandle) {}
};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const DONE: u8 = 3;

/// Lifecycle of one job slot, shared between an engine and the
/// [`SlotHandle`] it returns.
///
/// ```text
/// pending -> running -> done
/// pending -> cancelled
/// ```
///
/// `try_claim` and `try_cancel` race on the same compare-exchange, so
/// exactly one of them wins for a pending slot.
#[derive(Debug)]
pub struct SlotState(AtomicU8);

impl SlotState {
    pub fn new() -> Self {
        Self(AtomicU8::new(PENDING))
    }

    /// Move `pending -> running`. Returns `false` if the slot was cancelled.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move `pending -> cancelled`. Returns `false` if already claimed.
    pub fn try_cancel(&self) -> bool {
        self.0
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark a claimed slot as finished.
    pub fn mark_done(&self) {
        self.0.store(DONE, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == PENDING
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_done(&self) -> bool {
        matches!(self.0.load(Ordering::Acquire), CANCELLED | DONE)
    }
}

impl Default for SlotState {
    fn default() -> Self {
        Self::new()
    }
}

/// [`TaskHandle`] backed by a shared [`SlotState`].
#[derive(Debug, Clone)]
pub struct SlotHandle {
    state: Arc<SlotState>,
}

impl SlotHandle {
    pub fn new(state: Arc<SlotState>) -> Self {
        Self { state }
    }
}

impl TaskHandle for SlotHandle {
    fn cancel(&self) -> bool {
        self.state.try_cancel()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }
}
