//! The worker contract: what a unit of work must do when the execution
//! engine runs it.
//!
//! A worker receives its job id and the worker end of the job channel and
//! runs synchronously on an engine thread. Before returning it must:
//!
//! 1. Optionally check once for a cancel before doing anything; if one is
//!    pending, send `cancel` and return without ever sending `start`.
//! 2. Otherwise send exactly one `start { id, max }` first.
//! 3. Check for a cancel periodically; on one, send `cancel` and return.
//! 4. Send `progress { id, value, max }` from time to time, with `value`
//!    never decreasing.
//! 5. On success send `progress { id, max, max }` followed by `finish`.
//! 6. On an unrecoverable failure send `error` in place of `finish`.
//!
//! Exactly one of `finish`, `error`, `cancel` is sent, always last. The
//! coordinator's bookkeeping depends on it: a job is only removed from the
//! registry when its terminal message arrives.

pub mod simulated;

use crate::channel::WorkerEnd;
use crate::protocol::JobId;

pub use simulated::{SimulatedWorker, SimulationConfig};

/// A body of work the execution engine can run.
pub trait Worker: Send + Sync + 'static {
    /// Run job `id` to completion, reporting over `channel`.
    fn run(&self, id: JobId, channel: WorkerEnd);
}

impl<F> Worker for F
where
    F: Fn(JobId, WorkerEnd) + Send + Sync + 'static,
{
    fn run(&self, id: JobId, channel: WorkerEnd) {
        self(id, channel)
    }
}

// Compile-time assertion: Worker must be usable as `dyn Worker`.
const _: () = {
    fn _assert_object_safe(_: &dyn Worker) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::duplex;
    use crate::protocol::ServerMessage;
    use std::sync::Arc;

    #[test]
    fn closures_are_workers() {
        let worker: Arc<dyn Worker> = Arc::new(|id: JobId, channel: WorkerEnd| {
            let _ = channel.send(ServerMessage::Start { id, max: 1 });
            let _ = channel.send(ServerMessage::Finish { id });
        });

        let (mut coord, worker_end) = duplex(1);
        worker.run(1, worker_end);

        assert_eq!(
            coord.try_recv().unwrap(),
            Some(ServerMessage::Start { id: 1, max: 1 })
        );
        assert_eq!(coord.try_recv().unwrap(), Some(ServerMessage::Finish { id: 1 }));
    }
}
