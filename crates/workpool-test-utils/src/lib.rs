//! Shared test utilities for workpool integration tests.
//!
//! - [`RecordingTransport`] keeps every broadcast so tests can assert on the
//!   exact observer-visible stream.
//! - [`ManualEngine`] runs nothing: tests claim a job's worker end and play
//!   the worker themselves, which makes races deterministic.
//! - [`GatedWorker`] is a real worker whose jobs run until a test opens
//!   their gate (or cancels them).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use workpool_core::channel::WorkerEnd;
use workpool_core::engine::{Engine, SlotHandle, SlotState, SubmitError, TaskHandle};
use workpool_core::protocol::{JobId, PoolStatus, ServerMessage};
use workpool_core::transport::Transport;
use workpool_core::worker::Worker;

/// Upper bound for every wait helper in this crate.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// Transport that records every broadcast in order.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    messages: Mutex<Vec<ServerMessage>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything broadcast so far.
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Everything broadcast so far, clearing the record.
    pub fn take(&self) -> Vec<ServerMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    /// Only the pool status broadcasts.
    pub fn statuses(&self) -> Vec<PoolStatus> {
        self.messages()
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Wait until the recorded stream satisfies `pred`, then return it.
    ///
    /// Panics after [`WAIT_TIMEOUT`] with the stream seen so far.
    pub async fn wait_until<F>(&self, pred: F) -> Vec<ServerMessage>
    where
        F: Fn(&[ServerMessage]) -> bool,
    {
        let result = tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let seen = self.messages();
                if pred(&seen) {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        match result {
            Ok(seen) => seen,
            Err(_) => panic!("condition not met; recorded: {:?}", self.messages()),
        }
    }

    /// Wait until `msg` has been broadcast.
    pub async fn wait_for(&self, msg: ServerMessage) -> Vec<ServerMessage> {
        self.wait_until(|seen| seen.contains(&msg)).await
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn broadcast(&self, message: &ServerMessage) {
        tracing::trace!(?message, "recorded broadcast");
        self.messages.lock().unwrap().push(*message);
    }
}

// ---------------------------------------------------------------------------
// ManualEngine
// ---------------------------------------------------------------------------

struct Submitted {
    slot: Arc<SlotState>,
    channel: Option<WorkerEnd>,
}

/// Engine that never runs workers on its own.
///
/// Each submission is parked until the test calls [`ManualEngine::claim`],
/// which moves it to running (unless it was cancelled first) and hands
/// back the worker end.
#[derive(Default)]
pub struct ManualEngine {
    jobs: Mutex<HashMap<JobId, Submitted>>,
    order: Mutex<Vec<JobId>>,
    reject: AtomicBool,
    shut_down: AtomicBool,
}

impl ManualEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `submit` fail until switched off again.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Ids submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<JobId> {
        self.order.lock().unwrap().clone()
    }

    /// Claim job `id`'s slot and take its worker end. Returns `None` if the
    /// job is unknown, already claimed or was cancelled while pending.
    pub fn claim(&self, id: JobId) -> Option<WorkerEnd> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id)?;
        if !job.slot.try_claim() {
            return None;
        }
        job.channel.take()
    }

    /// Whether job `id` is still waiting for a slot.
    pub fn is_pending(&self, id: JobId) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|job| job.slot.is_pending())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Engine for ManualEngine {
    fn name(&self) -> &str {
        "manual"
    }

    fn submit(
        &self,
        _worker: Arc<dyn Worker>,
        id: JobId,
        channel: WorkerEnd,
    ) -> Result<Box<dyn TaskHandle>, SubmitError> {
        if self.is_shut_down() {
            return Err(SubmitError::ShutDown);
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(SubmitError::Rejected {
                id,
                reason: "rejecting submissions".to_string(),
            });
        }
        let slot = Arc::new(SlotState::new());
        self.jobs.lock().unwrap().insert(
            id,
            Submitted {
                slot: Arc::clone(&slot),
                channel: Some(channel),
            },
        );
        self.order.lock().unwrap().push(id);
        Ok(Box::new(SlotHandle::new(slot)))
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// GatedWorker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GateState {
    open: HashSet<JobId>,
    all: bool,
}

/// Opens the gates of jobs run by a [`GatedWorker`].
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<GateState>, Condvar)>,
}

impl Gate {
    /// Let job `id` finish.
    pub fn open(&self, id: JobId) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().open.insert(id);
        cvar.notify_all();
    }

    /// Let every current and future job finish.
    pub fn open_all(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().all = true;
        cvar.notify_all();
    }

    fn is_open(&self, id: JobId) -> bool {
        let (lock, _) = &*self.state;
        let state = lock.lock().unwrap();
        state.all || state.open.contains(&id)
    }

    fn wait(&self, timeout: Duration) {
        let (lock, cvar) = &*self.state;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, timeout).unwrap();
    }
}

/// Worker that sends `start { max }`, then waits for its gate while
/// honouring cancels, then completes normally.
#[derive(Clone)]
pub struct GatedWorker {
    max: u64,
    gate: Gate,
}

impl GatedWorker {
    pub fn new(max: u64) -> (Self, Gate) {
        let gate = Gate::default();
        (
            Self {
                max,
                gate: gate.clone(),
            },
            gate,
        )
    }
}

impl Worker for GatedWorker {
    fn run(&self, id: JobId, mut channel: WorkerEnd) {
        if channel.cancel_requested() {
            let _ = channel.send(ServerMessage::Cancel { id });
            return;
        }
        let max = self.max;
        let _ = channel.send(ServerMessage::Start { id, max });
        loop {
            if channel.cancel_requested() {
                let _ = channel.send(ServerMessage::Cancel { id });
                return;
            }
            if self.gate.is_open(id) {
                let _ = channel.send(ServerMessage::Progress { id, value: max, max });
                let _ = channel.send(ServerMessage::Finish { id });
                return;
            }
            self.gate.wait(Duration::from_millis(5));
        }
    }
}

