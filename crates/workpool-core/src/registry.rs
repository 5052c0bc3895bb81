//! In-memory registry of in-flight jobs.
//!
//! A job is present exactly while it is queued or running. The registry is
//! owned by the coordinator's control loop, which is its only writer, so it
//! carries no locks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::channel::{ChannelError, CoordinatorEnd};
use crate::engine::TaskHandle;
use crate::protocol::{ClientMessage, JobId, ServerMessage};

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0} is already registered")]
    DuplicateId(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),
}

/// Lifecycle state of a job.
///
/// `Finished` is never stored: a job is removed from the registry the
/// moment it reaches it, and only the removed entry carries the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Finished,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// One tracked job.
pub struct Job {
    id: JobId,
    state: JobState,
    started_at: DateTime<Utc>,
    handle: Box<dyn TaskHandle>,
    channel: CoordinatorEnd,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// When the coordinator accepted the job.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the job was accepted.
    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    /// Send a message to this job's worker.
    pub fn send(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        self.channel.send(msg)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .field("channel_closed", &self.channel.is_closed())
            .finish()
    }
}

type Pending<'a> = Pin<Box<dyn Future<Output = (JobId, Option<ServerMessage>)> + Send + 'a>>;

/// Jobs keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    jobs: HashMap<JobId, Job>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in state `Queued`.
    pub fn insert(
        &mut self,
        id: JobId,
        handle: Box<dyn TaskHandle>,
        channel: CoordinatorEnd,
    ) -> Result<(), RegistryError> {
        if self.jobs.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        self.jobs.insert(
            id,
            Job {
                id,
                state: JobState::Queued,
                started_at: Utc::now(),
                handle,
                channel,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Mark a job as running.
    pub fn mark_running(&mut self, id: JobId) -> Result<(), RegistryError> {
        let job = self.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        job.state = JobState::Running;
        Ok(())
    }

    /// Remove a job regardless of its state. The returned entry is marked
    /// `Finished`.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let mut job = self.jobs.remove(&id)?;
        job.state = JobState::Finished;
        Some(job)
    }

    /// Try to cancel every queued job through its engine handle.
    ///
    /// Jobs the engine confirms never started are removed; their ids are
    /// returned, each exactly once, in no particular order. Jobs that have
    /// already claimed a slot stay registered.
    pub fn cancel_pending(&mut self) -> Vec<JobId> {
        let cancelled: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued && job.handle.cancel())
            .map(|job| job.id)
            .collect();
        for id in &cancelled {
            self.jobs.remove(id);
        }
        cancelled
    }

    /// Send `msg` to every job. Returns how many sends succeeded.
    pub fn broadcast_to_all(&self, msg: &ClientMessage) -> usize {
        self.broadcast_where(msg, |_| true)
    }

    /// Send `msg` to every running job. Returns how many sends succeeded.
    pub fn broadcast_to_running(&self, msg: &ClientMessage) -> usize {
        self.broadcast_where(msg, |job| job.state == JobState::Running)
    }

    fn broadcast_where(&self, msg: &ClientMessage, include: impl Fn(&Job) -> bool) -> usize {
        let mut delivered = 0;
        for job in self.jobs.values().filter(|job| include(job)) {
            match job.send(*msg) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(job_id = job.id, error = %e, "dropping message for unreachable worker");
                }
            }
        }
        delivered
    }

    /// Count jobs by state, as `(queued, running)`.
    pub fn counts(&self) -> (usize, usize) {
        self.jobs
            .values()
            .fold((0, 0), |(queued, running), job| match job.state {
                JobState::Queued => (queued + 1, running),
                JobState::Running => (queued, running + 1),
                JobState::Finished => (queued, running),
            })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Ids of all registered jobs, ascending.
    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Collect every message available on any job channel.
    ///
    /// With a zero `timeout` this never waits. Otherwise, if nothing is
    /// buffered yet, it waits up to `timeout` for any live channel to
    /// produce a message and then drains everything available. Messages
    /// from one job keep their send order.
    pub async fn poll_any(&mut self, timeout: Duration) -> Vec<(JobId, ServerMessage)> {
        let mut batch = self.drain_ready();
        if !batch.is_empty() || timeout.is_zero() {
            return batch;
        }

        let first = {
            let mut waiters: Vec<Pending<'_>> = Vec::with_capacity(self.jobs.len());
            for (&id, job) in self.jobs.iter_mut() {
                if job.channel.is_closed() {
                    continue;
                }
                let channel = &mut job.channel;
                waiters.push(Box::pin(async move { (id, channel.recv().await) }));
            }
            if waiters.is_empty() {
                return batch;
            }
            match tokio::time::timeout(timeout, futures::future::select_all(waiters)).await {
                Ok(((id, msg), _, _)) => msg.map(|msg| (id, msg)),
                Err(_) => None,
            }
        };

        batch.extend(first);
        batch.extend(self.drain_ready());
        batch
    }

    fn drain_ready(&mut self) -> Vec<(JobId, ServerMessage)> {
        let mut batch = Vec::new();
        for (&id, job) in self.jobs.iter_mut() {
            if job.channel.is_closed() {
                continue;
            }
            loop {
                match job.channel.try_recv() {
                    Ok(Some(msg)) => batch.push((id, msg)),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            job_id = id,
                            state = %job.state,
                            engine_done = job.handle.is_done(),
                            error = %e,
                            "worker hung up without a terminal message; job stays registered until cancelled"
                        );
                        break;
                    }
                }
            }
        }
        batch
    }
}
