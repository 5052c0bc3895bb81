//! The coordinator: accepts client requests, dispatches jobs to the
//! execution engine, watches every job channel and republishes worker
//! events to observers.
//!
//! A single control loop owns the [`Registry`] and all counters. Client
//! requests reach it as commands through a [`CoordinatorHandle`], so no
//! state is ever shared across tasks.

mod handle;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::channel;
use crate::engine::Engine;
use crate::protocol::{ClientMessage, JobId, PoolStatus, ServerMessage};
use crate::registry::{Registry, RegistryError};
use crate::transport::Transport;
use crate::worker::Worker;

pub use handle::CoordinatorHandle;
use handle::Command;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Sleep between polls when no worker has anything to report.
    pub poll_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_backoff: Duration::from_millis(100),
        }
    }
}

/// Job coordinator. See the module docs.
pub struct Coordinator {
    engine: Arc<dyn Engine>,
    worker: Arc<dyn Worker>,
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
    registry: Registry,
    next_id: JobId,
    completed: u64,
    started: bool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("next_id", &self.next_id)
            .field("completed", &self.completed)
            .field("started", &self.started)
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn Engine>,
        worker: Arc<dyn Worker>,
        transport: Arc<dyn Transport>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            engine,
            worker,
            transport,
            config,
            registry: Registry::new(),
            next_id: 1,
            completed: 0,
            started: false,
        }
    }

    /// Enable client request handling. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            tracing::debug!("coordinator already started");
            return;
        }
        self.started = true;
        tracing::info!(engine = self.engine.name(), "coordinator started");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Shut the execution engine down. Running jobs are abandoned, not
    /// drained.
    pub fn stop(&mut self) {
        tracing::info!(in_flight = self.registry.len(), "stopping coordinator");
        self.engine.shutdown();
    }

    /// Current pool counters.
    pub fn status(&self) -> PoolStatus {
        let (queued, running) = self.registry.counts();
        PoolStatus {
            completed: self.completed,
            active: running as u64,
            queued: queued as u64,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply one client request. A no-op until [`Coordinator::start`].
    ///
    /// Only internal invariant violations are returned as errors; bad or
    /// stale requests are absorbed.
    pub async fn handle_client_message(&mut self, msg: ClientMessage) -> Result<(), RegistryError> {
        if !self.started {
            tracing::debug!(?msg, "ignoring client message before start");
            return Ok(());
        }
        match msg {
            ClientMessage::Start => self.queue_work().await,
            ClientMessage::Cancel { id: Some(id) } => {
                self.cancel_one(id, msg).await;
                Ok(())
            }
            ClientMessage::Cancel { id: None } => {
                self.cancel_all(msg).await;
                Ok(())
            }
        }
    }

    async fn queue_work(&mut self) -> Result<(), RegistryError> {
        let id = self.next_id;
        if self.registry.contains(id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let (coordinator_end, worker_end) = channel::duplex(id);
        let handle = match self.engine.submit(Arc::clone(&self.worker), id, worker_end) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(job_id = id, error = %e, "job submission failed");
                return Ok(());
            }
        };
        self.registry.insert(id, handle, coordinator_end)?;
        self.next_id += 1;

        tracing::info!(job_id = id, "job queued");
        self.broadcast_status().await;
        Ok(())
    }

    async fn cancel_one(&mut self, id: JobId, msg: ClientMessage) {
        match self.registry.get(id) {
            Some(job) => {
                tracing::info!(job_id = id, state = %job.state(), "forwarding cancel to worker");
                if let Err(e) = job.send(msg) {
                    tracing::debug!(job_id = id, error = %e, "cancel not delivered");
                }
            }
            None => {
                // The job already ended (or never existed); acknowledge so the
                // client is not left waiting for a terminal event.
                tracing::debug!(job_id = id, "acknowledging cancel for untracked job");
                self.transport.broadcast(&ServerMessage::Cancel { id }).await;
            }
        }
    }

    async fn cancel_all(&mut self, msg: ClientMessage) {
        let cancelled = self.registry.cancel_pending();
        for &id in &cancelled {
            tracing::info!(job_id = id, "cancelled before start");
            self.transport.broadcast(&ServerMessage::Cancel { id }).await;
        }
        let notified = self.registry.broadcast_to_all(&msg);
        tracing::info!(
            cancelled_pending = cancelled.len(),
            notified_workers = notified,
            "global cancel"
        );
        self.broadcast_status().await;
    }

    /// Run one iteration of the monitor loop without sleeping: collect every
    /// available worker message, apply the forwarding policy, broadcast what
    /// it selects and, if anything was broadcast, one pool status.
    ///
    /// Returns the number of worker messages observed.
    pub async fn pump(&mut self) -> usize {
        let batch = self.registry.poll_any(Duration::ZERO).await;
        let mut forwarded = 0;
        for (id, msg) in &batch {
            if self.apply(*id, msg) {
                self.transport.broadcast(msg).await;
                forwarded += 1;
            }
        }
        if forwarded > 0 {
            self.broadcast_status().await;
        }
        batch.len()
    }

    /// The forwarding policy. Updates the registry for `msg`, which arrived
    /// on job `id`'s channel, and decides whether observers see it.
    fn apply(&mut self, id: JobId, msg: &ServerMessage) -> bool {
        match msg {
            ServerMessage::Start { .. } => match self.registry.mark_running(id) {
                Ok(()) => {
                    tracing::info!(job_id = id, "job running");
                    true
                }
                Err(e) => {
                    tracing::debug!(job_id = id, error = %e, "dropping stale start");
                    false
                }
            },
            ServerMessage::Progress { .. } => {
                let tracked = self.registry.contains(id);
                if !tracked {
                    tracing::debug!(job_id = id, "dropping stale progress");
                }
                tracked
            }
            ServerMessage::Finish { .. } => match self.registry.remove(id) {
                Some(job) => {
                    self.completed += 1;
                    tracing::info!(
                        job_id = id,
                        duration_ms = job.elapsed().num_milliseconds(),
                        "job finished"
                    );
                    true
                }
                None => {
                    tracing::debug!(job_id = id, "dropping stale finish");
                    false
                }
            },
            ServerMessage::Error { .. } => match self.registry.remove(id) {
                Some(_) => {
                    tracing::warn!(job_id = id, "job failed");
                    true
                }
                None => {
                    tracing::debug!(job_id = id, "dropping stale error");
                    false
                }
            },
            ServerMessage::Cancel { .. } => {
                match self.registry.remove(id) {
                    Some(_) => tracing::info!(job_id = id, "job cancelled"),
                    None => tracing::debug!(job_id = id, "acknowledging late cancel"),
                }
                true
            }
            ServerMessage::Status(_) => {
                tracing::warn!(job_id = id, "ignoring pool status sent by a worker");
                false
            }
        }
    }

    async fn broadcast_status(&self) {
        self.transport
            .broadcast(&ServerMessage::Status(self.status()))
            .await;
    }

    /// Start the coordinator on its own task. The returned handle is the
    /// only way to reach it afterwards; the join handle resolves once the
    /// loop has stopped the engine.
    pub fn spawn(mut self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.start();
        let task = tokio::spawn(self.run(rx));
        (CoordinatorHandle::new(tx), task)
    }

    /// The monitor loop. Client commands are serviced between polls,
    /// including while backing off.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            loop {
                match commands.try_recv() {
                    Ok(cmd) => {
                        if !self.execute(cmd).await {
                            return self.stop();
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.stop(),
                }
            }

            if self.pump().await > 0 {
                continue;
            }

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.execute(cmd).await {
                            return self.stop();
                        }
                    }
                    None => return self.stop(),
                },
                _ = tokio::time::sleep(self.config.poll_backoff) => {}
            }
        }
    }

    /// Returns `false` when the loop should exit.
    async fn execute(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Client(msg) => {
                if let Err(e) = self.handle_client_message(msg).await {
                    tracing::error!(error = %e, ?msg, "coordinator invariant violated");
                }
                true
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
                true
            }
            Command::Stop => false,
        }
    }
}
