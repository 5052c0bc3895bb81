//! A worker that simulates a long-running task.
//!
//! Each job picks a random lifespan in ticks, sleeps one tick at a time,
//! reports progress every few ticks and checks for a cancel on every tick.

use std::time::Duration;

use rand::Rng;

use super::Worker;
use crate::channel::{ChannelError, WorkerEnd};
use crate::protocol::{JobId, ServerMessage};

/// Tuning for [`SimulatedWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Sleep between steps.
    pub tick: Duration,
    /// Shortest lifespan, in ticks.
    pub min_ticks: u64,
    /// Longest lifespan, in ticks (inclusive).
    pub max_ticks: u64,
    /// Report progress every this many ticks.
    pub progress_every: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            min_ticks: 30,
            max_ticks: 150,
            progress_every: 10,
        }
    }
}

/// Worker whose "work" is sleeping for a random number of ticks.
#[derive(Debug, Clone, Default)]
pub struct SimulatedWorker {
    config: SimulationConfig,
}

impl SimulatedWorker {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn lifespan(&self) -> u64 {
        let lo = self.config.min_ticks.max(1);
        let hi = self.config.max_ticks.max(lo);
        rand::rng().random_range(lo..=hi)
    }

    fn simulate(&self, id: JobId, lifespan: u64, channel: &mut WorkerEnd) -> Result<(), ChannelError> {
        let every = self.config.progress_every.max(1);
        channel.send(ServerMessage::Start { id, max: lifespan })?;

        let mut tick = 0;
        loop {
            if channel.cancel_requested() {
                tracing::debug!(job_id = id, tick, "simulated job cancelled");
                return channel.send(ServerMessage::Cancel { id });
            }
            if tick >= lifespan {
                channel.send(ServerMessage::Progress {
                    id,
                    value: lifespan,
                    max: lifespan,
                })?;
                return channel.send(ServerMessage::Finish { id });
            }
            if tick % every == 0 {
                channel.send(ServerMessage::Progress {
                    id,
                    value: tick,
                    max: lifespan,
                })?;
            }
            std::thread::sleep(self.config.tick);
            tick += 1;
        }
    }
}

impl Worker for SimulatedWorker {
    fn run(&self, id: JobId, mut channel: WorkerEnd) {
        if channel.cancel_requested() {
            tracing::debug!(job_id = id, "cancelled before start");
            let _ = channel.send(ServerMessage::Cancel { id });
            return;
        }

        let lifespan = self.lifespan();
        if let Err(e) = self.simulate(id, lifespan, &mut channel) {
            tracing::warn!(job_id = id, error = %e, "simulated job failed");
            let _ = channel.send(ServerMessage::Error { id });
        }
    }
}
