//! Core of the workpool job coordinator.
//!
//! Clients ask for jobs to be started or cancelled; the [`coordinator`]
//! hands each job to an execution [`engine`] together with the worker end
//! of a private [`channel`], tracks it in the [`registry`], and republishes
//! the [`worker`]'s events to every observer through a [`transport`].
//! The JSON message shapes on both sides live in [`protocol`].

pub mod channel;
pub mod coordinator;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod worker;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle};
pub use engine::{Engine, PoolEngine, SubmitError, TaskHandle};
pub use protocol::{ClientMessage, JobId, PoolStatus, ProtocolError, ServerMessage};
pub use transport::{BroadcastTransport, Transport};
pub use worker::{SimulatedWorker, SimulationConfig, Worker};
