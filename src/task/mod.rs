//! Cooperative task scheduling: DAGs of host work executed on a fixed worker
//! topology with explicit dependency ordering and failure propagation.

use thiserror::Error;

use crate::hal::HalError;

pub use executor::{Executor, SchedulingMode, Topology, WorkerGroup};
pub use graph::{GraphId, TaskGraph, TaskGraphBuilder, TaskPayload};

pub mod executor;
pub mod graph;
pub(crate) mod scope;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("aborted by upstream failure: {0}")]
    Aborted(String),
    #[error("executor is shut down")]
    Shutdown,
    #[error("deadline elapsed before the executor drained")]
    Timeout,
    #[error("task {to} cannot depend on later task {from}")]
    InvalidEdge { from: usize, to: usize },
    #[error("invalid worker topology: {0}")]
    Topology(String),
}

impl From<HalError> for TaskError {
    fn from(err: HalError) -> Self {
        Self::Failed(err.to_string())
    }
}
