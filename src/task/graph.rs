use std::sync::Arc;

use derive_more::{Deref, DerefMut, Display};

use super::TaskError;
use crate::hal::{Fence, Semaphore};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct GraphId(uid::Id<GraphId>);

pub type CallFn = Box<dyn FnOnce() -> Result<(), TaskError> + Send>;

/// What a task does once all of its predecessors have completed.
pub enum TaskPayload {
    /// Invoke a host function on a worker thread.
    Call(CallFn),
    /// Suspend until an external semaphore reaches `value`. Suspension is
    /// cooperative: the executor re-queues the task instead of parking a
    /// worker on it.
    Wait { semaphore: Arc<Semaphore>, value: u64 },
    /// Pure join point: completes as soon as its predecessors have.
    Barrier,
}

impl std::fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPayload::Call(_) => f.write_str("Call"),
            TaskPayload::Wait { value, .. } => write!(f, "Wait({value})"),
            TaskPayload::Barrier => f.write_str("Barrier"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskNode {
    pub payload: TaskPayload,
    /// Number of tasks that must complete before this one becomes ready.
    pub predecessors: usize,
    /// Tasks whose predecessor counts drop when this one completes.
    pub dependents: Vec<usize>,
}

/// A DAG of tasks submitted to an [`Executor`](super::Executor) as one unit.
///
/// Nodes live in an arena and name each other by index, so workers can
/// traverse edges concurrently without aliasing hazards. Construction through
/// [`TaskGraphBuilder`] only permits edges from earlier tasks, which makes a
/// cycle unrepresentable.
#[derive(Debug)]
pub struct TaskGraph {
    pub(crate) id: GraphId,
    pub(crate) nodes: Vec<TaskNode>,
    pub(crate) completion: Vec<Fence>,
}

impl TaskGraph {
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::default()
    }

    #[inline]
    pub fn id(&self) -> GraphId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<TaskNode>,
    completion: Vec<Fence>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, payload: TaskPayload, deps: &[usize]) -> Result<usize, TaskError> {
        let index = self.nodes.len();
        for &dep in deps {
            if dep >= index {
                return Err(TaskError::InvalidEdge {
                    from: dep,
                    to: index,
                });
            }
        }
        for &dep in deps {
            self.nodes[dep].dependents.push(index);
        }
        self.nodes.push(TaskNode {
            payload,
            predecessors: deps.len(),
            dependents: Vec::new(),
        });
        Ok(index)
    }

    /// Appends a host-call task. Returns its index for use as a dependency.
    pub fn call<F>(&mut self, deps: &[usize], f: F) -> Result<usize, TaskError>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.push(TaskPayload::Call(Box::new(f)), deps)
    }

    /// Appends a task that waits on an external semaphore.
    pub fn wait(
        &mut self,
        deps: &[usize],
        semaphore: Arc<Semaphore>,
        value: u64,
    ) -> Result<usize, TaskError> {
        self.push(TaskPayload::Wait { semaphore, value }, deps)
    }

    /// Appends a join point over `deps`.
    pub fn barrier(&mut self, deps: &[usize]) -> Result<usize, TaskError> {
        self.push(TaskPayload::Barrier, deps)
    }

    /// Registers a fence to signal when every task completes, or to fail with
    /// the original error when the graph aborts.
    pub fn signal(&mut self, fence: Fence) -> &mut Self {
        self.completion.push(fence);
        self
    }

    pub fn build(self) -> TaskGraph {
        TaskGraph {
            id: GraphId(uid::Id::new()),
            nodes: self.nodes,
            completion: self.completion,
        }
    }
}
