use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use super::{
    TaskError,
    graph::{TaskGraph, TaskPayload},
    scope::{PendingCounter, Scope},
};
use crate::hal::HalError;

/// One worker thread in the executor's fixed topology. The optional core
/// index is advisory: it names the thread for diagnostics and is available to
/// embedder thread hooks, but the executor performs no OS-level pinning.
#[derive(Debug, Clone)]
pub struct WorkerGroup {
    pub name: String,
    pub core: Option<usize>,
}

impl WorkerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            core: None,
        }
    }

    pub fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }
}

/// The fixed set of worker groups an executor is built from. Immutable for
/// the executor's lifetime.
#[derive(Debug, Clone)]
pub struct Topology {
    groups: Vec<WorkerGroup>,
}

impl Topology {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn with_group_count(count: usize) -> Self {
        let groups = (0..count)
            .map(|index| WorkerGroup::new(format!("worker-{index}")))
            .collect();
        Self { groups }
    }

    pub fn push_group(mut self, group: WorkerGroup) -> Self {
        self.groups.push(group);
        self
    }

    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn groups(&self) -> &[WorkerGroup] {
        &self.groups
    }
}

impl Default for Topology {
    /// One worker per available hardware thread.
    fn default() -> Self {
        let count = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_group_count(count)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Tasks run on the worker pool; `submit` stages work and returns.
    #[default]
    Deferred,
    /// Tasks run to completion on the submitting thread. No worker threads
    /// are spawned and wait tasks block inline; useful when determinism
    /// matters more than parallelism.
    Inline,
}

const STATE_UNSCHEDULED: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_COMPLETE: u8 = 3;
const STATE_ABORTED: u8 = 4;

struct NodeState {
    state: AtomicU8,
    /// Predecessors not yet retired; the transition to zero makes the node
    /// ready.
    remaining: AtomicUsize,
    payload: Mutex<Option<TaskPayload>>,
    /// Set by the semaphore callback before a suspended wait task re-queues.
    wait_outcome: Mutex<Option<Result<u64, HalError>>>,
    dependents: Vec<usize>,
}

struct GraphState {
    nodes: Vec<NodeState>,
    scope: Scope,
    sender: flume::Sender<Runnable>,
}

struct Runnable {
    graph: Arc<GraphState>,
    index: usize,
}

/// A dependency-aware work executor over a fixed pool of worker threads.
///
/// Built once by the embedder, shut down explicitly (or on drop). Submitted
/// [`TaskGraph`]s execute with the ordering guarantee that a task never
/// starts before all of its declared predecessors have retired; unrelated
/// tasks may run in any order or in parallel.
pub struct Executor {
    mode: SchedulingMode,
    topology: Topology,
    sender: Mutex<Option<flume::Sender<Runnable>>>,
    /// Held only in [`SchedulingMode::Inline`], where the submitting thread
    /// plays the worker.
    receiver: Option<flume::Receiver<Runnable>>,
    staged: Mutex<Vec<Runnable>>,
    pending: Arc<PendingCounter>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(topology: Topology, mode: SchedulingMode) -> Result<Self, TaskError> {
        if mode == SchedulingMode::Deferred && topology.group_count() == 0 {
            return Err(TaskError::Topology(
                "deferred scheduling requires at least one worker group".into(),
            ));
        }

        let (sender, receiver) = flume::unbounded::<Runnable>();
        let mut workers = Vec::new();
        let receiver = match mode {
            SchedulingMode::Inline => Some(receiver),
            SchedulingMode::Deferred => {
                for group in topology.groups() {
                    let receiver = receiver.clone();
                    let handle = std::thread::Builder::new()
                        .name(group.name.clone())
                        .spawn(move || worker(receiver))
                        .map_err(|err| TaskError::Topology(err.to_string()))?;
                    workers.push(handle);
                }
                None
            }
        };

        Ok(Self {
            mode,
            topology,
            sender: Mutex::new(Some(sender)),
            receiver,
            staged: Mutex::new(Vec::new()),
            pending: Arc::new(PendingCounter::default()),
            workers: Mutex::new(workers),
        })
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[inline]
    pub fn mode(&self) -> SchedulingMode {
        self.mode
    }

    /// Links `graph` into the pool. In deferred mode the root tasks are
    /// staged until [`flush`](Self::flush); in inline mode the whole graph
    /// runs to completion before `submit` returns.
    pub fn submit(&self, graph: TaskGraph) -> Result<(), TaskError> {
        let sender = {
            let guard = self.sender.lock().expect("failed to lock");
            guard.clone().ok_or(TaskError::Shutdown)?
        };

        let nodes: Vec<_> = graph
            .nodes
            .into_iter()
            .map(|node| NodeState {
                state: AtomicU8::new(STATE_UNSCHEDULED),
                remaining: AtomicUsize::new(node.predecessors),
                payload: Mutex::new(Some(node.payload)),
                wait_outcome: Mutex::new(None),
                dependents: node.dependents,
            })
            .collect();

        self.pending.begin();
        // an empty graph retires through the same path as its last task
        let scope = Scope::new(nodes.len().max(1), graph.completion, self.pending.clone());
        let state = Arc::new(GraphState {
            nodes,
            scope,
            sender,
        });

        if state.nodes.is_empty() {
            state.scope.retire_one();
            return Ok(());
        }

        let roots: Vec<_> = (0..state.nodes.len())
            .filter(|&index| state.nodes[index].remaining.load(Ordering::Acquire) == 0)
            .collect();
        for &index in &roots {
            state.nodes[index].state.store(STATE_READY, Ordering::Release);
        }
        let runnables = roots.into_iter().map(|index| Runnable {
            graph: state.clone(),
            index,
        });

        match self.mode {
            SchedulingMode::Deferred => {
                self.staged.lock().expect("failed to lock").extend(runnables);
            }
            SchedulingMode::Inline => {
                for runnable in runnables {
                    _ = state.sender.send(runnable);
                }
                let receiver = self.receiver.as_ref().expect("inline executor has receiver");
                while let Ok(runnable) = receiver.try_recv() {
                    runnable.run(true);
                }
            }
        }
        Ok(())
    }

    /// Moves staged root tasks into the worker pool.
    pub fn flush(&self) {
        let staged: Vec<_> = std::mem::take(&mut *self.staged.lock().expect("failed to lock"));
        for runnable in staged {
            let sender = runnable.graph.sender.clone();
            _ = sender.send(runnable);
        }
    }

    /// Flushes and blocks until every submitted graph has retired.
    pub fn drain(&self, deadline: Option<Duration>) -> Result<(), TaskError> {
        self.flush();
        match self.pending.wait_idle(deadline) {
            true => Ok(()),
            false => Err(TaskError::Timeout),
        }
    }

    /// Flushes outstanding work, waits for it to retire, and joins the worker
    /// threads. Subsequent submissions fail with [`TaskError::Shutdown`].
    pub fn shutdown(&self) {
        self.flush();
        let sender = self.sender.lock().expect("failed to lock").take();
        drop(sender);
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().expect("failed to lock"));
        for handle in workers {
            if let Err(err) = handle.join() {
                log::error!("worker panicked: {err:?}");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(receiver: flume::Receiver<Runnable>) {
    // exits when every sender (executor and in-flight graphs) is gone
    while let Ok(runnable) = receiver.recv() {
        runnable.run(false);
    }
}

impl Runnable {
    fn run(self, inline: bool) {
        let Self { graph, index } = self;
        let node = &graph.nodes[index];

        if graph.scope.is_failed() {
            // upstream failure: drop the payload without running it
            node.payload.lock().expect("failed to lock").take();
            graph.finish(index, STATE_ABORTED);
            return;
        }

        let payload = node.payload.lock().expect("failed to lock").take();
        match payload {
            None => {
                // a wait task resuming after its semaphore callback fired
                let outcome = node
                    .wait_outcome
                    .lock()
                    .expect("failed to lock")
                    .take()
                    .expect("resumed wait task must have an outcome");
                graph.finish_wait(index, outcome);
            }
            Some(TaskPayload::Barrier) => graph.finish(index, STATE_COMPLETE),
            Some(TaskPayload::Call(f)) => {
                node.state.store(STATE_RUNNING, Ordering::Release);
                match f() {
                    Ok(()) => graph.finish(index, STATE_COMPLETE),
                    Err(err) => {
                        log::warn!("task {index} failed: {err}");
                        graph.scope.try_fail(err);
                        graph.finish(index, STATE_ABORTED);
                    }
                }
            }
            Some(TaskPayload::Wait { semaphore, value }) => {
                if inline {
                    let outcome = semaphore.wait(value, None).map(|()| value);
                    graph.finish_wait(index, outcome);
                    return;
                }
                match semaphore.query() {
                    Err(err) => graph.finish_wait(index, Err(err)),
                    Ok(current) if current >= value => graph.finish(index, STATE_COMPLETE),
                    Ok(_) => {
                        // suspend: re-queue through the semaphore instead of
                        // holding this worker
                        let resumed = graph.clone();
                        semaphore.on_reach(
                            value,
                            Box::new(move |outcome| {
                                *resumed.nodes[index]
                                    .wait_outcome
                                    .lock()
                                    .expect("failed to lock") = Some(outcome);
                                let sender = resumed.sender.clone();
                                _ = sender.send(Runnable {
                                    graph: resumed,
                                    index,
                                });
                            }),
                        );
                    }
                }
            }
        }
    }
}

impl GraphState {
    fn finish_wait(self: &Arc<Self>, index: usize, outcome: Result<u64, HalError>) {
        match outcome {
            Ok(_) => self.finish(index, STATE_COMPLETE),
            Err(err) => {
                self.scope.try_fail(err.into());
                self.finish(index, STATE_ABORTED);
            }
        }
    }

    /// Retires a task and readies any dependent whose last predecessor this
    /// was.
    fn finish(self: &Arc<Self>, index: usize, state: u8) {
        let node = &self.nodes[index];
        node.state.store(state, Ordering::Release);
        for &dependent in &node.dependents {
            if self.nodes[dependent].remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.nodes[dependent]
                    .state
                    .store(STATE_READY, Ordering::Release);
                _ = self.sender.send(Runnable {
                    graph: self.clone(),
                    index: dependent,
                });
            }
        }
        self.scope.retire_one();
    }
}
