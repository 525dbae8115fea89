use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use derive_more::{Deref, DerefMut, Display};

use super::{
    Allocator, HalError, Semaphore,
    command::{CommandBuffer, CommandBufferMode, Step, resolve_commands},
    semaphore::{Fence, wait_all},
};
use crate::task::{Executor, SchedulingMode, TaskGraph, Topology};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct DeviceId(uid::Id<DeviceId>);

/// One batch of work handed to a device queue. Within the batch, command
/// buffers execute in order; across batches, ordering exists only through
/// the wait/signal fences.
#[derive(Debug, Default)]
pub struct QueueSubmission {
    pub command_buffers: Vec<Arc<CommandBuffer>>,
    pub wait_fences: Vec<Fence>,
    pub signal_fences: Vec<Fence>,
}

impl QueueSubmission {
    pub fn new(command_buffers: Vec<Arc<CommandBuffer>>) -> Self {
        Self {
            command_buffers,
            ..Default::default()
        }
    }

    pub fn wait(mut self, fence: Fence) -> Self {
        self.wait_fences.push(fence);
        self
    }

    pub fn signal(mut self, fence: Fence) -> Self {
        self.signal_fences.push(fence);
        self
    }
}

/// The submission surface composing buffers, command buffers, executables,
/// and semaphores. The two implementations differ only in submission
/// strategy: [`SyncDevice`] replays inline, [`TaskDevice`] schedules.
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;

    fn allocator(&self) -> Arc<dyn Allocator>;

    fn create_command_buffer(&self, mode: CommandBufferMode) -> Arc<CommandBuffer> {
        CommandBuffer::new(mode)
    }

    fn create_semaphore(&self, initial: u64) -> Result<Arc<Semaphore>, HalError> {
        Ok(Semaphore::new(initial))
    }

    fn queue_submit(&self, submission: QueueSubmission) -> Result<(), HalError>;

    /// Submits one command buffer and blocks until it completes or fails.
    fn submit_and_wait(&self, command_buffer: Arc<CommandBuffer>) -> Result<(), HalError> {
        let semaphore = self.create_semaphore(0)?;
        let fence = Fence::new(semaphore.clone(), 1);
        self.queue_submit(QueueSubmission::new(vec![command_buffer]).signal(fence))?;
        semaphore.wait(1, None)
    }
}

impl std::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("id", &self.id()).finish()
    }
}

/// Replays command buffers inline on the submitting thread. No task graph is
/// built; useful when no threading is available and for deterministic
/// single-threaded testing.
pub struct SyncDevice {
    id: DeviceId,
    allocator: Arc<dyn Allocator>,
}

impl SyncDevice {
    pub fn new(allocator: Arc<dyn Allocator>) -> Arc<Self> {
        Arc::new(Self {
            id: Default::default(),
            allocator,
        })
    }
}

impl Device for SyncDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn queue_submit(&self, submission: QueueSubmission) -> Result<(), HalError> {
        let result: Result<(), HalError> = (|| {
            wait_all(&submission.wait_fences, None)?;
            for command_buffer in &submission.command_buffers {
                for step in resolve_commands(command_buffer.take_commands()?)? {
                    match step {
                        // inline execution is already sequential
                        Step::Barrier => {}
                        Step::Exec(op) => op.execute()?,
                    }
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                for fence in &submission.signal_fences {
                    fence.signal()?;
                }
                Ok(())
            }
            Err(err) => {
                for fence in &submission.signal_fences {
                    fence.semaphore.fail(err.to_string());
                }
                Err(err)
            }
        }
    }
}

/// Decomposes submitted command buffers into task graphs whose edges mirror
/// the recorded execution barriers, scheduled on an owned [`Executor`].
pub struct TaskDevice {
    id: DeviceId,
    allocator: Arc<dyn Allocator>,
    executor: Executor,
    /// Fences this device has promised to signal; failed wholesale on loss.
    outstanding: Mutex<Vec<Fence>>,
    lost: AtomicBool,
}

pub struct TaskDeviceBuilder {
    allocator: Arc<dyn Allocator>,
    topology: Topology,
    mode: SchedulingMode,
}

impl TaskDeviceBuilder {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            topology: Topology::default(),
            mode: SchedulingMode::Deferred,
        }
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn scheduling_mode(mut self, mode: SchedulingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Result<Arc<TaskDevice>, HalError> {
        let executor = Executor::new(self.topology, self.mode)
            .map_err(|err| HalError::UnsupportedConfiguration(err.to_string()))?;
        Ok(Arc::new(TaskDevice {
            id: Default::default(),
            allocator: self.allocator,
            executor,
            outstanding: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
        }))
    }
}

impl TaskDevice {
    pub fn builder(allocator: Arc<dyn Allocator>) -> TaskDeviceBuilder {
        TaskDeviceBuilder::new(allocator)
    }

    #[inline]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Builds the task graph for one submission: wait fences become root
    /// wait tasks, each barrier (and each command-buffer boundary) becomes a
    /// join task gating the next span of commands.
    fn build_graph(&self, submission: &QueueSubmission) -> Result<TaskGraph, HalError> {
        let mut builder = TaskGraph::builder();

        let mut gate = Vec::new();
        for fence in &submission.wait_fences {
            let index = builder
                .wait(&[], fence.semaphore.clone(), fence.value)
                .map_err(HalError::Task)?;
            gate.push(index);
        }

        for command_buffer in &submission.command_buffers {
            let mut span = Vec::new();
            for step in resolve_commands(command_buffer.take_commands()?)? {
                match step {
                    Step::Exec(op) => {
                        let index = builder
                            .call(&gate, move || op.execute().map_err(Into::into))
                            .map_err(HalError::Task)?;
                        span.push(index);
                    }
                    Step::Barrier if span.is_empty() => {}
                    Step::Barrier => {
                        gate = vec![builder.barrier(&span).map_err(HalError::Task)?];
                        span = Vec::new();
                    }
                }
            }
            if !span.is_empty() {
                gate = vec![builder.barrier(&span).map_err(HalError::Task)?];
            }
        }

        for fence in &submission.signal_fences {
            builder.signal(fence.clone());
        }
        Ok(builder.build())
    }

    /// Marks the device lost. Every fence attached to an in-flight
    /// submission fails immediately, which both reports the loss to waiters
    /// and releases suspended wait tasks so the scheduler drains; every
    /// later submission is rejected.
    pub fn mark_lost(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("device {} lost", self.id);
        let outstanding: Vec<_> =
            std::mem::take(&mut *self.outstanding.lock().expect("failed to lock"));
        for fence in outstanding {
            if !fence.is_reached().unwrap_or(true) {
                fence.semaphore.fail(HalError::DeviceLost.to_string());
            }
        }
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Submits and asynchronously awaits every signal fence.
    pub async fn execute(&self, submission: QueueSubmission) -> Result<(), HalError> {
        let fences = submission.signal_fences.clone();
        self.queue_submit(submission)?;
        let waits = fences
            .iter()
            .map(|fence| fence.semaphore.wait_async(fence.value));
        futures::future::try_join_all(waits).await?;
        Ok(())
    }
}

impl Device for TaskDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn queue_submit(&self, submission: QueueSubmission) -> Result<(), HalError> {
        if self.is_lost() {
            return Err(HalError::DeviceLost);
        }
        let graph = self.build_graph(&submission)?;
        {
            let mut outstanding = self.outstanding.lock().expect("failed to lock");
            outstanding.retain(|fence| matches!(fence.is_reached(), Ok(false)));
            outstanding.extend(submission.wait_fences.iter().cloned());
            outstanding.extend(submission.signal_fences.iter().cloned());
        }
        self.executor.submit(graph).map_err(HalError::Task)?;
        self.executor.flush();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Sync,
    Task,
}

/// Worker configuration for [`DeviceKind::Task`]; ignored by the synchronous
/// device.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub topology: Topology,
    pub scheduling_mode: SchedulingMode,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            scheduling_mode: SchedulingMode::Deferred,
        }
    }
}

/// Embedder entry point for device creation.
pub fn create_device(
    kind: DeviceKind,
    params: DeviceParams,
    host_allocator: Arc<dyn Allocator>,
) -> Result<Arc<dyn Device>, HalError> {
    match kind {
        DeviceKind::Sync => Ok(SyncDevice::new(host_allocator)),
        DeviceKind::Task => {
            let device = TaskDevice::builder(host_allocator)
                .topology(params.topology)
                .scheduling_mode(params.scheduling_mode)
                .build()?;
            Ok(device)
        }
    }
}
