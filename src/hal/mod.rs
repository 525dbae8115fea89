//! Hardware abstraction layer: buffers, semaphores, command buffers, and
//! devices. Devices compose the other objects into a single submission
//! surface; the [`crate::vm`] reaches them through the [`module`] import
//! table.

use thiserror::Error;

use crate::task::TaskError;

pub use buffer::{
    Allocator, Buffer, BufferUsage, BufferView, Element, ElementType, HeapAllocator, MemoryType,
};
pub use command::{
    Command, CommandBuffer, CommandBufferMode, DescriptorBinding, DescriptorSet, DispatchState,
    Executable, ExecutableBuilder,
};
pub use device::{
    Device, DeviceId, DeviceKind, DeviceParams, QueueSubmission, SyncDevice, TaskDevice,
    TaskDeviceBuilder, create_device,
};
pub use module::HalModule;
pub use semaphore::{Fence, Semaphore, wait_all, wait_any};

pub mod buffer;
pub mod command;
pub mod device;
pub mod module;
pub mod semaphore;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("range [{offset}, +{length}) out of bounds for capacity {capacity}")]
    OutOfRange {
        offset: usize,
        length: usize,
        capacity: usize,
    },
    #[error("allocating {requested} bytes exceeds heap capacity ({allocated}/{capacity} in use)")]
    OutOfMemory {
        requested: usize,
        allocated: usize,
        capacity: usize,
    },
    #[error("buffer does not support the requested usage: {0}")]
    UnsupportedUsage(String),
    #[error("semaphore value {value} is behind the signaled value {current}")]
    NotMonotonic { value: u64, current: u64 },
    #[error("semaphore already failed: {0}")]
    AlreadyFailed(String),
    #[error("deadline elapsed before the condition was reached")]
    Timeout,
    #[error("device lost")]
    DeviceLost,
    #[error("command buffer {state}, expected {expected}")]
    Recording {
        state: &'static str,
        expected: &'static str,
    },
    #[error("unsupported device configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("executable has no entry point {0}")]
    EntryPointNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Task(#[from] TaskError),
}
