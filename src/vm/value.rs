use std::sync::{Arc, RwLock};

use derive_more::{Display, From};

use crate::hal::{
    Allocator, Buffer, BufferView, CommandBuffer, DescriptorSet, Executable, Semaphore,
};

/// The closed set of ref kinds the VM can hold. Dispatch happens at the
/// handle level; there is no inheritance hierarchy behind these.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    #[display("hal.allocator")]
    Allocator,
    #[display("hal.buffer")]
    Buffer,
    #[display("hal.buffer_view")]
    BufferView,
    #[display("hal.command_buffer")]
    CommandBuffer,
    #[display("hal.descriptor_set")]
    DescriptorSet,
    #[display("hal.executable")]
    Executable,
    #[display("hal.semaphore")]
    Semaphore,
    #[display("util.list")]
    List,
    #[display("util.bytes")]
    Bytes,
}

impl RefType {
    /// Resolves a module type-table entry. Unknown names fail the load.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "hal.allocator" => Some(Self::Allocator),
            "hal.buffer" => Some(Self::Buffer),
            "hal.buffer_view" => Some(Self::BufferView),
            "hal.command_buffer" => Some(Self::CommandBuffer),
            "hal.descriptor_set" => Some(Self::DescriptorSet),
            "hal.executable" => Some(Self::Executable),
            "hal.semaphore" => Some(Self::Semaphore),
            "util.list" => Some(Self::List),
            "util.bytes" => Some(Self::Bytes),
            _ => None,
        }
    }
}

/// A typed, reference-counted VM value. Cloning retains (atomically, since
/// refs cross worker threads); dropping releases; the object is destroyed
/// when the last handle drops.
#[derive(Clone)]
pub enum RefValue {
    Allocator(Arc<dyn Allocator>),
    Buffer(Arc<Buffer>),
    BufferView(Arc<BufferView>),
    CommandBuffer(Arc<CommandBuffer>),
    DescriptorSet(Arc<DescriptorSet>),
    Executable(Arc<Executable>),
    Semaphore(Arc<Semaphore>),
    List(Arc<List>),
    Bytes(Arc<[u8]>),
}

impl std::fmt::Debug for RefValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:p}", self.ref_type(), self.as_ptr())
    }
}

impl RefValue {
    pub fn ref_type(&self) -> RefType {
        match self {
            RefValue::Allocator(_) => RefType::Allocator,
            RefValue::Buffer(_) => RefType::Buffer,
            RefValue::BufferView(_) => RefType::BufferView,
            RefValue::CommandBuffer(_) => RefType::CommandBuffer,
            RefValue::DescriptorSet(_) => RefType::DescriptorSet,
            RefValue::Executable(_) => RefType::Executable,
            RefValue::Semaphore(_) => RefType::Semaphore,
            RefValue::List(_) => RefType::List,
            RefValue::Bytes(_) => RefType::Bytes,
        }
    }

    fn as_ptr(&self) -> *const () {
        match self {
            RefValue::Allocator(x) => Arc::as_ptr(x) as *const (),
            RefValue::Buffer(x) => Arc::as_ptr(x) as *const (),
            RefValue::BufferView(x) => Arc::as_ptr(x) as *const (),
            RefValue::CommandBuffer(x) => Arc::as_ptr(x) as *const (),
            RefValue::DescriptorSet(x) => Arc::as_ptr(x) as *const (),
            RefValue::Executable(x) => Arc::as_ptr(x) as *const (),
            RefValue::Semaphore(x) => Arc::as_ptr(x) as *const (),
            RefValue::List(x) => Arc::as_ptr(x) as *const (),
            RefValue::Bytes(x) => Arc::as_ptr(x) as *const (),
        }
    }

    /// Number of live handles to the underlying object.
    pub fn ref_count(&self) -> usize {
        match self {
            RefValue::Allocator(x) => Arc::strong_count(x),
            RefValue::Buffer(x) => Arc::strong_count(x),
            RefValue::BufferView(x) => Arc::strong_count(x),
            RefValue::CommandBuffer(x) => Arc::strong_count(x),
            RefValue::DescriptorSet(x) => Arc::strong_count(x),
            RefValue::Executable(x) => Arc::strong_count(x),
            RefValue::Semaphore(x) => Arc::strong_count(x),
            RefValue::List(x) => Arc::strong_count(x),
            RefValue::Bytes(x) => Arc::strong_count(x),
        }
    }
}

/// A growable list of VM values, itself a ref.
#[derive(Debug, Default)]
pub struct List {
    items: RwLock<Vec<Value>>,
}

impl List {
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: RwLock::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn len(&self) -> usize {
        self.items.read().expect("failed to lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, value: Value) {
        self.items.write().expect("failed to lock").push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.read().expect("failed to lock").get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.items.read().expect("failed to lock").clone()
    }
}

/// A value crossing a call boundary: into `invoke`, out of `invoke`, or
/// through an import. Inside a frame the interpreter works on raw registers
/// instead, keeping the integer path allocation-free.
#[derive(Debug, Clone, From)]
pub enum Value {
    I32(i32),
    I64(i64),
    Ref(RefValue),
}

impl Value {
    /// The calling-convention character this value marshals as.
    pub fn type_char(&self) -> char {
        match self {
            Value::I32(_) => 'i',
            Value::I64(_) => 'I',
            Value::Ref(_) => 'r',
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&RefValue> {
        match self {
            Value::Ref(value) => Some(value),
            _ => None,
        }
    }
}
