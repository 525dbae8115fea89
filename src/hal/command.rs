use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap as HashMap;

use super::{Buffer, HalError};

/// Replay policy declared at creation time. One-shot buffers are consumed by
/// their first submission; reusable buffers may be submitted repeatedly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferMode {
    #[default]
    OneShot,
    Reusable,
}

/// A recorded device operation. Dispatch commands capture binding state at
/// resolve time, not here, so recording stays a plain append.
#[derive(Debug, Clone)]
pub enum Command {
    Dispatch {
        executable: Arc<Executable>,
        entry_point: usize,
        workgroups: [u32; 3],
    },
    CopyBuffer {
        source: Arc<Buffer>,
        source_offset: usize,
        target: Arc<Buffer>,
        target_offset: usize,
        length: usize,
    },
    FillBuffer {
        target: Arc<Buffer>,
        target_offset: usize,
        length: usize,
        pattern: Vec<u8>,
    },
    /// Everything recorded before the barrier completes before anything
    /// recorded after it begins.
    ExecutionBarrier,
    BindDescriptorSet {
        index: u32,
        set: Arc<DescriptorSet>,
    },
    PushConstants {
        offset: usize,
        values: Vec<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Ready,
    Consumed,
}

impl RecordState {
    const fn name(self) -> &'static str {
        match self {
            RecordState::Initial => "has not begun recording",
            RecordState::Recording => "is still recording",
            RecordState::Ready => "is already finalized",
            RecordState::Consumed => "was consumed by a prior submission",
        }
    }
}

#[derive(Debug)]
struct Recording {
    state: RecordState,
    commands: Vec<Command>,
}

/// An append-only recording of device operations, finalized with
/// [`end`](CommandBuffer::end) before submission.
#[derive(Debug)]
pub struct CommandBuffer {
    mode: CommandBufferMode,
    recording: Mutex<Recording>,
}

impl CommandBuffer {
    pub fn new(mode: CommandBufferMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            recording: Mutex::new(Recording {
                state: RecordState::Initial,
                commands: Vec::new(),
            }),
        })
    }

    #[inline]
    pub fn mode(&self) -> CommandBufferMode {
        self.mode
    }

    pub fn begin(&self) -> Result<(), HalError> {
        let mut recording = self.recording.lock().expect("failed to lock");
        match recording.state {
            RecordState::Initial => {
                recording.state = RecordState::Recording;
                Ok(())
            }
            state => Err(HalError::Recording {
                state: state.name(),
                expected: "initial",
            }),
        }
    }

    pub fn end(&self) -> Result<(), HalError> {
        let mut recording = self.recording.lock().expect("failed to lock");
        match recording.state {
            RecordState::Recording => {
                recording.state = RecordState::Ready;
                Ok(())
            }
            state => Err(HalError::Recording {
                state: state.name(),
                expected: "recording",
            }),
        }
    }

    pub fn push(&self, command: Command) -> Result<(), HalError> {
        let mut recording = self.recording.lock().expect("failed to lock");
        match recording.state {
            RecordState::Recording => {
                recording.commands.push(command);
                Ok(())
            }
            state => Err(HalError::Recording {
                state: state.name(),
                expected: "recording",
            }),
        }
    }

    /// Takes the recorded commands for submission. One-shot buffers move to
    /// the consumed state; reusable buffers stay ready.
    pub fn take_commands(&self) -> Result<Vec<Command>, HalError> {
        let mut recording = self.recording.lock().expect("failed to lock");
        match recording.state {
            RecordState::Ready => match self.mode {
                CommandBufferMode::OneShot => {
                    recording.state = RecordState::Consumed;
                    Ok(std::mem::take(&mut recording.commands))
                }
                CommandBufferMode::Reusable => Ok(recording.commands.clone()),
            },
            state => Err(HalError::Recording {
                state: state.name(),
                expected: "finalized",
            }),
        }
    }
}

/// One buffer range attached to a descriptor set binding slot.
#[derive(Debug, Clone)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub buffer: Arc<Buffer>,
    pub offset: usize,
    pub length: usize,
}

/// An immutable table of buffer ranges dispatches read and write through.
#[derive(Debug)]
pub struct DescriptorSet {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSet {
    /// Validates every binding range against its backing buffer up front.
    pub fn new(bindings: Vec<DescriptorBinding>) -> Result<Arc<Self>, HalError> {
        for binding in &bindings {
            let capacity = binding.buffer.capacity();
            if binding
                .offset
                .checked_add(binding.length)
                .is_none_or(|end| end > capacity)
            {
                return Err(HalError::OutOfRange {
                    offset: binding.offset,
                    length: binding.length,
                    capacity,
                });
            }
        }
        Ok(Arc::new(Self { bindings }))
    }

    #[inline]
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
}

/// The state visible to one dispatched workgroup invocation.
pub struct DispatchState<'a> {
    pub workgroup_id: [u32; 3],
    pub workgroup_count: [u32; 3],
    pub push_constants: &'a [i32],
    bindings: &'a [DescriptorBinding],
}

impl DispatchState<'_> {
    /// Resolves binding slot `binding` to its buffer range.
    pub fn binding(&self, binding: u32) -> Result<&DescriptorBinding, HalError> {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .ok_or_else(|| HalError::InvalidArgument(format!("no binding {binding} bound")))
    }
}

pub type DispatchFn = dyn Fn(&DispatchState) -> Result<(), HalError> + Send + Sync;

/// A compiled dispatchable: a table of named entry points backed by host
/// function pointers. Backend code generators hand these to the runtime as
/// opaque tables; the host-local flavor wraps Rust closures.
pub struct Executable {
    name: String,
    entry_points: Vec<(String, Arc<DispatchFn>)>,
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entry_points: Vec<_> = self.entry_points.iter().map(|(name, _)| name).collect();
        f.debug_struct("Executable")
            .field("name", &self.name)
            .field("entry_points", &entry_points)
            .finish()
    }
}

impl Executable {
    pub fn builder(name: impl Into<String>) -> ExecutableBuilder {
        ExecutableBuilder {
            name: name.into(),
            entry_points: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self, ordinal: usize) -> Result<&Arc<DispatchFn>, HalError> {
        self.entry_points
            .get(ordinal)
            .map(|(_, f)| f)
            .ok_or_else(|| HalError::EntryPointNotFound(format!("{}[{ordinal}]", self.name)))
    }

    pub fn entry_point_by_name(&self, name: &str) -> Result<usize, HalError> {
        self.entry_points
            .iter()
            .position(|(entry, _)| entry == name)
            .ok_or_else(|| HalError::EntryPointNotFound(format!("{}::{name}", self.name)))
    }
}

pub struct ExecutableBuilder {
    name: String,
    entry_points: Vec<(String, Arc<DispatchFn>)>,
}

impl ExecutableBuilder {
    pub fn entry_point<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&DispatchState) -> Result<(), HalError> + Send + Sync + 'static,
    {
        self.entry_points.push((name.into(), Arc::new(f)));
        self
    }

    pub fn build(self) -> Arc<Executable> {
        Arc::new(Executable {
            name: self.name,
            entry_points: self.entry_points,
        })
    }
}

/// One executable operation with its binding state already resolved.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Exec(ResolvedOp),
    Barrier,
}

#[derive(Debug, Clone)]
pub(crate) enum ResolvedOp {
    Dispatch {
        executable: Arc<Executable>,
        entry_point: usize,
        workgroups: [u32; 3],
        bindings: Vec<DescriptorBinding>,
        push_constants: Vec<i32>,
    },
    Copy {
        source: Arc<Buffer>,
        source_offset: usize,
        target: Arc<Buffer>,
        target_offset: usize,
        length: usize,
    },
    Fill {
        target: Arc<Buffer>,
        target_offset: usize,
        length: usize,
        pattern: Vec<u8>,
    },
}

impl ResolvedOp {
    pub fn execute(&self) -> Result<(), HalError> {
        match self {
            ResolvedOp::Dispatch {
                executable,
                entry_point,
                workgroups,
                bindings,
                push_constants,
            } => {
                let f = executable.entry_point(*entry_point)?;
                let [x, y, z] = *workgroups;
                for gz in 0..z {
                    for gy in 0..y {
                        for gx in 0..x {
                            let state = DispatchState {
                                workgroup_id: [gx, gy, gz],
                                workgroup_count: *workgroups,
                                push_constants,
                                bindings,
                            };
                            f(&state)?;
                        }
                    }
                }
                Ok(())
            }
            ResolvedOp::Copy {
                source,
                source_offset,
                target,
                target_offset,
                length,
            } => target.copy_from(source, *source_offset, *target_offset, *length),
            ResolvedOp::Fill {
                target,
                target_offset,
                length,
                pattern,
            } => target.fill(*target_offset, *length, pattern),
        }
    }
}

/// Flattens recorded commands into executable steps, folding descriptor and
/// push-constant state into each dispatch.
pub(crate) fn resolve_commands(commands: Vec<Command>) -> Result<Vec<Step>, HalError> {
    let mut steps = Vec::with_capacity(commands.len());
    let mut sets: HashMap<u32, Arc<DescriptorSet>> = HashMap::default();
    let mut constants: Vec<i32> = Vec::new();

    for command in commands {
        match command {
            Command::BindDescriptorSet { index, set } => {
                sets.insert(index, set);
            }
            Command::PushConstants { offset, values } => {
                if constants.len() < offset + values.len() {
                    constants.resize(offset + values.len(), 0);
                }
                constants[offset..offset + values.len()].copy_from_slice(&values);
            }
            Command::ExecutionBarrier => steps.push(Step::Barrier),
            Command::Dispatch {
                executable,
                entry_point,
                workgroups,
            } => {
                // set 0 carries the dispatch bindings; higher sets append
                let mut indices: Vec<_> = sets.keys().copied().collect();
                indices.sort_unstable();
                let bindings = indices
                    .into_iter()
                    .flat_map(|index| sets[&index].bindings().to_vec())
                    .collect();
                steps.push(Step::Exec(ResolvedOp::Dispatch {
                    executable,
                    entry_point,
                    workgroups,
                    bindings,
                    push_constants: constants.clone(),
                }));
            }
            Command::CopyBuffer {
                source,
                source_offset,
                target,
                target_offset,
                length,
            } => steps.push(Step::Exec(ResolvedOp::Copy {
                source,
                source_offset,
                target,
                target_offset,
                length,
            })),
            Command::FillBuffer {
                target,
                target_offset,
                length,
                pattern,
            } => steps.push(Step::Exec(ResolvedOp::Fill {
                target,
                target_offset,
                length,
                pattern,
            })),
        }
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BufferUsage, MemoryType};

    fn buffer(capacity: usize) -> Arc<Buffer> {
        Arc::new(Buffer::new(
            MemoryType::HOST_LOCAL,
            BufferUsage::ALL,
            capacity,
        ))
    }

    #[test]
    fn test_recording_state_machine() {
        let cb = CommandBuffer::new(CommandBufferMode::OneShot);

        // recording before begin is rejected
        assert!(matches!(
            cb.push(Command::ExecutionBarrier),
            Err(HalError::Recording { .. })
        ));
        // submitting before end is rejected
        cb.begin().unwrap();
        cb.push(Command::ExecutionBarrier).unwrap();
        assert!(matches!(cb.take_commands(), Err(HalError::Recording { .. })));

        cb.end().unwrap();
        assert!(matches!(cb.begin(), Err(HalError::Recording { .. })));
        assert_eq!(cb.take_commands().unwrap().len(), 1);

        // one-shot buffers cannot be replayed
        assert!(matches!(cb.take_commands(), Err(HalError::Recording { .. })));
    }

    #[test]
    fn test_reusable_replay() {
        let cb = CommandBuffer::new(CommandBufferMode::Reusable);
        cb.begin().unwrap();
        cb.push(Command::FillBuffer {
            target: buffer(4),
            target_offset: 0,
            length: 4,
            pattern: vec![1],
        })
        .unwrap();
        cb.end().unwrap();
        assert_eq!(cb.take_commands().unwrap().len(), 1);
        assert_eq!(cb.take_commands().unwrap().len(), 1);
    }

    #[test]
    fn test_descriptor_set_bounds() {
        let b = buffer(32);
        assert!(
            DescriptorSet::new(vec![DescriptorBinding {
                binding: 0,
                buffer: b.clone(),
                offset: 16,
                length: 16,
            }])
            .is_ok()
        );
        let err = DescriptorSet::new(vec![DescriptorBinding {
            binding: 0,
            buffer: b,
            offset: 16,
            length: 17,
        }])
        .unwrap_err();
        assert!(matches!(err, HalError::OutOfRange { .. }));
    }

    #[test]
    fn test_dispatch_sees_bindings_and_constants() {
        let data = buffer(16);
        let set = DescriptorSet::new(vec![DescriptorBinding {
            binding: 0,
            buffer: data.clone(),
            offset: 0,
            length: 16,
        }])
        .unwrap();
        let exe = Executable::builder("fill_index")
            .entry_point("main", |state| {
                let binding = state.binding(0)?;
                let base = state.push_constants[0];
                let index = state.workgroup_id[0] as usize;
                binding
                    .buffer
                    .store_i32(base + index as i32, binding.offset + index * 4, 4)
            })
            .build();

        let commands = vec![
            Command::BindDescriptorSet { index: 0, set },
            Command::PushConstants {
                offset: 0,
                values: vec![10],
            },
            Command::Dispatch {
                executable: exe,
                entry_point: 0,
                workgroups: [4, 1, 1],
            },
        ];
        for step in resolve_commands(commands).unwrap() {
            if let Step::Exec(op) = step {
                op.execute().unwrap();
            }
        }
        assert_eq!(data.read_elements::<i32>(0, 4).unwrap(), vec![10, 11, 12, 13]);
    }
}
