use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap as HashMap;

use super::{
    Buffer, BufferUsage, BufferView, CommandBuffer, CommandBufferMode, DescriptorBinding,
    DescriptorSet, Device, ElementType, Executable, HalError, MemoryType, Semaphore,
    command::Command,
};
use crate::vm::{
    InvokeError, NativeFunction, NativeModule, RefValue, Value,
    context::{arg_i32, arg_i64, arg_ref},
};

/// The `hal` import surface: a fixed set of functions grouped by object kind
/// and bound to one device. Import names and signatures are type-checked
/// against this table at context-creation time.
pub struct HalModule {
    device: Arc<dyn Device>,
    /// Host executables registered by the embedder, resolved by
    /// `executable.create` from a name held in rodata.
    executables: Mutex<HashMap<String, Arc<Executable>>>,
}

fn type_mismatch(expected: &str, found: &RefValue) -> InvokeError {
    InvokeError::TypeMismatch {
        expected: expected.into(),
        found: found.ref_type().to_string(),
    }
}

fn buffer_arg(args: &[Value], index: usize) -> Result<Arc<Buffer>, InvokeError> {
    match arg_ref(args, index)? {
        RefValue::Buffer(buffer) => Ok(buffer.clone()),
        other => Err(type_mismatch("hal.buffer", other)),
    }
}

fn view_arg(args: &[Value], index: usize) -> Result<Arc<BufferView>, InvokeError> {
    match arg_ref(args, index)? {
        RefValue::BufferView(view) => Ok(view.clone()),
        other => Err(type_mismatch("hal.buffer_view", other)),
    }
}

fn command_buffer_arg(args: &[Value], index: usize) -> Result<Arc<CommandBuffer>, InvokeError> {
    match arg_ref(args, index)? {
        RefValue::CommandBuffer(cb) => Ok(cb.clone()),
        other => Err(type_mismatch("hal.command_buffer", other)),
    }
}

fn semaphore_arg(args: &[Value], index: usize) -> Result<Arc<Semaphore>, InvokeError> {
    match arg_ref(args, index)? {
        RefValue::Semaphore(semaphore) => Ok(semaphore.clone()),
        other => Err(type_mismatch("hal.semaphore", other)),
    }
}

fn executable_arg(args: &[Value], index: usize) -> Result<Arc<Executable>, InvokeError> {
    match arg_ref(args, index)? {
        RefValue::Executable(executable) => Ok(executable.clone()),
        other => Err(type_mismatch("hal.executable", other)),
    }
}

fn usize_arg(args: &[Value], index: usize) -> Result<usize, InvokeError> {
    let value = arg_i32(args, index)?;
    usize::try_from(value).map_err(|_| {
        InvokeError::Hal(HalError::InvalidArgument(format!(
            "negative size or offset {value}"
        )))
    })
}

impl HalModule {
    pub fn new(device: Arc<dyn Device>) -> Arc<Self> {
        Arc::new(Self {
            device,
            executables: Mutex::new(HashMap::default()),
        })
    }

    /// Registers a host executable under the name `executable.create`
    /// resolves.
    pub fn register_executable(&self, executable: Arc<Executable>) {
        self.executables
            .lock()
            .expect("failed to lock")
            .insert(executable.name().to_string(), executable);
    }

    #[inline]
    pub fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }
}

impl NativeModule for HalModule {
    fn name(&self) -> &str {
        "hal"
    }

    // Sorted ascending by name, the order the import table is written in.
    fn resolve(&self, name: &str) -> Option<NativeFunction> {
        let device = self.device.clone();
        match name {
            "allocator.allocate" => Some(NativeFunction::new("riii_r", move |args| {
                let allocator = match arg_ref(args, 0)? {
                    RefValue::Allocator(allocator) => allocator.clone(),
                    other => return Err(type_mismatch("hal.allocator", other)),
                };
                let memory_type = MemoryType::from_bits(arg_i32(args, 1)? as u32);
                let usage = BufferUsage::from_bits(arg_i32(args, 2)? as u32);
                let size = usize_arg(args, 3)?;
                let buffer = allocator.allocate(memory_type, usage, size)?;
                Ok(vec![Value::Ref(RefValue::Buffer(buffer))])
            })),
            "buffer.load" => Some(NativeFunction::new("rii_i", move |args| {
                let buffer = buffer_arg(args, 0)?;
                let offset = usize_arg(args, 1)?;
                let length = usize_arg(args, 2)?;
                Ok(vec![Value::I32(buffer.load_i32(offset, length)?)])
            })),
            "buffer.store" => Some(NativeFunction::new("irii_v", move |args| {
                let value = arg_i32(args, 0)?;
                let buffer = buffer_arg(args, 1)?;
                let offset = usize_arg(args, 2)?;
                let length = usize_arg(args, 3)?;
                buffer.store_i32(value, offset, length)?;
                Ok(vec![])
            })),
            "buffer.subspan" => Some(NativeFunction::new("rii_r", move |args| {
                let buffer = buffer_arg(args, 0)?;
                let offset = usize_arg(args, 1)?;
                let length = usize_arg(args, 2)?;
                let view = buffer.subspan(offset, length)?;
                Ok(vec![Value::Ref(RefValue::BufferView(Arc::new(view)))])
            })),
            "buffer_view.buffer" => Some(NativeFunction::new("r_r", move |args| {
                let view = view_arg(args, 0)?;
                Ok(vec![Value::Ref(RefValue::Buffer(view.buffer()))])
            })),
            "buffer_view.byte_length" => Some(NativeFunction::new("r_i", move |args| {
                let view = view_arg(args, 0)?;
                Ok(vec![Value::I32(view.byte_length() as i32)])
            })),
            "buffer_view.create" => Some(NativeFunction::new("riir_r", move |args| {
                let buffer = buffer_arg(args, 0)?;
                let offset = usize_arg(args, 1)?;
                let element_type = ElementType::from_code(arg_i32(args, 2)?)?;
                let shape = match arg_ref(args, 3)? {
                    RefValue::List(list) => list
                        .to_vec()
                        .iter()
                        .map(|value| {
                            value.as_i32().and_then(|dim| usize::try_from(dim).ok()).ok_or_else(
                                || {
                                    InvokeError::Hal(HalError::InvalidArgument(
                                        "shape dims must be non-negative i32".into(),
                                    ))
                                },
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    other => return Err(type_mismatch("util.list", other)),
                };
                let view = BufferView::new(buffer, offset, shape, element_type)?;
                Ok(vec![Value::Ref(RefValue::BufferView(Arc::new(view)))])
            })),
            "buffer_view.dim" => Some(NativeFunction::new("ri_i", move |args| {
                let view = view_arg(args, 0)?;
                let index = usize_arg(args, 1)?;
                Ok(vec![Value::I32(view.dim(index)? as i32)])
            })),
            "buffer_view.element_type" => Some(NativeFunction::new("r_i", move |args| {
                let view = view_arg(args, 0)?;
                Ok(vec![Value::I32(view.element_type().to_code())])
            })),
            "buffer_view.rank" => Some(NativeFunction::new("r_i", move |args| {
                let view = view_arg(args, 0)?;
                Ok(vec![Value::I32(view.rank() as i32)])
            })),
            "command_buffer.begin" => Some(NativeFunction::new("r_v", move |args| {
                command_buffer_arg(args, 0)?.begin()?;
                Ok(vec![])
            })),
            "command_buffer.bind_descriptor_set" => {
                Some(NativeFunction::new("rir_v", move |args| {
                    let cb = command_buffer_arg(args, 0)?;
                    let index = arg_i32(args, 1)? as u32;
                    let set = match arg_ref(args, 2)? {
                        RefValue::DescriptorSet(set) => set.clone(),
                        other => return Err(type_mismatch("hal.descriptor_set", other)),
                    };
                    cb.push(Command::BindDescriptorSet { index, set })?;
                    Ok(vec![])
                }))
            }
            "command_buffer.copy_buffer" => Some(NativeFunction::new("rririi_v", move |args| {
                let cb = command_buffer_arg(args, 0)?;
                cb.push(Command::CopyBuffer {
                    source: buffer_arg(args, 1)?,
                    source_offset: usize_arg(args, 2)?,
                    target: buffer_arg(args, 3)?,
                    target_offset: usize_arg(args, 4)?,
                    length: usize_arg(args, 5)?,
                })?;
                Ok(vec![])
            })),
            "command_buffer.create" => Some(NativeFunction::new("i_r", move |args| {
                let mode = match arg_i32(args, 0)? {
                    0 => CommandBufferMode::OneShot,
                    1 => CommandBufferMode::Reusable,
                    other => {
                        return Err(InvokeError::Hal(HalError::InvalidArgument(format!(
                            "unknown command buffer mode {other}"
                        ))));
                    }
                };
                let cb = device.create_command_buffer(mode);
                Ok(vec![Value::Ref(RefValue::CommandBuffer(cb))])
            })),
            "command_buffer.dispatch" => Some(NativeFunction::new("rriiii_v", move |args| {
                let cb = command_buffer_arg(args, 0)?;
                let executable = executable_arg(args, 1)?;
                let entry_point = usize_arg(args, 2)?;
                let workgroups = [
                    arg_i32(args, 3)? as u32,
                    arg_i32(args, 4)? as u32,
                    arg_i32(args, 5)? as u32,
                ];
                cb.push(Command::Dispatch {
                    executable,
                    entry_point,
                    workgroups,
                })?;
                Ok(vec![])
            })),
            "command_buffer.end" => Some(NativeFunction::new("r_v", move |args| {
                command_buffer_arg(args, 0)?.end()?;
                Ok(vec![])
            })),
            "command_buffer.execution_barrier" => Some(NativeFunction::new("r_v", move |args| {
                command_buffer_arg(args, 0)?.push(Command::ExecutionBarrier)?;
                Ok(vec![])
            })),
            "command_buffer.fill_buffer" => Some(NativeFunction::new("rriii_v", move |args| {
                let cb = command_buffer_arg(args, 0)?;
                let pattern = arg_i32(args, 4)?.to_le_bytes().to_vec();
                cb.push(Command::FillBuffer {
                    target: buffer_arg(args, 1)?,
                    target_offset: usize_arg(args, 2)?,
                    length: usize_arg(args, 3)?,
                    pattern,
                })?;
                Ok(vec![])
            })),
            "command_buffer.push_constants" => Some(NativeFunction::new("rir_v", move |args| {
                let cb = command_buffer_arg(args, 0)?;
                let offset = usize_arg(args, 1)?;
                let values = match arg_ref(args, 2)? {
                    RefValue::List(list) => list
                        .to_vec()
                        .iter()
                        .map(|value| {
                            value.as_i32().ok_or_else(|| {
                                InvokeError::Hal(HalError::InvalidArgument(
                                    "push constants must be i32".into(),
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    other => return Err(type_mismatch("util.list", other)),
                };
                cb.push(Command::PushConstants { offset, values })?;
                Ok(vec![])
            })),
            "descriptor_set.create" => Some(NativeFunction::new("r_r", move |args| {
                // bindings arrive as a flat list: binding, buffer, offset,
                // length, repeated
                let list = match arg_ref(args, 0)? {
                    RefValue::List(list) => list.to_vec(),
                    other => return Err(type_mismatch("util.list", other)),
                };
                if list.len() % 4 != 0 {
                    return Err(InvokeError::Hal(HalError::InvalidArgument(
                        "descriptor bindings list must be groups of 4".into(),
                    )));
                }
                let mut bindings = Vec::with_capacity(list.len() / 4);
                for group in list.chunks(4) {
                    let binding = group[0].as_i32().ok_or_else(|| {
                        InvokeError::Hal(HalError::InvalidArgument("binding must be i32".into()))
                    })?;
                    let buffer = match group[1].as_ref_value() {
                        Some(RefValue::Buffer(buffer)) => buffer.clone(),
                        _ => {
                            return Err(InvokeError::Hal(HalError::InvalidArgument(
                                "binding target must be a buffer".into(),
                            )));
                        }
                    };
                    let (offset, length) = match (group[2].as_i32(), group[3].as_i32()) {
                        (Some(offset), Some(length)) if offset >= 0 && length >= 0 => {
                            (offset as usize, length as usize)
                        }
                        _ => {
                            return Err(InvokeError::Hal(HalError::InvalidArgument(
                                "binding range must be non-negative i32".into(),
                            )));
                        }
                    };
                    bindings.push(DescriptorBinding {
                        binding: binding as u32,
                        buffer,
                        offset,
                        length,
                    });
                }
                let set = DescriptorSet::new(bindings)?;
                Ok(vec![Value::Ref(RefValue::DescriptorSet(set))])
            })),
            "device.allocator" => Some(NativeFunction::new("v_r", move |_| {
                Ok(vec![Value::Ref(RefValue::Allocator(device.allocator()))])
            })),
            "ex.submit_and_wait" => Some(NativeFunction::new("r_v", move |args| {
                let cb = command_buffer_arg(args, 0)?;
                device.submit_and_wait(cb)?;
                Ok(vec![])
            })),
            "executable.create" => {
                let executables = {
                    let guard = self.executables.lock().expect("failed to lock");
                    guard.clone()
                };
                Some(NativeFunction::new("r_r", move |args| {
                    let name = match arg_ref(args, 0)? {
                        RefValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                        other => return Err(type_mismatch("util.bytes", other)),
                    };
                    let executable = executables.get(&name).cloned().ok_or_else(|| {
                        InvokeError::Hal(HalError::EntryPointNotFound(name.clone()))
                    })?;
                    Ok(vec![Value::Ref(RefValue::Executable(executable))])
                }))
            }
            "semaphore.await" => Some(NativeFunction::new("rI_v", move |args| {
                let semaphore = semaphore_arg(args, 0)?;
                let value = arg_i64(args, 1)? as u64;
                semaphore.wait(value, None)?;
                Ok(vec![])
            })),
            "semaphore.create" => Some(NativeFunction::new("i_r", move |args| {
                let initial = arg_i32(args, 0)?.max(0) as u64;
                let semaphore = device.create_semaphore(initial)?;
                Ok(vec![Value::Ref(RefValue::Semaphore(semaphore))])
            })),
            "semaphore.fail" => Some(NativeFunction::new("ri_v", move |args| {
                let semaphore = semaphore_arg(args, 0)?;
                let code = arg_i32(args, 1)?;
                semaphore.fail(format!("failed with code {code}"));
                Ok(vec![])
            })),
            "semaphore.query" => Some(NativeFunction::new("r_I", move |args| {
                let semaphore = semaphore_arg(args, 0)?;
                Ok(vec![Value::I64(semaphore.query()? as i64)])
            })),
            "semaphore.signal" => Some(NativeFunction::new("rI_v", move |args| {
                let semaphore = semaphore_arg(args, 0)?;
                let value = arg_i64(args, 1)? as u64;
                semaphore.signal(value)?;
                Ok(vec![])
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{HeapAllocator, SyncDevice, TaskDevice, device::DeviceKind};
    use crate::task::Topology;
    use crate::vm::{Context, Instruction, Module, ModuleBuilder, UtilModule};

    /// Builds a module that allocates an 8-byte buffer, records a fill
    /// through a command buffer, submits it, and loads the filled word back.
    fn fill_program() -> Vec<u8> {
        let mut builder = ModuleBuilder::new("m")
            .add_type("hal.allocator")
            .add_type("hal.buffer")
            .add_type("hal.command_buffer");
        let device_allocator = builder.add_import("hal.device.allocator", "v_r");
        let allocate = builder.add_import("hal.allocator.allocate", "riii_r");
        let cb_create = builder.add_import("hal.command_buffer.create", "i_r");
        let cb_begin = builder.add_import("hal.command_buffer.begin", "r_v");
        let cb_fill = builder.add_import("hal.command_buffer.fill_buffer", "rriii_v");
        let cb_end = builder.add_import("hal.command_buffer.end", "r_v");
        let submit = builder.add_import("hal.ex.submit_and_wait", "r_v");
        let load = builder.add_import("hal.buffer.load", "rii_i");

        // i0 scratch, i1 memory type, i2 usage, i3 size, i4 offset, i5 pattern
        // r0 allocator, r1 buffer, r2 command buffer
        let main = builder.add_function(
            "main",
            "i_i",
            6,
            3,
            &[
                Instruction::CallImport {
                    import: device_allocator,
                    args: vec![],
                    results: vec![0],
                },
                Instruction::ConstI32 {
                    dst: 1,
                    value: MemoryType::HOST_LOCAL.bits() as i32,
                },
                Instruction::ConstI32 {
                    dst: 2,
                    value: BufferUsage::ALL.bits() as i32,
                },
                Instruction::ConstI32 { dst: 3, value: 8 },
                Instruction::CallImport {
                    import: allocate,
                    args: vec![0, 1, 2, 3],
                    results: vec![1],
                },
                // one-shot command buffer
                Instruction::ConstI32 { dst: 4, value: 0 },
                Instruction::CallImport {
                    import: cb_create,
                    args: vec![4],
                    results: vec![2],
                },
                Instruction::CallImport {
                    import: cb_begin,
                    args: vec![2],
                    results: vec![],
                },
                // fill [0, 8) with the pattern from the argument register
                Instruction::ConstI32 { dst: 4, value: 0 },
                Instruction::CallImport {
                    import: cb_fill,
                    args: vec![2, 1, 4, 3, 0],
                    results: vec![],
                },
                Instruction::CallImport {
                    import: cb_end,
                    args: vec![2],
                    results: vec![],
                },
                Instruction::CallImport {
                    import: submit,
                    args: vec![2],
                    results: vec![],
                },
                // read back the second word
                Instruction::ConstI32 { dst: 4, value: 4 },
                Instruction::ConstI32 { dst: 5, value: 4 },
                Instruction::CallImport {
                    import: load,
                    args: vec![1, 4, 5],
                    results: vec![0],
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        builder.export("main", main).build()
    }

    fn run_fill(device: Arc<dyn Device>) -> i32 {
        let module = Module::load(&fill_program()).unwrap();
        let hal = HalModule::new(device);
        let context = Context::new(vec![module], vec![hal, Arc::new(UtilModule)]).unwrap();
        let outputs = context
            .invoke("main", vec![Value::I32(0x5A5A5A5A_u32 as i32)])
            .unwrap();
        outputs[0].as_i32().unwrap()
    }

    #[test]
    fn test_fill_program_on_sync_device() {
        let device = SyncDevice::new(HeapAllocator::unbounded());
        assert_eq!(run_fill(device), 0x5A5A5A5A_u32 as i32);
    }

    #[test]
    fn test_fill_program_on_task_device() {
        let device = TaskDevice::builder(HeapAllocator::unbounded())
            .topology(Topology::with_group_count(2))
            .build()
            .unwrap();
        assert_eq!(run_fill(device), 0x5A5A5A5A_u32 as i32);
    }

    #[test]
    fn test_import_type_checked_at_link() {
        // declares semaphore.create with the wrong signature
        let mut builder = ModuleBuilder::new("m");
        builder.add_import("hal.semaphore.create", "ii_r");
        let f = builder.add_function("f", "_", 0, 0, &[Instruction::Return { values: vec![] }]);
        let module = Module::load(&builder.export("f", f).build()).unwrap();

        let device = SyncDevice::new(HeapAllocator::unbounded());
        let err = Context::new(vec![module], vec![HalModule::new(device)]).unwrap_err();
        assert!(matches!(err, crate::vm::LinkError::TypeMismatch { .. }));
    }

    #[test]
    fn test_semaphore_surface() {
        let device = SyncDevice::new(HeapAllocator::unbounded());
        let hal = HalModule::new(device);

        let create = hal.resolve("semaphore.create").unwrap();
        let signal = hal.resolve("semaphore.signal").unwrap();
        let query = hal.resolve("semaphore.query").unwrap();

        let semaphore = (create.f)(&[Value::I32(0)]).unwrap().remove(0);
        (signal.f)(&[semaphore.clone(), Value::I64(9)]).unwrap();
        let value = (query.f)(&[semaphore.clone()]).unwrap()[0].as_i64();
        assert_eq!(value, Some(9));

        // non-monotonic signal surfaces as a hal error
        let err = (signal.f)(&[semaphore, Value::I64(3)]).unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Hal(HalError::NotMonotonic { value: 3, current: 9 })
        ));
    }

    #[test]
    fn test_buffer_view_surface() {
        let device = SyncDevice::new(HeapAllocator::unbounded());
        let buffer = device
            .allocator()
            .allocate(MemoryType::HOST_LOCAL, BufferUsage::ALL, 64)
            .unwrap();
        let hal = HalModule::new(device);

        let subspan = hal.resolve("buffer.subspan").unwrap();
        let byte_length = hal.resolve("buffer_view.byte_length").unwrap();

        let buffer = Value::Ref(RefValue::Buffer(buffer));
        let view = (subspan.f)(&[buffer.clone(), Value::I32(8), Value::I32(16)])
            .unwrap()
            .remove(0);
        assert_eq!((byte_length.f)(&[view]).unwrap()[0].as_i32(), Some(16));

        // 32 + 40 > 64
        let err = (subspan.f)(&[buffer, Value::I32(32), Value::I32(40)]).unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Hal(HalError::OutOfRange {
                offset: 32,
                length: 40,
                capacity: 64,
            })
        ));
    }

    #[test]
    fn test_executable_registry() {
        let device = SyncDevice::new(HeapAllocator::unbounded());
        let hal = HalModule::new(device);
        hal.register_executable(Executable::builder("kernels").entry_point("noop", |_| Ok(())).build());

        let create = hal.resolve("executable.create").unwrap();
        let name = Value::Ref(RefValue::Bytes(b"kernels".to_vec().into()));
        let executable = (create.f)(&[name]).unwrap().remove(0);
        assert!(matches!(
            executable,
            Value::Ref(RefValue::Executable(executable)) if executable.name() == "kernels"
        ));

        let missing = Value::Ref(RefValue::Bytes(b"missing".to_vec().into()));
        assert!((create.f)(&[missing]).is_err());
    }

    #[test]
    fn test_create_device_entry_point() {
        use crate::hal::device::{DeviceParams, create_device};

        let allocator = HeapAllocator::unbounded();
        let device = create_device(DeviceKind::Sync, DeviceParams::default(), allocator).unwrap();
        let hal = HalModule::new(device);
        assert!(hal.resolve("device.allocator").is_some());
        assert!(hal.resolve("device.missing").is_none());
    }
}
