use super::context::{InvokeError, NativeFunction, NativeModule, arg_i32, arg_ref};
use super::value::{List, RefValue, Value};

/// VM-level builtins: lists and byte buffers. Loaded contexts that need them
/// register this module under the name `util`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtilModule;

fn list_arg(args: &[Value], index: usize) -> Result<std::sync::Arc<List>, InvokeError> {
    match arg_ref(args, index)? {
        RefValue::List(list) => Ok(list.clone()),
        other => Err(InvokeError::TypeMismatch {
            expected: "util.list".into(),
            found: other.ref_type().to_string(),
        }),
    }
}

fn out_of_range(index: i32, len: usize) -> InvokeError {
    InvokeError::Hal(crate::hal::HalError::OutOfRange {
        offset: index as usize,
        length: 1,
        capacity: len,
    })
}

impl NativeModule for UtilModule {
    fn name(&self) -> &str {
        "util"
    }

    fn resolve(&self, name: &str) -> Option<NativeFunction> {
        match name {
            "bytes.size" => Some(NativeFunction::new("r_i", |args| {
                match arg_ref(args, 0)? {
                    RefValue::Bytes(bytes) => Ok(vec![Value::I32(bytes.len() as i32)]),
                    other => Err(InvokeError::TypeMismatch {
                        expected: "util.bytes".into(),
                        found: other.ref_type().to_string(),
                    }),
                }
            })),
            "list.create" => Some(NativeFunction::new("i_r", |args| {
                let capacity = arg_i32(args, 0)?.max(0) as usize;
                Ok(vec![Value::Ref(RefValue::List(List::with_capacity(
                    capacity,
                )))])
            })),
            "list.size" => Some(NativeFunction::new("r_i", |args| {
                let list = list_arg(args, 0)?;
                Ok(vec![Value::I32(list.len() as i32)])
            })),
            "list.push.i32" => Some(NativeFunction::new("ri_v", |args| {
                let list = list_arg(args, 0)?;
                list.push(Value::I32(arg_i32(args, 1)?));
                Ok(vec![])
            })),
            "list.push.ref" => Some(NativeFunction::new("rr_v", |args| {
                let list = list_arg(args, 0)?;
                list.push(Value::Ref(arg_ref(args, 1)?.clone()));
                Ok(vec![])
            })),
            "list.get.i32" => Some(NativeFunction::new("ri_i", |args| {
                let list = list_arg(args, 0)?;
                let index = arg_i32(args, 1)?;
                let value = list
                    .get(index.max(0) as usize)
                    .ok_or_else(|| out_of_range(index, list.len()))?;
                value
                    .as_i32()
                    .map(|value| vec![Value::I32(value)])
                    .ok_or_else(|| InvokeError::TypeMismatch {
                        expected: "i".into(),
                        found: value.type_char().to_string(),
                    })
            })),
            "list.get.ref" => Some(NativeFunction::new("ri_r", |args| {
                let list = list_arg(args, 0)?;
                let index = arg_i32(args, 1)?;
                let value = list
                    .get(index.max(0) as usize)
                    .ok_or_else(|| out_of_range(index, list.len()))?;
                match value {
                    Value::Ref(value) => Ok(vec![Value::Ref(value)]),
                    other => Err(InvokeError::TypeMismatch {
                        expected: "r".into(),
                        found: other.type_char().to_string(),
                    }),
                }
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::vm::bytecode::Instruction;
    use crate::vm::context::Context;
    use crate::vm::module::{Module, ModuleBuilder};

    #[test]
    fn test_list_through_bytecode() {
        // creates a list, pushes two values, returns their sum
        let mut builder = ModuleBuilder::new("m").add_type("util.list");
        let create = builder.add_import("util.list.create", "i_r");
        let push = builder.add_import("util.list.push.i32", "ri_v");
        let get = builder.add_import("util.list.get.i32", "ri_i");
        let f = builder.add_function(
            "f",
            "ii_i",
            4,
            1,
            &[
                Instruction::ConstI32 { dst: 2, value: 2 },
                Instruction::CallImport {
                    import: create,
                    args: vec![2],
                    results: vec![0],
                },
                Instruction::CallImport {
                    import: push,
                    args: vec![0, 0],
                    results: vec![],
                },
                Instruction::CallImport {
                    import: push,
                    args: vec![0, 1],
                    results: vec![],
                },
                Instruction::ConstI32 { dst: 2, value: 0 },
                Instruction::CallImport {
                    import: get,
                    args: vec![0, 2],
                    results: vec![2],
                },
                Instruction::ConstI32 { dst: 3, value: 1 },
                Instruction::CallImport {
                    import: get,
                    args: vec![0, 3],
                    results: vec![3],
                },
                Instruction::BinaryI32 {
                    op: crate::vm::bytecode::BinaryI32Op::Add,
                    dst: 0,
                    lhs: 2,
                    rhs: 3,
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        let module = Module::load(&builder.export("f", f).build()).unwrap();
        let context = Context::new(vec![module], vec![Arc::new(UtilModule)]).unwrap();

        let outputs = context
            .invoke("f", vec![Value::I32(30), Value::I32(12)])
            .unwrap();
        assert_eq!(outputs[0].as_i32(), Some(42));
    }

    #[test]
    fn test_list_get_out_of_range() {
        let list = List::with_capacity(0);
        let module = UtilModule;
        let get = module.resolve("list.get.i32").unwrap();
        let err = (get.f)(&[Value::Ref(RefValue::List(list)), Value::I32(3)]).unwrap_err();
        assert!(matches!(err, InvokeError::Hal(_)));
    }
}
