use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use super::interp;
use super::module::{Module, Signature};
use super::value::{RefValue, Value};
use crate::hal::HalError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unresolved import {0:?}")]
    UnresolvedImport(String),
    #[error("import {name:?} signature mismatch: declared {declared}, provided {provided}")]
    TypeMismatch {
        name: String,
        declared: Signature,
        provided: Signature,
    },
    #[error("duplicate module name {0:?}")]
    DuplicateModule(String),
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no export named {0:?}")]
    ExportNotFound(String),
    #[error("boundary type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: String, found: String },
    #[error("null ref in register {0}")]
    NullRef(u16),
    #[error("integer division by zero at pc {pc}")]
    DivideByZero { pc: usize },
    #[error("call depth exceeded {0}")]
    CallDepth(usize),
    #[error("invocation failed with code {code}: {message}")]
    Failed { code: i32, message: String },
    #[error(transparent)]
    Hal(#[from] HalError),
}

/// A host function callable through the import table. Arguments arrive
/// borrowed: the caller retains its ref handles and the callee clones only
/// what it keeps.
#[derive(Clone)]
pub struct NativeFunction {
    pub signature: Signature,
    pub f: Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, InvokeError> + Send + Sync>,
}

impl NativeFunction {
    pub fn new<F>(signature: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, InvokeError> + Send + Sync + 'static,
    {
        Self {
            signature: Signature::parse(signature).expect("native signature must parse"),
            f: Arc::new(f),
        }
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.signature)
    }
}

/// A host-implemented module resolvable through the import table.
pub trait NativeModule: Send + Sync {
    fn name(&self) -> &str;
    fn resolve(&self, name: &str) -> Option<NativeFunction>;
}

#[derive(Debug)]
pub(crate) enum ImportBinding {
    Bytecode { module: usize, function: usize },
    Native(NativeFunction),
}

#[derive(Debug)]
pub(crate) struct LinkedModule {
    pub module: Arc<Module>,
    pub imports: Vec<ImportBinding>,
}

/// Binds loaded modules and native modules together, resolving every import
/// eagerly so no lookup or signature check remains on the call path.
#[derive(Debug)]
pub struct Context {
    linked: Vec<LinkedModule>,
}

impl Context {
    pub fn new(
        modules: Vec<Arc<Module>>,
        natives: Vec<Arc<dyn NativeModule>>,
    ) -> Result<Self, LinkError> {
        let names: Vec<_> = modules
            .iter()
            .map(|module| module.name().to_string())
            .chain(natives.iter().map(|native| native.name().to_string()))
            .collect();
        if let Some(name) = names.iter().duplicates().next() {
            return Err(LinkError::DuplicateModule(name.clone()));
        }

        let mut linked = Vec::with_capacity(modules.len());
        for module in &modules {
            let mut imports = Vec::with_capacity(module.imports().len());
            for import in module.imports() {
                let (module_name, function_name) = import
                    .name
                    .split_once('.')
                    .ok_or_else(|| LinkError::UnresolvedImport(import.name.clone()))?;

                let binding = if let Some((index, provider)) = modules
                    .iter()
                    .find_position(|provider| provider.name() == module_name)
                {
                    let function = provider.export(function_name).ok_or_else(|| {
                        LinkError::UnresolvedImport(import.name.clone())
                    })?;
                    let provided = provider.functions()[function].signature();
                    if provided != &import.signature {
                        return Err(LinkError::TypeMismatch {
                            name: import.name.clone(),
                            declared: import.signature.clone(),
                            provided: provided.clone(),
                        });
                    }
                    ImportBinding::Bytecode {
                        module: index,
                        function,
                    }
                } else if let Some(native) = natives
                    .iter()
                    .find(|native| native.name() == module_name)
                {
                    let function = native.resolve(function_name).ok_or_else(|| {
                        LinkError::UnresolvedImport(import.name.clone())
                    })?;
                    if function.signature != import.signature {
                        return Err(LinkError::TypeMismatch {
                            name: import.name.clone(),
                            declared: import.signature.clone(),
                            provided: function.signature.clone(),
                        });
                    }
                    ImportBinding::Native(function)
                } else {
                    return Err(LinkError::UnresolvedImport(import.name.clone()));
                };
                imports.push(binding);
            }
            linked.push(LinkedModule {
                module: module.clone(),
                imports,
            });
        }
        Ok(Self { linked })
    }

    pub(crate) fn linked(&self, index: usize) -> &LinkedModule {
        &self.linked[index]
    }

    /// Invokes an exported function. Export names are searched across the
    /// context's modules in registration order.
    pub fn invoke(&self, export: &str, inputs: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
        let (module_index, ordinal) = self
            .linked
            .iter()
            .enumerate()
            .find_map(|(index, linked)| Some((index, linked.module.export(export)?)))
            .ok_or_else(|| InvokeError::ExportNotFound(export.to_string()))?;

        let signature = self.linked[module_index].module.functions()[ordinal].signature();
        check_boundary_types(signature.args(), &inputs)?;
        interp::call_function(self, module_index, ordinal, &inputs, 0)
    }
}

/// Validates values crossing a call boundary against one side of a
/// signature.
pub(crate) fn check_boundary_types(chars: &str, values: &[Value]) -> Result<(), InvokeError> {
    let found: String = values.iter().map(Value::type_char).collect();
    match chars == found {
        true => Ok(()),
        false => Err(InvokeError::TypeMismatch {
            expected: chars.to_string(),
            found,
        }),
    }
}

pub fn arg_i32(args: &[Value], index: usize) -> Result<i32, InvokeError> {
    args.get(index)
        .and_then(Value::as_i32)
        .ok_or_else(|| arg_mismatch(args, index, "i32"))
}

pub fn arg_i64(args: &[Value], index: usize) -> Result<i64, InvokeError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| arg_mismatch(args, index, "i64"))
}

pub fn arg_ref<'a>(args: &'a [Value], index: usize) -> Result<&'a RefValue, InvokeError> {
    args.get(index)
        .and_then(Value::as_ref_value)
        .ok_or_else(|| arg_mismatch(args, index, "ref"))
}

fn arg_mismatch(args: &[Value], index: usize, expected: &str) -> InvokeError {
    InvokeError::TypeMismatch {
        expected: format!("{expected} at argument {index}"),
        found: args.iter().map(Value::type_char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::Instruction;
    use crate::vm::module::ModuleBuilder;

    fn callee_module() -> Arc<Module> {
        let mut builder = ModuleBuilder::new("util_math");
        let double = builder.add_function(
            "double",
            "i_i",
            2,
            0,
            &[
                Instruction::BinaryI32 {
                    op: crate::vm::bytecode::BinaryI32Op::Add,
                    dst: 0,
                    lhs: 0,
                    rhs: 0,
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        Module::load(&builder.export("double", double).build()).unwrap()
    }

    fn caller_module(signature: &str) -> Arc<Module> {
        let mut builder = ModuleBuilder::new("caller");
        let import = builder.add_import("util_math.double", signature);
        let main = builder.add_function(
            "main",
            "i_i",
            1,
            0,
            &[
                Instruction::CallImport {
                    import,
                    args: vec![0],
                    results: vec![0],
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        Module::load(&builder.export("main", main).build()).unwrap()
    }

    #[test]
    fn test_cross_module_call() {
        let context = Context::new(vec![callee_module(), caller_module("i_i")], vec![]).unwrap();
        let outputs = context.invoke("main", vec![Value::I32(21)]).unwrap();
        assert_eq!(outputs[0].as_i32(), Some(42));
    }

    #[test]
    fn test_unresolved_import() {
        let err = Context::new(vec![caller_module("i_i")], vec![]).unwrap_err();
        assert!(matches!(err, LinkError::UnresolvedImport(name) if name == "util_math.double"));
    }

    #[test]
    fn test_signature_mismatch_at_link() {
        let err = Context::new(vec![callee_module(), caller_module("ii_i")], vec![]).unwrap_err();
        assert!(matches!(err, LinkError::TypeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_module_name() {
        let err = Context::new(vec![callee_module(), callee_module()], vec![]).unwrap_err();
        assert!(matches!(err, LinkError::DuplicateModule(name) if name == "util_math"));
    }

    #[test]
    fn test_invoke_boundary_checks() {
        let context = Context::new(vec![callee_module()], vec![]).unwrap();
        let err = context.invoke("missing", vec![]).unwrap_err();
        assert!(matches!(err, InvokeError::ExportNotFound(_)));

        let err = context
            .invoke("double", vec![Value::I64(1)])
            .unwrap_err();
        assert!(matches!(err, InvokeError::TypeMismatch { .. }));

        let err = context.invoke("double", vec![]).unwrap_err();
        assert!(matches!(err, InvokeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_native_module_resolution() {
        struct Host;
        impl NativeModule for Host {
            fn name(&self) -> &str {
                "host"
            }

            fn resolve(&self, name: &str) -> Option<NativeFunction> {
                match name {
                    "negate" => Some(NativeFunction::new("i_i", |args| {
                        Ok(vec![Value::I32(-arg_i32(args, 0)?)])
                    })),
                    _ => None,
                }
            }
        }

        let mut builder = ModuleBuilder::new("caller");
        let import = builder.add_import("host.negate", "i_i");
        let main = builder.add_function(
            "main",
            "i_i",
            1,
            0,
            &[
                Instruction::CallImport {
                    import,
                    args: vec![0],
                    results: vec![0],
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        let module = Module::load(&builder.export("main", main).build()).unwrap();

        let context = Context::new(vec![module], vec![Arc::new(Host)]).unwrap();
        let outputs = context.invoke("main", vec![Value::I32(5)]).unwrap();
        assert_eq!(outputs[0].as_i32(), Some(-5));
    }
}
