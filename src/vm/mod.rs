//! Register-based bytecode virtual machine: module loading, context linking,
//! and the dispatch loop.

pub use bytecode::{Instruction, Opcode};
pub use builtins::UtilModule;
pub use context::{Context, InvokeError, LinkError, NativeFunction, NativeModule};
pub use frame::CallFrame;
pub use module::{Function, Import, LoadError, Module, ModuleBuilder, Signature};
pub use value::{List, RefType, RefValue, Value};

pub mod builtins;
pub mod bytecode;
pub mod context;
pub mod frame;
pub(crate) mod interp;
pub mod module;
pub mod value;
