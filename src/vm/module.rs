use std::sync::Arc;

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::bytecode::{self, Instruction, ValidationContext};
use super::value::RefType;

/// Module container magic: `SHTL` little-endian.
const MAGIC: u32 = u32::from_le_bytes(*b"SHTL");
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a module: bad magic")]
    BadMagic,
    #[error("unsupported module version {0}")]
    UnsupportedVersion(u32),
    #[error("module truncated")]
    Truncated,
    #[error("module contains invalid utf-8")]
    Utf8,
    #[error("trailing bytes after module payload")]
    TrailingBytes,
    #[error("invalid calling convention {0:?}")]
    InvalidSignature(String),
    #[error("unknown type {0:?} in type table")]
    UnknownType(String),
    #[error("duplicate export {0:?}")]
    DuplicateExport(String),
    #[error("export {name:?} refers to missing function {ordinal}")]
    ExportOutOfRange { name: String, ordinal: u32 },
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("function {function} references register {register} beyond its declared count")]
    RegisterOutOfRange { function: usize, register: u32 },
    #[error("function {function} branches to missing instruction {target}")]
    BranchOutOfRange { function: usize, target: u32 },
    #[error("function {function} references missing {kind} {ordinal}")]
    OrdinalOutOfRange {
        function: usize,
        kind: &'static str,
        ordinal: u32,
    },
    #[error("function {function} call boundary expects {expected} values, found {found}")]
    ArityMismatch {
        function: usize,
        expected: usize,
        found: usize,
    },
    #[error("function {function} does not end in a terminator")]
    MissingTerminator { function: usize },
    #[error("function {function} declares fewer registers than its signature marshals")]
    SignatureRegisters { function: usize },
}

/// A calling convention string: argument kinds, `_`, result kinds, over the
/// alphabet `i` (i32), `I` (i64, a register pair), and `r` (ref). Checked by
/// string equality at link time.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn parse(s: impl Into<String>) -> Result<Self, LoadError> {
        let s = s.into();
        let valid = s.chars().filter(|&c| c == '_').count() == 1
            && s.chars().all(|c| matches!(c, 'i' | 'I' | 'r' | '_'));
        match valid {
            true => Ok(Self(s)),
            false => Err(LoadError::InvalidSignature(s)),
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn args(&self) -> &str {
        self.0.split_once('_').expect("validated at parse").0
    }

    #[inline]
    pub fn results(&self) -> &str {
        self.0.split_once('_').expect("validated at parse").1
    }

    /// i32 register slots needed to marshal one side (i64 takes two).
    pub fn i32_slots(chars: &str) -> usize {
        chars
            .chars()
            .map(|c| match c {
                'I' => 2,
                'r' => 0,
                _ => 1,
            })
            .sum()
    }

    /// Ref register slots needed to marshal one side.
    pub fn ref_slots(chars: &str) -> usize {
        chars.chars().filter(|&c| c == 'r').count()
    }
}

#[derive(Debug)]
pub struct Function {
    name: String,
    signature: Signature,
    i32_register_count: u16,
    ref_register_count: u16,
    bytecode: Vec<u8>,
    pub(crate) instructions: Vec<Instruction>,
}

impl Function {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[inline]
    pub fn i32_register_count(&self) -> u16 {
        self.i32_register_count
    }

    #[inline]
    pub fn ref_register_count(&self) -> u16 {
        self.ref_register_count
    }

    #[inline]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub signature: Signature,
}

/// An immutable, loaded bytecode module, shared by every context that links
/// it. Produced by the external compiler; [`ModuleBuilder`] is that
/// contract's writing half.
#[derive(Debug)]
pub struct Module {
    name: String,
    functions: Vec<Function>,
    imports: Vec<Import>,
    exports: HashMap<String, usize>,
    rodata: Vec<Arc<[u8]>>,
    types: Vec<RefType>,
}

impl Module {
    /// Parses, decodes, and validates a serialized module. Everything the
    /// dispatch loop trusts (register indices, branch targets, ordinals,
    /// call boundaries) is proven here.
    pub fn load(bytes: &[u8]) -> Result<Arc<Self>, LoadError> {
        let mut reader = Reader { bytes, offset: 0 };
        if reader.u32()? != MAGIC {
            return Err(LoadError::BadMagic);
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(LoadError::UnsupportedVersion(version));
        }
        let name = reader.str()?;

        let type_count = reader.u32()? as usize;
        let mut types = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            let name = reader.str()?;
            let ty = RefType::from_type_name(&name).ok_or(LoadError::UnknownType(name))?;
            types.push(ty);
        }

        let rodata_count = reader.u32()? as usize;
        let mut rodata = Vec::with_capacity(rodata_count);
        for _ in 0..rodata_count {
            let len = reader.u32()? as usize;
            rodata.push(Arc::<[u8]>::from(reader.take(len)?));
        }

        let import_count = reader.u32()? as usize;
        let mut imports = Vec::with_capacity(import_count);
        for _ in 0..import_count {
            let name = reader.str()?;
            let signature = Signature::parse(reader.str()?)?;
            imports.push(Import { name, signature });
        }

        let export_count = reader.u32()? as usize;
        let mut export_entries = Vec::with_capacity(export_count);
        for _ in 0..export_count {
            let name = reader.str()?;
            let ordinal = reader.u32()?;
            export_entries.push((name, ordinal));
        }

        let function_count = reader.u32()? as usize;
        let mut decls = Vec::with_capacity(function_count);
        for _ in 0..function_count {
            let name = reader.str()?;
            let signature = Signature::parse(reader.str()?)?;
            let i32_register_count = reader.u16()?;
            let ref_register_count = reader.u16()?;
            let len = reader.u32()? as usize;
            let bytecode = reader.take(len)?.to_vec();
            decls.push((name, signature, i32_register_count, ref_register_count, bytecode));
        }
        if reader.offset != bytes.len() {
            return Err(LoadError::TrailingBytes);
        }

        let mut exports = HashMap::default();
        for (name, ordinal) in export_entries {
            if ordinal as usize >= decls.len() {
                return Err(LoadError::ExportOutOfRange { name, ordinal });
            }
            if exports.insert(name.clone(), ordinal as usize).is_some() {
                return Err(LoadError::DuplicateExport(name));
            }
        }

        let function_signatures: Vec<_> =
            decls.iter().map(|(_, signature, ..)| signature.clone()).collect();
        let import_signatures: Vec<_> =
            imports.iter().map(|import| import.signature.clone()).collect();

        let mut functions = Vec::with_capacity(decls.len());
        for (index, (name, signature, i32_register_count, ref_register_count, code)) in
            decls.into_iter().enumerate()
        {
            // the frame must be able to hold the marshaled arguments and
            // results of the function's own signature
            let i32_needed = Signature::i32_slots(signature.args())
                .max(Signature::i32_slots(signature.results()));
            let ref_needed = Signature::ref_slots(signature.args())
                .max(Signature::ref_slots(signature.results()));
            if i32_needed > i32_register_count as usize
                || ref_needed > ref_register_count as usize
            {
                return Err(LoadError::SignatureRegisters { function: index });
            }

            let instructions = bytecode::decode_all(&code)?;
            bytecode::validate(
                &instructions,
                &ValidationContext {
                    function: index,
                    i32_count: i32_register_count,
                    ref_count: ref_register_count,
                    signature: &signature,
                    function_signatures: &function_signatures,
                    import_signatures: &import_signatures,
                    rodata_count: rodata.len(),
                },
            )?;
            functions.push(Function {
                name,
                signature,
                i32_register_count,
                ref_register_count,
                bytecode: code,
                instructions,
            });
        }

        Ok(Arc::new(Self {
            name,
            functions,
            imports,
            exports,
            rodata,
            types,
        }))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    #[inline]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    #[inline]
    pub fn rodata(&self) -> &[Arc<[u8]>] {
        &self.rodata
    }

    #[inline]
    pub fn types(&self) -> &[RefType] {
        &self.types
    }

    pub fn export(&self, name: &str) -> Option<usize> {
        self.exports.get(name).copied()
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, usize)> {
        self.exports.iter().map(|(name, &ordinal)| (name.as_str(), ordinal))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], LoadError> {
        let end = self.offset.checked_add(count).ok_or(LoadError::Truncated)?;
        let bytes = self.bytes.get(self.offset..end).ok_or(LoadError::Truncated)?;
        self.offset = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn str(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Utf8)
    }
}

/// Serializes the module container format. This is the compiler's half of
/// the contract; the runtime uses it to author test modules.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    name: String,
    types: Vec<String>,
    rodata: Vec<Vec<u8>>,
    imports: Vec<(String, String)>,
    exports: Vec<(String, u32)>,
    functions: Vec<(String, String, u16, u16, Vec<u8>)>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_type(mut self, name: impl Into<String>) -> Self {
        self.types.push(name.into());
        self
    }

    /// Appends a rodata segment, returning its ordinal.
    pub fn add_rodata(&mut self, bytes: impl Into<Vec<u8>>) -> u32 {
        self.rodata.push(bytes.into());
        self.rodata.len() as u32 - 1
    }

    /// Declares an import by fully-qualified name, returning its ordinal.
    pub fn add_import(&mut self, name: impl Into<String>, signature: impl Into<String>) -> u32 {
        self.imports.push((name.into(), signature.into()));
        self.imports.len() as u32 - 1
    }

    /// Appends a function, returning its ordinal.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        i32_register_count: u16,
        ref_register_count: u16,
        instructions: &[Instruction],
    ) -> u32 {
        self.functions.push((
            name.into(),
            signature.into(),
            i32_register_count,
            ref_register_count,
            bytecode::encode_all(instructions),
        ));
        self.functions.len() as u32 - 1
    }

    pub fn export(mut self, name: impl Into<String>, ordinal: u32) -> Self {
        self.exports.push((name.into(), ordinal));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        emit_str(&mut out, &self.name);

        emit_u32(&mut out, self.types.len() as u32);
        for ty in &self.types {
            emit_str(&mut out, ty);
        }
        emit_u32(&mut out, self.rodata.len() as u32);
        for segment in &self.rodata {
            emit_u32(&mut out, segment.len() as u32);
            out.extend_from_slice(segment);
        }
        emit_u32(&mut out, self.imports.len() as u32);
        for (name, signature) in &self.imports {
            emit_str(&mut out, name);
            emit_str(&mut out, signature);
        }
        emit_u32(&mut out, self.exports.len() as u32);
        for (name, ordinal) in &self.exports {
            emit_str(&mut out, name);
            emit_u32(&mut out, *ordinal);
        }
        emit_u32(&mut out, self.functions.len() as u32);
        for (name, signature, i32_count, ref_count, code) in &self.functions {
            emit_str(&mut out, name);
            emit_str(&mut out, signature);
            out.extend_from_slice(&i32_count.to_le_bytes());
            out.extend_from_slice(&ref_count.to_le_bytes());
            emit_u32(&mut out, code.len() as u32);
            out.extend_from_slice(code);
        }
        out
    }
}

fn emit_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn emit_str(out: &mut Vec<u8>, s: &str) {
    emit_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_builder() -> ModuleBuilder {
        let mut builder = ModuleBuilder::new("sample")
            .add_type("hal.buffer")
            .add_type("util.bytes");
        let message = builder.add_rodata(*b"boom");
        let greeting = builder.add_rodata(*b"hello world");
        assert_eq!((message, greeting), (0, 1));
        builder.add_import("hal.semaphore.create", "i_r");

        let add_one = builder.add_function(
            "add_one",
            "i_i",
            2,
            0,
            &[
                Instruction::ConstI32 { dst: 1, value: 1 },
                Instruction::BinaryI32 {
                    op: super::super::bytecode::BinaryI32Op::Add,
                    dst: 0,
                    lhs: 0,
                    rhs: 1,
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        builder.export("add_one", add_one)
    }

    #[test]
    fn test_round_trip_tables() {
        let bytes = sample_builder().build();
        let module = Module::load(&bytes).unwrap();

        assert_eq!(module.name(), "sample");
        assert_eq!(module.types(), &[RefType::Buffer, RefType::Bytes]);
        assert_eq!(module.rodata().len(), 2);
        assert_eq!(&module.rodata()[1][..], b"hello world");
        assert_eq!(
            module.imports(),
            &[Import {
                name: "hal.semaphore.create".into(),
                signature: Signature::parse("i_r").unwrap(),
            }]
        );
        assert_eq!(module.export("add_one"), Some(0));
        assert_eq!(module.export("missing"), None);

        let function = &module.functions()[0];
        assert_eq!(function.name(), "add_one");
        assert_eq!(function.signature().as_str(), "i_i");
        assert_eq!(function.i32_register_count(), 2);
        assert_eq!(function.ref_register_count(), 0);
        assert_eq!(function.instructions.len(), 3);

        // loading the same bytes again yields identical tables
        let again = Module::load(&bytes).unwrap();
        assert_eq!(again.functions()[0].bytecode(), function.bytecode());
    }

    #[test]
    fn test_load_rejects_malformed() {
        assert!(matches!(Module::load(b"no"), Err(LoadError::Truncated)));
        assert!(matches!(
            Module::load(&[0xDE, 0xAD, 0xBE, 0xEF, 1, 0, 0, 0]),
            Err(LoadError::BadMagic)
        ));

        let mut bytes = sample_builder().build();
        bytes.push(0);
        assert!(matches!(Module::load(&bytes), Err(LoadError::TrailingBytes)));
    }

    #[test]
    fn test_load_rejects_unknown_type() {
        let bytes = ModuleBuilder::new("m").add_type("hal.mystery").build();
        assert!(matches!(Module::load(&bytes), Err(LoadError::UnknownType(_))));
    }

    #[test]
    fn test_load_rejects_bad_export() {
        let bytes = ModuleBuilder::new("m").export("f", 0).build();
        assert!(matches!(
            Module::load(&bytes),
            Err(LoadError::ExportOutOfRange { ordinal: 0, .. })
        ));
    }

    #[test]
    fn test_load_rejects_register_overflow() {
        let mut builder = ModuleBuilder::new("m");
        // declares 1 register but stores into register 5
        builder.add_function(
            "f",
            "_",
            1,
            0,
            &[
                Instruction::ConstI32 { dst: 5, value: 0 },
                Instruction::Return { values: vec![] },
            ],
        );
        assert!(matches!(
            Module::load(&builder.build()),
            Err(LoadError::RegisterOutOfRange { register: 5, .. })
        ));
    }

    #[test]
    fn test_load_rejects_signature_register_shortfall() {
        let mut builder = ModuleBuilder::new("m");
        // "ii_i" needs two i32 registers to receive its arguments
        builder.add_function("f", "ii_i", 1, 0, &[Instruction::Return { values: vec![0] }]);
        assert!(matches!(
            Module::load(&builder.build()),
            Err(LoadError::SignatureRegisters { function: 0 })
        ));
    }

    #[test]
    fn test_signature_slots() {
        let signature = Signature::parse("iIr_I").unwrap();
        assert_eq!(Signature::i32_slots(signature.args()), 3);
        assert_eq!(Signature::ref_slots(signature.args()), 1);
        assert_eq!(Signature::i32_slots(signature.results()), 2);
        assert!(Signature::parse("ii").is_err());
        assert!(Signature::parse("x_").is_err());
    }
}
