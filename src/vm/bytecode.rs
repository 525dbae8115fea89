use super::module::{LoadError, Signature};

/// Wire opcodes. The numeric values are part of the module format and never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    ConstI32 = 0x01,
    ConstI64 = 0x02,
    ConstRef = 0x03,
    MoveI32 = 0x10,
    CloneRef = 0x11,
    MoveRef = 0x12,
    NullRef = 0x13,
    AddI32 = 0x20,
    SubI32 = 0x21,
    MulI32 = 0x22,
    DivI32S = 0x23,
    RemI32S = 0x24,
    AndI32 = 0x25,
    OrI32 = 0x26,
    XorI32 = 0x27,
    AddI64 = 0x28,
    CmpEqI32 = 0x30,
    CmpNeI32 = 0x31,
    CmpLtI32S = 0x32,
    AddF32 = 0x40,
    SubF32 = 0x41,
    MulF32 = 0x42,
    DivF32 = 0x43,
    CastSiToF32 = 0x48,
    CastF32ToSi = 0x49,
    Branch = 0x50,
    CondBranch = 0x51,
    Call = 0x60,
    CallImport = 0x61,
    Return = 0x62,
    Fail = 0x63,
}

impl TryFrom<u8> for Opcode {
    type Error = LoadError;

    fn try_from(byte: u8) -> Result<Self, LoadError> {
        use Opcode::*;
        Ok(match byte {
            0x01 => ConstI32,
            0x02 => ConstI64,
            0x03 => ConstRef,
            0x10 => MoveI32,
            0x11 => CloneRef,
            0x12 => MoveRef,
            0x13 => NullRef,
            0x20 => AddI32,
            0x21 => SubI32,
            0x22 => MulI32,
            0x23 => DivI32S,
            0x24 => RemI32S,
            0x25 => AndI32,
            0x26 => OrI32,
            0x27 => XorI32,
            0x28 => AddI64,
            0x30 => CmpEqI32,
            0x31 => CmpNeI32,
            0x32 => CmpLtI32S,
            0x40 => AddF32,
            0x41 => SubF32,
            0x42 => MulF32,
            0x43 => DivF32,
            0x48 => CastSiToF32,
            0x49 => CastF32ToSi,
            0x50 => Branch,
            0x51 => CondBranch,
            0x60 => Call,
            0x61 => CallImport,
            0x62 => Return,
            0x63 => Fail,
            _ => return Err(LoadError::UnknownOpcode(byte)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryI32Op {
    Add,
    Sub,
    Mul,
    DivS,
    RemS,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryF32Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareI32Op {
    Eq,
    Ne,
    LtS,
}

/// Decoded instruction form the dispatch loop runs against. Branch targets
/// are instruction indices, proven in range at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    ConstI32 { dst: u16, value: i32 },
    /// Writes the pair `dst` (low word) and `dst + 1` (high word).
    ConstI64 { dst: u16, value: i64 },
    /// Wraps a rodata segment as a bytes ref.
    ConstRef { dst: u16, rodata: u32 },
    MoveI32 { dst: u16, src: u16 },
    /// Retains: both registers hold the object afterwards.
    CloneRef { dst: u16, src: u16 },
    /// Transfers ownership: the source register is nulled.
    MoveRef { dst: u16, src: u16 },
    NullRef { dst: u16 },
    BinaryI32 { op: BinaryI32Op, dst: u16, lhs: u16, rhs: u16 },
    /// Operates on register pairs.
    AddI64 { dst: u16, lhs: u16, rhs: u16 },
    CompareI32 { op: CompareI32Op, dst: u16, lhs: u16, rhs: u16 },
    BinaryF32 { op: BinaryF32Op, dst: u16, lhs: u16, rhs: u16 },
    CastSiToF32 { dst: u16, src: u16 },
    /// Saturates at the representable range; NaN converts to zero.
    CastF32ToSi { dst: u16, src: u16 },
    Branch { target: u32 },
    CondBranch { cond: u16, true_target: u32, false_target: u32 },
    /// Direct call within the module. `args`/`results` list registers in
    /// the callee signature's order, i32 and ref indices interleaved by
    /// kind.
    Call { function: u32, args: Vec<u16>, results: Vec<u16> },
    CallImport { import: u32, args: Vec<u16>, results: Vec<u16> },
    Return { values: Vec<u16> },
    /// Aborts the invocation with a status code and a rodata message.
    Fail { code: u16, message: u32 },
}

impl Instruction {
    fn opcode(&self) -> Opcode {
        match self {
            Instruction::ConstI32 { .. } => Opcode::ConstI32,
            Instruction::ConstI64 { .. } => Opcode::ConstI64,
            Instruction::ConstRef { .. } => Opcode::ConstRef,
            Instruction::MoveI32 { .. } => Opcode::MoveI32,
            Instruction::CloneRef { .. } => Opcode::CloneRef,
            Instruction::MoveRef { .. } => Opcode::MoveRef,
            Instruction::NullRef { .. } => Opcode::NullRef,
            Instruction::BinaryI32 { op, .. } => match op {
                BinaryI32Op::Add => Opcode::AddI32,
                BinaryI32Op::Sub => Opcode::SubI32,
                BinaryI32Op::Mul => Opcode::MulI32,
                BinaryI32Op::DivS => Opcode::DivI32S,
                BinaryI32Op::RemS => Opcode::RemI32S,
                BinaryI32Op::And => Opcode::AndI32,
                BinaryI32Op::Or => Opcode::OrI32,
                BinaryI32Op::Xor => Opcode::XorI32,
            },
            Instruction::AddI64 { .. } => Opcode::AddI64,
            Instruction::CompareI32 { op, .. } => match op {
                CompareI32Op::Eq => Opcode::CmpEqI32,
                CompareI32Op::Ne => Opcode::CmpNeI32,
                CompareI32Op::LtS => Opcode::CmpLtI32S,
            },
            Instruction::BinaryF32 { op, .. } => match op {
                BinaryF32Op::Add => Opcode::AddF32,
                BinaryF32Op::Sub => Opcode::SubF32,
                BinaryF32Op::Mul => Opcode::MulF32,
                BinaryF32Op::Div => Opcode::DivF32,
            },
            Instruction::CastSiToF32 { .. } => Opcode::CastSiToF32,
            Instruction::CastF32ToSi { .. } => Opcode::CastF32ToSi,
            Instruction::Branch { .. } => Opcode::Branch,
            Instruction::CondBranch { .. } => Opcode::CondBranch,
            Instruction::Call { .. } => Opcode::Call,
            Instruction::CallImport { .. } => Opcode::CallImport,
            Instruction::Return { .. } => Opcode::Return,
            Instruction::Fail { .. } => Opcode::Fail,
        }
    }

    /// Terminators never fall through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { .. }
                | Instruction::CondBranch { .. }
                | Instruction::Return { .. }
                | Instruction::Fail { .. }
        )
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match self {
            Instruction::ConstI32 { dst, value } => {
                emit_u16(out, *dst);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Instruction::ConstI64 { dst, value } => {
                emit_u16(out, *dst);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Instruction::ConstRef { dst, rodata } => {
                emit_u16(out, *dst);
                emit_u32(out, *rodata);
            }
            Instruction::MoveI32 { dst, src }
            | Instruction::CloneRef { dst, src }
            | Instruction::MoveRef { dst, src }
            | Instruction::CastSiToF32 { dst, src }
            | Instruction::CastF32ToSi { dst, src } => {
                emit_u16(out, *dst);
                emit_u16(out, *src);
            }
            Instruction::NullRef { dst } => emit_u16(out, *dst),
            Instruction::BinaryI32 { dst, lhs, rhs, .. }
            | Instruction::AddI64 { dst, lhs, rhs }
            | Instruction::CompareI32 { dst, lhs, rhs, .. }
            | Instruction::BinaryF32 { dst, lhs, rhs, .. } => {
                emit_u16(out, *dst);
                emit_u16(out, *lhs);
                emit_u16(out, *rhs);
            }
            Instruction::Branch { target } => emit_u32(out, *target),
            Instruction::CondBranch {
                cond,
                true_target,
                false_target,
            } => {
                emit_u16(out, *cond);
                emit_u32(out, *true_target);
                emit_u32(out, *false_target);
            }
            Instruction::Call {
                function,
                args,
                results,
            } => {
                emit_u32(out, *function);
                emit_list(out, args);
                emit_list(out, results);
            }
            Instruction::CallImport {
                import,
                args,
                results,
            } => {
                emit_u32(out, *import);
                emit_list(out, args);
                emit_list(out, results);
            }
            Instruction::Return { values } => emit_list(out, values),
            Instruction::Fail { code, message } => {
                emit_u16(out, *code);
                emit_u32(out, *message);
            }
        }
    }
}

fn emit_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn emit_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn emit_list(out: &mut Vec<u8>, list: &[u16]) {
    debug_assert!(list.len() <= u8::MAX as usize);
    out.push(list.len() as u8);
    for &value in list {
        emit_u16(out, value);
    }
}

pub fn encode_all(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::new();
    for instruction in instructions {
        instruction.encode(&mut out);
    }
    out
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], LoadError> {
        let end = self.offset.checked_add(count).ok_or(LoadError::Truncated)?;
        let bytes = self.bytes.get(self.offset..end).ok_or(LoadError::Truncated)?;
        self.offset = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, LoadError> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    fn list(&mut self) -> Result<Vec<u16>, LoadError> {
        let count = self.u8()? as usize;
        (0..count).map(|_| self.u16()).collect()
    }
}

/// Decodes a full bytecode blob. Fails on unknown opcodes, truncation, and
/// trailing garbage; semantic checks happen in [`validate`].
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Instruction>, LoadError> {
    let mut cursor = Cursor { bytes, offset: 0 };
    let mut instructions = Vec::new();
    while cursor.offset < bytes.len() {
        let opcode = Opcode::try_from(cursor.u8()?)?;
        let instruction = match opcode {
            Opcode::ConstI32 => Instruction::ConstI32 {
                dst: cursor.u16()?,
                value: cursor.i32()?,
            },
            Opcode::ConstI64 => Instruction::ConstI64 {
                dst: cursor.u16()?,
                value: cursor.i64()?,
            },
            Opcode::ConstRef => Instruction::ConstRef {
                dst: cursor.u16()?,
                rodata: cursor.u32()?,
            },
            Opcode::MoveI32 => Instruction::MoveI32 {
                dst: cursor.u16()?,
                src: cursor.u16()?,
            },
            Opcode::CloneRef => Instruction::CloneRef {
                dst: cursor.u16()?,
                src: cursor.u16()?,
            },
            Opcode::MoveRef => Instruction::MoveRef {
                dst: cursor.u16()?,
                src: cursor.u16()?,
            },
            Opcode::NullRef => Instruction::NullRef { dst: cursor.u16()? },
            Opcode::AddI32
            | Opcode::SubI32
            | Opcode::MulI32
            | Opcode::DivI32S
            | Opcode::RemI32S
            | Opcode::AndI32
            | Opcode::OrI32
            | Opcode::XorI32 => {
                let op = match opcode {
                    Opcode::AddI32 => BinaryI32Op::Add,
                    Opcode::SubI32 => BinaryI32Op::Sub,
                    Opcode::MulI32 => BinaryI32Op::Mul,
                    Opcode::DivI32S => BinaryI32Op::DivS,
                    Opcode::RemI32S => BinaryI32Op::RemS,
                    Opcode::AndI32 => BinaryI32Op::And,
                    Opcode::OrI32 => BinaryI32Op::Or,
                    _ => BinaryI32Op::Xor,
                };
                Instruction::BinaryI32 {
                    op,
                    dst: cursor.u16()?,
                    lhs: cursor.u16()?,
                    rhs: cursor.u16()?,
                }
            }
            Opcode::AddI64 => Instruction::AddI64 {
                dst: cursor.u16()?,
                lhs: cursor.u16()?,
                rhs: cursor.u16()?,
            },
            Opcode::CmpEqI32 | Opcode::CmpNeI32 | Opcode::CmpLtI32S => {
                let op = match opcode {
                    Opcode::CmpEqI32 => CompareI32Op::Eq,
                    Opcode::CmpNeI32 => CompareI32Op::Ne,
                    _ => CompareI32Op::LtS,
                };
                Instruction::CompareI32 {
                    op,
                    dst: cursor.u16()?,
                    lhs: cursor.u16()?,
                    rhs: cursor.u16()?,
                }
            }
            Opcode::AddF32 | Opcode::SubF32 | Opcode::MulF32 | Opcode::DivF32 => {
                let op = match opcode {
                    Opcode::AddF32 => BinaryF32Op::Add,
                    Opcode::SubF32 => BinaryF32Op::Sub,
                    Opcode::MulF32 => BinaryF32Op::Mul,
                    _ => BinaryF32Op::Div,
                };
                Instruction::BinaryF32 {
                    op,
                    dst: cursor.u16()?,
                    lhs: cursor.u16()?,
                    rhs: cursor.u16()?,
                }
            }
            Opcode::CastSiToF32 => Instruction::CastSiToF32 {
                dst: cursor.u16()?,
                src: cursor.u16()?,
            },
            Opcode::CastF32ToSi => Instruction::CastF32ToSi {
                dst: cursor.u16()?,
                src: cursor.u16()?,
            },
            Opcode::Branch => Instruction::Branch {
                target: cursor.u32()?,
            },
            Opcode::CondBranch => Instruction::CondBranch {
                cond: cursor.u16()?,
                true_target: cursor.u32()?,
                false_target: cursor.u32()?,
            },
            Opcode::Call => Instruction::Call {
                function: cursor.u32()?,
                args: cursor.list()?,
                results: cursor.list()?,
            },
            Opcode::CallImport => Instruction::CallImport {
                import: cursor.u32()?,
                args: cursor.list()?,
                results: cursor.list()?,
            },
            Opcode::Return => Instruction::Return {
                values: cursor.list()?,
            },
            Opcode::Fail => Instruction::Fail {
                code: cursor.u16()?,
                message: cursor.u32()?,
            },
        };
        instructions.push(instruction);
    }
    Ok(instructions)
}

/// Everything a function's instructions may reference, for validation.
pub(crate) struct ValidationContext<'a> {
    pub function: usize,
    pub i32_count: u16,
    pub ref_count: u16,
    pub signature: &'a Signature,
    pub function_signatures: &'a [Signature],
    pub import_signatures: &'a [Signature],
    pub rodata_count: usize,
}

impl ValidationContext<'_> {
    fn check_i32(&self, reg: u16) -> Result<(), LoadError> {
        match reg < self.i32_count {
            true => Ok(()),
            false => Err(LoadError::RegisterOutOfRange {
                function: self.function,
                register: reg as u32,
            }),
        }
    }

    fn check_i32_pair(&self, reg: u16) -> Result<(), LoadError> {
        match (reg as u32 + 1) < self.i32_count as u32 {
            true => Ok(()),
            false => Err(LoadError::RegisterOutOfRange {
                function: self.function,
                register: reg as u32 + 1,
            }),
        }
    }

    fn check_ref(&self, reg: u16) -> Result<(), LoadError> {
        match reg < self.ref_count {
            true => Ok(()),
            false => Err(LoadError::RegisterOutOfRange {
                function: self.function,
                register: reg as u32,
            }),
        }
    }

    fn check_target(&self, target: u32, len: usize) -> Result<(), LoadError> {
        match (target as usize) < len {
            true => Ok(()),
            false => Err(LoadError::BranchOutOfRange {
                function: self.function,
                target,
            }),
        }
    }

    fn check_rodata(&self, ordinal: u32) -> Result<(), LoadError> {
        match (ordinal as usize) < self.rodata_count {
            true => Ok(()),
            false => Err(LoadError::OrdinalOutOfRange {
                function: self.function,
                kind: "rodata",
                ordinal,
            }),
        }
    }

    /// Checks a flat register list against one side of a signature.
    fn check_boundary(&self, chars: &str, regs: &[u16]) -> Result<(), LoadError> {
        if chars.len() != regs.len() {
            return Err(LoadError::ArityMismatch {
                function: self.function,
                expected: chars.len(),
                found: regs.len(),
            });
        }
        for (kind, &reg) in chars.chars().zip(regs) {
            match kind {
                'i' => self.check_i32(reg)?,
                'I' => self.check_i32_pair(reg)?,
                'r' => self.check_ref(reg)?,
                _ => unreachable!("signature validated at parse"),
            }
        }
        Ok(())
    }
}

/// Proves every register index, branch target, ordinal, and call boundary in
/// range so the dispatch loop never has to re-check them.
pub(crate) fn validate(
    instructions: &[Instruction],
    ctx: &ValidationContext,
) -> Result<(), LoadError> {
    if !instructions.last().is_some_and(Instruction::is_terminator) {
        return Err(LoadError::MissingTerminator {
            function: ctx.function,
        });
    }
    let len = instructions.len();
    for instruction in instructions {
        match instruction {
            Instruction::ConstI32 { dst, .. } => ctx.check_i32(*dst)?,
            Instruction::ConstI64 { dst, .. } => ctx.check_i32_pair(*dst)?,
            Instruction::ConstRef { dst, rodata } => {
                ctx.check_ref(*dst)?;
                ctx.check_rodata(*rodata)?;
            }
            Instruction::MoveI32 { dst, src }
            | Instruction::CastSiToF32 { dst, src }
            | Instruction::CastF32ToSi { dst, src } => {
                ctx.check_i32(*dst)?;
                ctx.check_i32(*src)?;
            }
            Instruction::CloneRef { dst, src } | Instruction::MoveRef { dst, src } => {
                ctx.check_ref(*dst)?;
                ctx.check_ref(*src)?;
            }
            Instruction::NullRef { dst } => ctx.check_ref(*dst)?,
            Instruction::BinaryI32 { dst, lhs, rhs, .. }
            | Instruction::CompareI32 { dst, lhs, rhs, .. }
            | Instruction::BinaryF32 { dst, lhs, rhs, .. } => {
                ctx.check_i32(*dst)?;
                ctx.check_i32(*lhs)?;
                ctx.check_i32(*rhs)?;
            }
            Instruction::AddI64 { dst, lhs, rhs } => {
                ctx.check_i32_pair(*dst)?;
                ctx.check_i32_pair(*lhs)?;
                ctx.check_i32_pair(*rhs)?;
            }
            Instruction::Branch { target } => ctx.check_target(*target, len)?,
            Instruction::CondBranch {
                cond,
                true_target,
                false_target,
            } => {
                ctx.check_i32(*cond)?;
                ctx.check_target(*true_target, len)?;
                ctx.check_target(*false_target, len)?;
            }
            Instruction::Call {
                function,
                args,
                results,
            } => {
                let signature = signature_or_err(
                    ctx.function_signatures.get(*function as usize),
                    ctx,
                    "function",
                    *function,
                )?;
                ctx.check_boundary(signature.args(), args)?;
                ctx.check_boundary(signature.results(), results)?;
            }
            Instruction::CallImport {
                import,
                args,
                results,
            } => {
                let signature = signature_or_err(
                    ctx.import_signatures.get(*import as usize),
                    ctx,
                    "import",
                    *import,
                )?;
                ctx.check_boundary(signature.args(), args)?;
                ctx.check_boundary(signature.results(), results)?;
            }
            Instruction::Return { values } => {
                ctx.check_boundary(ctx.signature.results(), values)?;
            }
            Instruction::Fail { code, message } => {
                ctx.check_i32(*code)?;
                ctx.check_rodata(*message)?;
            }
        }
    }
    Ok(())
}

fn signature_or_err<'a>(
    signature: Option<&'a Signature>,
    ctx: &ValidationContext,
    kind: &'static str,
    ordinal: u32,
) -> Result<&'a Signature, LoadError> {
    signature.ok_or(LoadError::OrdinalOutOfRange {
        function: ctx.function,
        kind,
        ordinal,
    })
}
