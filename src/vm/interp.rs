use super::bytecode::{BinaryF32Op, BinaryI32Op, CompareI32Op, Instruction};
use super::context::{Context, ImportBinding, InvokeError, check_boundary_types};
use super::frame::CallFrame;
use super::value::{RefValue, Value};

/// Direct calls recurse on the host stack; this bounds runaway recursion in
/// guest code well before the host stack is at risk.
pub(crate) const MAX_CALL_DEPTH: usize = 128;

/// Runs one function to completion against a fresh call frame.
///
/// Register indices, branch targets, ordinals, and call boundaries were all
/// proven at load time; the loop indexes registers through safe accessors
/// without re-checking them.
pub(crate) fn call_function(
    context: &Context,
    module_index: usize,
    ordinal: usize,
    args: &[Value],
    depth: usize,
) -> Result<Vec<Value>, InvokeError> {
    if depth >= MAX_CALL_DEPTH {
        return Err(InvokeError::CallDepth(MAX_CALL_DEPTH));
    }
    let linked = context.linked(module_index);
    let function = &linked.module.functions()[ordinal];
    let rodata = linked.module.rodata();

    let mut frame = CallFrame::new(
        function.i32_register_count(),
        function.ref_register_count(),
    );
    marshal_args(&mut frame, function.signature().args(), args)?;

    let instructions = &function.instructions;
    let mut pc = 0usize;
    loop {
        match &instructions[pc] {
            Instruction::ConstI32 { dst, value } => frame.set_i32(*dst, *value),
            Instruction::ConstI64 { dst, value } => frame.set_i64(*dst, *value),
            Instruction::ConstRef { dst, rodata: ordinal } => {
                let bytes = rodata[*ordinal as usize].clone();
                frame.set_ref(*dst, Some(RefValue::Bytes(bytes)));
            }
            Instruction::MoveI32 { dst, src } => {
                let value = frame.i32(*src);
                frame.set_i32(*dst, value);
            }
            Instruction::CloneRef { dst, src } => {
                let value = frame.clone_ref(*src);
                frame.set_ref(*dst, value);
            }
            Instruction::MoveRef { dst, src } => {
                let value = frame.take_ref(*src);
                frame.set_ref(*dst, value);
            }
            Instruction::NullRef { dst } => frame.set_ref(*dst, None),
            Instruction::BinaryI32 { op, dst, lhs, rhs } => {
                let (lhs, rhs) = (frame.i32(*lhs), frame.i32(*rhs));
                let value = match op {
                    BinaryI32Op::Add => lhs.wrapping_add(rhs),
                    BinaryI32Op::Sub => lhs.wrapping_sub(rhs),
                    BinaryI32Op::Mul => lhs.wrapping_mul(rhs),
                    BinaryI32Op::DivS | BinaryI32Op::RemS if rhs == 0 => {
                        return Err(InvokeError::DivideByZero { pc });
                    }
                    BinaryI32Op::DivS => lhs.wrapping_div(rhs),
                    BinaryI32Op::RemS => lhs.wrapping_rem(rhs),
                    BinaryI32Op::And => lhs & rhs,
                    BinaryI32Op::Or => lhs | rhs,
                    BinaryI32Op::Xor => lhs ^ rhs,
                };
                frame.set_i32(*dst, value);
            }
            Instruction::AddI64 { dst, lhs, rhs } => {
                let value = frame.i64(*lhs).wrapping_add(frame.i64(*rhs));
                frame.set_i64(*dst, value);
            }
            Instruction::CompareI32 { op, dst, lhs, rhs } => {
                let (lhs, rhs) = (frame.i32(*lhs), frame.i32(*rhs));
                let value = match op {
                    CompareI32Op::Eq => lhs == rhs,
                    CompareI32Op::Ne => lhs != rhs,
                    CompareI32Op::LtS => lhs < rhs,
                };
                frame.set_i32(*dst, value as i32);
            }
            Instruction::BinaryF32 { op, dst, lhs, rhs } => {
                let (lhs, rhs) = (frame.f32(*lhs), frame.f32(*rhs));
                let value = match op {
                    BinaryF32Op::Add => lhs + rhs,
                    BinaryF32Op::Sub => lhs - rhs,
                    BinaryF32Op::Mul => lhs * rhs,
                    BinaryF32Op::Div => lhs / rhs,
                };
                frame.set_f32(*dst, value);
            }
            Instruction::CastSiToF32 { dst, src } => {
                let value = frame.i32(*src) as f32;
                frame.set_f32(*dst, value);
            }
            Instruction::CastF32ToSi { dst, src } => {
                // saturating: out-of-range values clamp to the representable
                // extremes and NaN converts to zero
                let value = frame.f32(*src) as i32;
                frame.set_i32(*dst, value);
            }
            Instruction::Branch { target } => {
                pc = *target as usize;
                continue;
            }
            Instruction::CondBranch {
                cond,
                true_target,
                false_target,
            } => {
                pc = match frame.i32(*cond) != 0 {
                    true => *true_target as usize,
                    false => *false_target as usize,
                };
                continue;
            }
            Instruction::Call {
                function: callee,
                args: arg_regs,
                results: result_regs,
            } => {
                let callee = *callee as usize;
                let signature = linked.module.functions()[callee].signature().clone();
                let call_args = gather(&frame, signature.args(), arg_regs)?;
                let results = call_function(context, module_index, callee, &call_args, depth + 1)?;
                scatter(&mut frame, signature.results(), result_regs, results)?;
            }
            Instruction::CallImport {
                import,
                args: arg_regs,
                results: result_regs,
            } => {
                let binding = &linked.imports[*import as usize];
                let signature = linked.module.imports()[*import as usize].signature.clone();
                let call_args = gather(&frame, signature.args(), arg_regs)?;
                let results = match binding {
                    ImportBinding::Native(function) => {
                        let results = (function.f)(&call_args)?;
                        check_boundary_types(signature.results(), &results)?;
                        results
                    }
                    ImportBinding::Bytecode { module, function } => {
                        call_function(context, *module, *function, &call_args, depth + 1)?
                    }
                };
                scatter(&mut frame, signature.results(), result_regs, results)?;
            }
            Instruction::Return { values } => {
                return gather(&frame, function.signature().results(), values);
            }
            Instruction::Fail { code, message } => {
                let code = frame.i32(*code);
                let message = String::from_utf8_lossy(&rodata[*message as usize]).into_owned();
                return Err(InvokeError::Failed { code, message });
            }
        }
        pc += 1;
    }
}

/// Copies boundary values into a fresh frame: i32 arguments fill the integer
/// arena from slot 0 upwards (i64 taking a pair), refs fill the ref arena.
/// The caller keeps its handles; the frame holds retained clones.
fn marshal_args(frame: &mut CallFrame, chars: &str, values: &[Value]) -> Result<(), InvokeError> {
    check_boundary_types(chars, values)?;
    let (mut next_i32, mut next_ref) = (0u16, 0u16);
    for value in values {
        match value {
            Value::I32(value) => {
                frame.set_i32(next_i32, *value);
                next_i32 += 1;
            }
            Value::I64(value) => {
                frame.set_i64(next_i32, *value);
                next_i32 += 2;
            }
            Value::Ref(value) => {
                frame.set_ref(next_ref, Some(value.clone()));
                next_ref += 1;
            }
        }
    }
    Ok(())
}

/// Reads registers out into boundary values per one signature side. Refs are
/// retained, never moved: the frame keeps its handle for the duration of the
/// call it is issuing.
fn gather(frame: &CallFrame, chars: &str, regs: &[u16]) -> Result<Vec<Value>, InvokeError> {
    chars
        .chars()
        .zip(regs)
        .map(|(kind, &reg)| match kind {
            'i' => Ok(Value::I32(frame.i32(reg))),
            'I' => Ok(Value::I64(frame.i64(reg))),
            _ => frame
                .clone_ref(reg)
                .map(Value::Ref)
                .ok_or(InvokeError::NullRef(reg)),
        })
        .collect()
}

/// Writes call results back into registers per the signature's result side.
fn scatter(
    frame: &mut CallFrame,
    chars: &str,
    regs: &[u16],
    values: Vec<Value>,
) -> Result<(), InvokeError> {
    check_boundary_types(chars, &values)?;
    for (&reg, value) in regs.iter().zip(values) {
        match value {
            Value::I32(value) => frame.set_i32(reg, value),
            Value::I64(value) => frame.set_i64(reg, value),
            Value::Ref(value) => frame.set_ref(reg, Some(value)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::vm::module::{Module, ModuleBuilder};

    fn single_function(signature: &str, i32s: u16, refs: u16, code: &[Instruction]) -> Context {
        let mut builder = ModuleBuilder::new("m");
        let f = builder.add_function("f", signature, i32s, refs, code);
        let module = Module::load(&builder.export("f", f).build()).unwrap();
        Context::new(vec![module], vec![]).unwrap()
    }

    #[test]
    fn test_add_one() {
        let context = single_function(
            "i_i",
            2,
            0,
            &[
                Instruction::ConstI32 { dst: 1, value: 1 },
                Instruction::BinaryI32 {
                    op: BinaryI32Op::Add,
                    dst: 0,
                    lhs: 0,
                    rhs: 1,
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        let outputs = context.invoke("f", vec![Value::I32(41)]).unwrap();
        assert_eq!(outputs[0].as_i32(), Some(42));
    }

    #[test]
    fn test_branching_loop() {
        // sums 1..=n by counting down
        let context = single_function(
            "i_i",
            4,
            0,
            &[
                // i1 = 0 (acc), i2 = 0, i3 = 1
                Instruction::ConstI32 { dst: 1, value: 0 },
                Instruction::ConstI32 { dst: 2, value: 0 },
                Instruction::ConstI32 { dst: 3, value: 1 },
                // loop: if n == 0 -> exit
                Instruction::CompareI32 {
                    op: CompareI32Op::Eq,
                    dst: 2,
                    lhs: 0,
                    rhs: 2,
                },
                Instruction::CondBranch {
                    cond: 2,
                    true_target: 9,
                    false_target: 5,
                },
                // acc += n; n -= 1; restore scratch; loop
                Instruction::BinaryI32 {
                    op: BinaryI32Op::Add,
                    dst: 1,
                    lhs: 1,
                    rhs: 0,
                },
                Instruction::BinaryI32 {
                    op: BinaryI32Op::Sub,
                    dst: 0,
                    lhs: 0,
                    rhs: 3,
                },
                Instruction::ConstI32 { dst: 2, value: 0 },
                Instruction::Branch { target: 3 },
                Instruction::Return { values: vec![1] },
            ],
        );
        let outputs = context.invoke("f", vec![Value::I32(10)]).unwrap();
        assert_eq!(outputs[0].as_i32(), Some(55));
    }

    #[test]
    fn test_saturating_float_to_int() {
        let context = single_function(
            "i_i",
            1,
            0,
            &[
                Instruction::CastF32ToSi { dst: 0, src: 0 },
                Instruction::Return { values: vec![0] },
            ],
        );
        let cast = |bits: f32| {
            let outputs = context
                .invoke("f", vec![Value::I32(bits.to_bits() as i32)])
                .unwrap();
            outputs[0].as_i32().unwrap()
        };
        assert_eq!(cast(41.9), 41);
        assert_eq!(cast(-41.9), -41);
        // at or above the signed-32 maximum saturates instead of wrapping
        assert_eq!(cast(2.0e9_f32 * 2.0), i32::MAX);
        assert_eq!(cast(f32::INFINITY), i32::MAX);
        assert_eq!(cast(f32::NEG_INFINITY), i32::MIN);
        assert_eq!(cast(f32::NAN), 0);
    }

    #[test]
    fn test_int_to_float_and_back() {
        let context = single_function(
            "i_i",
            2,
            0,
            &[
                Instruction::CastSiToF32 { dst: 1, src: 0 },
                Instruction::CastF32ToSi { dst: 0, src: 1 },
                Instruction::Return { values: vec![0] },
            ],
        );
        for value in [0, 1, -1, 123_456, -99] {
            let outputs = context.invoke("f", vec![Value::I32(value)]).unwrap();
            assert_eq!(outputs[0].as_i32(), Some(value));
        }
    }

    #[test]
    fn test_f32_arithmetic_bit_patterns() {
        let context = single_function(
            "ii_i",
            2,
            0,
            &[
                Instruction::BinaryF32 {
                    op: BinaryF32Op::Mul,
                    dst: 0,
                    lhs: 0,
                    rhs: 1,
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        let (a, b) = (1.5f32, -2.25f32);
        let outputs = context
            .invoke(
                "f",
                vec![
                    Value::I32(a.to_bits() as i32),
                    Value::I32(b.to_bits() as i32),
                ],
            )
            .unwrap();
        let bits = outputs[0].as_i32().unwrap() as u32;
        assert_eq!(f32::from_bits(bits), a * b);
    }

    #[test]
    fn test_i64_register_pairs() {
        let context = single_function(
            "II_I",
            6,
            0,
            &[
                Instruction::AddI64 {
                    dst: 4,
                    lhs: 0,
                    rhs: 2,
                },
                Instruction::Return { values: vec![4] },
            ],
        );
        let outputs = context
            .invoke(
                "f",
                vec![Value::I64(0x1_0000_0001), Value::I64(0x2_0000_0002)],
            )
            .unwrap();
        assert_eq!(outputs[0].as_i64(), Some(0x3_0000_0003));
    }

    #[test]
    fn test_divide_by_zero() {
        let context = single_function(
            "ii_i",
            2,
            0,
            &[
                Instruction::BinaryI32 {
                    op: BinaryI32Op::DivS,
                    dst: 0,
                    lhs: 0,
                    rhs: 1,
                },
                Instruction::Return { values: vec![0] },
            ],
        );
        let err = context
            .invoke("f", vec![Value::I32(1), Value::I32(0)])
            .unwrap_err();
        assert!(matches!(err, InvokeError::DivideByZero { pc: 0 }));
    }

    #[test]
    fn test_fail_instruction() {
        let mut builder = ModuleBuilder::new("m");
        let message = builder.add_rodata(*b"tensor shape mismatch");
        let f = builder.add_function(
            "f",
            "_",
            1,
            0,
            &[
                Instruction::ConstI32 { dst: 0, value: 11 },
                Instruction::Fail { code: 0, message },
            ],
        );
        let module = Module::load(&builder.export("f", f).build()).unwrap();
        let context = Context::new(vec![module], vec![]).unwrap();

        let err = context.invoke("f", vec![]).unwrap_err();
        match err {
            InvokeError::Failed { code, message } => {
                assert_eq!(code, 11);
                assert_eq!(message, "tensor shape mismatch");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_call_depth_limit() {
        // f() calls itself forever
        let context = single_function(
            "_",
            0,
            0,
            &[
                Instruction::Call {
                    function: 0,
                    args: vec![],
                    results: vec![],
                },
                Instruction::Return { values: vec![] },
            ],
        );
        let err = context.invoke("f", vec![]).unwrap_err();
        assert!(matches!(err, InvokeError::CallDepth(MAX_CALL_DEPTH)));
    }

    #[test]
    fn test_ref_identity_and_balance() {
        // identity over a ref: callers retain their argument across the call
        let context = single_function(
            "r_r",
            0,
            1,
            &[Instruction::Return { values: vec![0] }],
        );
        let bytes: Arc<[u8]> = vec![1, 2, 3].into();
        let handle = RefValue::Bytes(bytes);
        assert_eq!(handle.ref_count(), 1);

        for _ in 0..2 {
            let outputs = context
                .invoke("f", vec![Value::Ref(handle.clone())])
                .unwrap();
            // one live handle here, one inside the returned value
            assert_eq!(handle.ref_count(), 2);
            match &outputs[0] {
                Value::Ref(RefValue::Bytes(out)) => assert_eq!(&out[..], &[1, 2, 3]),
                other => panic!("unexpected: {other:?}"),
            }
        }
        // all frames unwound: the count is balanced
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_move_ref_nulls_source() {
        let context = single_function(
            "r_r",
            0,
            2,
            &[
                Instruction::MoveRef { dst: 1, src: 0 },
                Instruction::Return { values: vec![1] },
            ],
        );
        let handle = RefValue::Bytes(vec![9u8].into());
        let outputs = context.invoke("f", vec![Value::Ref(handle.clone())]).unwrap();
        assert_eq!(handle.ref_count(), 2);
        drop(outputs);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_null_ref_argument_rejected() {
        let context = single_function(
            "r_r",
            0,
            2,
            &[
                Instruction::NullRef { dst: 0 },
                Instruction::Return { values: vec![0] },
            ],
        );
        let err = context
            .invoke("f", vec![Value::Ref(RefValue::Bytes(vec![].into()))])
            .unwrap_err();
        assert!(matches!(err, InvokeError::NullRef(0)));
    }
}
