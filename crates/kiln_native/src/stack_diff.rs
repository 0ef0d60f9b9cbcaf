use crate::error::{native_error, Result, E_BYTECODE};
use kiln_core::bytecode::{Instruction, Opcode};
use kiln_core::{FunctionObject, Program, Selector, Value};

/// Net operand-stack effect of `instruction` inside `function`.
pub fn stack_diff(program: &Program, function: &FunctionObject, instruction: &Instruction) -> Result<i32> {
    if let Some(diff) = instruction.opcode.fixed_stack_diff() {
        return Ok(diff);
    }
    let diff = match instruction.opcode {
        Opcode::InvokeMethod | Opcode::InvokeNoSuchMethod => {
            let selector = Selector::from_raw(instruction.operand(0) as u32);
            1 - (selector.arity() as i32 + 1)
        }
        Opcode::InvokeStatic | Opcode::InvokeFactory => {
            let target = literal_object(function, instruction)?;
            let callee = program.heap.function(target).ok_or_else(|| {
                native_error(
                    E_BYTECODE,
                    format!("{} at bci {} does not reference a function", instruction.opcode.mnemonic(), instruction.bci),
                )
            })?;
            1 - callee.arity as i32
        }
        Opcode::Allocate | Opcode::AllocateImmutable => {
            let target = literal_object(function, instruction)?;
            let class = program.heap.class(target).ok_or_else(|| {
                native_error(
                    E_BYTECODE,
                    format!("allocate at bci {} does not reference a class", instruction.bci),
                )
            })?;
            1 - class.format.fields as i32
        }
        Opcode::InvokeSelector => -(instruction.operand(0) as i32 + 1),
        Opcode::Drop => -(instruction.operand(0) as i32),
        Opcode::PopAndBranchWide | Opcode::PopAndBranchBackWide => -(instruction.operand(0) as i32),
        // Pushes the return continuation as a smi.
        Opcode::SubroutineCall => 1,
        // Receiver, selector and arguments placeholders.
        Opcode::EnterNoSuchMethod => 3,
        other => {
            return Err(native_error(
                E_BYTECODE,
                format!("no stack effect known for '{}' at bci {}", other.mnemonic(), instruction.bci),
            ))
        }
    };
    Ok(diff)
}

pub(crate) fn literal_object(
    function: &FunctionObject,
    instruction: &Instruction,
) -> Result<kiln_core::ObjectId> {
    match literal(function, instruction)? {
        Value::Object(id) => Ok(id),
        Value::Smi(_) => Err(native_error(
            E_BYTECODE,
            format!(
                "{} at bci {} expects an object literal",
                instruction.opcode.mnemonic(),
                instruction.bci
            ),
        )),
    }
}

pub(crate) fn literal(function: &FunctionObject, instruction: &Instruction) -> Result<Value> {
    let index = instruction.operand(0);
    usize::try_from(index)
        .ok()
        .and_then(|index| function.literals.get(index).copied())
        .ok_or_else(|| {
            native_error(
                E_BYTECODE,
                format!(
                    "literal index {index} out of range at bci {}",
                    instruction.bci
                ),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::stack_diff;
    use kiln_core::builder::{Assembler, ProgramBuilder};
    use kiln_core::bytecode::{Instruction, Opcode};
    use kiln_core::{Program, Value};

    fn diff_of(program: &Program, function: kiln_core::ObjectId, bci: u32) -> i32 {
        let function = program.heap.function(function).unwrap();
        let instruction = Instruction::decode(&function.bytecodes, bci).unwrap();
        stack_diff(program, function, &instruction).unwrap()
    }

    #[test]
    fn fixed_effects_come_from_the_table() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.load_literal(1).emit(Opcode::Pop).emit(Opcode::ReturnNull);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        assert_eq!(diff_of(&program, main, 0), 1);
        assert_eq!(diff_of(&program, main, 1), -1);
        assert_eq!(diff_of(&program, main, 2), 0);
    }

    #[test]
    fn invocation_effects_depend_on_arity() {
        let mut builder = ProgramBuilder::new();
        let two = builder.selector(2);
        let mut callee = Assembler::new();
        callee.emit(Opcode::ReturnNull);
        let callee = builder.add_function("three", 3, callee.finish().unwrap(), Vec::new());
        let pair = builder.add_class("Pair", None, 2);

        let mut asm = Assembler::new();
        asm.invoke(Opcode::InvokeMethod, two);
        asm.emit_i(Opcode::InvokeStatic, 0);
        asm.emit_i(Opcode::Allocate, 1);
        asm.emit_b(Opcode::Drop, 4);
        asm.emit_b(Opcode::InvokeSelector, 2);
        asm.emit(Opcode::ReturnNull);
        let main = builder.add_function(
            "main",
            0,
            asm.finish().unwrap(),
            vec![Value::Object(callee), Value::Object(pair)],
        );
        let program = builder.build(main).unwrap();
        assert_eq!(diff_of(&program, main, 0), -2);
        assert_eq!(diff_of(&program, main, 5), -2);
        assert_eq!(diff_of(&program, main, 10), -1);
        assert_eq!(diff_of(&program, main, 15), -4);
        assert_eq!(diff_of(&program, main, 17), -3);
    }

    #[test]
    fn static_invoke_of_a_non_function_is_fatal() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.emit_i(Opcode::InvokeStatic, 0).emit(Opcode::ReturnNull);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), vec![Value::Smi(3)]);
        let program = builder.build(main).unwrap();
        let function = program.heap.function(main).unwrap();
        let instruction = Instruction::decode(&function.bytecodes, 0).unwrap();
        let err = stack_diff(&program, function, &instruction).unwrap_err();
        assert_eq!(err.code, "E0502");
    }
}
