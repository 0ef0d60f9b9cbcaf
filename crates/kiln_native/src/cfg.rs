//! Basic-block discovery and operand-stack heights for one bytecode function.

use crate::error::{native_error, Result, E_BYTECODE, E_STACK};
use crate::stack_diff::stack_diff;
use kiln_core::bytecode::{Instruction, Opcode};
use kiln_core::{FunctionObject, Program};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    /// Block heads mapped to the operand-stack height on entry.
    pub labels: BTreeMap<u32, u32>,
    /// Highest operand-stack height reached anywhere in the function.
    pub max_height: u32,
    /// Offsets at which a subroutine call resumes.
    pub continuations: BTreeSet<u32>,
}

impl BlockLayout {
    pub fn height_at(&self, bci: u32) -> Option<u32> {
        self.labels.get(&bci).copied()
    }

    pub fn is_label(&self, bci: u32) -> bool {
        self.labels.contains_key(&bci)
    }
}

pub fn reconstruct(program: &Program, name: &str, function: &FunctionObject) -> Result<BlockLayout> {
    let mut explorer = Explorer {
        program,
        name,
        function,
        labels: BTreeMap::new(),
        scanned: BTreeMap::new(),
        todo: BTreeMap::new(),
        max_height: 0,
        continuations: BTreeSet::new(),
    };
    explorer.enqueue(0, 0, 0)?;
    for range in &function.catch_ranges {
        explorer.enqueue(i64::from(range.start), i64::from(range.frame_size), range.start)?;
    }
    while let Some((bci, height)) = explorer.todo.pop_first() {
        explorer.scan(bci, height)?;
    }
    log::trace!(
        "{name}: {} blocks, max stack height {}",
        explorer.labels.len(),
        explorer.max_height
    );
    Ok(BlockLayout {
        labels: explorer.labels,
        max_height: explorer.max_height,
        continuations: explorer.continuations,
    })
}

struct Explorer<'a> {
    program: &'a Program,
    name: &'a str,
    function: &'a FunctionObject,
    labels: BTreeMap<u32, u32>,
    /// Height at the start of every instruction visited by a linear scan.
    scanned: BTreeMap<u32, u32>,
    todo: BTreeMap<u32, u32>,
    max_height: u32,
    continuations: BTreeSet<u32>,
}

impl Explorer<'_> {
    fn enqueue(&mut self, bci: i64, height: i64, from: u32) -> Result<()> {
        let code_len = self.function.bytecodes.len() as i64;
        if bci < 0 || bci >= code_len {
            return Err(native_error(
                E_BYTECODE,
                format!("{}: branch at bci {from} targets {bci}, outside the function", self.name),
            ));
        }
        if height < 0 {
            return Err(self.underflow(from));
        }
        let (bci, height) = (bci as u32, height as u32);
        self.max_height = self.max_height.max(height);
        if let Some(&known) = self.labels.get(&bci).or_else(|| self.scanned.get(&bci)) {
            if known != height {
                return Err(native_error(
                    E_STACK,
                    format!(
                        "{}: stack height mismatch at bci {bci}: recorded {known}, reached with {height} from bci {from}",
                        self.name
                    ),
                ));
            }
            self.labels.insert(bci, height);
            return Ok(());
        }
        self.labels.insert(bci, height);
        self.todo.insert(bci, height);
        Ok(())
    }

    fn underflow(&self, bci: u32) -> crate::NativeError {
        native_error(
            E_STACK,
            format!("{}: operand stack underflow at bci {bci}", self.name),
        )
    }

    fn scan(&mut self, start: u32, mut height: u32) -> Result<()> {
        let function = self.function;
        let code = &function.bytecodes;
        let mut bci = start;
        loop {
            if bci != start && (self.labels.contains_key(&bci) || self.scanned.contains_key(&bci)) {
                // Fell through into a block head or into code already covered.
                return self.enqueue(i64::from(bci), i64::from(height), bci);
            }
            if self.scanned.contains_key(&bci) {
                return Ok(());
            }
            self.scanned.insert(bci, height);
            let instruction = Instruction::decode(code, bci)?;
            let diff = stack_diff(self.program, function, &instruction)?;
            let after = i64::from(height) + i64::from(diff);
            if after < 0 {
                return Err(self.underflow(bci));
            }
            self.max_height = self.max_height.max(after as u32);

            let target = instruction.branch_target();
            match instruction.opcode {
                op if op.is_conditional_branch() => {
                    self.enqueue(i64::from(instruction.next_bci()), after, bci)?;
                    self.enqueue(self.target(target, bci)?, after, bci)?;
                    return Ok(());
                }
                Opcode::BranchWide
                | Opcode::BranchBack
                | Opcode::BranchBackWide
                | Opcode::PopAndBranchWide
                | Opcode::PopAndBranchBackWide => {
                    self.enqueue(self.target(target, bci)?, after, bci)?;
                    return Ok(());
                }
                Opcode::SubroutineCall => {
                    self.enqueue(self.target(target, bci)?, after, bci)?;
                    let continuation = instruction
                        .subroutine_continuation()
                        .ok_or_else(|| self.malformed(bci))?;
                    self.enqueue(continuation, i64::from(height), bci)?;
                    self.continuations.insert(continuation as u32);
                    return Ok(());
                }
                Opcode::Return
                | Opcode::ReturnNull
                | Opcode::ExitNoSuchMethod
                | Opcode::SubroutineReturn => return Ok(()),
                Opcode::MethodEnd => {
                    return Err(native_error(
                        E_BYTECODE,
                        format!("{}: control falls off the end of the method at bci {bci}", self.name),
                    ))
                }
                _ => {}
            }
            bci = instruction.next_bci();
            height = after as u32;
        }
    }

    fn target(&self, target: Option<i64>, bci: u32) -> Result<i64> {
        target.ok_or_else(|| self.malformed(bci))
    }

    fn malformed(&self, bci: u32) -> crate::NativeError {
        native_error(
            E_BYTECODE,
            format!("{}: malformed branch at bci {bci}", self.name),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::reconstruct;
    use kiln_core::builder::{Assembler, ProgramBuilder};
    use kiln_core::bytecode::Opcode;
    use kiln_core::{CatchRange, Program};

    fn layout_of(build: impl FnOnce(&mut ProgramBuilder, &mut Assembler)) -> (Program, super::Result<super::BlockLayout>) {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        build(&mut builder, &mut asm);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let function = program.heap.function(main).unwrap().clone();
        let layout = reconstruct(&program, "main", &function);
        (program, layout)
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let (_, layout) = layout_of(|_, asm| {
            asm.load_literal(3).load_literal(4).emit(Opcode::Pop).emit(Opcode::Return);
        });
        let layout = layout.unwrap();
        assert_eq!(layout.labels.len(), 1);
        assert_eq!(layout.height_at(0), Some(0));
        assert_eq!(layout.max_height, 2);
    }

    #[test]
    fn diamond_join_has_a_single_height() {
        let (_, layout) = layout_of(|_, asm| {
            let other = asm.label();
            let join = asm.label();
            asm.emit(Opcode::LoadLiteralTrue);
            asm.branch(Opcode::BranchIfFalseWide, other).unwrap();
            asm.load_literal(1);
            asm.branch(Opcode::BranchWide, join).unwrap();
            asm.bind(other);
            asm.load_literal(2);
            asm.bind(join);
            asm.emit(Opcode::Return);
        });
        let layout = layout.unwrap();
        assert_eq!(layout.labels.len(), 4);
        assert_eq!(layout.height_at(6), Some(0));
        assert_eq!(layout.height_at(12), Some(0));
        assert_eq!(layout.height_at(13), None);
        let join = *layout.labels.keys().last().unwrap();
        assert_eq!(layout.height_at(join), Some(1));
    }

    #[test]
    fn loop_back_edge_at_consistent_height() {
        let (_, layout) = layout_of(|_, asm| {
            asm.load_literal(0);
            let top = asm.bound();
            asm.emit(Opcode::LoadLiteralFalse);
            asm.branch(Opcode::BranchBackIfTrue, top).unwrap();
            asm.emit(Opcode::Return);
        });
        let layout = layout.unwrap();
        assert_eq!(layout.height_at(1), Some(1));
        assert_eq!(layout.height_at(4), Some(1));
    }

    #[test]
    fn back_edge_with_different_height_is_fatal() {
        let (_, layout) = layout_of(|_, asm| {
            let top = asm.bound();
            asm.load_literal(7);
            asm.branch(Opcode::BranchBack, top).unwrap();
        });
        let err = layout.unwrap_err();
        assert_eq!(err.code, "E0503");
        assert!(err.message.contains("mismatch"), "{}", err.message);
    }

    #[test]
    fn catch_handlers_seed_the_worklist() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnNull);
        let handler = asm.bci();
        asm.emit(Opcode::Pop).emit(Opcode::Return);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        builder.set_catch_ranges(
            main,
            vec![CatchRange {
                start: handler,
                end: handler + 2,
                frame_size: 2,
            }],
        );
        let program = builder.build(main).unwrap();
        let function = program.heap.function(main).unwrap();
        let layout = reconstruct(&program, "main", function).unwrap();
        assert_eq!(layout.height_at(handler), Some(2));
        assert_eq!(layout.max_height, 2);
    }

    #[test]
    fn underflow_and_falling_off_the_end_are_fatal() {
        let (_, layout) = layout_of(|_, asm| {
            asm.emit(Opcode::Pop).emit(Opcode::ReturnNull);
        });
        assert_eq!(layout.unwrap_err().code, "E0503");

        let (_, layout) = layout_of(|_, asm| {
            asm.load_literal(1).emit(Opcode::Pop);
        });
        assert_eq!(layout.unwrap_err().code, "E0502");
    }

    #[test]
    fn subroutine_continuation_keeps_caller_height() {
        let (_, layout) = layout_of(|_, asm| {
            let body = asm.label();
            asm.load_literal(5);
            asm.subroutine_call(body);
            asm.emit(Opcode::Return);
            asm.bind(body);
            asm.emit(Opcode::SubroutineReturn);
        });
        let layout = layout.unwrap();
        assert_eq!(layout.height_at(11), Some(1));
        assert_eq!(layout.height_at(12), Some(2));
        assert!(layout.continuations.contains(&11));
    }
}
