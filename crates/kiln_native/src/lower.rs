//! Rewrites the abstract tagged operations into plain address arithmetic,
//! loads and stores.
//!
//! Results of abstract instructions keep their value numbers: each abstract
//! instruction itself becomes the last step of its expansion, so no use
//! needs rewriting.

use crate::error::{native_error, Result, E_LOWERING};
use crate::ir::{BinOp, Cond, Function, Inst, InstKind, Module, Stage, Ty, Value, Width};
use kiln_core::abi;

const MAX_PASSES: usize = 4;

pub fn lower_module(module: &mut Module) -> Result<usize> {
    if module.stage == Stage::Lowered {
        return Err(native_error(E_LOWERING, "module is already lowered"));
    }
    let mut total = 0;
    for (_, func) in module.bodies_mut() {
        total += lower_function(func)?;
    }
    module.stage = Stage::Lowered;
    log::debug!("lowered {total} tagged operations");
    Ok(total)
}

pub fn lower_function(func: &mut Function) -> Result<usize> {
    let process = func
        .process()
        .ok_or_else(|| native_error(E_LOWERING, format!("{}: no process parameter", func.name)))?;
    let mut total = 0;
    for _ in 0..MAX_PASSES {
        let lowered = lower_pass(func, process);
        total += lowered;
        if lowered == 0 {
            break;
        }
    }
    let remaining = func
        .insts_in_layout()
        .filter(|&(_, inst)| func.inst(inst).kind.is_abstract())
        .count();
    if remaining > 0 {
        return Err(native_error(
            E_LOWERING,
            format!("{}: {remaining} tagged operations left after lowering", func.name),
        ));
    }
    Ok(total)
}

fn lower_pass(func: &mut Function, process: Value) -> usize {
    let mut lowered = 0;
    for block in func.layout.clone() {
        let insts = func.block(block).insts.clone();
        if !insts.iter().any(|&inst| func.inst(inst).kind.is_abstract()) {
            continue;
        }
        let mut out = Emitter {
            func: &mut *func,
            insts: Vec::with_capacity(insts.len() * 2),
        };
        for inst in insts {
            let kind = out.func.inst(inst).kind.clone();
            match kind {
                InstKind::TaggedRead { base, offset } => {
                    let address = out.field_address(base, offset);
                    let loaded = out.value(InstKind::Load { addr: address, offset: 0, ty: Ty::Ptr }, Ty::Ptr);
                    out.replace(inst, InstKind::Cast { arg: loaded, to: Ty::Tagged });
                }
                InstKind::TaggedWrite { base, offset, value } => {
                    let address = out.field_address(base, offset);
                    out.effect(InstKind::Store { addr: address, offset: 0, value, width: Width::Word });
                    out.mark_card(process, address);
                }
                InstKind::SmiToInt(value) => {
                    let word = out.value(InstKind::Cast { arg: value, to: Ty::Word }, Ty::Word);
                    out.replace(
                        inst,
                        InstKind::BinaryImm {
                            op: BinOp::Sshr,
                            arg: word,
                            imm: i64::from(abi::SMI_TAG_SIZE),
                        },
                    );
                }
                InstKind::IntToSmi(value) => {
                    let doubled = out.value(
                        InstKind::Binary {
                            op: BinOp::Add,
                            lhs: value,
                            rhs: value,
                        },
                        Ty::Word,
                    );
                    out.replace(inst, InstKind::Cast { arg: doubled, to: Ty::Tagged });
                }
                _ => {
                    out.insts.push(inst);
                    continue;
                }
            }
            lowered += 1;
        }
        let insts = out.insts;
        func.block_mut(block).insts = insts;
    }
    lowered
}

struct Emitter<'f> {
    func: &'f mut Function,
    insts: Vec<Inst>,
}

impl Emitter<'_> {
    fn value(&mut self, kind: InstKind, ty: Ty) -> Value {
        let (inst, result) = self.func.make_inst(kind, Some(ty));
        self.insts.push(inst);
        match result {
            Some(value) => value,
            None => unreachable!("make_inst returns a value when given a type"),
        }
    }

    fn effect(&mut self, kind: InstKind) {
        let (inst, _) = self.func.make_inst(kind, None);
        self.insts.push(inst);
    }

    fn replace(&mut self, inst: Inst, kind: InstKind) {
        self.func.inst_mut(inst).kind = kind;
        self.insts.push(inst);
    }

    /// Untagged host address of the field at `offset` inside `base`.
    fn field_address(&mut self, base: Value, offset: i32) -> Value {
        let word = self.value(InstKind::Cast { arg: base, to: Ty::Word }, Ty::Word);
        let address = self.value(
            InstKind::BinaryImm {
                op: BinOp::Add,
                arg: word,
                imm: i64::from(offset) - abi::HEAP_OBJECT_TAG,
            },
            Ty::Word,
        );
        self.value(InstKind::Cast { arg: address, to: Ty::Ptr }, Ty::Ptr)
    }

    /// Dirties the card covering `address`. Slots outside the heap (statics,
    /// image objects) hit the process's scratch card instead.
    fn mark_card(&mut self, process: Value, address: Value) {
        let load = |emitter: &mut Self, offset: i32| {
            emitter.value(
                InstKind::Load {
                    addr: process,
                    offset,
                    ty: Ty::Word,
                },
                Ty::Word,
            )
        };
        let heap_base = load(self, abi::PROCESS_HEAP_BASE_OFFSET);
        let slot = self.value(InstKind::Cast { arg: address, to: Ty::Word }, Ty::Word);
        let relative = self.value(
            InstKind::Binary {
                op: BinOp::Sub,
                lhs: slot,
                rhs: heap_base,
            },
            Ty::Word,
        );
        let index = self.value(
            InstKind::BinaryImm {
                op: BinOp::Ushr,
                arg: relative,
                imm: abi::CARD_SHIFT,
            },
            Ty::Word,
        );
        let count = load(self, abi::PROCESS_CARD_COUNT_OFFSET);
        let inside = self.value(
            InstKind::Icmp {
                cond: Cond::Ult,
                lhs: index,
                rhs: count,
            },
            Ty::Bool,
        );
        let table = load(self, abi::PROCESS_CARD_TABLE_OFFSET);
        let card = self.value(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: table,
                rhs: index,
            },
            Ty::Word,
        );
        let process_word = self.value(InstKind::Cast { arg: process, to: Ty::Word }, Ty::Word);
        let scratch = self.value(
            InstKind::BinaryImm {
                op: BinOp::Add,
                arg: process_word,
                imm: i64::from(abi::PROCESS_SCRATCH_CARD_OFFSET),
            },
            Ty::Word,
        );
        let target = self.value(
            InstKind::Select {
                cond: inside,
                if_true: card,
                if_false: scratch,
            },
            Ty::Word,
        );
        let target = self.value(InstKind::Cast { arg: target, to: Ty::Ptr }, Ty::Ptr);
        let dirty = self.value(InstKind::Iconst(1), Ty::Word);
        self.effect(InstKind::Store {
            addr: target,
            offset: 0,
            value: dirty,
            width: Width::Byte,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncBuilder, ValueDef};
    use crate::opt;
    use crate::verify::verify_function;

    fn kind_of(func: &Function, value: Value) -> InstKind {
        match func.value(value).def {
            ValueDef::Inst(inst) => func.inst(inst).kind.clone(),
            ValueDef::Param(..) => panic!("{value} is a parameter"),
        }
    }

    #[test]
    fn tagged_read_becomes_untagged_load() {
        let mut b = FuncBuilder::new("f", 1, 0);
        let entry = b.create_block("entry");
        b.append_param(entry, Ty::Ptr);
        let object = b.append_param(entry, Ty::Tagged);
        b.switch_to(entry);
        let field = b.tagged_read(object, 16);
        b.ret(field);
        let mut func = b.finish();

        assert_eq!(lower_function(&mut func).unwrap(), 1);
        verify_function(&func, Stage::Lowered).unwrap();
        let InstKind::Cast { arg: loaded, to: Ty::Tagged } = kind_of(&func, field) else {
            panic!("{func}");
        };
        let InstKind::Load { addr, offset: 0, ty: Ty::Ptr } = kind_of(&func, loaded) else {
            panic!("{func}");
        };
        let InstKind::Cast { arg: sum, .. } = kind_of(&func, addr) else {
            panic!("{func}");
        };
        assert!(matches!(
            kind_of(&func, sum),
            InstKind::BinaryImm { op: BinOp::Add, imm: 15, .. }
        ));
    }

    #[test]
    fn tagged_write_stores_and_marks_a_card() {
        let mut b = FuncBuilder::new("f", 2, 0);
        let entry = b.create_block("entry");
        b.append_param(entry, Ty::Ptr);
        let object = b.append_param(entry, Ty::Tagged);
        let value = b.append_param(entry, Ty::Tagged);
        b.switch_to(entry);
        b.tagged_write(object, 8, value);
        b.ret(value);
        let mut func = b.finish();

        lower_function(&mut func).unwrap();
        verify_function(&func, Stage::Lowered).unwrap();
        let stores: Vec<Width> = func
            .insts_in_layout()
            .filter_map(|(_, inst)| match func.inst(inst).kind {
                InstKind::Store { width, .. } => Some(width),
                _ => None,
            })
            .collect();
        assert_eq!(stores, vec![Width::Word, Width::Byte]);
        let loads: Vec<i32> = func
            .insts_in_layout()
            .filter_map(|(_, inst)| match func.inst(inst).kind {
                InstKind::Load { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(
            loads,
            vec![
                abi::PROCESS_HEAP_BASE_OFFSET,
                abi::PROCESS_CARD_COUNT_OFFSET,
                abi::PROCESS_CARD_TABLE_OFFSET
            ]
        );
    }

    #[test]
    fn box_then_unbox_is_the_identity_on_constants() {
        for value in [0, 7, -3, abi::PORTABLE_SMI_MAX, abi::PORTABLE_SMI_MIN] {
            let mut b = FuncBuilder::new("f", 0, 0);
            let entry = b.create_block("entry");
            b.append_param(entry, Ty::Ptr);
            b.switch_to(entry);
            let n = b.iconst(value);
            let boxed = b.int_to_smi(n);
            let unboxed = b.smi_to_int(boxed);
            let again = b.int_to_smi(unboxed);
            b.ret(again);
            let mut func = b.finish();

            assert_eq!(lower_function(&mut func).unwrap(), 3);
            opt::fold_constants(&mut func);
            assert_eq!(kind_of(&func, boxed), InstKind::TaggedConst(abi::smi(value) as i64));
            assert_eq!(kind_of(&func, unboxed), InstKind::Iconst(value));
        }
    }

    #[test]
    fn functions_without_tagged_operations_are_unchanged() {
        let mut b = FuncBuilder::new("f", 0, 0);
        let entry = b.create_block("entry");
        b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        let zero = b.tagged_const(0);
        b.ret(zero);
        let mut func = b.finish();
        assert_eq!(lower_function(&mut func).unwrap(), 0);
    }
}
