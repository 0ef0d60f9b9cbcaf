//! Generic optimizations over the backend IR.
//!
//! Operand-stack traffic dominates freshly emitted code, so the passes are
//! ordered to expose constants first: slot forwarding turns stack shuffles
//! into direct value uses, folding then settles tag checks on literals, and
//! the CFG cleanup removes the branches those checks decided.

use crate::ir::{BinOp, Block, Cond, Function, Inst, InstKind, Module, Terminator, Ty, Value};
use std::collections::{HashMap, HashSet};

const MAX_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptStats {
    pub forwarded_loads: usize,
    pub dead_stores: usize,
    pub folded: usize,
    pub removed_blocks: usize,
    pub merged_blocks: usize,
    pub dead_insts: usize,
}

impl OptStats {
    fn changed(&self) -> bool {
        *self != OptStats::default()
    }

    fn add(&mut self, other: OptStats) {
        self.forwarded_loads += other.forwarded_loads;
        self.dead_stores += other.dead_stores;
        self.folded += other.folded;
        self.removed_blocks += other.removed_blocks;
        self.merged_blocks += other.merged_blocks;
        self.dead_insts += other.dead_insts;
    }
}

pub fn run(module: &mut Module) -> OptStats {
    let mut total = OptStats::default();
    for (_, func) in module.bodies_mut() {
        let stats = optimize_function(func);
        log::trace!("optimized {}: {stats:?}", func.name);
        total.add(stats);
    }
    log::debug!("optimizations: {total:?}");
    total
}

pub fn optimize_function(func: &mut Function) -> OptStats {
    let mut total = OptStats::default();
    for _ in 0..MAX_ROUNDS {
        let mut round = OptStats::default();
        round.forwarded_loads = forward_slots(func);
        round.dead_stores = remove_dead_stores(func);
        round.folded = fold_constants(func);
        let (removed, merged) = simplify_cfg(func);
        round.removed_blocks = removed;
        round.merged_blocks = merged;
        round.dead_insts = eliminate_dead_code(func);
        if !round.changed() {
            break;
        }
        total.add(round);
    }
    total
}

/// Replaces slot loads whose value is already known inside the block.
pub fn forward_slots(func: &mut Function) -> usize {
    let mut aliases = HashMap::new();
    for block in func.layout.clone() {
        let mut known: HashMap<u32, Value> = HashMap::new();
        let mut kept = Vec::new();
        for inst in func.block(block).insts.clone() {
            let data = func.inst(inst);
            match (&data.kind, data.result) {
                (InstKind::SlotStore { slot, value }, _) => {
                    known.insert(*slot, *value);
                }
                (InstKind::SlotLoad(slot), Some(result)) => match known.get(slot) {
                    Some(&value) => {
                        aliases.insert(result, value);
                        continue;
                    }
                    None => {
                        known.insert(*slot, result);
                    }
                },
                _ => {}
            }
            kept.push(inst);
        }
        func.block_mut(block).insts = kept;
    }
    func.replace_uses(&aliases);
    aliases.len()
}

/// Drops slot stores that no load can observe: stores overwritten later in
/// the same block and stores to slots that are never loaded.
pub fn remove_dead_stores(func: &mut Function) -> usize {
    let loaded: HashSet<u32> = func
        .insts_in_layout()
        .filter_map(|(_, inst)| match func.inst(inst).kind {
            InstKind::SlotLoad(slot) => Some(slot),
            _ => None,
        })
        .collect();
    let mut removed = 0;
    for block in func.layout.clone() {
        let insts = func.block(block).insts.clone();
        let mut overwritten: HashSet<u32> = HashSet::new();
        let mut kept = Vec::with_capacity(insts.len());
        for &inst in insts.iter().rev() {
            match func.inst(inst).kind {
                InstKind::SlotStore { slot, .. } => {
                    if !loaded.contains(&slot) || !overwritten.insert(slot) {
                        removed += 1;
                        continue;
                    }
                }
                InstKind::SlotLoad(slot) => {
                    overwritten.remove(&slot);
                }
                _ => {}
            }
            kept.push(inst);
        }
        kept.reverse();
        func.block_mut(block).insts = kept;
    }
    removed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Constant {
    Word(i64),
    Tagged(i64),
    Bool(bool),
    /// A static object; both views share one address.
    Object(crate::ir::ConstId),
}

fn constant_of(func: &Function, value: Value) -> Option<Constant> {
    let crate::ir::ValueDef::Inst(inst) = func.value(value).def else {
        return None;
    };
    match func.inst(inst).kind {
        InstKind::Iconst(word) => Some(Constant::Word(word)),
        InstKind::TaggedConst(word) => Some(Constant::Tagged(word)),
        InstKind::Bconst(flag) => Some(Constant::Bool(flag)),
        InstKind::Object { object, .. } => Some(Constant::Object(object)),
        _ => None,
    }
}

fn raw(constant: Constant) -> Option<i64> {
    match constant {
        Constant::Word(word) | Constant::Tagged(word) => Some(word),
        Constant::Bool(flag) => Some(i64::from(flag)),
        Constant::Object(..) => None,
    }
}

fn eval_binary(op: BinOp, lhs: i64, rhs: i64) -> i64 {
    match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl => lhs.wrapping_shl(rhs as u32 & 63),
        BinOp::Sshr => lhs.wrapping_shr(rhs as u32 & 63),
        BinOp::Ushr => ((lhs as u64) >> (rhs as u32 & 63)) as i64,
    }
}

fn overflows(op: BinOp, lhs: i64, rhs: i64) -> bool {
    match op {
        BinOp::Add => lhs.checked_add(rhs).is_none(),
        BinOp::Sub => lhs.checked_sub(rhs).is_none(),
        BinOp::Mul => lhs.checked_mul(rhs).is_none(),
        _ => false,
    }
}

fn compare(cond: Cond, lhs: i64, rhs: i64) -> bool {
    match cond {
        Cond::Eq => lhs == rhs,
        Cond::Ne => lhs != rhs,
        Cond::Slt => lhs < rhs,
        Cond::Sle => lhs <= rhs,
        Cond::Sgt => lhs > rhs,
        Cond::Sge => lhs >= rhs,
        Cond::Ult => (lhs as u64) < (rhs as u64),
    }
}

enum Folded {
    Kind(InstKind),
    Alias(Value),
}

fn fold_inst(func: &Function, inst: Inst) -> Option<Folded> {
    let kind = &func.inst(inst).kind;
    let folded = match *kind {
        InstKind::Cast { arg, to } => {
            if func.value_ty(arg) == to {
                return Some(Folded::Alias(arg));
            }
            let word = raw(constant_of(func, arg)?)?;
            match to {
                Ty::Word => InstKind::Iconst(word),
                Ty::Tagged => InstKind::TaggedConst(word),
                Ty::Bool | Ty::Ptr => return None,
            }
        }
        InstKind::Binary { op, lhs, rhs } => {
            let lhs = raw(constant_of(func, lhs)?)?;
            let rhs = raw(constant_of(func, rhs)?)?;
            InstKind::Iconst(eval_binary(op, lhs, rhs))
        }
        InstKind::BinaryImm { op, arg, imm } => {
            let arg = raw(constant_of(func, arg)?)?;
            InstKind::Iconst(eval_binary(op, arg, imm))
        }
        InstKind::Overflows { op, lhs, rhs } => {
            let lhs = raw(constant_of(func, lhs)?)?;
            let rhs = raw(constant_of(func, rhs)?)?;
            InstKind::Bconst(overflows(op, lhs, rhs))
        }
        InstKind::Icmp { cond, lhs, rhs } => {
            if lhs == rhs && matches!(cond, Cond::Eq | Cond::Sle | Cond::Sge) {
                return Some(Folded::Kind(InstKind::Bconst(true)));
            }
            let lhs = constant_of(func, lhs)?;
            let rhs = constant_of(func, rhs)?;
            match (lhs, rhs) {
                // Distinct static objects never share an address.
                (Constant::Object(..), Constant::Object(..)) if matches!(cond, Cond::Eq | Cond::Ne) => {
                    InstKind::Bconst((lhs == rhs) == (cond == Cond::Eq))
                }
                _ => InstKind::Bconst(compare(cond, raw(lhs)?, raw(rhs)?)),
            }
        }
        InstKind::Select {
            cond,
            if_true,
            if_false,
        } => {
            if if_true == if_false {
                return Some(Folded::Alias(if_true));
            }
            match constant_of(func, cond)? {
                Constant::Bool(true) => return Some(Folded::Alias(if_true)),
                Constant::Bool(false) => return Some(Folded::Alias(if_false)),
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(Folded::Kind(folded))
}

/// Folds pure arithmetic on constants and branches on constant conditions.
pub fn fold_constants(func: &mut Function) -> usize {
    let mut folded = 0;
    let mut aliases = HashMap::new();
    for block in func.layout.clone() {
        for inst in func.block(block).insts.clone() {
            match fold_inst(func, inst) {
                Some(Folded::Kind(kind)) => {
                    if func.inst(inst).kind != kind {
                        func.inst_mut(inst).kind = kind;
                        folded += 1;
                    }
                }
                Some(Folded::Alias(value)) => {
                    if let Some(result) = func.inst(inst).result {
                        if aliases.insert(result, value).is_none() {
                            folded += 1;
                        }
                    }
                }
                None => {}
            }
        }
        // Later instructions in the block may now see constant operands.
        func.replace_uses(&aliases);
        let Some(Terminator::Brif {
            cond,
            then_dest,
            then_args,
            else_dest,
            else_args,
        }) = func.block(block).terminator.clone()
        else {
            continue;
        };
        let jump = match constant_of(func, cond) {
            Some(Constant::Bool(true)) => Some((then_dest, then_args)),
            Some(Constant::Bool(false)) => Some((else_dest, else_args)),
            _ if then_dest == else_dest && then_args == else_args => Some((then_dest, then_args)),
            _ => None,
        };
        if let Some((dest, args)) = jump {
            func.block_mut(block).terminator = Some(Terminator::Jump { dest, args });
            folded += 1;
        }
    }
    folded
}

fn reachable(func: &Function) -> HashSet<Block> {
    let mut seen = HashSet::new();
    let Some(entry) = func.entry() else {
        return seen;
    };
    let mut work = vec![entry];
    while let Some(block) = work.pop() {
        if !seen.insert(block) {
            continue;
        }
        if let Some(terminator) = &func.block(block).terminator {
            work.extend(terminator.successors().into_iter().map(|(succ, _)| succ));
        }
    }
    seen
}

/// Removes unreachable blocks and merges a block into its predecessor when
/// that predecessor is its only one and ends in a jump to it.
pub fn simplify_cfg(func: &mut Function) -> (usize, usize) {
    let live = reachable(func);
    let before = func.layout.len();
    func.layout.retain(|block| live.contains(block));
    let removed = before - func.layout.len();

    let mut merged = 0;
    loop {
        let preds = func.predecessors();
        let entry = func.entry();
        let candidate = func.layout.iter().copied().find_map(|block| {
            let Some(Terminator::Jump { dest, .. }) = &func.block(block).terminator else {
                return None;
            };
            let dest = *dest;
            let single = preds[dest].len() == 1;
            (single && dest != block && Some(dest) != entry).then_some((block, dest))
        });
        let Some((pred, succ)) = candidate else {
            break;
        };
        let Some(Terminator::Jump { args, .. }) = func.block_mut(pred).terminator.take() else {
            break;
        };
        let succ_data = func.block(succ).clone();
        let aliases: HashMap<Value, Value> = succ_data.params.iter().copied().zip(args).collect();
        let pred_data = func.block_mut(pred);
        pred_data.insts.extend(succ_data.insts);
        pred_data.terminator = succ_data.terminator;
        func.block_mut(succ).insts.clear();
        func.layout.retain(|&block| block != succ);
        func.replace_uses(&aliases);
        merged += 1;
    }
    (removed, merged)
}

/// Deletes pure instructions whose results are never used.
pub fn eliminate_dead_code(func: &mut Function) -> usize {
    let mut removed = 0;
    loop {
        let uses = func.use_counts();
        let mut changed = 0;
        for block in func.layout.clone() {
            let insts = func.block(block).insts.clone();
            let kept: Vec<Inst> = insts
                .iter()
                .copied()
                .filter(|&inst| {
                    let data = func.inst(inst);
                    let dead = data.kind.is_pure() && data.result.map_or(true, |result| uses[result] == 0);
                    !dead
                })
                .collect();
            changed += insts.len() - kept.len();
            func.block_mut(block).insts = kept;
        }
        if changed == 0 {
            return removed;
        }
        removed += changed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Callee, FuncBuilder, RuntimeFn};

    fn insts(func: &Function) -> Vec<InstKind> {
        func.insts_in_layout()
            .map(|(_, inst)| func.inst(inst).kind.clone())
            .collect()
    }

    #[test]
    fn static_object_comparisons_ignore_the_view() {
        use crate::ir::ConstId;
        use cranelift_entity::EntityRef;

        let mut b = FuncBuilder::new("f", 0, 0);
        let entry = b.create_block("entry");
        b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        let table = ConstId::new(0);
        let managed = b.object(table);
        let local = b.object_local(table);
        let other = b.object(ConstId::new(1));
        let same = b.icmp(Cond::Eq, managed, local);
        let different = b.icmp(Cond::Eq, managed, other);
        let either = b.select(same, managed, other);
        b.ret(either);
        let mut func = b.finish();

        fold_constants(&mut func);
        let folded: Vec<InstKind> = [same, different]
            .into_iter()
            .map(|value| match func.value(value).def {
                crate::ir::ValueDef::Inst(inst) => func.inst(inst).kind.clone(),
                crate::ir::ValueDef::Param(..) => panic!("{value} is a parameter"),
            })
            .collect();
        assert_eq!(folded, vec![InstKind::Bconst(true), InstKind::Bconst(false)]);
    }

    #[test]
    fn slot_loads_forward_from_earlier_stores() {
        let mut b = FuncBuilder::new("f", 0, 2);
        let entry = b.create_block("entry");
        b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        let seven = b.tagged_const(14);
        b.slot_store(0, seven);
        let loaded = b.slot_load(0);
        b.slot_store(1, loaded);
        let again = b.slot_load(1);
        b.ret(again);
        let mut func = b.finish();

        assert_eq!(forward_slots(&mut func), 2);
        assert_eq!(func.block(entry).terminator, Some(Terminator::Return(seven)));
        assert_eq!(remove_dead_stores(&mut func), 2);
        assert_eq!(insts(&func), vec![InstKind::TaggedConst(14)]);
    }

    #[test]
    fn stores_read_by_other_blocks_survive() {
        let mut b = FuncBuilder::new("f", 0, 1);
        let entry = b.create_block("entry");
        let next = b.create_block("next");
        b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        let first = b.tagged_const(2);
        b.slot_store(0, first);
        let second = b.tagged_const(4);
        b.slot_store(0, second);
        b.jump(next, Vec::new());
        b.switch_to(next);
        let loaded = b.slot_load(0);
        b.ret(loaded);
        let mut func = b.finish();

        assert_eq!(remove_dead_stores(&mut func), 1);
        let stores: Vec<_> = insts(&func)
            .into_iter()
            .filter(|kind| matches!(kind, InstKind::SlotStore { .. }))
            .collect();
        assert_eq!(stores, vec![InstKind::SlotStore { slot: 0, value: second }]);
    }

    #[test]
    fn smi_fast_path_on_literals_folds_to_a_constant_return() {
        let mut b = FuncBuilder::new("f", 0, 0);
        let entry = b.create_block("entry");
        let fast = b.create_block("fast");
        let slow = b.create_block("slow");
        let join = b.create_block("join");
        let process = b.append_param(entry, Ty::Ptr);
        let result = b.append_param(join, Ty::Tagged);
        b.switch_to(entry);
        let lhs = b.tagged_const(6);
        let rhs = b.tagged_const(8);
        let lw = b.cast(lhs, Ty::Word);
        let rw = b.cast(rhs, Ty::Word);
        let tags = b.binary(BinOp::Or, lw, rw);
        let tag = b.binary_imm(BinOp::And, tags, 1);
        let zero = b.iconst(0);
        let smis = b.icmp(Cond::Eq, tag, zero);
        b.brif(smis, fast, Vec::new(), slow, Vec::new());
        b.switch_to(fast);
        let overflow = b.overflows(BinOp::Add, lw, rw);
        let sum = b.binary(BinOp::Add, lw, rw);
        let sum = b.cast(sum, Ty::Tagged);
        b.brif(overflow, slow, Vec::new(), join, vec![sum]);
        b.switch_to(slow);
        let called = b.call(Callee::Runtime(RuntimeFn::ObjectFromFailure), vec![process, lhs]);
        b.jump(join, vec![called]);
        b.switch_to(join);
        b.ret(result);
        let mut func = b.finish();

        optimize_function(&mut func);
        assert_eq!(func.layout, vec![entry]);
        let Some(Terminator::Return(value)) = func.block(entry).terminator else {
            panic!("expected a return: {func}");
        };
        let crate::ir::ValueDef::Inst(inst) = func.value(value).def else {
            panic!("return of a parameter: {func}");
        };
        assert_eq!(func.inst(inst).kind, InstKind::TaggedConst(14));
        assert_eq!(func.block(entry).insts.len(), 1, "{func}");
    }

    #[test]
    fn unreachable_blocks_are_dropped_and_side_effects_kept() {
        let mut b = FuncBuilder::new("f", 0, 0);
        let entry = b.create_block("entry");
        let orphan = b.create_block("orphan");
        let process = b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        b.call_void(RuntimeFn::CollectGarbage, vec![process]);
        let unused = b.iconst(3);
        let _ = unused;
        let null = b.tagged_const(0);
        b.ret(null);
        b.switch_to(orphan);
        b.ret(null);
        let mut func = b.finish();

        let (removed, _) = simplify_cfg(&mut func);
        assert_eq!(removed, 1);
        assert_eq!(eliminate_dead_code(&mut func), 1);
        assert!(matches!(insts(&func)[0], InstKind::Call { .. }));
    }

    #[test]
    fn loops_are_not_merged_into_themselves() {
        let mut b = FuncBuilder::new("f", 0, 1);
        let entry = b.create_block("entry");
        let head = b.create_block("head");
        let body = b.create_block("body");
        let exit = b.create_block("exit");
        b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        b.jump(head, Vec::new());
        b.switch_to(head);
        let value = b.slot_load(0);
        let word = b.cast(value, Ty::Word);
        let zero = b.iconst(0);
        let done = b.icmp(Cond::Eq, word, zero);
        b.brif(done, exit, Vec::new(), body, Vec::new());
        b.switch_to(body);
        let next = b.binary_imm(BinOp::Sub, word, 2);
        let next = b.cast(next, Ty::Tagged);
        b.slot_store(0, next);
        b.jump(head, Vec::new());
        b.switch_to(exit);
        b.ret(value);
        let mut func = b.finish();

        optimize_function(&mut func);
        assert_eq!(func.layout.len(), 4, "{func}");
        assert!(func.layout.contains(&head));
        assert!(func.layout.contains(&body));
    }
}
