//! Structural verification of the backend IR.
//!
//! A failure here is a backend defect, never a property of the input
//! program, and always aborts the build.

use crate::error::{native_error, Result, E_VERIFY};
use crate::ir::{
    Block, Callee, Function, InstKind, Module, Stage, Terminator, Ty, Value, ValueDef, View, Width,
};
use std::collections::{HashMap, HashSet};

/// Facts about the surrounding module a function's calls are checked against.
struct Externals<'m> {
    module: Option<&'m Module>,
}

impl Externals<'_> {
    /// Declared arity of a callee; `Ok(None)` when checking without a module.
    fn function_arity(&self, index: crate::ir::FuncIndex) -> Result<Option<u32>, ()> {
        match self.module {
            Some(module) => module.functions.get(index).map(|decl| Some(decl.arity)).ok_or(()),
            None => Ok(None),
        }
    }
}

pub fn verify_module(module: &Module, stage: Stage) -> Result<()> {
    if module.functions.get(module.entry).and_then(|decl| decl.body.as_ref()).is_none() {
        return Err(native_error(
            E_VERIFY,
            format!("entry {} has no body", module.entry),
        ));
    }
    if module.image.objects.get(module.static_fields).is_none() {
        return Err(native_error(E_VERIFY, "static fields object is not in the image"));
    }
    for cell in module
        .image
        .objects
        .values()
        .flat_map(|object| object.cells.iter())
        .chain(module.roots.iter())
    {
        match cell {
            crate::constants::Cell::Object(object) if module.image.objects.get(*object).is_none() => {
                return Err(native_error(E_VERIFY, format!("reference to unknown static {object}")));
            }
            crate::constants::Cell::Code(index) if module.functions.get(*index).is_none() => {
                return Err(native_error(E_VERIFY, format!("reference to unknown function {index}")));
            }
            _ => {}
        }
    }
    let mut symbols = HashSet::new();
    for (index, decl) in module.functions.iter() {
        if !symbols.insert(decl.symbol.as_str()) {
            return Err(native_error(
                E_VERIFY,
                format!("symbol '{}' is declared twice", decl.symbol),
            ));
        }
        let Some(body) = &decl.body else {
            return Err(native_error(E_VERIFY, format!("{index} '{}' has no body", decl.symbol)));
        };
        if body.arity != decl.arity {
            return Err(native_error(
                E_VERIFY,
                format!("{}: body arity {} but declared {}", decl.symbol, body.arity, decl.arity),
            ));
        }
        Checker::new(body, stage, Externals { module: Some(module) }).run()?;
    }
    log::debug!("verified {} functions ({stage:?})", module.functions.len());
    Ok(())
}

/// Checks one function on its own; calls into other functions are checked
/// for shape only.
pub fn verify_function(func: &Function, stage: Stage) -> Result<()> {
    Checker::new(func, stage, Externals { module: None }).run()
}

struct Checker<'f, 'm> {
    func: &'f Function,
    stage: Stage,
    externals: Externals<'m>,
    position: HashMap<Block, usize>,
}

impl<'f, 'm> Checker<'f, 'm> {
    fn new(func: &'f Function, stage: Stage, externals: Externals<'m>) -> Self {
        Self {
            func,
            stage,
            externals,
            position: HashMap::new(),
        }
    }

    fn fail(&self, message: impl std::fmt::Display) -> crate::NativeError {
        native_error(E_VERIFY, format!("{}: {message}", self.func.name))
    }

    fn run(mut self) -> Result<()> {
        let func = self.func;
        let entry = func.entry().ok_or_else(|| self.fail("function has no blocks"))?;
        for (index, &block) in func.layout.iter().enumerate() {
            if !func.contains_block(block) {
                return Err(self.fail(format!("layout names unknown {block}")));
            }
            if self.position.insert(block, index).is_some() {
                return Err(self.fail(format!("{block} is laid out twice")));
            }
        }
        self.check_signature(entry)?;
        let idom = self.dominators(entry)?;
        let defs = self.definitions()?;

        for &block in &func.layout {
            let data = func.block(block);
            for (index, &inst) in data.insts.iter().enumerate() {
                let kind = &func.inst(inst).kind;
                if self.stage == Stage::Lowered && kind.is_abstract() {
                    return Err(self.fail(format!("{block}: abstract operation {inst} after lowering")));
                }
                for operand in kind.operands() {
                    self.check_use(operand, block, Some(index), &defs, &idom)?;
                }
                self.check_inst(block, kind, func.inst(inst).result)?;
            }
            let terminator = data
                .terminator
                .as_ref()
                .ok_or_else(|| self.fail(format!("{block} has no terminator")))?;
            for operand in terminator.operands() {
                self.check_use(operand, block, None, &defs, &idom)?;
            }
            self.check_terminator(block, terminator, entry)?;
        }
        Ok(())
    }

    fn check_signature(&self, entry: Block) -> Result<()> {
        let params = &self.func.block(entry).params;
        if params.len() != self.func.arity as usize + 1 {
            return Err(self.fail(format!(
                "entry takes {} parameters, expected process plus {}",
                params.len(),
                self.func.arity
            )));
        }
        for (index, &param) in params.iter().enumerate() {
            let expected = if index == 0 { Ty::Ptr } else { Ty::Tagged };
            if self.func.value_ty(param) != expected {
                return Err(self.fail(format!("entry parameter {param} is not {expected:?}")));
            }
        }
        Ok(())
    }

    /// Where every value is defined: block plus instruction index, with
    /// parameters at index `None`.
    fn definitions(&self) -> Result<HashMap<Value, (Block, Option<usize>)>> {
        let mut defs = HashMap::new();
        for &block in &self.func.layout {
            let data = self.func.block(block);
            for &param in &data.params {
                defs.insert(param, (block, None));
            }
            for (index, &inst) in data.insts.iter().enumerate() {
                if let Some(result) = self.func.inst(inst).result {
                    if defs.insert(result, (block, Some(index))).is_some() {
                        return Err(self.fail(format!("{result} is defined twice")));
                    }
                    if self.func.value(result).def != ValueDef::Inst(inst) {
                        return Err(self.fail(format!("{result} does not point back at {inst}")));
                    }
                }
            }
        }
        Ok(defs)
    }

    /// Immediate dominators, by the iterative algorithm over reverse postorder.
    fn dominators(&self, entry: Block) -> Result<HashMap<Block, Block>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(entry, false)];
        while let Some((block, done)) = stack.pop() {
            if done {
                order.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            if let Some(terminator) = &self.func.block(block).terminator {
                for (succ, _) in terminator.successors().into_iter().rev() {
                    if !self.position.contains_key(&succ) {
                        return Err(self.fail(format!("{block} branches to {succ}, which is not laid out")));
                    }
                    if !visited.contains(&succ) {
                        stack.push((succ, false));
                    }
                }
            }
        }
        order.reverse();
        let rpo: HashMap<Block, usize> = order.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let preds = self.func.predecessors();
        let mut idom: HashMap<Block, Block> = HashMap::from([(entry, entry)]);
        let mut changed = true;
        while changed {
            changed = false;
            for &block in order.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &pred in &preds[block] {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo, pred, current),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }
        Ok(idom)
    }

    fn dominates(idom: &HashMap<Block, Block>, a: Block, mut b: Block) -> bool {
        loop {
            if a == b {
                return true;
            }
            match idom.get(&b) {
                Some(&parent) if parent != b => b = parent,
                _ => return false,
            }
        }
    }

    fn check_use(
        &self,
        value: Value,
        block: Block,
        index: Option<usize>,
        defs: &HashMap<Value, (Block, Option<usize>)>,
        idom: &HashMap<Block, Block>,
    ) -> Result<()> {
        if !self.func.contains_value(value) {
            return Err(self.fail(format!("{block} uses unknown value {value}")));
        }
        let Some(&(def_block, def_index)) = defs.get(&value) else {
            return Err(self.fail(format!("{block} uses {value}, which is never placed")));
        };
        // Uses in unreachable blocks are not constrained.
        if !idom.contains_key(&block) {
            return Ok(());
        }
        let ok = if def_block == block {
            match (def_index, index) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(def), Some(at)) => def < at,
            }
        } else {
            Self::dominates(idom, def_block, block)
        };
        if ok {
            Ok(())
        } else {
            Err(self.fail(format!("use of {value} in {block} is not dominated by its definition")))
        }
    }

    fn expect(&self, value: Value, ty: Ty, what: &str) -> Result<()> {
        let actual = self.func.value_ty(value);
        if actual == ty {
            Ok(())
        } else {
            Err(self.fail(format!("{what}: {value} is {actual:?}, expected {ty:?}")))
        }
    }

    fn expect_result(&self, result: Option<Value>, ty: Option<Ty>, what: &str) -> Result<()> {
        let actual = result.map(|value| self.func.value_ty(value));
        if actual == ty {
            Ok(())
        } else {
            Err(self.fail(format!("{what} produces {actual:?}, expected {ty:?}")))
        }
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot < self.func.slots {
            Ok(())
        } else {
            Err(self.fail(format!("slot s{slot} outside the {} slots of the frame", self.func.slots)))
        }
    }

    fn check_inst(&self, block: Block, kind: &InstKind, result: Option<Value>) -> Result<()> {
        let what = format!("{block}: {}", kind_name(kind));
        match kind {
            InstKind::Iconst(_) => self.expect_result(result, Some(Ty::Word), &what),
            InstKind::Bconst(_) => self.expect_result(result, Some(Ty::Bool), &what),
            InstKind::TaggedConst(_) => self.expect_result(result, Some(Ty::Tagged), &what),
            InstKind::Object { object, view } => {
                if let Some(module) = self.externals.module {
                    if module.image.objects.get(*object).is_none() {
                        return Err(self.fail(format!("{what} names unknown static {object}")));
                    }
                }
                let ty = match view {
                    View::Managed => Ty::Tagged,
                    View::Local => Ty::Ptr,
                };
                self.expect_result(result, Some(ty), &what)
            }
            InstKind::Message(index) => {
                if let Some(module) = self.externals.module {
                    if *index as usize >= module.messages.len() {
                        return Err(self.fail(format!("{what} names unknown message {index}")));
                    }
                }
                self.expect_result(result, Some(Ty::Ptr), &what)
            }
            InstKind::Cast { to, .. } => {
                if *to == Ty::Bool {
                    return Err(self.fail(format!("{what} to bool")));
                }
                self.expect_result(result, Some(*to), &what)
            }
            InstKind::Binary { lhs, rhs, .. } | InstKind::Overflows { lhs, rhs, .. } => {
                self.expect(*lhs, Ty::Word, &what)?;
                self.expect(*rhs, Ty::Word, &what)?;
                let ty = if matches!(kind, InstKind::Binary { .. }) { Ty::Word } else { Ty::Bool };
                self.expect_result(result, Some(ty), &what)
            }
            InstKind::BinaryImm { arg, .. } => {
                self.expect(*arg, Ty::Word, &what)?;
                self.expect_result(result, Some(Ty::Word), &what)
            }
            InstKind::Icmp { lhs, rhs, .. } => {
                let ty = self.func.value_ty(*lhs);
                if ty == Ty::Bool {
                    return Err(self.fail(format!("{what} on booleans")));
                }
                self.expect(*rhs, ty, &what)?;
                self.expect_result(result, Some(Ty::Bool), &what)
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                self.expect(*cond, Ty::Bool, &what)?;
                let ty = self.func.value_ty(*if_true);
                self.expect(*if_false, ty, &what)?;
                self.expect_result(result, Some(ty), &what)
            }
            InstKind::SlotLoad(slot) => {
                self.check_slot(*slot)?;
                self.expect_result(result, Some(Ty::Tagged), &what)
            }
            InstKind::SlotStore { slot, value } => {
                self.check_slot(*slot)?;
                self.expect(*value, Ty::Tagged, &what)?;
                self.expect_result(result, None, &what)
            }
            InstKind::StackBuffer { words } => {
                if *words == 0 {
                    return Err(self.fail(format!("{what} of zero words")));
                }
                self.expect_result(result, Some(Ty::Ptr), &what)
            }
            InstKind::Load { addr, ty, .. } => {
                self.expect(*addr, Ty::Ptr, &what)?;
                if *ty == Ty::Bool {
                    return Err(self.fail(format!("{what} of a boolean")));
                }
                self.expect_result(result, Some(*ty), &what)
            }
            InstKind::Store {
                addr, value, width, ..
            } => {
                self.expect(*addr, Ty::Ptr, &what)?;
                let ty = self.func.value_ty(*value);
                if ty == Ty::Bool || (*width == Width::Byte && ty != Ty::Word) {
                    return Err(self.fail(format!("{what} of {ty:?} as {width:?}")));
                }
                self.expect_result(result, None, &what)
            }
            InstKind::Call { callee, args } => self.check_call(&what, callee, args, result),
            InstKind::TaggedRead { base, .. } => {
                self.expect(*base, Ty::Tagged, &what)?;
                self.expect_result(result, Some(Ty::Tagged), &what)
            }
            InstKind::TaggedWrite { base, value, .. } => {
                self.expect(*base, Ty::Tagged, &what)?;
                self.expect(*value, Ty::Tagged, &what)?;
                self.expect_result(result, None, &what)
            }
            InstKind::SmiToInt(value) => {
                self.expect(*value, Ty::Tagged, &what)?;
                self.expect_result(result, Some(Ty::Word), &what)
            }
            InstKind::IntToSmi(value) => {
                self.expect(*value, Ty::Word, &what)?;
                self.expect_result(result, Some(Ty::Tagged), &what)
            }
        }
    }

    fn check_call(&self, what: &str, callee: &Callee, args: &[Value], result: Option<Value>) -> Result<()> {
        let (params, returns): (Vec<Ty>, Option<Ty>) = match callee {
            Callee::Function(index) => {
                let arity = self
                    .externals
                    .function_arity(*index)
                    .map_err(|()| self.fail(format!("{what} calls unknown {index}")))?;
                let arity = arity.unwrap_or(args.len().saturating_sub(1) as u32);
                let mut params = vec![Ty::Ptr];
                params.extend(std::iter::repeat(Ty::Tagged).take(arity as usize));
                (params, Some(Ty::Tagged))
            }
            Callee::Native(index) => {
                if let Some(module) = self.externals.module {
                    if *index as usize >= module.natives.len() {
                        return Err(self.fail(format!("{what} calls unknown native {index}")));
                    }
                }
                (vec![Ty::Ptr, Ty::Ptr], Some(Ty::Tagged))
            }
            Callee::Runtime(runtime) => (runtime.params().to_vec(), runtime.returns()),
            Callee::Indirect(code) => {
                self.expect(*code, Ty::Ptr, what)?;
                let mut params = vec![Ty::Ptr];
                params.extend(std::iter::repeat(Ty::Tagged).take(args.len().saturating_sub(1)));
                (params, Some(Ty::Tagged))
            }
        };
        if params.len() != args.len() {
            return Err(self.fail(format!(
                "{what} passes {} arguments, expected {}",
                args.len(),
                params.len()
            )));
        }
        for (&arg, &ty) in args.iter().zip(&params) {
            self.expect(arg, ty, what)?;
        }
        self.expect_result(result, returns, what)
    }

    fn check_terminator(&self, block: Block, terminator: &Terminator, entry: Block) -> Result<()> {
        if let Terminator::Brif { cond, .. } = terminator {
            self.expect(*cond, Ty::Bool, &format!("{block}: brif"))?;
        }
        if let Terminator::Return(value) = terminator {
            self.expect(*value, Ty::Tagged, &format!("{block}: return"))?;
        }
        for (succ, args) in terminator.successors() {
            if succ == entry {
                return Err(self.fail(format!("{block} branches back into the entry block")));
            }
            if !self.position.contains_key(&succ) {
                return Err(self.fail(format!("{block} branches to {succ}, which is not laid out")));
            }
            let params = &self.func.block(succ).params;
            if params.len() != args.len() {
                return Err(self.fail(format!(
                    "{block} passes {} arguments to {succ}, which takes {}",
                    args.len(),
                    params.len()
                )));
            }
            for (&arg, &param) in args.iter().zip(params) {
                let ty = self.func.value_ty(param);
                self.expect(arg, ty, &format!("{block}: argument to {succ}"))?;
            }
        }
        Ok(())
    }
}

fn intersect(idom: &HashMap<Block, Block>, rpo: &HashMap<Block, usize>, mut a: Block, mut b: Block) -> Block {
    let order = |block: Block| rpo.get(&block).copied().unwrap_or(usize::MAX);
    while a != b {
        while order(a) > order(b) {
            a = idom[&a];
        }
        while order(b) > order(a) {
            b = idom[&b];
        }
    }
    a
}

fn kind_name(kind: &InstKind) -> &'static str {
    match kind {
        InstKind::Iconst(_) => "iconst",
        InstKind::Bconst(_) => "bconst",
        InstKind::TaggedConst(_) => "tagged_const",
        InstKind::Object { .. } => "object",
        InstKind::Message(_) => "message",
        InstKind::Cast { .. } => "cast",
        InstKind::Binary { .. } => "binary",
        InstKind::BinaryImm { .. } => "binary_imm",
        InstKind::Icmp { .. } => "icmp",
        InstKind::Overflows { .. } => "overflows",
        InstKind::Select { .. } => "select",
        InstKind::SlotLoad(_) => "slot_load",
        InstKind::SlotStore { .. } => "slot_store",
        InstKind::StackBuffer { .. } => "stack_buffer",
        InstKind::Load { .. } => "load",
        InstKind::Store { .. } => "store",
        InstKind::Call { .. } => "call",
        InstKind::TaggedRead { .. } => "tagged_read",
        InstKind::TaggedWrite { .. } => "tagged_write",
        InstKind::SmiToInt(_) => "smi_to_int",
        InstKind::IntToSmi(_) => "int_to_smi",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, FuncBuilder, RuntimeFn};

    fn function(build: impl FnOnce(&mut FuncBuilder, Value)) -> Function {
        let mut b = FuncBuilder::new("f", 0, 2);
        let entry = b.create_block("entry");
        let process = b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        build(&mut b, process);
        b.finish()
    }

    #[test]
    fn well_formed_diamond_passes() {
        let func = function(|b, _| {
            let then = b.create_block("then");
            let other = b.create_block("other");
            let join = b.create_block("join");
            let result = b.append_param(join, Ty::Tagged);
            let flag = b.bconst(true);
            b.brif(flag, then, Vec::new(), other, Vec::new());
            b.switch_to(then);
            let one = b.tagged_const(2);
            b.jump(join, vec![one]);
            b.switch_to(other);
            let two = b.tagged_const(4);
            b.jump(join, vec![two]);
            b.switch_to(join);
            b.ret(result);
        });
        verify_function(&func, Stage::Lowered).unwrap();
    }

    #[test]
    fn missing_terminator_is_reported() {
        let func = function(|b, _| {
            b.tagged_const(2);
        });
        let err = verify_function(&func, Stage::Abstract).unwrap_err();
        assert_eq!(err.code, "E0504");
        assert!(err.message.contains("no terminator"), "{}", err.message);
    }

    #[test]
    fn use_across_sibling_branches_is_not_dominated() {
        let func = function(|b, _| {
            let then = b.create_block("then");
            let other = b.create_block("other");
            let flag = b.bconst(false);
            b.brif(flag, then, Vec::new(), other, Vec::new());
            b.switch_to(then);
            let value = b.tagged_const(2);
            b.ret(value);
            b.switch_to(other);
            b.ret(value);
        });
        let err = verify_function(&func, Stage::Abstract).unwrap_err();
        assert!(err.message.contains("not dominated"), "{}", err.message);
    }

    #[test]
    fn type_mismatches_are_reported() {
        let func = function(|b, _| {
            let tagged = b.tagged_const(2);
            let word = b.iconst(1);
            let sum = b.binary(BinOp::Add, tagged, word);
            let sum = b.cast(sum, Ty::Tagged);
            b.ret(sum);
        });
        let err = verify_function(&func, Stage::Abstract).unwrap_err();
        assert!(err.message.contains("expected Word"), "{}", err.message);
    }

    #[test]
    fn abstract_operations_are_rejected_after_lowering() {
        let func = function(|b, _| {
            let value = b.tagged_const(3);
            let read = b.tagged_read(value, 8);
            b.ret(read);
        });
        verify_function(&func, Stage::Abstract).unwrap();
        let err = verify_function(&func, Stage::Lowered).unwrap_err();
        assert!(err.message.contains("abstract operation"), "{}", err.message);
    }

    #[test]
    fn branches_into_the_entry_block_are_rejected() {
        let mut b = FuncBuilder::new("f", 0, 0);
        let entry = b.create_block("entry");
        b.append_param(entry, Ty::Ptr);
        b.switch_to(entry);
        b.jump(entry, Vec::new());
        let err = verify_function(&b.finish(), Stage::Abstract).unwrap_err();
        assert!(err.message.contains("entry block"), "{}", err.message);
    }

    #[test]
    fn runtime_call_signatures_are_checked() {
        let func = function(|b, process| {
            let status = b.tagged_const(0);
            b.call_void(RuntimeFn::Exit, vec![status]);
            let _ = process;
            b.ret(status);
        });
        let err = verify_function(&func, Stage::Abstract).unwrap_err();
        assert!(err.message.contains("call"), "{}", err.message);
    }

    #[test]
    fn slots_outside_the_frame_are_rejected() {
        let func = function(|b, _| {
            let value = b.slot_load(2);
            b.ret(value);
        });
        let err = verify_function(&func, Stage::Abstract).unwrap_err();
        assert!(err.message.contains("outside"), "{}", err.message);
    }
}
