//! Backend IR: an SSA form with explicit operand-stack slots and abstract
//! tagged-memory operations, translated to Cranelift after lowering.

use crate::constants::{Cell, Image};
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};
use std::collections::HashMap;
use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// Index of a compiled function (bytecode function or generated helper).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex, "fn");

/// Index of a static object in the image.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(u32);
entity_impl!(ConstId, "obj");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    /// A managed word: smi, tagged heap reference or failure.
    Tagged,
    /// A raw host pointer.
    Ptr,
    /// A raw machine integer.
    Word,
    Bool,
}

/// Which tagged view of a static object an instruction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Managed,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Sshr,
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Word,
    Byte,
}

/// Services provided by the runtime (or libc) that generated code calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeFn {
    Allocate,
    AllocateBoxed,
    ObjectFromFailure,
    CollectGarbage,
    Exit,
    Puts,
}

impl RuntimeFn {
    pub const ALL: [RuntimeFn; 6] = [
        RuntimeFn::Allocate,
        RuntimeFn::AllocateBoxed,
        RuntimeFn::ObjectFromFailure,
        RuntimeFn::CollectGarbage,
        RuntimeFn::Exit,
        RuntimeFn::Puts,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeFn::Allocate => "HandleAllocate",
            RuntimeFn::AllocateBoxed => "HandleAllocateBoxed",
            RuntimeFn::ObjectFromFailure => "HandleObjectFromFailure",
            RuntimeFn::CollectGarbage => "HandleGC",
            RuntimeFn::Exit => "exit",
            RuntimeFn::Puts => "puts",
        }
    }

    pub fn params(self) -> &'static [Ty] {
        match self {
            RuntimeFn::Allocate => &[Ty::Ptr, Ty::Tagged, Ty::Word],
            RuntimeFn::AllocateBoxed | RuntimeFn::ObjectFromFailure => &[Ty::Ptr, Ty::Tagged],
            RuntimeFn::CollectGarbage | RuntimeFn::Puts => &[Ty::Ptr],
            RuntimeFn::Exit => &[Ty::Word],
        }
    }

    pub fn returns(self) -> Option<Ty> {
        match self {
            RuntimeFn::Allocate | RuntimeFn::AllocateBoxed | RuntimeFn::ObjectFromFailure => {
                Some(Ty::Tagged)
            }
            RuntimeFn::CollectGarbage | RuntimeFn::Exit | RuntimeFn::Puts => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Function(FuncIndex),
    Native(u32),
    Runtime(RuntimeFn),
    /// Code pointer loaded at run time; all arguments are tagged after the process.
    Indirect(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Iconst(i64),
    Bconst(bool),
    /// A raw tagged word, typically a smi immediate.
    TaggedConst(i64),
    /// Tagged address of a static object. The `Local` view is typed as a
    /// host pointer for inner-pointer arithmetic.
    Object { object: ConstId, view: View },
    /// Address of a NUL-terminated diagnostic string.
    Message(u32),
    Cast { arg: Value, to: Ty },
    Binary { op: BinOp, lhs: Value, rhs: Value },
    BinaryImm { op: BinOp, arg: Value, imm: i64 },
    Icmp { cond: Cond, lhs: Value, rhs: Value },
    /// Whether `lhs op rhs` overflows as signed machine arithmetic.
    Overflows { op: BinOp, lhs: Value, rhs: Value },
    Select { cond: Value, if_true: Value, if_false: Value },
    SlotLoad(u32),
    SlotStore { slot: u32, value: Value },
    StackBuffer { words: u32 },
    Load { addr: Value, offset: i32, ty: Ty },
    Store { addr: Value, offset: i32, value: Value, width: Width },
    Call { callee: Callee, args: Vec<Value> },
    TaggedRead { base: Value, offset: i32 },
    TaggedWrite { base: Value, offset: i32, value: Value },
    SmiToInt(Value),
    IntToSmi(Value),
}

impl InstKind {
    pub fn is_abstract(&self) -> bool {
        matches!(
            self,
            InstKind::TaggedRead { .. }
                | InstKind::TaggedWrite { .. }
                | InstKind::SmiToInt(_)
                | InstKind::IntToSmi(_)
        )
    }

    /// Instructions that may be deleted when their result is unused.
    pub fn is_pure(&self) -> bool {
        !matches!(
            self,
            InstKind::SlotStore { .. }
                | InstKind::Store { .. }
                | InstKind::Call { .. }
                | InstKind::TaggedWrite { .. }
        )
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::Iconst(_)
            | InstKind::Bconst(_)
            | InstKind::TaggedConst(_)
            | InstKind::Object { .. }
            | InstKind::Message(_)
            | InstKind::SlotLoad(_)
            | InstKind::StackBuffer { .. } => Vec::new(),
            InstKind::Cast { arg, .. }
            | InstKind::BinaryImm { arg, .. }
            | InstKind::SmiToInt(arg)
            | InstKind::IntToSmi(arg) => vec![*arg],
            InstKind::Binary { lhs, rhs, .. }
            | InstKind::Icmp { lhs, rhs, .. }
            | InstKind::Overflows { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![*cond, *if_true, *if_false],
            InstKind::SlotStore { value, .. } => vec![*value],
            InstKind::Load { addr, .. } => vec![*addr],
            InstKind::Store { addr, value, .. } => vec![*addr, *value],
            InstKind::Call { callee, args } => {
                let mut operands = args.clone();
                if let Callee::Indirect(code) = callee {
                    operands.push(*code);
                }
                operands
            }
            InstKind::TaggedRead { base, .. } => vec![*base],
            InstKind::TaggedWrite { base, value, .. } => vec![*base, *value],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            InstKind::Iconst(_)
            | InstKind::Bconst(_)
            | InstKind::TaggedConst(_)
            | InstKind::Object { .. }
            | InstKind::Message(_)
            | InstKind::SlotLoad(_)
            | InstKind::StackBuffer { .. } => Vec::new(),
            InstKind::Cast { arg, .. }
            | InstKind::BinaryImm { arg, .. }
            | InstKind::SmiToInt(arg)
            | InstKind::IntToSmi(arg) => vec![arg],
            InstKind::Binary { lhs, rhs, .. }
            | InstKind::Icmp { lhs, rhs, .. }
            | InstKind::Overflows { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::SlotStore { value, .. } => vec![value],
            InstKind::Load { addr, .. } => vec![addr],
            InstKind::Store { addr, value, .. } => vec![addr, value],
            InstKind::Call { callee, args } => {
                let mut operands: Vec<&mut Value> = args.iter_mut().collect();
                if let Callee::Indirect(code) = callee {
                    operands.push(code);
                }
                operands
            }
            InstKind::TaggedRead { base, .. } => vec![base],
            InstKind::TaggedWrite { base, value, .. } => vec![base, value],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Jump {
        dest: Block,
        args: Vec<Value>,
    },
    Brif {
        cond: Value,
        then_dest: Block,
        then_args: Vec<Value>,
        else_dest: Block,
        else_args: Vec<Value>,
    },
    Return(Value),
}

impl Terminator {
    pub fn successors(&self) -> Vec<(Block, &[Value])> {
        match self {
            Terminator::Jump { dest, args } => vec![(*dest, args.as_slice())],
            Terminator::Brif {
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => vec![
                (*then_dest, then_args.as_slice()),
                (*else_dest, else_args.as_slice()),
            ],
            Terminator::Return(_) => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Terminator::Jump { args, .. } => args.clone(),
            Terminator::Brif {
                cond,
                then_args,
                else_args,
                ..
            } => {
                let mut operands = vec![*cond];
                operands.extend(then_args.iter().copied());
                operands.extend(else_args.iter().copied());
                operands
            }
            Terminator::Return(value) => vec![*value],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Terminator::Jump { args, .. } => args.iter_mut().collect(),
            Terminator::Brif {
                cond,
                then_args,
                else_args,
                ..
            } => {
                let mut operands = vec![cond];
                operands.extend(then_args.iter_mut());
                operands.extend(else_args.iter_mut());
                operands
            }
            Terminator::Return(value) => vec![value],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Inst(Inst),
    Param(Block, u32),
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Ty,
    pub def: ValueDef,
}

#[derive(Debug, Clone)]
pub struct InstData {
    pub kind: InstKind,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub name: String,
    pub params: Vec<Value>,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Parameters after the process pointer.
    pub arity: u32,
    /// Number of operand-stack slots.
    pub slots: u32,
    values: PrimaryMap<Value, ValueData>,
    insts: PrimaryMap<Inst, InstData>,
    blocks: PrimaryMap<Block, BlockData>,
    pub layout: Vec<Block>,
}

impl Function {
    pub fn new(name: impl Into<String>, arity: u32, slots: u32) -> Self {
        Self {
            name: name.into(),
            arity,
            slots,
            values: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            layout: Vec::new(),
        }
    }

    pub fn create_block(&mut self, name: impl Into<String>) -> Block {
        let block = self.blocks.push(BlockData {
            name: name.into(),
            ..BlockData::default()
        });
        self.layout.push(block);
        block
    }

    pub fn append_param(&mut self, block: Block, ty: Ty) -> Value {
        let index = self.blocks[block].params.len() as u32;
        let value = self.values.push(ValueData {
            ty,
            def: ValueDef::Param(block, index),
        });
        self.blocks[block].params.push(value);
        value
    }

    /// Creates an instruction that is not yet placed in any block.
    pub fn make_inst(&mut self, kind: InstKind, ty: Option<Ty>) -> (Inst, Option<Value>) {
        let inst = self.insts.push(InstData { kind, result: None });
        let result = ty.map(|ty| {
            self.values.push(ValueData {
                ty,
                def: ValueDef::Inst(inst),
            })
        });
        self.insts[inst].result = result;
        (inst, result)
    }

    pub fn entry(&self) -> Option<Block> {
        self.layout.first().copied()
    }

    /// The process pointer: first parameter of the entry block.
    pub fn process(&self) -> Option<Value> {
        self.entry()
            .and_then(|entry| self.blocks[entry].params.first().copied())
    }

    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    pub fn block_mut(&mut self, block: Block) -> &mut BlockData {
        &mut self.blocks[block]
    }

    pub fn inst(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: Inst) -> &mut InstData {
        &mut self.insts[inst]
    }

    pub fn value(&self, value: Value) -> &ValueData {
        &self.values[value]
    }

    pub fn value_ty(&self, value: Value) -> Ty {
        self.values[value].ty
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn contains_value(&self, value: Value) -> bool {
        value.index() < self.values.len()
    }

    pub fn contains_block(&self, block: Block) -> bool {
        block.index() < self.blocks.len()
    }

    /// Instructions of all laid-out blocks, in order.
    pub fn insts_in_layout(&self) -> impl Iterator<Item = (Block, Inst)> + '_ {
        self.layout
            .iter()
            .flat_map(move |&block| self.blocks[block].insts.iter().map(move |&inst| (block, inst)))
    }

    pub fn predecessors(&self) -> SecondaryMap<Block, Vec<Block>> {
        let mut preds: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();
        for &block in &self.layout {
            if let Some(terminator) = &self.blocks[block].terminator {
                for (succ, _) in terminator.successors() {
                    preds[succ].push(block);
                }
            }
        }
        preds
    }

    /// Rewrites every use of a key of `aliases` to its final replacement.
    pub fn replace_uses(&mut self, aliases: &HashMap<Value, Value>) {
        if aliases.is_empty() {
            return;
        }
        let resolve = |mut value: Value| {
            let mut hops = 0;
            while let Some(&next) = aliases.get(&value) {
                if next == value || hops > aliases.len() {
                    break;
                }
                value = next;
                hops += 1;
            }
            value
        };
        for &block in &self.layout {
            for &inst in &self.blocks[block].insts {
                for operand in self.insts[inst].kind.operands_mut() {
                    *operand = resolve(*operand);
                }
            }
            if let Some(terminator) = &mut self.blocks[block].terminator {
                for operand in terminator.operands_mut() {
                    *operand = resolve(*operand);
                }
            }
        }
    }

    /// Counts uses of every value by laid-out instructions and terminators.
    pub fn use_counts(&self) -> SecondaryMap<Value, u32> {
        let mut uses: SecondaryMap<Value, u32> = SecondaryMap::new();
        for &block in &self.layout {
            let data = &self.blocks[block];
            for &inst in &data.insts {
                for operand in self.insts[inst].kind.operands() {
                    uses[operand] += 1;
                }
            }
            if let Some(terminator) = &data.terminator {
                for operand in terminator.operands() {
                    uses[operand] += 1;
                }
            }
        }
        uses
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function {}(arity {}) slots={} {{", self.name, self.arity, self.slots)?;
        for &block in &self.layout {
            let data = &self.blocks[block];
            write!(f, "{block}")?;
            if !data.params.is_empty() {
                let params: Vec<String> = data
                    .params
                    .iter()
                    .map(|param| format!("{param}: {}", ty_name(self.value_ty(*param))))
                    .collect();
                write!(f, "({})", params.join(", "))?;
            }
            writeln!(f, ":  ; {}", data.name)?;
            for &inst in &data.insts {
                let inst = &self.insts[inst];
                write!(f, "    ")?;
                if let Some(result) = inst.result {
                    write!(f, "{result} = ")?;
                }
                writeln!(f, "{}", DisplayKind(&inst.kind))?;
            }
            match &data.terminator {
                Some(Terminator::Jump { dest, args }) => {
                    writeln!(f, "    jump {dest}{}", args_text(args))?
                }
                Some(Terminator::Brif {
                    cond,
                    then_dest,
                    then_args,
                    else_dest,
                    else_args,
                }) => writeln!(
                    f,
                    "    brif {cond}, {then_dest}{}, {else_dest}{}",
                    args_text(then_args),
                    args_text(else_args)
                )?,
                Some(Terminator::Return(value)) => writeln!(f, "    return {value}")?,
                None => writeln!(f, "    ; no terminator")?,
            }
        }
        writeln!(f, "}}")
    }
}

fn args_text(args: &[Value]) -> String {
    if args.is_empty() {
        String::new()
    } else {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        format!("({})", args.join(", "))
    }
}

pub(crate) fn ty_name(ty: Ty) -> &'static str {
    match ty {
        Ty::Tagged => "tagged",
        Ty::Ptr => "ptr",
        Ty::Word => "word",
        Ty::Bool => "bool",
    }
}

struct DisplayKind<'a>(&'a InstKind);

impl fmt::Display for DisplayKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            InstKind::Iconst(value) => write!(f, "iconst {value}"),
            InstKind::Bconst(value) => write!(f, "bconst {value}"),
            InstKind::TaggedConst(value) => write!(f, "tagged_const {value:#x}"),
            InstKind::Object { object, view } => write!(f, "object {object} {view:?}"),
            InstKind::Message(index) => write!(f, "message {index}"),
            InstKind::Cast { arg, to } => write!(f, "cast.{} {arg}", ty_name(*to)),
            InstKind::Binary { op, lhs, rhs } => write!(f, "{op:?} {lhs}, {rhs}"),
            InstKind::BinaryImm { op, arg, imm } => write!(f, "{op:?}_imm {arg}, {imm}"),
            InstKind::Icmp { cond, lhs, rhs } => write!(f, "icmp {cond:?} {lhs}, {rhs}"),
            InstKind::Overflows { op, lhs, rhs } => write!(f, "overflows {op:?} {lhs}, {rhs}"),
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => write!(f, "select {cond}, {if_true}, {if_false}"),
            InstKind::SlotLoad(slot) => write!(f, "slot_load s{slot}"),
            InstKind::SlotStore { slot, value } => write!(f, "slot_store s{slot}, {value}"),
            InstKind::StackBuffer { words } => write!(f, "stack_buffer {words}"),
            InstKind::Load { addr, offset, ty } => {
                write!(f, "load.{} {addr}{offset:+}", ty_name(*ty))
            }
            InstKind::Store {
                addr,
                offset,
                value,
                width,
            } => write!(f, "store.{width:?} {value}, {addr}{offset:+}"),
            InstKind::Call { callee, args } => {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                match callee {
                    Callee::Function(index) => write!(f, "call {index}({})", args.join(", ")),
                    Callee::Native(index) => write!(f, "call native{index}({})", args.join(", ")),
                    Callee::Runtime(runtime) => {
                        write!(f, "call {}({})", runtime.symbol(), args.join(", "))
                    }
                    Callee::Indirect(code) => {
                        write!(f, "call_indirect {code}({})", args.join(", "))
                    }
                }
            }
            InstKind::TaggedRead { base, offset } => write!(f, "tagged_read {base}{offset:+}"),
            InstKind::TaggedWrite {
                base,
                offset,
                value,
            } => write!(f, "tagged_write {value}, {base}{offset:+}"),
            InstKind::SmiToInt(value) => write!(f, "smi_to_int {value}"),
            InstKind::IntToSmi(value) => write!(f, "int_to_smi {value}"),
        }
    }
}

/// Cursor-style builder appending to the current block.
pub struct FuncBuilder {
    pub func: Function,
    current: Option<Block>,
}

impl FuncBuilder {
    pub fn new(name: impl Into<String>, arity: u32, slots: u32) -> Self {
        Self {
            func: Function::new(name, arity, slots),
            current: None,
        }
    }

    pub fn create_block(&mut self, name: impl Into<String>) -> Block {
        self.func.create_block(name)
    }

    pub fn append_param(&mut self, block: Block, ty: Ty) -> Value {
        self.func.append_param(block, ty)
    }

    pub fn switch_to(&mut self, block: Block) {
        self.current = Some(block);
    }

    pub fn current(&self) -> Option<Block> {
        self.current
    }

    /// True once the current block has a terminator.
    pub fn is_terminated(&self) -> bool {
        match self.current {
            Some(block) => self.func.block(block).terminator.is_some(),
            None => true,
        }
    }

    fn push(&mut self, kind: InstKind, ty: Option<Ty>) -> Option<Value> {
        let (inst, result) = self.func.make_inst(kind, ty);
        // Instructions emitted after a terminator stay unplaced; the
        // verifier reports any use of their results.
        if let Some(block) = self.current {
            if self.func.block(block).terminator.is_none() {
                self.func.block_mut(block).insts.push(inst);
            }
        }
        result
    }

    fn value(&mut self, kind: InstKind, ty: Ty) -> Value {
        let (inst, result) = self.func.make_inst(kind, Some(ty));
        if let Some(block) = self.current {
            if self.func.block(block).terminator.is_none() {
                self.func.block_mut(block).insts.push(inst);
            }
        }
        match result {
            Some(value) => value,
            None => unreachable!("make_inst returns a value when given a type"),
        }
    }

    pub fn iconst(&mut self, value: i64) -> Value {
        self.value(InstKind::Iconst(value), Ty::Word)
    }

    pub fn bconst(&mut self, value: bool) -> Value {
        self.value(InstKind::Bconst(value), Ty::Bool)
    }

    pub fn tagged_const(&mut self, word: i64) -> Value {
        self.value(InstKind::TaggedConst(word), Ty::Tagged)
    }

    pub fn object(&mut self, object: ConstId) -> Value {
        self.value(
            InstKind::Object {
                object,
                view: View::Managed,
            },
            Ty::Tagged,
        )
    }

    pub fn object_local(&mut self, object: ConstId) -> Value {
        self.value(
            InstKind::Object {
                object,
                view: View::Local,
            },
            Ty::Ptr,
        )
    }

    pub fn message(&mut self, index: u32) -> Value {
        self.value(InstKind::Message(index), Ty::Ptr)
    }

    pub fn cast(&mut self, arg: Value, to: Ty) -> Value {
        self.value(InstKind::Cast { arg, to }, to)
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.value(InstKind::Binary { op, lhs, rhs }, Ty::Word)
    }

    pub fn binary_imm(&mut self, op: BinOp, arg: Value, imm: i64) -> Value {
        self.value(InstKind::BinaryImm { op, arg, imm }, Ty::Word)
    }

    pub fn icmp(&mut self, cond: Cond, lhs: Value, rhs: Value) -> Value {
        self.value(InstKind::Icmp { cond, lhs, rhs }, Ty::Bool)
    }

    pub fn overflows(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.value(InstKind::Overflows { op, lhs, rhs }, Ty::Bool)
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.func.value_ty(if_true);
        self.value(
            InstKind::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    pub fn slot_load(&mut self, slot: u32) -> Value {
        self.value(InstKind::SlotLoad(slot), Ty::Tagged)
    }

    pub fn slot_store(&mut self, slot: u32, value: Value) {
        self.push(InstKind::SlotStore { slot, value }, None);
    }

    pub fn stack_buffer(&mut self, words: u32) -> Value {
        self.value(InstKind::StackBuffer { words }, Ty::Ptr)
    }

    pub fn load(&mut self, addr: Value, offset: i32, ty: Ty) -> Value {
        self.value(InstKind::Load { addr, offset, ty }, ty)
    }

    pub fn store(&mut self, addr: Value, offset: i32, value: Value, width: Width) {
        self.push(
            InstKind::Store {
                addr,
                offset,
                value,
                width,
            },
            None,
        );
    }

    /// Call returning a tagged value.
    pub fn call(&mut self, callee: Callee, args: Vec<Value>) -> Value {
        self.value(InstKind::Call { callee, args }, Ty::Tagged)
    }

    pub fn call_void(&mut self, runtime: RuntimeFn, args: Vec<Value>) {
        self.push(
            InstKind::Call {
                callee: Callee::Runtime(runtime),
                args,
            },
            None,
        );
    }

    pub fn tagged_read(&mut self, base: Value, offset: i32) -> Value {
        self.value(InstKind::TaggedRead { base, offset }, Ty::Tagged)
    }

    pub fn tagged_write(&mut self, base: Value, offset: i32, value: Value) {
        self.push(InstKind::TaggedWrite { base, offset, value }, None);
    }

    pub fn smi_to_int(&mut self, value: Value) -> Value {
        self.value(InstKind::SmiToInt(value), Ty::Word)
    }

    pub fn int_to_smi(&mut self, value: Value) -> Value {
        self.value(InstKind::IntToSmi(value), Ty::Tagged)
    }

    fn terminate(&mut self, terminator: Terminator) {
        if let Some(block) = self.current {
            let data = self.func.block_mut(block);
            if data.terminator.is_none() {
                data.terminator = Some(terminator);
            }
        }
    }

    pub fn jump(&mut self, dest: Block, args: Vec<Value>) {
        self.terminate(Terminator::Jump { dest, args });
    }

    pub fn brif(
        &mut self,
        cond: Value,
        then_dest: Block,
        then_args: Vec<Value>,
        else_dest: Block,
        else_args: Vec<Value>,
    ) {
        self.terminate(Terminator::Brif {
            cond,
            then_dest,
            then_args,
            else_dest,
            else_args,
        });
    }

    pub fn ret(&mut self, value: Value) {
        self.terminate(Terminator::Return(value));
    }

    pub fn finish(self) -> Function {
        self.func
    }
}

/// A compiled function slot in the module.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub symbol: String,
    pub arity: u32,
    pub body: Option<Function>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDecl {
    pub name: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Abstract tagged operations may appear.
    Abstract,
    /// Only concrete operations remain.
    Lowered,
}

/// One compilation unit: the image, its functions and the root table.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: PrimaryMap<FuncIndex, FunctionDecl>,
    pub natives: Vec<NativeDecl>,
    pub image: Image,
    pub roots: Vec<Cell>,
    pub entry: FuncIndex,
    pub static_fields: ConstId,
    /// Class the runtime gives boxed values and failure objects.
    pub boxed_class: ConstId,
    pub messages: Vec<String>,
    pub stage: Stage,
}

impl Module {
    pub fn bodies(&self) -> impl Iterator<Item = (FuncIndex, &Function)> {
        self.functions
            .iter()
            .filter_map(|(index, decl)| decl.body.as_ref().map(|body| (index, body)))
    }

    pub fn bodies_mut(&mut self) -> impl Iterator<Item = (FuncIndex, &mut Function)> {
        self.functions
            .iter_mut()
            .filter_map(|(index, decl)| decl.body.as_mut().map(|body| (index, body)))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {} ({:?})", self.name, self.stage)?;
        writeln!(
            f,
            "; image: {} objects, {} bytes; {} roots; entry {}",
            self.image.objects.len(),
            self.image.size,
            self.roots.len(),
            self.functions[self.entry].symbol
        )?;
        for native in &self.natives {
            writeln!(f, "; native {} -> {}", native.name, native.symbol)?;
        }
        for (index, decl) in self.functions.iter() {
            match &decl.body {
                Some(body) => {
                    writeln!(f)?;
                    writeln!(f, "; {index} {}", decl.symbol)?;
                    write!(f, "{body}")?;
                }
                None => writeln!(f, "; {index} {} (no body)", decl.symbol)?,
            }
        }
        Ok(())
    }
}
