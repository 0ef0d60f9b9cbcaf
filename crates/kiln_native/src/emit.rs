//! Bytecode to IR translation, one function at a time.
//!
//! Every function gets a fixed array of operand-stack slots: one per
//! argument, `FRAME_AUX_SLOTS` bookkeeping slots that generated code never
//! touches, then one per unit of maximum stack height. Blocks communicate
//! only through those slots, so block heads need no parameters.

use crate::cfg::{reconstruct, BlockLayout};
use crate::constants::{Materializer, NativeConstant};
use crate::error::{internal_error, native_error, Result, E_BYTECODE};
use crate::ir::{BinOp, Block, Callee, Cond, ConstId, FuncBuilder, FuncIndex, Function, RuntimeFn, Ty, Value, Width};
use crate::stack_diff::{literal, literal_object};
use kiln_core::abi::{self, FRAME_AUX_SLOTS};
use kiln_core::bytecode::{Instruction, Opcode};
use kiln_core::{FunctionObject, InstanceType, ObjectId, Program, Selector};
use std::collections::{BTreeMap, HashMap};

/// Static objects every function body refers to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoreConstants {
    pub null: ConstId,
    pub true_object: ConstId,
    pub false_object: ConstId,
    pub smi_class: ConstId,
    pub dispatch_table: ConstId,
}

/// State shared by all function emissions of one compilation run.
pub struct EmitContext<'p> {
    pub materializer: Materializer<'p>,
    program: &'p Program,
    core: CoreConstants,
    slow_cases: HashMap<u32, FuncIndex>,
    pub bodies: Vec<(FuncIndex, Function)>,
    pub messages: Vec<String>,
}

impl<'p> EmitContext<'p> {
    pub fn new(mut materializer: Materializer<'p>) -> Result<Self> {
        let program = materializer.program();
        let roots = &program.roots;
        let core = CoreConstants {
            null: materializer.materialize_object(roots.null_object)?,
            true_object: materializer.materialize_object(roots.true_object)?,
            false_object: materializer.materialize_object(roots.false_object)?,
            smi_class: materializer.materialize_object(roots.smi_class)?,
            dispatch_table: materializer.materialize_object(roots.dispatch_table)?,
        };
        Ok(Self {
            materializer,
            program,
            core,
            slow_cases: HashMap::new(),
            bodies: Vec::new(),
            messages: Vec::new(),
        })
    }

    /// Emits bodies for every declared function until none is left.
    pub fn emit_pending(&mut self) -> Result<()> {
        while let Some((index, id)) = self.materializer.next_pending() {
            let body = emit_function(self, index, id)?;
            self.bodies.push((index, body));
        }
        Ok(())
    }

    fn message(&mut self, text: String) -> u32 {
        if let Some(index) = self.messages.iter().position(|known| *known == text) {
            return index as u32;
        }
        self.messages.push(text);
        self.messages.len() as u32 - 1
    }

    /// `Smi_<selector>`: full dispatch for a smi operation whose operands are
    /// not both smis or whose result overflowed. Generated once per selector.
    pub fn smi_slow_case(&mut self, selector: Selector) -> FuncIndex {
        if let Some(&index) = self.slow_cases.get(&selector.raw()) {
            return index;
        }
        let symbol = format!("Smi_{selector}");
        let index = self.materializer.declare_helper(symbol.clone(), 2);
        self.slow_cases.insert(selector.raw(), index);

        let mut b = FuncBuilder::new(symbol, 2, 0);
        let entry = b.create_block("entry");
        let process = b.append_param(entry, Ty::Ptr);
        let receiver = b.append_param(entry, Ty::Tagged);
        let argument = b.append_param(entry, Ty::Tagged);
        b.switch_to(entry);
        let result = invoke_dispatch(
            &mut b,
            &self.core,
            process,
            SelectorId::Static(selector.id()),
            vec![receiver, argument],
        );
        b.ret(result);
        self.bodies.push((index, b.finish()));
        index
    }
}

#[derive(Debug, Clone, Copy)]
enum SelectorId {
    Static(u32),
    /// Selector id computed at run time, as a raw word.
    Dynamic(Value),
}

fn is_smi(b: &mut FuncBuilder, value: Value) -> Value {
    let word = b.cast(value, Ty::Word);
    let tag = b.binary_imm(BinOp::And, word, abi::SMI_TAG_MASK as i64);
    let zero = b.iconst(0);
    b.icmp(Cond::Eq, tag, zero)
}

fn is_failure(b: &mut FuncBuilder, value: Value) -> Value {
    let word = b.cast(value, Ty::Word);
    let tag = b.binary_imm(BinOp::And, word, abi::FAILURE_TAG_MASK as i64);
    let failure = b.iconst(abi::FAILURE_TAG as i64);
    b.icmp(Cond::Eq, tag, failure)
}

fn failure_kind_is(b: &mut FuncBuilder, value: Value, kind: u64) -> Value {
    let word = b.cast(value, Ty::Word);
    let actual = b.binary_imm(BinOp::Ushr, word, i64::from(abi::FAILURE_KIND_SHIFT));
    let expected = b.iconst(kind as i64);
    b.icmp(Cond::Eq, actual, expected)
}

/// Loads the dispatch-table entry for `receiver` and `selector`. Smis use the
/// smi class; heap objects use their class word.
fn lookup_entry(b: &mut FuncBuilder, core: &CoreConstants, receiver: Value, selector: SelectorId) -> Value {
    let smi_receiver = b.create_block("smi_receiver");
    let heap_receiver = b.create_block("heap_receiver");
    let lookup = b.create_block("lookup");
    let klass = b.append_param(lookup, Ty::Tagged);

    let smi = is_smi(b, receiver);
    b.brif(smi, smi_receiver, Vec::new(), heap_receiver, Vec::new());

    b.switch_to(smi_receiver);
    let smi_class = b.object(core.smi_class);
    b.jump(lookup, vec![smi_class]);

    b.switch_to(heap_receiver);
    let receiver_class = b.tagged_read(receiver, abi::HEAP_OBJECT_CLASS_OFFSET);
    b.jump(lookup, vec![receiver_class]);

    b.switch_to(lookup);
    let class_id = b.tagged_read(klass, abi::CLASS_ID_OFFSET);
    let class_id = b.smi_to_int(class_id);
    let index = match selector {
        SelectorId::Static(id) => b.binary_imm(BinOp::Add, class_id, i64::from(id) + abi::ARRAY_HEADER_WORDS),
        SelectorId::Dynamic(id) => {
            let row = b.binary(BinOp::Add, class_id, id);
            b.binary_imm(BinOp::Add, row, abi::ARRAY_HEADER_WORDS)
        }
    };
    let scaled = b.binary_imm(BinOp::Shl, index, 3);
    // The table lives in the image, outside the collected heap.
    let table = b.object_local(core.dispatch_table);
    let table = b.cast(table, Ty::Word);
    let table = b.binary_imm(BinOp::Add, table, -abi::HEAP_OBJECT_TAG);
    let address = b.binary(BinOp::Add, table, scaled);
    let address = b.cast(address, Ty::Ptr);
    b.load(address, 0, Ty::Tagged)
}

/// True when the entry's recorded offset matches the selector id.
fn entry_matches(b: &mut FuncBuilder, entry: Value, selector: SelectorId) -> Value {
    let recorded = b.tagged_read(entry, abi::DISPATCH_ENTRY_OFFSET_OFFSET);
    let expected = match selector {
        SelectorId::Static(id) => b.tagged_const(abi::smi(i64::from(id)) as i64),
        SelectorId::Dynamic(id) => b.int_to_smi(id),
    };
    b.icmp(Cond::Eq, recorded, expected)
}

fn no_such_method_entry(b: &mut FuncBuilder, core: &CoreConstants) -> Value {
    let table = b.object(core.dispatch_table);
    let offset = abi::ARRAY_HEADER_SIZE + abi::DISPATCH_NSM_INDEX as i32 * abi::WORD_SIZE;
    b.tagged_read(table, offset)
}

fn call_entry(b: &mut FuncBuilder, entry: Value, process: Value, args: Vec<Value>) -> Value {
    let code = b.tagged_read(entry, abi::DISPATCH_ENTRY_CODE_OFFSET);
    let code = b.cast(code, Ty::Ptr);
    let mut call_args = Vec::with_capacity(args.len() + 1);
    call_args.push(process);
    call_args.extend(args);
    b.call(Callee::Indirect(code), call_args)
}

/// Monomorphic inline-cache dispatch with the no-such-method entry as the
/// single fallback. `args[0]` is the receiver.
fn invoke_dispatch(
    b: &mut FuncBuilder,
    core: &CoreConstants,
    process: Value,
    selector: SelectorId,
    args: Vec<Value>,
) -> Value {
    let receiver = args[0];
    let entry = lookup_entry(b, core, receiver, selector);
    let hit = entry_matches(b, entry, selector);

    let miss = b.create_block("lookup_miss");
    let call = b.create_block("lookup_hit");
    let target = b.append_param(call, Ty::Tagged);
    b.brif(hit, call, vec![entry], miss, Vec::new());

    b.switch_to(miss);
    let nsm = no_such_method_entry(b, core);
    b.jump(call, vec![nsm]);

    b.switch_to(call);
    call_entry(b, target, process, args)
}

pub fn emit_function(ctx: &mut EmitContext<'_>, index: FuncIndex, id: ObjectId) -> Result<Function> {
    let program = ctx.program;
    let function = program.heap.function(id).ok_or_else(|| {
        internal_error(format!("declared function {id} has no bytecode"))
    })?;
    let symbol = ctx.materializer.symbol(index).to_string();
    let layout = reconstruct(program, &symbol, function)?;
    let slots = function.arity + FRAME_AUX_SLOTS + layout.max_height;
    log::debug!(
        "emitting {symbol}: arity {}, {} blocks, {slots} slots",
        function.arity,
        layout.labels.len()
    );

    let mut b = FuncBuilder::new(symbol.clone(), function.arity, slots);
    let entry = b.create_block("entry");
    let process = b.append_param(entry, Ty::Ptr);
    let args: Vec<Value> = (0..function.arity)
        .map(|_| b.append_param(entry, Ty::Tagged))
        .collect();
    let mut blocks = BTreeMap::new();
    for &bci in layout.labels.keys() {
        blocks.insert(bci, b.create_block(format!("bci{bci}")));
    }

    // Code may branch back to bci 0, so arguments are stored in a separate
    // pre-entry block.
    b.switch_to(entry);
    for (slot, arg) in args.into_iter().enumerate() {
        b.slot_store(slot as u32, arg);
    }
    let first = blocks
        .get(&0)
        .copied()
        .ok_or_else(|| internal_error(format!("{symbol}: no block at bci 0")))?;
    b.jump(first, Vec::new());

    let mut emitter = FunctionEmitter {
        ctx,
        program,
        function,
        name: symbol,
        layout,
        blocks,
        b,
        process,
        height: 0,
    };
    let labels: Vec<(u32, u32)> = emitter.layout.labels.iter().map(|(&bci, &h)| (bci, h)).collect();
    for (bci, height) in labels {
        emitter.emit_block(bci, height)?;
    }
    Ok(emitter.b.finish())
}

struct FunctionEmitter<'a, 'p> {
    ctx: &'a mut EmitContext<'p>,
    program: &'p Program,
    function: &'p FunctionObject,
    name: String,
    layout: BlockLayout,
    blocks: BTreeMap<u32, Block>,
    b: FuncBuilder,
    process: Value,
    height: u32,
}

/// What translating one instruction did to the current block.
enum Flow {
    Continue,
    /// The block is terminated.
    Stop,
    /// The next instruction was folded into this one.
    Fused,
}

impl FunctionEmitter<'_, '_> {
    fn block_at(&self, bci: u32) -> Result<Block> {
        self.blocks.get(&bci).copied().ok_or_else(|| {
            internal_error(format!("{}: no block at bci {bci}", self.name))
        })
    }

    fn base(&self) -> u32 {
        self.function.arity + FRAME_AUX_SLOTS
    }

    fn push(&mut self, value: Value) {
        let slot = self.base() + self.height;
        self.b.slot_store(slot, value);
        self.height += 1;
    }

    fn pop(&mut self) -> Result<Value> {
        if self.height == 0 {
            return Err(internal_error(format!("{}: pop from an empty operand stack", self.name)));
        }
        self.height -= 1;
        let slot = self.base() + self.height;
        Ok(self.b.slot_load(slot))
    }

    fn pop_n(&mut self, count: u32) -> Result<Vec<Value>> {
        let mut values = (0..count).map(|_| self.pop()).collect::<Result<Vec<_>>>()?;
        values.reverse();
        Ok(values)
    }

    /// Slot of the `index`-th value below the top, reaching into the
    /// arguments once the operand stack and the auxiliary slots are passed.
    fn local(&self, index: i64, bci: u32) -> Result<u32> {
        let offset = i64::from(self.base()) + i64::from(self.height) - index - 1;
        let height = i64::from(self.height);
        let in_aux = index >= height && index < height + i64::from(FRAME_AUX_SLOTS);
        if offset < 0 || in_aux {
            return Err(native_error(
                E_BYTECODE,
                format!("{}: local {index} at bci {bci} is outside the frame", self.name),
            ));
        }
        Ok(offset as u32)
    }

    fn null(&mut self) -> Value {
        let null = self.ctx.core.null;
        self.b.object(null)
    }

    fn boolean(&mut self, cond: Value) -> Value {
        let (true_object, false_object) = (self.ctx.core.true_object, self.ctx.core.false_object);
        let t = self.b.object(true_object);
        let f = self.b.object(false_object);
        self.b.select(cond, t, f)
    }

    fn is_true(&mut self, value: Value) -> Value {
        let true_object = self.ctx.core.true_object;
        let t = self.b.object(true_object);
        self.b.icmp(Cond::Eq, value, t)
    }

    fn constant(&mut self, value: kiln_core::Value) -> Result<Value> {
        Ok(match self.ctx.materializer.materialize(value)? {
            NativeConstant::Immediate(word) => self.b.tagged_const(word),
            NativeConstant::Object(object) => self.b.object(object),
        })
    }

    fn statics(&mut self) -> Value {
        self.b.load(self.process, abi::PROCESS_STATICS_OFFSET, Ty::Tagged)
    }

    fn static_offset(index: i64) -> i32 {
        abi::ARRAY_HEADER_SIZE + (index as i32) * abi::WORD_SIZE
    }

    fn emit_block(&mut self, start: u32, height: u32) -> Result<()> {
        let block = self.block_at(start)?;
        self.b.switch_to(block);
        self.height = height;
        let mut bci = start;
        loop {
            if bci != start && self.layout.is_label(bci) {
                let next = self.block_at(bci)?;
                self.b.jump(next, Vec::new());
                return Ok(());
            }
            let instruction = Instruction::decode(&self.function.bytecodes, bci)?;
            match self.emit_instruction(&instruction)? {
                Flow::Continue => bci = instruction.next_bci(),
                Flow::Stop | Flow::Fused => return Ok(()),
            }
        }
    }

    fn emit_instruction(&mut self, instruction: &Instruction) -> Result<Flow> {
        let bci = instruction.bci;
        let op0 = instruction.operand(0);
        match instruction.opcode {
            Opcode::LoadLocal0
            | Opcode::LoadLocal1
            | Opcode::LoadLocal2
            | Opcode::LoadLocal3
            | Opcode::LoadLocal4
            | Opcode::LoadLocal5 => {
                let index = instruction.opcode as i64 - Opcode::LoadLocal0 as i64;
                self.load_local(index, bci)?;
            }
            Opcode::LoadLocal | Opcode::LoadLocalWide => self.load_local(op0, bci)?,
            Opcode::LoadBoxed => {
                let slot = self.local(op0, bci)?;
                let boxed = self.b.slot_load(slot);
                let value = self.b.tagged_read(boxed, abi::BOXED_VALUE_OFFSET);
                self.push(value);
            }
            Opcode::LoadStatic => {
                let statics = self.statics();
                let value = self.b.tagged_read(statics, Self::static_offset(op0));
                self.push(value);
            }
            Opcode::LoadStaticInit => self.load_static_init(op0),
            Opcode::LoadField | Opcode::LoadFieldWide => {
                let object = self.pop()?;
                let offset = abi::INSTANCE_HEADER_SIZE + op0 as i32 * abi::WORD_SIZE;
                let value = self.b.tagged_read(object, offset);
                self.push(value);
            }
            Opcode::LoadConst => {
                let value = literal(self.function, instruction)?;
                let value = self.constant(value)?;
                self.push(value);
            }
            Opcode::StoreLocal => {
                let top = self.local(0, bci)?;
                let value = self.b.slot_load(top);
                let slot = self.local(op0, bci)?;
                self.b.slot_store(slot, value);
            }
            Opcode::StoreBoxed => {
                let top = self.local(0, bci)?;
                let value = self.b.slot_load(top);
                let slot = self.local(op0, bci)?;
                let boxed = self.b.slot_load(slot);
                self.b.tagged_write(boxed, abi::BOXED_VALUE_OFFSET, value);
            }
            Opcode::StoreStatic => {
                let top = self.local(0, bci)?;
                let value = self.b.slot_load(top);
                let statics = self.statics();
                self.b.tagged_write(statics, Self::static_offset(op0), value);
            }
            Opcode::StoreField | Opcode::StoreFieldWide => {
                let value = self.pop()?;
                let object = self.pop()?;
                let offset = abi::INSTANCE_HEADER_SIZE + op0 as i32 * abi::WORD_SIZE;
                self.b.tagged_write(object, offset, value);
                self.push(value);
            }
            Opcode::LoadLiteralNull => {
                let null = self.null();
                self.push(null);
            }
            Opcode::LoadLiteralTrue | Opcode::LoadLiteralFalse => {
                let object = if instruction.opcode == Opcode::LoadLiteralTrue {
                    self.ctx.core.true_object
                } else {
                    self.ctx.core.false_object
                };
                let value = self.b.object(object);
                self.push(value);
            }
            Opcode::LoadLiteral0 => self.load_integer(0)?,
            Opcode::LoadLiteral1 => self.load_integer(1)?,
            Opcode::LoadLiteral | Opcode::LoadLiteralWide => self.load_integer(op0)?,

            Opcode::InvokeMethod
            | Opcode::InvokeMod
            | Opcode::InvokeMul
            | Opcode::InvokeTruncDiv
            | Opcode::InvokeBitNot
            | Opcode::InvokeBitAnd
            | Opcode::InvokeBitOr
            | Opcode::InvokeBitXor
            | Opcode::InvokeBitShr
            | Opcode::InvokeBitShl => {
                let selector = Selector::from_raw(op0 as u32);
                let args = self.pop_n(selector.arity() + 1)?;
                let core = self.ctx.core;
                let result = invoke_dispatch(&mut self.b, &core, self.process, SelectorId::Static(selector.id()), args);
                self.push(result);
            }
            Opcode::InvokeTest => {
                let selector = Selector::from_raw(op0 as u32);
                let receiver = self.pop()?;
                let core = self.ctx.core;
                let entry = lookup_entry(&mut self.b, &core, receiver, SelectorId::Static(selector.id()));
                let hit = entry_matches(&mut self.b, entry, SelectorId::Static(selector.id()));
                let result = self.boolean(hit);
                self.push(result);
            }
            Opcode::InvokeNoSuchMethod => {
                let selector = Selector::from_raw(op0 as u32);
                let args = self.pop_n(selector.arity() + 1)?;
                let core = self.ctx.core;
                let entry = no_such_method_entry(&mut self.b, &core);
                let result = call_entry(&mut self.b, entry, self.process, args);
                self.push(result);
            }
            Opcode::InvokeTestNoSuchMethod => {
                self.pop()?;
                let false_object = self.ctx.core.false_object;
                let value = self.b.object(false_object);
                self.push(value);
            }
            Opcode::InvokeStatic | Opcode::InvokeFactory => {
                let target = literal_object(self.function, instruction)?;
                let callee = self.ctx.materializer.function(target)?;
                let arity = self
                    .program
                    .heap
                    .function(target)
                    .map(|function| function.arity)
                    .ok_or_else(|| internal_error(format!("{target} is not a function")))?;
                let mut args = vec![self.process];
                args.extend(self.pop_n(arity)?);
                let result = self.b.call(Callee::Function(callee), args);
                self.push(result);
            }
            Opcode::Allocate | Opcode::AllocateImmutable => {
                let target = literal_object(self.function, instruction)?;
                let fields = self
                    .program
                    .heap
                    .class(target)
                    .map(|class| class.format.fields)
                    .ok_or_else(|| internal_error(format!("{target} is not a class")))?;
                let class = self.ctx.materializer.materialize_object(target)?;
                let klass = self.b.object(class);
                let immutable = self.b.iconst(i64::from(instruction.opcode == Opcode::AllocateImmutable));
                let instance =
                    self.allocate(RuntimeFn::Allocate, vec![self.process, klass, immutable], |emitter, instance| {
                        for field in (0..fields).rev() {
                            let value = emitter.pop()?;
                            let offset = abi::INSTANCE_HEADER_SIZE + field as i32 * abi::WORD_SIZE;
                            emitter.b.tagged_write(instance, offset, value);
                        }
                        Ok(())
                    })?;
                self.push(instance);
            }
            Opcode::AllocateBoxed => {
                let value = self.pop()?;
                let boxed = self.allocate(RuntimeFn::AllocateBoxed, vec![self.process, value], |_, _| Ok(()))?;
                self.push(boxed);
            }
            Opcode::InvokeNative | Opcode::InvokeDetachableNative => {
                self.invoke_native(op0 as u32, instruction.operand(1) as u32, bci)?;
            }
            Opcode::InvokeSelector => {
                let selector = self.pop()?;
                let args = self.pop_n(op0 as u32 + 1)?;
                let raw = self.b.smi_to_int(selector);
                let id = self.b.binary_imm(BinOp::Ushr, raw, i64::from(Selector::id_shift()));
                let core = self.ctx.core;
                let result = invoke_dispatch(&mut self.b, &core, self.process, SelectorId::Dynamic(id), args);
                self.push(result);
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Drop => {
                self.pop_n(op0 as u32)?;
            }
            Opcode::Return | Opcode::ExitNoSuchMethod => {
                let value = self.pop()?;
                self.b.ret(value);
                return Ok(Flow::Stop);
            }
            Opcode::ReturnNull => {
                let null = self.null();
                self.b.ret(null);
                return Ok(Flow::Stop);
            }
            Opcode::BranchWide | Opcode::BranchBack | Opcode::BranchBackWide => {
                let target = self.target(instruction)?;
                self.b.jump(target, Vec::new());
                return Ok(Flow::Stop);
            }
            Opcode::PopAndBranchWide | Opcode::PopAndBranchBackWide => {
                self.pop_n(op0 as u32)?;
                let target = self.target(instruction)?;
                self.b.jump(target, Vec::new());
                return Ok(Flow::Stop);
            }
            Opcode::BranchIfTrueWide
            | Opcode::BranchIfFalseWide
            | Opcode::BranchBackIfTrue
            | Opcode::BranchBackIfFalse
            | Opcode::BranchBackIfTrueWide
            | Opcode::BranchBackIfFalseWide => {
                let value = self.pop()?;
                let cond = self.is_true(value);
                let target = self.target(instruction)?;
                let next = self.block_at(instruction.next_bci())?;
                let if_true = matches!(
                    instruction.opcode,
                    Opcode::BranchIfTrueWide | Opcode::BranchBackIfTrue | Opcode::BranchBackIfTrueWide
                );
                if if_true {
                    self.b.brif(cond, target, Vec::new(), next, Vec::new());
                } else {
                    self.b.brif(cond, next, Vec::new(), target, Vec::new());
                }
                return Ok(Flow::Stop);
            }
            Opcode::Negate => {
                let value = self.pop()?;
                let cond = self.is_true(value);
                let (true_object, false_object) = (self.ctx.core.true_object, self.ctx.core.false_object);
                let t = self.b.object(true_object);
                let f = self.b.object(false_object);
                let negated = self.b.select(cond, f, t);
                self.push(negated);
            }
            Opcode::Identical | Opcode::IdenticalNonNumeric => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let cond = self.b.icmp(Cond::Eq, lhs, rhs);
                let result = self.boolean(cond);
                self.push(result);
            }
            Opcode::StackOverflowCheck => {}
            Opcode::ProcessYield => {
                let status = self.b.iconst(0);
                self.b.call_void(RuntimeFn::Exit, vec![status]);
            }
            Opcode::SubroutineCall => {
                let target = self.target(instruction)?;
                let continuation = instruction
                    .subroutine_continuation()
                    .ok_or_else(|| internal_error("subroutine call without continuation"))?;
                let marker = self.b.tagged_const(abi::smi(continuation) as i64);
                self.push(marker);
                self.b.jump(target, Vec::new());
                return Ok(Flow::Stop);
            }
            Opcode::SubroutineReturn => {
                self.subroutine_return(bci)?;
                return Ok(Flow::Stop);
            }
            Opcode::EnterNoSuchMethod => {
                let receiver = if self.function.arity > 0 {
                    self.b.slot_load(0)
                } else {
                    self.null()
                };
                self.push(receiver);
                let selector = self.null();
                self.push(selector);
                let arguments = self.null();
                self.push(arguments);
            }
            Opcode::InvokeEq | Opcode::InvokeLt | Opcode::InvokeLe | Opcode::InvokeGt | Opcode::InvokeGe => {
                return self.smi_compare(instruction);
            }
            Opcode::InvokeAdd | Opcode::InvokeSub => {
                self.smi_arithmetic(instruction)?;
            }
            Opcode::Throw | Opcode::CoroutineChange => {
                self.unsupported(instruction);
                return Ok(Flow::Stop);
            }
            Opcode::MethodEnd => {
                return Err(internal_error(format!(
                    "{}: reached method end at bci {bci}",
                    self.name
                )))
            }
        }
        Ok(Flow::Continue)
    }

    fn target(&self, instruction: &Instruction) -> Result<Block> {
        let target = instruction
            .branch_target()
            .ok_or_else(|| internal_error(format!("{}: branch without target", self.name)))?;
        self.block_at(target as u32)
    }

    fn load_local(&mut self, index: i64, bci: u32) -> Result<()> {
        let slot = self.local(index, bci)?;
        let value = self.b.slot_load(slot);
        self.push(value);
        Ok(())
    }

    fn load_integer(&mut self, value: i64) -> Result<()> {
        let value = self.constant(kiln_core::Value::Smi(value))?;
        self.push(value);
        Ok(())
    }

    fn load_static_init(&mut self, index: i64) {
        let offset = Self::static_offset(index);
        let statics = self.statics();
        let value = self.b.tagged_read(statics, offset);

        let check = self.b.create_block("static_check");
        let initialize = self.b.create_block("static_initialize");
        let join = self.b.create_block("static_join");
        let result = self.b.append_param(join, Ty::Tagged);

        let smi = is_smi(&mut self.b, value);
        self.b.brif(smi, join, vec![value], check, Vec::new());

        self.b.switch_to(check);
        let klass = self.b.tagged_read(value, abi::HEAP_OBJECT_CLASS_OFFSET);
        let format = self.b.tagged_read(klass, abi::CLASS_INSTANCE_FORMAT_OFFSET);
        let format = self.b.smi_to_int(format);
        let kind = self.b.binary_imm(BinOp::And, format, abi::INSTANCE_FORMAT_TYPE_MASK);
        let initializer = self.b.iconst(InstanceType::Initializer.tag());
        let is_initializer = self.b.icmp(Cond::Eq, kind, initializer);
        self.b.brif(is_initializer, initialize, Vec::new(), join, vec![value]);

        self.b.switch_to(initialize);
        let function = self.b.tagged_read(value, abi::INITIALIZER_FUNCTION_OFFSET);
        let code = self.b.tagged_read(function, abi::FUNCTION_CODE_OFFSET);
        let code = self.b.cast(code, Ty::Ptr);
        let initialized = self.b.call(Callee::Indirect(code), vec![self.process]);
        self.b.tagged_write(statics, offset, initialized);
        self.b.jump(join, vec![initialized]);

        self.b.switch_to(join);
        self.push(result);
    }

    /// Calls an allocation service. A retry-after-GC answer collects garbage
    /// and tries once more; any other failure, or a second one, becomes a
    /// failure object and skips `initialize`.
    fn allocate(
        &mut self,
        service: RuntimeFn,
        args: Vec<Value>,
        initialize: impl FnOnce(&mut Self, Value) -> Result<()>,
    ) -> Result<Value> {
        let check = self.b.create_block("allocate_failed");
        let collect = self.b.create_block("allocate_gc");
        let give_up = self.b.create_block("allocate_give_up");
        let failure = self.b.append_param(give_up, Ty::Tagged);
        let success = self.b.create_block("allocated");
        let fresh = self.b.append_param(success, Ty::Tagged);
        let done = self.b.create_block("allocate_join");
        let object = self.b.append_param(done, Ty::Tagged);

        let result = self.b.call(Callee::Runtime(service), args.clone());
        let failed = is_failure(&mut self.b, result);
        self.b.brif(failed, check, Vec::new(), success, vec![result]);

        self.b.switch_to(check);
        let retry = failure_kind_is(&mut self.b, result, abi::FAILURE_RETRY_AFTER_GC);
        self.b.brif(retry, collect, Vec::new(), give_up, vec![result]);

        self.b.switch_to(collect);
        self.b.call_void(RuntimeFn::CollectGarbage, vec![self.process]);
        let again = self.b.call(Callee::Runtime(service), args);
        let failed = is_failure(&mut self.b, again);
        self.b.brif(failed, give_up, vec![again], success, vec![again]);

        self.b.switch_to(give_up);
        let error = self
            .b
            .call(Callee::Runtime(RuntimeFn::ObjectFromFailure), vec![self.process, failure]);
        self.b.jump(done, vec![error]);

        self.b.switch_to(success);
        initialize(self, fresh)?;
        self.b.jump(done, vec![fresh]);

        self.b.switch_to(done);
        Ok(object)
    }

    fn invoke_native(&mut self, arity: u32, native: u32, bci: u32) -> Result<()> {
        if native as usize >= self.program.natives.len() {
            return Err(native_error(
                E_BYTECODE,
                format!("{}: unknown native {native} at bci {bci}", self.name),
            ));
        }
        if arity > self.function.arity {
            return Err(native_error(
                E_BYTECODE,
                format!(
                    "{}: native {native} takes {arity} arguments but the function has {}",
                    self.name, self.function.arity
                ),
            ));
        }
        let buffer = self.b.stack_buffer(arity.max(1));
        for i in 0..arity {
            let arg = self.b.slot_load(arity - i - 1);
            self.b.store(buffer, (i as i32) * abi::WORD_SIZE, arg, Width::Word);
        }
        // Natives index their arguments backwards from the last element.
        let base = self.b.cast(buffer, Ty::Word);
        let last = self.b.binary_imm(BinOp::Add, base, (i64::from(arity) - 1) * i64::from(abi::WORD_SIZE));
        let last = self.b.cast(last, Ty::Ptr);
        let result = self.b.call(Callee::Native(native), vec![self.process, last]);

        let failure = self.b.create_block("native_failure");
        let success = self.b.create_block("native_success");
        let failed = is_failure(&mut self.b, result);
        self.b.brif(failed, failure, Vec::new(), success, Vec::new());

        self.b.switch_to(success);
        self.b.ret(result);

        self.b.switch_to(failure);
        let error = self
            .b
            .call(Callee::Runtime(RuntimeFn::ObjectFromFailure), vec![self.process, result]);
        self.push(error);
        Ok(())
    }

    fn subroutine_return(&mut self, bci: u32) -> Result<()> {
        let marker = self.pop()?;
        let continuations: Vec<u32> = self.layout.continuations.iter().copied().collect();
        let Some((&last, rest)) = continuations.split_last() else {
            return Err(native_error(
                E_BYTECODE,
                format!("{}: subroutine return at bci {bci} without any subroutine call", self.name),
            ));
        };
        for &continuation in rest {
            let target = self.block_at(continuation)?;
            let next = self.b.create_block("subroutine_return");
            let expected = self.b.tagged_const(abi::smi(i64::from(continuation)) as i64);
            let cond = self.b.icmp(Cond::Eq, marker, expected);
            self.b.brif(cond, target, Vec::new(), next, Vec::new());
            self.b.switch_to(next);
        }
        let target = self.block_at(last)?;
        self.b.jump(target, Vec::new());
        Ok(())
    }

    fn smi_arithmetic(&mut self, instruction: &Instruction) -> Result<()> {
        let selector = Selector::from_raw(instruction.operand(0) as u32);
        let op = if instruction.opcode == Opcode::InvokeAdd {
            BinOp::Add
        } else {
            BinOp::Sub
        };
        let argument = self.pop()?;
        let receiver = self.pop()?;

        let fast = self.b.create_block("smis");
        let slow = self.b.create_block("smi_slow");
        let join = self.b.create_block("smi_join");
        let result = self.b.append_param(join, Ty::Tagged);

        let both = self.both_smis(receiver, argument);
        self.b.brif(both, fast, Vec::new(), slow, Vec::new());

        self.b.switch_to(fast);
        let lhs = self.b.cast(receiver, Ty::Word);
        let rhs = self.b.cast(argument, Ty::Word);
        let overflow = self.b.overflows(op, lhs, rhs);
        let value = self.b.binary(op, lhs, rhs);
        let value = self.b.cast(value, Ty::Tagged);
        self.b.brif(overflow, slow, Vec::new(), join, vec![value]);

        self.b.switch_to(slow);
        let slow_case = self.ctx.smi_slow_case(selector);
        let value = self
            .b
            .call(Callee::Function(slow_case), vec![self.process, receiver, argument]);
        self.b.jump(join, vec![value]);

        self.b.switch_to(join);
        self.push(result);
        Ok(())
    }

    fn both_smis(&mut self, lhs: Value, rhs: Value) -> Value {
        let lhs = self.b.cast(lhs, Ty::Word);
        let rhs = self.b.cast(rhs, Ty::Word);
        let tags = self.b.binary(BinOp::Or, lhs, rhs);
        let tag = self.b.binary_imm(BinOp::And, tags, abi::SMI_TAG_MASK as i64);
        let zero = self.b.iconst(0);
        self.b.icmp(Cond::Eq, tag, zero)
    }

    /// Smi comparison; fused with a directly following forward conditional
    /// branch when no other control flow enters between the two.
    fn smi_compare(&mut self, instruction: &Instruction) -> Result<Flow> {
        let selector = Selector::from_raw(instruction.operand(0) as u32);
        let cond = match instruction.opcode {
            Opcode::InvokeEq => Cond::Eq,
            Opcode::InvokeLt => Cond::Slt,
            Opcode::InvokeLe => Cond::Sle,
            Opcode::InvokeGt => Cond::Sgt,
            _ => Cond::Sge,
        };
        let fused = self.fused_branch(instruction)?;

        let argument = self.pop()?;
        let receiver = self.pop()?;
        let fast = self.b.create_block("smis");
        let slow = self.b.create_block("smi_slow");
        let both = self.both_smis(receiver, argument);
        self.b.brif(both, fast, Vec::new(), slow, Vec::new());

        self.b.switch_to(fast);
        let compared = self.b.icmp(cond, receiver, argument);
        let slow_case = self.ctx.smi_slow_case(selector);
        match fused {
            Some((if_true, if_false)) => {
                self.b.brif(compared, if_true, Vec::new(), if_false, Vec::new());
                self.b.switch_to(slow);
                let value = self
                    .b
                    .call(Callee::Function(slow_case), vec![self.process, receiver, argument]);
                let taken = self.is_true(value);
                self.b.brif(taken, if_true, Vec::new(), if_false, Vec::new());
                Ok(Flow::Fused)
            }
            None => {
                let join = self.b.create_block("compare_join");
                let result = self.b.append_param(join, Ty::Tagged);
                let value = self.boolean(compared);
                self.b.jump(join, vec![value]);
                self.b.switch_to(slow);
                let value = self
                    .b
                    .call(Callee::Function(slow_case), vec![self.process, receiver, argument]);
                self.b.jump(join, vec![value]);
                self.b.switch_to(join);
                self.push(result);
                Ok(Flow::Continue)
            }
        }
    }

    /// Targets (if true, if false) of a branch that can absorb the comparison
    /// at `instruction`.
    fn fused_branch(&self, instruction: &Instruction) -> Result<Option<(Block, Block)>> {
        let next_bci = instruction.next_bci();
        if self.layout.is_label(next_bci) {
            return Ok(None);
        }
        let next = match Instruction::decode(&self.function.bytecodes, next_bci) {
            Ok(next) => next,
            Err(_) => return Ok(None),
        };
        let (Opcode::BranchIfTrueWide | Opcode::BranchIfFalseWide) = next.opcode else {
            return Ok(None);
        };
        let target = self.target(&next)?;
        let fall_through = self.block_at(next.next_bci())?;
        Ok(Some(if next.opcode == Opcode::BranchIfTrueWide {
            (target, fall_through)
        } else {
            (fall_through, target)
        }))
    }

    fn unsupported(&mut self, instruction: &Instruction) {
        log::error!(
            "{}: unsupported bytecode '{}' at bci {}",
            self.name,
            instruction,
            instruction.bci
        );
        let text = format!("Unsupported bytecode: {instruction}. Exiting due to fatal error.");
        let message = self.ctx.message(text);
        let message = self.b.message(message);
        self.b.call_void(RuntimeFn::Puts, vec![message]);
        let status = self.b.iconst(1);
        self.b.call_void(RuntimeFn::Exit, vec![status]);
        let null = self.null();
        self.b.ret(null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::Materializer;
    use crate::ir::{InstKind, Terminator, View};
    use kiln_core::builder::{Assembler, ProgramBuilder};

    fn emit(program: &Program) -> (Function, EmitContext<'_>) {
        let mut materializer = Materializer::new(program);
        let index = materializer.function(program.roots.entry).unwrap();
        materializer.next_pending();
        let mut ctx = EmitContext::new(materializer).unwrap();
        let body = emit_function(&mut ctx, index, program.roots.entry).unwrap();
        (body, ctx)
    }

    fn count(function: &Function, pred: impl Fn(&InstKind) -> bool) -> usize {
        function
            .insts_in_layout()
            .filter(|&(_, inst)| pred(&function.inst(inst).kind))
            .count()
    }

    fn single(build: impl FnOnce(&mut ProgramBuilder, &mut Assembler)) -> Program {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        build(&mut builder, &mut asm);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        builder.build(main).unwrap()
    }

    #[test]
    fn pre_entry_block_stores_arguments_and_jumps_to_bci_zero() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.load_local(4).emit(Opcode::Return);
        let main = builder.add_function("main", 2, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let (body, _) = emit(&program);

        let entry = body.entry().unwrap();
        assert_eq!(body.block(entry).params.len(), 3);
        assert_eq!(body.slots, 2 + FRAME_AUX_SLOTS + 1);
        let stores = body.block(entry).insts.iter().filter(|&&inst| {
            matches!(body.inst(inst).kind, InstKind::SlotStore { .. })
        });
        assert_eq!(stores.count(), 2);
        assert!(matches!(body.block(entry).terminator, Some(Terminator::Jump { .. })));
        // local 4 at height 0 skips the three auxiliary slots and lands on slot 0.
        assert!(body
            .insts_in_layout()
            .any(|(_, inst)| body.inst(inst).kind == InstKind::SlotLoad(0)));
    }

    #[test]
    fn reading_an_auxiliary_slot_is_rejected() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.load_local(1).emit(Opcode::Return);
        let main = builder.add_function("main", 1, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let mut materializer = Materializer::new(&program);
        let index = materializer.function(main).unwrap();
        let mut ctx = EmitContext::new(materializer).unwrap();
        let err = emit_function(&mut ctx, index, main).unwrap_err();
        assert_eq!(err.code, "E0502");
    }

    #[test]
    fn smi_add_checks_tags_and_overflow_with_a_memoized_slow_case() {
        let program = single(|b, asm| {
            let add = b.selector(1);
            asm.load_literal(3).load_literal(4).invoke(Opcode::InvokeAdd, add);
            asm.load_literal(5).invoke(Opcode::InvokeAdd, add).emit(Opcode::Return);
        });
        let (body, ctx) = emit(&program);
        assert_eq!(count(&body, |kind| matches!(kind, InstKind::Overflows { .. })), 2);
        assert_eq!(ctx.bodies.len(), 1);
        assert!(ctx.bodies[0].1.name.starts_with("Smi_"));
        let slow_calls = count(&body, |kind| {
            matches!(kind, InstKind::Call { callee: Callee::Function(_), .. })
        });
        assert_eq!(slow_calls, 2);
    }

    #[test]
    fn comparison_fuses_with_the_following_branch() {
        let program = single(|b, asm| {
            let lt = b.selector(1);
            let other = asm.label();
            asm.load_literal(1).load_literal(2).invoke(Opcode::InvokeLt, lt);
            asm.branch(Opcode::BranchIfFalseWide, other).unwrap();
            asm.load_literal(10).emit(Opcode::Return);
            asm.bind(other);
            asm.load_literal(20).emit(Opcode::Return);
        });
        let (body, _) = emit(&program);
        // No boolean is materialized for the fast path.
        assert_eq!(count(&body, |kind| matches!(kind, InstKind::Select { .. })), 0);
    }

    #[test]
    fn comparison_without_branch_selects_a_boolean() {
        let program = single(|b, asm| {
            let eq = b.selector(1);
            asm.load_literal(1).load_literal(2).invoke(Opcode::InvokeEq, eq).emit(Opcode::Return);
        });
        let (body, _) = emit(&program);
        assert_eq!(count(&body, |kind| matches!(kind, InstKind::Select { .. })), 1);
    }

    #[test]
    fn method_invocation_dispatches_through_the_table() {
        let program = single(|b, asm| {
            let name = b.selector(0);
            asm.load_literal(1).invoke(Opcode::InvokeMethod, name).emit(Opcode::Return);
        });
        let (body, _) = emit(&program);
        assert_eq!(
            count(&body, |kind| matches!(kind, InstKind::Call { callee: Callee::Indirect(_), .. })),
            1
        );
        assert_eq!(
            count(&body, |kind| matches!(kind, InstKind::Object { view: View::Local, .. })),
            1
        );
    }

    #[test]
    fn allocation_retries_after_collecting_garbage() {
        let mut builder = ProgramBuilder::new();
        let pair = builder.add_class("Pair", None, 2);
        let mut asm = Assembler::new();
        asm.load_literal(1).load_literal(2);
        asm.emit_i(Opcode::Allocate, 0).emit(Opcode::Return);
        let literals = vec![kiln_core::Value::Object(pair)];
        let main = builder.add_function("main", 0, asm.finish().unwrap(), literals);
        let program = builder.build(main).unwrap();

        let (body, _) = emit(&program);
        let runtime_calls = |service: RuntimeFn| {
            count(&body, |kind| matches!(
                kind,
                InstKind::Call { callee: Callee::Runtime(called), .. } if *called == service
            ))
        };
        assert_eq!(runtime_calls(RuntimeFn::CollectGarbage), 1);
        // One attempt, one retry after the collection, no loop back.
        assert_eq!(runtime_calls(RuntimeFn::Allocate), 2);
        assert_eq!(runtime_calls(RuntimeFn::ObjectFromFailure), 1);
        let gc_block = body
            .layout
            .iter()
            .copied()
            .find(|&block| body.block(block).name == "allocate_gc")
            .unwrap();
        let into_gc: Vec<&str> = body
            .layout
            .iter()
            .filter(|&&block| {
                body.block(block)
                    .terminator
                    .as_ref()
                    .is_some_and(|term| term.successors().iter().any(|(succ, _)| *succ == gc_block))
            })
            .map(|&block| body.block(block).name.as_str())
            .collect();
        assert_eq!(into_gc, vec!["allocate_failed"]);
        let writes: Vec<i32> = body
            .insts_in_layout()
            .filter_map(|(_, inst)| match body.inst(inst).kind {
                InstKind::TaggedWrite { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![24, 16]);
    }

    #[test]
    fn unsupported_bytecode_exits_at_run_time() {
        let program = single(|_, asm| {
            asm.emit(Opcode::LoadLiteralNull).emit(Opcode::Throw).emit(Opcode::Return);
        });
        let (body, ctx) = emit(&program);
        assert_eq!(ctx.messages.len(), 1);
        assert!(ctx.messages[0].contains("throw"), "{}", ctx.messages[0]);
        assert_eq!(
            count(&body, |kind| matches!(kind, InstKind::Call { callee: Callee::Runtime(RuntimeFn::Exit), .. })),
            1
        );
    }

    #[test]
    fn native_failure_pushes_a_failure_object() {
        let mut builder = ProgramBuilder::new();
        let native = builder.add_native("SmiAdd");
        let mut asm = Assembler::new();
        asm.emit_bb(Opcode::InvokeNative, 2, native).emit(Opcode::Return);
        let main = builder.add_function("main", 2, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let (body, _) = emit(&program);
        assert_eq!(count(&body, |kind| matches!(kind, InstKind::StackBuffer { words: 2 })), 1);
        assert_eq!(
            count(&body, |kind| matches!(
                kind,
                InstKind::Call { callee: Callee::Runtime(RuntimeFn::ObjectFromFailure), .. }
            )),
            1
        );
        let returns = body
            .layout
            .iter()
            .filter(|&&block| matches!(body.block(block).terminator, Some(Terminator::Return(_))))
            .count();
        assert_eq!(returns, 2);
    }

    #[test]
    fn native_call_reads_no_more_than_the_function_arguments() {
        let mut builder = ProgramBuilder::new();
        let native = builder.add_native("SmiAdd");
        let mut asm = Assembler::new();
        asm.load_literal(1).load_literal(2);
        asm.emit_bb(Opcode::InvokeNative, 2, native).emit(Opcode::Return);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let mut materializer = Materializer::new(&program);
        let index = materializer.function(main).unwrap();
        let mut ctx = EmitContext::new(materializer).unwrap();
        let err = emit_function(&mut ctx, index, main).unwrap_err();
        assert_eq!(err.code, "E0502");
    }

    #[test]
    fn process_yield_exits_with_status_zero() {
        let program = single(|_, asm| {
            asm.emit(Opcode::ProcessYield).emit(Opcode::ReturnNull);
        });
        let (body, ctx) = emit(&program);
        assert!(ctx.messages.is_empty());
        let statuses: Vec<Value> = body
            .insts_in_layout()
            .filter_map(|(_, inst)| match &body.inst(inst).kind {
                InstKind::Call {
                    callee: Callee::Runtime(RuntimeFn::Exit),
                    args,
                } => Some(args[0]),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 1);
        assert!(body
            .insts_in_layout()
            .any(|(_, inst)| body.inst(inst).result == Some(statuses[0])
                && body.inst(inst).kind == InstKind::Iconst(0)));
    }
}
