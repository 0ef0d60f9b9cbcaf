//! Translation of a lowered backend module into a Cranelift module.
//!
//! Works against any `cranelift_module::Module`, so the same code feeds the
//! object writer and the in-process JIT.

use crate::constants::{Cell, Image};
use crate::error::{codegen_error, internal_error, Result};
use crate::ir::{self, BinOp, Callee, Cond, FuncIndex, InstKind, RuntimeFn, Stage, Terminator, Ty, Width};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    types, AbiParam, Function as ClifFunction, GlobalValue, InstBuilder, MemFlags, Signature,
    StackSlotData, StackSlotKind, Value,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use std::collections::{HashMap, HashSet};

/// Start of the static image; tagged references are offsets from here.
pub const PROGRAM_START_SYMBOL: &str = "program_start";
pub const PROGRAM_SIZE_SYMBOL: &str = "program_size";
pub const PROGRAM_ENTRY_SYMBOL: &str = "program_entry";
/// The root table: one tagged word per root, ending with the entry function.
pub const PROGRAM_INFO_SYMBOL: &str = "program_info_block";

/// Cranelift ids of everything `define_module` declared.
#[derive(Debug, Clone)]
pub struct Declared {
    pub functions: HashMap<FuncIndex, FuncId>,
    pub entry: FuncId,
    pub image: DataId,
    pub size: DataId,
    pub info: DataId,
    /// Cranelift IR of every function, when requested.
    pub text: Option<String>,
}

struct Refs {
    functions: HashMap<FuncIndex, FuncId>,
    natives: Vec<FuncId>,
    runtime: HashMap<RuntimeFn, FuncId>,
    image: DataId,
    messages: Vec<DataId>,
}

pub fn define_module<M: Module>(target: &mut M, module: &ir::Module) -> Result<Declared> {
    define(target, module, false)
}

/// Defines the module and also renders the Cranelift IR of every function.
pub fn define_module_with_text<M: Module>(target: &mut M, module: &ir::Module) -> Result<Declared> {
    define(target, module, true)
}

fn tagged_signature<M: Module>(target: &M, arity: u32) -> Signature {
    let mut sig = target.make_signature();
    sig.params.push(AbiParam::new(types::I64));
    for _ in 0..arity {
        sig.params.push(AbiParam::new(types::I64));
    }
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

fn clif_type(ty: Ty) -> types::Type {
    match ty {
        Ty::Bool => types::I8,
        Ty::Tagged | Ty::Ptr | Ty::Word => types::I64,
    }
}

fn declare_import<M: Module>(target: &mut M, name: &str, params: &[Ty], returns: Option<Ty>) -> Result<FuncId> {
    let mut sig = target.make_signature();
    for &param in params {
        sig.params.push(AbiParam::new(clif_type(param)));
    }
    if let Some(ty) = returns {
        sig.returns.push(AbiParam::new(clif_type(ty)));
    }
    target
        .declare_function(name, Linkage::Import, &sig)
        .map_err(|err| codegen_error(format!("cannot declare import '{name}': {err}")))
}

fn define(target: &mut impl Module, module: &ir::Module, with_text: bool) -> Result<Declared> {
    if module.stage != Stage::Lowered {
        return Err(internal_error("only lowered modules can be translated"));
    }
    let mut functions = HashMap::new();
    for (index, decl) in module.functions.iter() {
        let (symbol, linkage) = if index == module.entry {
            (PROGRAM_ENTRY_SYMBOL, Linkage::Export)
        } else {
            (decl.symbol.as_str(), Linkage::Local)
        };
        let sig = tagged_signature(target, decl.arity);
        let id = target
            .declare_function(symbol, linkage, &sig)
            .map_err(|err| codegen_error(format!("cannot declare '{symbol}': {err}")))?;
        functions.insert(index, id);
    }
    let natives = module
        .natives
        .iter()
        .map(|native| declare_import(target, &native.symbol, &[Ty::Ptr, Ty::Ptr], Some(Ty::Tagged)))
        .collect::<Result<Vec<_>>>()?;
    let mut runtime = HashMap::new();
    for service in RuntimeFn::ALL {
        let id = declare_import(target, service.symbol(), service.params(), service.returns())?;
        runtime.insert(service, id);
    }

    let image = define_image(target, &module.image, &functions)?;
    let size = define_words(target, PROGRAM_SIZE_SYMBOL, &[module.image.size as i64])?;
    let info = define_roots(target, module, image, &functions)?;
    let messages = module
        .messages
        .iter()
        .enumerate()
        .map(|(index, text)| define_message(target, index, text))
        .collect::<Result<Vec<_>>>()?;

    let refs = Refs {
        functions,
        natives,
        runtime,
        image,
        messages,
    };
    let mut text = with_text.then(String::new);
    let mut ctx = target.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();
    for (index, body) in module.bodies() {
        ctx.func.signature = tagged_signature(target, body.arity);
        translate_function(target, &refs, &module.image, body, &mut ctx.func, &mut builder_ctx)?;
        if let Some(text) = text.as_mut() {
            text.push_str(&format!("; {}\n{}\n", body.name, ctx.func.display()));
        }
        let id = refs.functions[&index];
        target
            .define_function(id, &mut ctx)
            .map_err(|err| codegen_error(format!("cannot define '{}': {err:?}", body.name)))?;
        target.clear_context(&mut ctx);
    }
    let entry = refs.functions[&module.entry];
    log::debug!(
        "defined {} functions, {} natives, image of {} bytes",
        refs.functions.len(),
        refs.natives.len(),
        module.image.size
    );
    Ok(Declared {
        functions: refs.functions,
        entry,
        image,
        size,
        info,
        text,
    })
}

fn define_image<M: Module>(target: &mut M, image: &Image, functions: &HashMap<FuncIndex, FuncId>) -> Result<DataId> {
    let id = target
        .declare_data(PROGRAM_START_SYMBOL, Linkage::Export, true, false)
        .map_err(|err| codegen_error(format!("cannot declare the image: {err}")))?;
    let mut desc = DataDescription::new();
    desc.define(image.bytes().into_boxed_slice());
    desc.set_align(8);
    let this = target.declare_data_in_data(id, &mut desc);
    for (offset, cell) in image.relocations() {
        write_reference(target, &mut desc, image, this, functions, offset, cell)?;
    }
    target
        .define_data(id, &desc)
        .map_err(|err| codegen_error(format!("cannot define the image: {err}")))?;
    Ok(id)
}

fn write_reference<M: Module>(
    target: &mut M,
    desc: &mut DataDescription,
    image: &Image,
    image_ref: GlobalValue,
    functions: &HashMap<FuncIndex, FuncId>,
    offset: u64,
    cell: &Cell,
) -> Result<()> {
    match cell {
        Cell::Object(object) => {
            desc.write_data_addr(offset as u32, image_ref, image.tagged_offset(*object) as i64);
        }
        Cell::Code(index) => {
            let id = functions
                .get(index)
                .ok_or_else(|| internal_error(format!("image references undeclared {index}")))?;
            let func_ref = target.declare_func_in_data(*id, desc);
            desc.write_function_addr(offset as u32, func_ref);
        }
        Cell::Word(_) | Cell::Bytes(_) => {}
    }
    Ok(())
}

fn define_words<M: Module>(target: &mut M, name: &str, words: &[i64]) -> Result<DataId> {
    let id = target
        .declare_data(name, Linkage::Export, false, false)
        .map_err(|err| codegen_error(format!("cannot declare '{name}': {err}")))?;
    let mut desc = DataDescription::new();
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    desc.define(bytes.into_boxed_slice());
    desc.set_align(8);
    target
        .define_data(id, &desc)
        .map_err(|err| codegen_error(format!("cannot define '{name}': {err}")))?;
    Ok(id)
}

fn define_roots<M: Module>(
    target: &mut M,
    module: &ir::Module,
    image: DataId,
    functions: &HashMap<FuncIndex, FuncId>,
) -> Result<DataId> {
    let id = target
        .declare_data(PROGRAM_INFO_SYMBOL, Linkage::Export, false, false)
        .map_err(|err| codegen_error(format!("cannot declare the root table: {err}")))?;
    let mut desc = DataDescription::new();
    let mut bytes = vec![0u8; module.roots.len() * 8];
    for (index, cell) in module.roots.iter().enumerate() {
        if let Cell::Word(word) = cell {
            bytes[index * 8..index * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
    }
    desc.define(bytes.into_boxed_slice());
    desc.set_align(8);
    let image_ref = target.declare_data_in_data(image, &mut desc);
    for (index, cell) in module.roots.iter().enumerate() {
        write_reference(target, &mut desc, &module.image, image_ref, functions, index as u64 * 8, cell)?;
    }
    target
        .define_data(id, &desc)
        .map_err(|err| codegen_error(format!("cannot define the root table: {err}")))?;
    Ok(id)
}

fn define_message<M: Module>(target: &mut M, index: usize, text: &str) -> Result<DataId> {
    let name = format!("kiln_message_{index}");
    let id = target
        .declare_data(&name, Linkage::Local, false, false)
        .map_err(|err| codegen_error(format!("cannot declare '{name}': {err}")))?;
    let mut desc = DataDescription::new();
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    desc.define(bytes.into_boxed_slice());
    target
        .define_data(id, &desc)
        .map_err(|err| codegen_error(format!("cannot define '{name}': {err}")))?;
    Ok(id)
}

/// Blocks reachable from the entry, in reverse postorder, so every value is
/// translated before its uses.
fn reverse_postorder(func: &ir::Function) -> Vec<ir::Block> {
    let Some(entry) = func.entry() else {
        return Vec::new();
    };
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
        if let Some(terminator) = &func.block(block).terminator {
            for (succ, _) in terminator.successors().into_iter().rev() {
                if !visited.contains(&succ) {
                    stack.push((succ, false));
                }
            }
        }
    }
    order.reverse();
    order
}

fn translate_function<M: Module>(
    target: &mut M,
    refs: &Refs,
    layout: &Image,
    func: &ir::Function,
    clif: &mut ClifFunction,
    builder_ctx: &mut FunctionBuilderContext,
) -> Result<()> {
    let mut builder = FunctionBuilder::new(clif, builder_ctx);
    for slot in 0..func.slots {
        builder.declare_var(Variable::from_u32(slot), types::I64);
    }
    let order = reverse_postorder(func);
    let mut blocks = HashMap::new();
    for &block in &order {
        let clif_block = builder.create_block();
        for &param in &func.block(block).params {
            builder.append_block_param(clif_block, clif_type(func.value_ty(param)));
        }
        blocks.insert(block, clif_block);
    }
    let mut translator = Translator {
        target,
        refs,
        layout,
        func,
        builder,
        values: HashMap::new(),
        blocks,
        image: None,
    };
    for &block in &order {
        translator.block(block)?;
    }
    translator.builder.seal_all_blocks();
    translator.builder.finalize();
    Ok(())
}

struct Translator<'a, 'b, M: Module> {
    target: &'a mut M,
    refs: &'a Refs,
    layout: &'a Image,
    func: &'a ir::Function,
    builder: FunctionBuilder<'b>,
    values: HashMap<ir::Value, Value>,
    blocks: HashMap<ir::Block, cranelift_codegen::ir::Block>,
    image: Option<GlobalValue>,
}

impl<M: Module> Translator<'_, '_, M> {
    fn value(&self, value: ir::Value) -> Result<Value> {
        self.values.get(&value).copied().ok_or_else(|| {
            internal_error(format!("{}: {value} used before it was translated", self.func.name))
        })
    }

    fn values(&self, values: &[ir::Value]) -> Result<Vec<Value>> {
        values.iter().map(|&value| self.value(value)).collect()
    }

    fn target_block(&self, block: ir::Block) -> Result<cranelift_codegen::ir::Block> {
        self.blocks
            .get(&block)
            .copied()
            .ok_or_else(|| internal_error(format!("{}: {block} was not translated", self.func.name)))
    }

    fn image_base(&mut self) -> Value {
        let gv = match self.image {
            Some(gv) => gv,
            None => {
                let gv = self.target.declare_data_in_func(self.refs.image, self.builder.func);
                self.image = Some(gv);
                gv
            }
        };
        self.builder.ins().global_value(types::I64, gv)
    }

    fn block(&mut self, block: ir::Block) -> Result<()> {
        let func = self.func;
        let clif_block = self.target_block(block)?;
        self.builder.switch_to_block(clif_block);
        let data = func.block(block);
        let params = self.builder.block_params(clif_block).to_vec();
        for (&param, value) in data.params.iter().zip(params) {
            self.values.insert(param, value);
        }
        for &inst in &data.insts {
            let inst = func.inst(inst);
            let result = self.inst(&inst.kind)?;
            match (inst.result, result) {
                (Some(ir_value), Some(value)) => {
                    self.values.insert(ir_value, value);
                }
                (None, _) => {}
                (Some(ir_value), None) => {
                    return Err(internal_error(format!(
                        "{}: {ir_value} has no translated definition",
                        self.func.name
                    )))
                }
            }
        }
        let terminator = data
            .terminator
            .as_ref()
            .ok_or_else(|| internal_error(format!("{}: {block} has no terminator", self.func.name)))?;
        match terminator {
            Terminator::Jump { dest, args } => {
                let dest = self.target_block(*dest)?;
                let args = self.values(args)?;
                self.builder.ins().jump(dest, &args);
            }
            Terminator::Brif {
                cond,
                then_dest,
                then_args,
                else_dest,
                else_args,
            } => {
                let cond = self.value(*cond)?;
                let then_dest = self.target_block(*then_dest)?;
                let else_dest = self.target_block(*else_dest)?;
                let then_args = self.values(then_args)?;
                let else_args = self.values(else_args)?;
                self.builder
                    .ins()
                    .brif(cond, then_dest, &then_args, else_dest, &else_args);
            }
            Terminator::Return(value) => {
                let value = self.value(*value)?;
                self.builder.ins().return_(&[value]);
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ins = self.builder.ins();
        match op {
            BinOp::Add => ins.iadd(lhs, rhs),
            BinOp::Sub => ins.isub(lhs, rhs),
            BinOp::Mul => ins.imul(lhs, rhs),
            BinOp::And => ins.band(lhs, rhs),
            BinOp::Or => ins.bor(lhs, rhs),
            BinOp::Xor => ins.bxor(lhs, rhs),
            BinOp::Shl => ins.ishl(lhs, rhs),
            BinOp::Sshr => ins.sshr(lhs, rhs),
            BinOp::Ushr => ins.ushr(lhs, rhs),
        }
    }

    /// Signed overflow of `lhs op rhs`, as an `i8` flag.
    fn overflows(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
        let flag = match op {
            BinOp::Add => {
                let sum = self.builder.ins().iadd(lhs, rhs);
                let a = self.builder.ins().bxor(lhs, sum);
                let b = self.builder.ins().bxor(rhs, sum);
                let both = self.builder.ins().band(a, b);
                self.builder.ins().icmp_imm(IntCC::SignedLessThan, both, 0)
            }
            BinOp::Sub => {
                let difference = self.builder.ins().isub(lhs, rhs);
                let a = self.builder.ins().bxor(lhs, rhs);
                let b = self.builder.ins().bxor(lhs, difference);
                let both = self.builder.ins().band(a, b);
                self.builder.ins().icmp_imm(IntCC::SignedLessThan, both, 0)
            }
            BinOp::Mul => {
                let high = self.builder.ins().smulhi(lhs, rhs);
                let low = self.builder.ins().imul(lhs, rhs);
                let sign = self.builder.ins().sshr_imm(low, 63);
                self.builder.ins().icmp(IntCC::NotEqual, high, sign)
            }
            other => {
                return Err(internal_error(format!(
                    "{}: no overflow check for {other:?}",
                    self.func.name
                )))
            }
        };
        Ok(flag)
    }

    fn inst(&mut self, kind: &InstKind) -> Result<Option<Value>> {
        let value = match kind {
            InstKind::Iconst(value) | InstKind::TaggedConst(value) => self.builder.ins().iconst(types::I64, *value),
            InstKind::Bconst(flag) => self.builder.ins().iconst(types::I8, i64::from(*flag)),
            // Both views of a static object share its tagged address.
            InstKind::Object { object, .. } => {
                self.check_object(*object)?;
                let base = self.image_base();
                self.builder
                    .ins()
                    .iadd_imm(base, self.layout.tagged_offset(*object) as i64)
            }
            InstKind::Message(index) => {
                let id = self.refs.messages.get(*index as usize).copied().ok_or_else(|| {
                    internal_error(format!("{}: unknown message {index}", self.func.name))
                })?;
                let gv = self.target.declare_data_in_func(id, self.builder.func);
                self.builder.ins().global_value(types::I64, gv)
            }
            InstKind::Cast { arg, to } => {
                let value = self.value(*arg)?;
                match (self.func.value_ty(*arg), to) {
                    (Ty::Bool, Ty::Bool) => value,
                    (Ty::Bool, _) => self.builder.ins().uextend(types::I64, value),
                    (_, Ty::Bool) => {
                        return Err(internal_error(format!("{}: cast to bool", self.func.name)))
                    }
                    _ => value,
                }
            }
            InstKind::Binary { op, lhs, rhs } => {
                let (lhs, rhs) = (self.value(*lhs)?, self.value(*rhs)?);
                self.binary(*op, lhs, rhs)
            }
            InstKind::BinaryImm { op, arg, imm } => {
                let arg = self.value(*arg)?;
                let ins = self.builder.ins();
                match op {
                    BinOp::Add => ins.iadd_imm(arg, *imm),
                    BinOp::Mul => ins.imul_imm(arg, *imm),
                    BinOp::And => ins.band_imm(arg, *imm),
                    BinOp::Or => ins.bor_imm(arg, *imm),
                    BinOp::Xor => ins.bxor_imm(arg, *imm),
                    BinOp::Shl => ins.ishl_imm(arg, *imm),
                    BinOp::Sshr => ins.sshr_imm(arg, *imm),
                    BinOp::Ushr => ins.ushr_imm(arg, *imm),
                    BinOp::Sub => ins.iadd_imm(arg, imm.wrapping_neg()),
                }
            }
            InstKind::Icmp { cond, lhs, rhs } => {
                let (lhs, rhs) = (self.value(*lhs)?, self.value(*rhs)?);
                let cc = match cond {
                    Cond::Eq => IntCC::Equal,
                    Cond::Ne => IntCC::NotEqual,
                    Cond::Slt => IntCC::SignedLessThan,
                    Cond::Sle => IntCC::SignedLessThanOrEqual,
                    Cond::Sgt => IntCC::SignedGreaterThan,
                    Cond::Sge => IntCC::SignedGreaterThanOrEqual,
                    Cond::Ult => IntCC::UnsignedLessThan,
                };
                self.builder.ins().icmp(cc, lhs, rhs)
            }
            InstKind::Overflows { op, lhs, rhs } => {
                let (lhs, rhs) = (self.value(*lhs)?, self.value(*rhs)?);
                self.overflows(*op, lhs, rhs)?
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                let cond = self.value(*cond)?;
                let (if_true, if_false) = (self.value(*if_true)?, self.value(*if_false)?);
                self.builder.ins().select(cond, if_true, if_false)
            }
            InstKind::SlotLoad(slot) => self.builder.use_var(Variable::from_u32(*slot)),
            InstKind::SlotStore { slot, value } => {
                let value = self.value(*value)?;
                self.builder.def_var(Variable::from_u32(*slot), value);
                return Ok(None);
            }
            InstKind::StackBuffer { words } => {
                let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    words * 8,
                    3,
                ));
                self.builder.ins().stack_addr(types::I64, slot, 0)
            }
            InstKind::Load { addr, offset, ty } => {
                let addr = self.value(*addr)?;
                self.builder
                    .ins()
                    .load(clif_type(*ty), MemFlags::trusted(), addr, *offset)
            }
            InstKind::Store {
                addr,
                offset,
                value,
                width,
            } => {
                let addr = self.value(*addr)?;
                let value = self.value(*value)?;
                match width {
                    Width::Word => self.builder.ins().store(MemFlags::trusted(), value, addr, *offset),
                    Width::Byte => self.builder.ins().istore8(MemFlags::trusted(), value, addr, *offset),
                };
                return Ok(None);
            }
            InstKind::Call { callee, args } => return self.call(callee, args),
            InstKind::TaggedRead { .. }
            | InstKind::TaggedWrite { .. }
            | InstKind::SmiToInt(_)
            | InstKind::IntToSmi(_) => {
                return Err(internal_error(format!(
                    "{}: abstract operation reached code generation",
                    self.func.name
                )))
            }
        };
        Ok(Some(value))
    }

    fn check_object(&self, object: ir::ConstId) -> Result<()> {
        match self.layout.objects.get(object) {
            Some(_) => Ok(()),
            None => Err(internal_error(format!("{}: unknown static {object}", self.func.name))),
        }
    }

    fn call(&mut self, callee: &Callee, args: &[ir::Value]) -> Result<Option<Value>> {
        let args = self.values(args)?;
        let call = match callee {
            Callee::Function(index) => {
                let id = self.refs.functions.get(index).copied().ok_or_else(|| {
                    internal_error(format!("{}: call to undeclared {index}", self.func.name))
                })?;
                let func_ref = self.target.declare_func_in_func(id, self.builder.func);
                self.builder.ins().call(func_ref, &args)
            }
            Callee::Native(index) => {
                let id = self.refs.natives.get(*index as usize).copied().ok_or_else(|| {
                    internal_error(format!("{}: call to undeclared native {index}", self.func.name))
                })?;
                let func_ref = self.target.declare_func_in_func(id, self.builder.func);
                self.builder.ins().call(func_ref, &args)
            }
            Callee::Runtime(service) => {
                let id = self.refs.runtime[service];
                let func_ref = self.target.declare_func_in_func(id, self.builder.func);
                self.builder.ins().call(func_ref, &args)
            }
            Callee::Indirect(code) => {
                let code = self.value(*code)?;
                let sig = tagged_signature(&*self.target, args.len().saturating_sub(1) as u32);
                let sig_ref = self.builder.import_signature(sig);
                self.builder.ins().call_indirect(sig_ref, code, &args)
            }
        };
        Ok(self.builder.inst_results(call).first().copied())
    }
}
