//! Programmatic construction of program snapshots.
//!
//! `ProgramBuilder` bootstraps the core classes and singletons, hands out
//! selectors whose ids never collide in the dispatch table, and lays out the
//! dispatch table when the program is finished.

use crate::bytecode::{Format, Opcode};
use crate::heap::{
    CatchRange, ClassObject, DispatchEntryObject, FunctionObject, HeapObject, InstanceFormat,
    InstanceObject, InstanceType, ObjectBody, ObjectId, Value,
};
use crate::program::{NativeRegistry, Program, Roots};
use crate::{Heap, Selector, SnapshotError};

/// Distance between selector ids; bounds the number of classes a builder
/// can register without dispatch rows overlapping.
pub const SELECTOR_STRIDE: u32 = 64;

/// Ids of the objects every snapshot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreObjects {
    pub meta_class: ObjectId,
    pub object_class: ObjectId,
    pub null_class: ObjectId,
    pub bool_class: ObjectId,
    pub smi_class: ObjectId,
    pub large_integer_class: ObjectId,
    pub double_class: ObjectId,
    pub boxed_class: ObjectId,
    pub array_class: ObjectId,
    pub byte_array_class: ObjectId,
    pub one_byte_string_class: ObjectId,
    pub function_class: ObjectId,
    pub initializer_class: ObjectId,
    pub dispatch_table_entry_class: ObjectId,
    pub null_object: ObjectId,
    pub true_object: ObjectId,
    pub false_object: ObjectId,
}

#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    objects: Vec<HeapObject>,
    classes: Vec<ObjectId>,
    methods: Vec<(ObjectId, Selector, ObjectId)>,
    statics: Vec<Value>,
    natives: Vec<String>,
    selectors: u32,
    no_such_method: Option<ObjectId>,
    core: CoreObjects,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        let placeholder = ObjectId(0);
        let mut builder = Self {
            objects: Vec::new(),
            classes: Vec::new(),
            methods: Vec::new(),
            statics: Vec::new(),
            natives: Vec::new(),
            selectors: 0,
            no_such_method: None,
            core: CoreObjects {
                meta_class: placeholder,
                object_class: placeholder,
                null_class: placeholder,
                bool_class: placeholder,
                smi_class: placeholder,
                large_integer_class: placeholder,
                double_class: placeholder,
                boxed_class: placeholder,
                array_class: placeholder,
                byte_array_class: placeholder,
                one_byte_string_class: placeholder,
                function_class: placeholder,
                initializer_class: placeholder,
                dispatch_table_entry_class: placeholder,
                null_object: placeholder,
                true_object: placeholder,
                false_object: placeholder,
            },
        };
        let meta = builder.next_id();
        builder.core.meta_class = meta;
        builder.push_class(meta, "Class", None, InstanceFormat::new(InstanceType::Class, 0));
        let object = builder.add_class_with_format("Object", None, InstanceType::Instance, 0);
        builder.core.object_class = object;
        let core = |builder: &mut Self, name: &str, kind| {
            builder.add_class_with_format(name, Some(object), kind, 0)
        };
        builder.core.null_class = core(&mut builder, "Null", InstanceType::Instance);
        builder.core.bool_class = core(&mut builder, "bool", InstanceType::Instance);
        builder.core.smi_class = core(&mut builder, "Smi", InstanceType::Instance);
        builder.core.large_integer_class =
            core(&mut builder, "LargeInteger", InstanceType::LargeInteger);
        builder.core.double_class = core(&mut builder, "double", InstanceType::Double);
        builder.core.boxed_class = core(&mut builder, "Boxed", InstanceType::Boxed);
        builder.core.array_class = core(&mut builder, "Array", InstanceType::Array);
        builder.core.byte_array_class = core(&mut builder, "ByteArray", InstanceType::ByteArray);
        builder.core.one_byte_string_class =
            core(&mut builder, "OneByteString", InstanceType::OneByteString);
        builder.core.function_class = core(&mut builder, "Function", InstanceType::Function);
        builder.core.initializer_class =
            core(&mut builder, "Initializer", InstanceType::Initializer);
        builder.core.dispatch_table_entry_class = core(
            &mut builder,
            "DispatchTableEntry",
            InstanceType::DispatchTableEntry,
        );
        builder.core.null_object = builder.add_instance(builder.core.null_class, Vec::new());
        builder.core.true_object = builder.add_instance(builder.core.bool_class, Vec::new());
        builder.core.false_object = builder.add_instance(builder.core.bool_class, Vec::new());
        builder
    }

    pub fn core(&self) -> CoreObjects {
        self.core
    }

    fn next_id(&self) -> ObjectId {
        ObjectId(self.objects.len() as u32 + 1)
    }

    fn push(&mut self, id: ObjectId, class: ObjectId, body: ObjectBody) {
        self.objects.push(HeapObject { id, class, body });
    }

    fn push_class(
        &mut self,
        id: ObjectId,
        name: &str,
        super_class: Option<ObjectId>,
        format: InstanceFormat,
    ) {
        let class_id = self.classes.len() as u32;
        self.classes.push(id);
        let meta = self.core.meta_class;
        self.push(
            id,
            meta,
            ObjectBody::Class(ClassObject {
                name: Some(name.to_string()),
                super_class,
                format,
                class_id,
                child_id: class_id,
                methods: None,
            }),
        );
    }

    fn add_class_with_format(
        &mut self,
        name: &str,
        super_class: Option<ObjectId>,
        kind: InstanceType,
        fields: u32,
    ) -> ObjectId {
        let id = self.next_id();
        self.push_class(id, name, super_class, InstanceFormat::new(kind, fields));
        id
    }

    /// Adds an ordinary instance class deriving from `Object` unless told otherwise.
    pub fn add_class(&mut self, name: &str, super_class: Option<ObjectId>, fields: u32) -> ObjectId {
        let super_class = super_class.or(Some(self.core.object_class));
        self.add_class_with_format(name, super_class, InstanceType::Instance, fields)
    }

    pub fn class_id(&self, class: ObjectId) -> Option<u32> {
        self.classes.iter().position(|&id| id == class).map(|index| index as u32)
    }

    pub fn selector(&mut self, arity: u32) -> Selector {
        self.selectors += 1;
        let id = 1 + (self.selectors - 1) * SELECTOR_STRIDE;
        Selector::method(id, arity).unwrap_or_else(|| Selector::from_raw(0))
    }

    pub fn add_function(
        &mut self,
        name: &str,
        arity: u32,
        bytecodes: Vec<u8>,
        literals: Vec<Value>,
    ) -> ObjectId {
        let id = self.next_id();
        let class = self.core.function_class;
        self.push(
            id,
            class,
            ObjectBody::Function(FunctionObject {
                name: Some(name.to_string()),
                arity,
                bytecodes,
                literals,
                catch_ranges: Vec::new(),
            }),
        );
        id
    }

    pub fn set_catch_ranges(&mut self, function: ObjectId, ranges: Vec<CatchRange>) {
        if let Some(HeapObject {
            body: ObjectBody::Function(function),
            ..
        }) = self.object_mut(function)
        {
            function.catch_ranges = ranges;
        }
    }

    pub fn add_method(&mut self, class: ObjectId, selector: Selector, function: ObjectId) {
        self.methods.push((class, selector, function));
    }

    /// Function invoked on an inline-cache miss. Defaults to one returning null.
    pub fn set_no_such_method(&mut self, function: ObjectId) {
        self.no_such_method = Some(function);
    }

    pub fn add_object(&mut self, class: ObjectId, body: ObjectBody) -> ObjectId {
        let id = self.next_id();
        self.push(id, class, body);
        id
    }

    pub fn add_instance(&mut self, class: ObjectId, fields: Vec<Value>) -> ObjectId {
        self.add_object(
            class,
            ObjectBody::Instance(InstanceObject {
                immutable: false,
                fields,
            }),
        )
    }

    pub fn add_array(&mut self, elements: Vec<Value>) -> ObjectId {
        let class = self.core.array_class;
        self.add_object(class, ObjectBody::Array { elements })
    }

    pub fn add_byte_array(&mut self, bytes: Vec<u8>) -> ObjectId {
        let class = self.core.byte_array_class;
        self.add_object(class, ObjectBody::ByteArray { bytes })
    }

    pub fn add_string(&mut self, text: &str) -> ObjectId {
        let class = self.core.one_byte_string_class;
        self.add_object(
            class,
            ObjectBody::OneByteString {
                text: text.to_string(),
            },
        )
    }

    pub fn add_large_integer(&mut self, value: i64) -> ObjectId {
        let class = self.core.large_integer_class;
        self.add_object(class, ObjectBody::LargeInteger { value })
    }

    pub fn add_double(&mut self, value: f64) -> ObjectId {
        let class = self.core.double_class;
        self.add_object(class, ObjectBody::Double { value })
    }

    pub fn add_boxed(&mut self, value: Value) -> ObjectId {
        let class = self.core.boxed_class;
        self.add_object(class, ObjectBody::Boxed { value })
    }

    pub fn add_static(&mut self, value: Value) -> u32 {
        self.statics.push(value);
        self.statics.len() as u32 - 1
    }

    /// Adds a static slot whose first read runs `function` and caches the result.
    pub fn add_lazy_static(&mut self, function: ObjectId) -> u32 {
        let class = self.core.initializer_class;
        let initializer = self.add_object(class, ObjectBody::Initializer { function });
        self.add_static(Value::Object(initializer))
    }

    pub fn add_native(&mut self, name: &str) -> u8 {
        if let Some(index) = self.natives.iter().position(|known| known == name) {
            return index as u8;
        }
        self.natives.push(name.to_string());
        self.natives.len() as u8 - 1
    }

    fn object_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.iter_mut().find(|object| object.id == id)
    }

    fn dispatch_entry(&mut self, target: ObjectId, offset: i64, selector: Selector) -> ObjectId {
        let class = self.core.dispatch_table_entry_class;
        self.add_object(
            class,
            ObjectBody::DispatchTableEntry(DispatchEntryObject {
                target,
                offset,
                selector,
            }),
        )
    }

    pub fn build(mut self, entry: ObjectId) -> Result<Program, SnapshotError> {
        if self.classes.len() as u32 > SELECTOR_STRIDE {
            return Err(SnapshotError::Malformed(format!(
                "{} classes exceed the dispatch row stride of {SELECTOR_STRIDE}",
                self.classes.len()
            )));
        }
        let nsm = match self.no_such_method {
            Some(function) => function,
            None => {
                let mut asm = Assembler::new();
                asm.emit(Opcode::ReturnNull);
                let code = asm.finish()?;
                self.add_function("noSuchMethod", 1, code, Vec::new())
            }
        };
        let nsm_entry = self.dispatch_entry(nsm, 0, Selector::from_raw(0));

        let rows = self.selectors * SELECTOR_STRIDE + 1;
        let mut table = vec![Value::Object(nsm_entry); (rows + SELECTOR_STRIDE) as usize];
        let methods = std::mem::take(&mut self.methods);
        for &(class, selector, function) in &methods {
            let class_id = self
                .class_id(class)
                .ok_or(SnapshotError::MissingObject(class))?;
            let slot = (selector.id() + class_id) as usize;
            let entry = self.dispatch_entry(function, i64::from(selector.id()), selector);
            match table.get_mut(slot) {
                Some(cell) => *cell = Value::Object(entry),
                None => {
                    return Err(SnapshotError::Malformed(format!(
                        "selector {selector} does not fit the dispatch table"
                    )))
                }
            }
        }
        let classes = self.classes.clone();
        for class in classes {
            let pairs: Vec<Value> = methods
                .iter()
                .filter(|(owner, _, _)| *owner == class)
                .flat_map(|&(_, selector, function)| {
                    [Value::Smi(i64::from(selector.raw())), Value::Object(function)]
                })
                .collect();
            if pairs.is_empty() {
                continue;
            }
            let array = self.add_array(pairs);
            if let Some(HeapObject {
                body: ObjectBody::Class(class),
                ..
            }) = self.object_mut(class)
            {
                class.methods = Some(array);
            }
        }
        let dispatch_table = self.add_array(table);
        let statics = std::mem::take(&mut self.statics);
        let static_fields = self.add_array(statics);

        let core = self.core;
        let roots = Roots {
            null_object: core.null_object,
            false_object: core.false_object,
            true_object: core.true_object,
            meta_class: core.meta_class,
            object_class: core.object_class,
            null_class: core.null_class,
            bool_class: core.bool_class,
            smi_class: core.smi_class,
            large_integer_class: core.large_integer_class,
            double_class: core.double_class,
            boxed_class: core.boxed_class,
            array_class: core.array_class,
            byte_array_class: core.byte_array_class,
            one_byte_string_class: core.one_byte_string_class,
            function_class: core.function_class,
            initializer_class: core.initializer_class,
            dispatch_table_entry_class: core.dispatch_table_entry_class,
            static_fields,
            dispatch_table,
            entry,
            session: Vec::new(),
        };
        Program::new(
            Heap::from_objects(self.objects)?,
            roots,
            NativeRegistry::new(self.natives),
        )
    }
}

/// Forward reference to a bytecode offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Bytecode assembler with label fixups for forward branches.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
}

#[derive(Debug)]
struct Fixup {
    instruction: u32,
    operand: usize,
    label: Label,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bci(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert_eq!(opcode.format(), Format::Empty);
        self.code.push(opcode as u8);
        self
    }

    pub fn emit_b(&mut self, opcode: Opcode, operand: u8) -> &mut Self {
        self.code.push(opcode as u8);
        self.code.push(operand);
        self
    }

    pub fn emit_i(&mut self, opcode: Opcode, operand: i32) -> &mut Self {
        self.code.push(opcode as u8);
        self.code.extend_from_slice(&operand.to_le_bytes());
        self
    }

    pub fn emit_bb(&mut self, opcode: Opcode, first: u8, second: u8) -> &mut Self {
        self.code.extend_from_slice(&[opcode as u8, first, second]);
        self
    }

    pub fn emit_bi(&mut self, opcode: Opcode, first: u8, second: i32) -> &mut Self {
        self.code.push(opcode as u8);
        self.code.push(first);
        self.code.extend_from_slice(&second.to_le_bytes());
        self
    }

    pub fn emit_ii(&mut self, opcode: Opcode, first: i32, second: i32) -> &mut Self {
        self.code.push(opcode as u8);
        self.code.extend_from_slice(&first.to_le_bytes());
        self.code.extend_from_slice(&second.to_le_bytes());
        self
    }

    pub fn load_local(&mut self, index: u8) -> &mut Self {
        match index {
            0 => self.emit(Opcode::LoadLocal0),
            1 => self.emit(Opcode::LoadLocal1),
            2 => self.emit(Opcode::LoadLocal2),
            3 => self.emit(Opcode::LoadLocal3),
            4 => self.emit(Opcode::LoadLocal4),
            5 => self.emit(Opcode::LoadLocal5),
            _ => self.emit_b(Opcode::LoadLocal, index),
        }
    }

    pub fn load_literal(&mut self, value: i32) -> &mut Self {
        match value {
            0 => self.emit(Opcode::LoadLiteral0),
            1 => self.emit(Opcode::LoadLiteral1),
            2..=255 => self.emit_b(Opcode::LoadLiteral, value as u8),
            _ => self.emit_i(Opcode::LoadLiteralWide, value),
        }
    }

    pub fn invoke(&mut self, opcode: Opcode, selector: Selector) -> &mut Self {
        self.emit_i(opcode, selector.raw() as i32)
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        let bci = self.bci();
        self.labels[label.0] = Some(bci);
        self
    }

    pub fn bound(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    /// Emits a branch to `label`. Backward opcodes need the label bound.
    pub fn branch(&mut self, opcode: Opcode, label: Label) -> Result<&mut Self, SnapshotError> {
        let instruction = self.bci();
        match opcode {
            Opcode::BranchWide | Opcode::BranchIfTrueWide | Opcode::BranchIfFalseWide => {
                self.emit_i(opcode, 0);
                self.fixups.push(Fixup {
                    instruction,
                    operand: 1,
                    label,
                });
            }
            Opcode::BranchBack | Opcode::BranchBackIfTrue | Opcode::BranchBackIfFalse => {
                let distance = self.distance_back(label)?;
                let distance = u8::try_from(distance).map_err(|_| {
                    SnapshotError::Malformed(format!("short back branch of {distance} bytes"))
                })?;
                self.emit_b(opcode, distance);
            }
            Opcode::BranchBackWide
            | Opcode::BranchBackIfTrueWide
            | Opcode::BranchBackIfFalseWide => {
                let distance = self.distance_back(label)?;
                self.emit_i(opcode, distance as i32);
            }
            other => {
                return Err(SnapshotError::Malformed(format!(
                    "{} is not a branch",
                    other.mnemonic()
                )))
            }
        }
        Ok(self)
    }

    /// `pop and branch wide`: drops `count` values then jumps forward.
    pub fn pop_and_branch(&mut self, count: u8, label: Label) -> &mut Self {
        let instruction = self.bci();
        self.emit_bi(Opcode::PopAndBranchWide, count, 0);
        self.fixups.push(Fixup {
            instruction,
            operand: 2,
            label,
        });
        self
    }

    /// `subroutine call`: jumps to `target`, resuming after the call.
    pub fn subroutine_call(&mut self, target: Label) -> &mut Self {
        let instruction = self.bci();
        self.emit_ii(Opcode::SubroutineCall, 0, Opcode::SubroutineCall.size() as i32);
        self.fixups.push(Fixup {
            instruction,
            operand: 1,
            label: target,
        });
        self
    }

    fn distance_back(&self, label: Label) -> Result<u32, SnapshotError> {
        match self.labels[label.0] {
            Some(target) => Ok(self.bci() - target),
            None => Err(SnapshotError::Malformed(
                "backward branch to an unbound label".to_string(),
            )),
        }
    }

    /// Resolves forward branches and appends the method end marker.
    pub fn finish(mut self) -> Result<Vec<u8>, SnapshotError> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or_else(|| {
                SnapshotError::Malformed("forward branch to an unbound label".to_string())
            })?;
            let delta = (i64::from(target) - i64::from(fixup.instruction)) as i32;
            let at = fixup.instruction as usize + fixup.operand;
            self.code[at..at + 4].copy_from_slice(&delta.to_le_bytes());
        }
        let length = self.bci() as i32;
        self.emit_i(Opcode::MethodEnd, length);
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;

    #[test]
    fn builder_bootstraps_core_objects() {
        let mut builder = ProgramBuilder::new();
        let core = builder.core();
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnNull);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let meta = program.heap.get(core.meta_class).unwrap();
        assert_eq!(meta.class, core.meta_class);
        let null = program.heap.get(core.null_object).unwrap();
        assert_eq!(null.class, core.null_class);
        assert_eq!(program.roots.entry, main);
        assert_eq!(program.heap.class(core.meta_class).unwrap().class_id, 0);
    }

    #[test]
    fn dispatch_table_places_methods_at_selector_plus_class_id() {
        let mut builder = ProgramBuilder::new();
        let point = builder.add_class("Point", None, 2);
        let selector = builder.selector(0);
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnNull);
        let getter = builder.add_function("x", 1, asm.finish().unwrap(), Vec::new());
        builder.add_method(point, selector, getter);
        let class_id = builder.class_id(point).unwrap();
        let program = builder.build(getter).unwrap();

        let table = match &program.heap.get(program.roots.dispatch_table).unwrap().body {
            ObjectBody::Array { elements } => elements.clone(),
            other => panic!("unexpected {other:?}"),
        };
        let slot = (selector.id() + class_id) as usize;
        let entry = table[slot].as_object().unwrap();
        match &program.heap.get(entry).unwrap().body {
            ObjectBody::DispatchTableEntry(entry) => {
                assert_eq!(entry.target, getter);
                assert_eq!(entry.offset, i64::from(selector.id()));
            }
            other => panic!("unexpected {other:?}"),
        }
        let nsm = table[0].as_object().unwrap();
        assert_ne!(nsm, entry);
        assert_eq!(table[slot + 1], table[0]);
    }

    #[test]
    fn assembler_resolves_forward_and_backward_branches() {
        let mut asm = Assembler::new();
        let top = asm.bound();
        let exit = asm.label();
        asm.emit(Opcode::LoadLiteralTrue);
        asm.branch(Opcode::BranchIfFalseWide, exit).unwrap();
        asm.branch(Opcode::BranchBack, top).unwrap();
        asm.bind(exit);
        asm.emit(Opcode::ReturnNull);
        let code = asm.finish().unwrap();

        let branch = Instruction::decode(&code, 1).unwrap();
        assert_eq!(branch.branch_target(), Some(8));
        let back = Instruction::decode(&code, 6).unwrap();
        assert_eq!(back.branch_target(), Some(0));
        assert_eq!(Instruction::decode(&code, 9).unwrap().opcode, Opcode::MethodEnd);
    }
}
