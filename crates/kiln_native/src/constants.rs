//! Static image construction from the frozen heap.
//!
//! Every reachable heap object becomes one `StaticObject` in a single image
//! data blob. Objects are memoized by identity. A reference to an object not
//! seen before registers a placeholder and queues the object; the queue is
//! drained iteratively, patching each placeholder with its cells. Cyclic
//! references (the meta-class, the null class and its super chain,
//! self-referencing arrays) resolve to the placeholder, and long chains of
//! references never deepen the native stack.

use crate::error::{internal_error, native_error, Result, E_SNAPSHOT, E_UNSUPPORTED_OBJECT};
use crate::ir::{ConstId, FuncIndex, FunctionDecl};
use cranelift_entity::PrimaryMap;
use kiln_core::abi::{self, INSTANCE_FLAG_IMMUTABLE};
use kiln_core::{HeapObject, ObjectBody, ObjectId, Program, Value};
use std::collections::{HashMap, VecDeque};

/// One word (or byte run) of a static object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// A literal machine word: smi, flags or a raw payload.
    Word(i64),
    /// Tagged reference to another static object.
    Object(ConstId),
    /// Untagged address of a compiled function.
    Code(FuncIndex),
    /// Raw bytes, padded to a whole number of words.
    Bytes(Vec<u8>),
}

impl Cell {
    pub fn size(&self) -> u64 {
        match self {
            Cell::Bytes(bytes) => (bytes.len() as u64).div_ceil(abi::WORD_SIZE as u64) * abi::WORD_SIZE as u64,
            _ => abi::WORD_SIZE as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticObject {
    pub source: Option<ObjectId>,
    pub kind: &'static str,
    pub cells: Vec<Cell>,
    /// Byte offset inside the image, assigned by `Materializer::finish`.
    pub offset: u64,
}

impl StaticObject {
    pub fn size(&self) -> u64 {
        self.cells.iter().map(Cell::size).sum()
    }
}

/// The laid-out static data of one compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub objects: PrimaryMap<ConstId, StaticObject>,
    pub size: u64,
}

impl Image {
    pub fn offset(&self, object: ConstId) -> u64 {
        self.objects[object].offset
    }

    /// Offset of the tagged reference to `object`, relative to the image start.
    pub fn tagged_offset(&self, object: ConstId) -> u64 {
        self.objects[object].offset + abi::HEAP_OBJECT_TAG as u64
    }

    /// Serializes every cell that is not a relocation; relocated words stay zero.
    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size as usize];
        for object in self.objects.values() {
            let mut at = object.offset as usize;
            for cell in &object.cells {
                match cell {
                    Cell::Word(word) => bytes[at..at + 8].copy_from_slice(&word.to_le_bytes()),
                    Cell::Bytes(data) => bytes[at..at + data.len()].copy_from_slice(data),
                    Cell::Object(_) | Cell::Code(_) => {}
                }
                at += cell.size() as usize;
            }
        }
        bytes
    }

    /// Every word that needs a relocation, as (offset, cell).
    pub fn relocations(&self) -> Vec<(u64, &Cell)> {
        let mut relocations = Vec::new();
        for object in self.objects.values() {
            let mut at = object.offset;
            for cell in &object.cells {
                if matches!(cell, Cell::Object(_) | Cell::Code(_)) {
                    relocations.push((at, cell));
                }
                at += cell.size();
            }
        }
        relocations
    }
}

/// A materialized value: a tagged immediate or a reference to a static object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeConstant {
    Immediate(i64),
    Object(ConstId),
}

impl NativeConstant {
    pub fn cell(self) -> Cell {
        match self {
            NativeConstant::Immediate(word) => Cell::Word(word),
            NativeConstant::Object(object) => Cell::Object(object),
        }
    }
}

pub struct Materializer<'p> {
    program: &'p Program,
    objects: PrimaryMap<ConstId, StaticObject>,
    cache: HashMap<ObjectId, ConstId>,
    /// Placeholders whose cells are still to be built.
    unbuilt: Vec<(ObjectId, ConstId)>,
    large_integers: HashMap<i64, ConstId>,
    functions: PrimaryMap<FuncIndex, FunctionDecl>,
    function_index: HashMap<ObjectId, FuncIndex>,
    pending: VecDeque<(FuncIndex, ObjectId)>,
}

impl<'p> Materializer<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            objects: PrimaryMap::new(),
            cache: HashMap::new(),
            unbuilt: Vec::new(),
            large_integers: HashMap::new(),
            functions: PrimaryMap::new(),
            function_index: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn materialize(&mut self, value: Value) -> Result<NativeConstant> {
        let constant = self.constant(value)?;
        self.drain()?;
        Ok(constant)
    }

    pub fn materialize_object(&mut self, id: ObjectId) -> Result<ConstId> {
        let slot = self.reserve(id)?;
        self.drain()?;
        Ok(slot)
    }

    fn constant(&mut self, value: Value) -> Result<NativeConstant> {
        match value {
            Value::Smi(number) if abi::is_portable_smi(number) => {
                Ok(NativeConstant::Immediate(abi::smi(number) as i64))
            }
            Value::Smi(number) => self.large_integer(number).map(NativeConstant::Object),
            Value::Object(id) => self.reserve(id).map(NativeConstant::Object),
        }
    }

    /// The static object for `id`, registering a placeholder on first sight.
    fn reserve(&mut self, id: ObjectId) -> Result<ConstId> {
        if let Some(&known) = self.cache.get(&id) {
            return Ok(known);
        }
        let object = self.program.object(id)?;
        if let ObjectBody::TwoByteString { .. } = object.body {
            return Err(native_error(
                E_UNSUPPORTED_OBJECT,
                format!("cannot materialize {} of kind two_byte_string", object.id),
            ));
        }
        let slot = self.objects.push(StaticObject {
            source: Some(id),
            kind: "placeholder",
            cells: Vec::new(),
            offset: 0,
        });
        self.cache.insert(id, slot);
        self.unbuilt.push((id, slot));
        Ok(slot)
    }

    fn drain(&mut self) -> Result<()> {
        let program = self.program;
        while let Some((id, slot)) = self.unbuilt.pop() {
            let object = program.object(id)?;
            let cells = match self.build(object) {
                Ok(cells) => cells,
                Err(err) => {
                    self.unbuilt.clear();
                    return Err(err);
                }
            };
            let patched = &mut self.objects[slot];
            patched.kind = object.body.kind_name();
            patched.cells = cells;
        }
        Ok(())
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// Declares (once) the compiled counterpart of a bytecode function.
    pub fn function(&mut self, id: ObjectId) -> Result<FuncIndex> {
        if let Some(&index) = self.function_index.get(&id) {
            return Ok(index);
        }
        let function = self.program.heap.function(id).ok_or_else(|| {
            native_error(E_SNAPSHOT, format!("object {id} is not a function"))
        })?;
        let name = function.name.as_deref().unwrap_or("fn");
        let index = self.functions.push(FunctionDecl {
            symbol: format!("{}_{}", sanitize(name), id.0),
            arity: function.arity,
            body: None,
        });
        self.function_index.insert(id, index);
        self.pending.push_back((index, id));
        Ok(index)
    }

    /// Declares a generated helper that has no bytecode counterpart.
    pub fn declare_helper(&mut self, symbol: String, arity: u32) -> FuncIndex {
        self.functions.push(FunctionDecl {
            symbol,
            arity,
            body: None,
        })
    }

    pub fn symbol(&self, index: FuncIndex) -> &str {
        &self.functions[index].symbol
    }

    /// Next declared bytecode function still waiting for a body.
    pub fn next_pending(&mut self) -> Option<(FuncIndex, ObjectId)> {
        self.pending.pop_front()
    }

    pub fn finish(mut self) -> Result<(Image, PrimaryMap<FuncIndex, FunctionDecl>)> {
        let mut offset = 0;
        for (id, object) in self.objects.iter_mut() {
            if object.kind == "placeholder" {
                return Err(internal_error(format!(
                    "static object {id} was never patched after its placeholder"
                )));
            }
            object.offset = offset;
            offset += object.size();
        }
        log::debug!(
            "materialized {} objects ({offset} bytes), {} functions",
            self.objects.len(),
            self.functions.len()
        );
        Ok((
            Image {
                objects: self.objects,
                size: offset,
            },
            self.functions,
        ))
    }

    fn large_integer(&mut self, value: i64) -> Result<ConstId> {
        if let Some(&known) = self.large_integers.get(&value) {
            return Ok(known);
        }
        let class = self.reserve(self.program.roots.large_integer_class)?;
        let id = self.objects.push(StaticObject {
            source: None,
            kind: "large_integer",
            cells: vec![Cell::Object(class), Cell::Word(value)],
            offset: 0,
        });
        self.large_integers.insert(value, id);
        Ok(id)
    }

    fn value_cell(&mut self, value: Value) -> Result<Cell> {
        self.constant(value).map(NativeConstant::cell)
    }

    fn object_cell(&mut self, id: ObjectId) -> Result<Cell> {
        self.reserve(id).map(Cell::Object)
    }

    fn smi_cell(value: i64) -> Cell {
        Cell::Word(abi::smi(value) as i64)
    }

    fn build(&mut self, object: &HeapObject) -> Result<Vec<Cell>> {
        let class = self.object_cell(object.class)?;
        let null = self.program.roots.null_object;
        let cells = match &object.body {
            ObjectBody::Class(klass) => {
                let super_class = self.object_cell(klass.super_class.unwrap_or(null))?;
                let methods = self.object_cell(klass.methods.unwrap_or(null))?;
                vec![
                    class,
                    super_class,
                    Self::smi_cell(klass.format.encode()),
                    Self::smi_cell(i64::from(klass.class_id)),
                    Self::smi_cell(i64::from(klass.child_id)),
                    methods,
                ]
            }
            ObjectBody::Function(function) => {
                let code = self.function(object.id)?;
                vec![
                    class,
                    Self::smi_cell(function.bytecodes.len() as i64),
                    Self::smi_cell(function.literals.len() as i64),
                    Self::smi_cell(i64::from(function.arity)),
                    Cell::Code(code),
                ]
            }
            ObjectBody::Instance(instance) => {
                let declared = self
                    .program
                    .heap
                    .class(object.class)
                    .map(|klass| klass.format.fields as usize);
                if declared != Some(instance.fields.len()) {
                    return Err(native_error(
                        E_SNAPSHOT,
                        format!(
                            "instance {} has {} fields but its class declares {:?}",
                            object.id,
                            instance.fields.len(),
                            declared
                        ),
                    ));
                }
                let flags = if instance.immutable {
                    INSTANCE_FLAG_IMMUTABLE as i64
                } else {
                    0
                };
                let mut cells = vec![class, Cell::Word(flags)];
                for field in &instance.fields {
                    cells.push(self.value_cell(*field)?);
                }
                cells
            }
            ObjectBody::Array { elements } => {
                let mut cells = vec![class, Self::smi_cell(elements.len() as i64)];
                for element in elements {
                    cells.push(self.value_cell(*element)?);
                }
                cells
            }
            ObjectBody::ByteArray { bytes } => {
                vec![class, Self::smi_cell(bytes.len() as i64), Cell::Bytes(bytes.clone())]
            }
            ObjectBody::OneByteString { text } => {
                let bytes = text.as_bytes().to_vec();
                vec![
                    class,
                    Self::smi_cell(bytes.len() as i64),
                    // Hash is computed lazily by the runtime.
                    Self::smi_cell(0),
                    Cell::Bytes(bytes),
                ]
            }
            ObjectBody::LargeInteger { value } => vec![class, Cell::Word(*value)],
            ObjectBody::Double { value } => vec![class, Cell::Word(value.to_bits() as i64)],
            ObjectBody::Boxed { value } => vec![class, self.value_cell(*value)?],
            ObjectBody::Initializer { function } => {
                // The initializer function must exist before the initializer.
                self.function(*function)?;
                vec![class, self.object_cell(*function)?]
            }
            ObjectBody::DispatchTableEntry(entry) => {
                let code = self.function(entry.target)?;
                vec![
                    class,
                    self.object_cell(entry.target)?,
                    Cell::Code(code),
                    Self::smi_cell(entry.offset),
                    Self::smi_cell(i64::from(entry.selector.raw())),
                ]
            }
            ObjectBody::TwoByteString { .. } => {
                return Err(native_error(
                    E_UNSUPPORTED_OBJECT,
                    format!("cannot materialize {} of kind two_byte_string", object.id),
                ))
            }
        };
        Ok(cells)
    }
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push_str("fn");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;
    use kiln_core::builder::{Assembler, ProgramBuilder};
    use kiln_core::bytecode::Opcode;

    fn program_with(build: impl FnOnce(&mut ProgramBuilder) -> Vec<Value>) -> (Program, Vec<Value>) {
        let mut builder = ProgramBuilder::new();
        let values = build(&mut builder);
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnNull);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        (builder.build(main).unwrap(), values)
    }

    #[test]
    fn materializing_twice_returns_the_same_constant() {
        let (program, _) = program_with(|_| Vec::new());
        let mut materializer = Materializer::new(&program);
        let meta = program.roots.meta_class;
        let first = materializer.materialize_object(meta).unwrap();
        let second = materializer.materialize_object(meta).unwrap();
        assert_eq!(first, second);

        let null = materializer.materialize_object(program.roots.null_object).unwrap();
        assert_eq!(materializer.materialize_object(program.roots.null_object).unwrap(), null);

        let (image, _) = materializer.finish().unwrap();
        // The meta-class is its own class.
        assert_eq!(image.objects[first].cells[0], Cell::Object(first));
        assert_eq!(image.objects[first].kind, "class");
    }

    #[test]
    fn null_class_super_chain_cycle_is_closed() {
        let (program, _) = program_with(|_| Vec::new());
        let mut materializer = Materializer::new(&program);
        let null_class = materializer.materialize_object(program.roots.null_class).unwrap();
        let object_class = materializer.materialize_object(program.roots.object_class).unwrap();
        let null = materializer.materialize_object(program.roots.null_object).unwrap();
        let (image, _) = materializer.finish().unwrap();
        assert_eq!(image.objects[null_class].cells[1], Cell::Object(object_class));
        // Object has no super class: its super slot holds null, whose class is Null.
        assert_eq!(image.objects[object_class].cells[1], Cell::Object(null));
        assert_eq!(image.objects[null].cells[0], Cell::Object(null_class));
    }

    #[test]
    fn small_integers_stay_immediate_and_large_ones_become_objects() {
        let (program, _) = program_with(|_| Vec::new());
        let mut materializer = Materializer::new(&program);
        assert_eq!(
            materializer.materialize(Value::Smi(7)).unwrap(),
            NativeConstant::Immediate(14)
        );
        let big = 1i64 << 40;
        let first = materializer.materialize(Value::Smi(big)).unwrap();
        let again = materializer.materialize(Value::Smi(big)).unwrap();
        assert_eq!(first, again);
        let NativeConstant::Object(id) = first else {
            panic!("expected a heap constant, got {first:?}");
        };
        let (image, _) = materializer.finish().unwrap();
        assert_eq!(image.objects[id].kind, "large_integer");
        assert_eq!(image.objects[id].cells[1], Cell::Word(big));
    }

    #[test]
    fn strings_are_padded_and_referenced_through_the_tag() {
        let (program, values) = program_with(|b| vec![Value::Object(b.add_string("hi"))]);
        let Value::Object(string) = values[0] else { unreachable!() };
        let mut materializer = Materializer::new(&program);
        let id = materializer.materialize_object(string).unwrap();
        let (image, _) = materializer.finish().unwrap();
        let object = &image.objects[id];
        assert_eq!(object.size(), 32);
        assert_eq!(object.cells[2], Cell::Word(0));
        assert_eq!(object.cells[3], Cell::Bytes(b"hi".to_vec()));
        assert_eq!(image.tagged_offset(id), object.offset + 1);
    }

    #[test]
    fn long_reference_chains_materialize_without_recursion() {
        const LENGTH: usize = 100_000;
        let (program, values) = program_with(|b| {
            let node = b.add_class("Node", None, 1);
            let null = b.core().null_object;
            let mut next = Value::Object(null);
            for _ in 0..LENGTH {
                next = Value::Object(b.add_instance(node, vec![next]));
            }
            vec![next, Value::Object(null)]
        });
        let (Value::Object(head), Value::Object(null)) = (values[0], values[1]) else {
            unreachable!()
        };
        let mut materializer = Materializer::new(&program);
        let first = materializer.materialize_object(head).unwrap();
        let (image, _) = materializer.finish().unwrap();

        let mut node = first;
        let mut hops = 0;
        while let Cell::Object(next) = image.objects[node].cells[2] {
            if image.objects[next].source == Some(null) {
                break;
            }
            node = next;
            hops += 1;
        }
        assert_eq!(hops, LENGTH - 1);
    }

    #[test]
    fn image_layout_serializes_words_and_records_relocations() {
        let (program, values) = program_with(|b| vec![Value::Object(b.add_array(vec![Value::Smi(3)]))]);
        let Value::Object(array) = values[0] else { unreachable!() };
        let mut materializer = Materializer::new(&program);
        let id = materializer.materialize_object(array).unwrap();
        let (image, _) = materializer.finish().unwrap();
        let bytes = image.bytes();
        let at = image.offset(id) as usize;
        assert_eq!(&bytes[at + 8..at + 16], &2i64.to_le_bytes());
        assert_eq!(&bytes[at + 16..at + 24], &6i64.to_le_bytes());
        assert!(image
            .relocations()
            .iter()
            .any(|(offset, _)| *offset == image.offset(id)));
    }

    #[test]
    fn functions_are_declared_once_and_queued() {
        let (program, _) = program_with(|_| Vec::new());
        let mut materializer = Materializer::new(&program);
        let entry = program.roots.entry;
        let object = materializer.materialize_object(entry).unwrap();
        assert_eq!(materializer.function(entry).unwrap(), FuncIndex::new(0));
        assert_eq!(materializer.next_pending(), Some((FuncIndex::new(0), entry)));
        assert_eq!(materializer.next_pending(), None);
        let (image, functions) = materializer.finish().unwrap();
        assert_eq!(image.objects[object].cells[4], Cell::Code(FuncIndex::new(0)));
        assert_eq!(functions[FuncIndex::new(0)].symbol, format!("main_{}", entry.0));
    }

    #[test]
    fn unsupported_kinds_are_fatal() {
        let (program, values) = program_with(|b| {
            let class = b.core().one_byte_string_class;
            vec![Value::Object(b.add_object(class, ObjectBody::TwoByteString { units: vec![0x263a] }))]
        });
        let Value::Object(id) = values[0] else { unreachable!() };
        let mut materializer = Materializer::new(&program);
        let err = materializer.materialize_object(id).unwrap_err();
        assert_eq!(err.code, "E0501");
    }

    #[test]
    fn instance_field_count_must_match_its_class() {
        let (program, values) = program_with(|b| {
            let point = b.add_class("Point", None, 2);
            vec![Value::Object(b.add_instance(point, vec![Value::Smi(1)]))]
        });
        let Value::Object(id) = values[0] else { unreachable!() };
        let mut materializer = Materializer::new(&program);
        assert_eq!(materializer.materialize_object(id).unwrap_err().code, "E0500");
    }
}
