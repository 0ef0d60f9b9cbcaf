use crate::bytecode::{self, Opcode};
use crate::heap::{Heap, HeapObject, ObjectBody, ObjectId, Value};
use crate::Selector;
use crate::SnapshotError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Named well-known objects. The order of `iter` is the order of the
/// emitted root table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roots {
    pub null_object: ObjectId,
    pub false_object: ObjectId,
    pub true_object: ObjectId,
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
    pub static_fields: ObjectId,
    pub dispatch_table: ObjectId,
    pub entry: ObjectId,
    /// Debugger/session extensions. Never part of the compiled image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session: Vec<Value>,
}

impl Roots {
    /// Roots in table order, excluding session-specific extensions.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, ObjectId)> {
        [
            ("null_object", self.null_object),
            ("false_object", self.false_object),
            ("true_object", self.true_object),
            ("meta_class", self.meta_class),
            ("object_class", self.object_class),
            ("null_class", self.null_class),
            ("bool_class", self.bool_class),
            ("smi_class", self.smi_class),
            ("large_integer_class", self.large_integer_class),
            ("double_class", self.double_class),
            ("boxed_class", self.boxed_class),
            ("array_class", self.array_class),
            ("byte_array_class", self.byte_array_class),
            ("one_byte_string_class", self.one_byte_string_class),
            ("function_class", self.function_class),
            ("initializer_class", self.initializer_class),
            ("dispatch_table_entry_class", self.dispatch_table_entry_class),
            ("static_fields", self.static_fields),
            ("dispatch_table", self.dispatch_table),
            ("entry", self.entry),
        ]
        .into_iter()
    }
}

/// Ordered list of native identifiers. Position is the native's index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeRegistry {
    names: Vec<String>,
}

impl NativeRegistry {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(index, name)| (index, name.as_str()))
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|candidate| candidate == name)
    }

    /// External symbol of a native entry point.
    pub fn symbol(name: &str) -> String {
        format!("Native_{name}")
    }
}

#[derive(Serialize, Deserialize)]
struct ProgramFile {
    heap: Vec<HeapObject>,
    roots: Roots,
    #[serde(default)]
    natives: NativeRegistry,
}

/// A frozen program snapshot: heap, roots and the native registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub heap: Heap,
    pub roots: Roots,
    pub natives: NativeRegistry,
}

impl Program {
    pub fn new(heap: Heap, roots: Roots, natives: NativeRegistry) -> Result<Self, SnapshotError> {
        let program = Self {
            heap,
            roots,
            natives,
        };
        program.validate()?;
        Ok(program)
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let source = fs::read_to_string(path)
            .map_err(|err| SnapshotError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json(&source)
    }

    pub fn from_json(source: &str) -> Result<Self, SnapshotError> {
        let file: ProgramFile =
            serde_json::from_str(source).map_err(|err| SnapshotError::Parse(err.to_string()))?;
        Self::new(Heap::from_objects(file.heap)?, file.roots, file.natives)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        let file = ProgramFile {
            heap: self.heap.objects().to_vec(),
            roots: self.roots.clone(),
            natives: self.natives.clone(),
        };
        serde_json::to_string_pretty(&file).map_err(|err| SnapshotError::Parse(err.to_string()))
    }

    pub fn object(&self, id: ObjectId) -> Result<&HeapObject, SnapshotError> {
        self.heap.get(id).ok_or(SnapshotError::MissingObject(id))
    }

    /// Checks that every reference in the snapshot resolves.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (name, id) in self.roots.iter() {
            if self.heap.get(id).is_none() {
                return Err(SnapshotError::MissingRoot(name, id));
            }
        }
        if self.heap.function(self.roots.entry).is_none() {
            return Err(SnapshotError::Malformed(format!(
                "entry {} is not a function",
                self.roots.entry
            )));
        }
        for object in self.heap.iter() {
            self.check_ref(object.class)?;
            match &object.body {
                ObjectBody::Class(class) => {
                    if let Some(super_class) = class.super_class {
                        self.check_ref(super_class)?;
                    }
                    if let Some(methods) = class.methods {
                        self.check_ref(methods)?;
                    }
                }
                ObjectBody::Function(function) => {
                    for literal in &function.literals {
                        self.check_value(*literal)?;
                    }
                }
                ObjectBody::Instance(instance) => {
                    for field in &instance.fields {
                        self.check_value(*field)?;
                    }
                }
                ObjectBody::Array { elements } => {
                    for element in elements {
                        self.check_value(*element)?;
                    }
                }
                ObjectBody::Boxed { value } => self.check_value(*value)?,
                ObjectBody::Initializer { function } => {
                    if self.heap.function(*function).is_none() {
                        return Err(SnapshotError::Malformed(format!(
                            "initializer {} does not reference a function",
                            object.id
                        )));
                    }
                }
                ObjectBody::DispatchTableEntry(entry) => {
                    if self.heap.function(entry.target).is_none() {
                        return Err(SnapshotError::Malformed(format!(
                            "dispatch entry {} does not target a function",
                            object.id
                        )));
                    }
                }
                ObjectBody::ByteArray { .. }
                | ObjectBody::OneByteString { .. }
                | ObjectBody::TwoByteString { .. }
                | ObjectBody::LargeInteger { .. }
                | ObjectBody::Double { .. } => {}
            }
        }
        self.validate_dispatch_table()
    }

    /// The table must be an array of dispatch entries, slot 0 included,
    /// long enough for every `class_id + selector_id` the code can form.
    fn validate_dispatch_table(&self) -> Result<(), SnapshotError> {
        let id = self.roots.dispatch_table;
        let elements = match &self.object(id)?.body {
            ObjectBody::Array { elements } => elements,
            other => {
                return Err(SnapshotError::Malformed(format!(
                    "dispatch table {id} is a {}, not an array",
                    other.kind_name()
                )))
            }
        };
        for (slot, element) in elements.iter().enumerate() {
            let is_entry = element
                .as_object()
                .and_then(|entry| self.heap.get(entry))
                .is_some_and(|entry| matches!(entry.body, ObjectBody::DispatchTableEntry(_)));
            if !is_entry {
                return Err(SnapshotError::Malformed(format!(
                    "dispatch table slot {slot} does not hold a dispatch entry"
                )));
            }
        }
        let max_class = self
            .heap
            .iter()
            .filter_map(|object| match &object.body {
                ObjectBody::Class(class) => Some(class.class_id),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let required = u64::from(max_class) + u64::from(self.max_static_selector()) + 1;
        if (elements.len() as u64) < required {
            return Err(SnapshotError::Malformed(format!(
                "dispatch table has {} slots but class and selector ids need {required}",
                elements.len()
            )));
        }
        Ok(())
    }

    /// Largest selector id named by a table-dispatched invoke. Undecodable
    /// code is left for the backend to report.
    fn max_static_selector(&self) -> u32 {
        self.heap
            .iter()
            .filter_map(|object| match &object.body {
                ObjectBody::Function(function) => Some(function),
                _ => None,
            })
            .flat_map(|function| bytecode::instructions(&function.bytecodes).map_while(Result::ok))
            .filter(|instruction| dispatches_through_table(instruction.opcode))
            .map(|instruction| Selector::from_raw(instruction.operand(0) as u32).id())
            .max()
            .unwrap_or(0)
    }

    fn check_ref(&self, id: ObjectId) -> Result<(), SnapshotError> {
        if self.heap.get(id).is_some() {
            Ok(())
        } else {
            Err(SnapshotError::MissingObject(id))
        }
    }

    fn check_value(&self, value: Value) -> Result<(), SnapshotError> {
        match value {
            Value::Smi(_) => Ok(()),
            Value::Object(id) => self.check_ref(id),
        }
    }
}

fn dispatches_through_table(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::InvokeMethod
            | Opcode::InvokeTest
            | Opcode::InvokeEq
            | Opcode::InvokeLt
            | Opcode::InvokeLe
            | Opcode::InvokeGt
            | Opcode::InvokeGe
            | Opcode::InvokeAdd
            | Opcode::InvokeSub
            | Opcode::InvokeMod
            | Opcode::InvokeMul
            | Opcode::InvokeTruncDiv
            | Opcode::InvokeBitNot
            | Opcode::InvokeBitAnd
            | Opcode::InvokeBitOr
            | Opcode::InvokeBitXor
            | Opcode::InvokeBitShr
            | Opcode::InvokeBitShl
    )
}
