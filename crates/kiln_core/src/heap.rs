use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identity of a heap object inside one snapshot. Not stable across snapshots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A field or literal value: either an immediate integer or a heap reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Smi(i64),
    Object(ObjectId),
}

impl Value {
    pub fn as_object(self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(id),
            Value::Smi(_) => None,
        }
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Instance,
    Class,
    Function,
    Array,
    ByteArray,
    OneByteString,
    TwoByteString,
    LargeInteger,
    Double,
    Boxed,
    Initializer,
    DispatchTableEntry,
}

impl InstanceType {
    pub fn tag(self) -> i64 {
        match self {
            InstanceType::Instance => 0,
            InstanceType::Class => 1,
            InstanceType::Function => 2,
            InstanceType::Array => 3,
            InstanceType::ByteArray => 4,
            InstanceType::OneByteString => 5,
            InstanceType::TwoByteString => 6,
            InstanceType::LargeInteger => 7,
            InstanceType::Double => 8,
            InstanceType::Boxed => 9,
            InstanceType::Initializer => 10,
            InstanceType::DispatchTableEntry => 11,
        }
    }
}

/// Layout descriptor stored in every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFormat {
    #[serde(rename = "type")]
    pub kind: InstanceType,
    #[serde(default)]
    pub fields: u32,
}

impl InstanceFormat {
    pub fn new(kind: InstanceType, fields: u32) -> Self {
        Self { kind, fields }
    }

    /// Value stored (smi-tagged) in the class's format slot.
    pub fn encode(self) -> i64 {
        (i64::from(self.fields) << crate::abi::INSTANCE_FORMAT_TYPE_BITS) | self.kind.tag()
    }

    pub fn decode_fields(encoded: i64) -> u32 {
        (encoded >> crate::abi::INSTANCE_FORMAT_TYPE_BITS) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub super_class: Option<ObjectId>,
    pub format: InstanceFormat,
    pub class_id: u32,
    pub child_id: u32,
    #[serde(default)]
    pub methods: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchRange {
    pub start: u32,
    pub end: u32,
    pub frame_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arity: u32,
    pub bytecodes: Vec<u8>,
    #[serde(default)]
    pub literals: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch_ranges: Vec<CatchRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceObject {
    #[serde(default)]
    pub immutable: bool,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEntryObject {
    pub target: ObjectId,
    pub offset: i64,
    pub selector: crate::Selector,
}

/// Per-kind payload of a heap object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectBody {
    Class(ClassObject),
    Function(FunctionObject),
    Instance(InstanceObject),
    Array { elements: Vec<Value> },
    ByteArray { bytes: Vec<u8> },
    OneByteString { text: String },
    TwoByteString { units: Vec<u16> },
    LargeInteger { value: i64 },
    Double { value: f64 },
    Boxed { value: Value },
    Initializer { function: ObjectId },
    DispatchTableEntry(DispatchEntryObject),
}

impl ObjectBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectBody::Class(_) => "class",
            ObjectBody::Function(_) => "function",
            ObjectBody::Instance(_) => "instance",
            ObjectBody::Array { .. } => "array",
            ObjectBody::ByteArray { .. } => "byte_array",
            ObjectBody::OneByteString { .. } => "one_byte_string",
            ObjectBody::TwoByteString { .. } => "two_byte_string",
            ObjectBody::LargeInteger { .. } => "large_integer",
            ObjectBody::Double { .. } => "double",
            ObjectBody::Boxed { .. } => "boxed",
            ObjectBody::Initializer { .. } => "initializer",
            ObjectBody::DispatchTableEntry(_) => "dispatch_table_entry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapObject {
    pub id: ObjectId,
    pub class: ObjectId,
    #[serde(flatten)]
    pub body: ObjectBody,
}

/// Frozen object heap. Iteration order is the order objects were recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heap {
    objects: Vec<HeapObject>,
    index: HashMap<ObjectId, usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_objects(objects: Vec<HeapObject>) -> Result<Self, crate::SnapshotError> {
        let mut heap = Heap::new();
        for object in objects {
            heap.insert(object)?;
        }
        Ok(heap)
    }

    pub fn insert(&mut self, object: HeapObject) -> Result<(), crate::SnapshotError> {
        if self.index.contains_key(&object.id) {
            return Err(crate::SnapshotError::DuplicateObject(object.id));
        }
        self.index.insert(object.id, self.objects.len());
        self.objects.push(object);
        Ok(())
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.index.get(&id).map(|&slot| &self.objects[slot])
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        match self.index.get(&id) {
            Some(&slot) => Some(&mut self.objects[slot]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> &[HeapObject] {
        &self.objects
    }

    pub fn function(&self, id: ObjectId) -> Option<&FunctionObject> {
        match self.get(id).map(|object| &object.body) {
            Some(ObjectBody::Function(function)) => Some(function),
            _ => None,
        }
    }

    pub fn class(&self, id: ObjectId) -> Option<&ClassObject> {
        match self.get(id).map(|object| &object.body) {
            Some(ObjectBody::Class(class)) => Some(class),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_objects_deserialize_from_tagged_json() {
        let json = r#"[
            {"id": 1, "class": 2, "kind": "array", "elements": [{"smi": 3}, {"object": 1}]},
            {"id": 3, "class": 2, "kind": "double", "value": 1.5}
        ]"#;
        let objects: Vec<HeapObject> = serde_json::from_str(json).unwrap();
        let heap = Heap::from_objects(objects).unwrap();
        assert_eq!(heap.len(), 2);
        match &heap.get(ObjectId(1)).unwrap().body {
            ObjectBody::Array { elements } => {
                assert_eq!(elements, &vec![Value::Smi(3), Value::Object(ObjectId(1))]);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(heap.get(ObjectId(3)).unwrap().body.kind_name(), "double");
    }

    #[test]
    fn heap_rejects_duplicate_ids() {
        let object = HeapObject {
            id: ObjectId(4),
            class: ObjectId(4),
            body: ObjectBody::LargeInteger { value: 1 << 40 },
        };
        let err = Heap::from_objects(vec![object.clone(), object]).unwrap_err();
        assert_eq!(err, crate::SnapshotError::DuplicateObject(ObjectId(4)));
    }

    #[test]
    fn instance_format_encodes_type_in_low_bits() {
        let format = InstanceFormat::new(InstanceType::Initializer, 3);
        let encoded = format.encode();
        assert_eq!(encoded & crate::abi::INSTANCE_FORMAT_TYPE_MASK, 10);
        assert_eq!(InstanceFormat::decode_fields(encoded), 3);
    }
}
