//! Program snapshot model shared by the kiln native backend and its runtime.

pub mod abi;
pub mod builder;
pub mod bytecode;
mod diagnostics;
pub mod heap;
mod program;
mod selector;

pub use diagnostics::{Diagnostic, Report};
pub use heap::{
    CatchRange, ClassObject, DispatchEntryObject, FunctionObject, Heap, HeapObject,
    InstanceFormat, InstanceObject, InstanceType, ObjectBody, ObjectId, Value,
};
pub use program::{NativeRegistry, Program, Roots};
pub use selector::{Selector, SelectorKind, MAX_SELECTOR_ID};

pub const TOOL_NAME: &str = "kiln";
pub const VERSION: &str = "0.1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("cannot read snapshot: {0}")]
    Io(String),
    #[error("cannot parse snapshot: {0}")]
    Parse(String),
    #[error("object {0} appears twice in the heap")]
    DuplicateObject(ObjectId),
    #[error("reference to missing object {0}")]
    MissingObject(ObjectId),
    #[error("root '{0}' references missing object {1}")]
    MissingRoot(&'static str, ObjectId),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::builder::{Assembler, ProgramBuilder};
    use super::bytecode::Opcode;
    use super::{HeapObject, ObjectBody, Program, SnapshotError, Value};

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.load_literal(3).load_literal(4);
        let add = builder.selector(1);
        asm.invoke(Opcode::InvokeAdd, add).emit(Opcode::Return);
        let big = builder.add_large_integer(1 << 40);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), vec![Value::Object(big)]);
        builder.add_native("SmiAdd");
        let program = builder.build(main).unwrap();

        let json = program.to_json().unwrap();
        let reloaded = Program::from_json(&json).unwrap();
        assert_eq!(reloaded, program);
        assert_eq!(reloaded.natives.name(0), Some("SmiAdd"));
    }

    #[test]
    fn snapshot_with_dangling_root_is_rejected() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnNull);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();
        let mut json: serde_json::Value = serde_json::from_str(&program.to_json().unwrap()).unwrap();
        json["roots"]["true_object"] = serde_json::json!(9999);
        let err = Program::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(err, SnapshotError::MissingRoot("true_object", _)));
    }

    fn reload_with_table(program: &Program, edit: impl FnOnce(&mut Vec<Value>)) -> SnapshotError {
        let mut program = program.clone();
        if let Some(HeapObject {
            body: ObjectBody::Array { elements },
            ..
        }) = program.heap.get_mut(program.roots.dispatch_table)
        {
            edit(elements);
        }
        Program::from_json(&program.to_json().unwrap()).unwrap_err()
    }

    #[test]
    fn dispatch_table_must_hold_entries_for_every_selector_row() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        let add = builder.selector(1);
        asm.load_literal(3).load_literal(4).invoke(Opcode::InvokeAdd, add).emit(Opcode::Return);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();

        let err = reload_with_table(&program, |elements| *elements = vec![Value::Smi(0)]);
        assert!(matches!(&err, SnapshotError::Malformed(message) if message.contains("slot 0")), "{err}");

        let err = reload_with_table(&program, |elements| elements.truncate(2));
        assert!(matches!(&err, SnapshotError::Malformed(message) if message.contains("2 slots")), "{err}");

        let err = reload_with_table(&program, |elements| {
            let last = elements.len() - 1;
            elements[last] = Value::Object(main);
        });
        assert!(matches!(err, SnapshotError::Malformed(_)));

        let mut program = program;
        program.roots.dispatch_table = main;
        let err = Program::from_json(&program.to_json().unwrap()).unwrap_err();
        assert!(matches!(&err, SnapshotError::Malformed(message) if message.contains("not an array")), "{err}");
    }
}
