//! Native backend: compiles a frozen program snapshot to machine code.
//!
//! The pipeline materializes the heap into a static image, reconstructs the
//! control flow of every reachable bytecode function, emits backend IR,
//! optimizes and verifies it, lowers the tagged operations and finally hands
//! the module to Cranelift for an object file or an in-process run.

pub mod cfg;
pub mod clif;
pub mod constants;
pub mod emit;
mod error;
pub mod ir;
pub mod jit;
pub mod lower;
pub mod opt;
pub mod stack_diff;
pub mod verify;

pub use error::{
    NativeError, E_BYTECODE, E_CODEGEN, E_INTERNAL, E_IO, E_LOWERING, E_SNAPSHOT, E_STACK,
    E_UNSUPPORTED_OBJECT, E_VERIFY,
};
pub use jit::Execution;
pub use kiln_native_runtime as runtime;

use crate::constants::{Cell, Materializer};
use crate::emit::EmitContext;
use crate::error::{codegen_error, native_error, Result};
use crate::ir::{Module, NativeDecl, Stage};
use cranelift_codegen::isa::{self, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_object::{ObjectBuilder, ObjectModule};
use kiln_core::{NativeRegistry, Program};
use kiln_native_runtime::Process;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use target_lexicon::Triple;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Run the IR verifier before and after lowering.
    pub verify: bool,
    pub optimize: bool,
    /// Target triple; the host when `None`.
    pub target: Option<String>,
    pub pic: bool,
    pub module_name: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            verify: true,
            optimize: true,
            target: None,
            pic: false,
            module_name: kiln_core::TOOL_NAME.to_string(),
        }
    }
}

pub(crate) fn build_isa(target: Option<&str>, pic: bool) -> Result<OwnedTargetIsa> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("is_pic", if pic { "true" } else { "false" })
        .map_err(|err| codegen_error(format!("native isa flag error: {err}")))?;
    flag_builder
        .set("use_colocated_libcalls", "true")
        .map_err(|err| codegen_error(format!("native isa flag error: {err}")))?;
    let isa_builder = match target {
        Some(name) => {
            let triple = Triple::from_str(name)
                .map_err(|err| codegen_error(format!("invalid target '{name}': {err}")))?;
            isa::lookup(triple)
                .map_err(|err| codegen_error(format!("unsupported target '{name}': {err}")))?
        }
        None => cranelift_native::builder()
            .map_err(|err| codegen_error(format!("native isa builder failed: {err}")))?,
    };
    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|err| codegen_error(format!("native isa finish failed: {err}")))
}

/// Runs the whole pipeline up to and including lowering.
pub fn compile_module(program: &Program, options: &CompileOptions) -> Result<Module> {
    program.validate()?;
    let mut ctx = EmitContext::new(Materializer::new(program))?;
    let entry = ctx.materializer.function(program.roots.entry)?;
    let mut roots = Vec::new();
    for (name, id) in program.roots.iter() {
        let object = ctx.materializer.materialize_object(id).map_err(|err| {
            native_error(err.code, format!("root '{name}': {}", err.message))
        })?;
        roots.push(Cell::Object(object));
    }
    let static_fields = ctx.materializer.materialize_object(program.roots.static_fields)?;
    let boxed_class = ctx.materializer.materialize_object(program.roots.boxed_class)?;
    ctx.emit_pending()?;

    let bodies = ctx.bodies;
    let messages = ctx.messages;
    let (image, mut functions) = ctx.materializer.finish()?;
    for (index, body) in bodies {
        functions[index].body = Some(body);
    }
    let natives = program
        .natives
        .iter()
        .map(|(_, name)| NativeDecl {
            name: name.to_string(),
            symbol: NativeRegistry::symbol(name),
        })
        .collect();
    let mut module = Module {
        name: options.module_name.clone(),
        functions,
        natives,
        image,
        roots,
        entry,
        static_fields,
        boxed_class,
        messages,
        stage: Stage::Abstract,
    };
    log::debug!(
        "emitted {} functions for {} natives and {} roots",
        module.functions.len(),
        module.natives.len(),
        module.roots.len()
    );
    if options.verify {
        verify::verify_module(&module, Stage::Abstract)?;
    }
    if options.optimize {
        opt::run(&mut module);
    }
    lower::lower_module(&mut module)?;
    if options.verify {
        verify::verify_module(&module, Stage::Lowered)?;
    }
    log::trace!("{module}");
    Ok(module)
}

/// Compiles `program` to a relocatable object file.
pub fn emit_object(program: &Program, options: &CompileOptions) -> Result<Vec<u8>> {
    let module = compile_module(program, options)?;
    let isa = build_isa(options.target.as_deref(), options.pic)?;
    let builder = ObjectBuilder::new(isa, options.module_name.as_str(), cranelift_module::default_libcall_names())
        .map_err(|err| codegen_error(format!("native object builder failed: {err}")))?;
    let mut object = ObjectModule::new(builder);
    clif::define_module(&mut object, &module)?;
    let bytes = object
        .finish()
        .emit()
        .map_err(|err| codegen_error(format!("native object emit failed: {err}")))?;
    log::info!(
        "{}: {} functions, {} image bytes, {} object bytes",
        module.name,
        module.functions.len(),
        module.image.size,
        bytes.len()
    );
    Ok(bytes)
}

/// Writes `bytes` to `<out>.tmp` and renames it into place.
pub fn write_artifact(out: &Path, bytes: &[u8]) -> Result<()> {
    let mut staging = out.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    std::fs::write(&staging, bytes)
        .map_err(|err| native_error(E_IO, format!("cannot write {}: {err}", staging.display())))?;
    std::fs::rename(&staging, out).map_err(|err| {
        let _ = std::fs::remove_file(&staging);
        native_error(E_IO, format!("cannot move {} into place: {err}", out.display()))
    })
}

/// Compiles `program` and writes the object file to `out`. Nothing is left
/// at `out` when compilation fails.
pub fn write_object(program: &Program, options: &CompileOptions, out: &Path) -> Result<()> {
    let bytes = emit_object(program, options)?;
    write_artifact(out, &bytes)
}

/// Textual backend IR after lowering.
pub fn dump_ir(program: &Program, options: &CompileOptions) -> Result<String> {
    compile_module(program, options).map(|module| module.to_string())
}

/// Cranelift IR of every function, as handed to code generation.
pub fn dump_clif(program: &Program, options: &CompileOptions) -> Result<String> {
    let module = compile_module(program, options)?;
    let isa = build_isa(options.target.as_deref(), options.pic)?;
    let builder = ObjectBuilder::new(isa, options.module_name.as_str(), cranelift_module::default_libcall_names())
        .map_err(|err| codegen_error(format!("native object builder failed: {err}")))?;
    let mut object = ObjectModule::new(builder);
    let declared = clif::define_module_with_text(&mut object, &module)?;
    Ok(declared.text.unwrap_or_default())
}

/// Compiles and runs `program` in-process; answers the raw tagged result.
pub fn run(program: &Program) -> Result<i64> {
    run_with(program, &CompileOptions::default(), &mut Process::new()).map(|execution| execution.result)
}

pub fn run_with(program: &Program, options: &CompileOptions, process: &mut Process) -> Result<Execution> {
    if options.target.is_some() {
        return Err(codegen_error("in-process runs always target the host"));
    }
    let module = compile_module(program, options)?;
    jit::execute(&module, process)
}
