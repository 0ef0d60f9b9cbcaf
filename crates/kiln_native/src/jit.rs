//! In-process execution of a compiled module against `kiln_native_runtime`.

use crate::clif;
use crate::error::{codegen_error, internal_error, native_error, Result, E_INTERNAL};
use crate::ir::Module;
use cranelift_jit::{JITBuilder, JITModule};
use kiln_native_runtime::Process;

/// What a finished run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Raw tagged word returned by the entry function.
    pub result: i64,
    /// The root table as loaded, one tagged word per root.
    pub roots: Vec<u64>,
    pub image_start: u64,
}

impl Execution {
    /// The result decoded as a small integer, if it is one.
    pub fn smi(&self) -> Option<i64> {
        let word = self.result as u64;
        kiln_core::abi::is_smi(word).then(|| kiln_core::abi::smi_value(word))
    }
}

/// JIT-compiles `module`, points `process` at its image and calls the entry.
pub fn execute(module: &Module, process: &mut Process) -> Result<Execution> {
    let isa = crate::build_isa(None, false)?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    for (name, address) in kiln_native_runtime::symbols() {
        builder.symbol(name, address);
    }
    let mut jit = JITModule::new(builder);
    let declared = clif::define_module(&mut jit, module)?;
    jit.finalize_definitions()
        .map_err(|err| codegen_error(format!("native finalize failed: {err}")))?;

    let (image, _) = jit.get_finalized_data(declared.image);
    let image_start = image as u64;
    let (info, info_size) = jit.get_finalized_data(declared.info);
    // SAFETY: the root table is a finalized, 8-aligned data object of `info_size` bytes.
    let roots = unsafe { std::slice::from_raw_parts(info as *const u64, info_size / 8) }.to_vec();

    let tagged = |object| image_start + module.image.tagged_offset(object);
    process.statics = tagged(module.static_fields);
    process.boxed_class = tagged(module.boxed_class);
    process.failure_class = process.boxed_class;

    let entry_arity = module.functions[module.entry].arity;
    if entry_arity != 0 {
        return Err(internal_error(format!(
            "entry function takes {entry_arity} arguments; only argument-less entries can run"
        )));
    }
    let code = jit.get_finalized_function(declared.entry);
    // SAFETY: the entry was declared with the (process) -> tagged signature.
    let entry = unsafe { std::mem::transmute::<*const u8, extern "C-unwind" fn(*mut Process) -> i64>(code) };
    log::debug!("running {} with image at {image_start:#x}", module.name);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(process)))
        .map_err(|_| native_error(E_INTERNAL, "native code panicked"))?;
    log::info!("{} returned {result:#x} after {} collections", module.name, process.collections());
    Ok(Execution {
        result,
        roots,
        image_start,
    })
}
