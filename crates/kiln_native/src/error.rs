use kiln_core::bytecode::DecodeError;
use kiln_core::{Diagnostic, SnapshotError};

pub const E_SNAPSHOT: &str = "E0500";
pub const E_UNSUPPORTED_OBJECT: &str = "E0501";
pub const E_BYTECODE: &str = "E0502";
pub const E_STACK: &str = "E0503";
pub const E_VERIFY: &str = "E0504";
pub const E_LOWERING: &str = "E0505";
pub const E_CODEGEN: &str = "E0506";
pub const E_IO: &str = "E0507";
pub const E_INTERNAL: &str = "E0508";

/// Fatal backend error. Nothing in the pipeline recovers from one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("error[{code}]: {message}")]
pub struct NativeError {
    pub code: &'static str,
    pub message: String,
}

impl NativeError {
    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.code, self.message.clone())
    }
}

pub(crate) fn native_error(code: &'static str, message: impl Into<String>) -> NativeError {
    NativeError {
        code,
        message: message.into(),
    }
}

pub(crate) fn internal_error(message: impl Into<String>) -> NativeError {
    native_error(E_INTERNAL, message)
}

pub(crate) fn codegen_error(message: impl Into<String>) -> NativeError {
    native_error(E_CODEGEN, message)
}

impl From<SnapshotError> for NativeError {
    fn from(err: SnapshotError) -> Self {
        native_error(E_SNAPSHOT, err.to_string())
    }
}

impl From<DecodeError> for NativeError {
    fn from(err: DecodeError) -> Self {
        native_error(E_BYTECODE, err.to_string())
    }
}

pub type Result<T, E = NativeError> = std::result::Result<T, E>;
