//! OpenCL C translator.
//!
//! Turns a checked [`KernelDescriptor`] into kernel source text. The
//! emitted program follows a fixed layout (see [`layout`]); method
//! bodies are emitted by [`emitter::FnEmitter`], which keeps the
//! source-level evaluation order by hoisting operands into function-local
//! temporaries wherever C would leave two side effects unsequenced.

mod emitter;
mod expr;
pub mod layout;

use crate::diagnostic::CompileError;
use crate::schema::KernelDescriptor;
use crate::typeck;

pub use layout::{kernel_params, KernelParam};

/// Compiled kernel text plus its content digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelSource {
    /// Name of the `__kernel` function.
    pub entry: String,
    pub text: String,
    /// blake3 digest of `text`, the program cache key.
    pub hash: blake3::Hash,
}

impl KernelSource {
    pub fn hash_hex(&self) -> String {
        self.hash.to_hex().to_string()
    }
}

/// Check `descriptor` and translate it to OpenCL C.
///
/// Identical descriptors produce byte-identical text. On error no
/// partial source is returned.
pub fn compile_kernel(descriptor: &KernelDescriptor) -> Result<KernelSource, CompileError> {
    typeck::check(descriptor)?;
    let text = layout::emit_program(descriptor)?;
    let hash = blake3::hash(text.as_bytes());
    tracing::debug!(
        kernel = descriptor.name(),
        methods = descriptor.methods().len(),
        bytes = text.len(),
        hash = %hash.to_hex(),
        "kernel source generated"
    );
    Ok(KernelSource {
        entry: descriptor.entry().to_string(),
        text,
        hash,
    })
}

/// Identifier-safe form of a kernel name, used to prefix helper
/// functions.
pub(crate) fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
