//! Delegated shader compiler service.
//!
//! This workspace manages identity, selection, and swap-in/out of compiled
//! blobs; it never compiles or disassembles anything itself. The hot-reload
//! pipeline drives an external compiler through this trait (the production
//! implementation wraps the platform's D3D compiler DLL).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    /// The source failed to compile; `diagnostics` is the compiler's own error
    /// listing, surfaced verbatim to the operator.
    #[error("shader compilation failed ({model}): {diagnostics}")]
    Failed { model: String, diagnostics: String },
    /// The blob could not be disassembled or decompiled.
    #[error("bytecode translation failed: {0}")]
    Translate(String),
}

/// Compile + disassemble/decompile, as provided by the external compiler.
pub trait ShaderCompiler: Send + Sync {
    /// Compiles `source` with the given entry point and shader-model string
    /// (e.g. `"ps_3_0"`), returning the binary blob.
    fn compile(&self, source: &str, entry_point: &str, model: &str)
        -> Result<Vec<u8>, CompileError>;

    /// Produces an assembly listing for a binary blob.
    fn disassemble(&self, bytecode: &[u8]) -> Result<String, CompileError>;

    /// Produces editable high-level source for a binary blob.
    fn decompile(&self, bytecode: &[u8]) -> Result<String, CompileError>;
}
