//! Skein compiler: parsed forms to bytecode function definitions
//!
//! The compiler consumes a form (a Skein value) plus a parallel source
//! map and produces a `FuncDef` the VM executes. It is a single pass:
//! scopes and register allocation in `scope`, source-range navigation in
//! `sourcemap`, value dispatch and slot realization in `compile`, and
//! the special forms in `specials`.

pub mod compile;
pub mod scope;
pub mod sourcemap;
mod specials;

// Re-export key entry points
pub use compile::{CompileError, Compiler, Opts, compile};
pub use scope::{Slot, SCRATCH_HI, SCRATCH_LO};
pub use sourcemap::SourceMap;
