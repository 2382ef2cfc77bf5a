//! Skein runtime: instruction set, VM, assembler, host ABI
//!
//! - `bytecode`: the 32-bit instruction word format, the shared opcode
//!   table, and the function-definition verifier
//! - `vm`: the dispatch loop, fiber resume/transfer, and indexed access
//! - `asm`: assembler and disassembler over the symbolic bytecode form
//! - `host`: host-function helpers and the aggregate constructors
//! - `serialize`: binary image format for compiled function definitions

pub mod asm;
pub mod bytecode;
pub mod host;
pub mod serialize;
pub mod vm;

// Re-export key entry points
pub use asm::{AsmError, assemble, disassemble};
pub use bytecode::{OPCODE_TABLE, OpCode, Signature, VerifyError, verify};
pub use serialize::{SerializeError, load_image, save_image};
pub use vm::{call, resume};
