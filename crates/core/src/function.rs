//! Compiled code units, closures, and captured environments
//!
//! A `FuncDef` is the immutable output of the compiler or assembler: the
//! bytecode plus everything it references. A `Function` is a closure: one
//! `FuncDef` shared by every instance, plus the concrete environments this
//! instance captured. A `FuncEnv` is either a live window into a fiber
//! frame or a closed copy of that frame's registers; the transition
//! happens at most once, when the owning frame is popped.

use crate::fiber::Fiber;
use crate::heap::GcHeader;
use crate::value::Value;

/// Reference to the creating frame in a `FuncDef::environments` entry.
/// Non-negative entries index the instantiating closure's environments.
pub const ENV_CREATING_FRAME: i32 = -1;

/// Immutable compiled function definition.
#[repr(C)]
pub struct FuncDef {
    pub header: GcHeader,
    /// 32-bit instruction words; non-empty, ends on a terminal instruction.
    pub bytecode: Vec<u32>,
    /// Literals referenced by `load-constant`.
    pub constants: Vec<Value>,
    /// Nested child definitions instantiated by `closure`.
    pub defs: Vec<*mut FuncDef>,
    /// Captured-environment descriptors; see [`ENV_CREATING_FRAME`].
    pub environments: Vec<i32>,
    pub flags: u32,
    pub arity: u32,
    /// Registers per frame; at least `arity`, plus one under `VARARG`.
    pub slotcount: u32,
    /// Function name (string) or nil.
    pub name: Value,
    /// Source text (string) or nil.
    pub source: Value,
    /// Source path (string) or nil.
    pub sourcepath: Value,
    /// Per-instruction (start, end) source byte ranges; empty or parallel
    /// to `bytecode`.
    pub sourcemap: Vec<(u32, u32)>,
}

impl FuncDef {
    /// Extra arguments are packed into a tuple at slot `arity`.
    pub const VARARG: u32 = 0x1;
    /// Instantiation captures the creating frame as environment data.
    pub const NEEDSENV: u32 = 0x2;

    pub fn is_vararg(&self) -> bool {
        self.flags & FuncDef::VARARG != 0
    }

    pub fn needs_env(&self) -> bool {
        self.flags & FuncDef::NEEDSENV != 0
    }
}

/// A closure: shared definition plus captured environments.
#[repr(C)]
pub struct Function {
    pub header: GcHeader,
    pub def: *mut FuncDef,
    pub envs: Box<[*mut FuncEnv]>,
}

/// Captured environment: live window or closed copy.
pub enum EnvKind {
    /// Values are read from `fiber`'s stack at `offset + i`.
    Live {
        fiber: *mut Fiber,
        offset: usize,
        len: usize,
    },
    /// Values were copied out when the owning frame was popped.
    Closed(Vec<Value>),
}

#[repr(C)]
pub struct FuncEnv {
    pub header: GcHeader,
    pub kind: EnvKind,
}

impl FuncEnv {
    pub fn len(&self) -> usize {
        match &self.kind {
            EnvKind::Live { len, .. } => *len,
            EnvKind::Closed(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read slot `index`, dispatching on live/closed state.
    ///
    /// # Safety
    /// A live environment's fiber must still be on the heap.
    pub unsafe fn get(&self, index: usize) -> Option<Value> {
        match &self.kind {
            EnvKind::Live { fiber, offset, len } => {
                if index >= *len {
                    return None;
                }
                unsafe { (&(*(*fiber)).data).get(offset + index).copied() }
            }
            EnvKind::Closed(values) => values.get(index).copied(),
        }
    }

    /// Write slot `index`; returns false when out of range.
    ///
    /// # Safety
    /// A live environment's fiber must still be on the heap.
    pub unsafe fn set(&mut self, index: usize, value: Value) -> bool {
        match &mut self.kind {
            EnvKind::Live { fiber, offset, len } => {
                if index >= *len {
                    return false;
                }
                match unsafe { (&mut (*(*fiber)).data).get_mut(*offset + index) } {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            EnvKind::Closed(values) => match values.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
        }
    }

    /// Transition live → closed by copying the owning frame's registers.
    /// Idempotent on an already-closed environment.
    pub fn close(&mut self, registers: &[Value]) {
        if let EnvKind::Live { .. } = self.kind {
            self.kind = EnvKind::Closed(registers.to_vec());
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.kind, EnvKind::Closed(_))
    }
}
