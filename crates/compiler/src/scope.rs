//! Lexical scopes, slots, and the register allocator
//!
//! A *slot* is the compiler's abstraction over a location holding a
//! value: a compile-time constant, a register in the current or an
//! ancestor frame (reached through an environment index), or a mutable
//! global carried as a one-element ref array. Scopes track named
//! bindings (a linear list; lookup volume never justifies more), the
//! occupied-register bitset, and the high-water mark that becomes the
//! function's slot count.
//!
//! Registers `0xF0..=0xFF` are never handed to ordinary locals: that band
//! is the scratch fallback the slot-realization helpers use when a value
//! must be promoted into an 8-bit-addressable register.

use skein_core::Value;

/// Slot flag: compile-time constant, no register.
pub const SLOT_CONSTANT: u32 = 0x01;
/// Slot flag: bound to a name.
pub const SLOT_NAMED: u32 = 0x02;
/// Slot flag: assignable via `varset!`.
pub const SLOT_MUTABLE: u32 = 0x04;
/// Slot flag: a mutable global carried as a one-element ref array.
pub const SLOT_REF: u32 = 0x08;
/// Slot flag: the expression already emitted its return (tail position).
pub const SLOT_RETURNED: u32 = 0x10;

/// Where a value lives during compilation.
#[derive(Copy, Clone, Debug)]
pub struct Slot {
    pub flags: u32,
    /// Register index; meaningless for pure constants.
    pub index: i32,
    /// `None` for the current frame, otherwise the environment index in
    /// the current function's environments table.
    pub envindex: Option<u32>,
    /// The constant payload, or the ref array for `SLOT_REF`.
    pub constant: Value,
}

impl Slot {
    pub fn constant(v: Value) -> Slot {
        Slot {
            flags: SLOT_CONSTANT,
            index: -1,
            envindex: None,
            constant: v,
        }
    }

    pub fn reference(array: Value) -> Slot {
        Slot {
            flags: SLOT_REF,
            index: -1,
            envindex: None,
            constant: array,
        }
    }

    pub fn register(index: i32) -> Slot {
        Slot {
            flags: 0,
            index,
            envindex: None,
            constant: Value::Nil,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.flags & SLOT_CONSTANT != 0
    }

    pub fn is_ref(&self) -> bool {
        self.flags & SLOT_REF != 0
    }

    pub fn is_mutable(&self) -> bool {
        self.flags & SLOT_MUTABLE != 0
    }

    pub fn has_returned(&self) -> bool {
        self.flags & SLOT_RETURNED != 0
    }

    /// A plain unnamed register in the current frame, safe to recycle
    /// once its value has been consumed.
    pub fn is_temporary(&self) -> bool {
        self.flags & (SLOT_CONSTANT | SLOT_NAMED | SLOT_REF) == 0
            && self.envindex.is_none()
            && self.index >= 0
    }
}

/// Scope flag: a function boundary for upvalue capture.
pub const SCOPE_FUNCTION: u32 = 0x01;
/// Scope flag: top level; defs register in the host environment.
pub const SCOPE_TOP: u32 = 0x02;
/// Scope flag: a nested function captured this scope's frame.
pub const SCOPE_ENV: u32 = 0x04;
/// Scope flag: dead code; emit, check, then roll back.
pub const SCOPE_UNUSED: u32 = 0x08;

/// Start of the reserved scratch register band.
pub const SCRATCH_LO: i32 = 0xF0;
/// End (inclusive) of the reserved scratch register band.
pub const SCRATCH_HI: i32 = 0xFF;

/// Highest register index the allocator will hand out.
const SLOT_LIMIT: i32 = 0xFFFF;

/// One lexical scope.
pub struct Scope {
    pub flags: u32,
    /// Named bindings, newest last; linear lookup by design.
    pub bindings: Vec<(Value, Slot)>,
    /// Occupied-register bitset; non-function scopes start from a copy
    /// of their parent's, so popping a scope frees its registers.
    occupied: Vec<u64>,
    /// Highest register index ever used; becomes the slot count.
    pub smax: i32,
}

impl Scope {
    pub fn new(flags: u32) -> Scope {
        Scope {
            flags,
            bindings: Vec::new(),
            occupied: Vec::new(),
            smax: -1,
        }
    }

    /// A child scope inside the same function shares the register state.
    pub fn nested(&self, flags: u32) -> Scope {
        Scope {
            flags,
            bindings: Vec::new(),
            occupied: self.occupied.clone(),
            smax: self.smax,
        }
    }

    pub fn is_function(&self) -> bool {
        self.flags & SCOPE_FUNCTION != 0
    }

    fn test(&self, index: i32) -> bool {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        self.occupied.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    fn set(&mut self, index: i32) {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        if word >= self.occupied.len() {
            self.occupied.resize(word + 1, 0);
        }
        self.occupied[word] |= 1 << bit;
        self.smax = self.smax.max(index);
    }

    /// Lowest free ordinary register, skipping the scratch band. Returns
    /// `None` only when the function exhausts the addressable range.
    pub fn allocate(&mut self) -> Option<i32> {
        let mut i = 0;
        while i <= SLOT_LIMIT {
            if i == SCRATCH_LO {
                i = SCRATCH_HI + 1;
                continue;
            }
            if !self.test(i) {
                self.set(i);
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// A register from the scratch band.
    pub fn allocate_scratch(&mut self) -> Option<i32> {
        for i in SCRATCH_LO..=SCRATCH_HI {
            if !self.test(i) {
                self.set(i);
                return Some(i);
            }
        }
        None
    }

    /// Claim a specific register (parameter binding).
    pub fn reserve(&mut self, index: i32) {
        self.set(index);
    }

    pub fn free(&mut self, index: i32) {
        if index >= 0 {
            let (word, bit) = (index as usize / 64, index as usize % 64);
            if word < self.occupied.len() {
                self.occupied[word] &= !(1 << bit);
            }
        }
    }

    pub fn bind(&mut self, name: Value, slot: Slot) {
        self.bindings.push((name, slot));
    }

    /// Innermost binding for `name` in this scope.
    pub fn resolve(&self, name: Value) -> Option<Slot> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n.equals(name))
            .map(|(_, s)| *s)
    }
}

/// Per-function accumulation state. One of these lives on the function
/// stack for every `SCOPE_FUNCTION` scope.
pub struct FuncState {
    pub bytecode: Vec<u32>,
    pub sourcemap: Vec<(u32, u32)>,
    pub constants: Vec<Value>,
    pub environments: Vec<i32>,
    pub defs: Vec<*mut skein_core::FuncDef>,
    pub name: Value,
    pub arity: u32,
    pub vararg: bool,
}

impl FuncState {
    pub fn new(name: Value) -> FuncState {
        FuncState {
            bytecode: Vec::new(),
            sourcemap: Vec::new(),
            constants: Vec::new(),
            environments: Vec::new(),
            defs: Vec::new(),
            name,
            arity: 0,
            vararg: false,
        }
    }

    /// Index of `value` in the constant table, adding it if new.
    pub fn constant_index(&mut self, value: Value) -> usize {
        match self.constants.iter().position(|c| c.equals(value)) {
            Some(i) => i,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        }
    }

    /// Index of an environments-table entry, adding it if new.
    pub fn environment_index(&mut self, entry: i32) -> usize {
        match self.environments.iter().position(|&e| e == entry) {
            Some(i) => i,
            None => {
                self.environments.push(entry);
                self.environments.len() - 1
            }
        }
    }
}
