//! The compiler: parsed forms to function definitions
//!
//! A single pass drives on value type: constants become constant slots,
//! symbols resolve through the scope stack (and then the host
//! environment), tuples dispatch to special forms or compile as calls,
//! and array/table/struct literals lower onto the host constructor
//! routines. Bytecode, constants, environments, and nested defs
//! accumulate per function on a function stack that parallels the
//! `SCOPE_FUNCTION` scopes.
//!
//! Errors are sticky: the first failure freezes the compiler, and every
//! later call becomes a no-op returning a placeholder slot. Deeply nested
//! helpers never unwind; control flow stays straight-line and the caller
//! reads one error with its source range.
//!
//! The compiler never triggers a collection, so intermediate definitions
//! stay valid until `finish` returns; callers should root the result
//! before collecting.

use crate::scope::{
    FuncState, SCOPE_FUNCTION, SCOPE_TOP, SLOT_MUTABLE, SLOT_NAMED, SLOT_RETURNED, Scope, Slot,
};
use crate::sourcemap::SourceMap;
use skein_core::{ENV_CREATING_FRAME, FuncDef, GcHeader, Heap, Value};
use skein_runtime::bytecode::{self as bc, OpCode};
use skein_runtime::host;
use std::fmt;
use tracing::debug;

/// A compile failure with its source byte range.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub start: u32,
    pub end: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error at {}..{}: {}", self.start, self.end, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Options threaded through value compilation. `tail` makes the
/// expression emit its own return; `drop` discards the result.
#[derive(Copy, Clone, Default)]
pub struct Opts {
    pub tail: bool,
    pub drop: bool,
}

impl Opts {
    pub fn tail() -> Opts {
        Opts { tail: true, drop: false }
    }

    pub fn drop() -> Opts {
        Opts { tail: false, drop: true }
    }
}

/// Compile one form against a host environment.
///
/// `mapping` is the source-map node parallel to `form` (nil for none);
/// `env` is a table mapping symbols to values, where a one-element array
/// marks a mutable global ref.
pub fn compile(
    heap: &mut Heap,
    env: Value,
    form: Value,
    mapping: Value,
) -> Result<*mut FuncDef, CompileError> {
    Compiler::new(heap, env).finish(form, mapping)
}

pub struct Compiler<'h> {
    pub(crate) heap: &'h mut Heap,
    pub(crate) env: Value,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) funcs: Vec<FuncState>,
    pub(crate) source: Value,
    pub(crate) sourcepath: Value,
    pub(crate) error: Option<CompileError>,
    pub(crate) map_stack: Vec<(u32, u32)>,
}

impl<'h> Compiler<'h> {
    pub fn new(heap: &'h mut Heap, env: Value) -> Compiler<'h> {
        Compiler {
            heap,
            env,
            scopes: Vec::new(),
            funcs: Vec::new(),
            source: Value::Nil,
            sourcepath: Value::Nil,
            error: None,
            map_stack: Vec::new(),
        }
    }

    /// Attach source text and path to every produced definition.
    pub fn set_source(&mut self, source: Value, sourcepath: Value) {
        self.source = source;
        self.sourcepath = sourcepath;
    }

    /// Compile `form` as the body of a top-level thunk.
    pub fn finish(mut self, form: Value, mapping: Value) -> Result<*mut FuncDef, CompileError> {
        self.funcs.push(FuncState::new(Value::Nil));
        self.scopes.push(Scope::new(SCOPE_FUNCTION | SCOPE_TOP));
        self.compile_value(form, SourceMap::new(mapping), Opts::tail());
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let def = self.end_function();
        debug!("compiled top-level form");
        Ok(def)
    }

    // ---------------------------------------------------------------
    // Error drain
    // ---------------------------------------------------------------

    pub(crate) fn errored(&self) -> bool {
        self.error.is_some()
    }

    /// Record the first error (with the current source range) and return
    /// a placeholder slot; every later helper call drains through.
    pub(crate) fn fail(&mut self, message: impl Into<String>) -> Slot {
        if self.error.is_none() {
            let (start, end) = self.map_stack.last().copied().unwrap_or((0, 0));
            self.error = Some(CompileError {
                message: message.into(),
                start,
                end,
            });
        }
        Slot::constant(Value::Nil)
    }

    // ---------------------------------------------------------------
    // Scopes and registers
    // ---------------------------------------------------------------

    pub(crate) fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("function state")
    }

    pub(crate) fn push_scope(&mut self, flags: u32) {
        let child = self.scopes.last().expect("scope").nested(flags);
        self.scopes.push(child);
    }

    /// Pop a non-function scope, propagating the register high-water
    /// mark so the enclosing function sees its true footprint.
    pub(crate) fn pop_scope(&mut self) {
        let scope = self.scopes.pop().expect("scope");
        debug_assert!(!scope.is_function(), "function scopes pop via end_function");
        let parent = self.scopes.last_mut().expect("parent scope");
        parent.smax = parent.smax.max(scope.smax);
    }

    pub(crate) fn allocate(&mut self) -> i32 {
        match self.scopes.last_mut().expect("scope").allocate() {
            Some(i) => i,
            None => {
                self.fail("function uses too many registers");
                0
            }
        }
    }

    pub(crate) fn allocate_scratch(&mut self) -> i32 {
        match self.scopes.last_mut().expect("scope").allocate_scratch() {
            Some(i) => i,
            None => {
                self.fail("scratch registers exhausted");
                crate::scope::SCRATCH_LO
            }
        }
    }

    pub(crate) fn free_register(&mut self, index: i32) {
        self.scopes.last_mut().expect("scope").free(index);
    }

    pub(crate) fn free_slot(&mut self, slot: Slot) {
        if slot.is_temporary() {
            self.free_register(slot.index);
        }
    }

    /// A register addressable within `max`, falling back to the scratch
    /// band when the allocator cannot satisfy the width.
    pub(crate) fn alloc_temp(&mut self, max: i32) -> i32 {
        let r = self.allocate();
        if r <= max {
            return r;
        }
        self.free_register(r);
        let s = self.allocate_scratch();
        if s > max {
            self.fail("cannot address a register within the instruction field");
        }
        s
    }

    // ---------------------------------------------------------------
    // Emission
    // ---------------------------------------------------------------

    pub(crate) fn emit(&mut self, word: u32) {
        let range = self.map_stack.last().copied().unwrap_or((0, 0));
        let f = self.funcs.last_mut().expect("function state");
        f.bytecode.push(word);
        f.sourcemap.push(range);
    }

    /// Next instruction index in the current function.
    pub(crate) fn here(&self) -> usize {
        self.funcs.last().expect("function state").bytecode.len()
    }

    /// Rewrite the jump at `at` to land on `target`.
    pub(crate) fn patch_jump(&mut self, at: usize, target: usize) {
        let offset = target as i64 - at as i64;
        let f = self.funcs.last_mut().expect("function state");
        let word = f.bytecode[at];
        let op = bc::decode_op(word).expect("patching an emitted jump");
        let patched = if op == OpCode::Jump {
            if !(-(1 << 23)..(1 << 23)).contains(&offset) {
                self.fail("jump distance exceeds the offset field");
                return;
            }
            bc::encode_l(op, offset as i32)
        } else {
            if !(-(1 << 15)..(1 << 15)).contains(&offset) {
                self.fail("jump distance exceeds the offset field");
                return;
            }
            bc::encode_sl(op, bc::arg_a(word) as u32, offset as i32)
        };
        self.funcs.last_mut().expect("function state").bytecode[at] = patched;
    }

    /// Load a constant value into an 8-bit-addressable register,
    /// choosing the cheapest load form.
    pub(crate) fn emit_load_constant(&mut self, reg: i32, value: Value) {
        let reg = reg as u32;
        match value {
            Value::Nil => self.emit(bc::encode_s(OpCode::LoadNil, reg)),
            Value::Bool(true) => self.emit(bc::encode_s(OpCode::LoadTrue, reg)),
            Value::Bool(false) => self.emit(bc::encode_s(OpCode::LoadFalse, reg)),
            Value::Integer(i) if (-0x8000..=0x7FFF).contains(&i) => {
                self.emit(bc::encode_si(OpCode::LoadInteger, reg, i))
            }
            v => {
                let idx = self.func().constant_index(v);
                if idx > 0xFFFF {
                    self.fail("constant table overflow");
                    return;
                }
                self.emit(bc::encode_ss(OpCode::LoadConstant, reg, idx as u32));
            }
        }
    }

    // ---------------------------------------------------------------
    // Slot realization
    // ---------------------------------------------------------------

    /// Materialize a slot into a register index `<= max`, emitting loads
    /// for constants, refs, and upvalues. Returns the register and
    /// whether it is a temporary `postread` must free.
    pub(crate) fn preread(&mut self, slot: Slot, max: i32) -> (i32, bool) {
        if self.errored() {
            return (0, false);
        }
        if slot.is_constant() {
            let reg = self.alloc_temp(max.min(0xFF));
            self.emit_load_constant(reg, slot.constant);
            (reg, true)
        } else if slot.is_ref() {
            let reg = self.alloc_temp(max.min(0xFF));
            self.emit_load_constant(reg, slot.constant);
            self.emit(bc::encode_sss(OpCode::GetIndex, reg as u32, reg as u32, 0));
            (reg, true)
        } else if let Some(e) = slot.envindex {
            if slot.index > 0xFF {
                self.fail("captured binding does not fit an environment slot");
                return (0, false);
            }
            let reg = self.alloc_temp(max.min(0xFF));
            self.emit(bc::encode_sss(
                OpCode::LoadUpvalue,
                reg as u32,
                e,
                slot.index as u32,
            ));
            (reg, true)
        } else if slot.index <= max {
            (slot.index, false)
        } else {
            let reg = self.alloc_temp(max.min(0xFF));
            self.emit(bc::encode_ss(OpCode::MoveNear, reg as u32, slot.index as u32));
            (reg, true)
        }
    }

    pub(crate) fn postread(&mut self, reg: i32, temp: bool) {
        if temp {
            self.free_register(reg);
        }
    }

    /// Move a slot's value into another slot with the correct fan-out
    /// (constant load, upvalue write, far move, ref-array store).
    pub(crate) fn copy(&mut self, dest: Slot, src: Slot) {
        if self.errored() {
            return;
        }
        if dest.is_ref() {
            let (sreg, stemp) = self.preread(src, 0xFF);
            let t = self.alloc_temp(0xFF);
            self.emit_load_constant(t, dest.constant);
            self.emit(bc::encode_sss(OpCode::PutIndex, t as u32, sreg as u32, 0));
            self.free_register(t);
            self.postread(sreg, stemp);
        } else if let Some(e) = dest.envindex {
            if dest.index > 0xFF {
                self.fail("captured binding does not fit an environment slot");
                return;
            }
            let (sreg, stemp) = self.preread(src, 0xFF);
            self.emit(bc::encode_sss(
                OpCode::SetUpvalue,
                sreg as u32,
                e,
                dest.index as u32,
            ));
            self.postread(sreg, stemp);
        } else if dest.index <= 0xFF {
            if src.is_constant() {
                self.emit_load_constant(dest.index, src.constant);
            } else if src.is_ref() {
                self.emit_load_constant(dest.index, src.constant);
                self.emit(bc::encode_sss(
                    OpCode::GetIndex,
                    dest.index as u32,
                    dest.index as u32,
                    0,
                ));
            } else if let Some(e) = src.envindex {
                if src.index > 0xFF {
                    self.fail("captured binding does not fit an environment slot");
                    return;
                }
                self.emit(bc::encode_sss(
                    OpCode::LoadUpvalue,
                    dest.index as u32,
                    e,
                    src.index as u32,
                ));
            } else if src.index != dest.index {
                self.emit(bc::encode_ss(
                    OpCode::MoveNear,
                    dest.index as u32,
                    src.index as u32,
                ));
            }
        } else {
            let (sreg, stemp) = self.preread(src, 0xFF);
            self.emit(bc::encode_ss(OpCode::MoveFar, sreg as u32, dest.index as u32));
            self.postread(sreg, stemp);
        }
    }

    // ---------------------------------------------------------------
    // Value compilation
    // ---------------------------------------------------------------

    pub(crate) fn compile_value(&mut self, form: Value, map: SourceMap, opts: Opts) -> Slot {
        if self.errored() {
            return Slot::constant(Value::Nil);
        }
        self.map_stack.push(map.range());
        let mut slot = match form {
            Value::Symbol(_) => {
                if form.is_keyword() {
                    Slot::constant(form)
                } else {
                    self.resolve_symbol(form)
                }
            }
            Value::Tuple(p) => self.compile_form(form, p, map, opts),
            Value::Array(p) => self.compile_array_literal(p, map, opts),
            Value::Table(_) | Value::Struct(_) => self.compile_map_literal(form, map, opts),
            _ => Slot::constant(form),
        };
        if opts.tail && !slot.has_returned() && !self.errored() {
            self.emit_return(slot);
            slot.flags |= SLOT_RETURNED;
        }
        self.map_stack.pop();
        slot
    }

    fn compile_form(
        &mut self,
        form: Value,
        tuple: *mut skein_core::TupleData,
        map: SourceMap,
        opts: Opts,
    ) -> Slot {
        let elems = unsafe { (*tuple).elems() };
        if elems.is_empty() {
            return Slot::constant(form);
        }
        let head = elems[0];
        if matches!(head, Value::Symbol(_)) && !head.is_keyword() {
            if let Some(text) = symbol_text(head) {
                match text.as_str() {
                    "quote" => return self.compile_quote(elems),
                    "def" => return self.compile_def(elems, map),
                    "var" => return self.compile_var(elems, map),
                    "varset!" => return self.compile_varset(elems, map),
                    "do" => return self.compile_do(elems, map, opts),
                    "if" => return self.compile_if(elems, map, opts),
                    "while" => return self.compile_while(elems, map),
                    "fn" => return self.compile_fn(elems, map),
                    "transfer" => return self.compile_transfer(elems, map),
                    "yield" => return self.compile_yield(elems, map),
                    _ => {}
                }
            }
        }
        self.compile_call(elems, map, opts)
    }

    fn compile_call(&mut self, elems: &[Value], map: SourceMap, opts: Opts) -> Slot {
        let callee = self.compile_value(elems[0], map.index(0), Opts::default());
        let mut args = Vec::with_capacity(elems.len() - 1);
        for (i, &arg) in elems[1..].iter().enumerate() {
            args.push(self.compile_value(arg, map.index(i + 1), Opts::default()));
        }
        self.finish_call(callee, args, opts)
    }

    fn compile_array_literal(
        &mut self,
        array: *mut skein_core::ArrayData,
        map: SourceMap,
        opts: Opts,
    ) -> Slot {
        let elems = unsafe { (*array).elems.clone() };
        let callee = Slot::constant(Value::CFunction(host::make_array));
        let mut args = Vec::with_capacity(elems.len());
        for (i, &e) in elems.iter().enumerate() {
            args.push(self.compile_value(e, map.index(i), Opts::default()));
        }
        self.finish_call(callee, args, opts)
    }

    fn compile_map_literal(&mut self, form: Value, map: SourceMap, opts: Opts) -> Slot {
        let (pairs, ctor): (Vec<(Value, Value)>, skein_core::CFunction) = match form {
            Value::Table(p) => (
                unsafe { (*p).map.iter().map(|(k, &v)| (k.0, v)).collect() },
                host::make_table,
            ),
            Value::Struct(p) => (unsafe { (*p).entries().to_vec() }, host::make_struct),
            _ => return self.fail("expected a map literal"),
        };
        let callee = Slot::constant(Value::CFunction(ctor));
        let mut args = Vec::with_capacity(pairs.len() * 2);
        for (k, v) in pairs {
            let (kmap, vmap) = map.for_key(k);
            args.push(self.compile_value(k, kmap, Opts::default()));
            args.push(self.compile_value(v, vmap, Opts::default()));
        }
        self.finish_call(callee, args, opts)
    }

    /// Push arguments in groups of three plus residue, then call or tail
    /// call the callee.
    pub(crate) fn finish_call(&mut self, callee: Slot, args: Vec<Slot>, opts: Opts) -> Slot {
        for chunk in args.chunks(3) {
            match chunk {
                [a, b, c] => {
                    let (ra, ta) = self.preread(*a, 0xFF);
                    let (rb, tb) = self.preread(*b, 0xFF);
                    let (rc, tc) = self.preread(*c, 0xFF);
                    self.emit(bc::encode_sss(
                        OpCode::Push3,
                        ra as u32,
                        rb as u32,
                        rc as u32,
                    ));
                    self.postread(rc, tc);
                    self.postread(rb, tb);
                    self.postread(ra, ta);
                }
                [a, b] => {
                    let (ra, ta) = self.preread(*a, 0xFF);
                    let (rb, tb) = self.preread(*b, 0xFFFF);
                    self.emit(bc::encode_ss(OpCode::Push2, ra as u32, rb as u32));
                    self.postread(rb, tb);
                    self.postread(ra, ta);
                }
                [a] => {
                    let (ra, ta) = self.preread(*a, 0xFF_FFFF);
                    self.emit(bc::encode_s(OpCode::Push, ra as u32));
                    self.postread(ra, ta);
                }
                _ => unreachable!("chunks of three"),
            }
        }
        for s in args {
            self.free_slot(s);
        }
        if opts.tail {
            let (creg, ctemp) = self.preread(callee, 0xFF_FFFF);
            self.emit(bc::encode_s(OpCode::Tailcall, creg as u32));
            self.postread(creg, ctemp);
            self.free_slot(callee);
            let mut out = Slot::constant(Value::Nil);
            out.flags |= SLOT_RETURNED;
            out
        } else {
            let (creg, ctemp) = self.preread(callee, 0xFFFF);
            let dest = self.allocate();
            if dest <= 0xFF {
                self.emit(bc::encode_ss(OpCode::Call, dest as u32, creg as u32));
            } else {
                let s = self.allocate_scratch();
                self.emit(bc::encode_ss(OpCode::Call, s as u32, creg as u32));
                self.emit(bc::encode_ss(OpCode::MoveFar, s as u32, dest as u32));
                self.free_register(s);
            }
            self.postread(creg, ctemp);
            self.free_slot(callee);
            Slot::register(dest)
        }
    }

    pub(crate) fn emit_return(&mut self, slot: Slot) {
        if slot.is_constant() && slot.constant.is_nil() {
            self.emit(bc::encode0(OpCode::ReturnNil));
            return;
        }
        let (reg, temp) = self.preread(slot, 0xFF_FFFF);
        self.emit(bc::encode_s(OpCode::Return, reg as u32));
        self.postread(reg, temp);
    }

    // ---------------------------------------------------------------
    // Symbol resolution
    // ---------------------------------------------------------------

    /// Walk scopes innermost outward; crossing a function boundary turns
    /// a hit into an upvalue, threading environment descriptors through
    /// every intervening function. A miss falls through to the host
    /// environment.
    pub(crate) fn resolve_symbol(&mut self, sym: Value) -> Slot {
        let mut func_idx = self.funcs.len() - 1;
        let mut found: Option<(usize, usize, Slot)> = None;
        for si in (0..self.scopes.len()).rev() {
            if let Some(slot) = self.scopes[si].resolve(sym) {
                found = Some((si, func_idx, slot));
                break;
            }
            if self.scopes[si].is_function() && func_idx > 0 {
                func_idx -= 1;
            }
        }
        if let Some((si, owner, slot)) = found {
            if owner == self.funcs.len() - 1 {
                return slot;
            }
            // Captured: the owner's frame must be closurized.
            let fscope = (0..=si)
                .rev()
                .find(|&j| self.scopes[j].is_function())
                .expect("binding scope has an owning function");
            self.scopes[fscope].flags |= crate::scope::SCOPE_ENV;
            if slot.index > 0xFF {
                return self.fail("captured binding does not fit an environment slot");
            }
            let mut entry = ENV_CREATING_FRAME;
            for fi in (owner + 1)..self.funcs.len() {
                let idx = self.funcs[fi].environment_index(entry);
                if idx > 0xFF {
                    return self.fail("environment table overflow");
                }
                entry = idx as i32;
            }
            return Slot {
                flags: slot.flags & (SLOT_NAMED | SLOT_MUTABLE),
                index: slot.index,
                envindex: Some(entry as u32),
                constant: Value::Nil,
            };
        }
        // Host environment: a one-element array is a mutable global ref.
        let global = match self.env {
            Value::Table(p) => unsafe { (*p).get(sym) },
            Value::Struct(p) => unsafe { (*p).get(sym) },
            _ => None,
        };
        match global {
            Some(v) => match v {
                Value::Array(p) if unsafe { (*p).len() } == 1 => Slot::reference(v),
                _ => Slot::constant(v),
            },
            None => {
                let name = symbol_text(sym).unwrap_or_default();
                self.fail(format!("unknown symbol {}", name))
            }
        }
    }

    /// Whether the innermost function is the top-level one.
    pub(crate) fn at_top_level(&self) -> bool {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.is_function())
            .is_some_and(|s| s.flags & SCOPE_TOP != 0)
    }

    /// Bind `name` to the value, claiming a register owned by the
    /// current scope.
    pub(crate) fn bind_named(&mut self, name: Value, value: Slot, mutable: bool) -> Slot {
        let mut slot = if value.is_temporary() {
            value
        } else {
            let r = self.allocate();
            self.copy(Slot::register(r), value);
            self.free_slot(value);
            Slot::register(r)
        };
        slot.flags |= SLOT_NAMED | if mutable { SLOT_MUTABLE } else { 0 };
        self.scopes.last_mut().expect("scope").bind(name, slot);
        slot
    }

    // ---------------------------------------------------------------
    // Function finalization
    // ---------------------------------------------------------------

    /// Pop the current function scope and state into a finished
    /// definition on the heap.
    pub(crate) fn end_function(&mut self) -> *mut FuncDef {
        let scope = self.scopes.pop().expect("function scope");
        debug_assert!(scope.is_function());
        let fs = self.funcs.pop().expect("function state");
        let mut flags = 0;
        if fs.vararg {
            flags |= FuncDef::VARARG;
        }
        if fs.environments.contains(&ENV_CREATING_FRAME) {
            flags |= FuncDef::NEEDSENV;
        }
        let min_slots = fs.arity as i32 + if fs.vararg { 1 } else { 0 };
        let slotcount = (scope.smax + 1).max(min_slots).max(1) as u32;
        let mut bytecode = fs.bytecode;
        let mut sourcemap = fs.sourcemap;
        if bytecode.is_empty() {
            bytecode.push(bc::encode0(OpCode::ReturnNil));
            sourcemap.push((0, 0));
        }
        let def = FuncDef {
            header: GcHeader::new(),
            bytecode,
            constants: fs.constants,
            defs: fs.defs,
            environments: fs.environments,
            flags,
            arity: fs.arity,
            slotcount,
            name: fs.name,
            source: self.source,
            sourcepath: self.sourcepath,
            sourcemap,
        };
        self.heap.funcdef(def)
    }
}

pub(crate) fn symbol_text(v: Value) -> Option<String> {
    match v {
        Value::Symbol(p) => Some(unsafe { (*p).to_string_lossy() }),
        _ => None,
    }
}
