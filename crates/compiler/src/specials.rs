//! Special forms
//!
//! Each form chooses slot strategy and emits through the shared
//! realization helpers in `compile`. All of them drain when the compiler
//! has already errored: the scope and function stacks stay balanced and
//! a placeholder slot flows out.

use crate::compile::{Compiler, Opts, symbol_text};
use crate::scope::{SCOPE_UNUSED, SLOT_RETURNED, Scope, Slot};
use crate::sourcemap::SourceMap;
use skein_core::Value;
use skein_runtime::bytecode::{self as bc, OpCode};

impl Compiler<'_> {
    pub(crate) fn compile_quote(&mut self, elems: &[Value]) -> Slot {
        if elems.len() != 2 {
            return self.fail("quote expects one argument");
        }
        Slot::constant(elems[1])
    }

    /// `(do expr ...)`: a scope-introducing block whose result is the
    /// last expression. Tail propagates to the last expression only; the
    /// rest compile for effect.
    pub(crate) fn compile_do(&mut self, elems: &[Value], map: SourceMap, opts: Opts) -> Slot {
        let body = &elems[1..];
        if body.is_empty() {
            return Slot::constant(Value::Nil);
        }
        // The result register must outlive the block's scope.
        let target = if !opts.tail && !opts.drop {
            Some(self.allocate())
        } else {
            None
        };
        self.push_scope(0);
        let mut result = Slot::constant(Value::Nil);
        for (i, &e) in body.iter().enumerate() {
            let last = i == body.len() - 1;
            let sub = if last { opts } else { Opts::drop() };
            let s = self.compile_value(e, map.index(i + 1), sub);
            if last {
                result = s;
            } else {
                self.free_slot(s);
            }
        }
        if let Some(t) = target {
            if !result.has_returned() {
                self.copy(Slot::register(t), result);
                self.free_slot(result);
                result = Slot::register(t);
            }
        }
        self.pop_scope();
        result
    }

    /// `(if cond then else?)`: a constant condition folds; the dead
    /// branch still compiles (it must be well-formed) inside an UNUSED
    /// scope and its bytecode rolls back.
    pub(crate) fn compile_if(&mut self, elems: &[Value], map: SourceMap, opts: Opts) -> Slot {
        if !(3..=4).contains(&elems.len()) {
            return self.fail("if expects a condition and one or two branches");
        }
        let cond = self.compile_value(elems[1], map.index(1), Opts::default());
        if self.errored() {
            return cond;
        }

        if cond.is_constant() {
            let (live, dead) = if cond.constant.is_truthy() { (2, 3) } else { (3, 2) };
            if let Some(&dead_form) = elems.get(dead) {
                let mark = self.here();
                self.push_scope(SCOPE_UNUSED);
                let s = self.compile_value(dead_form, map.index(dead), Opts::drop());
                self.free_slot(s);
                self.pop_scope();
                let f = self.func();
                f.bytecode.truncate(mark);
                f.sourcemap.truncate(mark);
            }
            return match elems.get(live) {
                Some(&live_form) => self.compile_value(live_form, map.index(live), opts),
                None => Slot::constant(Value::Nil),
            };
        }

        if opts.tail {
            let (creg, ctemp) = self.preread(cond, 0xFF);
            let branch = self.here();
            self.emit(bc::encode_sl(OpCode::JumpIfNot, creg as u32, 0));
            self.postread(creg, ctemp);
            self.free_slot(cond);
            self.push_scope(0);
            let s = self.compile_value(elems[2], map.index(2), opts);
            self.free_slot(s);
            self.pop_scope();
            self.patch_jump(branch, self.here());
            self.push_scope(0);
            match elems.get(3) {
                Some(&e) => {
                    let s = self.compile_value(e, map.index(3), opts);
                    self.free_slot(s);
                }
                None => self.emit(bc::encode0(OpCode::ReturnNil)),
            }
            self.pop_scope();
            let mut out = Slot::constant(Value::Nil);
            out.flags |= SLOT_RETURNED;
            return out;
        }

        if opts.drop {
            let (creg, ctemp) = self.preread(cond, 0xFF);
            let branch = self.here();
            self.emit(bc::encode_sl(OpCode::JumpIfNot, creg as u32, 0));
            self.postread(creg, ctemp);
            self.free_slot(cond);
            self.push_scope(0);
            let s = self.compile_value(elems[2], map.index(2), Opts::drop());
            self.free_slot(s);
            self.pop_scope();
            let out = self.here();
            self.emit(bc::encode_l(OpCode::Jump, 0));
            self.patch_jump(branch, self.here());
            self.push_scope(0);
            if let Some(&e) = elems.get(3) {
                let s = self.compile_value(e, map.index(3), Opts::drop());
                self.free_slot(s);
            }
            self.pop_scope();
            self.patch_jump(out, self.here());
            return Slot::constant(Value::Nil);
        }

        let target = self.allocate();
        let (creg, ctemp) = self.preread(cond, 0xFF);
        let branch = self.here();
        self.emit(bc::encode_sl(OpCode::JumpIfNot, creg as u32, 0));
        self.postread(creg, ctemp);
        self.free_slot(cond);
        self.push_scope(0);
        let s = self.compile_value(elems[2], map.index(2), Opts::default());
        self.copy(Slot::register(target), s);
        self.free_slot(s);
        self.pop_scope();
        let out = self.here();
        self.emit(bc::encode_l(OpCode::Jump, 0));
        self.patch_jump(branch, self.here());
        self.push_scope(0);
        match elems.get(3) {
            Some(&e) => {
                let s = self.compile_value(e, map.index(3), Opts::default());
                self.copy(Slot::register(target), s);
                self.free_slot(s);
            }
            None => self.copy(Slot::register(target), Slot::constant(Value::Nil)),
        }
        self.pop_scope();
        self.patch_jump(out, self.here());
        Slot::register(target)
    }

    /// `(while cond body ...)`: constant-false folds to nil;
    /// constant-true drops the per-iteration check.
    pub(crate) fn compile_while(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        if elems.len() < 2 {
            return self.fail("while expects a condition");
        }
        let start = self.here();
        self.push_scope(0);
        let cond = self.compile_value(elems[1], map.index(1), Opts::default());
        if self.errored() {
            self.pop_scope();
            return cond;
        }
        if cond.is_constant() && !cond.constant.is_truthy() {
            self.pop_scope();
            return Slot::constant(Value::Nil);
        }
        let check = if cond.is_constant() {
            None
        } else {
            let (creg, ctemp) = self.preread(cond, 0xFF);
            let at = self.here();
            self.emit(bc::encode_sl(OpCode::JumpIfNot, creg as u32, 0));
            self.postread(creg, ctemp);
            Some(at)
        };
        self.free_slot(cond);
        for (i, &e) in elems[2..].iter().enumerate() {
            let s = self.compile_value(e, map.index(2 + i), Opts::drop());
            self.free_slot(s);
        }
        let back = start as i64 - self.here() as i64;
        if !(-(1 << 23)..0).contains(&back) {
            return self.fail("loop body exceeds the jump range");
        }
        self.emit(bc::encode_l(OpCode::Jump, back as i32));
        if let Some(at) = check {
            self.patch_jump(at, self.here());
        }
        self.pop_scope();
        Slot::constant(Value::Nil)
    }

    /// `(def name value)`: at top level, emits registration of the value
    /// in the host environment (a put into the environment table) and
    /// binds the name for the rest of the unit; elsewhere binds the name
    /// to the value's slot.
    pub(crate) fn compile_def(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        if elems.len() != 3 {
            return self.fail("def expects a name and a value");
        }
        let name = elems[1];
        if !matches!(name, Value::Symbol(_)) || name.is_keyword() {
            return self.fail("def expects a symbol name");
        }
        let value = self.compile_value(elems[2], map.index(2), Opts::default());
        if self.errored() {
            return value;
        }
        if self.at_top_level() {
            let env = self.env;
            let (vreg, vtemp) = self.preread(value, 0xFF);
            let ereg = self.alloc_temp(0xFF);
            self.emit_load_constant(ereg, env);
            let (kreg, ktemp) = self.preread(Slot::constant(name), 0xFF);
            self.emit(bc::encode_sss(
                OpCode::Put,
                ereg as u32,
                kreg as u32,
                vreg as u32,
            ));
            self.postread(kreg, ktemp);
            self.free_register(ereg);
            self.postread(vreg, vtemp);
        }
        self.bind_named(name, value, false)
    }

    /// `(var name value)`: at top level, creates the one-element ref
    /// array at compile time, registers it in the host environment, and
    /// emits only the initial store; elsewhere copies into a fresh
    /// mutable local.
    pub(crate) fn compile_var(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        if elems.len() != 3 {
            return self.fail("var expects a name and a value");
        }
        let name = elems[1];
        if !matches!(name, Value::Symbol(_)) || name.is_keyword() {
            return self.fail("var expects a symbol name");
        }
        let value = self.compile_value(elems[2], map.index(2), Opts::default());
        if self.errored() {
            return value;
        }
        if self.at_top_level() {
            let array = self.heap.array(vec![Value::Nil]);
            if let Value::Table(p) = self.env {
                unsafe { (*p).put(name, array) };
            }
            let slot = Slot::reference(array);
            self.copy(slot, value);
            self.free_slot(value);
            slot
        } else {
            self.bind_named(name, value, true)
        }
    }

    /// `(varset! name value)`: the resolved slot must be mutable (local,
    /// upvalue, or global ref).
    pub(crate) fn compile_varset(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        if elems.len() != 3 {
            return self.fail("varset! expects a name and a value");
        }
        let name = elems[1];
        if !matches!(name, Value::Symbol(_)) || name.is_keyword() {
            return self.fail("varset! expects a symbol name");
        }
        let target = self.resolve_symbol(name);
        if self.errored() {
            return target;
        }
        if !target.is_ref() && !target.is_mutable() {
            return self.fail("cannot set an immutable binding");
        }
        let value = self.compile_value(elems[2], map.index(2), Opts::default());
        self.copy(target, value);
        self.free_slot(value);
        target
    }

    /// `(fn name? [params] body ...)`: compiles the body as a nested
    /// definition and emits `closure` into the result register. `&`
    /// before the last parameter marks varargs; a name binds inside the
    /// function for self-recursion via `load-self`.
    pub(crate) fn compile_fn(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        let mut idx = 1;
        let mut name = Value::Nil;
        if let Some(&n) = elems.get(idx) {
            if matches!(n, Value::Symbol(_)) && !n.is_keyword() {
                name = n;
                idx += 1;
            }
        }
        let params: Vec<Value> = match elems.get(idx) {
            Some(&Value::Tuple(p)) => unsafe { (*p).elems().to_vec() },
            Some(&Value::Array(p)) => unsafe { (*p).elems.clone() },
            _ => return self.fail("fn expects a parameter list"),
        };
        let body_start = idx + 1;

        self.funcs.push(crate::scope::FuncState::new(name));
        self.scopes.push(Scope::new(crate::scope::SCOPE_FUNCTION));

        let mut vararg = false;
        let mut arity: u32 = 0;
        let mut i = 0;
        while i < params.len() {
            let p = params[i];
            if symbol_text(p).as_deref() == Some("&") {
                if vararg || i + 2 != params.len() {
                    self.fail("& must come just before the last parameter");
                    break;
                }
                vararg = true;
                i += 1;
                continue;
            }
            if !matches!(p, Value::Symbol(_)) || p.is_keyword() {
                self.fail("parameters must be symbols");
                break;
            }
            let reg = self.allocate();
            let mut slot = Slot::register(reg);
            slot.flags |= crate::scope::SLOT_NAMED | crate::scope::SLOT_MUTABLE;
            self.scopes.last_mut().expect("function scope").bind(p, slot);
            if !vararg {
                arity += 1;
            }
            i += 1;
        }
        {
            let fs = self.func();
            fs.arity = arity;
            fs.vararg = vararg;
        }
        if !name.is_nil() {
            let reg = self.allocate();
            self.emit(bc::encode_s(OpCode::LoadSelf, reg as u32));
            let mut slot = Slot::register(reg);
            slot.flags |= crate::scope::SLOT_NAMED;
            self.scopes
                .last_mut()
                .expect("function scope")
                .bind(name, slot);
        }

        if body_start >= elems.len() {
            self.emit(bc::encode0(OpCode::ReturnNil));
        } else {
            for (j, &e) in elems[body_start..].iter().enumerate() {
                let last = body_start + j == elems.len() - 1;
                let sub = if last { Opts::tail() } else { Opts::drop() };
                let s = self.compile_value(e, map.index(body_start + j), sub);
                if !last {
                    self.free_slot(s);
                }
            }
        }

        let def = self.end_function();
        if self.errored() {
            return Slot::constant(Value::Nil);
        }
        let def_index = {
            let fs = self.func();
            fs.defs.push(def);
            fs.defs.len() - 1
        };
        if def_index > 0xFFFF {
            return self.fail("too many nested functions");
        }
        let dest = self.allocate();
        if dest <= 0xFF {
            self.emit(bc::encode_ss(OpCode::Closure, dest as u32, def_index as u32));
        } else {
            let s = self.allocate_scratch();
            self.emit(bc::encode_ss(OpCode::Closure, s as u32, def_index as u32));
            self.emit(bc::encode_ss(OpCode::MoveFar, s as u32, dest as u32));
            self.free_register(s);
        }
        Slot::register(dest)
    }

    /// `(transfer target value?)`: cooperative control transfer; the
    /// result is the value delivered back when this fiber resumes.
    pub(crate) fn compile_transfer(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        if !(2..=3).contains(&elems.len()) {
            return self.fail("transfer expects a target and an optional value");
        }
        let target = self.compile_value(elems[1], map.index(1), Opts::default());
        let value = match elems.get(2) {
            Some(&v) => self.compile_value(v, map.index(2), Opts::default()),
            None => Slot::constant(Value::Nil),
        };
        self.finish_transfer(target, value)
    }

    /// `(yield value?)`: transfer to the parent fiber.
    pub(crate) fn compile_yield(&mut self, elems: &[Value], map: SourceMap) -> Slot {
        if elems.len() > 2 {
            return self.fail("yield expects at most one value");
        }
        let value = match elems.get(1) {
            Some(&v) => self.compile_value(v, map.index(1), Opts::default()),
            None => Slot::constant(Value::Nil),
        };
        self.finish_transfer(Slot::constant(Value::Nil), value)
    }

    fn finish_transfer(&mut self, target: Slot, value: Slot) -> Slot {
        let (treg, ttemp) = self.preread(target, 0xFF);
        let (vreg, vtemp) = self.preread(value, 0xFF);
        let dest = self.allocate();
        if dest <= 0xFF {
            self.emit(bc::encode_sss(
                OpCode::Transfer,
                dest as u32,
                treg as u32,
                vreg as u32,
            ));
        } else {
            let s = self.allocate_scratch();
            self.emit(bc::encode_sss(
                OpCode::Transfer,
                s as u32,
                treg as u32,
                vreg as u32,
            ));
            self.emit(bc::encode_ss(OpCode::MoveFar, s as u32, dest as u32));
            self.free_register(s);
        }
        self.postread(vreg, vtemp);
        self.postread(treg, ttemp);
        self.free_slot(target);
        self.free_slot(value);
        Slot::register(dest)
    }
}
