//! Assembler and disassembler
//!
//! Lossless round-trip between a symbolic description and a `FuncDef`.
//! The symbolic form is a struct (or table) keyed by keywords:
//!
//! ```text
//! {:name       string or symbol
//!  :arity      integer (default 0)
//!  :vararg     boolean (default false)
//!  :slotcount  integer minimum (optional; computed from references)
//!  :source     string            :sourcepath string
//!  :slots      (sym | (sym ...) ...)   aliases for slot indices
//!  :constants  (value | (quote v) | (def name v) ...)
//!  :environments (int ...)       -1 marks the creating frame
//!  :closures   (nested-input ...)
//!  :bytecode   (label-sym | (mnemonic arg ...) ...)
//!  :sourcemap  ((start end) ...) parallel to bytecode}
//! ```
//!
//! Labels resolve in two passes: the first counts instructions and
//! records label → index, the second encodes. Slot aliases and named
//! constants resolve eagerly. Mnemonics resolve by binary search over
//! the opcode table shared with the VM; every argument is checked
//! against its field's width and signedness.

use crate::bytecode::{
    self as bc, OpCode, Signature, VerifyError, lookup_mnemonic, op_info, verify,
};
use skein_core::{FuncDef, GcHeader, Heap, Value};
use std::collections::HashMap;
use std::fmt;

/// Assembly failed.
#[derive(Debug)]
pub struct AsmError {
    pub message: String,
}

impl AsmError {
    fn new(message: impl Into<String>) -> AsmError {
        AsmError {
            message: message.into(),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assembly failed: {}", self.message)
    }
}

impl std::error::Error for AsmError {}

impl From<VerifyError> for AsmError {
    fn from(e: VerifyError) -> AsmError {
        AsmError::new(e.to_string())
    }
}

/// Assemble a symbolic description into a function definition.
///
/// The returned definition is unreachable until something holds it (wrap
/// it in a function value or keep it out of collection windows).
pub fn assemble(heap: &mut Heap, input: Value) -> Result<*mut FuncDef, AsmError> {
    let name = mapping_get(heap, input, "name");
    let name = match name {
        Value::String(_) | Value::Symbol(_) | Value::Nil => name,
        _ => return Err(AsmError::new("name must be a string or symbol")),
    };
    let arity = match mapping_get(heap, input, "arity") {
        Value::Nil => 0,
        Value::Integer(n) if n >= 0 => n as u32,
        _ => return Err(AsmError::new("arity must be a non-negative integer")),
    };
    let vararg = mapping_get(heap, input, "vararg").is_truthy();
    let source = mapping_get(heap, input, "source");
    let sourcepath = mapping_get(heap, input, "sourcepath");

    let mut environments: Vec<i32> = Vec::new();
    for v in opt_seq(heap, input, "environments")? {
        match v {
            Value::Integer(e) if e >= -1 => environments.push(e),
            _ => return Err(AsmError::new("environment entries must be integers >= -1")),
        }
    }

    // Constants: raw values, (quote v) literals, (def name v) named.
    let mut constants: Vec<Value> = Vec::new();
    let mut constant_names: HashMap<String, usize> = HashMap::new();
    for entry in opt_seq(heap, input, "constants")? {
        match entry {
            Value::Tuple(p) => {
                let elems = unsafe { (*p).elems() };
                let head = elems.first().and_then(|&h| symbol_text(h));
                match head.as_deref() {
                    Some("quote") if elems.len() == 2 => constants.push(elems[1]),
                    Some("def") if elems.len() == 3 => {
                        let cname = symbol_text(elems[1])
                            .ok_or_else(|| AsmError::new("constant name must be a symbol"))?;
                        constant_names.insert(cname, constants.len());
                        constants.push(elems[2]);
                    }
                    _ => {
                        return Err(AsmError::new(
                            "tuple constants must be (quote v) or (def name v)",
                        ));
                    }
                }
            }
            v => constants.push(v),
        }
    }

    // Nested closures assemble recursively.
    let mut defs: Vec<*mut FuncDef> = Vec::new();
    for (i, child) in opt_seq(heap, input, "closures")?.into_iter().enumerate() {
        let def = assemble(heap, child)
            .map_err(|e| AsmError::new(format!("in closure {}: {}", i, e.message)))?;
        defs.push(def);
    }

    // Slot aliases: entry i names slot i, tuples name it several times.
    let mut slot_names: HashMap<String, usize> = HashMap::new();
    let mut max_slot: i64 = -1;
    for (i, entry) in opt_seq(heap, input, "slots")?.into_iter().enumerate() {
        match entry {
            Value::Symbol(_) => {
                let text = symbol_text(entry).expect("symbol entry");
                slot_names.insert(text, i);
                max_slot = max_slot.max(i as i64);
            }
            Value::Tuple(p) => {
                for &alias in unsafe { (*p).elems() } {
                    let text = symbol_text(alias)
                        .ok_or_else(|| AsmError::new("slot aliases must be symbols"))?;
                    slot_names.insert(text, i);
                }
                max_slot = max_slot.max(i as i64);
            }
            _ => return Err(AsmError::new("slot entries must be symbols or tuples")),
        }
    }

    // First pass over bytecode: labels to instruction indices.
    let body = opt_seq(heap, input, "bytecode")?;
    if body.is_empty() {
        return Err(AsmError::new("bytecode is required"));
    }
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut index = 0usize;
    for entry in &body {
        match entry {
            Value::Symbol(_) => {
                let text = symbol_text(*entry).expect("symbol entry");
                if labels.insert(text.clone(), index).is_some() {
                    return Err(AsmError::new(format!("duplicate label {}", text)));
                }
            }
            Value::Tuple(_) => index += 1,
            _ => {
                return Err(AsmError::new(
                    "bytecode entries must be label symbols or instruction tuples",
                ));
            }
        }
    }

    // Second pass: encode.
    let mut ctx = ArgContext {
        slot_names: &slot_names,
        constant_names: &constant_names,
        labels: &labels,
        max_slot,
    };
    let mut bytecode: Vec<u32> = Vec::with_capacity(index);
    for entry in &body {
        let p = match entry {
            Value::Tuple(p) => *p,
            _ => continue,
        };
        let elems = unsafe { (*p).elems() };
        let mnemonic = elems
            .first()
            .and_then(|&h| symbol_text(h))
            .ok_or_else(|| AsmError::new("instruction must start with a mnemonic symbol"))?;
        let row = lookup_mnemonic(&mnemonic)
            .ok_or_else(|| AsmError::new(format!("unknown mnemonic {}", mnemonic)))?;
        let word = encode_instruction(&mut ctx, row.op, row.signature, &elems[1..], bytecode.len())
            .map_err(|e| AsmError::new(format!("in ({} ...): {}", mnemonic, e.message)))?;
        bytecode.push(word);
    }

    // Optional sourcemap, parallel to bytecode.
    let mut sourcemap: Vec<(u32, u32)> = Vec::new();
    for entry in opt_seq(heap, input, "sourcemap")? {
        match entry {
            Value::Tuple(p) => {
                let elems = unsafe { (*p).elems() };
                match (elems.first(), elems.get(1)) {
                    (Some(&Value::Integer(s)), Some(&Value::Integer(e)))
                        if elems.len() == 2 && s >= 0 && e >= 0 =>
                    {
                        sourcemap.push((s as u32, e as u32));
                    }
                    _ => return Err(AsmError::new("sourcemap entries must be integer pairs")),
                }
            }
            _ => return Err(AsmError::new("sourcemap entries must be integer pairs")),
        }
    }

    let mut slotcount = (ctx.max_slot + 1).max(arity as i64 + if vararg { 1 } else { 0 }) as u32;
    if let Value::Integer(n) = mapping_get(heap, input, "slotcount") {
        if n >= 0 {
            slotcount = slotcount.max(n as u32);
        }
    }

    let mut flags = 0;
    if vararg {
        flags |= FuncDef::VARARG;
    }
    if environments.contains(&skein_core::ENV_CREATING_FRAME) {
        flags |= FuncDef::NEEDSENV;
    }

    let def = FuncDef {
        header: GcHeader::new(),
        bytecode,
        constants,
        defs,
        environments,
        flags,
        arity,
        slotcount,
        name,
        source,
        sourcepath,
        sourcemap,
    };
    verify(&def)?;
    Ok(heap.funcdef(def))
}

struct ArgContext<'a> {
    slot_names: &'a HashMap<String, usize>,
    constant_names: &'a HashMap<String, usize>,
    labels: &'a HashMap<String, usize>,
    max_slot: i64,
}

impl ArgContext<'_> {
    fn slot(&mut self, v: Value, max: i64) -> Result<u32, AsmError> {
        let idx = match v {
            Value::Integer(i) if i >= 0 => i as i64,
            Value::Symbol(_) => {
                let text = symbol_text(v).expect("symbol");
                *self
                    .slot_names
                    .get(&text)
                    .ok_or_else(|| AsmError::new(format!("unknown slot name {}", text)))?
                    as i64
            }
            _ => return Err(AsmError::new("expected a slot index or name")),
        };
        if idx > max {
            return Err(AsmError::new(format!(
                "slot {} does not fit the field (max {})",
                idx, max
            )));
        }
        self.max_slot = self.max_slot.max(idx);
        Ok(idx as u32)
    }

    fn label(&self, v: Value, at: usize, lo: i64, hi: i64) -> Result<i32, AsmError> {
        let offset = match v {
            Value::Integer(i) => i as i64,
            Value::Symbol(_) => {
                let text = symbol_text(v).expect("symbol");
                let target = *self
                    .labels
                    .get(&text)
                    .ok_or_else(|| AsmError::new(format!("unknown label {}", text)))?;
                target as i64 - at as i64
            }
            _ => return Err(AsmError::new("expected a label symbol or offset")),
        };
        if offset < lo || offset > hi {
            return Err(AsmError::new(format!("jump offset {} out of range", offset)));
        }
        Ok(offset as i32)
    }

    fn constant(&self, v: Value) -> Result<u32, AsmError> {
        match v {
            Value::Integer(i) if i >= 0 && i <= 0xFFFF => Ok(i as u32),
            Value::Symbol(_) => {
                let text = symbol_text(v).expect("symbol");
                self.constant_names
                    .get(&text)
                    .map(|&i| i as u32)
                    .ok_or_else(|| AsmError::new(format!("unknown constant name {}", text)))
            }
            _ => Err(AsmError::new("expected a constant index or name")),
        }
    }

    fn int(&self, v: Value, lo: i64, hi: i64, what: &str) -> Result<i64, AsmError> {
        match v {
            Value::Integer(i) if (i as i64) >= lo && (i as i64) <= hi => Ok(i as i64),
            _ => Err(AsmError::new(format!(
                "expected {} in {}..={}",
                what, lo, hi
            ))),
        }
    }
}

fn encode_instruction(
    ctx: &mut ArgContext<'_>,
    op: OpCode,
    signature: Signature,
    args: &[Value],
    at: usize,
) -> Result<u32, AsmError> {
    let want = match signature {
        Signature::Zero => 0,
        Signature::S | Signature::L => 1,
        Signature::SS
        | Signature::SL
        | Signature::ST
        | Signature::SI
        | Signature::SU
        | Signature::SC
        | Signature::SD => 2,
        Signature::SSS | Signature::SSI | Signature::SSU | Signature::SES => 3,
    };
    if args.len() != want {
        return Err(AsmError::new(format!(
            "expected {} arguments, got {}",
            want,
            args.len()
        )));
    }
    let word = match signature {
        Signature::Zero => bc::encode0(op),
        Signature::S => bc::encode_s(op, ctx.slot(args[0], 0xFF_FFFF)?),
        Signature::L => bc::encode_l(op, ctx.label(args[0], at, -(1 << 23), (1 << 23) - 1)?),
        Signature::SS => {
            let a = ctx.slot(args[0], 0xFF)?;
            let b = ctx.slot(args[1], 0xFFFF)?;
            bc::encode_ss(op, a, b)
        }
        Signature::SL => {
            let a = ctx.slot(args[0], 0xFF)?;
            let off = ctx.label(args[1], at, -(1 << 15), (1 << 15) - 1)?;
            bc::encode_sl(op, a, off)
        }
        Signature::ST => {
            let a = ctx.slot(args[0], 0xFF)?;
            let mask = ctx.int(args[1], 0, 0xFFFF, "a typeset mask")?;
            bc::encode_ss(op, a, mask as u32)
        }
        Signature::SI => {
            let a = ctx.slot(args[0], 0xFF)?;
            let imm = ctx.int(args[1], -(1 << 15), (1 << 15) - 1, "a signed immediate")?;
            bc::encode_si(op, a, imm as i32)
        }
        Signature::SU => {
            let a = ctx.slot(args[0], 0xFF)?;
            let imm = ctx.int(args[1], 0, 0xFFFF, "an unsigned immediate")?;
            bc::encode_ss(op, a, imm as u32)
        }
        Signature::SC => {
            let a = ctx.slot(args[0], 0xFF)?;
            bc::encode_ss(op, a, ctx.constant(args[1])?)
        }
        Signature::SD => {
            let a = ctx.slot(args[0], 0xFF)?;
            let d = ctx.int(args[1], 0, 0xFFFF, "a def index")?;
            bc::encode_ss(op, a, d as u32)
        }
        Signature::SSS => {
            let a = ctx.slot(args[0], 0xFF)?;
            let b = ctx.slot(args[1], 0xFF)?;
            let c = ctx.slot(args[2], 0xFF)?;
            bc::encode_sss(op, a, b, c)
        }
        Signature::SSI => {
            let a = ctx.slot(args[0], 0xFF)?;
            let b = ctx.slot(args[1], 0xFF)?;
            let imm = ctx.int(args[2], -128, 127, "a signed immediate")?;
            bc::encode_ssi(op, a, b, imm as i32)
        }
        Signature::SSU => {
            let a = ctx.slot(args[0], 0xFF)?;
            let b = ctx.slot(args[1], 0xFF)?;
            let imm = ctx.int(args[2], 0, 255, "an unsigned immediate")?;
            bc::encode_sss(op, a, b, imm as u32)
        }
        Signature::SES => {
            let a = ctx.slot(args[0], 0xFF)?;
            let e = ctx.int(args[1], 0, 0xFF, "an environment index")?;
            let s = ctx.int(args[2], 0, 0xFF, "an environment slot")?;
            bc::encode_sss(op, a, e as u32, s as u32)
        }
    };
    Ok(word)
}

/// Disassemble a function definition back into its symbolic form.
pub fn disassemble(heap: &mut Heap, def: &FuncDef) -> Value {
    let mut entries: Vec<(Value, Value)> = Vec::new();
    let put = |heap: &mut Heap, entries: &mut Vec<(Value, Value)>, key: &str, v: Value| {
        let k = heap.keyword(key);
        entries.push((k, v));
    };

    if !def.name.is_nil() {
        put(heap, &mut entries, "name", def.name);
    }
    put(heap, &mut entries, "arity", Value::Integer(def.arity as i32));
    put(heap, &mut entries, "vararg", Value::Bool(def.is_vararg()));
    put(
        heap,
        &mut entries,
        "slotcount",
        Value::Integer(def.slotcount as i32),
    );
    if !def.source.is_nil() {
        put(heap, &mut entries, "source", def.source);
    }
    if !def.sourcepath.is_nil() {
        put(heap, &mut entries, "sourcepath", def.sourcepath);
    }

    if !def.environments.is_empty() {
        let envs: Vec<Value> = def
            .environments
            .iter()
            .map(|&e| Value::Integer(e))
            .collect();
        let envs = heap.tuple(&envs);
        put(heap, &mut entries, "environments", envs);
    }

    if !def.constants.is_empty() {
        let quote = heap.symbol("quote");
        let mut consts: Vec<Value> = Vec::with_capacity(def.constants.len());
        for &c in &def.constants {
            // Tuples must be quoted or they would re-parse as forms.
            let wrapped = match c {
                Value::Tuple(_) => heap.tuple(&[quote, c]),
                _ => c,
            };
            consts.push(wrapped);
        }
        let consts = heap.tuple(&consts);
        put(heap, &mut entries, "constants", consts);
    }

    if !def.defs.is_empty() {
        let mut closures: Vec<Value> = Vec::with_capacity(def.defs.len());
        for &child in &def.defs {
            closures.push(disassemble(heap, unsafe { &*child }));
        }
        let closures = heap.tuple(&closures);
        put(heap, &mut entries, "closures", closures);
    }

    let mut instrs: Vec<Value> = Vec::with_capacity(def.bytecode.len());
    for &word in &def.bytecode {
        instrs.push(disassemble_word(heap, word));
    }
    let body = heap.tuple(&instrs);
    put(heap, &mut entries, "bytecode", body);

    if !def.sourcemap.is_empty() {
        let mut pairs: Vec<Value> = Vec::with_capacity(def.sourcemap.len());
        for &(s, e) in &def.sourcemap {
            let pair = heap.tuple(&[Value::Integer(s as i32), Value::Integer(e as i32)]);
            pairs.push(pair);
        }
        let map = heap.tuple(&pairs);
        put(heap, &mut entries, "sourcemap", map);
    }

    heap.struct_of(&entries)
}

fn disassemble_word(heap: &mut Heap, word: u32) -> Value {
    let op = match bc::decode_op(word) {
        Some(op) => op,
        None => {
            let sym = heap.symbol("invalid");
            return heap.tuple(&[sym, Value::Integer(word as i32)]);
        }
    };
    let row = op_info(op);
    let mnemonic = heap.symbol(row.name);
    let int = Value::Integer;
    let args: Vec<Value> = match row.signature {
        Signature::Zero => vec![],
        Signature::S => vec![int(bc::arg_long(word) as i32)],
        Signature::L => vec![int(bc::arg_long_signed(word))],
        Signature::SS | Signature::ST | Signature::SU | Signature::SC | Signature::SD => {
            vec![int(bc::arg_a(word) as i32), int(bc::arg_wide(word) as i32)]
        }
        Signature::SL | Signature::SI => {
            vec![int(bc::arg_a(word) as i32), int(bc::arg_wide_signed(word))]
        }
        Signature::SSS | Signature::SES | Signature::SSU => vec![
            int(bc::arg_a(word) as i32),
            int(bc::arg_b(word) as i32),
            int(bc::arg_c(word) as i32),
        ],
        Signature::SSI => vec![
            int(bc::arg_a(word) as i32),
            int(bc::arg_b(word) as i32),
            int(bc::arg_c_signed(word)),
        ],
    };
    let mut elems = Vec::with_capacity(1 + args.len());
    elems.push(mnemonic);
    elems.extend(args);
    heap.tuple(&elems)
}

// ---------------------------------------------------------------
// Symbolic-form helpers
// ---------------------------------------------------------------

fn mapping_get(heap: &mut Heap, input: Value, key: &str) -> Value {
    let k = heap.keyword(key);
    match input {
        Value::Struct(p) => unsafe { (*p).get(k) }.unwrap_or(Value::Nil),
        Value::Table(p) => unsafe { (*p).get(k) }.unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

/// A sequence-valued field: tuple or array, nil meaning absent.
fn opt_seq(heap: &mut Heap, input: Value, key: &str) -> Result<Vec<Value>, AsmError> {
    match mapping_get(heap, input, key) {
        Value::Nil => Ok(Vec::new()),
        Value::Tuple(p) => Ok(unsafe { (*p).elems() }.to_vec()),
        Value::Array(p) => Ok(unsafe { (*p).elems.clone() }),
        _ => Err(AsmError::new(format!("{} must be a tuple or array", key))),
    }
}

fn symbol_text(v: Value) -> Option<String> {
    match v {
        Value::Symbol(p) => Some(unsafe { (*p).to_string_lossy() }),
        _ => None,
    }
}
