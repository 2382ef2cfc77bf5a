//! The Skein instruction set
//!
//! Instructions are 32-bit little-endian words with the opcode in the low
//! byte. The remaining three bytes are laid out per the opcode's argument
//! signature:
//!
//! | signature | layout |
//! |-----------|--------|
//! | `Zero`    | no arguments |
//! | `S`       | bits 8..32: one 24-bit register |
//! | `L`       | bits 8..32: 24-bit signed offset, relative to this instruction |
//! | `SS`      | bits 8..16: 8-bit register, bits 16..32: 16-bit register |
//! | `SL`      | 8-bit register, 16-bit signed offset |
//! | `ST`      | 8-bit register, 16-bit typeset bitmask |
//! | `SI`/`SU` | 8-bit register, 16-bit signed/unsigned immediate |
//! | `SC`/`SD` | 8-bit register, 16-bit constant/nested-def index |
//! | `SSS`     | three 8-bit registers |
//! | `SSI`/`SSU` | two 8-bit registers, signed/unsigned 8-bit immediate |
//! | `SES`     | 8-bit register, 8-bit environment index, 8-bit env slot |
//!
//! Registers `0xF0..=0xFF` are reserved as scratch: the compiler's slot
//! realization promotes values that cannot be addressed in 8 bits into
//! this band, and its allocator never places ordinary locals there.
//!
//! Shift counts are taken modulo 32. Integer arithmetic wraps on
//! overflow; integer division traps on a zero divisor and on
//! `i32::MIN / -1`.
//!
//! The opcode table is sorted by mnemonic and the enum discriminants
//! follow table order, so the same static table serves the assembler
//! (binary search by name), the disassembler, and the verifier.

use skein_core::function::FuncDef;
use std::fmt;

/// Operation codes. Discriminants equal the opcode's index in
/// [`OPCODE_TABLE`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Add = 0,
    AddImmediate,
    AddInteger,
    AddReal,
    Band,
    Bnot,
    Bor,
    Bxor,
    Call,
    Closure,
    Compare,
    Divide,
    DivideImmediate,
    DivideInteger,
    DivideReal,
    Equals,
    Error,
    Get,
    GetIndex,
    GreaterThan,
    Jump,
    JumpIf,
    JumpIfNot,
    LessThan,
    LoadConstant,
    LoadFalse,
    LoadInteger,
    LoadNil,
    LoadSelf,
    LoadTrue,
    LoadUpvalue,
    MoveFar,
    MoveNear,
    Multiply,
    MultiplyImmediate,
    MultiplyInteger,
    MultiplyReal,
    Noop,
    Push,
    Push2,
    Push3,
    PushArray,
    Put,
    PutIndex,
    Return,
    ReturnNil,
    SetUpvalue,
    ShiftLeft,
    ShiftLeftImmediate,
    ShiftRight,
    ShiftRightImmediate,
    ShiftRightUnsigned,
    ShiftRightUnsignedImmediate,
    Subtract,
    SubtractInteger,
    SubtractReal,
    Tailcall,
    Transfer,
    Typecheck,
}

/// Argument signature of an opcode (see the module table).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    Zero,
    S,
    L,
    SS,
    SL,
    ST,
    SI,
    SU,
    SC,
    SD,
    SSS,
    SSI,
    SSU,
    SES,
}

/// One row of the shared opcode table.
pub struct OpInfo {
    pub name: &'static str,
    pub op: OpCode,
    pub signature: Signature,
}

/// All opcodes, sorted by mnemonic; index equals opcode discriminant.
pub static OPCODE_TABLE: [OpInfo; 59] = [
    OpInfo { name: "add", op: OpCode::Add, signature: Signature::SSS },
    OpInfo { name: "add-immediate", op: OpCode::AddImmediate, signature: Signature::SSI },
    OpInfo { name: "add-integer", op: OpCode::AddInteger, signature: Signature::SSS },
    OpInfo { name: "add-real", op: OpCode::AddReal, signature: Signature::SSS },
    OpInfo { name: "band", op: OpCode::Band, signature: Signature::SSS },
    OpInfo { name: "bnot", op: OpCode::Bnot, signature: Signature::SS },
    OpInfo { name: "bor", op: OpCode::Bor, signature: Signature::SSS },
    OpInfo { name: "bxor", op: OpCode::Bxor, signature: Signature::SSS },
    OpInfo { name: "call", op: OpCode::Call, signature: Signature::SS },
    OpInfo { name: "closure", op: OpCode::Closure, signature: Signature::SD },
    OpInfo { name: "compare", op: OpCode::Compare, signature: Signature::SSS },
    OpInfo { name: "divide", op: OpCode::Divide, signature: Signature::SSS },
    OpInfo { name: "divide-immediate", op: OpCode::DivideImmediate, signature: Signature::SSI },
    OpInfo { name: "divide-integer", op: OpCode::DivideInteger, signature: Signature::SSS },
    OpInfo { name: "divide-real", op: OpCode::DivideReal, signature: Signature::SSS },
    OpInfo { name: "equals", op: OpCode::Equals, signature: Signature::SSS },
    OpInfo { name: "error", op: OpCode::Error, signature: Signature::S },
    OpInfo { name: "get", op: OpCode::Get, signature: Signature::SSS },
    OpInfo { name: "get-index", op: OpCode::GetIndex, signature: Signature::SSU },
    OpInfo { name: "greater-than", op: OpCode::GreaterThan, signature: Signature::SSS },
    OpInfo { name: "jump", op: OpCode::Jump, signature: Signature::L },
    OpInfo { name: "jump-if", op: OpCode::JumpIf, signature: Signature::SL },
    OpInfo { name: "jump-if-not", op: OpCode::JumpIfNot, signature: Signature::SL },
    OpInfo { name: "less-than", op: OpCode::LessThan, signature: Signature::SSS },
    OpInfo { name: "load-constant", op: OpCode::LoadConstant, signature: Signature::SC },
    OpInfo { name: "load-false", op: OpCode::LoadFalse, signature: Signature::S },
    OpInfo { name: "load-integer", op: OpCode::LoadInteger, signature: Signature::SI },
    OpInfo { name: "load-nil", op: OpCode::LoadNil, signature: Signature::S },
    OpInfo { name: "load-self", op: OpCode::LoadSelf, signature: Signature::S },
    OpInfo { name: "load-true", op: OpCode::LoadTrue, signature: Signature::S },
    OpInfo { name: "load-upvalue", op: OpCode::LoadUpvalue, signature: Signature::SES },
    OpInfo { name: "move-far", op: OpCode::MoveFar, signature: Signature::SS },
    OpInfo { name: "move-near", op: OpCode::MoveNear, signature: Signature::SS },
    OpInfo { name: "multiply", op: OpCode::Multiply, signature: Signature::SSS },
    OpInfo { name: "multiply-immediate", op: OpCode::MultiplyImmediate, signature: Signature::SSI },
    OpInfo { name: "multiply-integer", op: OpCode::MultiplyInteger, signature: Signature::SSS },
    OpInfo { name: "multiply-real", op: OpCode::MultiplyReal, signature: Signature::SSS },
    OpInfo { name: "noop", op: OpCode::Noop, signature: Signature::Zero },
    OpInfo { name: "push", op: OpCode::Push, signature: Signature::S },
    OpInfo { name: "push-2", op: OpCode::Push2, signature: Signature::SS },
    OpInfo { name: "push-3", op: OpCode::Push3, signature: Signature::SSS },
    OpInfo { name: "push-array", op: OpCode::PushArray, signature: Signature::S },
    OpInfo { name: "put", op: OpCode::Put, signature: Signature::SSS },
    OpInfo { name: "put-index", op: OpCode::PutIndex, signature: Signature::SSU },
    OpInfo { name: "return", op: OpCode::Return, signature: Signature::S },
    OpInfo { name: "return-nil", op: OpCode::ReturnNil, signature: Signature::Zero },
    OpInfo { name: "set-upvalue", op: OpCode::SetUpvalue, signature: Signature::SES },
    OpInfo { name: "shift-left", op: OpCode::ShiftLeft, signature: Signature::SSS },
    OpInfo { name: "shift-left-immediate", op: OpCode::ShiftLeftImmediate, signature: Signature::SSU },
    OpInfo { name: "shift-right", op: OpCode::ShiftRight, signature: Signature::SSS },
    OpInfo { name: "shift-right-immediate", op: OpCode::ShiftRightImmediate, signature: Signature::SSU },
    OpInfo { name: "shift-right-unsigned", op: OpCode::ShiftRightUnsigned, signature: Signature::SSS },
    OpInfo { name: "shift-right-unsigned-immediate", op: OpCode::ShiftRightUnsignedImmediate, signature: Signature::SSU },
    OpInfo { name: "subtract", op: OpCode::Subtract, signature: Signature::SSS },
    OpInfo { name: "subtract-integer", op: OpCode::SubtractInteger, signature: Signature::SSS },
    OpInfo { name: "subtract-real", op: OpCode::SubtractReal, signature: Signature::SSS },
    OpInfo { name: "tailcall", op: OpCode::Tailcall, signature: Signature::S },
    OpInfo { name: "transfer", op: OpCode::Transfer, signature: Signature::SSS },
    OpInfo { name: "typecheck", op: OpCode::Typecheck, signature: Signature::ST },
];

/// Table row for an opcode.
pub fn op_info(op: OpCode) -> &'static OpInfo {
    &OPCODE_TABLE[op as usize]
}

/// Resolve a mnemonic by binary search over the sorted table.
pub fn lookup_mnemonic(name: &str) -> Option<&'static OpInfo> {
    OPCODE_TABLE
        .binary_search_by(|row| row.name.cmp(name))
        .ok()
        .map(|i| &OPCODE_TABLE[i])
}

/// Decode an opcode byte.
pub fn decode_op(word: u32) -> Option<OpCode> {
    OPCODE_TABLE.get((word & 0xFF) as usize).map(|row| row.op)
}

// ---------------------------------------------------------------
// Field decoding
// ---------------------------------------------------------------

/// First 8-bit argument (bits 8..16).
pub fn arg_a(word: u32) -> usize {
    ((word >> 8) & 0xFF) as usize
}

/// Second 8-bit argument (bits 16..24).
pub fn arg_b(word: u32) -> usize {
    ((word >> 16) & 0xFF) as usize
}

/// Third 8-bit argument (bits 24..32).
pub fn arg_c(word: u32) -> usize {
    ((word >> 24) & 0xFF) as usize
}

/// Third argument as a signed 8-bit immediate.
pub fn arg_c_signed(word: u32) -> i32 {
    (word >> 24) as u8 as i8 as i32
}

/// 16-bit argument in the high half (bits 16..32).
pub fn arg_wide(word: u32) -> usize {
    (word >> 16) as usize
}

/// High half as a signed 16-bit immediate or offset.
pub fn arg_wide_signed(word: u32) -> i32 {
    (word >> 16) as u16 as i16 as i32
}

/// 24-bit argument (bits 8..32).
pub fn arg_long(word: u32) -> usize {
    (word >> 8) as usize
}

/// 24-bit signed offset (bits 8..32).
pub fn arg_long_signed(word: u32) -> i32 {
    ((word >> 8) as i32) << 8 >> 8
}

// ---------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------

pub fn encode0(op: OpCode) -> u32 {
    op as u32
}

/// One 24-bit register.
pub fn encode_s(op: OpCode, a: u32) -> u32 {
    op as u32 | (a & 0xFF_FFFF) << 8
}

/// 24-bit signed offset.
pub fn encode_l(op: OpCode, offset: i32) -> u32 {
    op as u32 | ((offset as u32) & 0xFF_FFFF) << 8
}

/// 8-bit register plus 16-bit register/index/typeset.
pub fn encode_ss(op: OpCode, a: u32, b: u32) -> u32 {
    op as u32 | (a & 0xFF) << 8 | (b & 0xFFFF) << 16
}

/// 8-bit register plus signed 16-bit immediate.
pub fn encode_si(op: OpCode, a: u32, imm: i32) -> u32 {
    op as u32 | (a & 0xFF) << 8 | ((imm as u32) & 0xFFFF) << 16
}

/// 8-bit register plus signed 16-bit offset.
pub fn encode_sl(op: OpCode, a: u32, offset: i32) -> u32 {
    encode_si(op, a, offset)
}

/// Three 8-bit arguments.
pub fn encode_sss(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
    op as u32 | (a & 0xFF) << 8 | (b & 0xFF) << 16 | (c & 0xFF) << 24
}

/// Two 8-bit registers plus a signed 8-bit immediate.
pub fn encode_ssi(op: OpCode, a: u32, b: u32, imm: i32) -> u32 {
    encode_sss(op, a, b, (imm as u32) & 0xFF)
}

// ---------------------------------------------------------------
// Verification
// ---------------------------------------------------------------

/// A function definition failed verification.
#[derive(Debug)]
pub struct VerifyError {
    /// Instruction index, when the failure is tied to one.
    pub index: Option<usize>,
    pub message: String,
}

impl VerifyError {
    fn at(index: usize, message: impl Into<String>) -> VerifyError {
        VerifyError {
            index: Some(index),
            message: message.into(),
        }
    }

    fn general(message: impl Into<String>) -> VerifyError {
        VerifyError {
            index: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "bytecode invalid at instruction {}: {}", i, self.message),
            None => write!(f, "bytecode invalid: {}", self.message),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Check the structural invariants of a function definition: every
/// register, constant, nested-def, environment, and jump reference in
/// range; slot count covering arity (plus the vararg slot); bytecode
/// non-empty and ending on a terminal instruction.
///
/// The assembler and image loader run this on everything they produce;
/// the VM assumes it holds.
pub fn verify(def: &FuncDef) -> Result<(), VerifyError> {
    if def.bytecode.is_empty() {
        return Err(VerifyError::general("empty bytecode"));
    }
    let min_slots = def.arity + if def.is_vararg() { 1 } else { 0 };
    if def.slotcount < min_slots {
        return Err(VerifyError::general(format!(
            "slot count {} does not cover arity {}",
            def.slotcount, min_slots
        )));
    }
    if def.slotcount > 0x1_0000 {
        return Err(VerifyError::general(format!(
            "slot count {} exceeds the addressable maximum",
            def.slotcount
        )));
    }
    let has_frame_ref = def.environments.contains(&skein_core::ENV_CREATING_FRAME);
    if has_frame_ref != def.needs_env() {
        return Err(VerifyError::general(
            "NEEDSENV flag disagrees with the environments table",
        ));
    }
    for (i, &e) in def.environments.iter().enumerate() {
        if e < skein_core::ENV_CREATING_FRAME {
            return Err(VerifyError::general(format!(
                "environment entry {} is negative ({})",
                i, e
            )));
        }
    }
    if !def.sourcemap.is_empty() && def.sourcemap.len() != def.bytecode.len() {
        return Err(VerifyError::general("sourcemap does not parallel bytecode"));
    }

    let len = def.bytecode.len();
    let slots = def.slotcount as usize;
    let reg = |i: usize, r: usize| -> Result<(), VerifyError> {
        if r >= slots {
            Err(VerifyError::at(i, format!("register {} out of range", r)))
        } else {
            Ok(())
        }
    };
    let target = |i: usize, offset: i32| -> Result<(), VerifyError> {
        let t = i as i64 + offset as i64;
        if t < 0 || t >= len as i64 {
            Err(VerifyError::at(i, format!("jump target {} out of range", t)))
        } else {
            Ok(())
        }
    };

    for (i, &word) in def.bytecode.iter().enumerate() {
        let op = decode_op(word)
            .ok_or_else(|| VerifyError::at(i, format!("unknown opcode {:#04x}", word & 0xFF)))?;
        match op_info(op).signature {
            Signature::Zero => {}
            Signature::S => reg(i, arg_long(word))?,
            Signature::L => target(i, arg_long_signed(word))?,
            Signature::SS => {
                reg(i, arg_a(word))?;
                reg(i, arg_wide(word))?;
            }
            Signature::SL => {
                reg(i, arg_a(word))?;
                target(i, arg_wide_signed(word))?;
            }
            Signature::ST | Signature::SI | Signature::SU => reg(i, arg_a(word))?,
            Signature::SC => {
                reg(i, arg_a(word))?;
                if arg_wide(word) >= def.constants.len() {
                    return Err(VerifyError::at(
                        i,
                        format!("constant {} out of range", arg_wide(word)),
                    ));
                }
            }
            Signature::SD => {
                reg(i, arg_a(word))?;
                if arg_wide(word) >= def.defs.len() {
                    return Err(VerifyError::at(
                        i,
                        format!("nested def {} out of range", arg_wide(word)),
                    ));
                }
            }
            Signature::SSS => {
                reg(i, arg_a(word))?;
                reg(i, arg_b(word))?;
                reg(i, arg_c(word))?;
            }
            Signature::SSI | Signature::SSU => {
                reg(i, arg_a(word))?;
                reg(i, arg_b(word))?;
            }
            Signature::SES => {
                reg(i, arg_a(word))?;
                if arg_b(word) >= def.environments.len() {
                    return Err(VerifyError::at(
                        i,
                        format!("environment {} out of range", arg_b(word)),
                    ));
                }
            }
        }
    }

    let last = def.bytecode[len - 1];
    match decode_op(last) {
        Some(
            OpCode::Return
            | OpCode::ReturnNil
            | OpCode::Tailcall
            | OpCode::Error
            | OpCode::Transfer,
        ) => Ok(()),
        _ => Err(VerifyError::at(
            len - 1,
            "bytecode does not end on a terminal instruction",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Value;

    #[test]
    fn test_opcode_table_is_sorted_and_indexed() {
        for pair in OPCODE_TABLE.windows(2) {
            assert!(pair[0].name < pair[1].name, "table must stay sorted");
        }
        for (i, row) in OPCODE_TABLE.iter().enumerate() {
            assert_eq!(row.op as usize, i, "{} out of position", row.name);
        }
    }

    #[test]
    fn test_lookup_mnemonic() {
        assert_eq!(lookup_mnemonic("add").unwrap().op, OpCode::Add);
        assert_eq!(lookup_mnemonic("typecheck").unwrap().op, OpCode::Typecheck);
        assert!(lookup_mnemonic("frobnicate").is_none());
    }

    #[test]
    fn test_signed_field_round_trip() {
        let w = encode_l(OpCode::Jump, -3);
        assert_eq!(arg_long_signed(w), -3);
        let w = encode_sl(OpCode::JumpIfNot, 7, -100);
        assert_eq!(arg_a(w), 7);
        assert_eq!(arg_wide_signed(w), -100);
        let w = encode_si(OpCode::LoadInteger, 2, -30000);
        assert_eq!(arg_wide_signed(w), -30000);
        let w = encode_ssi(OpCode::AddImmediate, 1, 2, -5);
        assert_eq!(arg_c_signed(w), -5);
    }

    fn minimal_def(bytecode: Vec<u32>) -> skein_core::FuncDef {
        skein_core::FuncDef {
            header: skein_core::GcHeader::new(),
            bytecode,
            constants: Vec::new(),
            defs: Vec::new(),
            environments: Vec::new(),
            flags: 0,
            arity: 0,
            slotcount: 1,
            name: Value::Nil,
            source: Value::Nil,
            sourcepath: Value::Nil,
            sourcemap: Vec::new(),
        }
    }

    #[test]
    fn test_verify_accepts_minimal_function() {
        let def = minimal_def(vec![encode_s(OpCode::LoadNil, 0), encode_s(OpCode::Return, 0)]);
        assert!(verify(&def).is_ok());
    }

    #[test]
    fn test_verify_rejects_bad_register() {
        let def = minimal_def(vec![encode_s(OpCode::LoadNil, 9), encode_s(OpCode::Return, 0)]);
        assert!(verify(&def).is_err());
    }

    #[test]
    fn test_verify_rejects_missing_terminator() {
        let def = minimal_def(vec![encode_s(OpCode::LoadNil, 0)]);
        assert!(verify(&def).is_err());
    }

    #[test]
    fn test_verify_rejects_out_of_range_jump() {
        let def = minimal_def(vec![encode_l(OpCode::Jump, 5), encode_s(OpCode::Return, 0)]);
        assert!(verify(&def).is_err());
    }

    #[test]
    fn test_verify_rejects_bad_constant() {
        let def = minimal_def(vec![encode_ss(OpCode::LoadConstant, 0, 0), encode_s(OpCode::Return, 0)]);
        assert!(verify(&def).is_err());
    }
}
