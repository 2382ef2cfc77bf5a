//! Binary images of compiled function definitions
//!
//! A `FuncDef` tree converts to a `Typed*` mirror (owned data, no heap
//! pointers) which serde/bincode turn into a compact byte image. Loading
//! re-interns every constant on the target heap and runs the bytecode
//! verifier on each definition, so a corrupt or hand-edited image cannot
//! reach the VM.
//!
//! Only data serializes: functions, fibers, cfunctions, userdata, and the
//! mutable aggregates are rejected as constants with a typed error.

use crate::bytecode::{VerifyError, verify};
use serde::{Deserialize, Serialize};
use skein_core::{FuncDef, GcHeader, Heap, Value};
use std::fmt;

/// Error during image serialization/deserialization.
#[derive(Debug)]
pub enum SerializeError {
    /// A constant's type cannot be serialized (code or mutable state).
    UnsupportedConstant(&'static str),
    /// Bincode encoding/decoding error (preserves the original error).
    BincodeError(Box<bincode::Error>),
    /// A loaded definition failed bytecode verification.
    InvalidBytecode(VerifyError),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::UnsupportedConstant(ty) => {
                write!(f, "cannot serialize a {} constant", ty)
            }
            SerializeError::BincodeError(e) => write!(f, "bincode error: {}", e),
            SerializeError::InvalidBytecode(e) => write!(f, "invalid image: {}", e),
        }
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializeError::BincodeError(e) => Some(e.as_ref()),
            SerializeError::InvalidBytecode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::Error> for SerializeError {
    fn from(e: bincode::Error) -> Self {
        SerializeError::BincodeError(Box::new(e))
    }
}

impl From<VerifyError> for SerializeError {
    fn from(e: VerifyError) -> Self {
        SerializeError::InvalidBytecode(e)
    }
}

/// Serializable mirror of the immutable value subset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TypedValue {
    Nil,
    Bool(bool),
    Integer(i32),
    Real(f64),
    String(Vec<u8>),
    Symbol(Vec<u8>),
    Tuple(Vec<TypedValue>),
    Struct(Vec<(TypedValue, TypedValue)>),
}

impl TypedValue {
    /// Convert from a runtime value; code and mutable aggregates fail.
    pub fn from_value(value: Value) -> Result<TypedValue, SerializeError> {
        Ok(match value {
            Value::Nil => TypedValue::Nil,
            Value::Bool(b) => TypedValue::Bool(b),
            Value::Integer(i) => TypedValue::Integer(i),
            Value::Real(r) => TypedValue::Real(r),
            Value::String(p) => TypedValue::String(unsafe { (*p).as_bytes().to_vec() }),
            Value::Symbol(p) => TypedValue::Symbol(unsafe { (*p).as_bytes().to_vec() }),
            Value::Tuple(p) => {
                let mut elems = Vec::with_capacity(unsafe { (*p).len() });
                for &e in unsafe { (*p).elems() } {
                    elems.push(TypedValue::from_value(e)?);
                }
                TypedValue::Tuple(elems)
            }
            Value::Struct(p) => {
                let mut entries = Vec::with_capacity(unsafe { (*p).len() });
                for &(k, v) in unsafe { (*p).entries() } {
                    entries.push((TypedValue::from_value(k)?, TypedValue::from_value(v)?));
                }
                TypedValue::Struct(entries)
            }
            other => return Err(SerializeError::UnsupportedConstant(other.type_name())),
        })
    }

    /// Re-intern on the target heap.
    pub fn to_value(&self, heap: &mut Heap) -> Value {
        match self {
            TypedValue::Nil => Value::Nil,
            TypedValue::Bool(b) => Value::Bool(*b),
            TypedValue::Integer(i) => Value::Integer(*i),
            TypedValue::Real(r) => Value::Real(*r),
            TypedValue::String(bytes) => heap.string(bytes),
            TypedValue::Symbol(bytes) => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                heap.symbol(&text)
            }
            TypedValue::Tuple(elems) => {
                let values: Vec<Value> = elems.iter().map(|e| e.to_value(heap)).collect();
                heap.tuple(&values)
            }
            TypedValue::Struct(entries) => {
                let pairs: Vec<(Value, Value)> = entries
                    .iter()
                    .map(|(k, v)| (k.to_value(heap), v.to_value(heap)))
                    .collect();
                heap.struct_of(&pairs)
            }
        }
    }
}

/// Serializable mirror of a function definition tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypedFuncDef {
    pub bytecode: Vec<u32>,
    pub constants: Vec<TypedValue>,
    pub defs: Vec<TypedFuncDef>,
    pub environments: Vec<i32>,
    pub flags: u32,
    pub arity: u32,
    pub slotcount: u32,
    pub name: TypedValue,
    pub source: TypedValue,
    pub sourcepath: TypedValue,
    pub sourcemap: Vec<(u32, u32)>,
}

impl TypedFuncDef {
    pub fn from_def(def: &FuncDef) -> Result<TypedFuncDef, SerializeError> {
        let mut constants = Vec::with_capacity(def.constants.len());
        for &c in &def.constants {
            constants.push(TypedValue::from_value(c)?);
        }
        let mut defs = Vec::with_capacity(def.defs.len());
        for &child in &def.defs {
            defs.push(TypedFuncDef::from_def(unsafe { &*child })?);
        }
        Ok(TypedFuncDef {
            bytecode: def.bytecode.clone(),
            constants,
            defs,
            environments: def.environments.clone(),
            flags: def.flags,
            arity: def.arity,
            slotcount: def.slotcount,
            name: TypedValue::from_value(def.name)?,
            source: TypedValue::from_value(def.source)?,
            sourcepath: TypedValue::from_value(def.sourcepath)?,
            sourcemap: def.sourcemap.clone(),
        })
    }

    pub fn to_def(&self, heap: &mut Heap) -> Result<*mut FuncDef, SerializeError> {
        let mut defs = Vec::with_capacity(self.defs.len());
        for child in &self.defs {
            defs.push(child.to_def(heap)?);
        }
        let constants: Vec<Value> = self.constants.iter().map(|c| c.to_value(heap)).collect();
        let def = FuncDef {
            header: GcHeader::new(),
            bytecode: self.bytecode.clone(),
            constants,
            defs,
            environments: self.environments.clone(),
            flags: self.flags,
            arity: self.arity,
            slotcount: self.slotcount,
            name: self.name.to_value(heap),
            source: self.source.to_value(heap),
            sourcepath: self.sourcepath.to_value(heap),
            sourcemap: self.sourcemap.clone(),
        };
        verify(&def)?;
        Ok(heap.funcdef(def))
    }
}

/// Serialize a function definition tree into a binary image.
pub fn save_image(def: &FuncDef) -> Result<Vec<u8>, SerializeError> {
    let typed = TypedFuncDef::from_def(def)?;
    Ok(bincode::serialize(&typed)?)
}

/// Load a binary image onto a heap, verifying every definition.
///
/// The returned definition is unreachable until something holds it.
pub fn load_image(heap: &mut Heap, bytes: &[u8]) -> Result<*mut FuncDef, SerializeError> {
    let typed: TypedFuncDef = bincode::deserialize(bytes)?;
    typed.to_def(heap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_value_rejects_code() {
        let mut heap = Heap::new();
        let arr = heap.array(vec![]);
        assert!(matches!(
            TypedValue::from_value(arr),
            Err(SerializeError::UnsupportedConstant("array"))
        ));
    }

    #[test]
    fn test_typed_value_round_trips_immutables() {
        let mut heap = Heap::new();
        let k = heap.keyword("tag");
        let s = heap.cstring("text");
        let t = heap.tuple(&[k, s, Value::Integer(7), Value::Real(0.5)]);
        let typed = TypedValue::from_value(t).unwrap();
        let back = typed.to_value(&mut heap);
        // Interning makes the round trip pointer-identical.
        assert!(back.equals(t));
        match (back, t) {
            (Value::Tuple(a), Value::Tuple(b)) => assert_eq!(a, b),
            _ => panic!("expected tuples"),
        }
    }
}
