//! Immutable byte strings and mutable buffers
//!
//! `StrData` backs both the string and symbol value variants; which one a
//! given object is lives in its block header's type tag, and the two are
//! interned in separate namespaces (the stored hash is salted by type).
//! Keywords are not a distinct heap type: a keyword is a symbol whose
//! first byte is `:`.

use crate::heap::GcHeader;

/// Immutable, interned byte string. Shared by the string and symbol types.
#[repr(C)]
pub struct StrData {
    pub header: GcHeader,
    /// Value-level hash (type-salted), computed at construction.
    pub hash: u32,
    bytes: Box<[u8]>,
}

impl StrData {
    pub(crate) fn new(hash: u32, bytes: Box<[u8]>) -> StrData {
        StrData {
            header: GcHeader::new(),
            hash,
            bytes,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view, for messages and debugging.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Mutable byte buffer. Identity equality, never interned.
#[repr(C)]
pub struct BufferData {
    pub header: GcHeader,
    pub bytes: Vec<u8>,
}

impl BufferData {
    pub(crate) fn new(bytes: Vec<u8>) -> BufferData {
        BufferData {
            header: GcHeader::new(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
