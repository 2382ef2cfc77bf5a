//! Source mappings parallel to form trees
//!
//! The reader hands the compiler a form (a value) and a mapping node
//! describing where each piece of the form came from. A mapping node is a
//! tuple whose first two elements are the byte range `(start end)`;
//! elements after those parallel the form's children. For map-shaped
//! forms (tables and structs) the children are `(key key-node value-node)`
//! triples, matched by key.
//!
//! Navigation never fails: a missing or malformed child inherits the
//! surrounding node, so every emitted instruction carries the tightest
//! range the input actually provides.

use skein_core::Value;

/// One node of the mapping tree. Copyable and nil-tolerant.
#[derive(Copy, Clone)]
pub struct SourceMap {
    node: Value,
}

impl SourceMap {
    pub fn new(node: Value) -> SourceMap {
        SourceMap { node }
    }

    /// The empty mapping: every range reads as (0, 0).
    pub fn none() -> SourceMap {
        SourceMap { node: Value::Nil }
    }

    /// Byte range of this node.
    pub fn range(&self) -> (u32, u32) {
        if let Value::Tuple(p) = self.node {
            let elems = unsafe { (*p).elems() };
            if let (Some(&Value::Integer(s)), Some(&Value::Integer(e))) =
                (elems.first(), elems.get(1))
            {
                if s >= 0 && e >= s {
                    return (s as u32, e as u32);
                }
            }
        }
        (0, 0)
    }

    /// Mapping for positional child `i`; inherits this node when absent.
    pub fn index(&self, i: usize) -> SourceMap {
        if let Value::Tuple(p) = self.node {
            if let Some(&child) = unsafe { (*p).elems() }.get(2 + i) {
                return SourceMap::new(child);
            }
        }
        *self
    }

    /// Mappings for a map-shaped form's key and value at `key`.
    pub fn for_key(&self, key: Value) -> (SourceMap, SourceMap) {
        if let Value::Tuple(p) = self.node {
            for &child in unsafe { (*p).elems() }.iter().skip(2) {
                if let Value::Tuple(c) = child {
                    let triple = unsafe { (*c).elems() };
                    if triple.len() == 3 && triple[0].equals(key) {
                        return (SourceMap::new(triple[1]), SourceMap::new(triple[2]));
                    }
                }
            }
        }
        (*self, *self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Heap;

    #[test]
    fn test_range_and_children() {
        let mut heap = Heap::new();
        let child = heap.tuple(&[Value::Integer(4), Value::Integer(6)]);
        let node = heap.tuple(&[Value::Integer(0), Value::Integer(10), child]);
        let map = SourceMap::new(node);
        assert_eq!(map.range(), (0, 10));
        assert_eq!(map.index(0).range(), (4, 6));
        // Missing child inherits the parent range.
        assert_eq!(map.index(5).range(), (0, 10));
    }

    #[test]
    fn test_nil_mapping_is_zero() {
        let map = SourceMap::none();
        assert_eq!(map.range(), (0, 0));
        assert_eq!(map.index(3).range(), (0, 0));
    }
}
