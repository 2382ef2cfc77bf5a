//! Host function surface
//!
//! The aggregate constructor routines the compiler lowers literals onto,
//! plus the error builtin and a base environment for embedding. These are
//! ordinary [`CFunction`]s: they receive the calling fiber's argument
//! area and return a value or an error payload. Host code cannot suspend
//! the VM.

use skein_core::{Heap, Value};

/// `(array & elems)`: a mutable array of the arguments.
pub fn make_array(heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    Ok(heap.array(args.to_vec()))
}

/// `(tuple & elems)`: an interned tuple of the arguments.
pub fn make_tuple(heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    Ok(heap.tuple(args))
}

/// `(struct & kvs)`: an interned struct from alternating keys and values.
pub fn make_struct(heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    if args.len() % 2 != 0 {
        return Err(heap.cstring("struct expects an even number of arguments"));
    }
    let pairs: Vec<(Value, Value)> = args.chunks_exact(2).map(|c| (c[0], c[1])).collect();
    Ok(heap.struct_of(&pairs))
}

/// `(table & kvs)`: a mutable table from alternating keys and values.
pub fn make_table(heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    if args.len() % 2 != 0 {
        return Err(heap.cstring("table expects an even number of arguments"));
    }
    let pairs: Vec<(Value, Value)> = args.chunks_exact(2).map(|c| (c[0], c[1])).collect();
    Ok(heap.table_from(&pairs))
}

/// `(buffer & bytes)`: a mutable buffer from integer byte values.
pub fn make_buffer(heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    let mut bytes = Vec::with_capacity(args.len());
    for &a in args {
        match a {
            Value::Integer(b) => bytes.push(b as u8),
            _ => return Err(heap.cstring("buffer expects integer byte values")),
        }
    }
    Ok(heap.buffer(bytes))
}

/// `(error payload)`: raise the argument as an error on the calling
/// fiber.
pub fn raise_error(heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    let _ = heap;
    Err(args.first().copied().unwrap_or(Value::Nil))
}

/// A base environment table binding the constructor routines and the
/// error builtin. Hosts extend this with their own functions before
/// handing it to the compiler.
pub fn base_env(heap: &mut Heap) -> Value {
    let env = heap.table();
    let bindings: [(&str, skein_core::CFunction); 6] = [
        ("array", make_array),
        ("tuple", make_tuple),
        ("struct", make_struct),
        ("table", make_table),
        ("buffer", make_buffer),
        ("error", raise_error),
    ];
    if let Value::Table(p) = env {
        for (name, f) in bindings {
            let sym = heap.symbol(name);
            unsafe { (*p).put(sym, Value::CFunction(f)) };
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_struct_rejects_odd_arguments() {
        let mut heap = Heap::new();
        let k = heap.keyword("a");
        assert!(make_struct(&mut heap, &[k]).is_err());
        assert!(make_struct(&mut heap, &[k, Value::Integer(1)]).is_ok());
    }

    #[test]
    fn test_base_env_binds_constructors() {
        let mut heap = Heap::new();
        let env = base_env(&mut heap);
        let sym = heap.symbol("array");
        if let Value::Table(p) = env {
            let bound = unsafe { (*p).get(sym) };
            assert!(matches!(bound, Some(Value::CFunction(_))));
        } else {
            panic!("expected table env");
        }
    }
}
