//! Integration tests for the VM: dispatch, calls, fibers, errors, GC
//! check points. Programs are built through the assembler so these also
//! exercise the shared opcode table end to end.

use skein_core::{FiberStatus, Heap, Type, Value};
use skein_runtime::{asm, vm};

fn ins(heap: &mut Heap, name: &str, args: &[i32]) -> Value {
    let mut elems = vec![heap.symbol(name)];
    elems.extend(args.iter().map(|&a| Value::Integer(a)));
    heap.tuple(&elems)
}

fn ins_v(heap: &mut Heap, name: &str, args: &[Value]) -> Value {
    let mut elems = vec![heap.symbol(name)];
    elems.extend_from_slice(args);
    heap.tuple(&elems)
}

fn source(heap: &mut Heap, entries: &[(&str, Value)]) -> Value {
    let pairs: Vec<(Value, Value)> = entries
        .iter()
        .map(|&(k, v)| (heap.keyword(k), v))
        .collect();
    heap.struct_of(&pairs)
}

fn function(heap: &mut Heap, input: Value) -> Value {
    let def = asm::assemble(heap, input).expect("assembles");
    heap.function(def, Box::new([]))
}

fn fiber_parts(v: Value) -> *mut skein_core::Fiber {
    match v {
        Value::Fiber(p) => p,
        _ => panic!("expected fiber"),
    }
}

#[test]
fn test_generic_arithmetic_promotes() {
    let mut heap = Heap::new();
    let body = [
        ins(&mut heap, "add", &[2, 0, 1]),
        ins(&mut heap, "return", &[2]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(2)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    let r = vm::call(&mut heap, func, &[Value::Integer(1), Value::Integer(2)]).unwrap();
    assert!(r.equals(Value::Integer(3)));
    let r = vm::call(&mut heap, func, &[Value::Integer(1), Value::Real(0.5)]).unwrap();
    assert!(r.equals(Value::Real(1.5)));
    let boom = vm::call(&mut heap, func, &[Value::Nil, Value::Integer(2)]);
    assert!(boom.is_err());
}

#[test]
fn test_division_errors_are_runtime_errors() {
    let mut heap = Heap::new();
    let body = [
        ins(&mut heap, "divide", &[2, 0, 1]),
        ins(&mut heap, "return", &[2]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(2)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    assert!(vm::call(&mut heap, func, &[Value::Integer(1), Value::Integer(0)]).is_err());
    assert!(
        vm::call(&mut heap, func, &[Value::Integer(i32::MIN), Value::Integer(-1)]).is_err()
    );
    // Real division by zero is IEEE, not an error.
    let inf = vm::call(&mut heap, func, &[Value::Real(1.0), Value::Real(0.0)]).unwrap();
    assert!(inf.equals(Value::Real(f64::INFINITY)));
}

#[test]
fn test_get_put_over_aggregates() {
    let mut heap = Heap::new();
    let body = [
        ins(&mut heap, "put", &[0, 1, 2]),
        ins(&mut heap, "get", &[3, 0, 1]),
        ins(&mut heap, "return", &[3]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(3)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);

    let table = heap.table();
    let key = heap.keyword("k");
    let r = vm::call(&mut heap, func, &[table, key, Value::Integer(9)]).unwrap();
    assert!(r.equals(Value::Integer(9)));

    // Arrays extend with nils on out-of-range puts.
    let arr = heap.array(vec![]);
    let r = vm::call(&mut heap, func, &[arr, Value::Integer(3), Value::Integer(7)]).unwrap();
    assert!(r.equals(Value::Integer(7)));
    if let Value::Array(p) = arr {
        unsafe {
            assert_eq!((*p).len(), 4);
            assert!((&(*p).elems)[0].is_nil());
        }
    }

    // Tuples are immutable: put errors.
    let tup = heap.tuple(&[Value::Integer(1)]);
    assert!(vm::call(&mut heap, func, &[tup, Value::Integer(0), Value::Nil]).is_err());
}

#[test]
fn test_typecheck_mask() {
    let mut heap = Heap::new();
    let mask = Type::Integer.bit() as i32;
    let body = [
        ins(&mut heap, "typecheck", &[0, mask]),
        ins(&mut heap, "return", &[0]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    assert!(vm::call(&mut heap, func, &[Value::Integer(1)]).is_ok());
    let s = heap.cstring("nope");
    assert!(vm::call(&mut heap, func, &[s]).is_err());
}

#[test]
fn test_calling_a_non_function_errors() {
    let mut heap = Heap::new();
    let body = [
        ins(&mut heap, "push", &[0]),
        ins(&mut heap, "call", &[1, 0]),
        ins(&mut heap, "return", &[1]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    assert!(vm::call(&mut heap, func, &[Value::Integer(3)]).is_err());
}

#[test]
fn test_host_function_call_and_error() {
    let mut heap = Heap::new();
    let body = [
        ins(&mut heap, "push", &[1]),
        ins(&mut heap, "call", &[2, 0]),
        ins(&mut heap, "return", &[2]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(2)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);

    fn double(_: &mut Heap, args: &[Value]) -> Result<Value, Value> {
        match args.first() {
            Some(&Value::Integer(i)) => Ok(Value::Integer(i * 2)),
            _ => Err(Value::Nil),
        }
    }
    let r = vm::call(
        &mut heap,
        func,
        &[Value::CFunction(double), Value::Integer(21)],
    )
    .unwrap();
    assert!(r.equals(Value::Integer(42)));

    let payload = heap.cstring("host says no");
    fn refuse(heap: &mut Heap, _: &[Value]) -> Result<Value, Value> {
        Err(heap.cstring("host says no"))
    }
    let err = vm::call(
        &mut heap,
        func,
        &[Value::CFunction(refuse), Value::Integer(0)],
    )
    .unwrap_err();
    assert!(err.equals(payload));
}

#[test]
fn test_fiber_transfer_round_trip() {
    let mut heap = Heap::new();
    // Yield 1 and 2 to the parent, then return 3.
    let body = [
        ins(&mut heap, "load-nil", &[1]),
        ins(&mut heap, "load-integer", &[2, 1]),
        ins(&mut heap, "transfer", &[3, 1, 2]),
        ins(&mut heap, "load-integer", &[2, 2]),
        ins(&mut heap, "transfer", &[3, 1, 2]),
        ins(&mut heap, "load-integer", &[2, 3]),
        ins(&mut heap, "return", &[2]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    let fiber = heap.fiber(func, 32);
    heap.root(fiber);
    let p = fiber_parts(fiber);

    let r = vm::resume(&mut heap, fiber, Value::Nil).unwrap();
    assert!(r.equals(Value::Integer(1)));
    assert_eq!(unsafe { (*p).status }, FiberStatus::Pending);

    let r = vm::resume(&mut heap, fiber, Value::Nil).unwrap();
    assert!(r.equals(Value::Integer(2)));

    let r = vm::resume(&mut heap, fiber, Value::Nil).unwrap();
    assert!(r.equals(Value::Integer(3)));
    assert_eq!(unsafe { (*p).status }, FiberStatus::Dead);

    // A terminal fiber cannot come back.
    assert!(vm::resume(&mut heap, fiber, Value::Nil).is_err());
}

#[test]
fn test_resume_delivers_value_at_transfer_site() {
    let mut heap = Heap::new();
    // Yield the argument, then return whatever the resume sent back.
    let body = [
        ins(&mut heap, "load-nil", &[1]),
        ins(&mut heap, "transfer", &[2, 1, 0]),
        ins(&mut heap, "return", &[2]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    let fiber = heap.fiber(func, 32);
    heap.root(fiber);

    let first = vm::resume(&mut heap, fiber, Value::Integer(11)).unwrap();
    assert!(first.equals(Value::Integer(11)));
    let second = vm::resume(&mut heap, fiber, Value::Integer(22)).unwrap();
    assert!(second.equals(Value::Integer(22)));
}

#[test]
fn test_error_propagates_to_parent_fiber() {
    let mut heap = Heap::new();
    let boom = heap.cstring("boom");

    let child_body = [
        ins(&mut heap, "load-constant", &[1, 0]),
        ins(&mut heap, "error", &[1]),
    ];
    let child_bytecode = heap.tuple(&child_body);
    let child_constants = heap.tuple(&[boom]);
    let child_input = source(
        &mut heap,
        &[
            ("arity", Value::Integer(1)),
            ("constants", child_constants),
            ("bytecode", child_bytecode),
        ],
    );
    let child_func = function(&mut heap, child_input);
    let child = heap.fiber(child_func, 32);
    heap.root(child);

    // Parent transfers into the child and returns what comes back.
    let parent_body = [
        ins(&mut heap, "load-nil", &[1]),
        ins(&mut heap, "transfer", &[2, 0, 1]),
        ins(&mut heap, "return", &[2]),
    ];
    let parent_bytecode = heap.tuple(&parent_body);
    let parent_input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", parent_bytecode)],
    );
    let parent_func = function(&mut heap, parent_input);

    let out = vm::call(&mut heap, parent_func, &[child]).unwrap();
    // The payload arrived at the parent's transfer site...
    assert!(out.equals(boom));
    // ...and the child's status and ret tell error from value.
    let p = fiber_parts(child);
    assert_eq!(unsafe { (*p).status }, FiberStatus::Error);
    assert!(unsafe { (*p).ret }.equals(boom));
}

#[test]
fn test_error_without_parent_surfaces_to_host() {
    let mut heap = Heap::new();
    let boom = heap.cstring("boom");
    let body = [
        ins(&mut heap, "load-constant", &[1, 0]),
        ins(&mut heap, "error", &[1]),
    ];
    let bytecode = heap.tuple(&body);
    let constants = heap.tuple(&[boom]);
    let input = source(
        &mut heap,
        &[
            ("arity", Value::Integer(1)),
            ("constants", constants),
            ("bytecode", bytecode),
        ],
    );
    let func = function(&mut heap, input);
    let fiber = heap.fiber(func, 32);
    heap.root(fiber);
    let err = vm::resume(&mut heap, fiber, Value::Nil).unwrap_err();
    assert!(err.equals(boom));
    let p = fiber_parts(fiber);
    assert_eq!(unsafe { (*p).status }, FiberStatus::Error);
}

#[test]
fn test_transfer_to_dead_fiber_errors() {
    let mut heap = Heap::new();
    let ret_body = [ins(&mut heap, "return", &[0])];
    let ret_bytecode = heap.tuple(&ret_body);
    let ret_input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", ret_bytecode)],
    );
    let ret_func = function(&mut heap, ret_input);
    let dead = heap.fiber(ret_func, 16);
    heap.root(dead);
    vm::resume(&mut heap, dead, Value::Nil).unwrap();

    let body = [
        ins(&mut heap, "load-nil", &[1]),
        ins(&mut heap, "transfer", &[2, 0, 1]),
        ins(&mut heap, "return", &[2]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", bytecode)],
    );
    let func = function(&mut heap, input);
    assert!(vm::call(&mut heap, func, &[dead]).is_err());
}

#[test]
fn test_closure_checkgc_survives_collection_pressure() {
    // A loop that allocates a closure per iteration under a tiny GC
    // interval: collections fire at the closure check point and must
    // not reclaim anything the frame still references.
    let mut heap = Heap::with_gc_interval(256);
    let child_body = [ins_v(&mut heap, "return-nil", &[])];
    let child_bytecode = heap.tuple(&child_body);
    let child = source(&mut heap, &[("bytecode", child_bytecode)]);
    let closures = heap.tuple(&[child]);
    let top = heap.symbol("top");
    let done = heap.symbol("done");
    let body = [
        ins(&mut heap, "load-integer", &[1, 0]),
        top,
        ins(&mut heap, "greater-than", &[2, 0, 1]),
        ins_v(&mut heap, "jump-if-not", &[Value::Integer(2), done]),
        ins(&mut heap, "closure", &[3, 0]),
        ins(&mut heap, "add-immediate", &[0, 0, -1]),
        ins_v(&mut heap, "jump", &[top]),
        done,
        ins(&mut heap, "return", &[0]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[
            ("arity", Value::Integer(1)),
            ("closures", closures),
            ("bytecode", bytecode),
        ],
    );
    let func = function(&mut heap, input);
    heap.root(func);
    let r = vm::call(&mut heap, func, &[Value::Integer(500)]).unwrap();
    assert!(r.equals(Value::Integer(0)));
    // The per-iteration garbage is gone after a final collection.
    heap.collect();
    assert!(heap.live_blocks() < 100);
}
