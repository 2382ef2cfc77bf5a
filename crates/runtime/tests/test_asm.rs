//! Integration tests for the assembler and disassembler
//!
//! Covers the hello-world scenario (assemble, execute, observe the
//! constant come back), label resolution, the disassemble/assemble
//! round trip, and the assembler's rejection diagnostics.

use skein_core::{FuncDef, Heap, Value};
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

unsafe fn defs_equal(a: *mut FuncDef, b: *mut FuncDef) -> bool {
    unsafe {
        let (a, b) = (&*a, &*b);
        a.bytecode == b.bytecode
            && a.arity == b.arity
            && a.flags == b.flags
            && a.slotcount == b.slotcount
            && a.environments == b.environments
            && a.sourcemap == b.sourcemap
            && a.constants.len() == b.constants.len()
            && a.constants
                .iter()
                .zip(&b.constants)
                .all(|(x, y)| x.equals(*y))
            && a.defs.len() == b.defs.len()
            && a.defs
                .iter()
                .zip(&b.defs)
                .all(|(&x, &y)| defs_equal(x, y))
    }
}

#[test]
fn test_hello_returns_constant() {
    let mut heap = Heap::new();
    let hi = heap.cstring("hi");
    let body = [
        ins(&mut heap, "load-constant", &[0, 0]),
        ins(&mut heap, "return", &[0]),
    ];
    let bytecode = heap.tuple(&body);
    let constants = heap.tuple(&[hi]);
    let input = source(
        &mut heap,
        &[
            ("arity", Value::Integer(0)),
            ("bytecode", bytecode),
            ("constants", constants),
        ],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let func = heap.function(def, Box::new([]));
    let result = vm::call(&mut heap, func, &[]).expect("runs");
    assert!(result.equals(hi));
}

#[test]
fn test_labels_resolve_relative_to_instruction() {
    // Sum 0..=n with a backward jump through labels.
    let mut heap = Heap::new();
    let top = heap.symbol("top");
    let done = heap.symbol("done");
    let body = [
        ins(&mut heap, "load-integer", &[1, 0]),
        ins(&mut heap, "load-integer", &[2, 0]),
        top,
        ins(&mut heap, "greater-than", &[3, 0, 2]),
        ins_v(
            &mut heap,
            "jump-if-not",
            &[Value::Integer(3), done],
        ),
        ins(&mut heap, "add-integer", &[1, 1, 0]),
        ins(&mut heap, "add-immediate", &[0, 0, -1]),
        ins_v(&mut heap, "jump", &[top]),
        done,
        ins(&mut heap, "return", &[1]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("arity", Value::Integer(1)), ("bytecode", bytecode)],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let func = heap.function(def, Box::new([]));
    let result = vm::call(&mut heap, func, &[Value::Integer(10)]).expect("runs");
    assert!(result.equals(Value::Integer(55)));
}

#[test]
fn test_slot_aliases() {
    let mut heap = Heap::new();
    let n = heap.symbol("n");
    let out = heap.symbol("out");
    let slots = heap.tuple(&[n, out]);
    let body = [
        ins_v(
            &mut heap,
            "add-immediate",
            &[out, n, Value::Integer(5)],
        ),
        ins_v(&mut heap, "return", &[out]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[
            ("arity", Value::Integer(1)),
            ("slots", slots),
            ("bytecode", bytecode),
        ],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let func = heap.function(def, Box::new([]));
    let result = vm::call(&mut heap, func, &[Value::Integer(37)]).expect("runs");
    assert!(result.equals(Value::Integer(42)));
}

#[test]
fn test_named_constants() {
    let mut heap = Heap::new();
    let greeting = heap.symbol("greeting");
    let text = heap.cstring("hello world");
    let def_sym = heap.symbol("def");
    let named = heap.tuple(&[def_sym, greeting, text]);
    let constants = heap.tuple(&[named]);
    let body = [
        ins_v(
            &mut heap,
            "load-constant",
            &[Value::Integer(0), greeting],
        ),
        ins(&mut heap, "return", &[0]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(
        &mut heap,
        &[("constants", constants), ("bytecode", bytecode)],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let func = heap.function(def, Box::new([]));
    let result = vm::call(&mut heap, func, &[]).expect("runs");
    assert!(result.equals(text));
}

#[test]
fn test_closure_and_upvalue_round_trip() {
    let mut heap = Heap::new();
    // Child reads slot 0 of its creating frame.
    let child_body = [
        ins(&mut heap, "load-upvalue", &[0, 0, 0]),
        ins(&mut heap, "return", &[0]),
    ];
    let child_bytecode = heap.tuple(&child_body);
    let child_envs = heap.tuple(&[Value::Integer(-1)]);
    let child = source(
        &mut heap,
        &[
            ("environments", child_envs),
            ("bytecode", child_bytecode),
        ],
    );
    let closures = heap.tuple(&[child]);
    let parent_body = [
        ins(&mut heap, "closure", &[1, 0]),
        ins(&mut heap, "call", &[2, 1]),
        ins(&mut heap, "return", &[2]),
    ];
    let parent_bytecode = heap.tuple(&parent_body);
    let input = source(
        &mut heap,
        &[
            ("arity", Value::Integer(1)),
            ("closures", closures),
            ("bytecode", parent_bytecode),
        ],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let func = heap.function(def, Box::new([]));
    let result = vm::call(&mut heap, func, &[Value::Integer(42)]).expect("runs");
    assert!(result.equals(Value::Integer(42)));

    // And the definition survives a symbolic round trip bytewise.
    let symbolic = asm::disassemble(&mut heap, unsafe { &*def });
    let again = asm::assemble(&mut heap, symbolic).expect("reassembles");
    assert!(unsafe { defs_equal(def, again) });
}

#[test]
fn test_round_trip_with_sourcemap_and_vararg() {
    let mut heap = Heap::new();
    let quoted = heap.tuple(&[Value::Integer(1), Value::Integer(2)]);
    let body = [
        ins(&mut heap, "load-constant", &[1, 0]),
        ins(&mut heap, "return", &[1]),
    ];
    let bytecode = heap.tuple(&body);
    let constants = heap.tuple(&[quoted]);
    let sm0 = heap.tuple(&[Value::Integer(0), Value::Integer(4)]);
    let sm1 = heap.tuple(&[Value::Integer(5), Value::Integer(9)]);
    let sourcemap = heap.tuple(&[sm0, sm1]);
    let name = heap.cstring("rest-taker");
    let input = source(
        &mut heap,
        &[
            ("name", name),
            ("arity", Value::Integer(1)),
            ("vararg", Value::Bool(true)),
            ("constants", constants),
            ("bytecode", bytecode),
            ("sourcemap", sourcemap),
        ],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    unsafe {
        assert!((*def).is_vararg());
        assert_eq!((*def).sourcemap, vec![(0, 4), (5, 9)]);
        // A tuple constant survives (the disassembler quotes it).
        assert!((&(*def).constants)[0].equals(quoted));
    }
    let symbolic = asm::disassemble(&mut heap, unsafe { &*def });
    let again = asm::assemble(&mut heap, symbolic).expect("reassembles");
    assert!(unsafe { defs_equal(def, again) });
}

#[test]
fn test_rejects_unknown_mnemonic() {
    let mut heap = Heap::new();
    let body = [ins(&mut heap, "frobnicate", &[0])];
    let bytecode = heap.tuple(&body);
    let input = source(&mut heap, &[("bytecode", bytecode)]);
    let err = asm::assemble(&mut heap, input).unwrap_err();
    assert!(err.message.contains("frobnicate"));
}

#[test]
fn test_rejects_wide_register_in_narrow_field() {
    let mut heap = Heap::new();
    // add's first operand is an 8-bit field; 300 cannot fit.
    let body = [
        ins(&mut heap, "add", &[300, 0, 0]),
        ins(&mut heap, "return", &[0]),
    ];
    let bytecode = heap.tuple(&body);
    let input = source(&mut heap, &[("bytecode", bytecode)]);
    assert!(asm::assemble(&mut heap, input).is_err());
}

#[test]
fn test_rejects_unknown_label_and_missing_terminator() {
    let mut heap = Heap::new();
    let nowhere = heap.symbol("nowhere");
    let body = [ins_v(&mut heap, "jump", &[nowhere])];
    let bytecode = heap.tuple(&body);
    let input = source(&mut heap, &[("bytecode", bytecode)]);
    assert!(asm::assemble(&mut heap, input).is_err());

    let body = [ins(&mut heap, "load-nil", &[0])];
    let bytecode = heap.tuple(&body);
    let input = source(&mut heap, &[("bytecode", bytecode)]);
    let err = asm::assemble(&mut heap, input).unwrap_err();
    assert!(err.message.contains("terminal"));
}

#[test]
fn test_rejects_missing_bytecode() {
    let mut heap = Heap::new();
    let input = source(&mut heap, &[("arity", Value::Integer(0))]);
    assert!(asm::assemble(&mut heap, input).is_err());
}
