//! Integration tests for the binary image format: save, reload from
//! disk, verify, execute.

use skein_core::{Heap, Value};
use skein_runtime::{asm, serialize, vm};
use std::fs;

fn ins(heap: &mut Heap, name: &str, args: &[i32]) -> Value {
    let mut elems = vec![heap.symbol(name)];
    elems.extend(args.iter().map(|&a| Value::Integer(a)));
    heap.tuple(&elems)
}

fn source(heap: &mut Heap, entries: &[(&str, Value)]) -> Value {
    let pairs: Vec<(Value, Value)> = entries
        .iter()
        .map(|&(k, v)| (heap.keyword(k), v))
        .collect();
    heap.struct_of(&pairs)
}

#[test]
fn test_image_survives_a_disk_round_trip() {
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
        &[("bytecode", bytecode), ("constants", constants)],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let image = serialize::save_image(unsafe { &*def }).expect("saves");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hello.skimage");
    fs::write(&path, &image).expect("writes");
    let bytes = fs::read(&path).expect("reads");

    // A fresh heap: constants re-intern on load.
    let mut heap2 = Heap::new();
    let loaded = serialize::load_image(&mut heap2, &bytes).expect("loads");
    unsafe {
        assert_eq!((*def).bytecode, (*loaded).bytecode);
        assert_eq!((*def).slotcount, (*loaded).slotcount);
    }
    let func = heap2.function(loaded, Box::new([]));
    let result = vm::call(&mut heap2, func, &[]).expect("runs");
    let hi2 = heap2.cstring("hi");
    assert!(result.equals(hi2));
}

#[test]
fn test_nested_defs_round_trip() {
    let mut heap = Heap::new();
    let child_body = [
        ins(&mut heap, "load-upvalue", &[0, 0, 0]),
        ins(&mut heap, "return", &[0]),
    ];
    let child_bytecode = heap.tuple(&child_body);
    let child_envs = heap.tuple(&[Value::Integer(-1)]);
    let child = source(
        &mut heap,
        &[("environments", child_envs), ("bytecode", child_bytecode)],
    );
    let closures = heap.tuple(&[child]);
    let body = [
        ins(&mut heap, "closure", &[1, 0]),
        ins(&mut heap, "call", &[2, 1]),
        ins(&mut heap, "return", &[2]),
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
    let def = asm::assemble(&mut heap, input).expect("assembles");
    let image = serialize::save_image(unsafe { &*def }).expect("saves");
    let loaded = serialize::load_image(&mut heap, &image).expect("loads");
    let func = heap.function(loaded, Box::new([]));
    let result = vm::call(&mut heap, func, &[Value::Integer(9)]).expect("runs");
    assert!(result.equals(Value::Integer(9)));
}

#[test]
fn test_mutable_constants_are_rejected() {
    let mut heap = Heap::new();
    let arr = heap.array(vec![Value::Integer(1)]);
    let body = [
        ins(&mut heap, "load-constant", &[0, 0]),
        ins(&mut heap, "return", &[0]),
    ];
    let bytecode = heap.tuple(&body);
    let constants = heap.tuple(&[arr]);
    let input = source(
        &mut heap,
        &[("bytecode", bytecode), ("constants", constants)],
    );
    let def = asm::assemble(&mut heap, input).expect("assembles");
    assert!(serialize::save_image(unsafe { &*def }).is_err());
}

#[test]
fn test_corrupt_images_do_not_load() {
    let mut heap = Heap::new();
    assert!(serialize::load_image(&mut heap, b"not an image").is_err());

    // A structurally valid image with broken bytecode fails the
    // verifier rather than reaching the VM.
    let typed = serialize::TypedFuncDef {
        bytecode: vec![0xFFFF_FFFF],
        constants: vec![],
        defs: vec![],
        environments: vec![],
        flags: 0,
        arity: 0,
        slotcount: 1,
        name: serialize::TypedValue::Nil,
        source: serialize::TypedValue::Nil,
        sourcepath: serialize::TypedValue::Nil,
        sourcemap: vec![],
    };
    let bytes = bincode::serialize(&typed).expect("encodes");
    assert!(matches!(
        serialize::load_image(&mut heap, &bytes),
        Err(serialize::SerializeError::InvalidBytecode(_))
    ));
}
