//! The bytecode virtual machine
//!
//! One dispatch loop drives every fiber: the outer loop re-derives the
//! current frame (after calls, tail calls, and fiber switches), the inner
//! loop decodes and executes instructions. Fiber switching stays inside
//! the loop: `transfer`, fiber death, and error propagation all pick the
//! next fiber and continue, so a resume only returns to the host when
//! the running fiber yields past it or finishes.
//!
//! Suspension protocol: a frame that suspends (by `call` into a closure
//! or by `transfer`) stores the index of the suspending instruction in
//! its frame header. Delivery decodes that instruction to find the
//! destination register, writes the incoming value, and steps past it.
//! The parent of an erroring fiber receives the error payload at its
//! transfer site and tells it apart from a normal value by the child's
//! status.
//!
//! GC runs only at the check points after `closure` and the push family;
//! instructions are atomic with respect to collection.

use crate::bytecode::{self as bc, OpCode};
use skein_core::{Fiber, FiberStatus, FuncEnv, Heap, Value};
use tracing::debug;

/// Where the loop goes after a value leaves a fiber.
enum Flow {
    /// Keep executing this fiber (frame state already updated).
    Run(*mut Fiber),
    /// No fiber left to deliver to: surface to the host.
    Done(Value),
}

/// Resume a fiber with an input value.
///
/// A `New` fiber materializes its first frame, binding `input` as the
/// entry closure's first argument. A `Pending` fiber receives `input` at
/// its suspended transfer site. Terminal and alive fibers cannot be
/// resumed. On `Err` the payload is the error value; inspect the fiber's
/// status and `ret` field to distinguish outcomes.
pub fn resume(heap: &mut Heap, fiber: Value, input: Value) -> Result<Value, Value> {
    let fptr = match fiber {
        Value::Fiber(p) => p,
        _ => return Err(heap.cstring("cannot resume a non-fiber")),
    };
    let status = unsafe { (*fptr).status };
    match status {
        FiberStatus::New | FiberStatus::Pending => {}
        _ => {
            let msg = format!("cannot resume a {} fiber", status);
            return Err(heap.cstring(&msg));
        }
    }
    let prev = heap.active_fiber();
    heap.set_active_fiber(fiber);
    unsafe {
        (*fptr).status = FiberStatus::Alive;
        if status == FiberStatus::New {
            (*fptr).parent = prev;
            let entry = (*fptr).entry;
            (*fptr).push(input);
            if let Err(payload) = (*fptr).func_frame(heap, entry) {
                (*fptr).status = FiberStatus::Error;
                (*fptr).ret = payload;
                heap.set_active_fiber(prev);
                return Err(payload);
            }
        } else {
            deliver(fptr, input);
        }
    }
    let result = execute(heap, fptr);
    heap.set_active_fiber(prev);
    result
}

/// Call a function from the host: a fresh fiber runs `func` over `args`
/// to completion (or first yield).
pub fn call(heap: &mut Heap, func: Value, args: &[Value]) -> Result<Value, Value> {
    let fiber = heap.fiber(func, args.len() + 16);
    let fptr = match fiber {
        Value::Fiber(p) => p,
        _ => unreachable!("heap.fiber returns a fiber"),
    };
    let prev = heap.active_fiber();
    heap.set_active_fiber(fiber);
    unsafe {
        (*fptr).parent = prev;
        (*fptr).status = FiberStatus::Alive;
        (*fptr).pushn(args);
        if let Err(payload) = (*fptr).func_frame(heap, func) {
            (*fptr).status = FiberStatus::Error;
            (*fptr).ret = payload;
            heap.set_active_fiber(prev);
            return Err(payload);
        }
    }
    let result = execute(heap, fptr);
    heap.set_active_fiber(prev);
    result
}

/// Write `value` into the destination register of the transfer
/// instruction `fiber` is suspended on, and step past it.
unsafe fn deliver(fiber: *mut Fiber, value: Value) {
    unsafe {
        let f = &mut *fiber;
        if let Some(frame) = f.frames.last_mut() {
            if let Value::Function(p) = frame.callee {
                let def = &*(*p).def;
                if let Some(&word) = def.bytecode.get(frame.pc) {
                    if bc::decode_op(word) == Some(OpCode::Transfer) {
                        let dest = bc::arg_a(word);
                        f.data[frame.base + dest] = value;
                        frame.pc += 1;
                    }
                }
            }
        }
    }
}

/// Route a value returned from a fiber's outermost frame: the fiber dies
/// and the value goes to the parent's transfer site, or to the host.
unsafe fn leave_fiber(heap: &mut Heap, fiber: *mut Fiber, value: Value) -> Flow {
    unsafe {
        (*fiber).status = FiberStatus::Dead;
        (*fiber).ret = value;
        let parent = (*fiber).parent;
        if let Value::Fiber(pp) = parent {
            if (*pp).status == FiberStatus::Pending {
                deliver(pp, value);
                (*pp).status = FiberStatus::Alive;
                heap.set_active_fiber(parent);
                return Flow::Run(pp);
            }
        }
        Flow::Done(value)
    }
}

/// Run the fiber until a value or error surfaces to the host.
fn execute(heap: &mut Heap, mut fiber: *mut Fiber) -> Result<Value, Value> {
    'restart: loop {
        let frame = match unsafe { (*fiber).frames.last() } {
            Some(f) => *f,
            None => {
                // A fiber with no frames has nothing to run.
                let v = unsafe { (*fiber).ret };
                return Ok(v);
            }
        };
        let base = frame.base;
        let self_val = frame.callee;
        let func_ptr = match self_val {
            Value::Function(p) => p,
            _ => {
                let payload = heap.cstring("fiber frame has no closure");
                match unsafe { propagate_error(heap, fiber, payload) } {
                    Flow::Run(next) => {
                        fiber = next;
                        continue 'restart;
                    }
                    Flow::Done(v) => return Err(v),
                }
            }
        };
        let def = unsafe { (*func_ptr).def };
        let mut pc = frame.pc;
        let pending: Value;

        // Capture the pointer by value: `fiber` is reassigned on switches.
        let fiber_here = fiber;
        let reg = move |i: usize| -> Value { unsafe { (&(*fiber_here).data)[base + i] } };
        let set_reg = move |i: usize, v: Value| unsafe { (&mut (*fiber_here).data)[base + i] = v };

        'frame: loop {
            let word = match unsafe { (&(*def).bytecode).get(pc) } {
                Some(&w) => w,
                None => {
                    // Resuming past a trailing transfer runs off the end.
                    pending = heap.cstring("program counter ran off the bytecode");
                    break 'frame;
                }
            };
            let op = match bc::decode_op(word) {
                Some(op) => op,
                None => {
                    pending = heap.cstring("unknown opcode");
                    break 'frame;
                }
            };
            match op {
                OpCode::Noop => pc += 1,
                OpCode::LoadNil => {
                    set_reg(bc::arg_long(word), Value::Nil);
                    pc += 1;
                }
                OpCode::LoadTrue => {
                    set_reg(bc::arg_long(word), Value::Bool(true));
                    pc += 1;
                }
                OpCode::LoadFalse => {
                    set_reg(bc::arg_long(word), Value::Bool(false));
                    pc += 1;
                }
                OpCode::LoadInteger => {
                    set_reg(bc::arg_a(word), Value::Integer(bc::arg_wide_signed(word)));
                    pc += 1;
                }
                OpCode::LoadConstant => {
                    let c = unsafe { (&(*def).constants)[bc::arg_wide(word)] };
                    set_reg(bc::arg_a(word), c);
                    pc += 1;
                }
                OpCode::LoadSelf => {
                    set_reg(bc::arg_long(word), self_val);
                    pc += 1;
                }
                OpCode::MoveNear => {
                    set_reg(bc::arg_a(word), reg(bc::arg_wide(word)));
                    pc += 1;
                }
                OpCode::MoveFar => {
                    set_reg(bc::arg_wide(word), reg(bc::arg_a(word)));
                    pc += 1;
                }
                OpCode::LoadUpvalue | OpCode::SetUpvalue => {
                    let envindex = bc::arg_b(word);
                    let slot = bc::arg_c(word);
                    let env: *mut FuncEnv = match unsafe { (&(*func_ptr).envs).get(envindex) } {
                        Some(&e) => e,
                        None => {
                            pending = heap.cstring("invalid environment index");
                            break 'frame;
                        }
                    };
                    if op == OpCode::LoadUpvalue {
                        match unsafe { (*env).get(slot) } {
                            Some(v) => set_reg(bc::arg_a(word), v),
                            None => {
                                pending = heap.cstring("upvalue index out of range");
                                break 'frame;
                            }
                        }
                    } else if !unsafe { (*env).set(slot, reg(bc::arg_a(word))) } {
                        pending = heap.cstring("upvalue index out of range");
                        break 'frame;
                    }
                    pc += 1;
                }
                OpCode::Add | OpCode::Subtract | OpCode::Multiply | OpCode::Divide => {
                    match arith_generic(op, reg(bc::arg_b(word)), reg(bc::arg_c(word))) {
                        Ok(v) => {
                            set_reg(bc::arg_a(word), v);
                            pc += 1;
                        }
                        Err(msg) => {
                            pending = heap.cstring(msg);
                            break 'frame;
                        }
                    }
                }
                OpCode::AddInteger
                | OpCode::SubtractInteger
                | OpCode::MultiplyInteger
                | OpCode::DivideInteger => {
                    match arith_integer(op, reg(bc::arg_b(word)), reg(bc::arg_c(word))) {
                        Ok(v) => {
                            set_reg(bc::arg_a(word), v);
                            pc += 1;
                        }
                        Err(msg) => {
                            pending = heap.cstring(msg);
                            break 'frame;
                        }
                    }
                }
                OpCode::AddReal | OpCode::SubtractReal | OpCode::MultiplyReal
                | OpCode::DivideReal => {
                    match arith_real(op, reg(bc::arg_b(word)), reg(bc::arg_c(word))) {
                        Ok(v) => {
                            set_reg(bc::arg_a(word), v);
                            pc += 1;
                        }
                        Err(msg) => {
                            pending = heap.cstring(msg);
                            break 'frame;
                        }
                    }
                }
                OpCode::AddImmediate | OpCode::MultiplyImmediate | OpCode::DivideImmediate => {
                    match arith_immediate(op, reg(bc::arg_b(word)), bc::arg_c_signed(word)) {
                        Ok(v) => {
                            set_reg(bc::arg_a(word), v);
                            pc += 1;
                        }
                        Err(msg) => {
                            pending = heap.cstring(msg);
                            break 'frame;
                        }
                    }
                }
                OpCode::Band | OpCode::Bor | OpCode::Bxor => {
                    match (reg(bc::arg_b(word)), reg(bc::arg_c(word))) {
                        (Value::Integer(a), Value::Integer(b)) => {
                            let v = match op {
                                OpCode::Band => a & b,
                                OpCode::Bor => a | b,
                                _ => a ^ b,
                            };
                            set_reg(bc::arg_a(word), Value::Integer(v));
                            pc += 1;
                        }
                        _ => {
                            pending = heap.cstring("expected integer");
                            break 'frame;
                        }
                    }
                }
                OpCode::Bnot => match reg(bc::arg_wide(word)) {
                    Value::Integer(a) => {
                        set_reg(bc::arg_a(word), Value::Integer(!a));
                        pc += 1;
                    }
                    _ => {
                        pending = heap.cstring("expected integer");
                        break 'frame;
                    }
                },
                OpCode::ShiftLeft | OpCode::ShiftRight | OpCode::ShiftRightUnsigned => {
                    match (reg(bc::arg_b(word)), reg(bc::arg_c(word))) {
                        (Value::Integer(a), Value::Integer(b)) => {
                            set_reg(bc::arg_a(word), Value::Integer(shift(op, a, b as u32)));
                            pc += 1;
                        }
                        _ => {
                            pending = heap.cstring("expected integer");
                            break 'frame;
                        }
                    }
                }
                OpCode::ShiftLeftImmediate
                | OpCode::ShiftRightImmediate
                | OpCode::ShiftRightUnsignedImmediate => match reg(bc::arg_b(word)) {
                    Value::Integer(a) => {
                        let shifted = shift(immediate_shift_op(op), a, bc::arg_c(word) as u32);
                        set_reg(bc::arg_a(word), Value::Integer(shifted));
                        pc += 1;
                    }
                    _ => {
                        pending = heap.cstring("expected integer");
                        break 'frame;
                    }
                },
                OpCode::Equals => {
                    let v = reg(bc::arg_b(word)).equals(reg(bc::arg_c(word)));
                    set_reg(bc::arg_a(word), Value::Bool(v));
                    pc += 1;
                }
                OpCode::LessThan => {
                    let ord = reg(bc::arg_b(word)).compare(reg(bc::arg_c(word)));
                    set_reg(bc::arg_a(word), Value::Bool(ord == std::cmp::Ordering::Less));
                    pc += 1;
                }
                OpCode::GreaterThan => {
                    let ord = reg(bc::arg_b(word)).compare(reg(bc::arg_c(word)));
                    set_reg(
                        bc::arg_a(word),
                        Value::Bool(ord == std::cmp::Ordering::Greater),
                    );
                    pc += 1;
                }
                OpCode::Compare => {
                    let ord = reg(bc::arg_b(word)).compare(reg(bc::arg_c(word)));
                    set_reg(bc::arg_a(word), Value::Integer(ord as i32));
                    pc += 1;
                }
                OpCode::Jump => {
                    pc = (pc as i64 + bc::arg_long_signed(word) as i64) as usize;
                }
                OpCode::JumpIf => {
                    if reg(bc::arg_a(word)).is_truthy() {
                        pc = (pc as i64 + bc::arg_wide_signed(word) as i64) as usize;
                    } else {
                        pc += 1;
                    }
                }
                OpCode::JumpIfNot => {
                    if reg(bc::arg_a(word)).is_truthy() {
                        pc += 1;
                    } else {
                        pc = (pc as i64 + bc::arg_wide_signed(word) as i64) as usize;
                    }
                }
                OpCode::Push => {
                    let v = reg(bc::arg_long(word));
                    unsafe { (*fiber).push(v) };
                    pc += 1;
                    heap.maybe_collect();
                }
                OpCode::Push2 => {
                    let a = reg(bc::arg_a(word));
                    let b = reg(bc::arg_wide(word));
                    unsafe { (*fiber).push2(a, b) };
                    pc += 1;
                    heap.maybe_collect();
                }
                OpCode::Push3 => {
                    let a = reg(bc::arg_a(word));
                    let b = reg(bc::arg_b(word));
                    let c = reg(bc::arg_c(word));
                    unsafe { (*fiber).push3(a, b, c) };
                    pc += 1;
                    heap.maybe_collect();
                }
                OpCode::PushArray => match reg(bc::arg_long(word)) {
                    Value::Array(p) => {
                        let elems = unsafe { (*p).elems.clone() };
                        unsafe { (*fiber).pushn(&elems) };
                        pc += 1;
                        heap.maybe_collect();
                    }
                    _ => {
                        pending = heap.cstring("expected array");
                        break 'frame;
                    }
                },
                OpCode::Closure => {
                    let child = unsafe { (&(*def).defs)[bc::arg_wide(word)] };
                    let count = unsafe { (*child).environments.len() };
                    let mut envs: Vec<*mut FuncEnv> = Vec::with_capacity(count);
                    let mut bad_env = false;
                    for k in 0..count {
                        let e = unsafe { (&(*child).environments)[k] };
                        if e < 0 {
                            let live = unsafe {
                                let fr = (*fiber).frames.last_mut().expect("running frame");
                                if fr.env.is_null() {
                                    fr.env =
                                        heap.funcenv_live(fiber, base, (*def).slotcount as usize);
                                }
                                fr.env
                            };
                            envs.push(live);
                        } else {
                            match unsafe { (&(*func_ptr).envs).get(e as usize) } {
                                Some(&pe) => envs.push(pe),
                                None => {
                                    bad_env = true;
                                    break;
                                }
                            }
                        }
                    }
                    if bad_env {
                        pending = heap.cstring("invalid environment index");
                        break 'frame;
                    }
                    let f = heap.function(child, envs.into_boxed_slice());
                    set_reg(bc::arg_a(word), f);
                    pc += 1;
                    heap.maybe_collect();
                }
                OpCode::Call => {
                    let callee = reg(bc::arg_wide(word));
                    match callee {
                        Value::Function(_) => {
                            unsafe {
                                (*fiber).frames.last_mut().expect("running frame").pc = pc;
                                if let Err(payload) = (*fiber).func_frame(heap, callee) {
                                    pending = payload;
                                    break 'frame;
                                }
                            }
                            continue 'restart;
                        }
                        Value::CFunction(cf) => {
                            let (cb, ct) = unsafe {
                                (*fiber).c_frame(callee);
                                let fr = (*fiber).frames.last().expect("host frame");
                                (fr.base, fr.top)
                            };
                            let result = cf(heap, unsafe { &(&(*fiber).data)[cb..ct] });
                            unsafe { (*fiber).pop_frame() };
                            match result {
                                Ok(v) => {
                                    set_reg(bc::arg_a(word), v);
                                    pc += 1;
                                }
                                Err(payload) => {
                                    pending = payload;
                                    break 'frame;
                                }
                            }
                        }
                        _ => {
                            let msg = format!("cannot call {}", callee.type_name());
                            pending = heap.cstring(&msg);
                            break 'frame;
                        }
                    }
                }
                OpCode::Tailcall => {
                    let callee = reg(bc::arg_long(word));
                    match callee {
                        Value::Function(_) => {
                            if let Err(payload) =
                                unsafe { (*fiber).func_frame_tail(heap, callee) }
                            {
                                pending = payload;
                                break 'frame;
                            }
                            continue 'restart;
                        }
                        Value::CFunction(cf) => {
                            let (cb, ct) = unsafe {
                                (*fiber).c_frame_tail(callee);
                                let fr = (*fiber).frames.last().expect("host frame");
                                (fr.base, fr.top)
                            };
                            let result = cf(heap, unsafe { &(&(*fiber).data)[cb..ct] });
                            unsafe { (*fiber).pop_frame() };
                            match result {
                                Ok(v) => {
                                    // The host call replaced this frame, so its
                                    // return value returns from this function.
                                    if unsafe { (*fiber).frames.is_empty() } {
                                        match unsafe { leave_fiber(heap, fiber, v) } {
                                            Flow::Run(next) => {
                                                fiber = next;
                                                continue 'restart;
                                            }
                                            Flow::Done(v) => return Ok(v),
                                        }
                                    }
                                    unsafe { return_to_caller(fiber, v) };
                                    continue 'restart;
                                }
                                Err(payload) => {
                                    pending = payload;
                                    break 'frame;
                                }
                            }
                        }
                        _ => {
                            let msg = format!("cannot call {}", callee.type_name());
                            pending = heap.cstring(&msg);
                            break 'frame;
                        }
                    }
                }
                OpCode::Return | OpCode::ReturnNil => {
                    let rv = if op == OpCode::Return {
                        reg(bc::arg_long(word))
                    } else {
                        Value::Nil
                    };
                    unsafe { (*fiber).pop_frame() };
                    if unsafe { (*fiber).frames.is_empty() } {
                        match unsafe { leave_fiber(heap, fiber, rv) } {
                            Flow::Run(next) => {
                                fiber = next;
                                continue 'restart;
                            }
                            Flow::Done(v) => return Ok(v),
                        }
                    }
                    unsafe { return_to_caller(fiber, rv) };
                    continue 'restart;
                }
                OpCode::Get => {
                    match index_get(heap, reg(bc::arg_b(word)), reg(bc::arg_c(word))) {
                        Ok(v) => {
                            set_reg(bc::arg_a(word), v);
                            pc += 1;
                        }
                        Err(payload) => {
                            pending = payload;
                            break 'frame;
                        }
                    }
                }
                OpCode::GetIndex => {
                    let key = Value::Integer(bc::arg_c(word) as i32);
                    match index_get(heap, reg(bc::arg_b(word)), key) {
                        Ok(v) => {
                            set_reg(bc::arg_a(word), v);
                            pc += 1;
                        }
                        Err(payload) => {
                            pending = payload;
                            break 'frame;
                        }
                    }
                }
                OpCode::Put => {
                    match index_put(
                        heap,
                        reg(bc::arg_a(word)),
                        reg(bc::arg_b(word)),
                        reg(bc::arg_c(word)),
                    ) {
                        Ok(()) => pc += 1,
                        Err(payload) => {
                            pending = payload;
                            break 'frame;
                        }
                    }
                }
                OpCode::PutIndex => {
                    let key = Value::Integer(bc::arg_c(word) as i32);
                    match index_put(heap, reg(bc::arg_a(word)), key, reg(bc::arg_b(word))) {
                        Ok(()) => pc += 1,
                        Err(payload) => {
                            pending = payload;
                            break 'frame;
                        }
                    }
                }
                OpCode::Typecheck => {
                    let t = reg(bc::arg_a(word)).type_of();
                    if t.bit() & (bc::arg_wide(word) as u16) == 0 {
                        let msg = format!("unexpected type {}", t.name());
                        pending = heap.cstring(&msg);
                        break 'frame;
                    }
                    pc += 1;
                }
                OpCode::Error => {
                    pending = reg(bc::arg_long(word));
                    break 'frame;
                }
                OpCode::Transfer => {
                    let value = reg(bc::arg_c(word));
                    let mut target = reg(bc::arg_b(word));
                    if target.is_nil() {
                        target = unsafe { (*fiber).parent };
                    }
                    // Suspend at this transfer; delivery resumes past it.
                    unsafe {
                        let fr = (*fiber).frames.last_mut().expect("running frame");
                        fr.pc = pc;
                        (*fiber).status = FiberStatus::Pending;
                        (*fiber).ret = value;
                    }
                    match target {
                        Value::Nil => {
                            // Yield past the host resume point.
                            debug!("fiber yielded to host");
                            return Ok(value);
                        }
                        Value::Fiber(tp) => {
                            let tstatus = unsafe { (*tp).status };
                            match tstatus {
                                FiberStatus::New => {
                                    unsafe {
                                        (*tp).parent = Value::Fiber(fiber);
                                        (*tp).status = FiberStatus::Alive;
                                    }
                                    heap.set_active_fiber(target);
                                    let entry = unsafe { (*tp).entry };
                                    unsafe { (*tp).push(value) };
                                    if let Err(payload) =
                                        unsafe { (*tp).func_frame(heap, entry) }
                                    {
                                        // The error belongs to the target fiber.
                                        fiber = tp;
                                        pending = payload;
                                        break 'frame;
                                    }
                                    fiber = tp;
                                    continue 'restart;
                                }
                                FiberStatus::Pending => {
                                    unsafe {
                                        (*tp).status = FiberStatus::Alive;
                                        deliver(tp, value);
                                    }
                                    heap.set_active_fiber(target);
                                    fiber = tp;
                                    continue 'restart;
                                }
                                _ => {
                                    unsafe { (*fiber).status = FiberStatus::Alive };
                                    let msg =
                                        format!("cannot transfer to a {} fiber", tstatus);
                                    pending = heap.cstring(&msg);
                                    break 'frame;
                                }
                            }
                        }
                        _ => {
                            unsafe { (*fiber).status = FiberStatus::Alive };
                            let msg = format!(
                                "cannot transfer to {}",
                                target.type_name()
                            );
                            pending = heap.cstring(&msg);
                            break 'frame;
                        }
                    }
                }
            }
        }

        // Error propagation: the fiber keeps its stack for inspection and
        // the payload travels to the nearest pending ancestor or the host.
        unsafe {
            if let Some(fr) = (*fiber).frames.last_mut() {
                fr.pc = pc;
            }
            match propagate_error(heap, fiber, pending) {
                Flow::Run(next) => {
                    fiber = next;
                    continue 'restart;
                }
                Flow::Done(payload) => return Err(payload),
            }
        }
    }
}

/// Mark `fiber` as errored and deliver the payload to its parent's
/// transfer site, or surface it.
unsafe fn propagate_error(heap: &mut Heap, fiber: *mut Fiber, payload: Value) -> Flow {
    unsafe {
        (*fiber).status = FiberStatus::Error;
        (*fiber).ret = payload;
        debug!("fiber error: propagating to parent");
        let parent = (*fiber).parent;
        if let Value::Fiber(pp) = parent {
            if (*pp).status == FiberStatus::Pending {
                deliver(pp, payload);
                (*pp).status = FiberStatus::Alive;
                heap.set_active_fiber(parent);
                return Flow::Run(pp);
            }
        }
        Flow::Done(payload)
    }
}

/// Deliver a return value into the caller frame suspended at its `call`
/// instruction.
unsafe fn return_to_caller(fiber: *mut Fiber, value: Value) {
    unsafe {
        let f = &mut *fiber;
        let frame = f.frames.last_mut().expect("caller frame");
        if let Value::Function(p) = frame.callee {
            let def = &*(*p).def;
            let word = def.bytecode[frame.pc];
            debug_assert_eq!(bc::decode_op(word), Some(OpCode::Call));
            f.data[frame.base + bc::arg_a(word)] = value;
            frame.pc += 1;
        }
    }
}

fn immediate_shift_op(op: OpCode) -> OpCode {
    match op {
        OpCode::ShiftLeftImmediate => OpCode::ShiftLeft,
        OpCode::ShiftRightImmediate => OpCode::ShiftRight,
        _ => OpCode::ShiftRightUnsigned,
    }
}

/// Shift with the count taken modulo 32.
fn shift(op: OpCode, a: i32, count: u32) -> i32 {
    match op {
        OpCode::ShiftLeft => a.wrapping_shl(count),
        OpCode::ShiftRight => a.wrapping_shr(count),
        _ => (a as u32).wrapping_shr(count) as i32,
    }
}

/// Generic arithmetic: integers wrap, mixed operands promote to real.
fn arith_generic(op: OpCode, a: Value, b: Value) -> Result<Value, &'static str> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => integer_op(op, x, y),
        (Value::Integer(x), Value::Real(y)) => Ok(Value::Real(real_op(op, x as f64, y))),
        (Value::Real(x), Value::Integer(y)) => Ok(Value::Real(real_op(op, x, y as f64))),
        (Value::Real(x), Value::Real(y)) => Ok(Value::Real(real_op(op, x, y))),
        _ => Err("expected number"),
    }
}

fn arith_integer(op: OpCode, a: Value, b: Value) -> Result<Value, &'static str> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => integer_op(op, x, y),
        _ => Err("expected integer"),
    }
}

fn arith_real(op: OpCode, a: Value, b: Value) -> Result<Value, &'static str> {
    match (a, b) {
        (Value::Real(x), Value::Real(y)) => Ok(Value::Real(real_op(op, x, y))),
        _ => Err("expected real"),
    }
}

fn arith_immediate(op: OpCode, a: Value, imm: i32) -> Result<Value, &'static str> {
    let reduced = match op {
        OpCode::AddImmediate => OpCode::Add,
        OpCode::MultiplyImmediate => OpCode::Multiply,
        _ => OpCode::Divide,
    };
    match a {
        Value::Integer(x) => integer_op(reduced, x, imm),
        Value::Real(x) => Ok(Value::Real(real_op(reduced, x, imm as f64))),
        _ => Err("expected number"),
    }
}

fn integer_op(op: OpCode, x: i32, y: i32) -> Result<Value, &'static str> {
    let v = match op {
        OpCode::Add | OpCode::AddInteger => x.wrapping_add(y),
        OpCode::Subtract | OpCode::SubtractInteger => x.wrapping_sub(y),
        OpCode::Multiply | OpCode::MultiplyInteger => x.wrapping_mul(y),
        _ => {
            if y == 0 {
                return Err("division by zero");
            }
            if x == i32::MIN && y == -1 {
                return Err("integer overflow");
            }
            x / y
        }
    };
    Ok(Value::Integer(v))
}

fn real_op(op: OpCode, x: f64, y: f64) -> f64 {
    match op {
        OpCode::Add | OpCode::AddReal => x + y,
        OpCode::Subtract | OpCode::SubtractReal => x - y,
        OpCode::Multiply | OpCode::MultiplyReal => x * y,
        _ => x / y,
    }
}

/// Indexed read over the aggregate types. Missing table/struct keys read
/// as nil; sequence indices must be in range.
pub fn index_get(heap: &mut Heap, ds: Value, key: Value) -> Result<Value, Value> {
    match ds {
        Value::Table(p) => Ok(unsafe { (*p).get(key) }.unwrap_or(Value::Nil)),
        Value::Struct(p) => Ok(unsafe { (*p).get(key) }.unwrap_or(Value::Nil)),
        Value::Array(p) => {
            let len = unsafe { (*p).len() };
            let i = sequence_index(heap, key, len)?;
            Ok(unsafe { (&(*p).elems)[i] })
        }
        Value::Tuple(p) => {
            let len = unsafe { (*p).len() };
            let i = sequence_index(heap, key, len)?;
            Ok(unsafe { (*p).elems()[i] })
        }
        Value::String(p) => {
            let len = unsafe { (*p).len() };
            let i = sequence_index(heap, key, len)?;
            Ok(Value::Integer(unsafe { (*p).as_bytes()[i] } as i32))
        }
        Value::Buffer(p) => {
            let len = unsafe { (*p).len() };
            let i = sequence_index(heap, key, len)?;
            Ok(Value::Integer(unsafe { (&(*p).bytes)[i] } as i32))
        }
        _ => {
            let msg = format!("cannot get from {}", ds.type_name());
            Err(heap.cstring(&msg))
        }
    }
}

/// Indexed write over the mutable aggregates. Writing past the end of an
/// array extends it with nils.
pub fn index_put(heap: &mut Heap, ds: Value, key: Value, value: Value) -> Result<(), Value> {
    match ds {
        Value::Table(p) => {
            if key.is_nil() {
                return Err(heap.cstring("table key cannot be nil"));
            }
            unsafe { (*p).put(key, value) };
            Ok(())
        }
        Value::Array(p) => {
            let i = match key {
                Value::Integer(i) if i >= 0 => i as usize,
                _ => return Err(heap.cstring("expected non-negative integer index")),
            };
            unsafe {
                if i >= (*p).elems.len() {
                    (*p).elems.resize(i + 1, Value::Nil);
                }
                (&mut (*p).elems)[i] = value;
            }
            Ok(())
        }
        Value::Buffer(p) => {
            let len = unsafe { (*p).len() };
            let i = sequence_index(heap, key, len)?;
            match value {
                Value::Integer(b) => {
                    unsafe { (&mut (*p).bytes)[i] = b as u8 };
                    Ok(())
                }
                _ => Err(heap.cstring("expected integer byte value")),
            }
        }
        _ => {
            let msg = format!("cannot put into {}", ds.type_name());
            Err(heap.cstring(&msg))
        }
    }
}

fn sequence_index(heap: &mut Heap, key: Value, len: usize) -> Result<usize, Value> {
    match key {
        Value::Integer(i) if i >= 0 && (i as usize) < len => Ok(i as usize),
        Value::Integer(_) => Err(heap.cstring("index out of range")),
        _ => Err(heap.cstring("expected integer index")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(
            arith_generic(OpCode::Add, Value::Integer(i32::MAX), Value::Integer(1)).unwrap(),
            Value::Integer(i32::MIN)
        );
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_real() {
        match arith_generic(OpCode::Add, Value::Integer(1), Value::Real(2.5)).unwrap() {
            Value::Real(r) => assert_eq!(r, 3.5),
            other => panic!("expected real, got {:?}", other),
        }
    }

    #[test]
    fn test_division_guards() {
        assert!(arith_generic(OpCode::Divide, Value::Integer(1), Value::Integer(0)).is_err());
        assert!(
            arith_generic(OpCode::Divide, Value::Integer(i32::MIN), Value::Integer(-1)).is_err()
        );
        assert_eq!(
            arith_generic(OpCode::Divide, Value::Integer(7), Value::Integer(-2)).unwrap(),
            Value::Integer(-3)
        );
    }

    #[test]
    fn test_non_numeric_operands_fail() {
        assert!(arith_generic(OpCode::Add, Value::Nil, Value::Integer(1)).is_err());
        assert!(arith_integer(OpCode::AddInteger, Value::Real(1.0), Value::Integer(1)).is_err());
        assert!(arith_real(OpCode::AddReal, Value::Integer(1), Value::Real(1.0)).is_err());
    }

    #[test]
    fn test_shift_count_wraps_mod_32() {
        assert_eq!(shift(OpCode::ShiftLeft, 1, 33), 2);
        assert_eq!(shift(OpCode::ShiftRight, -8, 1), -4);
        assert_eq!(shift(OpCode::ShiftRightUnsigned, -1, 28), 0xF);
    }
}
