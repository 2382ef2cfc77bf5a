//! Fibers: first-class coroutines owning their call stacks
//!
//! A fiber owns a growable register stack (`data`) partitioned into call
//! frames by a typed parallel frame stack (`frames`). The layout of `data`
//! at any moment is: every live frame's register window, bottom to top,
//! followed by the scratch area where the next call's arguments
//! accumulate. `data.len()` is the stack top; the current frame's window
//! is `[frame(), frametop())`.
//!
//! Frame metadata (previous bounds, saved program counter, callee, and the
//! detached environment pointer) lives in `Frame` entries rather than
//! in-band header slots, so program counters and pointers never masquerade
//! as values.
//!
//! Status machine:
//!
//! ```text
//! New --resume--> Alive
//! Alive --transfer--> Pending      (resumable at the saved pc)
//! Alive --return--> Dead           (last frame popped)
//! Alive --error--> Error           (stack preserved for inspection)
//! Pending --resume--> Alive
//! Dead/Error --resume--> error     (terminal states are leaves)
//! ```

use crate::function::{FuncDef, FuncEnv};
use crate::heap::{GcHeader, Heap};
use crate::value::Value;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    New,
    Alive,
    Pending,
    Dead,
    Error,
}

impl FiberStatus {
    /// Terminal fibers cannot be resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberStatus::Dead | FiberStatus::Error)
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberStatus::New => "new",
            FiberStatus::Alive => "alive",
            FiberStatus::Pending => "pending",
            FiberStatus::Dead => "dead",
            FiberStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Metadata for one call frame.
#[derive(Copy, Clone, Debug)]
pub struct Frame {
    /// First register slot of this frame in the fiber's `data`.
    pub base: usize,
    /// One past the last register slot (`base + slotcount`).
    pub top: usize,
    /// Saved instruction index, written when this frame suspends by
    /// calling or transferring.
    pub pc: usize,
    /// The closure in effect, a cfunction for host frames, or nil.
    pub callee: Value,
    /// Live environment handed out to closures created in this frame;
    /// null until the frame is captured, closed when the frame pops.
    pub env: *mut FuncEnv,
}

/// A coroutine with its own register stack.
#[repr(C)]
pub struct Fiber {
    pub header: GcHeader,
    /// Register slots and scratch; `data.len()` is the stack top.
    pub data: Vec<Value>,
    pub frames: Vec<Frame>,
    pub status: FiberStatus,
    /// Fiber to deliver returns and errors to, or nil.
    pub parent: Value,
    /// Last transferred, returned, or error payload.
    pub ret: Value,
    /// Entry closure; the first frame is materialized on first resume so
    /// the transferred value participates in normal argument binding.
    pub entry: Value,
}

impl Fiber {
    pub(crate) fn new(entry: Value, capacity: usize) -> Fiber {
        Fiber {
            header: GcHeader::new(),
            data: Vec::with_capacity(capacity),
            frames: Vec::new(),
            status: FiberStatus::New,
            parent: Value::Nil,
            ret: Value::Nil,
            entry,
        }
    }

    /// Base of the current frame's register window.
    pub fn frame(&self) -> usize {
        self.frames.last().map_or(0, |f| f.base)
    }

    /// End of the current frame's register window / start of scratch.
    pub fn frametop(&self) -> usize {
        self.frames.last().map_or(0, |f| f.top)
    }

    /// End of the scratch area.
    pub fn stacktop(&self) -> usize {
        self.data.len()
    }

    /// Append a call argument to the scratch area.
    pub fn push(&mut self, v: Value) {
        self.data.push(v);
    }

    pub fn push2(&mut self, a: Value, b: Value) {
        self.data.push(a);
        self.data.push(b);
    }

    pub fn push3(&mut self, a: Value, b: Value, c: Value) {
        self.data.push(a);
        self.data.push(b);
        self.data.push(c);
    }

    pub fn pushn(&mut self, values: &[Value]) {
        self.data.extend_from_slice(values);
    }

    /// Grow the stack to hold `total` slots, forcing one collection before
    /// surfacing allocation failure as a runtime error payload.
    fn ensure_stack(&mut self, heap: &mut Heap, total: usize) -> Result<(), Value> {
        if total <= self.data.capacity() {
            return Ok(());
        }
        let additional = total - self.data.len();
        if self.data.try_reserve(additional).is_ok() {
            return Ok(());
        }
        heap.collect();
        if self.data.try_reserve(additional).is_ok() {
            return Ok(());
        }
        Err(heap.cstring("fiber stack allocation failed"))
    }

    /// Trim surplus arguments, nil-fill missing slots, and pack varargs,
    /// leaving `data` exactly `base + slotcount` long.
    fn bind_arguments(
        &mut self,
        heap: &mut Heap,
        base: usize,
        argn: usize,
        def: &FuncDef,
    ) -> Result<(), Value> {
        let arity = def.arity as usize;
        let slotcount = def.slotcount as usize;
        self.ensure_stack(heap, base + slotcount)?;
        if def.is_vararg() {
            let rest = if argn > arity {
                heap.tuple(&self.data[base + arity..base + argn])
            } else {
                heap.tuple(&[])
            };
            self.data.truncate(base + arity.min(argn));
            self.data.resize(base + slotcount, Value::Nil);
            self.data[base + arity] = rest;
        } else {
            self.data.truncate(base + arity.min(argn));
            self.data.resize(base + slotcount, Value::Nil);
        }
        Ok(())
    }

    /// Enter `func`, consuming the scratch area as arguments.
    pub fn func_frame(&mut self, heap: &mut Heap, func: Value) -> Result<(), Value> {
        let fptr = match func {
            Value::Function(p) => p,
            _ => return Err(heap.cstring("expected function")),
        };
        let base = self.frametop();
        let argn = self.data.len() - base;
        let def = unsafe { &*(*fptr).def };
        self.bind_arguments(heap, base, argn, def)?;
        self.frames.push(Frame {
            base,
            top: base + def.slotcount as usize,
            pc: 0,
            callee: func,
            env: std::ptr::null_mut(),
        });
        Ok(())
    }

    /// Replace the current frame with a frame for `func` (tail call).
    /// The outgoing frame's live environment is closed first, then the
    /// scratch arguments move down over the outgoing registers.
    pub fn func_frame_tail(&mut self, heap: &mut Heap, func: Value) -> Result<(), Value> {
        let fptr = match func {
            Value::Function(p) => p,
            _ => return Err(heap.cstring("expected function")),
        };
        let frame = match self.frames.last() {
            Some(f) => *f,
            None => return self.func_frame(heap, func),
        };
        if !frame.env.is_null() {
            unsafe { (*frame.env).close(&self.data[frame.base..frame.top]) };
        }
        let scratch = self.frametop();
        let argn = self.data.len() - scratch;
        self.data.copy_within(scratch..scratch + argn, frame.base);
        self.data.truncate(frame.base + argn);
        let def = unsafe { &*(*fptr).def };
        self.bind_arguments(heap, frame.base, argn, def)?;
        let f = self.frames.last_mut().expect("frame checked above");
        f.top = frame.base + def.slotcount as usize;
        f.pc = 0;
        f.callee = func;
        f.env = std::ptr::null_mut();
        Ok(())
    }

    /// Enter a host routine: the frame window spans the arguments already
    /// pushed; there is no closure and no resumable pc.
    pub fn c_frame(&mut self, callee: Value) {
        let base = self.frametop();
        self.frames.push(Frame {
            base,
            top: self.data.len(),
            pc: 0,
            callee,
            env: std::ptr::null_mut(),
        });
    }

    /// Replace the current frame with a host frame (tail call to a host
    /// routine).
    pub fn c_frame_tail(&mut self, callee: Value) {
        let frame = match self.frames.last() {
            Some(f) => *f,
            None => return self.c_frame(callee),
        };
        if !frame.env.is_null() {
            unsafe { (*frame.env).close(&self.data[frame.base..frame.top]) };
        }
        let scratch = self.frametop();
        let argn = self.data.len() - scratch;
        self.data.copy_within(scratch..scratch + argn, frame.base);
        self.data.truncate(frame.base + argn);
        let f = self.frames.last_mut().expect("frame checked above");
        f.top = frame.base + argn;
        f.pc = 0;
        f.callee = callee;
        f.env = std::ptr::null_mut();
    }

    /// Pop the current frame, closing its environment if one was handed
    /// out, and restore the previous frame's bounds.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        if !frame.env.is_null() {
            unsafe { (*frame.env).close(&self.data[frame.base..frame.top]) };
        }
        self.data.truncate(frame.base);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_function(heap: &mut Heap, arity: u32, slotcount: u32, flags: u32) -> Value {
        let def = FuncDef {
            header: GcHeader::new(),
            bytecode: vec![0],
            constants: Vec::new(),
            defs: Vec::new(),
            environments: Vec::new(),
            flags,
            arity,
            slotcount,
            name: Value::Nil,
            source: Value::Nil,
            sourcepath: Value::Nil,
            sourcemap: Vec::new(),
        };
        let def = heap.funcdef(def);
        heap.function(def, Box::new([]))
    }

    fn raw(fiber: Value) -> *mut Fiber {
        match fiber {
            Value::Fiber(p) => p,
            _ => panic!("expected fiber"),
        }
    }

    #[test]
    fn test_func_frame_binds_and_nil_fills() {
        let mut heap = Heap::new();
        let func = test_function(&mut heap, 2, 5, 0);
        let fv = heap.fiber(func, 8);
        let f = raw(fv);
        unsafe {
            (*f).push2(Value::Integer(1), Value::Integer(2));
            (*f).func_frame(&mut heap, func).unwrap();
            assert_eq!((*f).frame(), 0);
            assert_eq!((*f).frametop(), 5);
            assert_eq!((&(*f).data)[0], Value::Integer(1));
            assert_eq!((&(*f).data)[1], Value::Integer(2));
            assert!((&(*f).data)[2].is_nil());
            assert!((&(*f).data)[4].is_nil());
        }
    }

    #[test]
    fn test_func_frame_drops_surplus_arguments() {
        let mut heap = Heap::new();
        let func = test_function(&mut heap, 1, 2, 0);
        let fv = heap.fiber(func, 8);
        let f = raw(fv);
        unsafe {
            (*f).push3(Value::Integer(1), Value::Integer(2), Value::Integer(3));
            (*f).func_frame(&mut heap, func).unwrap();
            assert_eq!((*f).frametop(), 2);
            assert_eq!((&(*f).data)[0], Value::Integer(1));
            assert!((&(*f).data)[1].is_nil());
        }
    }

    #[test]
    fn test_vararg_packs_rest_tuple() {
        let mut heap = Heap::new();
        let func = test_function(&mut heap, 1, 3, FuncDef::VARARG);
        let fv = heap.fiber(func, 8);
        let f = raw(fv);
        unsafe {
            (*f).push3(Value::Integer(1), Value::Integer(2), Value::Integer(3));
            (*f).func_frame(&mut heap, func).unwrap();
            assert_eq!((&(*f).data)[0], Value::Integer(1));
            match (&(*f).data)[1] {
                Value::Tuple(t) => {
                    assert_eq!((*t).elems(), &[Value::Integer(2), Value::Integer(3)]);
                }
                other => panic!("expected rest tuple, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_tail_frame_stays_in_place() {
        let mut heap = Heap::new();
        let func = test_function(&mut heap, 1, 2, 0);
        let fv = heap.fiber(func, 8);
        let f = raw(fv);
        unsafe {
            (*f).push(Value::Integer(10));
            (*f).func_frame(&mut heap, func).unwrap();
            let frames_before = (*f).frames.len();
            let base_before = (*f).frame();
            (*f).push(Value::Integer(9));
            (*f).func_frame_tail(&mut heap, func).unwrap();
            assert_eq!((*f).frames.len(), frames_before);
            assert_eq!((*f).frame(), base_before);
            assert_eq!((&(*f).data)[0], Value::Integer(9));
        }
    }

    #[test]
    fn test_pop_frame_closes_environment() {
        let mut heap = Heap::new();
        let func = test_function(&mut heap, 1, 2, 0);
        let fv = heap.fiber(func, 8);
        let f = raw(fv);
        unsafe {
            (*f).push(Value::Integer(7));
            (*f).func_frame(&mut heap, func).unwrap();
            let env = heap.funcenv_live(f, 0, 2);
            (*f).frames.last_mut().unwrap().env = env;
            assert!(!(*env).is_closed());
            assert_eq!((*env).get(0), Some(Value::Integer(7)));
            (*f).pop_frame();
            assert!((*env).is_closed());
            // The closed copy still holds the frame's registers.
            assert_eq!((*env).get(0), Some(Value::Integer(7)));
            assert_eq!((*f).stacktop(), 0);
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(FiberStatus::New.to_string(), "new");
        assert_eq!(FiberStatus::Error.to_string(), "error");
        assert!(FiberStatus::Dead.is_terminal());
        assert!(!FiberStatus::Pending.is_terminal());
    }
}
