//! Embedding Helpers
//!
//! The surface native functions use to talk to the VM: read arguments,
//! return a value, push and pop scratch values above the frame, build
//! closures from pushed values, access upvalues, and re-enter the
//! interpreter for sub-calls.
//!
//! A native runs inside a frame whose window starts at `thread.top`;
//! arguments sit at indices `0 … argc-1`. Values pushed with [`push`] live
//! in the user region above the frame's declared size and are what
//! [`call`] and [`make_closure`] consume.

use crate::context::Context;
use crate::interpreter::Thread;
use crate::object::{ClosureObj, Obj, ObjKind, make_closure_obj, obj_kind};
use crate::value::Value;

/// Number of arguments the current native call received.
pub fn argc(thread: &Thread) -> u8 {
    thread.frames.last().map(|f| f.argc).unwrap_or(0)
}

/// Read argument `idx` of the current native call.
pub fn arg(thread: &Thread, idx: u8) -> Value {
    thread.stack[thread.top + idx as usize]
}

/// Write the current call's return value into the caller's window.
pub fn ret(thread: &mut Thread, value: Value) {
    let frame = thread.frames.last().expect("native frame");
    let slot = (thread.top as i64 + frame.return_loc as i64) as usize;
    thread.stack[slot] = value;
}

/// Push a scratch value above the current frame.
pub fn push(thread: &mut Thread, value: Value) {
    let frame = thread.frames.last_mut().expect("frame");
    frame.user_top += 1;
    let slot = thread.top + frame.size as usize + frame.user_top as usize;
    thread.stack[slot] = value;
}

/// Pop the topmost scratch value.
pub fn pop(thread: &mut Thread) -> Value {
    let frame = thread.frames.last_mut().expect("frame");
    let slot = thread.top + frame.size as usize + frame.user_top as usize;
    frame.user_top -= 1;
    thread.stack[slot]
}

/// Read an upvalue of the currently running closure.
pub fn getup(thread: &Thread, idx: u8) -> Value {
    let frame = thread.frames.last().expect("frame");
    unsafe {
        debug_assert_eq!(obj_kind(frame.callable), ObjKind::Closure);
        (*(frame.callable as *mut ClosureObj)).upvals[idx as usize]
    }
}

/// Write an upvalue of the currently running closure.
pub fn setup(thread: &mut Thread, idx: u8, value: Value) {
    let frame = thread.frames.last().expect("frame");
    unsafe {
        debug_assert_eq!(obj_kind(frame.callable), ObjKind::Closure);
        (*(frame.callable as *mut ClosureObj)).upvals[idx as usize] = value;
    }
}

/// Build a closure from pushed values: the callable first, then
/// `num_upvals` captured values. All of them are consumed.
pub fn make_closure(ctx: &mut Context, thread: &mut Thread, num_upvals: u8) -> Value {
    let frame = *thread.frames.last().expect("frame");
    let true_top = thread.top + frame.size as usize + frame.user_top as usize;

    let fn_slot = true_top - num_upvals as usize;
    let callable = thread.stack[fn_slot].as_object();

    let mut upvals = Vec::with_capacity(num_upvals as usize);
    for i in 0..num_upvals as usize {
        upvals.push(thread.stack[fn_slot + 1 + i]);
    }

    let frame = thread.frames.last_mut().expect("frame");
    frame.user_top -= num_upvals as u16 + 1;

    let closure = make_closure_obj(ctx, callable, upvals.into_boxed_slice());
    Value::object(closure as *mut Obj)
}

/// Call a pushed callable with `argc` pushed arguments. The callable must
/// have been pushed first, then its arguments in order; the result replaces
/// them on the user stack (read it with [`pop`]).
pub fn call(ctx: &mut Context, thread: &mut Thread, argc: u8) -> Result<(), String> {
    let old_top = thread.top;

    let (size, user_top_after) = {
        let frame = thread.frames.last_mut().expect("frame");
        frame.user_top -= argc as u16;
        (frame.size, frame.user_top)
    };

    // The callable sits just below the arguments; the callee window starts
    // right at the first argument.
    let new_top = old_top + size as usize + user_top_after as usize + 1;
    let callee = thread.stack[new_top - 1];
    if !callee.is_object() {
        // Restore the consumed arguments before failing.
        let frame = thread.frames.last_mut().expect("frame");
        frame.user_top += argc as u16;
        return Err("value is not callable".to_string());
    }

    thread.top = new_top;
    let result = crate::interpreter::invoke(ctx, thread, callee.as_object(), argc, -1);
    thread.top = old_top;

    result.map_err(|e| e.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Frame;

    fn thread_with_frame(size: u8, argc: u8) -> Thread {
        let mut thread = Thread::new();
        thread.frames.push(Frame {
            callable: std::ptr::null_mut(),
            return_loc: 0,
            argc,
            size,
            user_top: 0,
        });
        thread
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let mut thread = thread_with_frame(4, 0);
        push(&mut thread, Value::number(1.0));
        push(&mut thread, Value::number(2.0));
        assert_eq!(pop(&mut thread).as_number(), 2.0);
        assert_eq!(pop(&mut thread).as_number(), 1.0);
        assert_eq!(thread.frames[0].user_top, 0);
    }

    #[test]
    fn test_args_are_window_relative() {
        let mut thread = thread_with_frame(0, 2);
        thread.top = 10;
        thread.stack[10] = Value::number(7.0);
        thread.stack[11] = Value::number(9.0);
        assert_eq!(argc(&thread), 2);
        assert_eq!(arg(&thread, 0).as_number(), 7.0);
        assert_eq!(arg(&thread, 1).as_number(), 9.0);
    }

    #[test]
    fn test_return_writes_through_frame() {
        let mut thread = thread_with_frame(0, 0);
        thread.top = 5;
        thread.frames[0].return_loc = -2;
        ret(&mut thread, Value::number(3.5));
        assert_eq!(thread.stack[3].as_number(), 3.5);
    }
}
