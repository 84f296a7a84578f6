//! Interpreter
//!
//! A dispatch loop over the four-byte instruction stream. Each thread owns a
//! contiguous value stack and a call-frame stack; `top` marks the base of
//! the running frame's register window. Calls advance `top` so the callee
//! sees its window at zero, and `RETURN` writes through the frame's signed
//! return slot back into the caller's window.
//!
//! Fatal errors propagate as `Result` values out of the nested dispatch
//! loops to the execution entry point, which reports once and returns
//! failure to the host.

use crate::context::Context;
use crate::object::{
    ClosureObj, FnObj, ModuleObj, NativeFnObj, Obj, ObjKind, StringObj, TableObj, concat_strings,
    make_table, obj_get, obj_kind, obj_set, table_get, table_set, value_is_equal,
};
use crate::op::{Op, OpCode};
use crate::types::{self, TypeObj};
use crate::value::{VALUE_FALSE, VALUE_NULL, Value};

pub const STACK_SIZE: usize = 1024;
pub const CALLSTACK_SIZE: usize = 128;

/// One call frame: the callable, where its result goes (relative to the
/// callee window, possibly negative), and the split-stack bookkeeping.
#[derive(Clone, Copy)]
pub struct Frame {
    pub callable: *mut Obj,
    pub return_loc: i32,
    pub argc: u8,
    pub size: u8,
    pub user_top: u16,
}

pub struct Thread {
    pub stack: Vec<Value>,
    /// Base index of the current frame's register window.
    pub top: usize,
    pub frames: Vec<Frame>,
    pub last_error: *mut StringObj,
}

impl Thread {
    pub fn new() -> Thread {
        Thread {
            stack: vec![VALUE_NULL; STACK_SIZE],
            top: 0,
            frames: Vec::with_capacity(CALLSTACK_SIZE),
            last_error: std::ptr::null_mut(),
        }
    }
}

impl Default for Thread {
    fn default() -> Thread {
        Thread::new()
    }
}

#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub module: String,
    pub line: u16,
    pub col: u16,
}

/// Locate the instruction stream, debug map, and module of a callable.
unsafe fn callable_parts(
    callable: *mut Obj,
) -> (*const Op, usize, *const Value, Option<*const Vec<u32>>, *mut ModuleObj) {
    unsafe {
        match obj_kind(callable) {
            ObjKind::Module => {
                let m = callable as *mut ModuleObj;
                let locs = (*m).debug.as_ref().map(|d| &d.locs as *const Vec<u32>);
                (
                    (*m).instructions.as_ptr(),
                    (*m).instructions.len(),
                    (*m).constants.as_ptr(),
                    locs,
                    m,
                )
            }
            ObjKind::Fn | ObjKind::Method => {
                let f = callable as *mut FnObj;
                let locs = (*f).debug.as_ref().map(|d| d as *const Vec<u32>);
                (
                    (*f).instructions.as_ptr(),
                    (*f).instructions.len(),
                    (*f).constants.as_ptr(),
                    locs,
                    (*f).module,
                )
            }
            ObjKind::Closure => callable_parts((*(callable as *mut ClosureObj)).callable),
            _ => (std::ptr::null(), 0, std::ptr::null(), None, std::ptr::null_mut()),
        }
    }
}

/// Build a runtime error with the location of the faulting instruction.
fn error_at(thread: &Thread, ip: usize, message: impl Into<String>) -> RuntimeError {
    let mut module = String::from("<native>");
    let mut line = 0u16;
    let mut col = 0u16;

    if let Some(frame) = thread.frames.last() {
        unsafe {
            let (_, _, _, locs, module_ptr) = callable_parts(frame.callable);
            if !module_ptr.is_null() {
                let path = (*module_ptr).path;
                let name = (*module_ptr).name;
                if !path.is_null() {
                    module = (*path).as_str().to_string();
                } else if !name.is_null() {
                    module = (*name).as_str().to_string();
                } else {
                    module = String::from("<module>");
                }
            }
            if let Some(locs) = locs {
                if let Some(packed) = (&(*locs)).get(ip.saturating_sub(1)) {
                    line = (packed >> 16) as u16;
                    col = (packed & 0xFFFF) as u16;
                }
            }
        }
    }

    RuntimeError {
        message: message.into(),
        module,
        line,
        col,
    }
}

/// Execute a module on a fresh thread, returning its top-level return
/// value. The error callback contract lives in the caller: one report per
/// fatal error.
pub fn execute_module(ctx: &mut Context, module: *mut ModuleObj) -> Result<Value, RuntimeError> {
    let mut thread = Box::new(Thread::new());
    unsafe {
        thread.frames.push(Frame {
            callable: module as *mut Obj,
            return_loc: 0,
            argc: 0,
            size: (*module).stack_size,
            user_top: 0,
        });
    }

    let previous = ctx.current_thread;
    ctx.current_thread = &mut *thread as *mut Thread;

    let result = unsafe {
        let (code, len, constants, _, _) = callable_parts(module as *mut Obj);
        run(ctx, &mut thread, module, code, len, constants, 0)
    };

    ctx.current_thread = previous;

    result.map(|_| thread.stack[0])
}

/// Call any callable with arguments from the host side, on the context's
/// current thread (a fresh one is made when none is live).
pub fn call_value(
    ctx: &mut Context,
    callable: Value,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    if !callable.is_object() {
        return Err(error_at(&Thread::new(), 0, "value is not callable"));
    }

    if ctx.current_thread.is_null() {
        let mut thread = Box::new(Thread::new());
        thread.frames.push(Frame {
            callable: std::ptr::null_mut(),
            return_loc: 0,
            argc: 0,
            size: 0,
            user_top: 0,
        });
        ctx.current_thread = &mut *thread as *mut Thread;
        let result = call_on_current(ctx, callable, args);
        ctx.current_thread = std::ptr::null_mut();
        result
    } else {
        call_on_current(ctx, callable, args)
    }
}

fn call_on_current(
    ctx: &mut Context,
    callable: Value,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let thread = unsafe { &mut *ctx.current_thread };
    crate::embedding::push(thread, callable);
    for arg in args {
        crate::embedding::push(thread, *arg);
    }
    crate::embedding::call(ctx, thread, args.len() as u8)
        .map_err(|message| error_at(thread, 0, message))?;
    Ok(crate::embedding::pop(thread))
}

/// Dispatch a call to `obj`. The caller has already positioned
/// `thread.top` at the callee's window base; this pushes the frame, runs
/// the callable, and pops the frame.
pub(crate) fn invoke(
    ctx: &mut Context,
    thread: &mut Thread,
    obj: *mut Obj,
    argc: u8,
    return_loc: i32,
) -> Result<(), RuntimeError> {
    if thread.frames.len() >= CALLSTACK_SIZE {
        return Err(error_at(thread, 0, "stack overflow"));
    }

    unsafe {
        let (kind, size) = match obj_kind(obj) {
            ObjKind::Fn | ObjKind::Method => (obj_kind(obj), (*(obj as *mut FnObj)).stack_size),
            ObjKind::Closure => {
                let inner = (*(obj as *mut ClosureObj)).callable;
                match obj_kind(inner) {
                    ObjKind::Fn | ObjKind::Method => {
                        (ObjKind::Closure, (*(inner as *mut FnObj)).stack_size)
                    }
                    ObjKind::NativeFn => (ObjKind::Closure, 0),
                    _ => {
                        return Err(error_at(
                            thread,
                            0,
                            "closure contains an unsupported callable",
                        ));
                    }
                }
            }
            ObjKind::NativeFn => (ObjKind::NativeFn, 0),
            _ => return Err(error_at(thread, 0, "value is not callable")),
        };

        if thread.top + size as usize >= STACK_SIZE {
            return Err(error_at(thread, 0, "stack overflow"));
        }

        thread.frames.push(Frame {
            callable: obj,
            return_loc,
            argc,
            size,
            user_top: 0,
        });

        let result = match kind {
            ObjKind::Fn | ObjKind::Method => {
                let f = obj as *mut FnObj;
                let (code, len, constants, _, _) = callable_parts(obj);
                run(ctx, thread, (*f).module, code, len, constants, return_loc)
            }
            ObjKind::Closure => {
                let inner = (*(obj as *mut ClosureObj)).callable;
                match obj_kind(inner) {
                    ObjKind::Fn | ObjKind::Method => {
                        let f = inner as *mut FnObj;
                        let (code, len, constants, _, _) = callable_parts(obj);
                        run(ctx, thread, (*f).module, code, len, constants, return_loc)
                    }
                    _ => {
                        let native = inner as *mut NativeFnObj;
                        ((*native).proc)(ctx, thread).map_err(|m| error_at(thread, 0, m))
                    }
                }
            }
            ObjKind::NativeFn => {
                let native = obj as *mut NativeFnObj;
                ((*native).proc)(ctx, thread).map_err(|m| error_at(thread, 0, m))
            }
            _ => unreachable!(),
        };

        thread.frames.pop();
        result
    }
}

// ---------------------------------------------------------------------------
// Polymorphic operation fallbacks
// ---------------------------------------------------------------------------

/// Look up and call a binary metamethod on the left operand's table.
fn meta_binary(
    ctx: &mut Context,
    thread: &mut Thread,
    name: *mut StringObj,
    lhs: Value,
    rhs: Value,
) -> Result<Option<Value>, String> {
    if !lhs.is_object() {
        return Ok(None);
    }
    unsafe {
        let obj = lhs.as_object();
        if obj_kind(obj) != ObjKind::Table {
            return Ok(None);
        }
        let meta = table_get(obj as *mut TableObj, Value::object(name as *mut Obj));
        if meta.is_null() {
            return Ok(None);
        }

        crate::embedding::push(thread, meta);
        crate::embedding::push(thread, lhs);
        crate::embedding::push(thread, rhs);
        crate::embedding::call(ctx, thread, 2)?;
        Ok(Some(crate::embedding::pop(thread)))
    }
}

/// `@format` hook for `to_string`; None when no thread is live or the table
/// declares no formatter.
pub fn call_format_meta(ctx: &mut Context, tbl: *mut TableObj) -> Option<*mut StringObj> {
    if ctx.current_thread.is_null() {
        return None;
    }
    let format = ctx.meta_names.format;
    let meta = table_get(tbl, Value::object(format as *mut Obj));
    if meta.is_null() {
        return None;
    }

    let thread = unsafe { &mut *ctx.current_thread };
    crate::embedding::push(thread, meta);
    crate::embedding::push(thread, Value::object(tbl as *mut Obj));
    if crate::embedding::call(ctx, thread, 1).is_err() {
        return None;
    }
    let result = crate::embedding::pop(thread);
    if result.is_object() {
        unsafe {
            let obj = result.as_object();
            if obj_kind(obj) == ObjKind::String {
                return Some(obj as *mut StringObj);
            }
        }
    }
    None
}

fn vm_add(ctx: &mut Context, thread: &mut Thread, lhs: Value, rhs: Value) -> Result<Value, String> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::number(lhs.as_number() + rhs.as_number()));
    }

    if lhs.is_object() && rhs.is_object() {
        unsafe {
            let a = lhs.as_object();
            let b = rhs.as_object();
            if obj_kind(a) == ObjKind::String && obj_kind(b) == ObjKind::String {
                let joined = concat_strings(ctx, a as *mut StringObj, b as *mut StringObj);
                return Ok(Value::object(joined as *mut Obj));
            }
        }
    }

    let add = ctx.meta_names.add;
    if let Some(result) = meta_binary(ctx, thread, add, lhs, rhs)? {
        return Ok(result);
    }

    Err("cannot add these values".to_string())
}

fn vm_sub(ctx: &mut Context, thread: &mut Thread, lhs: Value, rhs: Value) -> Result<Value, String> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::number(lhs.as_number() - rhs.as_number()));
    }
    let sub = ctx.meta_names.sub;
    if let Some(result) = meta_binary(ctx, thread, sub, lhs, rhs)? {
        return Ok(result);
    }
    Err("cannot subtract non-number values".to_string())
}

fn vm_mul(ctx: &mut Context, thread: &mut Thread, lhs: Value, rhs: Value) -> Result<Value, String> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::number(lhs.as_number() * rhs.as_number()));
    }
    let mul = ctx.meta_names.mul;
    if let Some(result) = meta_binary(ctx, thread, mul, lhs, rhs)? {
        return Ok(result);
    }
    Err("cannot multiply non-number values".to_string())
}

fn vm_div(ctx: &mut Context, thread: &mut Thread, lhs: Value, rhs: Value) -> Result<Value, String> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::number(lhs.as_number() / rhs.as_number()));
    }
    let div = ctx.meta_names.div;
    if let Some(result) = meta_binary(ctx, thread, div, lhs, rhs)? {
        return Ok(result);
    }
    Err("cannot divide non-number values".to_string())
}

fn vm_lt(ctx: &mut Context, thread: &mut Thread, lhs: Value, rhs: Value) -> Result<Value, String> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::bool(lhs.as_number() < rhs.as_number()));
    }
    let lt = ctx.meta_names.lt;
    if let Some(result) = meta_binary(ctx, thread, lt, lhs, rhs)? {
        return Ok(result);
    }
    Err("cannot order non-number values".to_string())
}

fn vm_lte(ctx: &mut Context, thread: &mut Thread, lhs: Value, rhs: Value) -> Result<Value, String> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::bool(lhs.as_number() <= rhs.as_number()));
    }
    let lte = ctx.meta_names.lte;
    if let Some(result) = meta_binary(ctx, thread, lte, lhs, rhs)? {
        return Ok(result);
    }
    Err("cannot order non-number values".to_string())
}

fn vm_eq(
    ctx: &mut Context,
    thread: &mut Thread,
    lhs: Value,
    rhs: Value,
    negate: bool,
) -> Result<Value, String> {
    let name = if negate {
        ctx.meta_names.neq
    } else {
        ctx.meta_names.eq
    };
    if let Some(result) = meta_binary(ctx, thread, name, lhs, rhs)? {
        return Ok(result);
    }
    let equal = value_is_equal(lhs, rhs);
    Ok(Value::bool(equal != negate))
}

// ---------------------------------------------------------------------------
// The dispatch loop
// ---------------------------------------------------------------------------

unsafe fn run(
    ctx: &mut Context,
    thread: &mut Thread,
    module: *mut ModuleObj,
    code: *const Op,
    code_len: usize,
    constants: *const Value,
    return_loc: i32,
) -> Result<(), RuntimeError> {
    unsafe {
        let code = std::slice::from_raw_parts(code, code_len);
        let base = thread.top;

        // Upvalue window, when the running callable is a closure.
        let upv: *mut Value = {
            let frame = thread.frames.last().expect("frame pushed by caller");
            if !frame.callable.is_null() && obj_kind(frame.callable) == ObjKind::Closure {
                (*(frame.callable as *mut ClosureObj)).upvals.as_ptr() as *mut Value
            } else {
                std::ptr::null_mut()
            }
        };

        macro_rules! reg {
            ($i:expr) => {
                thread.stack[base + $i as usize]
            };
        }
        macro_rules! konst {
            ($i:expr) => {
                *constants.add($i as usize)
            };
        }

        let mut ip = 0usize;
        loop {
            let op = code[ip];
            ip += 1;

            match op.code() {
                OpCode::Load => reg!(op.a) = konst!(op.ubc()),
                OpCode::LoadSmall => reg!(op.a) = Value::number(op.ibc() as f64),
                OpCode::LoadNull => reg!(op.a) = VALUE_NULL,
                OpCode::LoadBool => reg!(op.a) = Value::bool(op.b != 0),
                OpCode::LoadImport => {
                    let import = (&(*module).imports)[op.b as usize];
                    reg!(op.a) = (*import).value;
                }

                OpCode::Table => {
                    if op.is_accelerated() {
                        let ty = reg!(op.c).as_object() as *mut TypeObj;
                        let tbl = make_table(ctx, op.b as usize);
                        // Root the table through its register before the
                        // prototype lookup can allocate.
                        reg!(op.a) = Value::object(tbl as *mut Obj);
                        (*tbl).prototype = types::type_get_proto(ctx, ty);
                    } else {
                        let tbl = make_table(ctx, op.ibc().max(0) as usize);
                        reg!(op.a) = Value::object(tbl as *mut Obj);
                    }
                }

                OpCode::Array => {
                    let len = op.ibc().max(0) as usize;
                    let arr = crate::object::make_array(ctx, len);
                    (*arr).items.resize(len, VALUE_NULL);
                    reg!(op.a) = Value::object(arr as *mut Obj);
                }

                OpCode::Move => reg!(op.a) = reg!(op.b),

                OpCode::Export => {
                    let ty = reg!(op.c).as_object() as *mut TypeObj;
                    let key = reg!(op.a);
                    let value = reg!(op.b);
                    crate::object::module_export(ctx, module, ty, key, value);
                }

                OpCode::Close => {
                    let func = reg!(op.b).as_object();
                    let count = op.c as usize;
                    let mut upvals = Vec::with_capacity(count);
                    for i in 0..count {
                        upvals.push(reg!(op.b + 1 + i as u8));
                    }
                    let closure =
                        crate::object::make_closure_obj(ctx, func, upvals.into_boxed_slice());
                    reg!(op.a) = Value::object(closure as *mut Obj);
                }

                OpCode::LoadUp => reg!(op.a) = *upv.add(op.b as usize),
                OpCode::StoreUp => *upv.add(op.a as usize) = reg!(op.b),

                OpCode::Neg => {
                    if op.is_accelerated() {
                        reg!(op.a) = Value::number(-reg!(op.b).as_number());
                    } else {
                        let v = reg!(op.b);
                        if v.is_number() {
                            reg!(op.a) = Value::number(-v.as_number());
                        } else {
                            return Err(error_at(thread, ip, "cannot negate a non-number"));
                        }
                    }
                }

                OpCode::Add => {
                    if op.is_accelerated() {
                        reg!(op.a) =
                            Value::number(reg!(op.b).as_number() + reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_add(ctx, thread, lhs, rhs)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }
                OpCode::Sub => {
                    if op.is_accelerated() {
                        reg!(op.a) =
                            Value::number(reg!(op.b).as_number() - reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_sub(ctx, thread, lhs, rhs)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }
                OpCode::Mul => {
                    if op.is_accelerated() {
                        reg!(op.a) =
                            Value::number(reg!(op.b).as_number() * reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_mul(ctx, thread, lhs, rhs)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }
                OpCode::Div => {
                    if op.is_accelerated() {
                        reg!(op.a) =
                            Value::number(reg!(op.b).as_number() / reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_div(ctx, thread, lhs, rhs)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }

                OpCode::Eq => {
                    if op.is_accelerated() {
                        reg!(op.a) = Value::bool(reg!(op.b).as_number() == reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_eq(ctx, thread, lhs, rhs, false)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }
                OpCode::Neq => {
                    if op.is_accelerated() {
                        reg!(op.a) = Value::bool(reg!(op.b).as_number() != reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_eq(ctx, thread, lhs, rhs, true)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }
                OpCode::Lt => {
                    if op.is_accelerated() {
                        reg!(op.a) = Value::bool(reg!(op.b).as_number() < reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_lt(ctx, thread, lhs, rhs)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }
                OpCode::Lte => {
                    if op.is_accelerated() {
                        reg!(op.a) = Value::bool(reg!(op.b).as_number() <= reg!(op.c).as_number());
                    } else {
                        let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                        let result = vm_lte(ctx, thread, lhs, rhs)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = result;
                    }
                }

                OpCode::And => {
                    let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                    if !lhs.is_bool() || !rhs.is_bool() {
                        return Err(error_at(thread, ip, "'and' requires bools"));
                    }
                    reg!(op.a) = Value::bool(lhs.as_bool() && rhs.as_bool());
                }
                OpCode::Or => {
                    let (lhs, rhs) = (reg!(op.b), reg!(op.c));
                    if !lhs.is_bool() || !rhs.is_bool() {
                        return Err(error_at(thread, ip, "'or' requires bools"));
                    }
                    reg!(op.a) = Value::bool(lhs.as_bool() || rhs.as_bool());
                }
                OpCode::Not => {
                    let v = reg!(op.b);
                    if !v.is_bool() {
                        return Err(error_at(thread, ip, "'not' requires a bool"));
                    }
                    reg!(op.a) = Value::bool(!v.as_bool());
                }

                OpCode::LoadIdx => {
                    if op.is_accelerated() {
                        let tbl = reg!(op.b).as_object() as *mut TableObj;
                        reg!(op.a) = (*tbl).pairs.pairs()[op.c as usize].value;
                    } else {
                        let target = reg!(op.b);
                        if !target.is_object() {
                            return Err(error_at(thread, ip, "value is not indexable"));
                        }
                        let key = reg!(op.c);
                        reg!(op.a) = obj_get(ctx, target.as_object(), key);
                    }
                }
                OpCode::StoreIdx => {
                    if op.is_accelerated() {
                        let tbl = reg!(op.a).as_object() as *mut TableObj;
                        (*tbl).pairs.pairs_mut()[op.b as usize].value = reg!(op.c);
                    } else {
                        let target = reg!(op.a);
                        if !target.is_object() {
                            return Err(error_at(thread, ip, "value is not indexable"));
                        }
                        let (key, value) = (reg!(op.b), reg!(op.c));
                        obj_set(ctx, target.as_object(), key, value);
                    }
                }
                OpCode::LoadIdxK => {
                    let target = reg!(op.b);
                    if !target.is_object() {
                        return Err(error_at(thread, ip, "value is not indexable"));
                    }
                    let key = konst!(op.c);
                    reg!(op.a) = obj_get(ctx, target.as_object(), key);
                }
                OpCode::StoreIdxK => {
                    let target = reg!(op.a);
                    if !target.is_object() {
                        return Err(error_at(thread, ip, "value is not indexable"));
                    }
                    let key = konst!(op.b);
                    let value = reg!(op.c);
                    obj_set(ctx, target.as_object(), key, value);
                }

                OpCode::Expect => {
                    let v = reg!(op.b);
                    if v.is_null() {
                        return Err(error_at(
                            thread,
                            ip,
                            "operator '!' failed - left hand side was null",
                        ));
                    }
                    reg!(op.a) = v;
                }
                OpCode::Exists => {
                    reg!(op.a) = Value::bool(!reg!(op.b).is_null());
                }
                OpCode::Coalesce => {
                    let v = reg!(op.b);
                    reg!(op.a) = if v.is_null() { reg!(op.c) } else { v };
                }

                OpCode::TCheck => {
                    let ty = reg!(op.c).as_object() as *mut TypeObj;
                    let v = reg!(op.b);
                    reg!(op.a) = Value::bool(types::is_type(ctx, v, ty));
                }
                OpCode::TSatis => {
                    let ty = reg!(op.c).as_object() as *mut TypeObj;
                    let v = reg!(op.b);
                    reg!(op.a) = Value::bool(types::satisfies_type(ctx, v, ty));
                }
                OpCode::TCast => {
                    if op.is_accelerated() {
                        let ty = reg!(op.c).as_object() as *mut TypeObj;
                        let tbl = reg!(op.b).as_object() as *mut TableObj;
                        (*tbl).prototype = types::type_get_proto(ctx, ty);
                        reg!(op.a) = reg!(op.b);
                    } else {
                        let ty = reg!(op.c).as_object() as *mut TypeObj;
                        let v = reg!(op.b);
                        let cast = types::cast_type(ctx, v, ty)
                            .map_err(|m| error_at(thread, ip, m))?;
                        reg!(op.a) = cast;
                    }
                }
                OpCode::TSet => {
                    let ty = reg!(op.a).as_object() as *mut TypeObj;
                    let (key, value) = (reg!(op.b), reg!(op.c));
                    types::type_set_field(ctx, ty, key, value);
                }

                OpCode::Compose => {
                    let a = reg!(op.b).as_object() as *mut TableObj;
                    let b = reg!(op.c).as_object() as *mut TableObj;
                    let merged = make_table(ctx, (*a).pairs.len() + (*b).pairs.len());
                    for pair in (*a).pairs.pairs() {
                        table_set(ctx, merged, pair.key, pair.value);
                    }
                    for pair in (*b).pairs.pairs() {
                        table_set(ctx, merged, pair.key, pair.value);
                    }
                    reg!(op.a) = Value::object(merged as *mut Obj);
                }

                OpCode::Call => {
                    let callee = reg!(op.b);
                    if !callee.is_object() {
                        return Err(error_at(thread, ip, "value is not callable"));
                    }
                    let obj = callee.as_object();

                    let old_top = thread.top;
                    thread.top = base + op.b as usize + 1;
                    let ret = op.a as i32 - (op.b as i32 + 1);

                    let result = invoke(ctx, thread, obj, op.c, ret);
                    thread.top = old_top;
                    result?;
                }

                OpCode::Jmp => {
                    ip = (ip as isize + op.ibc() as isize) as usize;
                }
                OpCode::JmpF => {
                    if reg!(op.a) == VALUE_FALSE {
                        ip = (ip as isize + op.ibc() as isize) as usize;
                    }
                }

                OpCode::Return => {
                    let value = reg!(op.a);
                    let slot = (base as i64 + return_loc as i64) as usize;
                    thread.stack[slot] = value;
                    return Ok(());
                }
                OpCode::End => return Ok(()),

                OpCode::NumFor => {
                    let current = reg!(op.a).as_number() + reg!(op.a + 1).as_number();
                    reg!(op.a) = Value::number(current);
                    if current >= reg!(op.a + 2).as_number() {
                        ip = (ip as isize + op.ibc() as isize) as usize;
                    }
                }

                OpCode::IterFor => {
                    let iter = reg!(op.a + 1);
                    if !iter.is_object() {
                        return Err(error_at(thread, ip, "iterator is not callable"));
                    }
                    let obj = iter.as_object();

                    let old_top = thread.top;
                    thread.top = base + op.a as usize + 2;
                    let result = invoke(ctx, thread, obj, 0, -2);
                    thread.top = old_top;
                    result?;

                    if reg!(op.a).is_null() {
                        ip = (ip as isize + op.ibc() as isize) as usize;
                    }
                }

                OpCode::LoadSubF => {
                    let arr = reg!(op.b);
                    if !arr.is_object() || obj_kind(arr.as_object()) != ObjKind::Array {
                        return Err(error_at(thread, ip, "value is not an array"));
                    }
                    let idx = reg!(op.c).as_number() as usize;
                    reg!(op.a) =
                        crate::object::array_get(arr.as_object() as *mut crate::object::ArrayObj, idx);
                }
                OpCode::StoreSubF => {
                    let arr = reg!(op.a);
                    if !arr.is_object() || obj_kind(arr.as_object()) != ObjKind::Array {
                        return Err(error_at(thread, ip, "value is not an array"));
                    }
                    let idx = reg!(op.b).as_number() as usize;
                    let value = reg!(op.c);
                    if !crate::object::array_set(
                        arr.as_object() as *mut crate::object::ArrayObj,
                        idx,
                        value,
                    ) {
                        return Err(error_at(thread, ip, "array index out of range"));
                    }
                }

                OpCode::Halt => {
                    return Err(error_at(thread, ip, "executed past end of function"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::VALUE_TRUE;

    fn eval(source: &str) -> Value {
        let mut ctx = Context::new();
        ctx.eval(source).expect("source evaluates")
    }

    fn eval_number(source: &str) -> f64 {
        let v = eval(source);
        assert!(v.is_number(), "expected number, got {:?}", v);
        v.as_number()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(
            eval_number("let x: number = 2\nlet y: number = 3\nreturn x + y * 4"),
            14.0
        );
    }

    #[test]
    fn test_parenthesized_grouping() {
        assert_eq!(eval_number("return (2 + 3) * 4"), 20.0);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("return 3 < 4 and 4 <= 4"), VALUE_TRUE);
        assert_eq!(eval("return 5 > 6 or not true"), VALUE_FALSE);
        assert_eq!(eval("return 1 == 1"), VALUE_TRUE);
        assert_eq!(eval("return 1 != 1"), VALUE_FALSE);
    }

    #[test]
    fn test_string_concat() {
        let v = eval("let a = \"foo\"\nlet b = \"bar\"\nreturn a + b");
        unsafe {
            let s = v.as_object() as *mut StringObj;
            assert_eq!((*s).as_str(), "foobar");
        }
    }

    #[test]
    fn test_function_call() {
        assert_eq!(
            eval_number("fn add(a: number, b: number): number { return a + b }\nreturn add(2, 9)"),
            11.0
        );
    }

    #[test]
    fn test_closure_counter() {
        assert_eq!(
            eval_number(
                "fn make(): fn: number { var n = 0 return fn: number { n += 1 return n } }\n\
                 let c = make()\n\
                 return c() + c() + c()"
            ),
            6.0
        );
    }

    #[test]
    fn test_closures_capture_independently() {
        assert_eq!(
            eval_number(
                "fn make(): fn: number { var n = 0 return fn: number { n += 1 return n } }\n\
                 let a = make()\n\
                 let b = make()\n\
                 a()\na()\n\
                 return a() * 10 + b()"
            ),
            31.0
        );
    }

    #[test]
    fn test_if_else_chain() {
        assert_eq!(
            eval_number(
                "fn pick(n: number): number { if n < 10 { return 1 } else if n < 20 { return 2 } else { return 3 } }\n\
                 return pick(5) * 100 + pick(15) * 10 + pick(25)"
            ),
            123.0
        );
    }

    #[test]
    fn test_numeric_for_loop() {
        assert_eq!(
            eval_number("var sum = 0\nfor i in 10 { sum += i }\nreturn sum"),
            45.0
        );
        assert_eq!(
            eval_number("var sum = 0\nfor i in 2 to 8 by 2 { sum += i }\nreturn sum"),
            12.0
        );
    }

    #[test]
    fn test_loop_break_continue() {
        assert_eq!(
            eval_number(
                "var sum = 0\nfor i in 10 { if i == 3 { continue }\nif i == 6 { break }\nsum += i }\nreturn sum"
            ),
            // 0+1+2+4+5
            12.0
        );
    }

    #[test]
    fn test_typed_table_cast() {
        assert_eq!(
            eval_number(
                "type V = { x: number, y: number }\n\
                 let v = { x: 3, y: 4 } as V\n\
                 return v.x * v.x + v.y * v.y"
            ),
            25.0
        );
    }

    #[test]
    fn test_table_field_assignment() {
        assert_eq!(
            eval_number(
                "type P = { x: number }\n\
                 let p = { x: 1 } as P\n\
                 p.x = 41\n\
                 p.x += 1\n\
                 return p.x"
            ),
            42.0
        );
    }

    #[test]
    fn test_array_literal_and_index() {
        assert_eq!(
            eval_number("let a = [10, 20, 30]\nreturn a[0] + a[2]"),
            40.0
        );
    }

    #[test]
    fn test_null_handling() {
        assert_eq!(eval_number("let x: number? = null\nreturn x ?? 7"), 7.0);
        assert_eq!(eval("let x: number? = 3\nreturn x?"), VALUE_TRUE);
        assert_eq!(eval_number("let x: number? = 3\nreturn x! + 1"), 4.0);
    }

    #[test]
    fn test_null_unwrap_traps() {
        let mut ctx = Context::new();
        assert!(ctx.eval("let x: number? = null\nreturn x!").is_err());
    }

    #[test]
    fn test_metamethod_dispatch() {
        assert_eq!(
            eval_number(
                "type Vec = unsealed { x: number, y: number }\n\
                 fn Vec.@add(a: Vec, b: Vec): Vec { return { x: a.x + b.x, y: a.y + b.y } as Vec }\n\
                 let a = { x: 1, y: 2 } as Vec\n\
                 let b = { x: 3, y: 4 } as Vec\n\
                 let c = a + b\n\
                 return c.x + c.y"
            ),
            10.0
        );
    }

    #[test]
    fn test_is_and_satisfies() {
        assert_eq!(eval("return 4 is number"), VALUE_TRUE);
        assert_eq!(eval("return \"s\" is number"), VALUE_FALSE);
        assert_eq!(
            eval(
                "type V = { x: number }\nlet v = { x: 1, y: 2 }\nreturn v satisfies V"
            ),
            VALUE_TRUE
        );
    }

    #[test]
    fn test_while_style_loop() {
        assert_eq!(
            eval_number("var n = 0\nfor n < 5 { n += 1 }\nreturn n"),
            5.0
        );
    }

    #[test]
    fn test_runtime_error_reports_once() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let count = Rc::new(RefCell::new(0));
        let seen = count.clone();
        let handlers = crate::context::Handlers {
            on_error: Box::new(move |_, _, _, _, _| {
                *seen.borrow_mut() += 1;
            }),
            read_file: Box::new(|_| None),
        };
        let mut ctx = Context::with_handlers(handlers);
        assert!(ctx.eval("let x: number? = null\nreturn x!").is_err());
        assert_eq!(*count.borrow(), 1);
    }
}
