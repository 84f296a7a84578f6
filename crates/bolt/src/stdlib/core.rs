//! Core prelude: always-available functions every module can reach without
//! an import.

use crate::context::Context;
use crate::embedding::{arg, argc, ret};
use crate::interpreter::Thread;
use crate::object::{Obj, ObjKind, make_native, obj_kind, to_string};
use crate::types::{make_signature, make_vararg};
use crate::value::{VALUE_NULL, Value};

fn native_print(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let count = argc(thread);
    let mut pieces = Vec::with_capacity(count as usize);
    for i in 0..count {
        let value = arg(thread, i);
        let s = to_string(ctx, value);
        unsafe { pieces.push((*s).as_str().to_string()) };
    }
    println!("{}", pieces.join(" "));
    ret(thread, VALUE_NULL);
    Ok(())
}

fn native_error(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let value = arg(thread, 0);
    if value.is_object() {
        unsafe {
            let obj = value.as_object();
            if obj_kind(obj) == ObjKind::String {
                let s = obj as *mut crate::object::StringObj;
                return Err((*s).as_str().to_string());
            }
        }
    }
    Err("error".to_string())
}

fn native_assert(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let value = arg(thread, 0);
    if value.is_bool() && value.as_bool() {
        ret(thread, VALUE_NULL);
        Ok(())
    } else {
        Err("assertion failed".to_string())
    }
}

pub fn install(ctx: &mut Context) {
    let any = ctx.types.any;
    let string = ctx.types.string;
    let boolean = ctx.types.boolean;

    let print_sig = make_signature(ctx, std::ptr::null_mut(), &[]);
    let print_sig = make_vararg(ctx, print_sig, any);
    let print_fn = make_native(ctx, print_sig, native_print);
    ctx.register_prelude("print", print_sig, Value::object(print_fn as *mut Obj));

    let error_sig = make_signature(ctx, std::ptr::null_mut(), &[string]);
    let error_fn = make_native(ctx, error_sig, native_error);
    ctx.register_prelude("error", error_sig, Value::object(error_fn as *mut Obj));

    let assert_sig = make_signature(ctx, std::ptr::null_mut(), &[boolean]);
    let assert_fn = make_native(ctx, assert_sig, native_assert);
    ctx.register_prelude("assert", assert_sig, Value::object(assert_fn as *mut Obj));
}
