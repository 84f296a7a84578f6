//! String methods, exported as a module and attached to the string type's
//! prototype.

use crate::context::Context;
use crate::embedding::{arg, ret};
use crate::interpreter::Thread;
use crate::object::{
    ModuleObj, Obj, ObjKind, StringObj, make_native, make_string, make_string_hashed,
    make_user_module, module_export, obj_kind,
};
use crate::types::{TypeObj, make_method_sig, make_nullable, type_add_field};
use crate::value::Value;

fn arg_string(thread: &Thread, idx: u8) -> Result<*mut StringObj, String> {
    let value = arg(thread, idx);
    if value.is_object() {
        let obj = value.as_object();
        unsafe {
            if obj_kind(obj) == ObjKind::String {
                return Ok(obj as *mut StringObj);
            }
        }
    }
    Err("expected a string".to_string())
}

fn native_length(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let s = arg_string(thread, 0)?;
    unsafe { ret(thread, Value::number((*s).len() as f64)) };
    Ok(())
}

/// sub(string, start, end): end is exclusive and clamped.
fn native_sub(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let s = arg_string(thread, 0)?;
    let start = arg(thread, 1).as_number().max(0.0) as usize;
    let end = arg(thread, 2).as_number().max(0.0) as usize;
    unsafe {
        let text = (*s).as_str();
        let end = end.min(text.len());
        let start = start.min(end);
        let slice = make_string(ctx, &text[start..end]);
        ret(thread, Value::object(slice as *mut Obj));
    }
    Ok(())
}

fn native_upper(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let s = arg_string(thread, 0)?;
    unsafe {
        let upper = (*s).as_str().to_uppercase();
        let result = make_string(ctx, &upper);
        ret(thread, Value::object(result as *mut Obj));
    }
    Ok(())
}

fn native_lower(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let s = arg_string(thread, 0)?;
    unsafe {
        let lower = (*s).as_str().to_lowercase();
        let result = make_string(ctx, &lower);
        ret(thread, Value::object(result as *mut Obj));
    }
    Ok(())
}

/// find(string, needle): byte offset of the first occurrence, or null.
fn native_find(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let s = arg_string(thread, 0)?;
    let needle = arg_string(thread, 1)?;
    unsafe {
        match (*s).as_str().find((*needle).as_str()) {
            Some(offset) => ret(thread, Value::number(offset as f64)),
            None => ret(thread, crate::value::VALUE_NULL),
        }
    }
    Ok(())
}

fn export_method(
    ctx: &mut Context,
    module: *mut ModuleObj,
    name: &str,
    proc: crate::object::NativeProc,
    ret_ty: *mut TypeObj,
    args: &[*mut TypeObj],
) {
    let sig = make_method_sig(ctx, ret_ty, args);
    let native = make_native(ctx, sig, proc);
    ctx.push_root(native as *mut Obj);
    let key = make_string_hashed(ctx, name);
    let key = Value::object(key as *mut Obj);
    module_export(ctx, module, sig, key, Value::object(native as *mut Obj));
    let string_ty = ctx.types.string;
    type_add_field(ctx, string_ty, sig, key, Value::object(native as *mut Obj));
    ctx.pop_root();
}

pub fn install(ctx: &mut Context) {
    let module = make_user_module(ctx, "strings");
    ctx.push_root(module as *mut Obj);

    let string = ctx.types.string;
    let number = ctx.types.number;

    export_method(ctx, module, "length", native_length, number, &[string]);
    export_method(
        ctx,
        module,
        "sub",
        native_sub,
        string,
        &[string, number, number],
    );
    export_method(ctx, module, "upper", native_upper, string, &[string]);
    export_method(ctx, module, "lower", native_lower, string, &[string]);
    let maybe_number = make_nullable(ctx, number);
    export_method(
        ctx,
        module,
        "find",
        native_find,
        maybe_number,
        &[string, string],
    );

    ctx.register_module("strings", module);
    ctx.pop_root();
}
