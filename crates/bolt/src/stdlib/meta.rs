//! Reflection and collector controls.

use crate::context::Context;
use crate::embedding::{arg, ret};
use crate::gc;
use crate::interpreter::Thread;
use crate::object::{
    Obj, ObjKind, make_native, make_string, make_user_module, module_export_native, obj_kind,
};
use crate::types::{self, TypeObj};
use crate::value::{VALUE_NULL, Value};

/// Force a full collection; returns the number of objects freed.
fn native_gc(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let freed = gc::collect(ctx, 0);
    ret(thread, Value::number(freed as f64));
    Ok(())
}

/// Accounted heap bytes.
fn native_mem_size(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    ret(thread, Value::number(ctx.mem_size() as f64));
    Ok(())
}

fn native_pause_gc(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    gc::pause(ctx);
    ret(thread, VALUE_NULL);
    Ok(())
}

fn native_unpause_gc(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    gc::unpause(ctx);
    ret(thread, VALUE_NULL);
    Ok(())
}

fn native_typeof(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let value = arg(thread, 0);
    let ty = types::runtime_typeof(ctx, value);
    ret(thread, Value::object(ty as *mut Obj));
    Ok(())
}

fn native_type_name(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let value = arg(thread, 0);
    if !value.is_object() || unsafe { obj_kind(value.as_object()) != ObjKind::Type } {
        return Err("expected a type".to_string());
    }
    let name = types::type_name(value.as_object() as *mut TypeObj);
    let result = make_string(ctx, &name);
    ret(thread, Value::object(result as *mut Obj));
    Ok(())
}

pub fn install(ctx: &mut Context) {
    let module = make_user_module(ctx, "meta");
    ctx.push_root(module as *mut Obj);

    let number = ctx.types.number;
    let string = ctx.types.string;
    let any = ctx.types.any;
    let type_ty = ctx.types.type_;

    module_export_native(ctx, module, "gc", native_gc, number, &[]);
    module_export_native(ctx, module, "mem_size", native_mem_size, number, &[]);
    module_export_native(ctx, module, "pause_gc", native_pause_gc, std::ptr::null_mut(), &[]);
    module_export_native(
        ctx,
        module,
        "unpause_gc",
        native_unpause_gc,
        std::ptr::null_mut(),
        &[],
    );
    module_export_native(ctx, module, "typeof", native_typeof, type_ty, &[any]);
    module_export_native(ctx, module, "type_name", native_type_name, string, &[type_ty]);

    ctx.register_module("meta", module);
    ctx.pop_root();

    // gc() and mem_size() are useful enough to sit in the prelude too.
    let gc_sig = types::make_signature(ctx, number, &[]);
    let gc_fn = make_native(ctx, gc_sig, native_gc);
    ctx.register_prelude("gc", gc_sig, Value::object(gc_fn as *mut Obj));

    let mem_sig = types::make_signature(ctx, number, &[]);
    let mem_fn = make_native(ctx, mem_sig, native_mem_size);
    ctx.register_prelude("mem_size", mem_sig, Value::object(mem_fn as *mut Obj));
}
