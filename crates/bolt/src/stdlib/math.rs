//! Numeric helpers.

use crate::context::Context;
use crate::embedding::{arg, ret};
use crate::interpreter::Thread;
use crate::object::{
    Obj, make_string_hashed, make_user_module, module_export, module_export_native,
};
use crate::value::Value;

fn number_arg(thread: &Thread, idx: u8) -> Result<f64, String> {
    let value = arg(thread, idx);
    if value.is_number() {
        Ok(value.as_number())
    } else {
        Err("expected a number".to_string())
    }
}

fn native_floor(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let n = number_arg(thread, 0)?;
    ret(thread, Value::number(n.floor()));
    Ok(())
}

fn native_ceil(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let n = number_arg(thread, 0)?;
    ret(thread, Value::number(n.ceil()));
    Ok(())
}

fn native_abs(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let n = number_arg(thread, 0)?;
    ret(thread, Value::number(n.abs()));
    Ok(())
}

fn native_sqrt(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let n = number_arg(thread, 0)?;
    ret(thread, Value::number(n.sqrt()));
    Ok(())
}

fn native_min(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let a = number_arg(thread, 0)?;
    let b = number_arg(thread, 1)?;
    ret(thread, Value::number(a.min(b)));
    Ok(())
}

fn native_max(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let a = number_arg(thread, 0)?;
    let b = number_arg(thread, 1)?;
    ret(thread, Value::number(a.max(b)));
    Ok(())
}

pub fn install(ctx: &mut Context) {
    let module = make_user_module(ctx, "math");
    ctx.push_root(module as *mut Obj);

    let number = ctx.types.number;

    module_export_native(ctx, module, "floor", native_floor, number, &[number]);
    module_export_native(ctx, module, "ceil", native_ceil, number, &[number]);
    module_export_native(ctx, module, "abs", native_abs, number, &[number]);
    module_export_native(ctx, module, "sqrt", native_sqrt, number, &[number]);
    module_export_native(ctx, module, "min", native_min, number, &[number, number]);
    module_export_native(ctx, module, "max", native_max, number, &[number, number]);

    let pi_key = make_string_hashed(ctx, "pi");
    module_export(
        ctx,
        module,
        number,
        Value::object(pi_key as *mut Obj),
        Value::number(std::f64::consts::PI),
    );

    ctx.register_module("math", module);
    ctx.pop_root();
}
