//! Array methods: polymorphic signatures resolved per call site, exported
//! both as a module and onto the array type's prototype so `a.push(x)`
//! works without an import once the module is loaded.

use crate::context::Context;
use crate::embedding::{arg, call, getup, make_closure, pop, push, ret, setup};
use crate::interpreter::Thread;
use crate::object::{
    ArrayObj, ModuleObj, Obj, ObjKind, array_get, array_len, array_pop, array_push, make_array,
    make_native, make_string_hashed, make_user_module, module_export, obj_kind,
};
use crate::types::{
    self, TypeCategory, TypeData, TypeObj, array_inner, dealias, make_array_type, make_method_sig,
    make_nullable, make_poly_method, make_signature, type_add_field,
};
use crate::value::{VALUE_NULL, Value};

fn arg_array(thread: &Thread, idx: u8) -> Result<*mut ArrayObj, String> {
    let value = arg(thread, idx);
    if value.is_object() {
        let obj = value.as_object();
        unsafe {
            if obj_kind(obj) == ObjKind::Array {
                return Ok(obj as *mut ArrayObj);
            }
        }
    }
    Err("expected an array".to_string())
}

// each([T]): fn: T? — returns a generator closure over (array, index).

fn native_each(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let iter_fn = {
        let array_ty = ctx.types.array;
        let key = make_string_hashed(ctx, "$each_iter");
        types::type_get_field(ctx, array_ty, Value::object(key as *mut Obj))
            .ok_or_else(|| "array iterator is not installed".to_string())?
    };

    push(thread, iter_fn);
    push(thread, arg(thread, 0));
    push(thread, Value::number(0.0));
    let closure = make_closure(ctx, thread, 2);
    ret(thread, closure);
    Ok(())
}

fn native_each_iter(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = getup(thread, 0);
    let idx = getup(thread, 1).as_number();
    let arr = arr.as_object() as *mut ArrayObj;

    if idx as usize >= array_len(arr) {
        ret(thread, VALUE_NULL);
    } else {
        ret(thread, array_get(arr, idx as usize));
        setup(thread, 1, Value::number(idx + 1.0));
    }
    Ok(())
}

fn each_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 1 {
        return None;
    }
    let arr = dealias(args[0]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
    }
    let element = array_inner(arr);
    let nullable = make_nullable(ctx, element);
    let iter_sig = make_signature(ctx, nullable, &[]);
    Some(make_method_sig(ctx, iter_sig, &[arr]))
}

// push([T], T): number

fn native_push(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = arg_array(thread, 0)?;
    let new_len = array_push(arr, arg(thread, 1));
    ret(thread, Value::number(new_len as f64));
    Ok(())
}

fn push_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 2 {
        return None;
    }
    let arr = dealias(args[0]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
    }
    let element = array_inner(arr);
    if !types::type_satisfies(element, args[1]) {
        return None;
    }
    let number = ctx.types.number;
    Some(make_method_sig(ctx, number, &[arr, element]))
}

// pop([T]): T?

fn native_pop(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = arg_array(thread, 0)?;
    ret(thread, array_pop(arr));
    Ok(())
}

fn pop_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 1 {
        return None;
    }
    let arr = dealias(args[0]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
    }
    let element = array_inner(arr);
    let nullable = make_nullable(ctx, element);
    Some(make_method_sig(ctx, nullable, &[arr]))
}

// length([T]): number

fn native_length(_ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = arg_array(thread, 0)?;
    ret(thread, Value::number(array_len(arr) as f64));
    Ok(())
}

fn length_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 1 {
        return None;
    }
    let arr = dealias(args[0]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
    }
    let number = ctx.types.number;
    Some(make_method_sig(ctx, number, &[arr]))
}

// clone([T]): [T]

fn native_clone(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = arg_array(thread, 0)?;
    let copy = make_array(ctx, array_len(arr));
    unsafe {
        (*copy).items.extend_from_slice(&(*arr).items);
    }
    ret(thread, Value::object(copy as *mut Obj));
    Ok(())
}

fn clone_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 1 {
        return None;
    }
    let arr = dealias(args[0]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
    }
    Some(make_method_sig(ctx, arr, &[arr]))
}

// map([T], fn(T): R): [R]

fn native_map(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = arg_array(thread, 0)?;
    let mapper = arg(thread, 1);

    let result = make_array(ctx, array_len(arr));
    ctx.push_root(result as *mut Obj);

    for i in 0..array_len(arr) {
        push(thread, mapper);
        push(thread, array_get(arr, i));
        if let Err(e) = call(ctx, thread, 1) {
            ctx.pop_root();
            return Err(e);
        }
        let mapped = pop(thread);
        array_push(result, mapped);
    }

    ctx.pop_root();
    ret(thread, Value::object(result as *mut Obj));
    Ok(())
}

fn map_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 2 {
        return None;
    }
    let arr = dealias(args[0]);
    let mapper = dealias(args[1]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
        let TypeData::Signature {
            args: margs, ret, ..
        } = &(*mapper).data
        else {
            return None;
        };
        if ret.is_null() || margs.len() != 1 {
            return None;
        }
        if !types::type_satisfies(margs[0], array_inner(arr)) {
            return None;
        }
        let mapped = make_array_type(ctx, *ret);
        Some(make_method_sig(ctx, mapped, &[arr, mapper]))
    }
}

// filter([T], fn(T): bool): [T]

fn native_filter(ctx: &mut Context, thread: &mut Thread) -> Result<(), String> {
    let arr = arg_array(thread, 0)?;
    let predicate = arg(thread, 1);

    let result = make_array(ctx, 0);
    ctx.push_root(result as *mut Obj);

    for i in 0..array_len(arr) {
        let item = array_get(arr, i);
        push(thread, predicate);
        push(thread, item);
        if let Err(e) = call(ctx, thread, 1) {
            ctx.pop_root();
            return Err(e);
        }
        let keep = pop(thread);
        if keep.is_bool() && keep.as_bool() {
            array_push(result, item);
        }
    }

    ctx.pop_root();
    ret(thread, Value::object(result as *mut Obj));
    Ok(())
}

fn filter_type(ctx: &mut Context, args: &[*mut TypeObj]) -> Option<*mut TypeObj> {
    if args.len() != 2 {
        return None;
    }
    let arr = dealias(args[0]);
    let predicate = dealias(args[1]);
    unsafe {
        if (*arr).category != TypeCategory::Array {
            return None;
        }
        let TypeData::Signature {
            args: pargs, ret, ..
        } = &(*predicate).data
        else {
            return None;
        };
        if *ret != ctx.types.boolean || pargs.len() != 1 {
            return None;
        }
        if !types::type_satisfies(pargs[0], array_inner(arr)) {
            return None;
        }
    }
    Some(make_method_sig(ctx, arr, &[arr, predicate]))
}

fn export_poly(
    ctx: &mut Context,
    module: *mut ModuleObj,
    name: &str,
    display: &str,
    applicator: types::PolyApplicator,
    proc: crate::object::NativeProc,
) {
    let sig = make_poly_method(ctx, display, applicator);
    let native = make_native(ctx, sig, proc);
    ctx.push_root(native as *mut Obj);
    let key = make_string_hashed(ctx, name);
    let key = Value::object(key as *mut Obj);
    module_export(ctx, module, sig, key, Value::object(native as *mut Obj));
    let array_ty = ctx.types.array;
    type_add_field(ctx, array_ty, sig, key, Value::object(native as *mut Obj));
    ctx.pop_root();
}

pub fn install(ctx: &mut Context) {
    let module = make_user_module(ctx, "arrays");
    ctx.push_root(module as *mut Obj);

    export_poly(ctx, module, "each", "each([T]): fn: T?", each_type, native_each);
    export_poly(ctx, module, "push", "push([T], T): number", push_type, native_push);
    export_poly(ctx, module, "pop", "pop([T]): T?", pop_type, native_pop);
    export_poly(
        ctx,
        module,
        "length",
        "length([T]): number",
        length_type,
        native_length,
    );
    export_poly(ctx, module, "clone", "clone([T]): [T]", clone_type, native_clone);
    export_poly(ctx, module, "map", "map([T], fn(T): R): [R]", map_type, native_map);
    export_poly(
        ctx,
        module,
        "filter",
        "filter([T], fn(T): bool): [T]",
        filter_type,
        native_filter,
    );

    // The iterator worker lives on the array type, both to keep it alive
    // and so `each` can find it.
    let iter_fn = make_native(ctx, std::ptr::null_mut(), native_each_iter);
    ctx.push_root(iter_fn as *mut Obj);
    let array_ty = ctx.types.array;
    let key = make_string_hashed(ctx, "$each_iter");
    let any = ctx.types.any;
    type_add_field(
        ctx,
        array_ty,
        any,
        Value::object(key as *mut Obj),
        Value::object(iter_fn as *mut Obj),
    );
    ctx.pop_root();

    ctx.register_module("arrays", module);
    ctx.pop_root();
}
