//! Garbage Collector
//!
//! A stop-the-world tri-color mark-and-sweep, triggered at allocation time
//! when `bytes_allocated` crosses the pacing threshold. There is no write
//! barrier: all mutation happens between instructions on the single
//! interpreter thread, so a full mark from the roots is always sound.
//! Multi-step constructions pin their partial results on the temporary-root
//! stack.
//!
//! Marking uses an explicit grey stack: greying an object sets its mark and
//! queues it; blackening pops it and greys every pointer field. Sweeping
//! walks the intrusive object list, clearing marks on survivors and
//! unlinking the rest. An optional `max_collect` cap bounds how many objects
//! one sweep may free.

use crate::context::Context;
use crate::object::{
    AnnotationObj, ArrayObj, ClosureObj, FnObj, ImportObj, ModuleObj, NativeFnObj, Obj, ObjKind,
    TableObj, UserdataObj, free_object, obj_kind,
};
use crate::types::{TypeData, TypeObj};
use crate::value::Value;

/// Collector state owned by a [`Context`].
pub struct Gc {
    pub bytes_allocated: usize,
    pub next_cycle: usize,
    pub min_size: usize,
    pub growth_pct: usize,
    pub greys: Vec<*mut Obj>,
    pub paused: bool,
}

/// Initial pacing threshold: 10 MiB.
const DEFAULT_CYCLE: usize = 10 * 1024 * 1024;
const DEFAULT_GROWTH_PCT: usize = 175;
const DEFAULT_GREY_CAP: usize = 32;

impl Gc {
    pub fn new() -> Gc {
        Gc {
            bytes_allocated: 0,
            next_cycle: DEFAULT_CYCLE,
            min_size: DEFAULT_CYCLE,
            growth_pct: DEFAULT_GROWTH_PCT,
            greys: Vec::with_capacity(DEFAULT_GREY_CAP),
            paused: false,
        }
    }
}

impl Default for Gc {
    fn default() -> Gc {
        Gc::new()
    }
}

#[inline]
fn grey(greys: &mut Vec<*mut Obj>, obj: *mut Obj) {
    if obj.is_null() {
        return;
    }
    unsafe {
        if (*obj).is_marked() {
            return;
        }
        (*obj).set_mark(true);
    }
    greys.push(obj);
}

#[inline]
fn grey_value(greys: &mut Vec<*mut Obj>, value: Value) {
    if value.is_object() {
        grey(greys, value.as_object());
    }
}

pub fn grey_obj(ctx: &mut Context, obj: *mut Obj) {
    grey(&mut ctx.gc.greys, obj);
}

/// Grey every pointer field of a marked object.
unsafe fn blacken(greys: &mut Vec<*mut Obj>, obj: *mut Obj) {
    unsafe {
        match obj_kind(obj) {
            // The root sentinel and annotation-less kinds hold no references.
            ObjKind::None | ObjKind::String => {}

            ObjKind::Type => {
                let ty = obj as *mut TypeObj;
                grey(greys, (*ty).prototype as *mut Obj);
                grey(greys, (*ty).prototype_types as *mut Obj);
                grey(greys, (*ty).prototype_values as *mut Obj);

                match &(*ty).data {
                    TypeData::None => {}
                    TypeData::Fundamental { boxed } | TypeData::Alias { boxed } => {
                        grey(greys, *boxed as *mut Obj);
                    }
                    TypeData::Array { inner } => grey(greys, *inner as *mut Obj),
                    TypeData::Tableshape {
                        layout,
                        key_layout,
                        parent,
                        key_type,
                        value_type,
                        ..
                    } => {
                        grey(greys, *layout as *mut Obj);
                        grey(greys, *key_layout as *mut Obj);
                        grey(greys, *parent as *mut Obj);
                        grey(greys, *key_type as *mut Obj);
                        grey(greys, *value_type as *mut Obj);
                    }
                    TypeData::Signature {
                        args, ret, varargs, ..
                    } => {
                        grey(greys, *ret as *mut Obj);
                        grey(greys, *varargs as *mut Obj);
                        for arg in args {
                            grey(greys, *arg as *mut Obj);
                        }
                    }
                    TypeData::Poly { .. } => {}
                    TypeData::Union { variants } => {
                        for v in variants {
                            grey(greys, *v as *mut Obj);
                        }
                    }
                    TypeData::Enum { name, options } => {
                        grey(greys, *name as *mut Obj);
                        grey(greys, *options as *mut Obj);
                    }
                    TypeData::Userdata {
                        fields, methods, ..
                    } => {
                        for field in fields {
                            grey(greys, field.ty as *mut Obj);
                            grey(greys, field.name as *mut Obj);
                        }
                        for method in methods {
                            grey(greys, method.name as *mut Obj);
                            grey(greys, method.fn_ as *mut Obj);
                        }
                    }
                }
            }

            ObjKind::Module => {
                let module = obj as *mut ModuleObj;
                grey(greys, (*module).ty as *mut Obj);
                grey(greys, (*module).exports as *mut Obj);
                grey(greys, (*module).name as *mut Obj);
                grey(greys, (*module).path as *mut Obj);
                for import in &(*module).imports {
                    grey(greys, *import as *mut Obj);
                }
                for constant in &(*module).constants {
                    grey_value(greys, *constant);
                }
            }

            ObjKind::Import => {
                let import = obj as *mut ImportObj;
                grey(greys, (*import).name as *mut Obj);
                grey(greys, (*import).ty as *mut Obj);
                grey_value(greys, (*import).value);
            }

            ObjKind::Fn | ObjKind::Method => {
                let f = obj as *mut FnObj;
                grey(greys, (*f).module as *mut Obj);
                grey(greys, (*f).signature as *mut Obj);
                for constant in &(*f).constants {
                    grey_value(greys, *constant);
                }
            }

            ObjKind::Closure => {
                let cl = obj as *mut ClosureObj;
                grey(greys, (*cl).callable);
                for upval in (*cl).upvals.iter() {
                    grey_value(greys, *upval);
                }
            }

            ObjKind::NativeFn => {
                let native = obj as *mut NativeFnObj;
                grey(greys, (*native).signature as *mut Obj);
            }

            ObjKind::Table => {
                let tbl = obj as *mut TableObj;
                grey(greys, (*tbl).prototype as *mut Obj);
                for pair in (*tbl).pairs.pairs() {
                    grey_value(greys, pair.key);
                    grey_value(greys, pair.value);
                }
            }

            ObjKind::Array => {
                let arr = obj as *mut ArrayObj;
                for item in &(*arr).items {
                    grey_value(greys, *item);
                }
            }

            ObjKind::Userdata => {
                let ud = obj as *mut UserdataObj;
                grey(greys, (*ud).ty as *mut Obj);
            }

            ObjKind::Annotation => {
                let ann = obj as *mut AnnotationObj;
                grey(greys, (*ann).name as *mut Obj);
                grey(greys, (*ann).args as *mut Obj);
                grey(greys, (*ann).next as *mut Obj);
            }
        }
    }
}

/// Run a full collection cycle. Returns the number of objects freed.
/// `max_collect` of zero means unbounded; otherwise the sweep stops early
/// after that many frees, leaving the rest for the next cycle.
pub fn collect(ctx: &mut Context, max_collect: u32) -> u32 {
    let mut greys = std::mem::take(&mut ctx.gc.greys);
    greys.clear();

    // Root set: primitive types, meta-name strings, registries, the prelude,
    // temporary roots, and the active thread's reachable stack.
    grey(&mut greys, ctx.types.any as *mut Obj);
    grey(&mut greys, ctx.types.null as *mut Obj);
    grey(&mut greys, ctx.types.number as *mut Obj);
    grey(&mut greys, ctx.types.boolean as *mut Obj);
    grey(&mut greys, ctx.types.string as *mut Obj);
    grey(&mut greys, ctx.types.array as *mut Obj);
    grey(&mut greys, ctx.types.table as *mut Obj);
    grey(&mut greys, ctx.types.type_ as *mut Obj);

    for name in ctx.meta_names.all() {
        grey(&mut greys, name as *mut Obj);
    }

    grey(&mut greys, ctx.root);
    grey(&mut greys, ctx.type_registry as *mut Obj);
    grey(&mut greys, ctx.prelude as *mut Obj);
    grey(&mut greys, ctx.loaded_modules as *mut Obj);

    for root in &ctx.troots {
        grey(&mut greys, *root);
    }

    if !ctx.current_thread.is_null() {
        unsafe {
            let thread = &*ctx.current_thread;
            for frame in &thread.frames {
                grey(&mut greys, frame.callable);
            }
            if let Some(frame) = thread.frames.last() {
                let top = thread.top + frame.size as usize + frame.user_top as usize;
                for slot in &thread.stack[..top.min(thread.stack.len())] {
                    grey_value(&mut greys, *slot);
                }
            }
            grey(&mut greys, thread.last_error as *mut Obj);
        }
    }

    while let Some(obj) = greys.pop() {
        unsafe { blacken(&mut greys, obj) };
    }

    ctx.gc.greys = greys;

    // Sweep: unlink and free everything left unmarked.
    let mut collected = 0u32;
    let mut prev = ctx.root;
    let mut current = unsafe { (*prev).next() };

    while !current.is_null() {
        unsafe {
            if (*current).is_marked() {
                (*current).set_mark(false);
                prev = current;
                current = (*current).next();
            } else {
                let doomed = current;
                current = (*current).next();
                (*prev).set_next(current);
                let freed = free_object(ctx, doomed);
                ctx.gc.bytes_allocated = ctx.gc.bytes_allocated.saturating_sub(freed);

                collected += 1;
                if max_collect != 0 && collected >= max_collect {
                    ctx.tail = find_tail(ctx.root);
                    return collected;
                }
            }
        }
    }

    ctx.tail = prev;

    ctx.gc.next_cycle =
        ((ctx.gc.bytes_allocated * ctx.gc.growth_pct) / 100).max(ctx.gc.min_size);

    tracing::debug!(
        collected,
        bytes_allocated = ctx.gc.bytes_allocated,
        next_cycle = ctx.gc.next_cycle,
        "gc cycle complete"
    );

    collected
}

fn find_tail(root: *mut Obj) -> *mut Obj {
    let mut tail = root;
    unsafe {
        while !(*tail).next().is_null() {
            tail = (*tail).next();
        }
    }
    tail
}

pub fn pause(ctx: &mut Context) {
    ctx.gc.paused = true;
}

pub fn unpause(ctx: &mut Context) {
    ctx.gc.paused = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{make_string, make_table, table_set_str};

    #[test]
    fn test_collect_reclaims_unreferenced() {
        let mut ctx = Context::new();
        collect(&mut ctx, 0);
        let baseline = ctx.gc.bytes_allocated;

        for i in 0..64 {
            let garbage = make_table(&mut ctx, 0);
            table_set_str(&mut ctx, garbage, "n", Value::number(i as f64));
        }
        assert!(ctx.gc.bytes_allocated > baseline);

        let freed = collect(&mut ctx, 0);
        assert!(freed >= 64);
        // Within a constant factor of the baseline: the key strings interned
        // per iteration are garbage too.
        assert!(ctx.gc.bytes_allocated <= baseline + 1024);
    }

    #[test]
    fn test_troot_pins_object() {
        let mut ctx = Context::new();
        let pinned = make_string(&mut ctx, "keep me");
        ctx.push_root(pinned as *mut Obj);

        collect(&mut ctx, 0);
        unsafe {
            assert_eq!((*pinned).as_str(), "keep me");
            assert!(!(*pinned).obj.is_marked(), "marks are cleared after sweep");
        }
        ctx.pop_root();

        collect(&mut ctx, 0);
        // No assertion on the string contents now — it was reclaimed.
    }

    #[test]
    fn test_registry_objects_survive() {
        let mut ctx = Context::new();
        let before = ctx.gc.bytes_allocated;
        collect(&mut ctx, 0);
        collect(&mut ctx, 0);
        // Primitive types, meta names, and registries never shrink away.
        assert!(ctx.gc.bytes_allocated > 0);
        assert!(ctx.gc.bytes_allocated <= before);
    }

    #[test]
    fn test_max_collect_caps_sweep() {
        let mut ctx = Context::new();
        collect(&mut ctx, 0);
        for _ in 0..32 {
            make_table(&mut ctx, 0);
        }
        let freed = collect(&mut ctx, 8);
        assert_eq!(freed, 8);
        let freed = collect(&mut ctx, 0);
        assert!(freed >= 24);
    }

    #[test]
    fn test_paused_gc_defers() {
        let mut ctx = Context::new();
        pause(&mut ctx);
        assert!(ctx.gc.paused);
        unpause(&mut ctx);
        assert!(!ctx.gc.paused);
    }
}
