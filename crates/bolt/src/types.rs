//! Type System
//!
//! Types are heap objects like everything else, so user code can hold and
//! pass them. Each type carries a *satisfier*: the predicate deciding
//! whether another type is assignable to it. Satisfiers compose — unions
//! defer to member satisfaction, arrays recurse into their element type,
//! signatures match arguments contravariantly and returns covariantly, and
//! tableshapes require every declared key to be satisfied on the right.
//!
//! Aliases are transparent: comparisons and satisfaction dealias first.

use crate::context::Context;
use crate::object::{
    Obj, ObjKind, StringObj, TableObj, UserdataObj, make_string_hashed, make_table, obj_kind,
    table_get, table_set, to_string, value_is_equal,
};
use crate::value::{VALUE_NULL, Value};

pub type Satisfier = fn(*mut TypeObj, *mut TypeObj) -> bool;

/// Host-side applicator for polymorphic signatures: given the actual
/// argument types at a call site, synthesize a concrete signature or decline.
pub type PolyApplicator = fn(&mut Context, &[*mut TypeObj]) -> Option<*mut TypeObj>;

pub type FieldGetter = fn(&mut Context, &[u8], u32) -> Value;
pub type FieldSetter = fn(&mut Context, &mut [u8], u32, Value);
pub type Finalizer = fn(&mut Context, *mut UserdataObj);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    /// Type-of-type: the fundamental `Type`, and aliases.
    Type,
    Primitive,
    Array,
    Tableshape,
    Signature,
    Union,
    Enum,
    Userdata,
}

pub struct UserdataField {
    pub ty: *mut TypeObj,
    pub name: *mut StringObj,
    pub getter: FieldGetter,
    pub setter: Option<FieldSetter>,
    pub offset: u32,
}

pub struct UserdataMethod {
    pub name: *mut StringObj,
    pub fn_: *mut crate::object::NativeFnObj,
}

pub enum TypeData {
    None,
    /// The fundamental `Type` (boxed = any).
    Fundamental { boxed: *mut TypeObj },
    Alias { boxed: *mut TypeObj },
    Array { inner: *mut TypeObj },
    Tableshape {
        /// key → field type
        layout: *mut TableObj,
        /// key → key type (map shapes)
        key_layout: *mut TableObj,
        parent: *mut TypeObj,
        key_type: *mut TypeObj,
        value_type: *mut TypeObj,
        sealed: bool,
        is_final: bool,
        map: bool,
    },
    Signature {
        args: Vec<*mut TypeObj>,
        /// Null for procedures without a return value.
        ret: *mut TypeObj,
        varargs: *mut TypeObj,
        is_vararg: bool,
        is_method: bool,
    },
    Poly {
        applicator: PolyApplicator,
        is_method: bool,
    },
    Union { variants: Vec<*mut TypeObj> },
    Enum {
        name: *mut StringObj,
        options: *mut TableObj,
    },
    Userdata {
        fields: Vec<UserdataField>,
        methods: Vec<UserdataMethod>,
        finalizer: Option<Finalizer>,
    },
}

#[repr(C)]
pub struct TypeObj {
    pub obj: Obj,
    pub name: Option<String>,
    pub satisfier: Satisfier,
    pub category: TypeCategory,
    pub is_polymorphic: bool,
    /// Parent type for prototype chains (tableshape composition).
    pub prototype: *mut TypeObj,
    /// key → member type, for members attached to this type.
    pub prototype_types: *mut TableObj,
    /// key → member value; becomes the table prototype of cast values.
    pub prototype_values: *mut TableObj,
    pub data: TypeData,
}

pub fn make_type(
    ctx: &mut Context,
    name: Option<&str>,
    satisfier: Satisfier,
    category: TypeCategory,
    data: TypeData,
) -> *mut TypeObj {
    ctx.allocate(
        ObjKind::Type,
        TypeObj {
            obj: Obj::new(ObjKind::Type),
            name: name.map(|n| n.to_string()),
            satisfier,
            category,
            is_polymorphic: false,
            prototype: std::ptr::null_mut(),
            prototype_types: std::ptr::null_mut(),
            prototype_values: std::ptr::null_mut(),
            data,
        },
        0,
    )
}

pub fn type_name(ty: *mut TypeObj) -> String {
    if ty.is_null() {
        return "<none>".to_string();
    }
    unsafe {
        if let Some(name) = &(*ty).name {
            return name.clone();
        }
        match (*ty).category {
            TypeCategory::Array => {
                if let TypeData::Array { inner } = &(*ty).data {
                    format!("[{}]", type_name(*inner))
                } else {
                    "[?]".to_string()
                }
            }
            TypeCategory::Union => {
                if let TypeData::Union { variants } = &(*ty).data {
                    variants
                        .iter()
                        .map(|v| type_name(*v))
                        .collect::<Vec<_>>()
                        .join(" | ")
                } else {
                    "<union>".to_string()
                }
            }
            TypeCategory::Tableshape => "table".to_string(),
            _ => "<anonymous>".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Satisfiers
// ---------------------------------------------------------------------------

pub fn satisfier_any(_left: *mut TypeObj, _right: *mut TypeObj) -> bool {
    true
}

pub fn satisfier_same(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    left == right
}

pub fn satisfier_alias(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    let left = dealias(left);
    let right = dealias(right);
    unsafe { ((*left).satisfier)(left, right) }
}

pub fn satisfier_array(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    unsafe {
        let right = dealias(right);
        if (*left).category != TypeCategory::Array || (*right).category != TypeCategory::Array {
            return false;
        }
        let (TypeData::Array { inner: li }, TypeData::Array { inner: ri }) =
            (&(*left).data, &(*right).data)
        else {
            return false;
        };
        ((**li).satisfier)(*li, dealias(*ri))
    }
}

pub fn satisfier_table(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    unsafe {
        let right = dealias(right);
        if left == right {
            return true;
        }
        if (*left).category != TypeCategory::Tableshape
            || (*right).category != TypeCategory::Tableshape
        {
            return false;
        }

        let TypeData::Tableshape {
            layout: llayout,
            sealed: lsealed,
            ..
        } = &(*left).data
        else {
            return false;
        };
        let TypeData::Tableshape {
            layout: rlayout,
            parent: rparent,
            ..
        } = &(*right).data
        else {
            return false;
        };
        let (llayout, lsealed) = (*llayout, *lsealed);
        let (rlayout, rparent) = (*rlayout, *rparent);

        // A composed shape satisfies anything its parent does.
        if !rparent.is_null() && satisfier_table(left, rparent) {
            return true;
        }

        if lsealed && !llayout.is_null() && !rlayout.is_null() {
            if (*llayout).pairs.len() != (*rlayout).pairs.len() {
                return false;
            }
        }

        // An empty unsealed `{}` shape binds to any table.
        if llayout.is_null() {
            return true;
        }

        if (*left).prototype_values != std::ptr::null_mut()
            && (*left).prototype_values != (*right).prototype_values
        {
            return false;
        }

        for lentry in (*llayout).pairs.pairs() {
            let mut found = false;
            if !rlayout.is_null() {
                for rentry in (*rlayout).pairs.pairs() {
                    let lty = lentry.value.as_object() as *mut TypeObj;
                    let rty = rentry.value.as_object() as *mut TypeObj;
                    if value_is_equal(lentry.key, rentry.key) && ((*lty).satisfier)(lty, rty) {
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return false;
            }
        }

        true
    }
}

pub fn satisfier_union(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    unsafe {
        let right = dealias(right);
        if (*left).category != TypeCategory::Union {
            return false;
        }
        let TypeData::Union { variants } = &(*left).data else {
            return false;
        };

        if (*right).category == TypeCategory::Union {
            let TypeData::Union { variants: rvariants } = &(*right).data else {
                return false;
            };
            // Every right variant must satisfy some left variant.
            for rv in rvariants {
                let mut found = false;
                for lv in variants {
                    if ((**lv).satisfier)(*lv, *rv) {
                        found = true;
                        break;
                    }
                }
                if !found {
                    return false;
                }
            }
            true
        } else {
            variants.iter().any(|lv| ((**lv).satisfier)(*lv, right))
        }
    }
}

pub fn satisfier_signature(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    unsafe {
        let right = dealias(right);
        if (*left).category != TypeCategory::Signature
            || (*right).category != TypeCategory::Signature
        {
            return false;
        }

        let TypeData::Signature {
            args: largs,
            ret: lret,
            varargs: lvar,
            is_vararg: lis_vararg,
            ..
        } = &(*left).data
        else {
            return false;
        };
        let TypeData::Signature {
            args: rargs,
            ret: rret,
            varargs: rvar,
            is_vararg: ris_vararg,
            ..
        } = &(*right).data
        else {
            return false;
        };

        if *lis_vararg && !*ris_vararg {
            return false;
        }
        if *lis_vararg && !((**rvar).satisfier)(*rvar, *lvar) {
            return false;
        }

        if largs.len() != rargs.len() {
            if largs.len() < rargs.len() {
                return false;
            }
            if !*ris_vararg {
                return false;
            }
        }

        match (lret.is_null(), rret.is_null()) {
            (true, false) | (false, true) => return false,
            (false, false) => {
                if !((**lret).satisfier)(*lret, *rret) {
                    return false;
                }
            }
            _ => {}
        }

        let typed = largs.len().min(rargs.len());
        for i in 0..typed {
            let la = largs[i];
            let ra = rargs[i];
            // Contravariant: the right (callee) argument must accept the left's.
            if !((*ra).satisfier)(ra, la) {
                return false;
            }
        }

        for la in largs.iter().skip(typed) {
            if !((**rvar).satisfier)(*rvar, *la) {
                return false;
            }
        }

        true
    }
}

/// Dealias both sides, then apply the left type's satisfier. The standard
/// entry point for assignability checks.
pub fn type_satisfies(left: *mut TypeObj, right: *mut TypeObj) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    let left = dealias(left);
    let right = dealias(right);
    unsafe { ((*left).satisfier)(left, right) }
}

// ---------------------------------------------------------------------------
// Aliases and nullability
// ---------------------------------------------------------------------------

pub fn make_alias(ctx: &mut Context, name: Option<&str>, boxed: *mut TypeObj) -> *mut TypeObj {
    make_type(
        ctx,
        name,
        satisfier_alias,
        TypeCategory::Type,
        TypeData::Alias { boxed },
    )
}

pub fn make_fundamental(ctx: &mut Context) -> *mut TypeObj {
    make_type(
        ctx,
        Some("Type"),
        satisfier_same,
        TypeCategory::Type,
        TypeData::Fundamental {
            boxed: std::ptr::null_mut(),
        },
    )
}

pub fn dealias(ty: *mut TypeObj) -> *mut TypeObj {
    unsafe {
        if ty.is_null() {
            return ty;
        }
        match &(*ty).data {
            TypeData::Alias { boxed } | TypeData::Fundamental { boxed } if !boxed.is_null() => {
                dealias(*boxed)
            }
            _ => ty,
        }
    }
}

pub fn is_alias(ty: *mut TypeObj) -> bool {
    unsafe { matches!((*ty).data, TypeData::Alias { .. }) }
}

pub fn is_optional(ctx: &Context, ty: *mut TypeObj) -> bool {
    if ty.is_null() {
        return false;
    }
    let ty = dealias(ty);
    if ty == ctx.types.null {
        return true;
    }
    unsafe {
        if let TypeData::Union { variants } = &(*ty).data {
            return variants.iter().any(|v| dealias(*v) == ctx.types.null);
        }
    }
    false
}

/// `T?` — a union of T and null. Idempotent for already-nullable types.
pub fn make_nullable(ctx: &mut Context, ty: *mut TypeObj) -> *mut TypeObj {
    if is_optional(ctx, ty) {
        return ty;
    }
    let null_ty = ctx.types.null;
    make_or_extend_union(ctx, ty, null_ty)
}

/// Strip the null variant; a two-variant union collapses to the survivor.
pub fn remove_nullable(ctx: &mut Context, ty: *mut TypeObj) -> *mut TypeObj {
    let ty = dealias(ty);
    unsafe {
        if let TypeData::Union { variants } = &(*ty).data {
            let null_ty = ctx.types.null;
            let remaining: Vec<*mut TypeObj> = variants
                .iter()
                .copied()
                .filter(|v| dealias(*v) != null_ty)
                .collect();
            if remaining.len() == 1 {
                return remaining[0];
            }
            let name = remaining
                .iter()
                .map(|v| type_name(*v))
                .collect::<Vec<_>>()
                .join(" | ");
            return make_type(
                ctx,
                Some(&name),
                satisfier_union,
                TypeCategory::Union,
                TypeData::Union {
                    variants: remaining,
                },
            );
        }
    }
    ty
}

// ---------------------------------------------------------------------------
// Unions
// ---------------------------------------------------------------------------

pub fn make_union(ctx: &mut Context, variants: Vec<*mut TypeObj>) -> *mut TypeObj {
    let name = variants
        .iter()
        .map(|v| type_name(*v))
        .collect::<Vec<_>>()
        .join(" | ");
    make_type(
        ctx,
        Some(&name),
        satisfier_union,
        TypeCategory::Union,
        TypeData::Union { variants },
    )
}

pub fn union_has_variant(uni: *mut TypeObj, variant: *mut TypeObj) -> bool {
    unsafe {
        if let TypeData::Union { variants } = &(*dealias(uni)).data {
            variants.iter().any(|v| type_is_equal(*v, variant))
        } else {
            false
        }
    }
}

/// Extend an existing union with a variant, or start a fresh two-variant
/// union. Existing unions are not mutated; ordering is preserved.
pub fn make_or_extend_union(
    ctx: &mut Context,
    base: *mut TypeObj,
    variant: *mut TypeObj,
) -> *mut TypeObj {
    unsafe {
        let deal = dealias(base);
        if (*deal).category == TypeCategory::Union {
            if union_has_variant(deal, variant) {
                return base;
            }
            let TypeData::Union { variants } = &(*deal).data else {
                unreachable!()
            };
            let mut extended = variants.clone();
            extended.push(variant);
            return make_union(ctx, extended);
        }
    }
    make_union(ctx, vec![base, variant])
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

fn signature_display_name(args: &[*mut TypeObj], ret: *mut TypeObj) -> String {
    let args = args
        .iter()
        .map(|a| type_name(*a))
        .collect::<Vec<_>>()
        .join(", ");
    if ret.is_null() {
        format!("fn({})", args)
    } else {
        format!("fn({}): {}", args, type_name(ret))
    }
}

pub fn make_signature(ctx: &mut Context, ret: *mut TypeObj, args: &[*mut TypeObj]) -> *mut TypeObj {
    let name = signature_display_name(args, ret);
    make_type(
        ctx,
        Some(&name),
        satisfier_signature,
        TypeCategory::Signature,
        TypeData::Signature {
            args: args.to_vec(),
            ret,
            varargs: std::ptr::null_mut(),
            is_vararg: false,
            is_method: false,
        },
    )
}

/// A signature whose first argument is the receiver, eligible for dot-call
/// sugar.
pub fn make_method_sig(ctx: &mut Context, ret: *mut TypeObj, args: &[*mut TypeObj]) -> *mut TypeObj {
    let sig = make_signature(ctx, ret, args);
    unsafe {
        if let TypeData::Signature { is_method, .. } = &mut (*sig).data {
            *is_method = true;
        }
    }
    sig
}

/// Mark a signature variadic with a typed tail.
pub fn make_vararg(ctx: &mut Context, original: *mut TypeObj, tail: *mut TypeObj) -> *mut TypeObj {
    let _ = ctx;
    unsafe {
        if let TypeData::Signature {
            varargs, is_vararg, ..
        } = &mut (*original).data
        {
            *varargs = tail;
            *is_vararg = true;
        }
    }
    original
}

pub fn make_poly_signature(
    ctx: &mut Context,
    name: &str,
    applicator: PolyApplicator,
) -> *mut TypeObj {
    let ty = make_type(
        ctx,
        Some(name),
        satisfier_same,
        TypeCategory::Signature,
        TypeData::Poly {
            applicator,
            is_method: false,
        },
    );
    unsafe { (*ty).is_polymorphic = true };
    ty
}

pub fn make_poly_method(ctx: &mut Context, name: &str, applicator: PolyApplicator) -> *mut TypeObj {
    let ty = make_poly_signature(ctx, name, applicator);
    unsafe {
        if let TypeData::Poly { is_method, .. } = &mut (*ty).data {
            *is_method = true;
        }
    }
    ty
}

pub fn signature_return(sig: *mut TypeObj) -> *mut TypeObj {
    unsafe {
        match &(*dealias(sig)).data {
            TypeData::Signature { ret, .. } => *ret,
            _ => std::ptr::null_mut(),
        }
    }
}

pub fn signature_is_method(sig: *mut TypeObj) -> bool {
    unsafe {
        match &(*dealias(sig)).data {
            TypeData::Signature { is_method, .. } => *is_method,
            TypeData::Poly { is_method, .. } => *is_method,
            _ => false,
        }
    }
}

/// Resolve a polymorphic callee against actual argument types.
pub fn apply_poly(
    ctx: &mut Context,
    poly: *mut TypeObj,
    args: &[*mut TypeObj],
) -> Option<*mut TypeObj> {
    unsafe {
        match &(*dealias(poly)).data {
            TypeData::Poly { applicator, .. } => applicator(ctx, args),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Arrays
// ---------------------------------------------------------------------------

pub fn make_array_type(ctx: &mut Context, inner: *mut TypeObj) -> *mut TypeObj {
    let name = format!("[{}]", type_name(inner));
    make_type(
        ctx,
        Some(&name),
        satisfier_array,
        TypeCategory::Array,
        TypeData::Array { inner },
    )
}

pub fn array_inner(ty: *mut TypeObj) -> *mut TypeObj {
    unsafe {
        match &(*dealias(ty)).data {
            TypeData::Array { inner } => *inner,
            _ => std::ptr::null_mut(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tableshapes
// ---------------------------------------------------------------------------

pub fn make_tableshape(ctx: &mut Context, name: &str, sealed: bool) -> *mut TypeObj {
    let shape = make_type(
        ctx,
        Some(name),
        satisfier_table,
        TypeCategory::Tableshape,
        TypeData::Tableshape {
            layout: std::ptr::null_mut(),
            key_layout: std::ptr::null_mut(),
            parent: std::ptr::null_mut(),
            key_type: std::ptr::null_mut(),
            value_type: std::ptr::null_mut(),
            sealed,
            is_final: false,
            map: false,
        },
    );
    ctx.push_root(shape as *mut Obj);
    let layout = make_table(ctx, 0);
    let key_layout = make_table(ctx, 0);
    unsafe {
        if let TypeData::Tableshape {
            layout: l,
            key_layout: kl,
            ..
        } = &mut (*shape).data
        {
            *l = layout;
            *kl = key_layout;
        }
    }
    ctx.pop_root();
    shape
}

/// A map shape `{ [K]: V }`.
pub fn make_map(ctx: &mut Context, key: *mut TypeObj, value: *mut TypeObj) -> *mut TypeObj {
    let shape = make_tableshape(ctx, "map", false);
    unsafe {
        if let TypeData::Tableshape {
            key_type,
            value_type,
            map,
            ..
        } = &mut (*shape).data
        {
            *key_type = key;
            *value_type = value;
            *map = true;
        }
    }
    shape
}

pub fn tableshape_add_layout(
    ctx: &mut Context,
    shape: *mut TypeObj,
    key: Value,
    field_ty: *mut TypeObj,
) {
    unsafe {
        if let TypeData::Tableshape { layout, .. } = &(*dealias(shape)).data {
            let layout = *layout;
            if !layout.is_null() {
                table_set(ctx, layout, key, Value::object(field_ty as *mut Obj));
            }
        }
    }
}

pub fn tableshape_get_layout(shape: *mut TypeObj, key: Value) -> *mut TypeObj {
    unsafe {
        if let TypeData::Tableshape { layout, parent, .. } = &(*dealias(shape)).data {
            let (layout, parent) = (*layout, *parent);
            if !layout.is_null() {
                let found = table_get(layout, key);
                if !found.is_null() {
                    return found.as_object() as *mut TypeObj;
                }
            }
            if !parent.is_null() {
                return tableshape_get_layout(parent, key);
            }
        }
        std::ptr::null_mut()
    }
}

pub fn tableshape_set_parent(shape: *mut TypeObj, parent: *mut TypeObj) {
    unsafe {
        if let TypeData::Tableshape { parent: p, .. } = &mut (*dealias(shape)).data {
            *p = parent;
        }
    }
}

pub fn tableshape_set_sealed(shape: *mut TypeObj, sealed: bool) {
    unsafe {
        if let TypeData::Tableshape { sealed: s, .. } = &mut (*dealias(shape)).data {
            *s = sealed;
        }
    }
}

pub fn tableshape_set_final(shape: *mut TypeObj, is_final: bool) {
    unsafe {
        if let TypeData::Tableshape { is_final: f, .. } = &mut (*dealias(shape)).data {
            *f = is_final;
        }
    }
}

pub fn tableshape_is_sealed(shape: *mut TypeObj) -> bool {
    unsafe {
        matches!(
            (*dealias(shape)).data,
            TypeData::Tableshape { sealed: true, .. }
        )
    }
}

pub fn tableshape_is_final(shape: *mut TypeObj) -> bool {
    unsafe {
        matches!(
            (*dealias(shape)).data,
            TypeData::Tableshape { is_final: true, .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Type prototypes (shared members and metamethods)
// ---------------------------------------------------------------------------

/// Prototype table of a type, created on first use. Cast values adopt this
/// table as their prototype, sharing members without per-instance storage.
pub fn type_get_proto(ctx: &mut Context, ty: *mut TypeObj) -> *mut TableObj {
    let ty = dealias(ty);
    unsafe {
        if (*ty).prototype_values.is_null() {
            ctx.push_root(ty as *mut Obj);
            let values = make_table(ctx, 0);
            (*ty).prototype_values = values;
            let types = make_table(ctx, 0);
            (*ty).prototype_types = types;
            ctx.pop_root();
        }
        (*ty).prototype_values
    }
}

/// Attach a typed member to a type's prototype.
pub fn type_add_field(
    ctx: &mut Context,
    ty: *mut TypeObj,
    field_ty: *mut TypeObj,
    key: Value,
    value: Value,
) {
    let ty = dealias(ty);
    type_get_proto(ctx, ty);
    unsafe {
        table_set(ctx, (*ty).prototype_types, key, Value::object(field_ty as *mut Obj));
        table_set(ctx, (*ty).prototype_values, key, value);
    }
}

/// Record a member's type without a value yet. The parser uses this for
/// `fn Type.name` declarations so later dot accesses type-check; the value
/// itself lands at module run time via `TSET`.
pub fn type_add_field_type(
    ctx: &mut Context,
    ty: *mut TypeObj,
    field_ty: *mut TypeObj,
    key: Value,
) {
    let ty = dealias(ty);
    type_get_proto(ctx, ty);
    unsafe {
        table_set(ctx, (*ty).prototype_types, key, Value::object(field_ty as *mut Obj));
    }
}

/// Set a member value, inferring its type from the value. Backs the `TSET`
/// instruction.
pub fn type_set_field(ctx: &mut Context, ty: *mut TypeObj, key: Value, value: Value) {
    let field_ty = runtime_typeof(ctx, value);
    type_add_field(ctx, ty, field_ty, key, value);
}

/// Look up a member on a type's prototype (or its parent shape's).
pub fn type_get_field(ctx: &mut Context, ty: *mut TypeObj, key: Value) -> Option<Value> {
    let _ = ctx;
    let ty = dealias(ty);
    unsafe {
        if !(*ty).prototype_values.is_null() {
            let found = table_get((*ty).prototype_values, key);
            if !found.is_null() {
                return Some(found);
            }
        }
        if !(*ty).prototype.is_null() {
            return type_get_field(ctx, (*ty).prototype, key);
        }
        if let TypeData::Enum { options, .. } = &(*ty).data {
            let found = table_get(*options, key);
            if !found.is_null() {
                return Some(found);
            }
        }
    }
    None
}

pub fn type_get_field_type(ty: *mut TypeObj, key: Value) -> *mut TypeObj {
    let ty = dealias(ty);
    unsafe {
        if !(*ty).prototype_types.is_null() {
            let found = table_get((*ty).prototype_types, key);
            if !found.is_null() {
                return found.as_object() as *mut TypeObj;
            }
        }
        if !(*ty).prototype.is_null() {
            return type_get_field_type((*ty).prototype, key);
        }
    }
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

pub fn make_enum(ctx: &mut Context, name: &str) -> *mut TypeObj {
    let name_str = make_string_hashed(ctx, name);
    ctx.push_root(name_str as *mut Obj);
    let options = make_table(ctx, 0);
    ctx.pop_root();
    make_type(
        ctx,
        Some(name),
        satisfier_same,
        TypeCategory::Enum,
        TypeData::Enum {
            name: name_str,
            options,
        },
    )
}

pub fn enum_push_option(ctx: &mut Context, enum_ty: *mut TypeObj, name: &str, value: Value) {
    unsafe {
        if let TypeData::Enum { options, .. } = &(*dealias(enum_ty)).data {
            let options = *options;
            let key = make_string_hashed(ctx, name);
            table_set(ctx, options, Value::object(key as *mut Obj), value);
        }
    }
}

pub fn enum_get(ctx: &mut Context, enum_ty: *mut TypeObj, name: &str) -> Value {
    unsafe {
        if let TypeData::Enum { options, .. } = &(*dealias(enum_ty)).data {
            let options = *options;
            let key = make_string_hashed(ctx, name);
            return table_get(options, Value::object(key as *mut Obj));
        }
    }
    VALUE_NULL
}

pub fn enum_contains(enum_ty: *mut TypeObj, value: Value) -> bool {
    unsafe {
        if let TypeData::Enum { options, .. } = &(*dealias(enum_ty)).data {
            return (**options)
                .pairs
                .pairs()
                .iter()
                .any(|p| value_is_equal(p.value, value));
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Userdata
// ---------------------------------------------------------------------------

pub fn make_userdata_type(ctx: &mut Context, name: &str) -> *mut TypeObj {
    make_type(
        ctx,
        Some(name),
        satisfier_same,
        TypeCategory::Userdata,
        TypeData::Userdata {
            fields: Vec::new(),
            methods: Vec::new(),
            finalizer: None,
        },
    )
}

pub fn userdata_set_finalizer(ty: *mut TypeObj, finalizer: Finalizer) {
    unsafe {
        if let TypeData::Userdata { finalizer: f, .. } = &mut (*ty).data {
            *f = Some(finalizer);
        }
    }
}

pub fn run_finalizer(ctx: &mut Context, ud: *mut UserdataObj) {
    unsafe {
        let ty = (*ud).ty;
        if ty.is_null() {
            return;
        }
        if let TypeData::Userdata {
            finalizer: Some(f), ..
        } = &(*ty).data
        {
            let f = *f;
            f(ctx, ud);
        }
    }
}

fn userdata_add_field(
    ctx: &mut Context,
    ty: *mut TypeObj,
    field_ty: *mut TypeObj,
    name: &str,
    offset: u32,
    getter: FieldGetter,
    setter: Option<FieldSetter>,
) {
    let name = make_string_hashed(ctx, name);
    unsafe {
        if let TypeData::Userdata { fields, .. } = &mut (*ty).data {
            fields.push(UserdataField {
                ty: field_ty,
                name,
                getter,
                setter,
                offset,
            });
        }
    }
}

fn f64_getter(_ctx: &mut Context, data: &[u8], offset: u32) -> Value {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset as usize..offset as usize + 8]);
    Value::number(f64::from_ne_bytes(bytes))
}

fn f64_setter(_ctx: &mut Context, data: &mut [u8], offset: u32, value: Value) {
    let bytes = value.as_number().to_ne_bytes();
    data[offset as usize..offset as usize + 8].copy_from_slice(&bytes);
}

fn i64_getter(_ctx: &mut Context, data: &[u8], offset: u32) -> Value {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset as usize..offset as usize + 8]);
    Value::number(i64::from_ne_bytes(bytes) as f64)
}

fn i64_setter(_ctx: &mut Context, data: &mut [u8], offset: u32, value: Value) {
    let bytes = (value.as_number() as i64).to_ne_bytes();
    data[offset as usize..offset as usize + 8].copy_from_slice(&bytes);
}

fn u32_getter(_ctx: &mut Context, data: &[u8], offset: u32) -> Value {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset as usize..offset as usize + 4]);
    Value::number(u32::from_ne_bytes(bytes) as f64)
}

fn u32_setter(_ctx: &mut Context, data: &mut [u8], offset: u32, value: Value) {
    let bytes = (value.as_number() as u32).to_ne_bytes();
    data[offset as usize..offset as usize + 4].copy_from_slice(&bytes);
}

fn bool_getter(_ctx: &mut Context, data: &[u8], offset: u32) -> Value {
    Value::bool(data[offset as usize] != 0)
}

fn bool_setter(_ctx: &mut Context, data: &mut [u8], offset: u32, value: Value) {
    data[offset as usize] = value.as_bool() as u8;
}

pub fn userdata_type_field_f64(ctx: &mut Context, ty: *mut TypeObj, name: &str, offset: u32) {
    let number = ctx.types.number;
    userdata_add_field(ctx, ty, number, name, offset, f64_getter, Some(f64_setter));
}

pub fn userdata_type_field_i64(ctx: &mut Context, ty: *mut TypeObj, name: &str, offset: u32) {
    let number = ctx.types.number;
    userdata_add_field(ctx, ty, number, name, offset, i64_getter, Some(i64_setter));
}

pub fn userdata_type_field_u32(ctx: &mut Context, ty: *mut TypeObj, name: &str, offset: u32) {
    let number = ctx.types.number;
    userdata_add_field(ctx, ty, number, name, offset, u32_getter, Some(u32_setter));
}

pub fn userdata_type_field_bool(ctx: &mut Context, ty: *mut TypeObj, name: &str, offset: u32) {
    let boolean = ctx.types.boolean;
    userdata_add_field(ctx, ty, boolean, name, offset, bool_getter, Some(bool_setter));
}

pub fn userdata_type_method(
    ctx: &mut Context,
    ty: *mut TypeObj,
    name: &str,
    proc: crate::object::NativeProc,
    ret: *mut TypeObj,
    args: &[*mut TypeObj],
) {
    let sig = make_method_sig(ctx, ret, args);
    let native = crate::object::make_native(ctx, sig, proc);
    ctx.push_root(native as *mut Obj);
    let name = make_string_hashed(ctx, name);
    ctx.pop_root();
    unsafe {
        if let TypeData::Userdata { methods, .. } = &mut (*ty).data {
            methods.push(UserdataMethod { name, fn_: native });
        }
    }
}

pub fn userdata_get(ctx: &mut Context, ud: *mut UserdataObj, key: Value) -> Value {
    unsafe {
        let ty = (*ud).ty;
        if let TypeData::Userdata {
            fields, methods, ..
        } = &(*ty).data
        {
            for field in fields {
                if value_is_equal(Value::object(field.name as *mut Obj), key) {
                    return (field.getter)(ctx, &(*ud).data, field.offset);
                }
            }
            for method in methods {
                if value_is_equal(Value::object(method.name as *mut Obj), key) {
                    return Value::object(method.fn_ as *mut Obj);
                }
            }
        }
    }
    VALUE_NULL
}

pub fn userdata_set(ctx: &mut Context, ud: *mut UserdataObj, key: Value, value: Value) -> bool {
    unsafe {
        let ty = (*ud).ty;
        if let TypeData::Userdata { fields, .. } = &(*ty).data {
            for field in fields {
                if value_is_equal(Value::object(field.name as *mut Obj), key) {
                    if let Some(setter) = field.setter {
                        setter(ctx, &mut (*ud).data, field.offset, value);
                        return true;
                    }
                    return false;
                }
            }
        }
    }
    false
}

pub fn userdata_field_type(ty: *mut TypeObj, key: Value) -> *mut TypeObj {
    unsafe {
        if let TypeData::Userdata {
            fields, methods, ..
        } = &(*dealias(ty)).data
        {
            for field in fields {
                if value_is_equal(Value::object(field.name as *mut Obj), key) {
                    return field.ty;
                }
            }
            for method in methods {
                if value_is_equal(Value::object(method.name as *mut Obj), key) {
                    return (*method.fn_).signature;
                }
            }
        }
    }
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// Runtime reflection
// ---------------------------------------------------------------------------

/// `value is T` — exact runtime membership.
pub fn is_type(ctx: &mut Context, value: Value, ty: *mut TypeObj) -> bool {
    let ty = dealias(ty);
    if ty == ctx.types.any {
        return true;
    }
    if ty == ctx.types.null {
        return value.is_null();
    }
    if value.is_null() {
        return false;
    }
    if ty == ctx.types.boolean {
        return value.is_bool();
    }
    if ty == ctx.types.number {
        return value.is_number();
    }

    if !value.is_object() {
        unsafe {
            if (*ty).category == TypeCategory::Enum {
                return value.is_enum() && enum_contains(ty, value);
            }
        }
        return false;
    }

    unsafe {
        let obj = value.as_object();

        if ty == ctx.types.string {
            return obj_kind(obj) == ObjKind::String;
        }

        match (*ty).category {
            TypeCategory::Type => obj_kind(obj) == ObjKind::Type,
            TypeCategory::Signature => match obj_kind(obj) {
                ObjKind::Fn | ObjKind::Method => {
                    let sig = (*(obj as *mut crate::object::FnObj)).signature;
                    ((*ty).satisfier)(ty, sig)
                }
                ObjKind::Closure => {
                    let inner = (*(obj as *mut crate::object::ClosureObj)).callable;
                    is_type(ctx, Value::object(inner), ty)
                }
                ObjKind::NativeFn => {
                    let sig = (*(obj as *mut crate::object::NativeFnObj)).signature;
                    ((*ty).satisfier)(ty, sig)
                }
                _ => false,
            },
            TypeCategory::Array => {
                if obj_kind(obj) != ObjKind::Array {
                    return false;
                }
                let inner = array_inner(ty);
                if inner == ctx.types.any {
                    return true;
                }
                let arr = obj as *mut crate::object::ArrayObj;
                (*arr).items.iter().all(|item| is_type(ctx, *item, inner))
            }
            TypeCategory::Tableshape => {
                if obj_kind(obj) != ObjKind::Table {
                    return false;
                }
                let tbl = obj as *mut TableObj;
                let mut shape = ty;
                while !shape.is_null() {
                    if let TypeData::Tableshape { layout, parent, .. } = &(*shape).data {
                        let (layout, parent) = (*layout, *parent);
                        if !layout.is_null() {
                            for pair in (*layout).pairs.pairs() {
                                let val = table_get(tbl, pair.key);
                                if val.is_null() {
                                    return false;
                                }
                                let field_ty = pair.value.as_object() as *mut TypeObj;
                                if !is_type(ctx, val, field_ty) {
                                    return false;
                                }
                            }
                        }
                        shape = parent;
                    } else {
                        break;
                    }
                }
                true
            }
            TypeCategory::Union => {
                if let TypeData::Union { variants } = &(*ty).data {
                    let variants = variants.clone();
                    variants.iter().any(|v| is_type(ctx, value, *v))
                } else {
                    false
                }
            }
            TypeCategory::Userdata => {
                obj_kind(obj) == ObjKind::Userdata
                    && dealias((*(obj as *mut UserdataObj)).ty) == ty
            }
            _ => false,
        }
    }
}

/// `value satisfies T` — like `is`, but tableshape targets only require the
/// declared keys to be present and non-null (unless optional).
pub fn satisfies_type(ctx: &mut Context, value: Value, ty: *mut TypeObj) -> bool {
    let ty = dealias(ty);
    unsafe {
        if (*ty).category == TypeCategory::Tableshape {
            if !value.is_object() || obj_kind(value.as_object()) != ObjKind::Table {
                return false;
            }
            let tbl = value.as_object() as *mut TableObj;
            if let TypeData::Tableshape { layout, .. } = &(*ty).data {
                let layout = *layout;
                if !layout.is_null() {
                    for pair in (*layout).pairs.pairs() {
                        let val = table_get(tbl, pair.key);
                        let field_ty = pair.value.as_object() as *mut TypeObj;
                        if val.is_null() && !is_optional(ctx, field_ty) {
                            return false;
                        }
                    }
                }
            }
            return true;
        }
    }
    is_type(ctx, value, ty)
}

/// `value as T`. Casting a table into a tableshape materializes a fresh
/// table with the declared layout and the target type's prototype.
pub fn cast_type(ctx: &mut Context, value: Value, ty: *mut TypeObj) -> Result<Value, String> {
    let ty = dealias(ty);

    if ty == ctx.types.string {
        let s = to_string(ctx, value);
        return Ok(Value::object(s as *mut Obj));
    }

    unsafe {
        if (*ty).category == TypeCategory::Tableshape {
            if !value.is_object() || obj_kind(value.as_object()) != ObjKind::Table {
                return Err("cast target is a table type but the value is not a table".to_string());
            }
            let src = value.as_object() as *mut TableObj;
            let TypeData::Tableshape { layout, .. } = &(*ty).data else {
                return Err("malformed table type".to_string());
            };
            let layout = *layout;

            let len = if layout.is_null() { 0 } else { (*layout).pairs.len() };
            ctx.push_root(src as *mut Obj);
            ctx.push_root(ty as *mut Obj);
            let dst = make_table(ctx, len);
            ctx.push_root(dst as *mut Obj);

            for i in 0..len {
                let pair = (*layout).pairs.pairs()[i];
                let val = table_get(src, pair.key);
                let field_ty = pair.value.as_object() as *mut TypeObj;
                if val.is_null() && !is_optional(ctx, field_ty) {
                    ctx.pop_root();
                    ctx.pop_root();
                    ctx.pop_root();
                    let key = to_string(ctx, pair.key);
                    return Err(format!(
                        "cannot cast table: missing field '{}'",
                        (*key).as_str()
                    ));
                }
                table_set(ctx, dst, pair.key, val);
            }

            let proto = type_get_proto(ctx, ty);
            (*dst).prototype = proto;
            ctx.pop_root();
            ctx.pop_root();
            ctx.pop_root();
            return Ok(Value::object(dst as *mut Obj));
        }
    }

    if is_type(ctx, value, ty) {
        return Ok(value);
    }

    Ok(VALUE_NULL)
}

/// The runtime type of a value, used by `meta.typeof` and `TSET`.
pub fn runtime_typeof(ctx: &mut Context, value: Value) -> *mut TypeObj {
    if value.is_number() {
        return ctx.types.number;
    }
    if value.is_bool() {
        return ctx.types.boolean;
    }
    if value.is_null() {
        return ctx.types.null;
    }
    if value.is_enum() {
        return ctx.types.number;
    }

    unsafe {
        let obj = value.as_object();
        match obj_kind(obj) {
            ObjKind::String => ctx.types.string,
            ObjKind::Array => ctx.types.array,
            ObjKind::Table => ctx.types.table,
            ObjKind::Type => ctx.types.type_,
            ObjKind::Fn | ObjKind::Method => (*(obj as *mut crate::object::FnObj)).signature,
            ObjKind::NativeFn => (*(obj as *mut crate::object::NativeFnObj)).signature,
            ObjKind::Closure => {
                runtime_typeof(ctx, Value::object((*(obj as *mut crate::object::ClosureObj)).callable))
            }
            ObjKind::Userdata => (*(obj as *mut UserdataObj)).ty,
            _ => ctx.types.any,
        }
    }
}

/// Structural type equality, transparent through aliases.
pub fn type_is_equal(a: *mut TypeObj, b: *mut TypeObj) -> bool {
    if a.is_null() && b.is_null() {
        return true;
    }
    if a.is_null() || b.is_null() {
        return false;
    }

    let a = dealias(a);
    let b = dealias(b);
    if a == b {
        return true;
    }

    unsafe {
        if (*a).category != (*b).category {
            return false;
        }

        match (&(*a).data, &(*b).data) {
            (TypeData::Array { inner: ia }, TypeData::Array { inner: ib }) => {
                type_is_equal(*ia, *ib)
            }
            (
                TypeData::Signature {
                    args: aa,
                    ret: ra,
                    is_vararg: va,
                    ..
                },
                TypeData::Signature {
                    args: ab,
                    ret: rb,
                    is_vararg: vb,
                    ..
                },
            ) => {
                aa.len() == ab.len()
                    && va == vb
                    && type_is_equal(*ra, *rb)
                    && aa.iter().zip(ab.iter()).all(|(x, y)| type_is_equal(*x, *y))
            }
            (TypeData::Union { variants: va }, TypeData::Union { variants: vb }) => {
                va.len() == vb.len()
                    && va.iter().zip(vb.iter()).all(|(x, y)| type_is_equal(*x, *y))
            }
            (
                TypeData::Tableshape {
                    layout: la,
                    sealed: sa,
                    map: ma,
                    ..
                },
                TypeData::Tableshape {
                    layout: lb,
                    sealed: sb,
                    map: mb,
                    ..
                },
            ) => {
                if sa != sb || ma != mb {
                    return false;
                }
                if la.is_null() || lb.is_null() {
                    return la == lb;
                }
                if (**la).pairs.len() != (**lb).pairs.len() {
                    return false;
                }
                for pa in (**la).pairs.pairs() {
                    let found = table_get(*lb, pa.key);
                    if found.is_null() {
                        return false;
                    }
                    let ta = pa.value.as_object() as *mut TypeObj;
                    let tb = found.as_object() as *mut TypeObj;
                    if !type_is_equal(ta, tb) {
                        return false;
                    }
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_satisfier_reflexivity() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let string = ctx.types.string;
        let arr = make_array_type(&mut ctx, number);
        let sig = make_signature(&mut ctx, number, &[number, string]);
        let nullable = make_nullable(&mut ctx, number);

        for ty in [number, string, arr, sig, nullable, ctx.types.any] {
            assert!(type_satisfies(ty, ty), "{} satisfies itself", type_name(ty));
        }
    }

    #[test]
    fn test_nullable_idempotent() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let once = make_nullable(&mut ctx, number);
        let twice = make_nullable(&mut ctx, once);
        assert!(type_is_equal(once, twice));
    }

    #[test]
    fn test_remove_nullable_collapses() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let nullable = make_nullable(&mut ctx, number);
        let stripped = remove_nullable(&mut ctx, nullable);
        assert_eq!(dealias(stripped), number);
    }

    #[test]
    fn test_union_containment() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let string = ctx.types.string;
        let uni = make_union(&mut ctx, vec![number, string]);
        assert!(type_satisfies(uni, number));
        assert!(type_satisfies(uni, string));
        assert!(!type_satisfies(uni, ctx.types.boolean));
    }

    #[test]
    fn test_array_satisfaction_recurses() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let a = make_array_type(&mut ctx, number);
        let b = make_array_type(&mut ctx, number);
        let string = ctx.types.string;
        let c = make_array_type(&mut ctx, string);
        assert!(type_satisfies(a, b));
        assert!(!type_satisfies(a, c));
    }

    #[test]
    fn test_signature_contravariance() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let any = ctx.types.any;

        // fn(any): number satisfies fn(number): number — callee accepting
        // more is fine; the reverse is not.
        let wide = make_signature(&mut ctx, number, &[any]);
        let narrow = make_signature(&mut ctx, number, &[number]);
        assert!(type_satisfies(narrow, wide));
        assert!(!type_satisfies(wide, narrow));
    }

    #[test]
    fn test_alias_transparent() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let alias = make_alias(&mut ctx, Some("Seconds"), number);
        assert!(type_satisfies(alias, number));
        assert!(type_satisfies(number, alias));
        assert!(type_is_equal(alias, number));
    }

    #[test]
    fn test_tableshape_satisfier() {
        let mut ctx = Context::new();
        let number = ctx.types.number;

        let open = make_tableshape(&mut ctx, "V", false);
        let x = make_string_hashed(&mut ctx, "x");
        tableshape_add_layout(&mut ctx, open, Value::object(x as *mut Obj), number);

        let wider = make_tableshape(&mut ctx, "W", false);
        let x2 = make_string_hashed(&mut ctx, "x");
        let y = make_string_hashed(&mut ctx, "y");
        tableshape_add_layout(&mut ctx, wider, Value::object(x2 as *mut Obj), number);
        tableshape_add_layout(&mut ctx, wider, Value::object(y as *mut Obj), number);

        // Unsealed: extra keys on the right are fine.
        assert!(type_satisfies(open, wider));
        // Sealed requires equal cardinality.
        tableshape_set_sealed(open, true);
        assert!(!type_satisfies(open, wider));
    }

    #[test]
    fn test_userdata_fields_and_finalizer() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);

        fn on_free(_ctx: &mut Context, _ud: *mut UserdataObj) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }

        let mut ctx = Context::new();
        let ty = make_userdata_type(&mut ctx, "Timer");
        userdata_type_field_f64(&mut ctx, ty, "elapsed", 0);
        userdata_type_field_bool(&mut ctx, ty, "running", 8);
        userdata_type_field_i64(&mut ctx, ty, "ticks", 9);
        userdata_type_field_u32(&mut ctx, ty, "id", 17);
        userdata_set_finalizer(ty, on_free);

        ctx.push_root(ty as *mut Obj);
        let ud = crate::object::make_userdata(&mut ctx, ty, vec![0u8; 21].into_boxed_slice());
        ctx.push_root(ud as *mut Obj);

        let key = make_string_hashed(&mut ctx, "elapsed");
        let key = Value::object(key as *mut Obj);
        assert!(userdata_set(&mut ctx, ud, key, Value::number(1.5)));
        let got = userdata_get(&mut ctx, ud, key);
        assert_eq!(got.as_number(), 1.5);

        let ticks = make_string_hashed(&mut ctx, "ticks");
        let ticks = Value::object(ticks as *mut Obj);
        assert!(userdata_set(&mut ctx, ud, ticks, Value::number(-3.0)));
        assert_eq!(userdata_get(&mut ctx, ud, ticks).as_number(), -3.0);

        let id = make_string_hashed(&mut ctx, "id");
        let id = Value::object(id as *mut Obj);
        assert!(userdata_set(&mut ctx, ud, id, Value::number(7.0)));
        assert_eq!(userdata_get(&mut ctx, ud, id).as_number(), 7.0);

        let missing = make_string_hashed(&mut ctx, "nope");
        assert!(userdata_get(&mut ctx, ud, Value::object(missing as *mut Obj)).is_null());

        // Unpinning the userdata lets the next cycle run its finalizer.
        ctx.pop_root();
        ctx.pop_root();
        ctx.push_root(ty as *mut Obj);
        let before = FINALIZED.load(Ordering::SeqCst);
        crate::gc::collect(&mut ctx, 0);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), before + 1);
        ctx.pop_root();
    }

    #[test]
    fn test_callable_return_type() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let sig = make_signature(&mut ctx, number, &[number]);

        fn noop(_ctx: &mut Context, _thread: &mut crate::interpreter::Thread) -> Result<(), String> {
            Ok(())
        }
        let native = crate::object::make_native(&mut ctx, sig, noop);
        let ret = crate::object::callable_return_type(native as *mut Obj);
        assert_eq!(dealias(ret), number);
    }

    #[test]
    fn test_runtime_is_and_cast() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        let null = ctx.types.null;
        let string = ctx.types.string;
        assert!(is_type(&mut ctx, Value::number(4.0), number));
        assert!(!is_type(&mut ctx, VALUE_NULL, number));
        assert!(is_type(&mut ctx, VALUE_NULL, null));

        let cast = cast_type(&mut ctx, Value::number(4.0), string).unwrap();
        assert!(cast.is_object());
        unsafe {
            let s = cast.as_object() as *mut StringObj;
            assert_eq!((*s).as_str(), "4");
        }
    }
}
