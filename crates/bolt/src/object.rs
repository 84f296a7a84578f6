//! Heap Object Model
//!
//! Every garbage-collected value starts with an [`Obj`] header: an intrusive
//! next-pointer linking all live objects into one list, a kind tag, and a
//! mark bit. The default build stores these as separate fields; the
//! `masked-header` feature packs all three into a single u64 (pointer bits +
//! tag byte + mark bit) behind the same accessor API.
//!
//! Object payloads follow the header, so a `*mut Obj` can be cast to the
//! concrete kind once the tag has been inspected.

use crate::context::Context;
use crate::op::Op;
use crate::types::TypeObj;
use crate::value::{NUMBER_EPSILON, VALUE_NULL, Value};

/// Kind tag carried by every heap object.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    None = 0,
    Type,
    String,
    Module,
    Import,
    Fn,
    NativeFn,
    Closure,
    Method,
    Array,
    Table,
    Userdata,
    Annotation,
}

impl ObjKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjKind::None => "none",
            ObjKind::Type => "Type",
            ObjKind::String => "string",
            ObjKind::Module => "module",
            ObjKind::Import => "import",
            ObjKind::Fn => "fn",
            ObjKind::NativeFn => "native fn",
            ObjKind::Closure => "closure",
            ObjKind::Method => "method",
            ObjKind::Array => "array",
            ObjKind::Table => "table",
            ObjKind::Userdata => "userdata",
            ObjKind::Annotation => "annotation",
        }
    }

    fn from_u8(raw: u8) -> ObjKind {
        debug_assert!(raw <= ObjKind::Annotation as u8);
        unsafe { std::mem::transmute(raw) }
    }
}

#[cfg(not(feature = "masked-header"))]
#[repr(C)]
pub struct Obj {
    next: *mut Obj,
    kind: u8,
    mark: bool,
}

#[cfg(not(feature = "masked-header"))]
impl Obj {
    pub fn new(kind: ObjKind) -> Obj {
        Obj {
            next: std::ptr::null_mut(),
            kind: kind as u8,
            mark: false,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjKind {
        ObjKind::from_u8(self.kind)
    }

    #[inline(always)]
    pub fn next(&self) -> *mut Obj {
        self.next
    }

    #[inline(always)]
    pub fn set_next(&mut self, next: *mut Obj) {
        self.next = next;
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.mark
    }

    #[inline(always)]
    pub fn set_mark(&mut self, mark: bool) {
        self.mark = mark;
    }
}

/// Packed form: bits 56..63 hold the kind, bit 0 the mark, bits 3..47 the
/// next pointer (heap objects are at least 8-aligned).
#[cfg(feature = "masked-header")]
#[repr(C)]
pub struct Obj {
    mask: u64,
}

#[cfg(feature = "masked-header")]
impl Obj {
    const PTR_BITS: u64 = 0x0000_FFFF_FFFF_FFF8;
    const MARK_BIT: u64 = 1;

    pub fn new(kind: ObjKind) -> Obj {
        Obj {
            mask: (kind as u64) << 56,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjKind {
        ObjKind::from_u8((self.mask >> 56) as u8)
    }

    #[inline(always)]
    pub fn next(&self) -> *mut Obj {
        (self.mask & Self::PTR_BITS) as *mut Obj
    }

    #[inline(always)]
    pub fn set_next(&mut self, next: *mut Obj) {
        self.mask = (self.mask & !Self::PTR_BITS) | (next as u64 & Self::PTR_BITS);
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.mask & Self::MARK_BIT != 0
    }

    #[inline(always)]
    pub fn set_mark(&mut self, mark: bool) {
        if mark {
            self.mask |= Self::MARK_BIT;
        } else {
            self.mask &= !Self::MARK_BIT;
        }
    }
}

#[inline(always)]
pub unsafe fn obj_kind(obj: *mut Obj) -> ObjKind {
    unsafe { (*obj).kind() }
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct StringObj {
    pub obj: Obj,
    /// Zero when the string has not been hashed yet.
    pub hash: u64,
    pub data: Box<str>,
}

impl StringObj {
    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.data
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// FNV-1a over the raw bytes. Zero results are nudged so a zero hash can
/// keep meaning "not hashed yet".
pub fn hash_str(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    if hash == 0 { 1 } else { hash }
}

pub fn make_string(ctx: &mut Context, s: &str) -> *mut StringObj {
    let extra = s.len();
    ctx.allocate(
        ObjKind::String,
        StringObj {
            obj: Obj::new(ObjKind::String),
            hash: 0,
            data: s.into(),
        },
        extra,
    )
}

/// Make a string with its hash precomputed, enabling the equality fast path
/// and table-key lookups.
pub fn make_string_hashed(ctx: &mut Context, s: &str) -> *mut StringObj {
    let ptr = make_string(ctx, s);
    unsafe { (*ptr).hash = hash_str(s.as_bytes()) };
    ptr
}

pub fn hash_string(s: *mut StringObj) -> *mut StringObj {
    unsafe {
        if (*s).hash == 0 {
            (*s).hash = hash_str((*s).data.as_bytes());
        }
    }
    s
}

pub fn concat_strings(ctx: &mut Context, a: *mut StringObj, b: *mut StringObj) -> *mut StringObj {
    unsafe {
        let mut joined = String::with_capacity((*a).len() + (*b).len());
        joined.push_str((*a).as_str());
        joined.push_str((*b).as_str());
        make_string(ctx, &joined)
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

pub const TABLE_INLINE_CAP: usize = 4;

#[derive(Clone, Copy)]
pub struct TablePair {
    pub key: Value,
    pub value: Value,
}

/// Pair storage with a small inline capacity, spilling to a heap vector only
/// once a table outgrows it.
pub enum PairStorage {
    Inline {
        len: u8,
        slots: [TablePair; TABLE_INLINE_CAP],
    },
    Outline(Vec<TablePair>),
}

impl PairStorage {
    fn new(initial_capacity: usize) -> PairStorage {
        if initial_capacity <= TABLE_INLINE_CAP {
            PairStorage::Inline {
                len: 0,
                slots: [TablePair {
                    key: VALUE_NULL,
                    value: VALUE_NULL,
                }; TABLE_INLINE_CAP],
            }
        } else {
            PairStorage::Outline(Vec::with_capacity(initial_capacity))
        }
    }

    #[inline]
    pub fn pairs(&self) -> &[TablePair] {
        match self {
            PairStorage::Inline { len, slots } => &slots[..*len as usize],
            PairStorage::Outline(v) => v,
        }
    }

    #[inline]
    pub fn pairs_mut(&mut self) -> &mut [TablePair] {
        match self {
            PairStorage::Inline { len, slots } => &mut slots[..*len as usize],
            PairStorage::Outline(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Heap bytes owned by the outline vector, for allocation accounting.
    pub fn outline_bytes(&self) -> usize {
        match self {
            PairStorage::Inline { .. } => 0,
            PairStorage::Outline(v) => v.capacity() * std::mem::size_of::<TablePair>(),
        }
    }

    fn push(&mut self, pair: TablePair) {
        match self {
            PairStorage::Inline { len, slots } => {
                if (*len as usize) < TABLE_INLINE_CAP {
                    slots[*len as usize] = pair;
                    *len += 1;
                } else {
                    let mut spilled = Vec::with_capacity(TABLE_INLINE_CAP * 2);
                    spilled.extend_from_slice(&slots[..]);
                    spilled.push(pair);
                    *self = PairStorage::Outline(spilled);
                }
            }
            PairStorage::Outline(v) => v.push(pair),
        }
    }

    fn remove(&mut self, idx: usize) {
        match self {
            PairStorage::Inline { len, slots } => {
                for i in idx..*len as usize - 1 {
                    slots[i] = slots[i + 1];
                }
                *len -= 1;
            }
            PairStorage::Outline(v) => {
                v.remove(idx);
            }
        }
    }
}

#[repr(C)]
pub struct TableObj {
    pub obj: Obj,
    pub prototype: *mut TableObj,
    pub pairs: PairStorage,
}

pub fn make_table(ctx: &mut Context, initial_capacity: usize) -> *mut TableObj {
    let storage = PairStorage::new(initial_capacity);
    let extra = storage.outline_bytes();
    ctx.allocate(
        ObjKind::Table,
        TableObj {
            obj: Obj::new(ObjKind::Table),
            prototype: std::ptr::null_mut(),
            pairs: storage,
        },
        extra,
    )
}

/// Own-pair scan first, then the prototype chain.
pub fn table_get(tbl: *mut TableObj, key: Value) -> Value {
    unsafe {
        for pair in (*tbl).pairs.pairs() {
            if value_is_equal(pair.key, key) {
                return pair.value;
            }
        }

        if !(*tbl).prototype.is_null() {
            return table_get((*tbl).prototype, key);
        }
    }

    VALUE_NULL
}

/// Index of `key` among the table's own pairs, or -1. Feeds the compiler's
/// accelerated field access.
pub fn table_get_idx(tbl: *mut TableObj, key: Value) -> i32 {
    unsafe {
        for (i, pair) in (*tbl).pairs.pairs().iter().enumerate() {
            if value_is_equal(pair.key, key) {
                return i as i32;
            }
        }
    }
    -1
}

/// Returns true when the key was newly inserted rather than overwritten.
pub fn table_set(ctx: &mut Context, tbl: *mut TableObj, key: Value, value: Value) -> bool {
    unsafe {
        for pair in (*tbl).pairs.pairs_mut() {
            if value_is_equal(pair.key, key) {
                pair.value = value;
                return false;
            }
        }

        let before = (*tbl).pairs.outline_bytes();
        (*tbl).pairs.push(TablePair { key, value });
        let after = (*tbl).pairs.outline_bytes();
        ctx.account_heap_growth(after as isize - before as isize);
    }
    true
}

pub fn table_set_str(ctx: &mut Context, tbl: *mut TableObj, key: &str, value: Value) -> bool {
    let key = make_string_hashed(ctx, key);
    table_set(ctx, tbl, Value::object(key as *mut Obj), value)
}

pub fn table_get_str(ctx: &mut Context, tbl: *mut TableObj, key: &str) -> Value {
    let key = make_string_hashed(ctx, key);
    table_get(tbl, Value::object(key as *mut Obj))
}

pub fn table_delete_key(tbl: *mut TableObj, key: Value) -> bool {
    unsafe {
        let idx = table_get_idx(tbl, key);
        if idx < 0 {
            return false;
        }
        (*tbl).pairs.remove(idx as usize);
    }
    true
}

// ---------------------------------------------------------------------------
// Arrays
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct ArrayObj {
    pub obj: Obj,
    pub items: Vec<Value>,
}

pub fn make_array(ctx: &mut Context, initial_capacity: usize) -> *mut ArrayObj {
    ctx.allocate(
        ObjKind::Array,
        ArrayObj {
            obj: Obj::new(ObjKind::Array),
            items: Vec::with_capacity(initial_capacity),
        },
        initial_capacity * std::mem::size_of::<Value>(),
    )
}

pub fn array_push(arr: *mut ArrayObj, value: Value) -> usize {
    unsafe {
        (*arr).items.push(value);
        (*arr).items.len()
    }
}

pub fn array_pop(arr: *mut ArrayObj) -> Value {
    unsafe { (*arr).items.pop().unwrap_or(VALUE_NULL) }
}

pub fn array_len(arr: *mut ArrayObj) -> usize {
    unsafe { (*arr).items.len() }
}

pub fn array_get(arr: *mut ArrayObj, index: usize) -> Value {
    unsafe { (&(*arr).items).get(index).copied().unwrap_or(VALUE_NULL) }
}

/// Writes in-range indices only; returns whether the write landed.
pub fn array_set(arr: *mut ArrayObj, index: usize, value: Value) -> bool {
    unsafe {
        if index < (*arr).items.len() {
            (&mut (*arr).items)[index] = value;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Functions, closures, natives
// ---------------------------------------------------------------------------

/// Instruction-index → token-index map for error reporting.
pub type DebugLocs = Vec<u32>;

#[repr(C)]
pub struct FnObj {
    pub obj: Obj,
    pub constants: Vec<Value>,
    pub instructions: Vec<Op>,
    pub signature: *mut TypeObj,
    pub module: *mut ModuleObj,
    pub debug: Option<DebugLocs>,
    pub stack_size: u8,
}

pub fn make_fn(
    ctx: &mut Context,
    module: *mut ModuleObj,
    signature: *mut TypeObj,
    constants: Vec<Value>,
    instructions: Vec<Op>,
    stack_size: u8,
) -> *mut FnObj {
    let extra = constants.capacity() * std::mem::size_of::<Value>()
        + instructions.capacity() * std::mem::size_of::<Op>();
    ctx.allocate(
        ObjKind::Fn,
        FnObj {
            obj: Obj::new(ObjKind::Fn),
            constants,
            instructions,
            signature,
            module,
            debug: None,
            stack_size,
        },
        extra,
    )
}

#[repr(C)]
pub struct ClosureObj {
    pub obj: Obj,
    /// Either an `FnObj` or a `NativeFnObj`.
    pub callable: *mut Obj,
    pub upvals: Box<[Value]>,
}

pub fn make_closure_obj(ctx: &mut Context, callable: *mut Obj, upvals: Box<[Value]>) -> *mut ClosureObj {
    let extra = upvals.len() * std::mem::size_of::<Value>();
    ctx.allocate(
        ObjKind::Closure,
        ClosureObj {
            obj: Obj::new(ObjKind::Closure),
            callable,
            upvals,
        },
        extra,
    )
}

pub type NativeProc = fn(&mut Context, &mut crate::interpreter::Thread) -> Result<(), String>;

#[repr(C)]
pub struct NativeFnObj {
    pub obj: Obj,
    pub signature: *mut TypeObj,
    pub proc: NativeProc,
}

pub fn make_native(ctx: &mut Context, signature: *mut TypeObj, proc: NativeProc) -> *mut NativeFnObj {
    ctx.allocate(
        ObjKind::NativeFn,
        NativeFnObj {
            obj: Obj::new(ObjKind::NativeFn),
            signature,
            proc,
        },
        0,
    )
}

// ---------------------------------------------------------------------------
// Modules and imports
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct ImportObj {
    pub obj: Obj,
    pub name: *mut StringObj,
    pub ty: *mut TypeObj,
    pub value: Value,
}

pub fn make_import(
    ctx: &mut Context,
    name: *mut StringObj,
    ty: *mut TypeObj,
    value: Value,
) -> *mut ImportObj {
    ctx.allocate(
        ObjKind::Import,
        ImportObj {
            obj: Obj::new(ObjKind::Import),
            name,
            ty,
            value,
        },
        0,
    )
}

/// Source artifacts kept alongside a module when debug info is enabled.
pub struct ModuleDebug {
    pub source: String,
    pub tokens: Vec<crate::tokenizer::Token>,
    pub locs: DebugLocs,
}

#[repr(C)]
pub struct ModuleObj {
    pub obj: Obj,
    pub constants: Vec<Value>,
    pub instructions: Vec<Op>,
    pub imports: Vec<*mut ImportObj>,
    pub exports: *mut TableObj,
    pub ty: *mut TypeObj,
    pub name: *mut StringObj,
    pub path: *mut StringObj,
    pub debug: Option<ModuleDebug>,
    pub stack_size: u8,
}

pub fn make_module(ctx: &mut Context, imports: Vec<*mut ImportObj>) -> *mut ModuleObj {
    let module = ctx.allocate(
        ObjKind::Module,
        ModuleObj {
            obj: Obj::new(ObjKind::Module),
            constants: Vec::new(),
            instructions: Vec::new(),
            imports,
            exports: std::ptr::null_mut(),
            ty: std::ptr::null_mut(),
            name: std::ptr::null_mut(),
            path: std::ptr::null_mut(),
            debug: None,
            stack_size: 0,
        },
        0,
    );

    ctx.push_root(module as *mut Obj);
    let exports = make_table(ctx, 0);
    unsafe { (*module).exports = exports };
    // Unsealed: module values answer keyed loads, never direct pair reads.
    let shape = crate::types::make_tableshape(ctx, "module", false);
    unsafe { (*module).ty = shape };
    ctx.pop_root();

    module
}

/// An empty module for hosts that assemble exports by hand.
pub fn make_user_module(ctx: &mut Context, name: &str) -> *mut ModuleObj {
    let module = make_module(ctx, Vec::new());
    ctx.push_root(module as *mut Obj);
    let name = make_string_hashed(ctx, name);
    unsafe { (*module).name = name };
    ctx.pop_root();
    module
}

pub fn module_export(
    ctx: &mut Context,
    module: *mut ModuleObj,
    ty: *mut TypeObj,
    key: Value,
    value: Value,
) {
    unsafe {
        table_set(ctx, (*module).exports, key, value);
        crate::types::tableshape_add_layout(ctx, (*module).ty, key, ty);
    }
}

pub fn module_export_native(
    ctx: &mut Context,
    module: *mut ModuleObj,
    name: &str,
    proc: NativeProc,
    ret: *mut TypeObj,
    args: &[*mut TypeObj],
) {
    let sig = crate::types::make_signature(ctx, ret, args);
    let native = make_native(ctx, sig, proc);
    // Pin until the export table holds them.
    ctx.push_root(native as *mut Obj);
    let key = make_string_hashed(ctx, name);
    module_export(
        ctx,
        module,
        sig,
        Value::object(key as *mut Obj),
        Value::object(native as *mut Obj),
    );
    ctx.pop_root();
}

pub fn module_get_export(module: *mut ModuleObj, key: Value) -> Value {
    unsafe { table_get((*module).exports, key) }
}

pub fn module_get_export_type(module: *mut ModuleObj, key: Value) -> *mut TypeObj {
    unsafe { crate::types::tableshape_get_layout((*module).ty, key) }
}

// ---------------------------------------------------------------------------
// Userdata
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct UserdataObj {
    pub obj: Obj,
    pub ty: *mut TypeObj,
    pub data: Box<[u8]>,
}

pub fn make_userdata(ctx: &mut Context, ty: *mut TypeObj, data: Box<[u8]>) -> *mut UserdataObj {
    let extra = data.len();
    ctx.allocate(
        ObjKind::Userdata,
        UserdataObj {
            obj: Obj::new(ObjKind::Userdata),
            ty,
            data,
        },
        extra,
    )
}

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct AnnotationObj {
    pub obj: Obj,
    pub name: *mut StringObj,
    pub args: *mut ArrayObj,
    pub next: *mut AnnotationObj,
}

pub fn make_annotation(ctx: &mut Context, name: *mut StringObj) -> *mut AnnotationObj {
    ctx.push_root(name as *mut Obj);
    let args = make_array(ctx, 0);
    ctx.pop_root();
    ctx.allocate(
        ObjKind::Annotation,
        AnnotationObj {
            obj: Obj::new(ObjKind::Annotation),
            name,
            args,
            next: std::ptr::null_mut(),
        },
        0,
    )
}

pub fn annotation_push(annotation: *mut AnnotationObj, value: Value) {
    unsafe { array_push((*annotation).args, value) };
}

// ---------------------------------------------------------------------------
// Generic property access
// ---------------------------------------------------------------------------

/// Generic `obj[key]`, dispatching on the target's kind. Tables follow their
/// prototype chain, arrays index numerically, userdata resolves typed fields
/// and methods, modules read their export table.
pub fn obj_get(ctx: &mut Context, obj: *mut Obj, key: Value) -> Value {
    unsafe {
        match obj_kind(obj) {
            ObjKind::Table => table_get(obj as *mut TableObj, key),
            ObjKind::Array => {
                if key.is_number() {
                    array_get(obj as *mut ArrayObj, key.as_number() as usize)
                } else {
                    // Built-in array methods hang off the primitive type.
                    let array_ty = ctx.types.array;
                    crate::types::type_get_field(ctx, array_ty, key).unwrap_or(VALUE_NULL)
                }
            }
            ObjKind::String => {
                let string_ty = ctx.types.string;
                crate::types::type_get_field(ctx, string_ty, key).unwrap_or(VALUE_NULL)
            }
            ObjKind::Module => module_get_export(obj as *mut ModuleObj, key),
            ObjKind::Userdata => {
                let ud = obj as *mut UserdataObj;
                crate::types::userdata_get(ctx, ud, key)
            }
            ObjKind::Type => {
                let ty = obj as *mut TypeObj;
                crate::types::type_get_field(ctx, ty, key).unwrap_or(VALUE_NULL)
            }
            _ => VALUE_NULL,
        }
    }
}

/// Generic `obj[key] = value`. Returns false when the target kind does not
/// support keyed writes.
pub fn obj_set(ctx: &mut Context, obj: *mut Obj, key: Value, value: Value) -> bool {
    unsafe {
        match obj_kind(obj) {
            ObjKind::Table => {
                table_set(ctx, obj as *mut TableObj, key, value);
                true
            }
            ObjKind::Array => {
                key.is_number() && array_set(obj as *mut ArrayObj, key.as_number() as usize, value)
            }
            ObjKind::Userdata => {
                let ud = obj as *mut UserdataObj;
                crate::types::userdata_set(ctx, ud, key, value)
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Equality and formatting
// ---------------------------------------------------------------------------

/// Value equality: numbers within epsilon, strings by hash fast path then
/// content, types structurally (through aliases), everything else by bits.
pub fn value_is_equal(a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }

    if a.is_number() {
        if !b.is_number() {
            return false;
        }
        return (a.as_number() - b.as_number()).abs() < NUMBER_EPSILON;
    }

    if b.is_number() {
        return false;
    }

    if a.is_object() && b.is_object() {
        unsafe {
            let obja = a.as_object();
            let objb = b.as_object();

            if obj_kind(obja) == obj_kind(objb) {
                match obj_kind(obja) {
                    ObjKind::Type => {
                        let ta = crate::types::dealias(obja as *mut TypeObj);
                        let tb = crate::types::dealias(objb as *mut TypeObj);
                        return crate::types::type_is_equal(ta, tb);
                    }
                    ObjKind::String => {
                        let sa = obja as *mut StringObj;
                        let sb = objb as *mut StringObj;
                        if (*sa).hash != 0 && (*sb).hash != 0 {
                            return (*sa).hash == (*sb).hash;
                        }
                        return (*sa).as_str() == (*sb).as_str();
                    }
                    _ => {}
                }
            }
        }
    }

    false
}

/// Format a number the way source literals read: integral values lose the
/// trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Total `to_string`: every value formats to something. Tables with a
/// `@format` metamethod defer to it when a thread is live.
pub fn to_string(ctx: &mut Context, value: Value) -> *mut StringObj {
    // Pin the subject: formatting allocates, and the value may have no
    // other root.
    if value.is_object() {
        ctx.push_root(value.as_object());
        let result = to_string_unrooted(ctx, value);
        ctx.pop_root();
        return result;
    }
    to_string_unrooted(ctx, value)
}

fn to_string_unrooted(ctx: &mut Context, value: Value) -> *mut StringObj {
    if value.is_number() {
        let text = format_number(value.as_number());
        return make_string(ctx, &text);
    }
    if value.is_null() {
        return make_string(ctx, "null");
    }
    if value.is_bool() {
        return make_string(ctx, if value.as_bool() { "true" } else { "false" });
    }
    if value.is_enum() {
        let text = format!("enum({})", value.as_enum());
        return make_string(ctx, &text);
    }

    unsafe {
        let obj = value.as_object();
        match obj_kind(obj) {
            ObjKind::String => obj as *mut StringObj,
            ObjKind::Table => {
                let tbl = obj as *mut TableObj;
                if let Some(formatted) = crate::interpreter::call_format_meta(ctx, tbl) {
                    return formatted;
                }

                let mut text = String::from("{ ");
                let len = (*tbl).pairs.len();
                for i in 0..len {
                    let pair = (*tbl).pairs.pairs()[i];
                    // Copy each piece before the next allocation can run a
                    // collection cycle.
                    let key = to_string(ctx, pair.key);
                    let key = (*key).as_str().to_string();
                    let val = to_string(ctx, pair.value);
                    let val = (*val).as_str().to_string();
                    text.push_str(&key);
                    text.push_str(": ");
                    text.push_str(&val);
                    if i + 1 < len {
                        text.push_str(", ");
                    }
                }
                text.push_str(" }");
                make_string(ctx, &text)
            }
            ObjKind::Array => {
                let arr = obj as *mut ArrayObj;
                let mut text = String::from("[");
                let len = (*arr).items.len();
                for i in 0..len {
                    let item = to_string(ctx, (&(*arr).items)[i]);
                    let item = (*item).as_str().to_string();
                    text.push_str(&item);
                    if i + 1 < len {
                        text.push_str(", ");
                    }
                }
                text.push(']');
                make_string(ctx, &text)
            }
            ObjKind::Type => {
                let name = crate::types::type_name(obj as *mut TypeObj);
                let text = format!("type({})", name);
                make_string(ctx, &text)
            }
            other => {
                let text = format!("{}: {:p}", other.name(), obj);
                make_string(ctx, &text)
            }
        }
    }
}

/// Return type of a callable's signature, used by embedding helpers.
pub fn callable_return_type(callable: *mut Obj) -> *mut TypeObj {
    unsafe {
        let sig = match obj_kind(callable) {
            ObjKind::Fn | ObjKind::Method => (*(callable as *mut FnObj)).signature,
            ObjKind::NativeFn => (*(callable as *mut NativeFnObj)).signature,
            ObjKind::Closure => return callable_return_type((*(callable as *mut ClosureObj)).callable),
            _ => std::ptr::null_mut(),
        };
        if sig.is_null() {
            return std::ptr::null_mut();
        }
        crate::types::signature_return(sig)
    }
}

/// Kind-specific teardown. Userdata finalizers run before the payload drops.
///
/// # Safety
/// `obj` must be a live allocation produced by `Context::allocate` and must
/// not be referenced again afterwards.
pub unsafe fn free_object(ctx: &mut Context, obj: *mut Obj) -> usize {
    unsafe {
        match obj_kind(obj) {
            ObjKind::None => {
                drop(Box::from_raw(obj));
                std::mem::size_of::<Obj>()
            }
            ObjKind::String => {
                let s = Box::from_raw(obj as *mut StringObj);
                std::mem::size_of::<StringObj>() + s.data.len()
            }
            ObjKind::Table => {
                let t = Box::from_raw(obj as *mut TableObj);
                std::mem::size_of::<TableObj>() + t.pairs.outline_bytes()
            }
            ObjKind::Array => {
                let a = Box::from_raw(obj as *mut ArrayObj);
                std::mem::size_of::<ArrayObj>() + a.items.capacity() * std::mem::size_of::<Value>()
            }
            ObjKind::Fn | ObjKind::Method => {
                let f = Box::from_raw(obj as *mut FnObj);
                std::mem::size_of::<FnObj>()
                    + f.constants.capacity() * std::mem::size_of::<Value>()
                    + f.instructions.capacity() * std::mem::size_of::<Op>()
            }
            ObjKind::Closure => {
                let c = Box::from_raw(obj as *mut ClosureObj);
                std::mem::size_of::<ClosureObj>() + c.upvals.len() * std::mem::size_of::<Value>()
            }
            ObjKind::NativeFn => {
                drop(Box::from_raw(obj as *mut NativeFnObj));
                std::mem::size_of::<NativeFnObj>()
            }
            ObjKind::Module => {
                drop(Box::from_raw(obj as *mut ModuleObj));
                std::mem::size_of::<ModuleObj>()
            }
            ObjKind::Import => {
                drop(Box::from_raw(obj as *mut ImportObj));
                std::mem::size_of::<ImportObj>()
            }
            ObjKind::Userdata => {
                let ud = obj as *mut UserdataObj;
                crate::types::run_finalizer(ctx, ud);
                let boxed = Box::from_raw(ud);
                std::mem::size_of::<UserdataObj>() + boxed.data.len()
            }
            ObjKind::Annotation => {
                drop(Box::from_raw(obj as *mut AnnotationObj));
                std::mem::size_of::<AnnotationObj>()
            }
            ObjKind::Type => {
                drop(Box::from_raw(obj as *mut TypeObj));
                std::mem::size_of::<TypeObj>()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_header_roundtrip() {
        let mut obj = Obj::new(ObjKind::Table);
        assert_eq!(obj.kind(), ObjKind::Table);
        assert!(!obj.is_marked());
        assert!(obj.next().is_null());

        obj.set_mark(true);
        assert!(obj.is_marked());
        assert_eq!(obj.kind(), ObjKind::Table);

        let fake = 0x5550usize as *mut Obj;
        obj.set_next(fake);
        assert_eq!(obj.next(), fake);
        assert!(obj.is_marked());

        obj.set_mark(false);
        assert!(!obj.is_marked());
        assert_eq!(obj.next(), fake);
    }

    #[test]
    fn test_string_equality_paths() {
        let mut ctx = Context::new();
        let a = make_string_hashed(&mut ctx, "hello");
        let b = make_string_hashed(&mut ctx, "hello");
        let c = make_string(&mut ctx, "hello");
        let d = make_string_hashed(&mut ctx, "world");

        let va = Value::object(a as *mut Obj);
        let vb = Value::object(b as *mut Obj);
        let vc = Value::object(c as *mut Obj);
        let vd = Value::object(d as *mut Obj);

        assert!(value_is_equal(va, vb));
        assert!(value_is_equal(va, vc));
        assert!(!value_is_equal(va, vd));
    }

    #[test]
    fn test_table_inline_spill() {
        let mut ctx = Context::new();
        let tbl = make_table(&mut ctx, 0);

        for i in 0..TABLE_INLINE_CAP + 3 {
            let key = Value::number(i as f64);
            assert!(table_set(&mut ctx, tbl, key, Value::number(i as f64 * 10.0)));
        }

        unsafe {
            assert_eq!((*tbl).pairs.len(), TABLE_INLINE_CAP + 3);
            assert!(matches!((*tbl).pairs, PairStorage::Outline(_)));
        }

        for i in 0..TABLE_INLINE_CAP + 3 {
            let got = table_get(tbl, Value::number(i as f64));
            assert!(value_is_equal(got, Value::number(i as f64 * 10.0)));
        }
    }

    #[test]
    fn test_table_prototype_chain() {
        let mut ctx = Context::new();
        let proto = make_table(&mut ctx, 1);
        let tbl = make_table(&mut ctx, 1);
        unsafe { (*tbl).prototype = proto };

        table_set_str(&mut ctx, proto, "shared", Value::number(7.0));
        let got = table_get_str(&mut ctx, tbl, "shared");
        assert!(value_is_equal(got, Value::number(7.0)));

        // Own pairs shadow the prototype.
        table_set_str(&mut ctx, tbl, "shared", Value::number(9.0));
        let got = table_get_str(&mut ctx, tbl, "shared");
        assert!(value_is_equal(got, Value::number(9.0)));
    }

    #[test]
    fn test_lazy_hashing() {
        let mut ctx = Context::new();
        let s = make_string(&mut ctx, "later");
        unsafe {
            assert_eq!((*s).hash, 0);
            hash_string(s);
            assert_ne!((*s).hash, 0);
            assert_eq!((*s).hash, hash_str(b"later"));
        }
    }

    #[test]
    fn test_table_delete_key() {
        let mut ctx = Context::new();
        let tbl = make_table(&mut ctx, 2);
        table_set_str(&mut ctx, tbl, "a", Value::number(1.0));
        table_set_str(&mut ctx, tbl, "b", Value::number(2.0));

        let key = make_string_hashed(&mut ctx, "a");
        assert!(table_delete_key(tbl, Value::object(key as *mut Obj)));
        assert!(!table_delete_key(tbl, Value::object(key as *mut Obj)));
        assert!(table_get_str(&mut ctx, tbl, "a").is_null());
        assert!(value_is_equal(
            table_get_str(&mut ctx, tbl, "b"),
            Value::number(2.0)
        ));
    }

    #[test]
    fn test_annotations_chain() {
        let mut ctx = Context::new();
        let name = make_string_hashed(&mut ctx, "deprecated");
        let ann = make_annotation(&mut ctx, name);
        annotation_push(ann, Value::number(1.0));
        annotation_push(ann, Value::bool(true));

        unsafe {
            assert_eq!((*ann).name, name);
            assert_eq!(array_len((*ann).args), 2);
            assert!((*ann).next.is_null());
        }

        // Annotations survive a collection while pinned.
        ctx.push_root(ann as *mut Obj);
        crate::gc::collect(&mut ctx, 0);
        unsafe { assert_eq!(array_len((*ann).args), 2) };
        ctx.pop_root();
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(14.0), "14");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[test]
    fn test_array_bounds() {
        let mut ctx = Context::new();
        let arr = make_array(&mut ctx, 2);
        array_push(arr, Value::number(1.0));
        array_push(arr, Value::number(2.0));

        assert_eq!(array_len(arr), 2);
        assert!(value_is_equal(array_get(arr, 1), Value::number(2.0)));
        assert!(array_get(arr, 5).is_null());
        assert!(!array_set(arr, 5, Value::number(3.0)));
        assert!(value_is_equal(array_pop(arr), Value::number(2.0)));
    }
}
