//! Execution Context
//!
//! A [`Context`] owns everything a VM instance needs: the heap (intrusive
//! object list + collector), the primitive type registry, interned
//! meta-name strings, the prelude, loaded modules, module search paths, and
//! the host handlers. Contexts share nothing; multiple may coexist in one
//! process.

use crate::gc::{self, Gc};
use crate::interpreter::{self, Thread};
use crate::object::{
    ImportObj, ModuleObj, Obj, ObjKind, StringObj, TableObj, make_import, make_string_hashed,
    make_table, table_get, table_set,
};
use crate::types::{
    TypeObj, make_alias, make_array_type, make_fundamental, make_tableshape, make_type,
    satisfier_any, satisfier_same, TypeCategory, TypeData,
};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Compile,
    Runtime,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Compile => "compile",
            ErrorKind::Runtime => "runtime",
        }
    }
}

pub type ErrorFn = Box<dyn FnMut(ErrorKind, &str, &str, u16, u16)>;
pub type ReadFileFn = Box<dyn FnMut(&str) -> Option<String>>;

/// Host integration points. The file handlers subsume the open/close/free
/// triple of a C host: the returned `String` owns its buffer.
pub struct Handlers {
    pub on_error: ErrorFn,
    pub read_file: ReadFileFn,
}

impl Default for Handlers {
    fn default() -> Handlers {
        Handlers {
            on_error: Box::new(|kind, module, message, line, col| {
                eprintln!("{} error [{} ({}:{})]: {}", kind.name(), module, line, col, message);
            }),
            read_file: Box::new(|path| std::fs::read_to_string(path).ok()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    /// Keep token/source artifacts so runtime errors carry file/line/col.
    pub generate_debug_info: bool,
    /// Emit accelerated opcodes for statically known numeric/table ops.
    pub accelerate: bool,
}

impl Default for CompilerOptions {
    fn default() -> CompilerOptions {
        CompilerOptions {
            generate_debug_info: true,
            accelerate: true,
        }
    }
}

/// The primitive types every context owns.
pub struct PrimitiveTypes {
    pub any: *mut TypeObj,
    pub null: *mut TypeObj,
    pub number: *mut TypeObj,
    pub boolean: *mut TypeObj,
    pub string: *mut TypeObj,
    pub array: *mut TypeObj,
    pub table: *mut TypeObj,
    pub type_: *mut TypeObj,
}

/// Interned metamethod keys, looked up on tableshape prototypes.
pub struct MetaNames {
    pub add: *mut StringObj,
    pub sub: *mut StringObj,
    pub mul: *mut StringObj,
    pub div: *mut StringObj,
    pub lt: *mut StringObj,
    pub lte: *mut StringObj,
    pub eq: *mut StringObj,
    pub neq: *mut StringObj,
    pub format: *mut StringObj,
    pub collect: *mut StringObj,
}

impl MetaNames {
    pub fn all(&self) -> [*mut StringObj; 10] {
        [
            self.add, self.sub, self.mul, self.div, self.lt, self.lte, self.eq, self.neq,
            self.format, self.collect,
        ]
    }
}

pub struct Context {
    pub handlers: Handlers,
    pub compiler_options: CompilerOptions,

    pub gc: Gc,
    /// Sentinel heading the intrusive list of all heap objects.
    pub root: *mut Obj,
    /// Last object in the list; new allocations link here.
    pub tail: *mut Obj,
    /// Temporary roots pinning in-flight constructions.
    pub troots: Vec<*mut Obj>,

    pub types: PrimitiveTypes,
    pub meta_names: MetaNames,

    pub type_registry: *mut TableObj,
    pub loaded_modules: *mut TableObj,
    pub prelude: *mut TableObj,
    pub module_paths: Vec<String>,

    pub current_thread: *mut Thread,
}

impl Context {
    pub fn new() -> Context {
        Context::with_handlers(Handlers::default())
    }

    pub fn with_handlers(handlers: Handlers) -> Context {
        let mut ctx = Context {
            handlers,
            compiler_options: CompilerOptions::default(),
            gc: Gc::new(),
            root: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
            troots: Vec::with_capacity(16),
            types: PrimitiveTypes {
                any: std::ptr::null_mut(),
                null: std::ptr::null_mut(),
                number: std::ptr::null_mut(),
                boolean: std::ptr::null_mut(),
                string: std::ptr::null_mut(),
                array: std::ptr::null_mut(),
                table: std::ptr::null_mut(),
                type_: std::ptr::null_mut(),
            },
            meta_names: MetaNames {
                add: std::ptr::null_mut(),
                sub: std::ptr::null_mut(),
                mul: std::ptr::null_mut(),
                div: std::ptr::null_mut(),
                lt: std::ptr::null_mut(),
                lte: std::ptr::null_mut(),
                eq: std::ptr::null_mut(),
                neq: std::ptr::null_mut(),
                format: std::ptr::null_mut(),
                collect: std::ptr::null_mut(),
            },
            type_registry: std::ptr::null_mut(),
            loaded_modules: std::ptr::null_mut(),
            prelude: std::ptr::null_mut(),
            module_paths: Vec::new(),
            current_thread: std::ptr::null_mut(),
        };

        // The sentinel is the first link of the object list.
        let root = ctx.allocate(ObjKind::None, Obj::new(ObjKind::None), 0);
        ctx.root = root;

        ctx.types.number = primitive(&mut ctx, "number");
        ctx.types.boolean = primitive(&mut ctx, "bool");
        ctx.types.string = primitive(&mut ctx, "string");
        ctx.types.table = make_tableshape(&mut ctx, "table", false);
        ctx.types.any = make_type(
            &mut ctx,
            Some("any"),
            satisfier_any,
            TypeCategory::Primitive,
            TypeData::None,
        );
        ctx.types.null = primitive(&mut ctx, "null");
        let any = ctx.types.any;
        ctx.types.array = make_array_type(&mut ctx, any);
        ctx.types.type_ = make_fundamental(&mut ctx);
        unsafe {
            if let TypeData::Fundamental { boxed } = &mut (*ctx.types.type_).data {
                *boxed = ctx.types.any;
            }
        }

        ctx.loaded_modules = make_table(&mut ctx, 1);
        ctx.prelude = make_table(&mut ctx, 16);
        ctx.type_registry = make_table(&mut ctx, 16);

        for (name, ty) in [
            ("number", ctx.types.number),
            ("bool", ctx.types.boolean),
            ("string", ctx.types.string),
            ("table", ctx.types.table),
            ("any", ctx.types.any),
            ("null", ctx.types.null),
            ("array", ctx.types.array),
            ("Type", ctx.types.type_),
        ] {
            ctx.register_type(name, ty);
        }

        ctx.meta_names.add = make_string_hashed(&mut ctx, "@add");
        ctx.meta_names.sub = make_string_hashed(&mut ctx, "@sub");
        ctx.meta_names.mul = make_string_hashed(&mut ctx, "@mul");
        ctx.meta_names.div = make_string_hashed(&mut ctx, "@div");
        ctx.meta_names.lt = make_string_hashed(&mut ctx, "@lt");
        ctx.meta_names.lte = make_string_hashed(&mut ctx, "@lte");
        ctx.meta_names.eq = make_string_hashed(&mut ctx, "@eq");
        ctx.meta_names.neq = make_string_hashed(&mut ctx, "@neq");
        ctx.meta_names.format = make_string_hashed(&mut ctx, "@format");
        ctx.meta_names.collect = make_string_hashed(&mut ctx, "@collect");

        ctx.module_paths.push("%s.bolt".to_string());
        ctx.module_paths.push("%s/module.bolt".to_string());

        #[cfg(feature = "stdlib")]
        crate::stdlib::install(&mut ctx);

        ctx
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Central allocator: links the object into the global list, accounts
    /// its bytes, and may run a collection (pinning the new object first).
    pub fn allocate<T>(&mut self, kind: ObjKind, value: T, extra: usize) -> *mut T {
        let ptr = Box::into_raw(Box::new(value));
        let obj = ptr as *mut Obj;

        unsafe {
            debug_assert_eq!((*obj).kind(), kind);
            if !self.tail.is_null() {
                (*self.tail).set_next(obj);
            }
        }
        self.tail = obj;

        self.gc.bytes_allocated += std::mem::size_of::<T>() + extra;
        if self.gc.bytes_allocated >= self.gc.next_cycle && !self.gc.paused && !self.root.is_null()
        {
            self.push_root(obj);
            gc::collect(self, 0);
            self.pop_root();
        }

        ptr
    }

    /// Adjust accounting when an already-allocated object's heap payload
    /// grows or shrinks (table pair storage spills).
    pub fn account_heap_growth(&mut self, delta: isize) {
        if delta >= 0 {
            self.gc.bytes_allocated += delta as usize;
        } else {
            self.gc.bytes_allocated = self.gc.bytes_allocated.saturating_sub(-delta as usize);
        }
    }

    pub fn push_root(&mut self, root: *mut Obj) {
        self.troots.push(root);
    }

    pub fn pop_root(&mut self) {
        self.troots.pop();
    }

    /// Total accounted heap bytes.
    pub fn mem_size(&self) -> usize {
        self.gc.bytes_allocated
    }

    pub fn report_error(
        &mut self,
        kind: ErrorKind,
        module: &str,
        message: &str,
        line: u16,
        col: u16,
    ) {
        (self.handlers.on_error)(kind, module, message, line, col);
    }

    // -----------------------------------------------------------------------
    // Registries
    // -----------------------------------------------------------------------

    /// Register a named type: it lands in the type registry and the prelude,
    /// so every module resolves it by name.
    pub fn register_type(&mut self, name: &str, ty: *mut TypeObj) {
        let key = make_string_hashed(self, name);
        let registry = self.type_registry;
        if !registry.is_null() {
            table_set(self, registry, Value::object(key as *mut Obj), Value::object(ty as *mut Obj));
        }
        let alias = make_alias(self, None, ty);
        self.register_prelude(name, alias, Value::object(ty as *mut Obj));
    }

    pub fn find_type(&mut self, name: &str) -> Option<*mut TypeObj> {
        let key = make_string_hashed(self, name);
        let found = table_get(self.type_registry, Value::object(key as *mut Obj));
        if found.is_null() {
            None
        } else {
            Some(found.as_object() as *mut TypeObj)
        }
    }

    /// Add a prelude entry, importable by every module on first mention.
    pub fn register_prelude(&mut self, name: &str, ty: *mut TypeObj, value: Value) {
        // Pin the pieces until the prelude table holds the import.
        self.push_root(ty as *mut Obj);
        if value.is_object() {
            self.push_root(value.as_object());
        }
        let key = make_string_hashed(self, name);
        self.push_root(key as *mut Obj);
        let import = make_import(self, key, ty, value);
        let prelude = self.prelude;
        table_set(self, prelude, Value::object(key as *mut Obj), Value::object(import as *mut Obj));
        self.pop_root();
        self.pop_root();
        if value.is_object() {
            self.pop_root();
        }
    }

    pub fn find_prelude(&mut self, name: &str) -> Option<*mut ImportObj> {
        let key = make_string_hashed(self, name);
        let found = table_get(self.prelude, Value::object(key as *mut Obj));
        if found.is_null() {
            None
        } else {
            Some(found.as_object() as *mut ImportObj)
        }
    }

    pub fn register_module(&mut self, name: &str, module: *mut ModuleObj) {
        let key = make_string_hashed(self, name);
        let loaded = self.loaded_modules;
        table_set(self, loaded, Value::object(key as *mut Obj), Value::object(module as *mut Obj));
    }

    pub fn append_module_path(&mut self, pattern: &str) {
        self.module_paths.push(pattern.to_string());
    }

    // -----------------------------------------------------------------------
    // Modules
    // -----------------------------------------------------------------------

    /// Find a module by name: already-loaded modules are returned directly;
    /// otherwise each path pattern is tried in order, and the first file
    /// that reads is compiled, executed, and registered.
    pub fn find_module(&mut self, name: &str) -> Option<*mut ModuleObj> {
        let key = make_string_hashed(self, name);
        let found = table_get(self.loaded_modules, Value::object(key as *mut Obj));
        if !found.is_null() {
            return Some(found.as_object() as *mut ModuleObj);
        }

        let mut source = None;
        let mut found_path = String::new();
        for pattern in self.module_paths.clone() {
            let path = pattern.replace("%s", name);
            if let Some(text) = (self.handlers.read_file)(&path) {
                source = Some(text);
                found_path = path;
                break;
            }
        }

        let source = source?;
        tracing::debug!(module = name, path = %found_path, "loading module");

        let module = self.compile_module(&source, &found_path)?;
        self.push_root(module as *mut Obj);
        let name_str = make_string_hashed(self, name);
        let path_str = make_string_hashed(self, &found_path);
        unsafe {
            (*module).name = name_str;
            (*module).path = path_str;
        }

        let ok = self.execute(module);
        self.pop_root();
        if !ok {
            return None;
        }

        self.register_module(name, module);
        Some(module)
    }

    /// Compile source text into a module. Parse and compile failures are
    /// reported through `on_error` and surface as `None`. The collector is
    /// paused for the duration: the AST references types and interned
    /// strings that only become GC-visible once the module holds them.
    pub fn compile_module(&mut self, source: &str, name: &str) -> Option<*mut ModuleObj> {
        let was_paused = self.gc.paused;
        self.gc.paused = true;

        let tokenizer = crate::tokenizer::Tokenizer::new(source, name);
        let mut parser = crate::parser::Parser::new(tokenizer);
        let result = if parser.parse(self) {
            crate::compiler::compile(self, parser)
        } else {
            None
        };

        self.gc.paused = was_paused;
        result
    }

    /// Compile and execute in one step.
    pub fn run(&mut self, source: &str) -> bool {
        match self.compile_module(source, "<interp>") {
            Some(module) => self.execute(module),
            None => false,
        }
    }

    /// Execute a module. Returns false after a fatal runtime error (which
    /// has already been delivered to `on_error`).
    pub fn execute(&mut self, module: *mut ModuleObj) -> bool {
        self.execute_with_result(module).is_some()
    }

    /// Execute a module and return the value its top level returned
    /// (null when it ran to completion without `return`).
    pub fn execute_with_result(&mut self, module: *mut ModuleObj) -> Option<Value> {
        match interpreter::execute_module(self, module) {
            Ok(value) => Some(value),
            Err(err) => {
                self.report_error(
                    ErrorKind::Runtime,
                    &err.module,
                    &err.message,
                    err.line,
                    err.col,
                );
                None
            }
        }
    }

    /// Compile and execute, returning the module's return value. Intended
    /// for hosts and tests; diagnostics still flow through `on_error`.
    pub fn eval(&mut self, source: &str) -> Result<Value, String> {
        let module = self
            .compile_module(source, "<eval>")
            .ok_or_else(|| "compilation failed".to_string())?;
        self.push_root(module as *mut Obj);
        let result = self.execute_with_result(module);
        self.pop_root();
        result.ok_or_else(|| "execution failed".to_string())
    }

    /// Run a full collection cycle, returning the number of objects freed.
    pub fn collect_garbage(&mut self) -> u32 {
        gc::collect(self, 0)
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Free every object on the intrusive list, sentinel included.
        let mut obj = self.root;
        while !obj.is_null() {
            unsafe {
                let next = (*obj).next();
                crate::object::free_object(self, obj);
                obj = next;
            }
        }
        self.root = std::ptr::null_mut();
        self.tail = std::ptr::null_mut();
    }
}

fn primitive(ctx: &mut Context, name: &str) -> *mut TypeObj {
    make_type(
        ctx,
        Some(name),
        satisfier_same,
        TypeCategory::Primitive,
        TypeData::None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_boots_with_primitives() {
        let mut ctx = Context::new();
        assert!(!ctx.types.number.is_null());
        assert!(!ctx.types.any.is_null());
        assert_eq!(ctx.find_type("number"), Some(ctx.types.number));
        assert_eq!(ctx.find_type("Type"), Some(ctx.types.type_));
        assert!(ctx.find_type("nonsense").is_none());
    }

    #[test]
    fn test_prelude_lookup() {
        let mut ctx = Context::new();
        let entry = ctx.find_prelude("number").expect("number in prelude");
        unsafe {
            assert_eq!(crate::types::dealias((*entry).ty), ctx.types.any);
        }
    }

    #[test]
    fn test_register_prelude_value() {
        let mut ctx = Context::new();
        let number = ctx.types.number;
        ctx.register_prelude("answer", number, Value::number(42.0));
        let entry = ctx.find_prelude("answer").unwrap();
        unsafe {
            assert!(crate::object::value_is_equal((*entry).value, Value::number(42.0)));
        }
    }

    #[test]
    fn test_module_paths_default() {
        let ctx = Context::new();
        assert_eq!(ctx.module_paths[0], "%s.bolt");
        assert_eq!(ctx.module_paths[1], "%s/module.bolt");
    }
}
