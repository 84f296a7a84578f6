//! Module loading and host-integration tests: path-pattern resolution,
//! exports and imports across compiled modules, and error reporting.

use std::cell::RefCell;
use std::rc::Rc;

use bolt::context::{ErrorKind, Handlers};
use bolt::{Context, Value};

#[test]
fn test_module_loaded_from_search_path() {
    let dir = tempfile::tempdir().unwrap();
    let module_path = dir.path().join("vectors.bolt");
    std::fs::write(
        &module_path,
        "export type Vec = { x: number, y: number }\n\
         export fn make(x: number, y: number): Vec { return { x: x, y: y } as Vec }\n",
    )
    .unwrap();

    let mut ctx = Context::new();
    ctx.append_module_path(&format!("{}/%s.bolt", dir.path().display()));

    let result = ctx
        .eval(
            "import make from vectors\n\
             let v = make(3, 4)\n\
             return v.x + v.y",
        )
        .expect("cross-module call runs");
    assert_eq!(result.as_number(), 7.0);
}

#[test]
fn test_module_registered_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("counter.bolt"),
        "export let value = 10\n",
    )
    .unwrap();

    let mut ctx = Context::new();
    ctx.append_module_path(&format!("{}/%s.bolt", dir.path().display()));

    let first = ctx.find_module("counter").expect("loads");
    let second = ctx.find_module("counter").expect("cached");
    assert_eq!(first, second);
}

#[test]
fn test_module_directory_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = dir.path().join("mypkg");
    std::fs::create_dir(&pkg).unwrap();
    std::fs::write(pkg.join("module.bolt"), "export let answer = 42\n").unwrap();

    let mut ctx = Context::new();
    ctx.append_module_path(&format!("{}/%s.bolt", dir.path().display()));
    ctx.append_module_path(&format!("{}/%s/module.bolt", dir.path().display()));

    let result = ctx
        .eval("import mypkg\nreturn mypkg.answer")
        .expect("directory module loads");
    assert_eq!(result.as_number(), 42.0);
}

#[test]
fn test_missing_module_is_parse_error() {
    let errors: Rc<RefCell<Vec<(ErrorKind, String)>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = errors.clone();

    let handlers = Handlers {
        on_error: Box::new(move |kind, _module, message, _line, _col| {
            seen.borrow_mut().push((kind, message.to_string()));
        }),
        read_file: Box::new(|_| None),
    };

    let mut ctx = Context::with_handlers(handlers);
    assert!(ctx.compile_module("import nowhere\n", "<test>").is_none());

    let errors = errors.borrow();
    assert!(!errors.is_empty());
    assert_eq!(errors[0].0, ErrorKind::Parse);
    assert!(errors[0].1.contains("nowhere"));
}

#[test]
fn test_parse_error_reports_location() {
    let location: Rc<RefCell<Option<(u16, u16)>>> = Rc::new(RefCell::new(None));
    let seen = location.clone();

    let handlers = Handlers {
        on_error: Box::new(move |_, _, _, line, col| {
            seen.borrow_mut().get_or_insert((line, col));
        }),
        read_file: Box::new(|_| None),
    };

    let mut ctx = Context::with_handlers(handlers);
    assert!(ctx.compile_module("let x = 1\nlet y: number = \"zz\"\n", "<test>").is_none());

    let (line, _col) = location.borrow().expect("error location captured");
    assert_eq!(line, 2);
}

#[test]
fn test_prelude_registration_is_visible() {
    let mut ctx = Context::new();
    let number = ctx.types.number;
    ctx.register_prelude("answer", number, Value::number(42.0));

    let result = ctx.eval("return answer + 1").expect("prelude import works");
    assert_eq!(result.as_number(), 43.0);
}

#[test]
fn test_runtime_error_returns_false() {
    let mut ctx = Context::new();
    let module = ctx
        .compile_module("let x: number? = null\nreturn x!\n", "<test>")
        .expect("compiles");
    assert!(!ctx.execute(module));
}

#[test]
fn test_import_star() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("consts.bolt"),
        "export let a = 1\nexport let b = 2\n",
    )
    .unwrap();

    let mut ctx = Context::new();
    ctx.append_module_path(&format!("{}/%s.bolt", dir.path().display()));

    let result = ctx
        .eval("import * from consts\nreturn a + b")
        .expect("star import runs");
    assert_eq!(result.as_number(), 3.0);
}
