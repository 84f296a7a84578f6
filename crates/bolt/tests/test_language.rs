//! End-to-end language tests: compile and execute full programs, checking
//! their top-level return values.

use bolt::{Context, VALUE_TRUE, Value};

fn eval(source: &str) -> Value {
    let mut ctx = Context::new();
    ctx.eval(source).expect("program runs")
}

fn eval_number(source: &str) -> f64 {
    let value = eval(source);
    assert!(value.is_number(), "expected a number, got {:?}", value);
    value.as_number()
}

#[test]
fn test_arithmetic_returns_fourteen() {
    let result = eval_number(
        "let x: number = 2\n\
         let y: number = 3\n\
         return x + y * 4",
    );
    assert_eq!(result, 14.0);
}

#[test]
fn test_closure_counter_accumulates() {
    let result = eval_number(
        "fn make(): fn: number { var n = 0 return fn: number { n += 1 return n } }\n\
         let c = make()\n\
         return c() + c() + c()",
    );
    assert_eq!(result, 6.0);
}

#[test]
fn test_typed_table_cast_builds_prototyped_table() {
    let result = eval_number(
        "type V = { x: number, y: number }\n\
         let v = { x: 3, y: 4 } as V\n\
         return v.x * v.x + v.y * v.y",
    );
    assert_eq!(result, 25.0);
}

#[test]
fn test_iterator_for_over_array() {
    let result = eval_number(
        "import arrays\n\
         let a = [10, 20, 30]\n\
         var sum = 0\n\
         for v in a.each() { sum += v }\n\
         return sum",
    );
    assert_eq!(result, 60.0);
}

#[test]
fn test_metamethod_dispatch_on_add() {
    let result = eval_number(
        "type Vec = unsealed { x: number, y: number }\n\
         fn Vec.@add(a: Vec, b: Vec): Vec { return { x: a.x + b.x, y: a.y + b.y } as Vec }\n\
         let a = { x: 1, y: 2 } as Vec\n\
         let b = { x: 3, y: 4 } as Vec\n\
         let c = a + b\n\
         return c.x + c.y",
    );
    assert_eq!(result, 10.0);
}

#[test]
fn test_gc_reclaims_loop_garbage() {
    let mut ctx = Context::new();
    ctx.collect_garbage();
    let baseline = ctx.mem_size();

    let ok = ctx.run(
        "for i in 200 {\n\
             let t = { value: i, double: i * 2 }\n\
         }",
    );
    assert!(ok);
    assert!(ctx.mem_size() > baseline);

    ctx.collect_garbage();
    // Within a constant factor of the pre-loop footprint.
    assert!(
        ctx.mem_size() < baseline + baseline / 2 + 4096,
        "heap did not shrink: baseline {} now {}",
        baseline,
        ctx.mem_size()
    );
}

#[test]
fn test_array_methods() {
    assert_eq!(
        eval_number(
            "import arrays\n\
             let a = [1, 2, 3]\n\
             a.push(4)\n\
             return a.length()"
        ),
        4.0
    );

    assert_eq!(
        eval_number(
            "import arrays\n\
             let a = [1, 2, 3]\n\
             let doubled = a.map(fn (v: number): number => v * 2)\n\
             return doubled[2]"
        ),
        6.0
    );

    assert_eq!(
        eval_number(
            "import arrays\n\
             let a = [1, 2, 3, 4]\n\
             let even = a.filter(fn (v: number): bool => v / 2 == 1 or v / 2 == 2)\n\
             return even.length()"
        ),
        2.0
    );
}

#[test]
fn test_string_methods() {
    let value = eval(
        "import strings\n\
         let s = \"Hello\"\n\
         return s.upper()",
    );
    assert!(value.is_object());

    assert_eq!(
        eval_number(
            "import strings\n\
             let s = \"hello world\"\n\
             return s.find(\"world\") ?? 0"
        ),
        6.0
    );
}

#[test]
fn test_math_module() {
    assert_eq!(
        eval_number("import sqrt, max from math\nreturn max(sqrt(16), 3)"),
        4.0
    );
}

#[test]
fn test_enum_ordinals() {
    assert_eq!(
        eval(
            "type Color = enum { Red, Green, Blue }\n\
             let c = Color.Green\n\
             return c is Color"
        ),
        VALUE_TRUE
    );
}

#[test]
fn test_table_composition() {
    let result = eval_number(
        "type A = { x: number }\n\
         type B = { y: number }\n\
         let a = { x: 3 } as A\n\
         let b = { y: 4 } as B\n\
         let c = a & b\n\
         return c.x * c.y",
    );
    assert_eq!(result, 12.0);
}

#[test]
fn test_if_let_unwraps() {
    assert_eq!(
        eval_number(
            "fn first(a: [number]): number? { return a[0] }\n\
             var out = 0\n\
             if let v = first([41]) { out = v + 1 }\n\
             return out"
        ),
        42.0
    );
}

#[test]
fn test_prelude_gc_functions() {
    assert_eq!(eval("return mem_size() > 0"), VALUE_TRUE);
}

#[test]
fn test_accelerated_and_generic_paths_agree() {
    let source = "let a: number = 17.25\n\
                  let b: number = -3.5\n\
                  var acc = 0\n\
                  if a > b { acc = 1 }\n\
                  if a <= b { acc = 2 }\n\
                  return (a + b) * (a - b) / b + acc";

    let mut fast = Context::new();
    fast.compiler_options.accelerate = true;
    let fast_result = fast.eval(source).unwrap();

    let mut slow = Context::new();
    slow.compiler_options.accelerate = false;
    let slow_result = slow.eval(source).unwrap();

    assert_eq!(fast_result.bits(), slow_result.bits());
}
