// ABOUTME: End-to-end language tests: evaluation, TCO, defers, errors

use slug::config::Config;
use slug::error::EvalFault;
use slug::interp::run_source;
use slug::object::Object;
use slug::runtime::Runtime;

fn eval_program(src: &str) -> Object {
    let runtime = Runtime::new(Config::default());
    run_source(&runtime, src, "<test>", &[]).expect("parse failed")
}

fn eval_display(src: &str) -> String {
    let result = eval_program(src);
    assert!(
        !result.is_abrupt(),
        "unexpected abrupt result: {:?}",
        result
    );
    result.to_string()
}

fn eval_failure(src: &str) -> std::sync::Arc<slug::object::RuntimeErr> {
    match eval_program(src) {
        Object::Failure(err) => err,
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn test_arithmetic_and_precedence() {
    assert_eq!(eval_display("1 + 2 * 3"), "7");
    assert_eq!(eval_display("(1 + 2) * 3"), "9");
    assert_eq!(eval_display("10 % 3"), "1");
    assert_eq!(eval_display("2 * 2 == 4"), "true");
    assert_eq!(eval_display("1 << 4 | 1"), "17");
}

#[test]
fn test_division_by_zero_is_nan() {
    assert_eq!(eval_display("1 / 0"), "NaN");
    assert_eq!(eval_display("(1 / 0) == (1 / 0)"), "false");
}

#[test]
fn test_bindings_and_blocks() {
    assert_eq!(eval_display("val x = 1\nval y = x + 1\ny"), "2");
    assert_eq!(eval_display("val x = { 1\n2 }\nx"), "2");
    assert_eq!(eval_display("var x = 1\nx = 5\nx"), "5");
}

#[test]
fn test_assign_to_val_fails() {
    match eval_program("val x = 1\nx = 2") {
        Object::Error(EvalFault::ImmutableAssign(name)) => assert_eq!(name, "x"),
        other => panic!("expected immutable-assign fault, got {:?}", other),
    }
}

#[test]
fn test_if_else_and_truthiness() {
    assert_eq!(eval_display("if (true) { 1 } else { 2 }"), "1");
    assert_eq!(eval_display("if (nil) { 1 } else { 2 }"), "2");
    assert_eq!(eval_display("if (0) { 1 } else { 2 }"), "1");
    assert_eq!(eval_display("if (false) { 1 }"), "nil");
}

#[test]
fn test_short_circuit() {
    // the right operand must not run when the left decides
    assert_eq!(
        eval_display("var hit = false\nval f = fn() { hit = true\ntrue }\nfalse && f()\nhit"),
        "false"
    );
    assert_eq!(
        eval_display("var hit = false\nval f = fn() { hit = true\ntrue }\ntrue || f()\nhit"),
        "false"
    );
}

#[test]
fn test_string_interpolation_and_escapes() {
    assert_eq!(eval_display("val x = 2\n\"a{{x + 1}}b\""), "a3b");
    assert_eq!(eval_display("\"tab\\there\""), "tab\there");
    assert_eq!(eval_display("val m = {greet: \"hi\"}\n\"{{m.greet}}!\""), "hi!");
}

#[test]
fn test_string_operators() {
    assert_eq!(eval_display("\"a\" + 1"), "a1");
    assert_eq!(eval_display("1 + \"a\""), "1a");
    assert_eq!(eval_display("\"ab\" * 3"), "ababab");
    assert_eq!(eval_display("\"a\" < \"b\""), "true");
}

#[test]
fn test_lists_and_indexing() {
    assert_eq!(eval_display("val xs = [1, 2, 3]\nxs[0] + xs[2]"), "4");
    assert_eq!(eval_display("val xs = [1, 2, 3]\nxs[-1]"), "3");
    assert_eq!(eval_display("[1, 2] + [3]\n"), "[1, 2, 3]");
    assert_eq!(eval_display("0 +: [1, 2]"), "[0, 1, 2]");
    assert_eq!(eval_display("[1, 2] :+ 3"), "[1, 2, 3]");
    assert_eq!(eval_display("val xs = [1, ...[2, 3], 4]\nlen(xs)"), "4");
}

#[test]
fn test_slices() {
    assert_eq!(eval_display("[1, 2, 3, 4][1:3]"), "[2, 3]");
    assert_eq!(eval_display("[1, 2, 3, 4][:2]"), "[1, 2]");
    assert_eq!(eval_display("[1, 2, 3, 4][2:]"), "[3, 4]");
    assert_eq!(eval_display("\"hello\"[1:3]"), "el");
    assert_eq!(eval_display("0x\"DEADBEEF\"[1:3]"), "0x\"ADBE\"");
}

#[test]
fn test_bad_index_faults() {
    assert!(matches!(
        eval_program("[1, 2][5]"),
        Object::Error(EvalFault::BadIndex(_))
    ));
}

#[test]
fn test_maps() {
    assert_eq!(eval_display("val m = {a: 1, b: 2}\nm.a + m[\"b\"]"), "3");
    assert_eq!(eval_display("val m = {a: 1}\nm.zz"), "nil");
    assert_eq!(eval_display("val m = {1: \"one\"}\nm[1]"), "one");
    assert_eq!(eval_display("val m = {:ok: 1}\nm[:ok]"), "1");
    assert_eq!(
        eval_display("val a = {x: 1}\nval b = {...a, y: 2}\nb.x + b.y"),
        "3"
    );
    assert_eq!(eval_display("var m = {a: 1}\nm.a = 9\nm.a"), "9");
    assert_eq!(eval_display("var m = {}\nm[\"k\"] = 4\nm.k"), "4");
}

#[test]
fn test_bytes() {
    assert_eq!(eval_display("len(0x\"DEADBEEF\")"), "4");
    assert_eq!(eval_display("0x\"0F\" | 0x\"F0\""), "0x\"FF\"");
    assert_eq!(eval_display("~0x\"00FF\""), "0x\"FF00\"");
    assert_eq!(eval_display("0x\"01\" + 0x\"02\""), "0x\"0102\"");
}

#[test]
fn test_symbols_are_identity() {
    assert_eq!(eval_display(":ok == :ok"), "true");
    assert_eq!(eval_display(":ok == :err"), "false");
    assert_eq!(eval_display(":ok == \"ok\""), "false");
}

#[test]
fn test_functions_closures_defaults() {
    assert_eq!(eval_display("val add = fn(a, b) { a + b }\nadd(1, 2)"), "3");
    assert_eq!(
        eval_display("val mk = fn(n) { fn(x) { x + n } }\nval add5 = mk(5)\nadd5(2)"),
        "7"
    );
    assert_eq!(eval_display("val f = fn(a, b = 10) { a + b }\nf(1)"), "11");
    assert_eq!(eval_display("val f = fn(a, b = 10) { a + b }\nf(1, 2)"), "3");
    assert_eq!(
        eval_display("val f = fn(a, b) { a - b }\nf(b = 1, a = 10)"),
        "9"
    );
    assert_eq!(
        eval_display("val f = fn(...xs) { len(xs) }\nf(1, 2, 3)"),
        "3"
    );
    assert_eq!(eval_display("val f = fn(...xs) { len(xs) }\nf()"), "0");
    assert_eq!(
        eval_display("val f = fn(a, b, c) { a + b + c }\nf(...[1, 2, 3])"),
        "6"
    );
}

#[test]
fn test_unknown_named_parameter() {
    assert!(matches!(
        eval_program("val f = fn(a) { a }\nf(zz = 1)"),
        Object::Error(EvalFault::DispatchFailed(_) | EvalFault::UnknownParam(_))
    ));
}

#[test]
fn test_pipe_operator() {
    assert_eq!(eval_display("val inc = fn(x) { x + 1 }\n5 /> inc"), "6");
    assert_eq!(
        eval_display("val inc = fn(x) { x + 1 }\nval dbl = fn(x) { x * 2 }\n5 /> inc /> dbl"),
        "12"
    );
}

#[test]
fn test_tail_recursion_constant_stack() {
    // deep self-recursion through `recur` must not exhaust the stack
    let src = "val fact = fn(n, acc) if (n == 0) { acc } else { recur(n - 1, n * acc) }\nval r = fact(10000, 1)\nr > 0";
    assert_eq!(eval_display(src), "true");
}

#[test]
fn test_direct_tail_calls_constant_stack() {
    // mutual recursion through direct tail calls
    let src = r#"
val isEven = fn(n) if (n == 0) { true } else { isOdd(n - 1) }
val isOdd = fn(n) if (n == 0) { false } else { isEven(n - 1) }
isEven(50000)
"#;
    assert_eq!(eval_display(src), "true");
}

#[test]
fn test_deep_recursion_without_tail_position_faults() {
    let src = "val f = fn(n) { if (n == 0) { 0 } else { 1 + f(n - 1) } }\nf(100000)";
    match eval_program(src) {
        Object::Error(EvalFault::Message(m)) => assert!(m.contains("stack")),
        other => panic!("expected stack exhaustion, got {:?}", other),
    }
}

#[test]
fn test_fn_match_sugar() {
    let src = r#"
val describe = fn(x) match {
    0 => "zero"
    n if n < 0 => "negative"
    _ => "positive"
}
describe(0) + " " + describe(-3) + " " + describe(7)
"#;
    assert_eq!(eval_display(src), "zero negative positive");
}

#[test]
fn test_throw_carries_payload_and_stack() {
    let err = eval_failure("val boom = fn() { throw {type: \"boom\"} }\nboom()");
    assert_eq!(err.error_type().as_deref(), Some("boom"));
    assert!(!err.stack.is_empty());
    assert!(err.stack.iter().any(|f| f.name == "boom"));
}

#[test]
fn test_defer_lifo_order() {
    let src = r#"
var log = ""
val f = fn() {
    defer { log = log + "A" }
    defer { log = log + "B" }
    1
}
f()
log
"#;
    assert_eq!(eval_display(src), "BA");
}

#[test]
fn test_defer_lifo_on_error_path() {
    let src = r#"
var log = ""
val f = fn() {
    defer { log = log + "A" }
    defer { log = log + "B" }
    throw {type: "x"}
}
val r = { defer onerror(e) { return log }
f() }
r
"#;
    assert_eq!(eval_display(src), "BA");
}

#[test]
fn test_defer_onsuccess_and_onerror_discriminate() {
    let src = r#"
var log = ""
val run = fn(fail) {
    defer onsuccess { log = log + "S" }
    defer onerror(e) { log = log + "E"
    return 0 }
    if (fail) { throw {type: "x"} } else { 1 }
}
run(false)
run(true)
log
"#;
    // second call: onerror recovers first, so the later onsuccess defer
    // observes a non-error exit and runs too
    assert_eq!(eval_display(src), "SES");
}

#[test]
fn test_defer_onerror_recovery() {
    // scenario: the error is replaced by the returned value
    let src = "val f = fn() { defer onerror(e) { return 0 }\nthrow {type: \"x\"} }\nf()";
    assert_eq!(eval_display(src), "0");
}

#[test]
fn test_defer_return_of_payload_rethrows() {
    let src = "val f = fn() { defer onerror(e) { return e }\nthrow {type: \"x\"} }\nf()";
    let err = eval_failure(src);
    assert_eq!(err.error_type().as_deref(), Some("x"));
    // the original stack survives the rethrow
    assert!(!err.stack.is_empty());
}

#[test]
fn test_defer_fresh_error_chains_cause() {
    let src = r#"
val f = fn() {
    defer onerror(e) { throw {type: "wrapped"} }
    throw {type: "original"}
}
f()
"#;
    let err = eval_failure(src);
    assert_eq!(err.error_type().as_deref(), Some("wrapped"));
    let cause = err.cause.as_ref().expect("missing cause");
    assert_eq!(cause.error_type().as_deref(), Some("original"));
}

#[test]
fn test_defer_catches_internal_errors() {
    let src = "val f = fn() { defer onerror(e) { return e.type }\nmissingName }\nf()";
    assert_eq!(eval_display(src), "error");
}

#[test]
fn test_undefined_identifier() {
    assert!(matches!(
        eval_program("zzz"),
        Object::Error(EvalFault::Undefined(_))
    ));
}

#[test]
fn test_struct_schema_and_defaults() {
    let src = r#"
val base = 10
val Point = struct { x = base + 1, y }
val p = Point{y: 2}
p.x + p.y
"#;
    assert_eq!(eval_display(src), "13");
}

#[test]
fn test_struct_defaults_use_defining_scope() {
    // defaults evaluate where the schema was defined, not at the call site
    let src = r#"
val base = 10
val Point = struct { x = base }
val mk = fn() {
    val base = 99
    Point{}
}
mk().x
"#;
    assert_eq!(eval_display(src), "10");
}

#[test]
fn test_struct_copy_and_field_assignment() {
    let src = r#"
val Point = struct { x, y }
val p = Point{x: 1, y: 2}
val q = p{x: 5}
p.y = 9
[q.x, q.y, p.x, p.y]
"#;
    assert_eq!(eval_display(src), "[5, 2, 1, 9]");
}

#[test]
fn test_struct_unknown_field_rejected() {
    assert!(matches!(
        eval_program("val P = struct { x }\nP{zz: 1}"),
        Object::Error(EvalFault::UnknownMember(_))
    ));
}

#[test]
fn test_nan_boundary_in_scripts() {
    assert_eq!(eval_display("(1 << 200) + 1"), "NaN");
}

#[test]
fn test_argv_and_argm() {
    let runtime = Runtime::new(Config::default());
    let args = vec![
        "--verbose".to_string(),
        "--out".to_string(),
        "x.txt".to_string(),
    ];
    let result = run_source(&runtime, "argm.out + \":\" + argm.verbose + \":\" + len(argv)", "<test>", &args)
        .expect("parse failed");
    assert_eq!(result.to_string(), "x.txt:true:3");
}

#[test]
fn test_return_exits_function_early() {
    let src = r#"
val f = fn(n) {
    if (n > 0) { return "pos" }
    "other"
}
f(1) + f(-1)
"#;
    assert_eq!(eval_display(src), "posother");
}

#[test]
fn test_hash_key_invariant_via_maps() {
    // equal values address the same entry
    assert_eq!(eval_display("val m = {1: \"a\"}\nm[1.0]"), "a");
}
