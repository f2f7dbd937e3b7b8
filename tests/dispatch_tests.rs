// ABOUTME: Tests for function groups and multi-dispatch selection rules

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

#[test]
fn test_type_tags_route_by_argument_type() {
    let src = r#"
val f = fn(@num x) { "n" }
val f = fn(@str x) { "s" }
f(1) + f("a")
"#;
    assert_eq!(eval_display(src), "ns");
}

#[test]
fn test_nil_matches_any_tag_deterministically() {
    // both candidates accept nil; declaration order breaks the tie
    let src = r#"
val f = fn(@num x) { "n" }
val f = fn(@str x) { "s" }
f(nil)
"#;
    assert_eq!(eval_display(src), "n");
}

#[test]
fn test_arity_routes_between_implementations() {
    let src = r#"
val f = fn(a) { "one" }
val f = fn(a, b) { "two" }
f(1) + f(1, 2)
"#;
    assert_eq!(eval_display(src), "onetwo");
}

#[test]
fn test_smallest_max_wins() {
    let src = r#"
val h = fn(a) { "tight" }
val h = fn(a, b = 1) { "loose" }
h(5)
"#;
    assert_eq!(eval_display(src), "tight");
}

#[test]
fn test_non_variadic_preferred_over_variadic() {
    let src = r#"
val g = fn(@num a, @num b) { "pair" }
val g = fn(...xs) { "rest" }
g(1, 2) + ":" + g(1, 2, 3)
"#;
    assert_eq!(eval_display(src), "pair:rest");
}

#[test]
fn test_variadic_alone_accepts_zero_args() {
    let src = r#"
val g = fn(...xs) { len(xs) }
g()
"#;
    assert_eq!(eval_display(src), "0");
}

#[test]
fn test_tag_mismatch_disqualifies() {
    let src = r#"
val f = fn(@num x) { "n" }
f("oops")
"#;
    match eval_program(src) {
        Object::Error(EvalFault::DispatchFailed(types)) => {
            assert!(types.contains("string"), "message was: {}", types)
        }
        other => panic!("expected dispatch failure, got {:?}", other),
    }
}

#[test]
fn test_dispatch_error_lists_argument_types() {
    let src = r#"
val f = fn(@num x) { x }
val f = fn(@num x, @num y) { x + y }
f("a", [1])
"#;
    match eval_program(src) {
        Object::Error(EvalFault::DispatchFailed(types)) => {
            assert!(types.contains("string") && types.contains("list"));
        }
        other => panic!("expected dispatch failure, got {:?}", other),
    }
}

#[test]
fn test_same_signature_redefinition_replaces() {
    let src = r#"
val f = fn(@num x) { "old" }
val f = fn(@num x) { "new" }
f(1)
"#;
    assert_eq!(eval_display(src), "new");
}

#[test]
fn test_tag_score_beats_untagged() {
    let src = r#"
val f = fn(x, y) { "plain" }
val f = fn(@num x, @num y) { "tagged" }
f(1, 2)
"#;
    assert_eq!(eval_display(src), "tagged");
}

#[test]
fn test_group_dispatch_through_tail_calls() {
    // the tail-call target is a two-implementation group: dispatch runs on
    // every iteration and the loop still uses constant stack
    let src = r#"
val step = fn(@num n) if (n == 0) { "done" } else { step(n - 1) }
val step = fn(@str s) { s }
step(10000) + ":" + step("skip")
"#;
    assert_eq!(eval_display(src), "done:skip");
}

#[test]
fn test_imported_group_composes_without_mutation() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("shapes.slug"),
        "@export val area = fn(@num r) { r * r * 3 }\n@export val area = fn(@num w, @num h) { w * h }\n",
    )
    .unwrap();
    let runtime = Runtime::new(Config {
        root: tmp.path().to_path_buf(),
        home: None,
        nursery_limit: 4,
    });
    // a local implementation merges through a delegate: the imported group
    // keeps answering, and the source module is never mutated
    let src = r#"
import shapes
@import val area = shapes.area
val area = fn(@list wh) { wh[0] * wh[1] }
area(2) + ":" + area(3, 4) + ":" + area([3, 4])
"#;
    let result = run_source(&runtime, src, "<test>", &[]).expect("parse failed");
    assert_eq!(result.to_string(), "12:12:12");
    let src2 = r#"
import shapes
val direct = shapes.area(2)
val extended = { defer onerror(e) { return "unchanged" }
shapes.area([1, 2]) }
direct + ":" + extended
"#;
    let result2 = run_source(&runtime, src2, "<test>", &[]).expect("parse failed");
    assert_eq!(result2.to_string(), "12:unchanged");
}
