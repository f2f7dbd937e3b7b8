// ABOUTME: Tests for match expressions and destructuring bindings

use slug::config::Config;
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
fn test_literal_and_wildcard_arms() {
    let src = r#"
val name = fn(x) match {
    0 => "zero"
    "hi" => "greeting"
    :ok => "symbol"
    nil => "nothing"
    _ => "other"
}
name(0) + "," + name("hi") + "," + name(:ok) + "," + name(nil) + "," + name(9)
"#;
    assert_eq!(eval_display(src), "zero,greeting,symbol,nothing,other");
}

#[test]
fn test_pinned_identifier_compares_outer_binding() {
    assert_eq!(
        eval_display("val x = 3\nmatch (3) { ^x => \"eq\"; _ => \"neq\" }"),
        "eq"
    );
    assert_eq!(
        eval_display("val x = 4\nmatch (3) { ^x => \"eq\"; _ => \"neq\" }"),
        "neq"
    );
}

#[test]
fn test_pinned_identifier_does_not_bind() {
    // matching ^x leaves the scope's bindings untouched
    let src = r#"
val x = 3
val r = match (3) { ^x => x; _ => 0 }
r + x
"#;
    assert_eq!(eval_display(src), "6");
}

#[test]
fn test_list_destructuring_with_spread() {
    assert_eq!(
        eval_display("val [a, b, ...rest] = [1, 2, 3, 4]\na + b + len(rest)"),
        "5"
    );
    // spread binds the empty list when nothing remains
    assert_eq!(
        eval_display("val [a, ...rest] = [1]\nlen(rest)"),
        "0"
    );
}

#[test]
fn test_list_length_must_match_without_spread() {
    let src = "match ([1, 2, 3]) { [a, b] => \"two\"; [a, b, c] => \"three\" }";
    assert_eq!(eval_display(src), "three");
}

#[test]
fn test_map_pattern_open_and_exact() {
    // a trailing spread leaves extra keys open
    assert_eq!(
        eval_display("match ({a: 1, b: 2}) { {a: v, ...} => v; _ => 0 }"),
        "1"
    );
    // without a spread the key set must match exactly
    assert_eq!(
        eval_display("match ({a: 1, b: 2}) { {a: v} => v; _ => 0 }"),
        "0"
    );
    assert_eq!(
        eval_display("match ({a: 1}) { {a: v} => v; _ => 0 }"),
        "1"
    );
}

#[test]
fn test_map_pattern_rest_binding() {
    let src = "val {a: x, ...rest} = {a: 1, b: 2, c: 3}\nx + len(rest)";
    assert_eq!(eval_display(src), "3");
}

#[test]
fn test_map_select_all_binds_string_keys() {
    let src = "val {*} = {width: 3, height: 4}\nwidth * height";
    assert_eq!(eval_display(src), "12");
}

#[test]
fn test_binding_pattern_at() {
    let src = r#"
match ([1, 2]) {
    whole @ [a, b] => len(whole) + a + b
    _ => 0
}
"#;
    assert_eq!(eval_display(src), "5");
}

#[test]
fn test_guards() {
    let src = r#"
val sign = fn(n) match {
    x if x > 0 => 1
    x if x < 0 => -1
    _ => 0
}
sign(5) + sign(-5) + sign(0)
"#;
    assert_eq!(eval_display(src), "0");
}

#[test]
fn test_alternative_patterns() {
    let src = r#"
val vowel = fn(c) match {
    "a", "e", "i", "o", "u" => true
    _ => false
}
[vowel("a"), vowel("x")]
"#;
    assert_eq!(eval_display(src), "[true, false]");
}

#[test]
fn test_struct_pattern_requires_exact_schema() {
    let src = r#"
val Point = struct { x, y }
val Size = struct { x, y }
val p = Point{x: 1, y: 2}
val classify = fn(v) match {
    Size{x} => "size " + x
    Point{x, y: b} => "point " + (x + b)
    _ => "other"
}
classify(p)
"#;
    assert_eq!(eval_display(src), "point 3");
}

#[test]
fn test_partial_bindings_vanish_on_failed_arm() {
    // the first arm binds `a` before failing on the second element; the
    // binding must not leak into the next arm's scope
    let src = r#"
val a = "outer"
match ([1, 2]) {
    [a, 99] => a
    _ => a
}
"#;
    assert_eq!(eval_display(src), "outer");
}

#[test]
fn test_nested_destructuring() {
    let src = r#"
val {user: {name: n, roles: [first, ...]}, ...} = {
    user: {name: "ada", roles: ["admin", "dev"]},
    active: true
}
n + ":" + first
"#;
    assert_eq!(eval_display(src), "ada:admin");
}

#[test]
fn test_match_body_statement_forms() {
    let src = r#"
val f = fn(x) match {
    0 => throw {type: "zero"}
    _ => x
}
val r = { defer onerror(e) { return e.type }
f(0) }
r
"#;
    assert_eq!(eval_display(src), "zero");
}

#[test]
fn test_no_matching_arm_faults() {
    let result = eval_program("match (42) { 0 => \"zero\" }");
    assert!(matches!(result, Object::Error(_)));
}

#[test]
fn test_symbol_and_bytes_literal_patterns() {
    assert_eq!(
        eval_display("match (:err) { :ok => 1; :err => 2; _ => 3 }"),
        "2"
    );
    assert_eq!(
        eval_display("match (0x\"FF\") { 0x\"00\" => \"zero\"; 0x\"FF\" => \"ones\"; _ => \"no\" }"),
        "ones"
    );
}
