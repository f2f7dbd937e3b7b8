// ABOUTME: Tests for module loading, exports, cycles, and foreign declarations

use slug::config::Config;
use slug::interp::run_source;
use slug::object::Object;
use slug::runtime::Runtime;
use std::path::Path;
use std::sync::Arc;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn runtime_at(root: &Path, home: Option<&Path>) -> Arc<Runtime> {
    Runtime::new(Config {
        root: root.to_path_buf(),
        home: home.map(|h| h.to_path_buf()),
        nursery_limit: 4,
    })
}

fn eval_with(runtime: &Arc<Runtime>, src: &str) -> Object {
    run_source(runtime, src, "<test>", &[]).expect("parse failed")
}

#[test]
fn test_import_binds_last_segment() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "util/math.slug",
        "@export val double = fn(n) { n * 2 }\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    let result = eval_with(&runtime, "import util.math\nmath.double(21)");
    assert_eq!(result.to_string(), "42");
}

#[test]
fn test_only_exports_are_visible() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "secrets.slug",
        "val hidden = 1\n@export val shown = 2\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    assert_eq!(eval_with(&runtime, "import secrets\nsecrets.shown").to_string(), "2");
    assert!(matches!(
        eval_with(&runtime, "import secrets\nsecrets.hidden"),
        Object::Error(_)
    ));
}

#[test]
fn test_resolution_prefers_root_over_home() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("proj");
    let home = tmp.path().join("slughome");
    write(&root, "dup.slug", "@export val origin = \"root\"\n");
    write(&home, "lib/dup.slug", "@export val origin = \"home\"\n");
    write(&home, "lib/only/in/home.slug", "@export val origin = \"home\"\n");
    let runtime = runtime_at(&root, Some(&home));
    assert_eq!(
        eval_with(&runtime, "import dup\ndup.origin").to_string(),
        "root"
    );
    assert_eq!(
        eval_with(&runtime, "import only.in.home\nhome.origin").to_string(),
        "home"
    );
}

#[test]
fn test_missing_module_faults() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = runtime_at(tmp.path(), None);
    match eval_with(&runtime, "import no.such.thing") {
        Object::Error(fault) => assert!(fault.to_string().contains("no.such.thing")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_module_cached_across_imports() {
    let tmp = tempfile::tempdir().unwrap();
    // module-level state proves the body runs once
    write(
        tmp.path(),
        "counter.slug",
        "var hits = 0\nhits = hits + 1\n@export val count = fn() { hits }\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    let result = eval_with(
        &runtime,
        "import counter\nimport counter\ncounter.count()",
    );
    assert_eq!(result.to_string(), "1");
}

#[test]
fn test_circular_imports_resolve() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "alpha.slug",
        "import beta\n@export val name = \"alpha\"\n@export val other = fn() { beta.name }\n",
    );
    write(
        tmp.path(),
        "beta.slug",
        "import alpha\n@export val name = \"beta\"\n@export val other = fn() { alpha.name }\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    // calls run after both modules finished loading, so the cycle is fine
    let result = eval_with(&runtime, "import alpha\nalpha.other() + \":\" + alpha.name");
    assert_eq!(result.to_string(), "beta:alpha");
}

#[test]
fn test_use_before_initialization_is_diagnosed() {
    let tmp = tempfile::tempdir().unwrap();
    // beta reads alpha's export while alpha is still loading
    write(tmp.path(), "alpha.slug", "import beta\n@export val x = 1\n");
    write(tmp.path(), "beta.slug", "import alpha\n@export val y = alpha.x + 1\n");
    let runtime = runtime_at(tmp.path(), None);
    match eval_with(&runtime, "import alpha") {
        Object::Failure(err) => {
            let rendered = slug::trace::render_failure(&err);
            assert!(
                rendered.contains("before initialization"),
                "got: {}",
                rendered
            );
        }
        Object::Error(fault) => {
            assert!(
                fault.to_string().contains("before initialization"),
                "got: {}",
                fault
            );
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn test_foreign_declaration_binds_registry_entry() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "slug/encoding/json.slug",
        "@export foreign parse = fn(@str text)\n@export foreign stringify = fn(value)\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    let src = r#"
import slug.encoding.json
val decoded = json.parse("{\"n\": [1, 2, 3]}")
len(decoded.n)
"#;
    assert_eq!(eval_with(&runtime, src).to_string(), "3");
    let src2 = r#"
import slug.encoding.json
json.stringify([1, 2])
"#;
    assert_eq!(eval_with(&runtime, src2).to_string(), "[1,2]");
}

#[test]
fn test_unregistered_foreign_faults() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "bogus.slug", "foreign nope = fn(x)\n");
    let runtime = runtime_at(tmp.path(), None);
    match eval_with(&runtime, "import bogus") {
        Object::Error(fault) => assert!(fault.to_string().contains("bogus.nope")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_foreign_json_round_trip_via_fs_module() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "slug/io/fs.slug",
        "@export foreign readFile = fn(@str path)\n@export foreign writeFile = fn(@str path, content)\n@export foreign exists = fn(@str path)\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    let src = r#"
import slug.io.fs
fs.writeFile("note.txt", "hello")
val back = fs.readFile("note.txt")
[fs.exists("note.txt"), fs.exists("missing.txt"), back]
"#;
    assert_eq!(
        eval_with(&runtime, src).to_string(),
        "[true, false, \"hello\"]"
    );
}

#[test]
fn test_module_runs_under_default_nursery() {
    let tmp = tempfile::tempdir().unwrap();
    // the module's spawned task must be joined before the import returns
    write(
        tmp.path(),
        "worker.slug",
        "val ch = channel(1)\nspawn { send(ch, 7) }\n@export val value = recv(ch)\n",
    );
    let runtime = runtime_at(tmp.path(), None);
    assert_eq!(
        eval_with(&runtime, "import worker\nworker.value").to_string(),
        "7"
    );
}
