// ABOUTME: User-facing rendering of runtime errors with stack traces

use crate::error::EvalFault;
use crate::object::{Object, RuntimeErr};

/// Render a runtime error as shown to the user:
///
/// ```text
/// RuntimeError: {type: "boom"}
///   throw {type: "boom"}
/// Stack trace:
///   at 3:5 explode — scripts/demo.slug
/// Caused by: …
/// ```
pub fn render_failure(err: &RuntimeErr) -> String {
    let mut out = String::new();
    render_into(err, &mut out);
    out
}

fn render_into(err: &RuntimeErr, out: &mut String) {
    out.push_str(&format!("RuntimeError: {}", err.payload.inspect()));
    if let Some(frame) = err.stack.first() {
        if let Some(line) = &frame.source_line {
            out.push_str(&format!("\n  {}", line.trim_end()));
        }
    }
    if !err.stack.is_empty() {
        out.push_str("\nStack trace:");
        for frame in &err.stack {
            out.push_str(&format!(
                "\n  at {} {} — {}",
                frame.pos, frame.name, frame.file
            ));
        }
    }
    if let Some(cause) = &err.cause {
        out.push_str("\nCaused by: ");
        render_into(cause, out);
    }
}

/// Render any abrupt evaluation result for the CLI and REPL.
pub fn render_abrupt(result: &Object) -> Option<String> {
    match result {
        Object::Failure(err) => Some(render_failure(err)),
        Object::Error(fault) => Some(render_fault(fault)),
        _ => None,
    }
}

pub fn render_fault(fault: &EvalFault) -> String {
    format!("Error: {}", fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{MapObj, TraceFrame};
    use crate::token::Position;

    #[test]
    fn test_render_with_stack_and_cause() {
        let mut payload = MapObj::new();
        payload
            .insert(
                Object::Str("type".to_string()),
                Object::Str("boom".to_string()),
            )
            .unwrap();
        let cause = RuntimeErr::new(Object::Str("io failed".to_string()), vec![]);
        let err = RuntimeErr::with_cause(
            Object::Map(payload),
            vec![TraceFrame {
                name: "explode".to_string(),
                file: "demo.slug".to_string(),
                pos: Position { line: 3, col: 5 },
                source_line: Some("  throw {type: \"boom\"}".to_string()),
            }],
            Some(cause),
        );
        let rendered = render_failure(&err);
        assert!(rendered.starts_with("RuntimeError: {"));
        assert!(rendered.contains("throw {type: \"boom\"}"));
        assert!(rendered.contains("at 3:5 explode — demo.slug"));
        assert!(rendered.contains("Caused by: RuntimeError: io failed"));
    }
}
