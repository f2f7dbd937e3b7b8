//! Clock and sleep foreign functions (`slug.time`).

use crate::error::EvalFault;
use crate::foreign::ForeignCtx;
use crate::foreign_fn;
use crate::number::Number;
use crate::object::Object;
use crossbeam_channel::{after, Select};
use std::time::Duration;

/// `sleep(ms)` — block the current task, waking early on cancellation.
fn sleep_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let ms = match args.first() {
        Some(Object::Number(n)) => match n.to_i64() {
            Some(ms) if ms >= 0 => ms as u64,
            _ => {
                return Object::Error(EvalFault::type_mismatch(
                    "sleep",
                    "non-negative milliseconds",
                    &n.to_string(),
                ))
            }
        },
        Some(other) => {
            return Object::Error(EvalFault::type_mismatch(
                "sleep",
                "number",
                other.type_name(),
            ))
        }
        None => return Object::Error(EvalFault::type_mismatch("sleep", "number", "nil")),
    };
    let state = ctx.task_state();
    let done = state.done().clone();
    let timer = after(Duration::from_millis(ms));
    let mut sel = Select::new();
    let op_timer = sel.recv(&timer);
    let op_done = sel.recv(&done);
    let oper = sel.select();
    if oper.index() == op_timer {
        let _ = oper.recv(&timer);
        Object::Nil
    } else {
        debug_assert_eq!(oper.index(), op_done);
        let _ = oper.recv(&done);
        state.cancellation()
    }
}

/// `now()` — milliseconds since the Unix epoch.
fn now_fn(_ctx: &mut dyn ForeignCtx, _args: Vec<Object>) -> Object {
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Object::Number(Number::from_i64(ms))
}

foreign_fn!("slug.time.sleep", "@num ms", prelude = "sleep", entry = sleep_fn);
foreign_fn!("slug.time.now", "", prelude = "now", entry = now_fn);
