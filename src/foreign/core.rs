//! Core prelude foreign functions: len, type, channel ops, range, assert.

use crate::error::EvalFault;
use crate::foreign::ForeignCtx;
use crate::foreign_fn;
use crate::number::Number;
use crate::object::Object;

/// `len(value)` — element count of a list or map, character count of a
/// string, byte count of bytes.
fn len_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    match args.first() {
        Some(Object::Str(s)) => Object::Number(Number::from_i64(s.chars().count() as i64)),
        Some(Object::Bytes(b)) => Object::Number(Number::from_i64(b.len() as i64)),
        Some(Object::List(items)) => Object::Number(Number::from_i64(items.len() as i64)),
        Some(Object::Map(m)) => Object::Number(Number::from_i64(m.len() as i64)),
        Some(other) => Object::Error(EvalFault::type_mismatch(
            "len",
            "string, bytes, list, or map",
            other.type_name(),
        )),
        None => Object::Error(EvalFault::type_mismatch("len", "value", "nil")),
    }
}

/// `type(value)` — the value's type name as a string.
fn type_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    Object::Str(
        args.first()
            .map(|a| a.type_name().to_string())
            .unwrap_or_else(|| "nil".to_string()),
    )
}

/// `close(ch)` — close a channel and return it; idempotent, so
/// `close(close(ch))` is a no-op.
fn close_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    match args.into_iter().next() {
        Some(Object::Channel(ch)) => {
            ch.close();
            Object::Channel(ch)
        }
        Some(other) => Object::Error(EvalFault::type_mismatch(
            "close",
            "channel",
            other.type_name(),
        )),
        None => Object::Error(EvalFault::type_mismatch("close", "channel", "nil")),
    }
}

/// `channel(capacity = 0)` — a bounded channel.
fn channel_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let capacity = match args.first() {
        Some(Object::Number(n)) => match n.to_index() {
            Some(c) => c,
            None => {
                return Object::Error(EvalFault::type_mismatch(
                    "channel",
                    "non-negative capacity",
                    &n.to_string(),
                ))
            }
        },
        Some(Object::Nil) | None => 0,
        Some(other) => {
            return Object::Error(EvalFault::type_mismatch(
                "channel",
                "number",
                other.type_name(),
            ))
        }
    };
    Object::Channel(std::sync::Arc::new(crate::channel::Channel::new(
        ctx.next_handle_id(),
        capacity,
    )))
}

/// `send(ch, value)` — blocking send; errors on a closed channel.
fn send_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let Some(Object::Channel(ch)) = args.first() else {
        return Object::Error(EvalFault::type_mismatch(
            "send",
            "channel",
            args.first().map(|a| a.type_name()).unwrap_or("nil"),
        ));
    };
    let value = args.get(1).cloned().unwrap_or(Object::Nil);
    let state = ctx.task_state();
    match ch.send_blocking(value.clone(), state.done()) {
        crate::channel::SendOutcome::Sent => value,
        crate::channel::SendOutcome::Closed => {
            Object::Error(EvalFault::Message("send on closed channel".to_string()))
        }
        crate::channel::SendOutcome::Cancelled => state.cancellation(),
    }
}

/// `recv(ch)` — blocking receive; a drained closed channel yields `closed`.
fn recv_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let Some(Object::Channel(ch)) = args.first() else {
        return Object::Error(EvalFault::type_mismatch(
            "recv",
            "channel",
            args.first().map(|a| a.type_name()).unwrap_or("nil"),
        ));
    };
    let state = ctx.task_state();
    match ch.recv_blocking(state.done()) {
        crate::channel::RecvOutcome::Value(v) => v,
        crate::channel::RecvOutcome::Drained => Object::Closed,
        crate::channel::RecvOutcome::Cancelled => state.cancellation(),
    }
}

/// `range(a, b = nil)` — `range(n)` is `[0, n)`, `range(a, b)` is `[a, b)`.
fn range_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let int_of = |value: Option<&Object>| -> Option<i64> {
        match value {
            Some(Object::Number(n)) => n.to_i64(),
            _ => None,
        }
    };
    let (lo, hi) = match (int_of(args.first()), int_of(args.get(1))) {
        (Some(a), Some(b)) => (a, b),
        (Some(n), None) => (0, n),
        _ => {
            return Object::Error(EvalFault::type_mismatch(
                "range",
                "integer bounds",
                args.first().map(|a| a.type_name()).unwrap_or("nil"),
            ))
        }
    };
    Object::List((lo..hi).map(|i| Object::Number(Number::from_i64(i))).collect())
}

/// `assert(cond, message = "assertion failed")` — error when falsy.
fn assert_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let cond = args.first().cloned().unwrap_or(Object::Nil);
    if cond.is_truthy() {
        return Object::Bool(true);
    }
    let message = match args.get(1) {
        Some(Object::Nil) | None => "assertion failed".to_string(),
        Some(other) => other.to_string(),
    };
    Object::Error(EvalFault::Message(message))
}

foreign_fn!("slug.core.len", "value", prelude = "len", entry = len_fn);
foreign_fn!("slug.core.type", "value", prelude = "type", entry = type_fn);
foreign_fn!("slug.core.close", "ch", prelude = "close", entry = close_fn);
foreign_fn!("slug.core.channel", "capacity = nil", prelude = "channel", entry = channel_fn);
foreign_fn!("slug.core.send", "ch, value", prelude = "send", entry = send_fn);
foreign_fn!("slug.core.recv", "ch", prelude = "recv", entry = recv_fn);
foreign_fn!("slug.core.range", "a, b = nil", prelude = "range", entry = range_fn);
foreign_fn!("slug.core.assert", "cond, message = nil", prelude = "assert", entry = assert_fn);
