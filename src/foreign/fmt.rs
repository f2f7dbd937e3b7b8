//! Console output foreign functions (`slug.fmt`): println, print, str.

use crate::foreign::ForeignCtx;
use crate::foreign_fn;
use crate::object::Object;

fn join_display(args: &[Object]) -> String {
    args.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `println(...args)` — write arguments to stdout, space-separated, with a
/// trailing newline.
fn println_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let items = match args.into_iter().next() {
        Some(Object::List(items)) => items,
        _ => Vec::new(),
    };
    println!("{}", join_display(&items));
    Object::Nil
}

/// `print(...args)` — like `println` without the newline.
fn print_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let items = match args.into_iter().next() {
        Some(Object::List(items)) => items,
        _ => Vec::new(),
    };
    print!("{}", join_display(&items));
    use std::io::Write;
    let _ = std::io::stdout().flush();
    Object::Nil
}

/// `str(value)` — the display form of any value.
fn str_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    Object::Str(args.first().map(|a| a.to_string()).unwrap_or_default())
}

/// `inspect(value)` — the quoted, container-style rendering.
fn inspect_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    Object::Str(args.first().map(|a| a.inspect()).unwrap_or_default())
}

foreign_fn!("slug.fmt.println", "...args", prelude = "println", entry = println_fn);
foreign_fn!("slug.fmt.print", "...args", prelude = "print", entry = print_fn);
foreign_fn!("slug.fmt.str", "value", prelude = "str", entry = str_fn);
foreign_fn!("slug.fmt.inspect", "value", entry = inspect_fn);
