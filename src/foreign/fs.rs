//! File I/O foreign functions (`slug.io.fs`).

use crate::error::EvalFault;
use crate::foreign::ForeignCtx;
use crate::foreign_fn;
use crate::object::Object;
use std::path::PathBuf;

/// Relative paths resolve under the configured project root.
fn resolve(ctx: &dyn ForeignCtx, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        ctx.config().root.join(p)
    }
}

fn path_arg<'a>(name: &str, args: &'a [Object]) -> Result<&'a str, EvalFault> {
    match args.first() {
        Some(Object::Str(s)) => Ok(s),
        Some(other) => Err(EvalFault::type_mismatch(name, "string", other.type_name())),
        None => Err(EvalFault::type_mismatch(name, "string", "nil")),
    }
}

/// `readFile(path)` — the file's contents as a string.
fn read_file_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let path = match path_arg("readFile", &args) {
        Ok(p) => p,
        Err(fault) => return Object::Error(fault),
    };
    match std::fs::read_to_string(resolve(ctx, path)) {
        Ok(text) => Object::Str(text),
        Err(e) => Object::Error(EvalFault::Message(format!("{}: {}", path, e))),
    }
}

/// `writeFile(path, content)` — write a string or bytes; returns the byte
/// count written.
fn write_file_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let path = match path_arg("writeFile", &args) {
        Ok(p) => p.to_string(),
        Err(fault) => return Object::Error(fault),
    };
    let data: Vec<u8> = match args.get(1) {
        Some(Object::Str(s)) => s.as_bytes().to_vec(),
        Some(Object::Bytes(b)) => b.clone(),
        Some(other) => {
            return Object::Error(EvalFault::type_mismatch(
                "writeFile",
                "string or bytes",
                other.type_name(),
            ))
        }
        None => Vec::new(),
    };
    match std::fs::write(resolve(ctx, &path), &data) {
        Ok(()) => Object::Number(crate::number::Number::from_i64(data.len() as i64)),
        Err(e) => Object::Error(EvalFault::Message(format!("{}: {}", path, e))),
    }
}

/// `exists(path)` — whether the path names a file or directory.
fn exists_fn(ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let path = match path_arg("exists", &args) {
        Ok(p) => p,
        Err(fault) => return Object::Error(fault),
    };
    let exists = resolve(ctx, path).exists();
    ctx.native_bool(exists)
}

foreign_fn!("slug.io.fs.readFile", "@str path", entry = read_file_fn);
foreign_fn!("slug.io.fs.writeFile", "@str path, content", entry = write_file_fn);
foreign_fn!("slug.io.fs.exists", "@str path", entry = exists_fn);
