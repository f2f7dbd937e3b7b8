// ABOUTME: Tree-walking evaluator: TCO loop, dispatch, defers, concurrency

use crate::ast::*;
use crate::config::Config;
use crate::env::{Deferred, Environment, FrameInfo, ModuleInfo};
use crate::error::{EvalFault, ParseError};
use crate::foreign::{ForeignCtx, ForeignFn};
use crate::object::{
    bind_slots, dispatch, verify_tags, Function, MapObj, Module, Object, RuntimeErr, StructSchema,
    StructValue, Symbol, TailCall, TailTarget, TraceFrame,
};
use crate::runtime::{ModuleSlot, Runtime};
use crate::task::{timeout_error, Nursery, TaskState};
use crate::token::Position;
use crate::{ops, parser, pattern};
use crossbeam_channel::{after, Receiver, Select};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Non-tail recursion burns host stack; keep the limit conservative enough
/// for the 2 MiB default thread stack.
const MAX_CALL_DEPTH: usize = 256;

/// One evaluator: an environment consumer with its own nursery stack and
/// call stack, sharing the Runtime with every other task.
pub struct Task {
    pub runtime: Arc<Runtime>,
    pub state: Arc<TaskState>,
    nurseries: Vec<Arc<Nursery>>,
    call_stack: Vec<Arc<Function>>,
}

/// Parse `--key value` / `--flag` pairs into the `argm` map.
pub fn parse_argm(args: &[String]) -> MapObj {
    let mut map = MapObj::new();
    let mut i = 0;
    while i < args.len() {
        if let Some(key) = args[i].strip_prefix("--") {
            let value = match args.get(i + 1) {
                Some(next) if !next.starts_with("--") => {
                    i += 1;
                    Object::Str(next.clone())
                }
                _ => Object::Bool(true),
            };
            let _ = map.insert(Object::Str(key.to_string()), value);
        }
        i += 1;
    }
    map
}

/// Evaluate a source text as the `main` module with CLI arguments bound.
pub fn run_source(
    runtime: &Arc<Runtime>,
    source: &str,
    path: &str,
    argv: &[String],
) -> Result<Object, ParseError> {
    let program = parser::parse(source)?;
    let info = Arc::new(ModuleInfo {
        fqn: "main".to_string(),
        path: path.to_string(),
        source: source.to_string(),
    });
    let env = Environment::enclosed_module(runtime.prelude.clone(), info);
    env.define(
        "argv",
        Object::List(argv.iter().map(|a| Object::Str(a.clone())).collect()),
        false,
    );
    env.define("argm", Object::Map(parse_argm(argv)), false);
    let mut task = Task::new_root(runtime.clone());
    Ok(task.run_program(&program, &env))
}

impl Task {
    pub fn new_root(runtime: Arc<Runtime>) -> Task {
        let state = TaskState::new(runtime.next_handle_id());
        Task {
            runtime,
            state,
            nurseries: Vec::new(),
            call_stack: Vec::new(),
        }
    }

    /// Evaluate a program under a default nursery scope, joining spawned
    /// children before returning.
    pub fn run_program(&mut self, program: &Program, env: &Arc<Environment>) -> Object {
        let nursery = Nursery::new(self.runtime.config.nursery_limit);
        self.nurseries.push(nursery.clone());
        let mut result = Object::Nil;
        for stmt in &program.stmts {
            result = self.eval_stmt(stmt, env);
            if result.is_abrupt() {
                break;
            }
        }
        result = self.run_defers(env, result);
        self.nurseries.pop();
        result = self.join_nursery(&nursery, result);
        if let Object::Return(inner) = result {
            result = *inner;
        }
        result
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn eval_stmt(&mut self, stmt: &Stmt, env: &Arc<Environment>) -> Object {
        if self.state.is_cancelled() {
            return self.state.cancellation();
        }
        match stmt {
            Stmt::Val {
                pattern,
                value,
                tags,
                ..
            } => self.eval_binding(pattern, value, tags, false, env),
            Stmt::Var {
                pattern,
                value,
                tags,
                ..
            } => self.eval_binding(pattern, value, tags, true, env),
            Stmt::Return { value, .. } => {
                let result = match value {
                    Some(expr) => self.eval_expr(expr, env),
                    None => Object::Nil,
                };
                if result.is_abrupt() {
                    return result;
                }
                Object::Return(Box::new(result))
            }
            Stmt::Throw { value, pos } => {
                let payload = self.eval_expr(value, env);
                if payload.is_abrupt() {
                    return payload;
                }
                let stack = self.capture_stack(env, *pos);
                Object::Failure(RuntimeErr::new(payload, stack))
            }
            Stmt::Defer { kind, body, .. } => {
                env.push_defer(kind.clone(), body.clone());
                Object::Nil
            }
            Stmt::Import { segments, .. } => {
                let fqn = segments.join(".");
                let module = self.load_module(&fqn);
                if module.is_abrupt() {
                    return module;
                }
                if let Some(name) = segments.last() {
                    env.define_flagged(name, module.clone(), false, true, false);
                }
                module
            }
            Stmt::ForeignDecl {
                name,
                params,
                sig,
                tags,
                ..
            } => {
                let fqn = match env.module_info() {
                    Some(info) => format!("{}.{}", info.fqn, name),
                    None => name.clone(),
                };
                match self.runtime.lookup_foreign(&fqn) {
                    Some(registered) => {
                        let bound = registered.with_params(params.clone(), sig.clone());
                        let obj = Object::Foreign(Arc::new(bound));
                        let is_export = tags.iter().any(|t| t.name == "export");
                        env.define_flagged(name, obj.clone(), false, false, is_export);
                        obj
                    }
                    None => Object::Error(EvalFault::Message(format!(
                        "foreign function '{}' is not registered",
                        fqn
                    ))),
                }
            }
            Stmt::Expr { expr, .. } => self.eval_expr(expr, env),
        }
    }

    fn eval_binding(
        &mut self,
        pattern: &Pattern,
        value_expr: &Expr,
        tags: &[Tag],
        mutable: bool,
        env: &Arc<Environment>,
    ) -> Object {
        let is_export = tags.iter().any(|t| t.name == "export");
        let is_import = tags.iter().any(|t| t.name == "import");
        let value = self.eval_expr(value_expr, env);
        if value.is_abrupt() {
            return value;
        }
        match pattern {
            Pattern::Ident { name, .. } => {
                // name the function or schema after its binding
                match &value {
                    Object::Function(f) => *f.name.write() = Some(name.clone()),
                    Object::Schema(s) => *s.name.write() = name.clone(),
                    _ => {}
                }
                env.define_flagged(name, value.clone(), mutable, is_import, is_export);
                value
            }
            _ => {
                let scratch = Environment::enclosed(env.clone());
                match self.match_pattern(pattern, &value, &scratch, env) {
                    Err(abrupt) => abrupt,
                    Ok(false) => Object::Error(EvalFault::Message(format!(
                        "binding pattern did not match {}",
                        value.type_name()
                    ))),
                    Ok(true) => {
                        self.promote_bindings(&scratch, env, mutable, is_import, is_export);
                        value
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn eval_expr(&mut self, expr: &Expr, env: &Arc<Environment>) -> Object {
        match expr {
            Expr::Nil { .. } => Object::Nil,
            Expr::Bool { value, .. } => Object::Bool(*value),
            Expr::Num { value, .. } => Object::Number(value.clone()),
            Expr::Bytes { data, .. } => Object::Bytes(data.clone()),
            Expr::Symbol { name, .. } => Object::Symbol(Symbol::intern(name)),
            Expr::Str { pieces, .. } => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        StrPiece::Lit(text) => out.push_str(text),
                        StrPiece::Interp(inner) => {
                            let value = self.eval_expr(inner, env);
                            if value.is_abrupt() {
                                return value;
                            }
                            out.push_str(&value.to_string());
                        }
                    }
                }
                Object::Str(out)
            }
            Expr::Ident { name, .. } => match env.get(name) {
                Some(value) => value,
                None => Object::Error(EvalFault::Undefined(name.clone())),
            },
            Expr::List { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        ListItem::Item(e) => {
                            let value = self.eval_expr(e, env);
                            if value.is_abrupt() {
                                return value;
                            }
                            out.push(value);
                        }
                        ListItem::Spread(e) => {
                            let value = self.eval_expr(e, env);
                            if value.is_abrupt() {
                                return value;
                            }
                            match value {
                                Object::List(items) => out.extend(items),
                                other => {
                                    return Object::Error(EvalFault::type_mismatch(
                                        "spread",
                                        "list",
                                        other.type_name(),
                                    ))
                                }
                            }
                        }
                    }
                }
                Object::List(out)
            }
            Expr::Map { entries, .. } => {
                let mut map = MapObj::new();
                for entry in entries {
                    match entry {
                        MapEntry::Pair(key, value_expr) => {
                            let value = self.eval_expr(value_expr, env);
                            if value.is_abrupt() {
                                return value;
                            }
                            if let Err(fault) =
                                map.insert(pattern::map_key_object(key), value)
                            {
                                return Object::Error(fault);
                            }
                        }
                        MapEntry::Spread(e) => {
                            let value = self.eval_expr(e, env);
                            if value.is_abrupt() {
                                return value;
                            }
                            match value {
                                Object::Map(other) => {
                                    for (k, v) in other.iter() {
                                        let _ = map.insert(k.clone(), v.clone());
                                    }
                                }
                                other => {
                                    return Object::Error(EvalFault::type_mismatch(
                                        "spread",
                                        "map",
                                        other.type_name(),
                                    ))
                                }
                            }
                        }
                    }
                }
                Object::Map(map)
            }
            Expr::Fn { decl, .. } => Object::Function(Arc::new(Function {
                name: parking_lot::RwLock::new(None),
                decl: decl.clone(),
                env: env.clone(),
            })),
            Expr::StructDef { fields, .. } => Object::Schema(Arc::new(StructSchema {
                name: parking_lot::RwLock::new("struct".to_string()),
                fields: fields.clone(),
                env: env.clone(),
            })),
            Expr::StructInit { target, fields, .. } => self.eval_struct_init(target, fields, env),
            Expr::Prefix { op, operand, .. } => {
                let value = self.eval_expr(operand, env);
                if value.is_abrupt() {
                    return value;
                }
                ops::prefix(*op, &value)
            }
            Expr::Infix {
                op, left, right, ..
            } => match op {
                InfixOp::And => {
                    let lhs = self.eval_expr(left, env);
                    if lhs.is_abrupt() || !lhs.is_truthy() {
                        return lhs;
                    }
                    self.eval_expr(right, env)
                }
                InfixOp::Or => {
                    let lhs = self.eval_expr(left, env);
                    if lhs.is_abrupt() || lhs.is_truthy() {
                        return lhs;
                    }
                    self.eval_expr(right, env)
                }
                _ => {
                    let lhs = self.eval_expr(left, env);
                    if lhs.is_abrupt() {
                        return lhs;
                    }
                    let rhs = self.eval_expr(right, env);
                    if rhs.is_abrupt() {
                        return rhs;
                    }
                    ops::infix(*op, &lhs, &rhs)
                }
            },
            Expr::Assign { target, value, .. } => self.eval_assign(target, value, env),
            Expr::Index { target, index, .. } => {
                let target_v = self.eval_expr(target, env);
                if target_v.is_abrupt() {
                    return target_v;
                }
                let index_v = self.eval_expr(index, env);
                if index_v.is_abrupt() {
                    return index_v;
                }
                self.eval_index(&target_v, &index_v)
            }
            Expr::SliceArg { start, end, .. } => {
                let mut bound = |opt: &Option<Box<Expr>>| -> Result<Option<i64>, Object> {
                    match opt {
                        None => Ok(None),
                        Some(e) => {
                            let v = self.eval_expr(e, env);
                            if v.is_abrupt() {
                                return Err(v);
                            }
                            match v {
                                Object::Number(n) => match n.to_i64() {
                                    Some(i) => Ok(Some(i)),
                                    None => Err(Object::Error(EvalFault::type_mismatch(
                                        "slice",
                                        "integer",
                                        &n.to_string(),
                                    ))),
                                },
                                other => Err(Object::Error(EvalFault::type_mismatch(
                                    "slice",
                                    "number",
                                    other.type_name(),
                                ))),
                            }
                        }
                    }
                };
                let start = match bound(start) {
                    Ok(v) => v,
                    Err(abrupt) => return abrupt,
                };
                let end = match bound(end) {
                    Ok(v) => v,
                    Err(abrupt) => return abrupt,
                };
                Object::Slice { start, end }
            }
            Expr::Dot { target, name, .. } => {
                let target_v = self.eval_expr(target, env);
                if target_v.is_abrupt() {
                    return target_v;
                }
                self.eval_dot(&target_v, name)
            }
            Expr::Call {
                callee,
                args,
                tail,
                pos,
            } => {
                let callee_v = self.eval_expr(callee, env);
                if callee_v.is_abrupt() {
                    return callee_v;
                }
                let (positional, named) = match self.eval_call_args(args, env) {
                    Ok(pair) => pair,
                    Err(abrupt) => return abrupt,
                };
                if *tail && !self.call_stack.is_empty() {
                    return Object::TailCall(Box::new(TailCall {
                        target: TailTarget::Value(callee_v),
                        args: positional,
                        named,
                        pos: *pos,
                    }));
                }
                self.apply(callee_v, positional, named, *pos, env)
            }
            Expr::Recur { args, tail, pos } => {
                let (positional, named) = match self.eval_call_args(args, env) {
                    Ok(pair) => pair,
                    Err(abrupt) => return abrupt,
                };
                if *tail {
                    return Object::TailCall(Box::new(TailCall {
                        target: TailTarget::Current,
                        args: positional,
                        named,
                        pos: *pos,
                    }));
                }
                // defers disabled TCO for this function: real recursion
                match self.call_stack.last().cloned() {
                    Some(current) => self.apply_function(current, positional, named, *pos),
                    None => Object::Error(EvalFault::Message(
                        "recur outside of a function".to_string(),
                    )),
                }
            }
            Expr::Pipe {
                left, right, pos, ..
            } => {
                let value = self.eval_expr(left, env);
                if value.is_abrupt() {
                    return value;
                }
                let callee = self.eval_expr(right, env);
                if callee.is_abrupt() {
                    return callee;
                }
                self.apply(callee, vec![value], Vec::new(), *pos, env)
            }
            Expr::Match { subject, arms, .. } => self.eval_match(subject, arms, env),
            Expr::If {
                cond, then, alt, ..
            } => {
                let cond_v = self.eval_expr(cond, env);
                if cond_v.is_abrupt() {
                    return cond_v;
                }
                if cond_v.is_truthy() {
                    self.eval_expr(then, env)
                } else {
                    match alt {
                        Some(alt) => self.eval_expr(alt, env),
                        None => Object::Nil,
                    }
                }
            }
            Expr::Block(block) => self.eval_block(block, env),
            Expr::Spawn { body, pos } => self.eval_spawn(body.clone(), *pos, env),
            Expr::Await {
                target,
                timeout,
                pos,
            } => self.eval_await(target, timeout.as_deref(), *pos, env),
            Expr::Select { arms, pos } => self.eval_select(arms, *pos, env),
        }
    }

    /// A block expression: fresh scope, optional nursery, defers on exit.
    fn eval_block(&mut self, block: &Block, env: &Arc<Environment>) -> Object {
        let scope = Environment::enclosed(env.clone());
        let nursery = match &block.nursery {
            Some(spec) => match self.open_nursery(spec, &scope) {
                Ok(n) => Some(n),
                Err(abrupt) => return abrupt,
            },
            None => None,
        };
        let mut result = Object::Nil;
        for stmt in &block.stmts {
            result = self.eval_stmt(stmt, &scope);
            if result.is_abrupt() {
                break;
            }
        }
        result = self.run_defers(&scope, result);
        if let Some(n) = nursery {
            self.nurseries.pop();
            result = self.join_nursery(&n, result);
        }
        result
    }

    fn open_nursery(
        &mut self,
        spec: &NurserySpec,
        env: &Arc<Environment>,
    ) -> Result<Arc<Nursery>, Object> {
        let limit = match &spec.limit {
            Some(expr) => {
                let v = self.eval_expr(expr, env);
                if v.is_abrupt() {
                    return Err(v);
                }
                match v {
                    Object::Number(n) => n.to_index().ok_or_else(|| {
                        Object::Error(EvalFault::type_mismatch(
                            "nursery",
                            "positive integer limit",
                            &n.to_string(),
                        ))
                    })?,
                    other => {
                        return Err(Object::Error(EvalFault::type_mismatch(
                            "nursery",
                            "number",
                            other.type_name(),
                        )))
                    }
                }
            }
            None => self.runtime.config.nursery_limit,
        };
        let nursery = Nursery::new(limit);
        self.nurseries.push(nursery.clone());
        Ok(nursery)
    }

    fn eval_struct_init(
        &mut self,
        target: &Expr,
        fields: &[(String, Expr)],
        env: &Arc<Environment>,
    ) -> Object {
        let target_v = self.eval_expr(target, env);
        if target_v.is_abrupt() {
            return target_v;
        }
        match target_v {
            Object::Schema(schema) => {
                for (name, _) in fields {
                    if !schema.fields.iter().any(|f| &f.name == name) {
                        return Object::Error(EvalFault::UnknownMember(name.clone()));
                    }
                }
                let mut values = HashMap::new();
                for field in &schema.fields {
                    let provided = fields.iter().find(|(name, _)| name == &field.name);
                    let value = match provided {
                        Some((_, expr)) => self.eval_expr(expr, env),
                        None => match &field.default {
                            // defaults evaluate in the schema's defining
                            // environment, at construction time
                            Some(default) => self.eval_expr(default, &schema.env),
                            None => Object::Nil,
                        },
                    };
                    if value.is_abrupt() {
                        return value;
                    }
                    values.insert(field.name.clone(), value);
                }
                Object::Struct(StructValue {
                    schema,
                    fields: Arc::new(parking_lot::RwLock::new(values)),
                })
            }
            Object::Struct(instance) => {
                // copy with updates
                let mut values = instance.fields.read().clone();
                for (name, expr) in fields {
                    if !values.contains_key(name) {
                        return Object::Error(EvalFault::UnknownMember(name.clone()));
                    }
                    let value = self.eval_expr(expr, env);
                    if value.is_abrupt() {
                        return value;
                    }
                    values.insert(name.clone(), value);
                }
                Object::Struct(StructValue {
                    schema: instance.schema.clone(),
                    fields: Arc::new(parking_lot::RwLock::new(values)),
                })
            }
            other => Object::Error(EvalFault::type_mismatch(
                "struct init",
                "struct schema or struct",
                other.type_name(),
            )),
        }
    }

    fn eval_assign(&mut self, target: &Expr, value_expr: &Expr, env: &Arc<Environment>) -> Object {
        let value = self.eval_expr(value_expr, env);
        if value.is_abrupt() {
            return value;
        }
        match target {
            Expr::Ident { name, .. } => match env.assign(name, value.clone()) {
                Ok(()) => value,
                Err(fault) => Object::Error(fault),
            },
            Expr::Dot {
                target: obj_expr,
                name,
                ..
            } => {
                let obj = self.eval_expr(obj_expr, env);
                if obj.is_abrupt() {
                    return obj;
                }
                match obj {
                    Object::Struct(instance) => {
                        let mut fields = instance.fields.write();
                        if !fields.contains_key(name) {
                            return Object::Error(EvalFault::UnknownMember(name.clone()));
                        }
                        fields.insert(name.clone(), value.clone());
                        value
                    }
                    Object::Map(mut map) => {
                        // maps are values: write through a rebindable name
                        let Expr::Ident { name: var, .. } = &**obj_expr else {
                            return Object::Error(EvalFault::Message(
                                "cannot assign through this expression".to_string(),
                            ));
                        };
                        if let Err(fault) =
                            map.insert(Object::Str(name.clone()), value.clone())
                        {
                            return Object::Error(fault);
                        }
                        match env.assign(var, Object::Map(map)) {
                            Ok(()) => value,
                            Err(fault) => Object::Error(fault),
                        }
                    }
                    other => Object::Error(EvalFault::type_mismatch(
                        "assignment",
                        "struct or map",
                        other.type_name(),
                    )),
                }
            }
            Expr::Index {
                target: obj_expr,
                index,
                ..
            } => {
                let index_v = self.eval_expr(index, env);
                if index_v.is_abrupt() {
                    return index_v;
                }
                let obj = self.eval_expr(obj_expr, env);
                if obj.is_abrupt() {
                    return obj;
                }
                let Expr::Ident { name: var, .. } = &**obj_expr else {
                    return Object::Error(EvalFault::Message(
                        "cannot assign through this expression".to_string(),
                    ));
                };
                match obj {
                    Object::List(mut items) => {
                        let Object::Number(n) = &index_v else {
                            return Object::Error(EvalFault::type_mismatch(
                                "index",
                                "number",
                                index_v.type_name(),
                            ));
                        };
                        let Some(idx) = resolve_index(n.to_i64(), items.len()) else {
                            return Object::Error(EvalFault::BadIndex(index_v.to_string()));
                        };
                        items[idx] = value.clone();
                        match env.assign(var, Object::List(items)) {
                            Ok(()) => value,
                            Err(fault) => Object::Error(fault),
                        }
                    }
                    Object::Map(mut map) => {
                        if let Err(fault) = map.insert(index_v, value.clone()) {
                            return Object::Error(fault);
                        }
                        match env.assign(var, Object::Map(map)) {
                            Ok(()) => value,
                            Err(fault) => Object::Error(fault),
                        }
                    }
                    other => Object::Error(EvalFault::type_mismatch(
                        "assignment",
                        "list or map",
                        other.type_name(),
                    )),
                }
            }
            _ => Object::Error(EvalFault::Message("invalid assignment target".to_string())),
        }
    }

    fn eval_index(&mut self, target: &Object, index: &Object) -> Object {
        match (target, index) {
            (Object::List(items), Object::Number(n)) => {
                match resolve_index(n.to_i64(), items.len()) {
                    Some(i) => items[i].clone(),
                    None => Object::Error(EvalFault::BadIndex(index.to_string())),
                }
            }
            (Object::List(items), Object::Slice { start, end }) => {
                let (a, b) = resolve_slice(*start, *end, items.len());
                Object::List(items[a..b].to_vec())
            }
            (Object::Str(s), Object::Number(n)) => {
                let chars: Vec<char> = s.chars().collect();
                match resolve_index(n.to_i64(), chars.len()) {
                    Some(i) => Object::Str(chars[i].to_string()),
                    None => Object::Error(EvalFault::BadIndex(index.to_string())),
                }
            }
            (Object::Str(s), Object::Slice { start, end }) => {
                let chars: Vec<char> = s.chars().collect();
                let (a, b) = resolve_slice(*start, *end, chars.len());
                Object::Str(chars[a..b].iter().collect())
            }
            (Object::Bytes(data), Object::Number(n)) => {
                match resolve_index(n.to_i64(), data.len()) {
                    Some(i) => Object::Number(crate::number::Number::from_i64(data[i] as i64)),
                    None => Object::Error(EvalFault::BadIndex(index.to_string())),
                }
            }
            (Object::Bytes(data), Object::Slice { start, end }) => {
                let (a, b) = resolve_slice(*start, *end, data.len());
                Object::Bytes(data[a..b].to_vec())
            }
            (Object::Map(map), key) => map.get(key).unwrap_or(Object::Nil),
            (other, _) => Object::Error(EvalFault::type_mismatch(
                "index",
                "list, string, bytes, or map",
                other.type_name(),
            )),
        }
    }

    fn eval_dot(&mut self, target: &Object, name: &str) -> Object {
        match target {
            Object::Module(module) => match module.env.get_export(name) {
                Some(value) => value,
                None => Object::Error(EvalFault::UnknownMember(format!(
                    "{}.{}",
                    module.fqn, name
                ))),
            },
            Object::Map(map) => map
                .get(&Object::Str(name.to_string()))
                .unwrap_or(Object::Nil),
            Object::Struct(instance) => match instance.fields.read().get(name) {
                Some(value) => value.clone(),
                None => Object::Error(EvalFault::UnknownMember(name.to_string())),
            },
            other => Object::Error(EvalFault::type_mismatch(
                "member access",
                "module, map, or struct",
                other.type_name(),
            )),
        }
    }

    fn eval_call_args(
        &mut self,
        args: &[CallArg],
        env: &Arc<Environment>,
    ) -> Result<(Vec<Object>, Vec<(String, Object)>), Object> {
        let mut positional = Vec::new();
        let mut named = Vec::new();
        for arg in args {
            match arg {
                CallArg::Positional(e) => {
                    let v = self.eval_expr(e, env);
                    if v.is_abrupt() {
                        return Err(v);
                    }
                    positional.push(v);
                }
                CallArg::Named(name, e) => {
                    let v = self.eval_expr(e, env);
                    if v.is_abrupt() {
                        return Err(v);
                    }
                    named.push((name.clone(), v));
                }
                CallArg::Spread(e) => {
                    let v = self.eval_expr(e, env);
                    if v.is_abrupt() {
                        return Err(v);
                    }
                    match v {
                        Object::List(items) => positional.extend(items),
                        other => {
                            return Err(Object::Error(EvalFault::type_mismatch(
                                "spread",
                                "list",
                                other.type_name(),
                            )))
                        }
                    }
                }
            }
        }
        Ok((positional, named))
    }

    fn eval_match(
        &mut self,
        subject: &Expr,
        arms: &[MatchArm],
        env: &Arc<Environment>,
    ) -> Object {
        let value = self.eval_expr(subject, env);
        if value.is_abrupt() {
            return value;
        }
        for arm in arms {
            for pat in &arm.patterns {
                let scratch = Environment::enclosed(env.clone());
                match self.match_pattern(pat, &value, &scratch, env) {
                    Err(abrupt) => return abrupt,
                    Ok(false) => continue,
                    Ok(true) => {
                        if let Some(guard) = &arm.guard {
                            let g = self.eval_expr(guard, &scratch);
                            if g.is_abrupt() {
                                return g;
                            }
                            if !g.is_truthy() {
                                break; // guard failed: next arm
                            }
                        }
                        return self.eval_expr(&arm.body, &scratch);
                    }
                }
            }
        }
        Object::Error(EvalFault::Message(format!(
            "no match arm for {}",
            value.inspect()
        )))
    }

    // ------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------

    pub fn apply(
        &mut self,
        callee: Object,
        args: Vec<Object>,
        named: Vec<(String, Object)>,
        pos: Position,
        env: &Arc<Environment>,
    ) -> Object {
        if self.state.is_cancelled() {
            return self.state.cancellation();
        }
        match callee {
            Object::Group(group) => match dispatch(&group.candidates(), &args, &named) {
                Ok(chosen) => self.apply(chosen, args, named, pos, env),
                Err(fault) => Object::Error(fault),
            },
            Object::Function(func) => self.apply_function(func, args, named, pos),
            Object::Foreign(ff) => self.call_foreign(ff, args, named, env),
            other => Object::Error(EvalFault::NotCallable(other.type_name().to_string())),
        }
    }

    /// The function application loop: bind arguments, evaluate the body,
    /// run defers, join a body nursery, then consume tail-call sentinels.
    /// A self-targeted tail call rebinds and re-enters iteratively.
    fn apply_function(
        &mut self,
        func: Arc<Function>,
        args: Vec<Object>,
        named: Vec<(String, Object)>,
        pos: Position,
    ) -> Object {
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Object::Error(EvalFault::Message("call stack exhausted".to_string()));
        }
        let mut current = func;
        let mut args = args;
        let mut named = named;
        loop {
            let frame = FrameInfo {
                name: current.display_name(),
                pos,
            };
            let env = Environment::for_call(current.env.clone(), frame);
            if let Err(abrupt) = self.bind_args(&current, &args, &named, &env) {
                return abrupt;
            }
            self.call_stack.push(current.clone());
            let nursery = match &current.decl.body.nursery {
                Some(spec) => match self.open_nursery(spec, &env) {
                    Ok(n) => Some(n),
                    Err(abrupt) => {
                        self.call_stack.pop();
                        return abrupt;
                    }
                },
                None => None,
            };
            let mut result = Object::Nil;
            for stmt in &current.decl.body.stmts {
                result = self.eval_stmt(stmt, &env);
                if result.is_abrupt() {
                    break;
                }
            }
            result = self.run_defers(&env, result);
            if let Some(n) = nursery {
                self.nurseries.pop();
                result = self.join_nursery(&n, result);
            }
            self.call_stack.pop();

            let tail = match result {
                Object::TailCall(tc) => *tc,
                Object::Return(inner) => return *inner,
                other => return other,
            };
            match tail.target {
                TailTarget::Current => {
                    args = tail.args;
                    named = tail.named;
                }
                TailTarget::Value(Object::Function(next)) => {
                    // same loop for self and direct cross-function tails:
                    // mutual recursion also runs in constant stack
                    current = next;
                    args = tail.args;
                    named = tail.named;
                }
                TailTarget::Value(Object::Group(group)) => {
                    match dispatch(&group.candidates(), &tail.args, &tail.named) {
                        Ok(Object::Function(next)) => {
                            current = next;
                            args = tail.args;
                            named = tail.named;
                        }
                        Ok(chosen) => {
                            let ctx_env = current.env.clone();
                            return self.apply(chosen, tail.args, tail.named, tail.pos, &ctx_env);
                        }
                        Err(fault) => return Object::Error(fault),
                    }
                }
                TailTarget::Value(other) => {
                    let ctx_env = current.env.clone();
                    return self.apply(other, tail.args, tail.named, tail.pos, &ctx_env);
                }
            }
        }
    }

    /// Bind arguments into the call environment. Unfilled optional slots
    /// evaluate their defaults lexically in the function's defining
    /// environment.
    fn bind_args(
        &mut self,
        func: &Arc<Function>,
        args: &[Object],
        named: &[(String, Object)],
        env: &Arc<Environment>,
    ) -> Result<(), Object> {
        let params = &func.decl.params;
        let slots = bind_slots(params, args, named).map_err(Object::Error)?;
        verify_tags(params, &slots, args, named).map_err(Object::Error)?;
        for (param, slot) in params.iter().zip(slots) {
            let value = match slot {
                Some(v) => v,
                None => match &param.default {
                    Some(default) => {
                        let v = self.eval_expr(default, &func.env);
                        if v.is_abrupt() {
                            return Err(v);
                        }
                        v
                    }
                    None => Object::Nil,
                },
            };
            env.define(&param.name, value, true);
        }
        Ok(())
    }

    fn call_foreign(
        &mut self,
        ff: Arc<ForeignFn>,
        args: Vec<Object>,
        named: Vec<(String, Object)>,
        env: &Arc<Environment>,
    ) -> Object {
        let slots = match bind_slots(&ff.params, &args, &named) {
            Ok(slots) => slots,
            Err(fault) => return Object::Error(fault),
        };
        if let Err(fault) = verify_tags(&ff.params, &slots, &args, &named) {
            return Object::Error(fault);
        }
        let mut bound = Vec::with_capacity(slots.len());
        for (param, slot) in ff.params.iter().zip(slots) {
            let value = match slot {
                Some(v) => v,
                None => match &param.default {
                    Some(default) => {
                        let v = self.eval_expr(default, env);
                        if v.is_abrupt() {
                            return v;
                        }
                        v
                    }
                    None => Object::Nil,
                },
            };
            bound.push(value);
        }
        let mut ctx = Ctx {
            task: self,
            env: env.clone(),
        };
        let result = (ff.entry)(&mut ctx, bound);
        match result {
            // a plain error from native code becomes a runtime error with
            // the foreign function's name as metadata
            Object::Error(fault) => {
                let mut payload = MapObj::new();
                let _ = payload.insert(
                    Object::Str("type".to_string()),
                    Object::Str("error".to_string()),
                );
                let _ = payload.insert(
                    Object::Str("message".to_string()),
                    Object::Str(fault.to_string()),
                );
                let _ = payload.insert(
                    Object::Str("foreign".to_string()),
                    Object::Str(ff.name.clone()),
                );
                let stack = env.capture_stack();
                Object::Failure(RuntimeErr::new(Object::Map(payload), stack))
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Defers
    // ------------------------------------------------------------------

    /// Execute a scope's deferred statements, most recent first, with
    /// success/error discrimination, recovery, and rethrow-by-identity.
    fn run_defers(&mut self, env: &Arc<Environment>, mut result: Object) -> Object {
        if !env.has_defers() {
            return result;
        }
        // a pending tail call must complete before defers may run
        if let Object::TailCall(tc) = result {
            result = self.resolve_tail(*tc, env);
        }
        for deferred in env.take_defers() {
            let is_error = matches!(result, Object::Failure(_) | Object::Error(_));
            match deferred.kind.clone() {
                DeferKind::Always => {
                    result = self.run_one_defer(&deferred, env, result, None);
                }
                DeferKind::OnSuccess => {
                    if !is_error {
                        result = self.run_one_defer(&deferred, env, result, None);
                    }
                }
                DeferKind::OnError(name) => {
                    if is_error {
                        let failure = match &result {
                            Object::Failure(e) => e.clone(),
                            Object::Error(fault) => self.promote_fault(fault, env),
                            _ => unreachable!(),
                        };
                        result = self.run_one_defer(
                            &deferred,
                            env,
                            Object::Failure(failure.clone()),
                            Some((name, failure)),
                        );
                    }
                }
            }
        }
        result
    }

    fn run_one_defer(
        &mut self,
        deferred: &Deferred,
        env: &Arc<Environment>,
        current: Object,
        onerror: Option<(String, Arc<RuntimeErr>)>,
    ) -> Object {
        let scope = Environment::enclosed(env.clone());
        if let Some((name, failure)) = &onerror {
            scope.define(name, failure.payload.clone(), false);
        }
        let mut body_result = Object::Nil;
        for stmt in &deferred.body.stmts {
            body_result = self.eval_stmt(stmt, &scope);
            if body_result.is_abrupt() {
                break;
            }
        }
        body_result = self.run_defers(&scope, body_result);
        match body_result {
            Object::Failure(new_err) => {
                // a fresh error replaces the current one, chaining it
                let cause = match &current {
                    Object::Failure(orig) => Some(orig.clone()),
                    _ => new_err.cause.clone(),
                };
                Object::Failure(RuntimeErr::with_cause(
                    new_err.payload.clone(),
                    new_err.stack.clone(),
                    cause,
                ))
            }
            Object::Error(fault) => {
                let promoted = self.promote_fault(&fault, env);
                let cause = match &current {
                    Object::Failure(orig) => Some(orig.clone()),
                    _ => None,
                };
                Object::Failure(RuntimeErr::with_cause(
                    promoted.payload.clone(),
                    promoted.stack.clone(),
                    cause,
                ))
            }
            Object::Return(value) => match &onerror {
                Some((_, original)) => {
                    if value.object_eq(&original.payload) {
                        // returning the error payload rethrows, preserving
                        // the original error's identity and stack
                        Object::Failure(original.clone())
                    } else {
                        *value
                    }
                }
                None => current,
            },
            _ => current,
        }
    }

    fn resolve_tail(&mut self, tail: TailCall, env: &Arc<Environment>) -> Object {
        match tail.target {
            TailTarget::Current => match self.call_stack.last().cloned() {
                Some(current) => self.apply_function(current, tail.args, tail.named, tail.pos),
                None => Object::Error(EvalFault::Message(
                    "recur outside of a function".to_string(),
                )),
            },
            TailTarget::Value(callee) => {
                self.apply(callee, tail.args, tail.named, tail.pos, env)
            }
        }
    }

    fn promote_fault(&self, fault: &EvalFault, env: &Arc<Environment>) -> Arc<RuntimeErr> {
        let mut payload = MapObj::new();
        let _ = payload.insert(
            Object::Str("type".to_string()),
            Object::Str("error".to_string()),
        );
        let _ = payload.insert(
            Object::Str("message".to_string()),
            Object::Str(fault.to_string()),
        );
        RuntimeErr::new(Object::Map(payload), env.capture_stack())
    }

    fn capture_stack(&self, env: &Arc<Environment>, pos: Position) -> Vec<TraceFrame> {
        let mut frames = Vec::new();
        let info = env.module_info();
        let name = self
            .call_stack
            .last()
            .map(|f| f.display_name())
            .unwrap_or_else(|| "main".to_string());
        frames.push(TraceFrame {
            name,
            file: info
                .as_ref()
                .map(|m| m.path.clone())
                .unwrap_or_else(|| "<anonymous>".to_string()),
            pos,
            source_line: info.as_ref().and_then(|m| {
                m.source
                    .lines()
                    .nth(pos.line.saturating_sub(1) as usize)
                    .map(|l| l.to_string())
            }),
        });
        frames.extend(env.capture_stack());
        frames
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    fn eval_spawn(&mut self, body: Arc<Expr>, _pos: Position, env: &Arc<Environment>) -> Object {
        let Some(nursery) = self.nurseries.last().cloned() else {
            return Object::Error(EvalFault::Message("spawn outside of a scope".to_string()));
        };
        if !nursery.acquire_slot(self.state.done()) {
            return self.state.cancellation();
        }
        let child = TaskState::new(self.runtime.next_handle_id());
        nursery.register(child.clone());
        let spawn_env = env.shallow_copy();
        let runtime = self.runtime.clone();
        let child_state = child.clone();
        let owner = nursery;
        std::thread::spawn(move || {
            let mut task = Task {
                runtime: runtime.clone(),
                state: child_state.clone(),
                nurseries: Vec::new(),
                call_stack: Vec::new(),
            };
            // the task's own root scope: its spawns join before it finishes
            let root = Nursery::new(runtime.config.nursery_limit);
            task.nurseries.push(root.clone());
            let mut result = task.eval_expr(&body, &spawn_env);
            task.nurseries.pop();
            result = task.join_nursery(&root, result);
            if let Object::Return(inner) = result {
                result = *inner;
            }
            child_state.finish(result);
            owner.release_slot();
        });
        Object::Task(child)
    }

    fn eval_await(
        &mut self,
        target: &Expr,
        timeout: Option<&Expr>,
        _pos: Position,
        env: &Arc<Environment>,
    ) -> Object {
        let target_v = self.eval_expr(target, env);
        if target_v.is_abrupt() {
            return target_v;
        }
        let Object::Task(task) = target_v else {
            return Object::Error(EvalFault::type_mismatch(
                "await",
                "task",
                target_v.type_name(),
            ));
        };
        let timeout_ms = match timeout {
            Some(expr) => {
                let v = self.eval_expr(expr, env);
                if v.is_abrupt() {
                    return v;
                }
                match v {
                    Object::Number(n) => match n.to_i64() {
                        Some(ms) if ms >= 0 => Some(ms),
                        _ => {
                            return Object::Error(EvalFault::type_mismatch(
                                "await",
                                "non-negative timeout",
                                &n.to_string(),
                            ))
                        }
                    },
                    other => {
                        return Object::Error(EvalFault::type_mismatch(
                            "await",
                            "number",
                            other.type_name(),
                        ))
                    }
                }
            }
            None => None,
        };
        self.await_task(&task, timeout_ms)
    }

    fn await_task(&mut self, task: &Arc<TaskState>, timeout_ms: Option<i64>) -> Object {
        let my_done = self.state.done().clone();
        let their_done = task.done().clone();
        let timer: Option<Receiver<Instant>> =
            timeout_ms.map(|ms| after(Duration::from_millis(ms as u64)));
        let mut sel = Select::new();
        let op_done = sel.recv(&their_done);
        let op_cancel = sel.recv(&my_done);
        let op_timer = timer.as_ref().map(|t| sel.recv(t));
        let oper = sel.select();
        let index = oper.index();
        if index == op_done {
            let _ = oper.recv(&their_done);
            self.observe(task);
            task.take_result()
        } else if index == op_cancel {
            let _ = oper.recv(&my_done);
            self.state.cancellation()
        } else {
            debug_assert_eq!(Some(index), op_timer);
            if let Some(t) = &timer {
                let _ = oper.recv(t);
            }
            let err = timeout_error(task.id, timeout_ms.unwrap_or(0));
            task.cancel(Some(err.clone()), "await timeout");
            self.observe(task);
            Object::Failure(err)
        }
    }

    /// Mark a task observed and drop it from this task's nursery scopes so
    /// its result is not double-propagated at join.
    fn observe(&mut self, task: &Arc<TaskState>) {
        task.mark_observed();
        for nursery in &self.nurseries {
            nursery.remove(task);
        }
    }

    /// Join a nursery on scope exit: cancel children downward on error or
    /// early return, wait for everyone, hoist the first un-awaited failure
    /// (fail-fast: a failing child cancels its siblings).
    fn join_nursery(&mut self, nursery: &Arc<Nursery>, result: Object) -> Object {
        let exiting_abruptly = matches!(
            result,
            Object::Failure(_) | Object::Error(_) | Object::Return(_)
        );
        if exiting_abruptly {
            let cause = match &result {
                Object::Failure(e) => Some(e.clone()),
                _ => None,
            };
            nursery.cancel_children(cause, "scope exited");
        }
        let my_done = self.state.done().clone();
        let mut pending = nursery.children();
        let mut hoisted: Option<Arc<RuntimeErr>> = None;
        while !pending.is_empty() {
            let done_rxs: Vec<Receiver<()>> =
                pending.iter().map(|c| c.done().clone()).collect();
            let mut sel = Select::new();
            for rx in &done_rxs {
                sel.recv(rx);
            }
            let op_cancel = sel.recv(&my_done);
            let oper = sel.select();
            let index = oper.index();
            if index == op_cancel {
                let _ = oper.recv(&my_done);
                // the joining task itself was cancelled: take children down
                nursery.cancel_children(None, "parent cancelled");
                continue;
            }
            let _ = oper.recv(&done_rxs[index]);
            drop(sel);
            let child = pending.remove(index);
            if child.is_observed() {
                continue;
            }
            child.mark_observed();
            if let Object::Failure(err) = child.take_result() {
                if hoisted.is_none() && !exiting_abruptly {
                    hoisted = Some(err.clone());
                    // fail fast: cancel the remaining siblings
                    for sibling in &pending {
                        sibling.cancel(Some(err.clone()), "sibling failed");
                    }
                }
            }
        }
        match hoisted {
            Some(err) if !exiting_abruptly => Object::Failure(err),
            _ => result,
        }
    }

    fn eval_select(
        &mut self,
        arms: &[SelectArm],
        pos: Position,
        env: &Arc<Environment>,
    ) -> Object {
        enum Prepared {
            Recv(Arc<crate::channel::Channel>),
            Send(Arc<crate::channel::Channel>, Object),
            After(i64, Receiver<Instant>),
            AwaitTask(Arc<TaskState>),
            Default,
        }
        #[derive(Clone, Copy)]
        enum Role {
            RecvData(usize),
            RecvClosed(usize),
            SendData(usize),
            SendClosed(usize),
            Timer(usize),
            TaskDone(usize),
        }

        let mut prepared = Vec::with_capacity(arms.len());
        let mut default_arm: Option<usize> = None;
        for (i, arm) in arms.iter().enumerate() {
            let p = match &arm.op {
                SelectOp::Recv(ch_expr) => {
                    let ch = self.eval_expr(ch_expr, env);
                    if ch.is_abrupt() {
                        return ch;
                    }
                    let Object::Channel(ch) = ch else {
                        return Object::Error(EvalFault::type_mismatch(
                            "select recv",
                            "channel",
                            ch.type_name(),
                        ));
                    };
                    Prepared::Recv(ch)
                }
                SelectOp::Send(ch_expr, value_expr) => {
                    let ch = self.eval_expr(ch_expr, env);
                    if ch.is_abrupt() {
                        return ch;
                    }
                    let Object::Channel(ch) = ch else {
                        return Object::Error(EvalFault::type_mismatch(
                            "select send",
                            "channel",
                            ch.type_name(),
                        ));
                    };
                    let value = self.eval_expr(value_expr, env);
                    if value.is_abrupt() {
                        return value;
                    }
                    Prepared::Send(ch, value)
                }
                SelectOp::After(ms_expr) => {
                    let v = self.eval_expr(ms_expr, env);
                    if v.is_abrupt() {
                        return v;
                    }
                    let Object::Number(n) = &v else {
                        return Object::Error(EvalFault::type_mismatch(
                            "select after",
                            "number",
                            v.type_name(),
                        ));
                    };
                    let Some(ms) = n.to_i64().filter(|ms| *ms >= 0) else {
                        return Object::Error(EvalFault::type_mismatch(
                            "select after",
                            "non-negative milliseconds",
                            &n.to_string(),
                        ));
                    };
                    Prepared::After(ms, after(Duration::from_millis(ms as u64)))
                }
                SelectOp::AwaitTask(task_expr) => {
                    let v = self.eval_expr(task_expr, env);
                    if v.is_abrupt() {
                        return v;
                    }
                    let Object::Task(t) = v else {
                        return Object::Error(EvalFault::type_mismatch(
                            "select await",
                            "task",
                            v.type_name(),
                        ));
                    };
                    Prepared::AwaitTask(t)
                }
                SelectOp::Default => {
                    default_arm = Some(i);
                    Prepared::Default
                }
            };
            prepared.push(p);
        }

        let my_done = self.state.done().clone();
        let mut sel = Select::new();
        let mut roles: Vec<Role> = Vec::new();
        for (i, p) in prepared.iter().enumerate() {
            match p {
                Prepared::Recv(ch) => {
                    sel.recv(&ch.data_rx);
                    roles.push(Role::RecvData(i));
                    sel.recv(&ch.close_rx);
                    roles.push(Role::RecvClosed(i));
                }
                Prepared::Send(ch, _) => {
                    sel.send(&ch.data_tx);
                    roles.push(Role::SendData(i));
                    sel.recv(&ch.close_rx);
                    roles.push(Role::SendClosed(i));
                }
                Prepared::After(_, rx) => {
                    sel.recv(rx);
                    roles.push(Role::Timer(i));
                }
                Prepared::AwaitTask(t) => {
                    sel.recv(t.done());
                    roles.push(Role::TaskDone(i));
                }
                Prepared::Default => {}
            }
        }
        let op_cancel = sel.recv(&my_done);

        let selected = if default_arm.is_some() {
            match sel.try_select() {
                Ok(oper) => Some(oper),
                Err(_) => None,
            }
        } else {
            Some(sel.select())
        };

        let (arm_idx, produced) = match selected {
            None => (default_arm.unwrap(), Object::Nil),
            Some(oper) => {
                let index = oper.index();
                if index == op_cancel {
                    let _ = oper.recv(&my_done);
                    return self.state.cancellation();
                }
                match roles[index] {
                    Role::RecvData(i) => {
                        let Prepared::Recv(ch) = &prepared[i] else {
                            unreachable!()
                        };
                        match oper.recv(&ch.data_rx) {
                            Ok(value) => (i, value),
                            Err(_) => (i, Object::Closed),
                        }
                    }
                    Role::RecvClosed(i) => {
                        let Prepared::Recv(ch) = &prepared[i] else {
                            unreachable!()
                        };
                        let _ = oper.recv(&ch.close_rx);
                        match ch.data_rx.try_recv() {
                            Ok(value) => (i, value),
                            Err(_) => (i, Object::Closed),
                        }
                    }
                    Role::SendData(i) => {
                        let Prepared::Send(ch, value) = &prepared[i] else {
                            unreachable!()
                        };
                        let _ = oper.send(&ch.data_tx, value.clone());
                        (i, value.clone())
                    }
                    Role::SendClosed(i) => {
                        let Prepared::Send(ch, _) = &prepared[i] else {
                            unreachable!()
                        };
                        let _ = oper.recv(&ch.close_rx);
                        return Object::Error(EvalFault::Message(
                            "send on closed channel".to_string(),
                        ));
                    }
                    Role::Timer(i) => {
                        let Prepared::After(ms, rx) = &prepared[i] else {
                            unreachable!()
                        };
                        let _ = oper.recv(rx);
                        (i, Object::Number(crate::number::Number::from_i64(*ms)))
                    }
                    Role::TaskDone(i) => {
                        let Prepared::AwaitTask(t) = &prepared[i] else {
                            unreachable!()
                        };
                        let _ = oper.recv(t.done());
                        let t = t.clone();
                        self.observe(&t);
                        let result = t.take_result();
                        if result.is_abrupt() {
                            return result;
                        }
                        (i, result)
                    }
                }
            }
        };

        match &arms[arm_idx].handler {
            Some(handler) => {
                let callee = self.eval_expr(handler, env);
                if callee.is_abrupt() {
                    return callee;
                }
                self.apply(callee, vec![produced], Vec::new(), pos, env)
            }
            None => produced,
        }
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Load a module by fully-qualified name. Cached; a cyclic import sees
    /// the in-progress exports as `binding-ref` indirections, and touching
    /// one whose target is still uninitialized is a fault.
    pub fn load_module(&mut self, fqn: &str) -> Object {
        match self.runtime.module_slot(fqn) {
            Some(ModuleSlot::Loaded(module)) => return Object::Module(module),
            Some(ModuleSlot::Loading(env, _)) => {
                // circular import: hand back a view whose exports are
                // binding refs into the in-progress environment, so they
                // resolve lazily at first use
                let view = Environment::new_module(None);
                for name in env.exported_names() {
                    view.define_flagged(
                        &name,
                        Object::BindingRef {
                            env: env.clone(),
                            name: name.clone(),
                        },
                        false,
                        false,
                        true,
                    );
                }
                return Object::Module(Arc::new(Module {
                    fqn: fqn.to_string(),
                    env: view,
                }));
            }
            None => {}
        }
        let Some(path) = self.runtime.resolve_module_path(fqn) else {
            return Object::Error(EvalFault::Message(format!("module not found: {}", fqn)));
        };
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                return Object::Error(EvalFault::Message(format!(
                    "cannot read module {}: {}",
                    fqn, e
                )))
            }
        };
        let program = match parser::parse(&source) {
            Ok(p) => p,
            Err(e) => {
                return Object::Error(EvalFault::Message(format!(
                    "parse error in {}: {}",
                    fqn, e
                )))
            }
        };
        let info = Arc::new(ModuleInfo {
            fqn: fqn.to_string(),
            path: path.display().to_string(),
            source,
        });
        let env = Environment::enclosed_module(self.runtime.prelude.clone(), info.clone());
        // two-phase load: exports appear before the body evaluates
        for stmt in &program.stmts {
            match stmt {
                Stmt::Val { pattern, tags, .. } | Stmt::Var { pattern, tags, .. } => {
                    if tags.iter().any(|t| t.name == "export") {
                        let mut names = Vec::new();
                        pattern::pattern_names(pattern, &mut names);
                        for name in names {
                            env.declare_uninitialized(&name, true);
                        }
                    }
                }
                Stmt::ForeignDecl { name, tags, .. } => {
                    if tags.iter().any(|t| t.name == "export") {
                        env.declare_uninitialized(name, true);
                    }
                }
                _ => {}
            }
        }
        self.runtime.publish_loading(fqn, env.clone(), info);

        let mut loader = Task::new_root(self.runtime.clone());
        let result = loader.run_program(&program, &env);
        let module = Arc::new(Module {
            fqn: fqn.to_string(),
            env: env.clone(),
        });
        if result.is_abrupt() {
            let failure = match result {
                Object::Failure(e) => e,
                Object::Error(fault) => self.promote_fault(&fault, &env),
                other => {
                    return other;
                }
            };
            // failed exports stay poisoned for anyone who imported the cycle
            for name in env.exported_names() {
                if env.is_uninitialized(&name) {
                    env.set_binding_error(&name, failure.clone());
                }
            }
            self.runtime.evict_module(fqn);
            return Object::Failure(failure);
        }
        self.runtime.publish_loaded(fqn, module.clone());
        Object::Module(module)
    }

}

/// Foreign-call context: a thin view over the running task.
struct Ctx<'a> {
    task: &'a mut Task,
    env: Arc<Environment>,
}

impl ForeignCtx for Ctx<'_> {
    fn env(&self) -> Arc<Environment> {
        self.env.clone()
    }

    fn config(&self) -> &Config {
        &self.task.runtime.config
    }

    fn next_handle_id(&self) -> u64 {
        self.task.runtime.next_handle_id()
    }

    fn load_module(&mut self, fqn: &str) -> Object {
        self.task.load_module(fqn)
    }

    fn task_state(&self) -> Arc<TaskState> {
        self.task.state.clone()
    }
}

fn resolve_index(idx: Option<i64>, len: usize) -> Option<usize> {
    let idx = idx?;
    let resolved = if idx < 0 { idx + len as i64 } else { idx };
    if resolved < 0 || resolved >= len as i64 {
        None
    } else {
        Some(resolved as usize)
    }
}

fn resolve_slice(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { v + len as i64 } else { v };
        v.clamp(0, len as i64) as usize
    };
    let a = start.map(clamp).unwrap_or(0);
    let b = end.map(clamp).unwrap_or(len);
    (a, b.max(a))
}
