// ABOUTME: Runtime value variants and dispatch machinery for the Slug evaluator

use crate::ast::{FnDecl, Param, Signature};
use crate::channel::Channel;
use crate::env::Environment;
use crate::error::EvalFault;
use crate::foreign::ForeignFn;
use crate::number::Number;
use crate::task::TaskState;
use crate::token::Position;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Interned symbols
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Interner {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

static SYMBOLS: Lazy<RwLock<Interner>> = Lazy::new(|| RwLock::new(Interner::default()));

/// A globally interned tag; equality is identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u32);

impl Symbol {
    pub fn intern(name: &str) -> Symbol {
        {
            let table = SYMBOLS.read();
            if let Some(&id) = table.index.get(name) {
                return Symbol(id);
            }
        }
        let mut table = SYMBOLS.write();
        if let Some(&id) = table.index.get(name) {
            return Symbol(id);
        }
        let id = table.names.len() as u32;
        table.names.push(name.to_string());
        table.index.insert(name.to_string(), id);
        Symbol(id)
    }

    pub fn name(&self) -> String {
        SYMBOLS.read().names[self.0 as usize].clone()
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// Hash keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Nil,
    Bool,
    Num,
    Str,
    Bytes,
    Sym,
    List,
    Map,
    Schema,
    Struct,
    Fun,
    Module,
    Chan,
    Task,
    Slice,
    Closed,
}

/// Deterministic key for hashable values: `(type-tag, 64-bit hash)`.
/// Equal values produce equal keys; number keys hash the integral part only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub tag: TypeTag,
    pub hash: u64,
}

fn hash_of<T: Hash>(value: T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// Maps
// ---------------------------------------------------------------------------

/// A mapping from hashable keys to values. The original key object is
/// retained alongside each value for display and iteration.
#[derive(Debug, Clone, Default)]
pub struct MapObj {
    entries: HashMap<HashKey, (Object, Object)>,
}

impl MapObj {
    pub fn new() -> Self {
        MapObj::default()
    }

    pub fn get(&self, key: &Object) -> Option<Object> {
        let hk = key.hash_key()?;
        self.entries.get(&hk).map(|(_, v)| v.clone())
    }

    pub fn insert(&mut self, key: Object, value: Object) -> Result<(), EvalFault> {
        let hk = key.hash_key().ok_or_else(|| {
            EvalFault::type_mismatch("map", "hashable key", key.type_name())
        })?;
        self.entries.insert(hk, (key, value));
        Ok(())
    }

    pub fn remove(&mut self, key: &Object) -> Option<Object> {
        let hk = key.hash_key()?;
        self.entries.remove(&hk).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &Object) -> bool {
        key.hash_key()
            .map(|hk| self.entries.contains_key(&hk))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Object, &Object)> {
        self.entries.values().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Object> {
        self.entries.values().map(|(k, _)| k)
    }

    pub fn key_set(&self) -> Vec<HashKey> {
        self.entries.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Functions, groups, structs, modules
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Function {
    pub name: RwLock<Option<String>>,
    pub decl: Arc<FnDecl>,
    pub env: Arc<Environment>,
}

impl Function {
    pub fn display_name(&self) -> String {
        self.name.read().clone().unwrap_or_else(|| "fn".to_string())
    }
}

/// A multi-dispatch container. Implementations are kept in declaration
/// order, which is the final dispatch tie-break; `delegates` are other
/// groups merged in transparently at dispatch time.
#[derive(Debug, Default)]
pub struct FunctionGroup {
    pub name: RwLock<String>,
    impls: RwLock<Vec<Object>>,
    delegates: RwLock<Vec<Arc<FunctionGroup>>>,
}

impl FunctionGroup {
    pub fn new(name: &str) -> Self {
        FunctionGroup {
            name: RwLock::new(name.to_string()),
            impls: RwLock::new(Vec::new()),
            delegates: RwLock::new(Vec::new()),
        }
    }

    /// Add an implementation, replacing any previous one with the same
    /// signature key.
    pub fn add(&self, f: Object) {
        let key = match callable_signature(&f) {
            Some(sig) => sig.key(),
            None => return,
        };
        let mut impls = self.impls.write();
        for slot in impls.iter_mut() {
            if callable_signature(slot).map(|s| s.key()) == Some(key.clone()) {
                *slot = f;
                return;
            }
        }
        impls.push(f);
    }

    pub fn add_delegate(&self, group: Arc<FunctionGroup>) {
        self.delegates.write().push(group);
    }

    /// All implementations, own first then delegates', in insertion order.
    pub fn candidates(&self) -> Vec<Object> {
        let mut out = self.impls.read().clone();
        for delegate in self.delegates.read().iter() {
            out.extend(delegate.candidates());
        }
        out
    }
}

pub fn callable_signature(obj: &Object) -> Option<Signature> {
    match obj {
        Object::Function(f) => Some(f.decl.sig.clone()),
        Object::Foreign(f) => Some(f.sig.clone()),
        _ => None,
    }
}

pub fn callable_params(obj: &Object) -> Option<Vec<Param>> {
    match obj {
        Object::Function(f) => Some(f.decl.params.clone()),
        Object::Foreign(f) => Some(f.params.clone()),
        _ => None,
    }
}

#[derive(Debug)]
pub struct StructSchema {
    pub name: RwLock<String>,
    pub fields: Vec<crate::ast::StructField>,
    pub env: Arc<Environment>,
}

/// Struct values have reference semantics: the field map is shared.
#[derive(Debug, Clone)]
pub struct StructValue {
    pub schema: Arc<StructSchema>,
    pub fields: Arc<RwLock<HashMap<String, Object>>>,
}

#[derive(Debug)]
pub struct Module {
    pub fqn: String,
    pub env: Arc<Environment>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub name: String,
    pub file: String,
    pub pos: Position,
    pub source_line: Option<String>,
}

/// A throwable runtime error: payload, stack captured at creation, and an
/// optional chained cause.
#[derive(Debug)]
pub struct RuntimeErr {
    pub payload: Object,
    pub stack: Vec<TraceFrame>,
    pub cause: Option<Arc<RuntimeErr>>,
}

impl RuntimeErr {
    pub fn new(payload: Object, stack: Vec<TraceFrame>) -> Arc<Self> {
        Arc::new(RuntimeErr {
            payload,
            stack,
            cause: None,
        })
    }

    pub fn with_cause(
        payload: Object,
        stack: Vec<TraceFrame>,
        cause: Option<Arc<RuntimeErr>>,
    ) -> Arc<Self> {
        Arc::new(RuntimeErr {
            payload,
            stack,
            cause,
        })
    }

    /// The conventional `type` key of a map payload, if present.
    pub fn error_type(&self) -> Option<String> {
        match &self.payload {
            Object::Map(m) => match m.get(&Object::Str("type".to_string())) {
                Some(Object::Str(s)) => Some(s),
                Some(Object::Symbol(s)) => Some(s.name()),
                _ => None,
            },
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tail calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum TailTarget {
    /// `recur`: re-enter the function currently on top of the call stack.
    Current,
    /// A direct tail call to a resolved callee.
    Value(Object),
}

#[derive(Debug, Clone)]
pub struct TailCall {
    pub target: TailTarget,
    pub args: Vec<Object>,
    pub named: Vec<(String, Object)>,
    pub pos: Position,
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Object {
    Nil,
    Bool(bool),
    Number(Number),
    Str(String),
    Bytes(Vec<u8>),
    Symbol(Symbol),
    List(Vec<Object>),
    Map(MapObj),
    Schema(Arc<StructSchema>),
    Struct(StructValue),
    Function(Arc<Function>),
    Group(Arc<FunctionGroup>),
    Foreign(Arc<ForeignFn>),
    Module(Arc<Module>),
    Channel(Arc<Channel>),
    Task(Arc<TaskState>),
    /// Subscript range sentinel produced by `a[i:j]`.
    Slice {
        start: Option<i64>,
        end: Option<i64>,
    },
    /// Evaluator-internal: consumed by the function application loop.
    TailCall(Box<TailCall>),
    /// Evaluator-internal: propagates out of blocks to the function boundary.
    Return(Box<Object>),
    /// A thrown (or promoted) runtime error.
    Failure(Arc<RuntimeErr>),
    /// An internal evaluator fault.
    Error(EvalFault),
    /// Live cross-module binding indirection; never observable directly.
    BindingRef {
        env: Arc<Environment>,
        name: String,
    },
    /// Two-phase module load sentinel.
    Uninitialized,
    /// Channel empty-marker returned by `recv` on a drained closed channel.
    Closed,
}

impl Object {
    pub fn type_tag(&self) -> Option<TypeTag> {
        Some(match self {
            Object::Nil => TypeTag::Nil,
            Object::Bool(_) => TypeTag::Bool,
            Object::Number(_) => TypeTag::Num,
            Object::Str(_) => TypeTag::Str,
            Object::Bytes(_) => TypeTag::Bytes,
            Object::Symbol(_) => TypeTag::Sym,
            Object::List(_) => TypeTag::List,
            Object::Map(_) => TypeTag::Map,
            Object::Schema(_) => TypeTag::Schema,
            Object::Struct(_) => TypeTag::Struct,
            Object::Function(_) | Object::Group(_) | Object::Foreign(_) => TypeTag::Fun,
            Object::Module(_) => TypeTag::Module,
            Object::Channel(_) => TypeTag::Chan,
            Object::Task(_) => TypeTag::Task,
            Object::Slice { .. } => TypeTag::Slice,
            Object::Closed => TypeTag::Closed,
            _ => return None,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Nil => "nil",
            Object::Bool(_) => "bool",
            Object::Number(_) => "number",
            Object::Str(_) => "string",
            Object::Bytes(_) => "bytes",
            Object::Symbol(_) => "symbol",
            Object::List(_) => "list",
            Object::Map(_) => "map",
            Object::Schema(_) => "struct-schema",
            Object::Struct(_) => "struct",
            Object::Function(_) => "function",
            Object::Group(_) => "function-group",
            Object::Foreign(_) => "foreign",
            Object::Module(_) => "module",
            Object::Channel(_) => "channel",
            Object::Task(_) => "task",
            Object::Slice { .. } => "slice",
            Object::TailCall(_) => "tail-call",
            Object::Return(_) => "return-value",
            Object::Failure(_) => "runtime-error",
            Object::Error(_) => "error",
            Object::BindingRef { .. } => "binding-ref",
            Object::Uninitialized => "uninitialized",
            Object::Closed => "closed",
        }
    }

    /// Deterministic `(type-tag, hash)` key for hashable values.
    pub fn hash_key(&self) -> Option<HashKey> {
        let key = match self {
            Object::Nil => HashKey {
                tag: TypeTag::Nil,
                hash: 0,
            },
            Object::Bool(b) => HashKey {
                tag: TypeTag::Bool,
                hash: *b as u64,
            },
            Object::Number(n) => HashKey {
                tag: TypeTag::Num,
                hash: n.integral_hash(),
            },
            Object::Str(s) => HashKey {
                tag: TypeTag::Str,
                hash: hash_of(s),
            },
            Object::Bytes(b) => HashKey {
                tag: TypeTag::Bytes,
                hash: hash_of(b),
            },
            Object::Symbol(s) => HashKey {
                tag: TypeTag::Sym,
                hash: s.id() as u64,
            },
            _ => return None,
        };
        Some(key)
    }

    /// `false` and `nil` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Object::Bool(false) | Object::Nil)
    }

    /// An abrupt result stops ordinary statement sequencing.
    pub fn is_abrupt(&self) -> bool {
        matches!(
            self,
            Object::Return(_) | Object::TailCall(_) | Object::Failure(_) | Object::Error(_)
        )
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Object::Function(_) | Object::Group(_) | Object::Foreign(_)
        )
    }

    /// Whether the argument type satisfies a parameter type tag. `nil`
    /// matches any tag.
    pub fn matches_tag(&self, tag: &str) -> bool {
        if matches!(self, Object::Nil) {
            return true;
        }
        match tag {
            "num" => matches!(self, Object::Number(_)),
            "str" => matches!(self, Object::Str(_)),
            "bool" => matches!(self, Object::Bool(_)),
            "list" => matches!(self, Object::List(_)),
            "map" => matches!(self, Object::Map(_)),
            "bytes" => matches!(self, Object::Bytes(_)),
            "sym" => matches!(self, Object::Symbol(_)),
            "fun" => self.is_callable(),
            "task" => matches!(self, Object::Task(_)),
            "chan" => matches!(self, Object::Channel(_)),
            _ => true,
        }
    }

    /// Structural equality for data, identity for functions and handles.
    pub fn object_eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::Nil, Object::Nil) => true,
            (Object::Closed, Object::Closed) => true,
            (Object::Bool(a), Object::Bool(b)) => a == b,
            (Object::Number(a), Object::Number(b)) => a.eq(b),
            (Object::Str(a), Object::Str(b)) => a == b,
            (Object::Bytes(a), Object::Bytes(b)) => a == b,
            (Object::Symbol(a), Object::Symbol(b)) => a == b,
            (Object::List(a), Object::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.object_eq(y))
            }
            (Object::Map(a), Object::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.get(k).map(|other| v.object_eq(&other)).unwrap_or(false)
                    })
            }
            (Object::Struct(a), Object::Struct(b)) => {
                Arc::ptr_eq(&a.schema, &b.schema) && {
                    let fa = a.fields.read();
                    let fb = b.fields.read();
                    fa.len() == fb.len()
                        && fa.iter().all(|(k, v)| {
                            fb.get(k).map(|other| v.object_eq(other)).unwrap_or(false)
                        })
                }
            }
            (Object::Schema(a), Object::Schema(b)) => Arc::ptr_eq(a, b),
            (Object::Function(a), Object::Function(b)) => Arc::ptr_eq(a, b),
            (Object::Group(a), Object::Group(b)) => Arc::ptr_eq(a, b),
            (Object::Foreign(a), Object::Foreign(b)) => Arc::ptr_eq(a, b),
            (Object::Module(a), Object::Module(b)) => Arc::ptr_eq(a, b),
            (Object::Channel(a), Object::Channel(b)) => Arc::ptr_eq(a, b),
            (Object::Task(a), Object::Task(b)) => Arc::ptr_eq(a, b),
            (Object::Failure(a), Object::Failure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Quoted, container-style rendering.
    pub fn inspect(&self) -> String {
        match self {
            Object::Str(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Nil => write!(f, "nil"),
            Object::Bool(b) => write!(f, "{}", b),
            Object::Number(n) => write!(f, "{}", n),
            Object::Str(s) => write!(f, "{}", s),
            Object::Bytes(data) => {
                write!(f, "0x\"")?;
                for b in data {
                    write!(f, "{:02X}", b)?;
                }
                write!(f, "\"")
            }
            Object::Symbol(s) => write!(f, "{}", s),
            Object::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.inspect())?;
                }
                write!(f, "]")
            }
            Object::Map(map) => {
                // sorted for stable display
                let mut entries: Vec<_> = map
                    .iter()
                    .map(|(k, v)| (k.inspect(), v.inspect()))
                    .collect();
                entries.sort();
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Object::Schema(s) => write!(f, "<struct {}>", s.name.read()),
            Object::Struct(s) => {
                write!(f, "{}{{", s.schema.name.read())?;
                let fields = s.fields.read();
                let mut entries: Vec<_> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.inspect()))
                    .collect();
                entries.sort();
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Object::Function(func) => write!(f, "<fn {}>", func.display_name()),
            Object::Group(g) => write!(f, "<fn {}>", g.name.read()),
            Object::Foreign(ff) => write!(f, "<foreign {}>", ff.fqn),
            Object::Module(m) => write!(f, "<module {}>", m.fqn),
            Object::Channel(c) => write!(f, "<channel {}>", c.id),
            Object::Task(t) => write!(f, "<task {}>", t.id),
            Object::Slice { start, end } => {
                write!(
                    f,
                    "<slice {}:{}>",
                    start.map(|s| s.to_string()).unwrap_or_default(),
                    end.map(|e| e.to_string()).unwrap_or_default()
                )
            }
            Object::TailCall(_) => write!(f, "<tail-call>"),
            Object::Return(v) => write!(f, "<return {}>", v),
            Object::Failure(e) => write!(f, "<error {}>", e.payload.inspect()),
            Object::Error(e) => write!(f, "<error {}>", e),
            Object::BindingRef { name, .. } => write!(f, "<ref {}>", name),
            Object::Uninitialized => write!(f, "<uninitialized>"),
            Object::Closed => write!(f, "<closed>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Bind positional and named arguments to parameter slots without
/// evaluating defaults: named args go to their parameter by name, remaining
/// slots fill left to right, trailing positionals collect into the variadic
/// slot. Unfilled optional slots stay `None`.
pub fn bind_slots(
    params: &[Param],
    args: &[Object],
    named: &[(String, Object)],
) -> Result<Vec<Option<Object>>, EvalFault> {
    let mut slots: Vec<Option<Object>> = vec![None; params.len()];
    for (name, value) in named {
        let idx = params
            .iter()
            .position(|p| &p.name == name)
            .ok_or_else(|| EvalFault::UnknownParam(name.clone()))?;
        if params[idx].variadic {
            return Err(EvalFault::UnknownParam(name.clone()));
        }
        if slots[idx].is_some() {
            return Err(EvalFault::DuplicateArg(name.clone()));
        }
        slots[idx] = Some(value.clone());
    }
    let mut positional = args.iter();
    for (idx, param) in params.iter().enumerate() {
        if param.variadic {
            let rest: Vec<Object> = positional.by_ref().cloned().collect();
            slots[idx] = Some(Object::List(rest));
            break;
        }
        if slots[idx].is_some() {
            continue;
        }
        if let Some(value) = positional.next() {
            slots[idx] = Some(value.clone());
        }
    }
    if positional.next().is_some() {
        let max = params.len();
        return Err(EvalFault::Arity {
            expected: format!("at most {}", max),
            actual: args.len() + named.len(),
        });
    }
    for (idx, param) in params.iter().enumerate() {
        if slots[idx].is_none() && param.default.is_none() && !param.variadic {
            return Err(EvalFault::Arity {
                expected: format!("at least {}", Signature::of_params(params).min),
                actual: args.len() + named.len(),
            });
        }
    }
    Ok(slots)
}

/// Enforce parameter type tags on a bound call; used when a function or
/// foreign function is applied directly rather than through a group.
pub fn verify_tags(
    params: &[Param],
    slots: &[Option<Object>],
    args: &[Object],
    named: &[(String, Object)],
) -> Result<(), EvalFault> {
    if tag_score(params, slots).is_none() {
        let types: Vec<&str> = args
            .iter()
            .map(|a| a.type_name())
            .chain(named.iter().map(|(_, v)| v.type_name()))
            .collect();
        return Err(EvalFault::DispatchFailed(types.join(", ")));
    }
    Ok(())
}

/// Tag score of a tentative binding: one point per satisfied type tag
/// (`nil` matches any tag); a mismatched tag disqualifies the candidate.
fn tag_score(params: &[Param], slots: &[Option<Object>]) -> Option<i32> {
    let mut score = 0;
    for (param, slot) in params.iter().zip(slots) {
        let Some(tag) = &param.tag else { continue };
        let Some(value) = slot else { continue };
        if param.variadic {
            continue;
        }
        if value.matches_tag(tag) {
            score += 1;
        } else {
            return None;
        }
    }
    Some(score)
}

/// Select the best candidate for the given arguments. Preference order:
/// smallest `max`, then highest tag-score, then non-variadic, then first in
/// declaration order.
pub fn dispatch(
    candidates: &[Object],
    args: &[Object],
    named: &[(String, Object)],
) -> Result<Object, EvalFault> {
    let arity = args.len() + named.len();
    let mut best: Option<(usize, i32, bool, usize)> = None; // (max, -score, variadic, index)
    let mut chosen: Option<Object> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let Some(sig) = callable_signature(candidate) else {
            continue;
        };
        if !sig.accepts(arity) {
            continue;
        }
        let Some(params) = callable_params(candidate) else {
            continue;
        };
        let Ok(slots) = bind_slots(&params, args, named) else {
            continue;
        };
        let Some(score) = tag_score(&params, &slots) else {
            continue;
        };
        let rank = (sig.max.unwrap_or(usize::MAX), -score, sig.variadic, index);
        if best.map(|b| rank < b).unwrap_or(true) {
            best = Some(rank);
            chosen = Some(candidate.clone());
        }
    }
    chosen.ok_or_else(|| {
        let types: Vec<&str> = args
            .iter()
            .map(|a| a.type_name())
            .chain(named.iter().map(|(_, v)| v.type_name()))
            .collect();
        EvalFault::DispatchFailed(types.join(", "))
    })
}
