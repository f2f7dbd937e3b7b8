// ABOUTME: AST node kinds for Slug statements, expressions, and patterns

use crate::number::Number;
use crate::token::Position;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

/// An `@name` or `@name(args…)` annotation on a binding, parameter, or
/// foreign declaration.
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub args: Vec<Expr>,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum DeferKind {
    Always,
    OnSuccess,
    OnError(String),
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Val {
        pattern: Pattern,
        value: Expr,
        tags: Vec<Tag>,
        pos: Position,
    },
    Var {
        pattern: Pattern,
        value: Expr,
        tags: Vec<Tag>,
        pos: Position,
    },
    Return {
        value: Option<Expr>,
        pos: Position,
    },
    Throw {
        value: Expr,
        pos: Position,
    },
    Defer {
        kind: DeferKind,
        body: Arc<Block>,
        pos: Position,
    },
    Import {
        segments: Vec<String>,
        tags: Vec<Tag>,
        pos: Position,
    },
    ForeignDecl {
        name: String,
        params: Vec<Param>,
        sig: Signature,
        tags: Vec<Tag>,
        pos: Position,
    },
    Expr {
        expr: Expr,
        pos: Position,
    },
}

impl Stmt {
    pub fn pos(&self) -> Position {
        match self {
            Stmt::Val { pos, .. }
            | Stmt::Var { pos, .. }
            | Stmt::Return { pos, .. }
            | Stmt::Throw { pos, .. }
            | Stmt::Defer { pos, .. }
            | Stmt::Import { pos, .. }
            | Stmt::ForeignDecl { pos, .. }
            | Stmt::Expr { pos, .. } => *pos,
        }
    }
}

/// A `{ … }` statement sequence. `nursery` marks structured-concurrency
/// scopes; function bodies reuse this node.
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub nursery: Option<NurserySpec>,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct NurserySpec {
    pub limit: Option<Box<Expr>>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub tag: Option<String>,
    pub default: Option<Expr>,
    pub variadic: bool,
    pub pos: Position,
}

/// Computed at parse time: required-arity window and parameter tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub min: usize,
    pub max: Option<usize>,
    pub variadic: bool,
    pub tags: String,
}

impl Signature {
    pub fn of_params(params: &[Param]) -> Signature {
        let variadic = params.iter().any(|p| p.variadic);
        let min = params
            .iter()
            .filter(|p| !p.variadic && p.default.is_none())
            .count();
        let max = if variadic { None } else { Some(params.len()) };
        let tags = params
            .iter()
            .map(|p| p.tag.as_deref().unwrap_or("_"))
            .collect::<Vec<_>>()
            .join(",");
        Signature {
            min,
            max,
            variadic,
            tags,
        }
    }

    /// Stable key used to merge redefinitions inside a function group.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.min,
            self.max.map(|m| m.to_string()).unwrap_or_else(|| "*".into()),
            self.tags
        )
    }

    pub fn accepts(&self, arity: usize) -> bool {
        arity >= self.min && self.max.map(|m| arity <= m).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct FnDecl {
    pub params: Vec<Param>,
    pub body: Arc<Block>,
    pub sig: Signature,
    /// True when the function body contains a `defer`; disables tail marks.
    pub has_defer: bool,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum StrPiece {
    Lit(String),
    Interp(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum CallArg {
    Positional(Expr),
    Named(String, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone)]
pub enum ListItem {
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapKey {
    Str(String),
    Num(Number),
    Symbol(String),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub enum MapEntry {
    Pair(MapKey, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub tag: Option<String>,
    pub default: Option<Expr>,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub patterns: Vec<Pattern>,
    pub guard: Option<Expr>,
    pub body: Expr,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum SelectOp {
    Recv(Expr),
    Send(Expr, Expr),
    After(Expr),
    AwaitTask(Expr),
    Default,
}

#[derive(Debug, Clone)]
pub struct SelectArm {
    pub op: SelectOp,
    pub handler: Option<Expr>,
    pub pos: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Prepend,
    Append,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Nil {
        pos: Position,
    },
    Bool {
        value: bool,
        pos: Position,
    },
    Num {
        value: Number,
        pos: Position,
    },
    Str {
        pieces: Vec<StrPiece>,
        pos: Position,
    },
    Bytes {
        data: Vec<u8>,
        pos: Position,
    },
    Symbol {
        name: String,
        pos: Position,
    },
    Ident {
        name: String,
        pos: Position,
    },
    List {
        items: Vec<ListItem>,
        pos: Position,
    },
    Map {
        entries: Vec<MapEntry>,
        pos: Position,
    },
    Fn {
        decl: Arc<FnDecl>,
        pos: Position,
    },
    StructDef {
        fields: Vec<StructField>,
        pos: Position,
    },
    StructInit {
        target: Box<Expr>,
        fields: Vec<(String, Expr)>,
        pos: Position,
    },
    Prefix {
        op: PrefixOp,
        operand: Box<Expr>,
        pos: Position,
    },
    Infix {
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
        pos: Position,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        pos: Position,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
        pos: Position,
    },
    SliceArg {
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
        pos: Position,
    },
    Dot {
        target: Box<Expr>,
        name: String,
        pos: Position,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<CallArg>,
        tail: bool,
        pos: Position,
    },
    Pipe {
        left: Box<Expr>,
        right: Box<Expr>,
        pos: Position,
    },
    Match {
        subject: Box<Expr>,
        arms: Vec<MatchArm>,
        pos: Position,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        alt: Option<Box<Expr>>,
        pos: Position,
    },
    Block(Block),
    Spawn {
        body: Arc<Expr>,
        pos: Position,
    },
    Await {
        target: Box<Expr>,
        timeout: Option<Box<Expr>>,
        pos: Position,
    },
    Select {
        arms: Vec<SelectArm>,
        pos: Position,
    },
    Recur {
        args: Vec<CallArg>,
        tail: bool,
        pos: Position,
    },
}

impl Expr {
    pub fn pos(&self) -> Position {
        match self {
            Expr::Nil { pos }
            | Expr::Bool { pos, .. }
            | Expr::Num { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::Bytes { pos, .. }
            | Expr::Symbol { pos, .. }
            | Expr::Ident { pos, .. }
            | Expr::List { pos, .. }
            | Expr::Map { pos, .. }
            | Expr::Fn { pos, .. }
            | Expr::StructDef { pos, .. }
            | Expr::StructInit { pos, .. }
            | Expr::Prefix { pos, .. }
            | Expr::Infix { pos, .. }
            | Expr::Assign { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::SliceArg { pos, .. }
            | Expr::Dot { pos, .. }
            | Expr::Call { pos, .. }
            | Expr::Pipe { pos, .. }
            | Expr::Match { pos, .. }
            | Expr::If { pos, .. }
            | Expr::Spawn { pos, .. }
            | Expr::Await { pos, .. }
            | Expr::Select { pos, .. }
            | Expr::Recur { pos, .. } => *pos,
            Expr::Block(b) => b.pos,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Wildcard {
        pos: Position,
    },
    Literal {
        value: Expr,
        pos: Position,
    },
    Ident {
        name: String,
        pos: Position,
    },
    Pinned {
        name: String,
        pos: Position,
    },
    Spread {
        name: Option<String>,
        pos: Position,
    },
    List {
        items: Vec<Pattern>,
        pos: Position,
    },
    Map {
        entries: Vec<(MapKey, Pattern)>,
        rest: Option<Option<String>>,
        select_all: bool,
        pos: Position,
    },
    Struct {
        name: String,
        fields: Vec<(String, Pattern)>,
        pos: Position,
    },
    Binding {
        name: String,
        inner: Box<Pattern>,
        pos: Position,
    },
}

impl Pattern {
    pub fn pos(&self) -> Position {
        match self {
            Pattern::Wildcard { pos }
            | Pattern::Literal { pos, .. }
            | Pattern::Ident { pos, .. }
            | Pattern::Pinned { pos, .. }
            | Pattern::Spread { pos, .. }
            | Pattern::List { pos, .. }
            | Pattern::Map { pos, .. }
            | Pattern::Struct { pos, .. }
            | Pattern::Binding { pos, .. } => *pos,
        }
    }

    /// Whether matching this pattern introduces bindings. Alternatives in a
    /// multi-pattern match arm must be non-binding.
    pub fn binds(&self) -> bool {
        match self {
            Pattern::Wildcard { .. } | Pattern::Literal { .. } | Pattern::Pinned { .. } => false,
            Pattern::Ident { .. } | Pattern::Binding { .. } => true,
            Pattern::Spread { name, .. } => name.is_some(),
            Pattern::List { items, .. } => items.iter().any(Pattern::binds),
            Pattern::Map {
                entries,
                rest,
                select_all,
                ..
            } => {
                *select_all
                    || matches!(rest, Some(Some(_)))
                    || entries.iter().any(|(_, p)| p.binds())
            }
            Pattern::Struct { fields, .. } => fields.iter().any(|(_, p)| p.binds()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering. `render` produces canonical source that reparses to the same
// structure; infix and prefix forms are always parenthesized.
// ---------------------------------------------------------------------------

impl fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrefixOp::Neg => "-",
            PrefixOp::Not => "!",
            PrefixOp::BitNot => "~",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Rem => "%",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
            InfixOp::LtEq => "<=",
            InfixOp::GtEq => ">=",
            InfixOp::And => "&&",
            InfixOp::Or => "||",
            InfixOp::BitAnd => "&",
            InfixOp::BitOr => "|",
            InfixOp::BitXor => "^",
            InfixOp::Shl => "<<",
            InfixOp::Shr => ">>",
            InfixOp::Prepend => "+:",
            InfixOp::Append => ":+",
        };
        write!(f, "{}", s)
    }
}

fn escape_str(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '{' => out.push_str("\\{"),
            other => out.push(other),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Str(s) => {
                let mut buf = String::new();
                escape_str(s, &mut buf);
                write!(f, "\"{}\"", buf)
            }
            MapKey::Num(n) => write!(f, "{}", n),
            MapKey::Symbol(s) => write!(f, ":{}", s),
            MapKey::Bool(b) => write!(f, "{}", b),
        }
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

impl fmt::Display for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallArg::Positional(e) => write!(f, "{}", e),
            CallArg::Named(name, e) => write!(f, "{} = {}", name, e),
            CallArg::Spread(e) => write!(f, "...{}", e),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tag) = &self.tag {
            write!(f, "@{} ", tag)?;
        }
        if self.variadic {
            write!(f, "...")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(default) = &self.default {
            write!(f, " = {}", default)?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Nil { .. } => write!(f, "nil"),
            Expr::Bool { value, .. } => write!(f, "{}", value),
            Expr::Num { value, .. } => write!(f, "{}", value),
            Expr::Str { pieces, .. } => {
                write!(f, "\"")?;
                for piece in pieces {
                    match piece {
                        StrPiece::Lit(s) => {
                            let mut buf = String::new();
                            escape_str(s, &mut buf);
                            write!(f, "{}", buf)?;
                        }
                        StrPiece::Interp(e) => write!(f, "{{{{{}}}}}", e)?,
                    }
                }
                write!(f, "\"")
            }
            Expr::Bytes { data, .. } => {
                write!(f, "0x\"")?;
                for b in data {
                    write!(f, "{:02X}", b)?;
                }
                write!(f, "\"")
            }
            Expr::Symbol { name, .. } => write!(f, ":{}", name),
            Expr::Ident { name, .. } => write!(f, "{}", name),
            Expr::List { items, .. } => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        ListItem::Item(e) => e.to_string(),
                        ListItem::Spread(e) => format!("...{}", e),
                    })
                    .collect();
                write!(f, "[{}]", rendered.join(", "))
            }
            Expr::Map { entries, .. } => {
                let rendered: Vec<String> = entries
                    .iter()
                    .map(|entry| match entry {
                        MapEntry::Pair(k, v) => format!("{}: {}", k, v),
                        MapEntry::Spread(e) => format!("...{}", e),
                    })
                    .collect();
                write!(f, "{{{}}}", rendered.join(", "))
            }
            Expr::Fn { decl, .. } => {
                write!(f, "fn({}) {}", join(&decl.params, ", "), decl.body)
            }
            Expr::StructDef { fields, .. } => {
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|field| {
                        let mut s = String::new();
                        if let Some(tag) = &field.tag {
                            s.push('@');
                            s.push_str(tag);
                            s.push(' ');
                        }
                        s.push_str(&field.name);
                        if let Some(default) = &field.default {
                            s.push_str(&format!(" = {}", default));
                        }
                        s
                    })
                    .collect();
                write!(f, "struct {{{}}}", rendered.join(", "))
            }
            Expr::StructInit { target, fields, .. } => {
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|(name, value)| format!("{}: {}", name, value))
                    .collect();
                write!(f, "{}{{{}}}", target, rendered.join(", "))
            }
            Expr::Prefix { op, operand, .. } => write!(f, "({}{})", op, operand),
            Expr::Infix {
                op, left, right, ..
            } => write!(f, "({} {} {})", left, op, right),
            Expr::Assign { target, value, .. } => write!(f, "({} = {})", target, value),
            Expr::Index { target, index, .. } => write!(f, "{}[{}]", target, index),
            Expr::SliceArg { start, end, .. } => {
                if let Some(s) = start {
                    write!(f, "{}", s)?;
                }
                write!(f, ":")?;
                if let Some(e) = end {
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
            Expr::Dot { target, name, .. } => write!(f, "{}.{}", target, name),
            Expr::Call { callee, args, .. } => {
                write!(f, "{}({})", callee, join(args, ", "))
            }
            Expr::Pipe { left, right, .. } => write!(f, "({} /> {})", left, right),
            Expr::Match { subject, arms, .. } => {
                write!(f, "match ({}) {{ ", subject)?;
                for arm in arms {
                    write!(f, "{}", join(&arm.patterns, ", "))?;
                    if let Some(guard) = &arm.guard {
                        write!(f, " if {}", guard)?;
                    }
                    write!(f, " => {}; ", arm.body)?;
                }
                write!(f, "}}")
            }
            Expr::If {
                cond, then, alt, ..
            } => {
                write!(f, "if ({}) {}", cond, then)?;
                if let Some(alt) = alt {
                    write!(f, " else {}", alt)?;
                }
                Ok(())
            }
            Expr::Block(block) => write!(f, "{}", block),
            Expr::Spawn { body, .. } => write!(f, "spawn {}", body),
            Expr::Await {
                target, timeout, ..
            } => {
                write!(f, "await {}", target)?;
                if let Some(t) = timeout {
                    write!(f, ", timeout = {}", t)?;
                }
                Ok(())
            }
            Expr::Select { arms, .. } => {
                write!(f, "select {{ ")?;
                for arm in arms {
                    match &arm.op {
                        SelectOp::Recv(c) => write!(f, "recv {}", c)?,
                        SelectOp::Send(c, v) => write!(f, "send {}, {}", c, v)?,
                        SelectOp::After(ms) => write!(f, "after {}", ms)?,
                        SelectOp::AwaitTask(t) => write!(f, "await {}", t)?,
                        SelectOp::Default => write!(f, "_")?,
                    }
                    if let Some(handler) = &arm.handler {
                        write!(f, " /> {}", handler)?;
                    }
                    write!(f, "; ")?;
                }
                write!(f, "}}")
            }
            Expr::Recur { args, .. } => write!(f, "recur({})", join(args, ", ")),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(nursery) = &self.nursery {
            write!(f, "nursery ")?;
            if let Some(limit) = &nursery.limit {
                write!(f, "limit {} ", limit)?;
            }
        }
        write!(f, "{{ ")?;
        for stmt in &self.stmts {
            write!(f, "{}; ", stmt)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Wildcard { .. } => write!(f, "_"),
            Pattern::Literal { value, .. } => write!(f, "{}", value),
            Pattern::Ident { name, .. } => write!(f, "{}", name),
            Pattern::Pinned { name, .. } => write!(f, "^{}", name),
            Pattern::Spread { name, .. } => match name {
                Some(n) => write!(f, "...{}", n),
                None => write!(f, "..."),
            },
            Pattern::List { items, .. } => write!(f, "[{}]", join(items, ", ")),
            Pattern::Map {
                entries,
                rest,
                select_all,
                ..
            } => {
                let mut parts: Vec<String> = Vec::new();
                if *select_all {
                    parts.push("*".to_string());
                }
                for (key, pattern) in entries {
                    parts.push(format!("{}: {}", key, pattern));
                }
                match rest {
                    Some(Some(n)) => parts.push(format!("...{}", n)),
                    Some(None) => parts.push("...".to_string()),
                    None => {}
                }
                write!(f, "{{{}}}", parts.join(", "))
            }
            Pattern::Struct { name, fields, .. } => {
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|(name, pattern)| format!("{}: {}", name, pattern))
                    .collect();
                write!(f, "{}{{{}}}", name, rendered.join(", "))
            }
            Pattern::Binding { name, inner, .. } => write!(f, "{} @ {}", name, inner),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, "({})", join(&self.args, ", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Val {
                pattern,
                value,
                tags,
                ..
            } => {
                for tag in tags {
                    write!(f, "{} ", tag)?;
                }
                write!(f, "val {} = {}", pattern, value)
            }
            Stmt::Var {
                pattern,
                value,
                tags,
                ..
            } => {
                for tag in tags {
                    write!(f, "{} ", tag)?;
                }
                write!(f, "var {} = {}", pattern, value)
            }
            Stmt::Return { value, .. } => match value {
                Some(v) => write!(f, "return {}", v),
                None => write!(f, "return"),
            },
            Stmt::Throw { value, .. } => write!(f, "throw {}", value),
            Stmt::Defer { kind, body, .. } => match kind {
                DeferKind::Always => write!(f, "defer {}", body),
                DeferKind::OnSuccess => write!(f, "defer onsuccess {}", body),
                DeferKind::OnError(name) => write!(f, "defer onerror({}) {}", name, body),
            },
            Stmt::Import { segments, tags, .. } => {
                for tag in tags {
                    write!(f, "{} ", tag)?;
                }
                write!(f, "import {}", segments.join("."))
            }
            Stmt::ForeignDecl { name, params, .. } => {
                write!(f, "foreign {} = fn({})", name, join(params, ", "))
            }
            Stmt::Expr { expr, .. } => write!(f, "{}", expr),
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.stmts {
            writeln!(f, "{}", stmt)?;
        }
        Ok(())
    }
}
