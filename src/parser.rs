// ABOUTME: Pratt-style parser producing the Slug AST from a token stream

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::Lexer;
use crate::number::Number;
use crate::token::{Position, Token, TokenKind};
use std::sync::Arc;

/// Operator precedence, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Lowest,
    Assign,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Additive,
    Multiplicative,
    Concat,
    Prefix,
    PipeCall,
    Call,
    Index,
}

fn infix_prec(kind: &TokenKind) -> Option<Prec> {
    Some(match kind {
        TokenKind::Assign => Prec::Assign,
        TokenKind::OrOr => Prec::Or,
        TokenKind::AndAnd => Prec::And,
        TokenKind::Eq | TokenKind::NotEq => Prec::Equality,
        TokenKind::Lt | TokenKind::Gt | TokenKind::LtEq | TokenKind::GtEq => Prec::Comparison,
        TokenKind::Pipe => Prec::BitOr,
        TokenKind::Caret => Prec::BitXor,
        TokenKind::Amp => Prec::BitAnd,
        TokenKind::Shl | TokenKind::Shr => Prec::Shift,
        TokenKind::Plus | TokenKind::Minus => Prec::Additive,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Multiplicative,
        TokenKind::PrependOp | TokenKind::AppendOp => Prec::Concat,
        TokenKind::PipeCall => Prec::PipeCall,
        TokenKind::LParen | TokenKind::LBrace | TokenKind::Dot => Prec::Call,
        TokenKind::LBracket => Prec::Index,
        _ => return None,
    })
}

fn infix_op(kind: &TokenKind) -> Option<InfixOp> {
    Some(match kind {
        TokenKind::Plus => InfixOp::Add,
        TokenKind::Minus => InfixOp::Sub,
        TokenKind::Star => InfixOp::Mul,
        TokenKind::Slash => InfixOp::Div,
        TokenKind::Percent => InfixOp::Rem,
        TokenKind::Eq => InfixOp::Eq,
        TokenKind::NotEq => InfixOp::NotEq,
        TokenKind::Lt => InfixOp::Lt,
        TokenKind::Gt => InfixOp::Gt,
        TokenKind::LtEq => InfixOp::LtEq,
        TokenKind::GtEq => InfixOp::GtEq,
        TokenKind::AndAnd => InfixOp::And,
        TokenKind::OrOr => InfixOp::Or,
        TokenKind::Amp => InfixOp::BitAnd,
        TokenKind::Pipe => InfixOp::BitOr,
        TokenKind::Caret => InfixOp::BitXor,
        TokenKind::Shl => InfixOp::Shl,
        TokenKind::Shr => InfixOp::Shr,
        TokenKind::PrependOp => InfixOp::Prepend,
        TokenKind::AppendOp => InfixOp::Append,
        _ => return None,
    })
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    fn_depth: usize,
}

/// Parse a complete source text into a program.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    Parser::new(source).parse_program()
}

/// Parse a parameter list such as `@str path, ...rest`, used when foreign
/// functions register their default signatures.
pub fn parse_param_list(params: &str) -> Result<(Vec<Param>, Signature), ParseError> {
    let source = format!("val f = fn({}) {{}}", params);
    let program = parse(&source)?;
    match program.stmts.first() {
        Some(Stmt::Val {
            value: Expr::Fn { decl, .. },
            ..
        }) => Ok((decl.params.clone(), decl.sig.clone())),
        _ => Err(ParseError {
            message: "bad parameter list".to_string(),
            pos: Position::default(),
        }),
    }
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let tokens = Lexer::tokenize(source)
            .into_iter()
            .filter(|t| !matches!(t.kind, TokenKind::DocComment(_)))
            .collect();
        Parser {
            tokens,
            pos: 0,
            fn_depth: 0,
        }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn here(&self) -> Position {
        self.current().pos
    }

    fn peek_kind(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, ParseError> {
        if self.kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}, found {:?}", what, self.kind())))
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            pos: self.here(),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.kind(), TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn ident_text(&self) -> Option<&str> {
        match self.kind() {
            TokenKind::Ident(name) => Some(name.as_str()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Program and statements
    // ------------------------------------------------------------------

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if matches!(self.kind(), TokenKind::Eof) {
                break;
            }
            let stmt = self.parse_stmt()?;
            self.expect_stmt_end()?;
            validate_struct_placement(&stmt)?;
            stmts.push(stmt);
        }
        Ok(Program { stmts })
    }

    fn expect_stmt_end(&mut self) -> Result<(), ParseError> {
        match self.kind() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::RBrace | TokenKind::Eof => Ok(()),
            other => Err(self.error(format!("unexpected {:?} after statement", other))),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        if let TokenKind::Illegal(msg) = self.kind() {
            return Err(self.error(msg.clone()));
        }
        let tags = self.parse_tags()?;
        let pos = self.here();
        match self.kind() {
            TokenKind::Val => {
                self.advance();
                let (pattern, value) = self.parse_binding()?;
                Ok(Stmt::Val {
                    pattern,
                    value,
                    tags,
                    pos,
                })
            }
            TokenKind::Var => {
                self.advance();
                let (pattern, value) = self.parse_binding()?;
                Ok(Stmt::Var {
                    pattern,
                    value,
                    tags,
                    pos,
                })
            }
            TokenKind::Return => {
                self.advance();
                let value = if matches!(
                    self.kind(),
                    TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expr(Prec::Lowest)?)
                };
                Ok(Stmt::Return { value, pos })
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.parse_expr(Prec::Lowest)?;
                Ok(Stmt::Throw { value, pos })
            }
            TokenKind::Defer => {
                self.advance();
                let kind = match self.ident_text() {
                    Some("onsuccess") => {
                        self.advance();
                        DeferKind::OnSuccess
                    }
                    Some("onerror") => {
                        self.advance();
                        self.expect(&TokenKind::LParen, "'('")?;
                        let name = match self.advance().kind {
                            TokenKind::Ident(n) => n,
                            other => {
                                return Err(self
                                    .error(format!("expected binding name, found {:?}", other)));
                            }
                        };
                        self.expect(&TokenKind::RParen, "')'")?;
                        DeferKind::OnError(name)
                    }
                    _ => DeferKind::Always,
                };
                let body = if matches!(self.kind(), TokenKind::LBrace) {
                    self.parse_block()?
                } else {
                    let inner = self.parse_stmt()?;
                    Block {
                        pos: inner.pos(),
                        stmts: vec![inner],
                        nursery: None,
                    }
                };
                Ok(Stmt::Defer {
                    kind,
                    body: Arc::new(body),
                    pos,
                })
            }
            TokenKind::Import => {
                self.advance();
                let segments = self.parse_dotted_name()?;
                Ok(Stmt::Import {
                    segments,
                    tags,
                    pos,
                })
            }
            TokenKind::Foreign => {
                self.advance();
                let name = match self.advance().kind {
                    TokenKind::Ident(n) => n,
                    other => {
                        return Err(self.error(format!("expected foreign name, found {:?}", other)))
                    }
                };
                self.expect(&TokenKind::Assign, "'='")?;
                self.skip_newlines();
                self.expect(&TokenKind::Fn, "'fn'")?;
                let params = self.parse_params()?;
                let sig = Signature::of_params(&params);
                Ok(Stmt::ForeignDecl {
                    name,
                    params,
                    sig,
                    tags,
                    pos,
                })
            }
            _ => {
                if !tags.is_empty() {
                    return Err(self.error("tags are only allowed on declarations".to_string()));
                }
                let expr = self.parse_expr(Prec::Lowest)?;
                Ok(Stmt::Expr { expr, pos })
            }
        }
    }

    fn parse_tags(&mut self) -> Result<Vec<Tag>, ParseError> {
        let mut tags = Vec::new();
        while matches!(self.kind(), TokenKind::At) {
            let pos = self.here();
            self.advance();
            let name = match self.advance().kind {
                TokenKind::Ident(n) => n,
                other => return Err(self.error(format!("expected tag name, found {:?}", other))),
            };
            let mut args = Vec::new();
            if self.eat(&TokenKind::LParen) {
                self.skip_newlines();
                while !matches!(self.kind(), TokenKind::RParen) {
                    args.push(self.parse_expr(Prec::Lowest)?);
                    self.skip_newlines();
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
                self.expect(&TokenKind::RParen, "')'")?;
            }
            tags.push(Tag { name, args, pos });
            self.skip_newlines();
        }
        Ok(tags)
    }

    fn parse_binding(&mut self) -> Result<(Pattern, Expr), ParseError> {
        let pattern = self.parse_pattern()?;
        self.expect(&TokenKind::Assign, "'='")?;
        self.skip_newlines();
        let value = self.parse_expr(Prec::Lowest)?;
        Ok((pattern, value))
    }

    fn parse_dotted_name(&mut self) -> Result<Vec<String>, ParseError> {
        let mut segments = Vec::new();
        loop {
            match self.advance().kind {
                TokenKind::Ident(n) => segments.push(n),
                other => {
                    return Err(self.error(format!("expected module segment, found {:?}", other)))
                }
            }
            if !self.eat(&TokenKind::Dot) {
                break;
            }
        }
        Ok(segments)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self, min_prec: Prec) -> Result<Expr, ParseError> {
        let mut left = self.parse_prefix()?;
        loop {
            // Newline continuation: a newline ends the expression unless the
            // next meaningful token continues it. `(` and `[` never continue.
            if matches!(self.kind(), TokenKind::Newline) {
                let mut lookahead = self.pos;
                while lookahead < self.tokens.len() - 1
                    && matches!(self.tokens[lookahead].kind, TokenKind::Newline)
                {
                    lookahead += 1;
                }
                if self.tokens[lookahead].kind.continues_line() {
                    self.pos = lookahead;
                } else {
                    break;
                }
            }
            let Some(prec) = infix_prec(self.kind()) else {
                break;
            };
            if prec <= min_prec && !(prec == Prec::Assign && min_prec == Prec::Lowest) {
                break;
            }
            left = self.parse_infix(left)?;
        }
        Ok(left)
    }

    fn parse_infix(&mut self, left: Expr) -> Result<Expr, ParseError> {
        let pos = self.here();
        match self.kind().clone() {
            TokenKind::Assign => {
                self.advance();
                self.skip_newlines();
                match left {
                    Expr::Ident { .. } | Expr::Dot { .. } | Expr::Index { .. } => {}
                    _ => return Err(self.error("invalid assignment target".to_string())),
                }
                let value = self.parse_expr(Prec::Lowest)?;
                Ok(Expr::Assign {
                    target: Box::new(left),
                    value: Box::new(value),
                    pos,
                })
            }
            TokenKind::PipeCall => {
                self.advance();
                self.skip_newlines();
                let right = self.parse_expr(Prec::PipeCall)?;
                Ok(Expr::Pipe {
                    left: Box::new(left),
                    right: Box::new(right),
                    pos,
                })
            }
            TokenKind::LParen => {
                let args = self.parse_call_args()?;
                Ok(Expr::Call {
                    callee: Box::new(left),
                    args,
                    tail: false,
                    pos,
                })
            }
            TokenKind::LBrace => {
                if !matches!(left, Expr::Ident { .. } | Expr::Dot { .. }) {
                    return Err(self.error("struct initializer requires a name".to_string()));
                }
                let fields = self.parse_struct_init_fields()?;
                Ok(Expr::StructInit {
                    target: Box::new(left),
                    fields,
                    pos,
                })
            }
            TokenKind::Dot => {
                self.advance();
                self.skip_newlines();
                let name = match self.advance().kind {
                    TokenKind::Ident(n) => n,
                    other => {
                        return Err(self.error(format!("expected member name, found {:?}", other)))
                    }
                };
                Ok(Expr::Dot {
                    target: Box::new(left),
                    name,
                    pos,
                })
            }
            TokenKind::LBracket => {
                self.advance();
                self.skip_newlines();
                let index = self.parse_subscript()?;
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(Expr::Index {
                    target: Box::new(left),
                    index: Box::new(index),
                    pos,
                })
            }
            kind => {
                let op =
                    infix_op(&kind).ok_or_else(|| self.error(format!("unexpected {:?}", kind)))?;
                let prec = infix_prec(&kind).unwrap();
                self.advance();
                self.skip_newlines();
                let right = self.parse_expr(prec)?;
                Ok(Expr::Infix {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    pos,
                })
            }
        }
    }

    fn parse_subscript(&mut self) -> Result<Expr, ParseError> {
        let pos = self.here();
        let start = if matches!(self.kind(), TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr(Prec::Lowest)?))
        };
        if self.eat(&TokenKind::Colon) {
            self.skip_newlines();
            let end = if matches!(self.kind(), TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr(Prec::Lowest)?))
            };
            Ok(Expr::SliceArg { start, end, pos })
        } else {
            match start {
                Some(e) => Ok(*e),
                None => Err(self.error("empty subscript".to_string())),
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<CallArg>, ParseError> {
        self.expect(&TokenKind::LParen, "'('")?;
        self.skip_newlines();
        let mut args = Vec::new();
        while !matches!(self.kind(), TokenKind::RParen) {
            if self.eat(&TokenKind::Ellipsis) {
                let expr = self.parse_expr(Prec::Lowest)?;
                args.push(CallArg::Spread(expr));
            } else if matches!(self.kind(), TokenKind::Ident(_))
                && matches!(self.peek_kind(1), TokenKind::Assign)
            {
                let name = match self.advance().kind {
                    TokenKind::Ident(n) => n,
                    _ => unreachable!(),
                };
                self.advance(); // =
                self.skip_newlines();
                let expr = self.parse_expr(Prec::Lowest)?;
                args.push(CallArg::Named(name, expr));
            } else {
                args.push(CallArg::Positional(self.parse_expr(Prec::Lowest)?));
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn parse_struct_init_fields(&mut self) -> Result<Vec<(String, Expr)>, ParseError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            let name = match self.advance().kind {
                TokenKind::Ident(n) => n,
                other => return Err(self.error(format!("expected field name, found {:?}", other))),
            };
            self.expect(&TokenKind::Colon, "':'")?;
            self.skip_newlines();
            let value = self.parse_expr(Prec::Lowest)?;
            fields.push((name, value));
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(fields)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let pos = self.here();
        match self.kind().clone() {
            TokenKind::Illegal(msg) => Err(self.error(msg)),
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil { pos })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool { value: true, pos })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool { value: false, pos })
            }
            TokenKind::Number(text) => {
                self.advance();
                Ok(Expr::Num {
                    value: Number::parse(&text),
                    pos,
                })
            }
            TokenKind::Bytes(hex) => {
                self.advance();
                let data = decode_hex(&hex);
                Ok(Expr::Bytes { data, pos })
            }
            TokenKind::Symbol(name) => {
                self.advance();
                Ok(Expr::Symbol { name, pos })
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Ident { name, pos })
            }
            TokenKind::StrStart { .. } => self.parse_string(pos),
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_expr(Prec::Prefix)?;
                Ok(Expr::Prefix {
                    op: PrefixOp::Neg,
                    operand: Box::new(operand),
                    pos,
                })
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_expr(Prec::Prefix)?;
                Ok(Expr::Prefix {
                    op: PrefixOp::Not,
                    operand: Box::new(operand),
                    pos,
                })
            }
            TokenKind::Tilde => {
                self.advance();
                let operand = self.parse_expr(Prec::Prefix)?;
                Ok(Expr::Prefix {
                    op: PrefixOp::BitNot,
                    operand: Box::new(operand),
                    pos,
                })
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.parse_expr(Prec::Lowest)?;
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_list(pos),
            TokenKind::LBrace => {
                if self.looks_like_map() {
                    self.parse_map(pos)
                } else {
                    let block = self.parse_block()?;
                    Ok(Expr::Block(block))
                }
            }
            TokenKind::Fn => self.parse_fn(false),
            TokenKind::Struct => self.parse_struct_def(pos),
            TokenKind::If => self.parse_if(pos),
            TokenKind::Match => self.parse_match(pos),
            TokenKind::Spawn => {
                self.advance();
                let body = self.parse_expr(Prec::Lowest)?;
                Ok(Expr::Spawn {
                    body: Arc::new(body),
                    pos,
                })
            }
            TokenKind::Await => {
                self.advance();
                let target = self.parse_expr(Prec::Lowest)?;
                let timeout = if self.eat(&TokenKind::Comma) {
                    self.skip_newlines();
                    if matches!(self.kind(), TokenKind::Ident(n) if n == "timeout")
                        && matches!(self.peek_kind(1), TokenKind::Assign)
                    {
                        self.advance();
                        self.advance();
                        self.skip_newlines();
                    }
                    Some(Box::new(self.parse_expr(Prec::Lowest)?))
                } else {
                    None
                };
                Ok(Expr::Await {
                    target: Box::new(target),
                    timeout,
                    pos,
                })
            }
            TokenKind::Nursery => self.parse_nursery(),
            TokenKind::Select => self.parse_select(pos),
            TokenKind::Recur => {
                self.advance();
                if self.fn_depth == 0 {
                    return Err(self.error("recur outside of a function".to_string()));
                }
                let args = self.parse_call_args()?;
                Ok(Expr::Recur {
                    args,
                    tail: false,
                    pos,
                })
            }
            other => Err(self.error(format!("unexpected {:?}", other))),
        }
    }

    fn parse_string(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.advance(); // StrStart
        let mut pieces = Vec::new();
        loop {
            match self.kind().clone() {
                TokenKind::StrPart(text) => {
                    self.advance();
                    pieces.push(StrPiece::Lit(text));
                }
                TokenKind::InterpStart => {
                    self.advance();
                    self.skip_newlines();
                    let inner = self.parse_expr(Prec::Lowest)?;
                    self.skip_newlines();
                    self.expect(&TokenKind::InterpEnd, "'}}'")?;
                    pieces.push(StrPiece::Interp(Box::new(inner)));
                }
                TokenKind::StrEnd => {
                    self.advance();
                    break;
                }
                TokenKind::Illegal(msg) => return Err(self.error(msg)),
                other => return Err(self.error(format!("unexpected {:?} in string", other))),
            }
        }
        Ok(Expr::Str { pieces, pos })
    }

    fn parse_list(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::LBracket, "'['")?;
        self.skip_newlines();
        let mut items = Vec::new();
        while !matches!(self.kind(), TokenKind::RBracket) {
            if self.eat(&TokenKind::Ellipsis) {
                items.push(ListItem::Spread(self.parse_expr(Prec::Lowest)?));
            } else {
                items.push(ListItem::Item(self.parse_expr(Prec::Lowest)?));
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expr::List { items, pos })
    }

    /// After an opening `{`, decide between a map literal and a block.
    fn looks_like_map(&self) -> bool {
        let mut idx = 1;
        while matches!(self.peek_kind(idx), TokenKind::Newline) {
            idx += 1;
        }
        match self.peek_kind(idx) {
            TokenKind::RBrace | TokenKind::Ellipsis => true,
            TokenKind::Ident(_)
            | TokenKind::Number(_)
            | TokenKind::Symbol(_)
            | TokenKind::True
            | TokenKind::False => matches!(self.peek_kind(idx + 1), TokenKind::Colon),
            TokenKind::StrStart { .. } => {
                // "key": — a single literal chunk followed by a colon
                matches!(self.peek_kind(idx + 1), TokenKind::StrPart(_))
                    && matches!(self.peek_kind(idx + 2), TokenKind::StrEnd)
                    && matches!(self.peek_kind(idx + 3), TokenKind::Colon)
            }
            _ => false,
        }
    }

    fn parse_map_key(&mut self) -> Result<MapKey, ParseError> {
        match self.kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(MapKey::Str(name))
            }
            TokenKind::Number(text) => {
                self.advance();
                Ok(MapKey::Num(Number::parse(&text)))
            }
            TokenKind::Symbol(name) => {
                self.advance();
                Ok(MapKey::Symbol(name))
            }
            TokenKind::True => {
                self.advance();
                Ok(MapKey::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(MapKey::Bool(false))
            }
            TokenKind::StrStart { .. } => {
                let pos = self.here();
                match self.parse_string(pos)? {
                    Expr::Str { pieces, .. } => match pieces.as_slice() {
                        [StrPiece::Lit(s)] => Ok(MapKey::Str(s.clone())),
                        [] => Ok(MapKey::Str(String::new())),
                        _ => Err(self.error("interpolation not allowed in map key".to_string())),
                    },
                    _ => unreachable!(),
                }
            }
            other => Err(self.error(format!("bad map key {:?}", other))),
        }
    }

    fn parse_map(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut entries = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            if self.eat(&TokenKind::Ellipsis) {
                entries.push(MapEntry::Spread(self.parse_expr(Prec::Lowest)?));
            } else {
                let key = self.parse_map_key()?;
                self.expect(&TokenKind::Colon, "':'")?;
                self.skip_newlines();
                let value = self.parse_expr(Prec::Lowest)?;
                entries.push(MapEntry::Pair(key, value));
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Map { entries, pos })
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let pos = self.here();
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if matches!(self.kind(), TokenKind::RBrace | TokenKind::Eof) {
                break;
            }
            let stmt = self.parse_stmt()?;
            validate_struct_placement(&stmt)?;
            stmts.push(stmt);
            match self.kind() {
                TokenKind::Newline | TokenKind::Semicolon => {
                    self.advance();
                }
                TokenKind::RBrace => break,
                other => {
                    return Err(self.error(format!("unexpected {:?} after statement", other)))
                }
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Block {
            stmts,
            nursery: None,
            pos,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, ParseError> {
        self.expect(&TokenKind::LParen, "'('")?;
        self.skip_newlines();
        let mut params = Vec::new();
        let mut seen_variadic = false;
        while !matches!(self.kind(), TokenKind::RParen) {
            let pos = self.here();
            let mut tag = None;
            if self.eat(&TokenKind::At) {
                match self.advance().kind {
                    TokenKind::Ident(n) => tag = Some(n),
                    other => {
                        return Err(self.error(format!("expected tag name, found {:?}", other)))
                    }
                }
            }
            if seen_variadic {
                return Err(self.error("variadic parameter must be last".to_string()));
            }
            let variadic = self.eat(&TokenKind::Ellipsis);
            let name = match self.advance().kind {
                TokenKind::Ident(n) => n,
                other => {
                    return Err(self.error(format!("expected parameter name, found {:?}", other)))
                }
            };
            let default = if !variadic && self.eat(&TokenKind::Assign) {
                self.skip_newlines();
                Some(self.parse_expr(Prec::Lowest)?)
            } else {
                None
            };
            seen_variadic = variadic;
            params.push(Param {
                name,
                tag,
                default,
                variadic,
                pos,
            });
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(params)
    }

    fn parse_fn(&mut self, nursery_body: bool) -> Result<Expr, ParseError> {
        let pos = self.here();
        self.expect(&TokenKind::Fn, "'fn'")?;
        let params = self.parse_params()?;
        self.fn_depth += 1;
        let body_result = if matches!(self.kind(), TokenKind::Match)
            && matches!(self.peek_kind(1), TokenKind::LBrace)
        {
            // fn(x) match { … } sugar: match on the first parameter.
            let match_pos = self.here();
            match params.first() {
                Some(first) => {
                    let subject = Expr::Ident {
                        name: first.name.clone(),
                        pos: match_pos,
                    };
                    self.parse_match_tail(match_pos, subject).map(|arms| Block {
                        stmts: vec![Stmt::Expr {
                            expr: arms,
                            pos: match_pos,
                        }],
                        nursery: None,
                        pos: match_pos,
                    })
                }
                None => Err(self.error("match-form function requires a parameter".to_string())),
            }
        } else if matches!(self.kind(), TokenKind::LBrace) {
            self.parse_block()
        } else {
            // single-expression body: fn(n) if (n == 0) { 1 } else { n }
            let pos = self.here();
            self.parse_expr(Prec::Lowest).map(|expr| Block {
                stmts: vec![Stmt::Expr { expr, pos }],
                nursery: None,
                pos,
            })
        };
        self.fn_depth -= 1;
        let mut body = body_result?;
        if nursery_body {
            body.nursery = Some(NurserySpec { limit: None });
        }
        let has_defer = block_has_defer(&body);
        mark_and_validate_tails(&mut body, !has_defer)?;
        let sig = Signature::of_params(&params);
        Ok(Expr::Fn {
            decl: Arc::new(FnDecl {
                params,
                body: Arc::new(body),
                sig,
                has_defer,
                pos,
            }),
            pos,
        })
    }

    fn parse_struct_def(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Struct, "'struct'")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_separators();
        let mut fields = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            let field_pos = self.here();
            let mut tag = None;
            if self.eat(&TokenKind::At) {
                match self.advance().kind {
                    TokenKind::Ident(n) => tag = Some(n),
                    other => {
                        return Err(self.error(format!("expected tag name, found {:?}", other)))
                    }
                }
            }
            let name = match self.advance().kind {
                TokenKind::Ident(n) => n,
                other => return Err(self.error(format!("expected field name, found {:?}", other))),
            };
            let default = if self.eat(&TokenKind::Assign) {
                self.skip_newlines();
                Some(self.parse_expr(Prec::Lowest)?)
            } else {
                None
            };
            fields.push(StructField {
                name,
                tag,
                default,
                pos: field_pos,
            });
            self.skip_separators();
            if self.eat(&TokenKind::Comma) {
                self.skip_separators();
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::StructDef { fields, pos })
    }

    fn parse_if(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::If, "'if'")?;
        self.expect(&TokenKind::LParen, "'('")?;
        self.skip_newlines();
        let cond = self.parse_expr(Prec::Lowest)?;
        self.skip_newlines();
        self.expect(&TokenKind::RParen, "')'")?;
        let then = if matches!(self.kind(), TokenKind::LBrace) {
            Expr::Block(self.parse_block()?)
        } else {
            self.parse_expr(Prec::Lowest)?
        };
        let alt = if self.eat(&TokenKind::Else) {
            Some(Box::new(if matches!(self.kind(), TokenKind::If) {
                let else_pos = self.here();
                self.parse_if(else_pos)?
            } else if matches!(self.kind(), TokenKind::LBrace) {
                Expr::Block(self.parse_block()?)
            } else {
                self.parse_expr(Prec::Lowest)?
            }))
        } else {
            None
        };
        Ok(Expr::If {
            cond: Box::new(cond),
            then: Box::new(then),
            alt,
            pos,
        })
    }

    fn parse_match(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Match, "'match'")?;
        self.expect(&TokenKind::LParen, "'('")?;
        self.skip_newlines();
        let subject = self.parse_expr(Prec::Lowest)?;
        self.skip_newlines();
        self.expect(&TokenKind::RParen, "')'")?;
        self.parse_match_tail(pos, subject)
    }

    fn parse_match_tail(&mut self, pos: Position, subject: Expr) -> Result<Expr, ParseError> {
        if matches!(self.kind(), TokenKind::Match) {
            self.advance();
        }
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_separators();
        let mut arms = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            let arm_pos = self.here();
            let mut patterns = vec![self.parse_pattern()?];
            while self.eat(&TokenKind::Comma) {
                self.skip_newlines();
                patterns.push(self.parse_pattern()?);
            }
            if patterns.len() > 1 {
                for pattern in &patterns {
                    if pattern.binds() {
                        return Err(ParseError {
                            message: "alternative patterns must not bind names".to_string(),
                            pos: pattern.pos(),
                        });
                    }
                }
            }
            let guard = if matches!(self.kind(), TokenKind::If) {
                self.advance();
                Some(self.parse_expr(Prec::Lowest)?)
            } else {
                None
            };
            self.expect(&TokenKind::Arrow, "'=>'")?;
            self.skip_newlines();
            let body = if matches!(self.kind(), TokenKind::LBrace) && !self.looks_like_map() {
                Expr::Block(self.parse_block()?)
            } else if matches!(self.kind(), TokenKind::Return | TokenKind::Throw) {
                let stmt = self.parse_stmt()?;
                Expr::Block(Block {
                    pos: stmt.pos(),
                    stmts: vec![stmt],
                    nursery: None,
                })
            } else {
                self.parse_expr(Prec::Lowest)?
            };
            arms.push(MatchArm {
                patterns,
                guard,
                body,
                pos: arm_pos,
            });
            self.skip_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Match {
            subject: Box::new(subject),
            arms,
            pos,
        })
    }

    fn parse_nursery(&mut self) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Nursery, "'nursery'")?;
        if matches!(self.kind(), TokenKind::Fn) {
            return self.parse_fn(true);
        }
        // the limit stops before the scope's `{`; parenthesize anything
        // lower than a call
        let limit = if matches!(self.kind(), TokenKind::Ident(n) if n == "limit") {
            self.advance();
            Some(Box::new(self.parse_expr(Prec::Call)?))
        } else {
            None
        };
        let mut block = self.parse_block()?;
        block.nursery = Some(NurserySpec { limit });
        Ok(Expr::Block(block))
    }

    fn parse_select(&mut self, pos: Position) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Select, "'select'")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_separators();
        let mut arms = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            let arm_pos = self.here();
            // arm operands stop before `/>` so the handler stays separate;
            // parenthesize operands that use lower-precedence operators
            let op = match self.kind().clone() {
                TokenKind::Ident(ref n) if n == "recv" => {
                    self.advance();
                    SelectOp::Recv(self.parse_expr(Prec::PipeCall)?)
                }
                TokenKind::Ident(ref n) if n == "send" => {
                    self.advance();
                    let chan = self.parse_expr(Prec::PipeCall)?;
                    self.expect(&TokenKind::Comma, "','")?;
                    self.skip_newlines();
                    let value = self.parse_expr(Prec::PipeCall)?;
                    SelectOp::Send(chan, value)
                }
                TokenKind::Ident(ref n) if n == "after" => {
                    self.advance();
                    SelectOp::After(self.parse_expr(Prec::PipeCall)?)
                }
                TokenKind::Await => {
                    self.advance();
                    SelectOp::AwaitTask(self.parse_expr(Prec::PipeCall)?)
                }
                TokenKind::Underscore => {
                    self.advance();
                    SelectOp::Default
                }
                other => return Err(self.error(format!("bad select arm {:?}", other))),
            };
            let handler = if self.eat(&TokenKind::PipeCall) {
                self.skip_newlines();
                Some(self.parse_expr(Prec::Lowest)?)
            } else {
                None
            };
            arms.push(SelectArm {
                op,
                handler,
                pos: arm_pos,
            });
            self.skip_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        if arms.is_empty() {
            return Err(ParseError {
                message: "select requires at least one arm".to_string(),
                pos,
            });
        }
        Ok(Expr::Select { arms, pos })
    }

    // ------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------

    fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        let pos = self.here();
        match self.kind().clone() {
            TokenKind::Underscore => {
                self.advance();
                Ok(Pattern::Wildcard { pos })
            }
            TokenKind::Nil
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Number(_)
            | TokenKind::Symbol(_)
            | TokenKind::Bytes(_) => {
                let value = self.parse_prefix()?;
                Ok(Pattern::Literal { value, pos })
            }
            TokenKind::Minus => {
                self.advance();
                match self.kind().clone() {
                    TokenKind::Number(text) => {
                        self.advance();
                        Ok(Pattern::Literal {
                            value: Expr::Num {
                                value: Number::parse(&text).neg(),
                                pos,
                            },
                            pos,
                        })
                    }
                    other => {
                        Err(self.error(format!("expected number after '-', found {:?}", other)))
                    }
                }
            }
            TokenKind::StrStart { .. } => {
                let value = self.parse_string(pos)?;
                if let Expr::Str { pieces, .. } = &value {
                    if pieces.iter().any(|p| matches!(p, StrPiece::Interp(_))) {
                        return Err(
                            self.error("interpolation not allowed in a pattern".to_string())
                        );
                    }
                }
                Ok(Pattern::Literal { value, pos })
            }
            TokenKind::Caret => {
                self.advance();
                let name = match self.advance().kind {
                    TokenKind::Ident(n) => n,
                    other => {
                        return Err(self
                            .error(format!("expected identifier after '^', found {:?}", other)))
                    }
                };
                Ok(Pattern::Pinned { name, pos })
            }
            TokenKind::Ellipsis => {
                self.advance();
                let name = match self.kind().clone() {
                    TokenKind::Ident(n) => {
                        self.advance();
                        Some(n)
                    }
                    _ => None,
                };
                Ok(Pattern::Spread { name, pos })
            }
            TokenKind::LBracket => self.parse_list_pattern(pos),
            TokenKind::LBrace => self.parse_map_pattern(pos),
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::At) {
                    let inner = self.parse_pattern()?;
                    Ok(Pattern::Binding {
                        name,
                        inner: Box::new(inner),
                        pos,
                    })
                } else if matches!(self.kind(), TokenKind::LBrace) {
                    self.parse_struct_pattern(name, pos)
                } else {
                    Ok(Pattern::Ident { name, pos })
                }
            }
            other => Err(self.error(format!("bad pattern {:?}", other))),
        }
    }

    fn parse_list_pattern(&mut self, pos: Position) -> Result<Pattern, ParseError> {
        self.expect(&TokenKind::LBracket, "'['")?;
        self.skip_newlines();
        let mut items = Vec::new();
        while !matches!(self.kind(), TokenKind::RBracket) {
            let item = self.parse_pattern()?;
            if let Some(prev) = items.last() {
                if matches!(prev, Pattern::Spread { .. }) {
                    return Err(ParseError {
                        message: "spread must be the final list pattern element".to_string(),
                        pos: item.pos(),
                    });
                }
            }
            items.push(item);
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Pattern::List { items, pos })
    }

    fn parse_map_pattern(&mut self, pos: Position) -> Result<Pattern, ParseError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut entries = Vec::new();
        let mut rest = None;
        let mut select_all = false;
        while !matches!(self.kind(), TokenKind::RBrace) {
            if matches!(self.kind(), TokenKind::Star) {
                self.advance();
                select_all = true;
            } else if self.eat(&TokenKind::Ellipsis) {
                let name = match self.kind().clone() {
                    TokenKind::Ident(n) => {
                        self.advance();
                        Some(n)
                    }
                    _ => None,
                };
                rest = Some(name);
            } else {
                let key = self.parse_map_key()?;
                let pattern = if self.eat(&TokenKind::Colon) {
                    self.skip_newlines();
                    self.parse_pattern()?
                } else {
                    // `{name}` shorthand binds the key's value to `name`.
                    match &key {
                        MapKey::Str(name) => Pattern::Ident {
                            name: name.clone(),
                            pos,
                        },
                        _ => {
                            return Err(self
                                .error("shorthand map pattern requires a name key".to_string()))
                        }
                    }
                };
                entries.push((key, pattern));
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Pattern::Map {
            entries,
            rest,
            select_all,
            pos,
        })
    }

    fn parse_struct_pattern(&mut self, name: String, pos: Position) -> Result<Pattern, ParseError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            let field = match self.advance().kind {
                TokenKind::Ident(n) => n,
                other => return Err(self.error(format!("expected field name, found {:?}", other))),
            };
            let pattern = if self.eat(&TokenKind::Colon) {
                self.skip_newlines();
                self.parse_pattern()?
            } else {
                Pattern::Ident {
                    name: field.clone(),
                    pos,
                }
            };
            fields.push((field, pattern));
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Pattern::Struct { name, fields, pos })
    }
}

fn decode_hex(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            (hi << 4) | lo
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Post-parse analysis: defer detection, tail marking, recur validation
// ---------------------------------------------------------------------------

/// True when the block registers any deferred statement, at any depth inside
/// the same function (nested function literals are not entered).
fn block_has_defer(block: &Block) -> bool {
    block.stmts.iter().any(stmt_has_defer)
}

fn stmt_has_defer(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Defer { .. } => true,
        Stmt::Val { value, .. } | Stmt::Var { value, .. } | Stmt::Throw { value, .. } => {
            expr_has_defer(value)
        }
        Stmt::Return { value, .. } => value.as_ref().map(expr_has_defer).unwrap_or(false),
        Stmt::Expr { expr, .. } => expr_has_defer(expr),
        Stmt::Import { .. } | Stmt::ForeignDecl { .. } => false,
    }
}

fn expr_has_defer(expr: &Expr) -> bool {
    match expr {
        Expr::Block(b) => block_has_defer(b),
        Expr::If {
            cond, then, alt, ..
        } => {
            expr_has_defer(cond)
                || expr_has_defer(then)
                || alt.as_ref().map(|a| expr_has_defer(a)).unwrap_or(false)
        }
        Expr::Match { subject, arms, .. } => {
            expr_has_defer(subject)
                || arms.iter().any(|arm| {
                    arm.guard.as_ref().map(expr_has_defer).unwrap_or(false)
                        || expr_has_defer(&arm.body)
                })
        }
        Expr::Infix { left, right, .. } | Expr::Pipe { left, right, .. } => {
            expr_has_defer(left) || expr_has_defer(right)
        }
        Expr::Prefix { operand, .. } => expr_has_defer(operand),
        Expr::Assign { target, value, .. } => expr_has_defer(target) || expr_has_defer(value),
        Expr::Call { callee, args, .. } => {
            expr_has_defer(callee)
                || args.iter().any(|arg| match arg {
                    CallArg::Positional(e) | CallArg::Named(_, e) | CallArg::Spread(e) => {
                        expr_has_defer(e)
                    }
                })
        }
        Expr::Index { target, index, .. } => expr_has_defer(target) || expr_has_defer(index),
        Expr::Dot { target, .. } => expr_has_defer(target),
        Expr::Select { arms, .. } => arms.iter().any(|arm| {
            let op = match &arm.op {
                SelectOp::Recv(c) | SelectOp::After(c) | SelectOp::AwaitTask(c) => {
                    expr_has_defer(c)
                }
                SelectOp::Send(c, v) => expr_has_defer(c) || expr_has_defer(v),
                SelectOp::Default => false,
            };
            op || arm.handler.as_ref().map(expr_has_defer).unwrap_or(false)
        }),
        _ => false,
    }
}

/// Mark direct calls and `recur` in tail position, and reject `recur` found
/// anywhere else. With `mark` false (the function registers defers), tail
/// positions are still computed for validation but no call is marked.
fn mark_and_validate_tails(block: &mut Block, mark: bool) -> Result<(), ParseError> {
    walk_block(block, true, mark)
}

fn walk_block(block: &mut Block, tail: bool, mark: bool) -> Result<(), ParseError> {
    // A nursery scope joins its children on exit, so a call inside it must
    // complete before the scope returns; never a tail call.
    let tail = tail && block.nursery.is_none();
    let last = block.stmts.len().saturating_sub(1);
    for (i, stmt) in block.stmts.iter_mut().enumerate() {
        walk_stmt(stmt, tail && i == last, mark)?;
    }
    Ok(())
}

fn walk_stmt(stmt: &mut Stmt, tail: bool, mark: bool) -> Result<(), ParseError> {
    match stmt {
        Stmt::Expr { expr, .. } => walk_expr(expr, tail, mark),
        Stmt::Return { value, .. } => match value {
            Some(expr) => walk_expr(expr, true, mark),
            None => Ok(()),
        },
        Stmt::Val { value, .. } | Stmt::Var { value, .. } | Stmt::Throw { value, .. } => {
            walk_expr(value, false, mark)
        }
        Stmt::Defer { .. } | Stmt::Import { .. } | Stmt::ForeignDecl { .. } => Ok(()),
    }
}

fn walk_expr(expr: &mut Expr, tail: bool, mark: bool) -> Result<(), ParseError> {
    match expr {
        Expr::Call {
            callee,
            args,
            tail: slot,
            ..
        } => {
            if tail && mark {
                *slot = true;
            }
            walk_expr(callee, false, mark)?;
            for arg in args {
                match arg {
                    CallArg::Positional(e) | CallArg::Named(_, e) | CallArg::Spread(e) => {
                        walk_expr(e, false, mark)?
                    }
                }
            }
            Ok(())
        }
        Expr::Recur {
            args,
            tail: slot,
            pos,
        } => {
            if !tail {
                return Err(ParseError {
                    message: "recur is only allowed in tail position".to_string(),
                    pos: *pos,
                });
            }
            *slot = mark;
            for arg in args {
                match arg {
                    CallArg::Positional(e) | CallArg::Named(_, e) | CallArg::Spread(e) => {
                        walk_expr(e, false, mark)?
                    }
                }
            }
            Ok(())
        }
        Expr::If {
            cond, then, alt, ..
        } => {
            walk_expr(cond, false, mark)?;
            walk_expr(then, tail, mark)?;
            if let Some(alt) = alt {
                walk_expr(alt, tail, mark)?;
            }
            Ok(())
        }
        Expr::Match { subject, arms, .. } => {
            walk_expr(subject, false, mark)?;
            for arm in arms {
                if let Some(guard) = &mut arm.guard {
                    walk_expr(guard, false, mark)?;
                }
                walk_expr(&mut arm.body, tail, mark)?;
            }
            Ok(())
        }
        Expr::Block(block) => walk_block(block, tail, mark),
        Expr::Select { arms, .. } => {
            for arm in arms {
                match &mut arm.op {
                    SelectOp::Recv(c) | SelectOp::After(c) | SelectOp::AwaitTask(c) => {
                        walk_expr(c, false, mark)?
                    }
                    SelectOp::Send(c, v) => {
                        walk_expr(c, false, mark)?;
                        walk_expr(v, false, mark)?;
                    }
                    SelectOp::Default => {}
                }
                if let Some(handler) = &mut arm.handler {
                    walk_expr(handler, tail, mark)?;
                }
            }
            Ok(())
        }
        Expr::Infix { left, right, .. } => {
            walk_expr(left, false, mark)?;
            walk_expr(right, false, mark)
        }
        Expr::Prefix { operand, .. } => walk_expr(operand, false, mark),
        Expr::Assign { target, value, .. } => {
            walk_expr(target, false, mark)?;
            walk_expr(value, false, mark)
        }
        Expr::Pipe { left, right, .. } => {
            walk_expr(left, false, mark)?;
            walk_expr(right, false, mark)
        }
        Expr::Index { target, index, .. } => {
            walk_expr(target, false, mark)?;
            walk_expr(index, false, mark)
        }
        Expr::SliceArg { start, end, .. } => {
            if let Some(s) = start {
                walk_expr(s, false, mark)?;
            }
            if let Some(e) = end {
                walk_expr(e, false, mark)?;
            }
            Ok(())
        }
        Expr::Dot { target, .. } => walk_expr(target, false, mark),
        Expr::List { items, .. } => {
            for item in items {
                match item {
                    ListItem::Item(e) | ListItem::Spread(e) => walk_expr(e, false, mark)?,
                }
            }
            Ok(())
        }
        Expr::Map { entries, .. } => {
            for entry in entries {
                match entry {
                    MapEntry::Pair(_, e) | MapEntry::Spread(e) => walk_expr(e, false, mark)?,
                }
            }
            Ok(())
        }
        Expr::Str { pieces, .. } => {
            for piece in pieces {
                if let StrPiece::Interp(e) = piece {
                    walk_expr(e, false, mark)?;
                }
            }
            Ok(())
        }
        Expr::StructInit { target, fields, .. } => {
            walk_expr(target, false, mark)?;
            for (_, e) in fields {
                walk_expr(e, false, mark)?;
            }
            Ok(())
        }
        Expr::Await {
            target, timeout, ..
        } => {
            walk_expr(target, false, mark)?;
            if let Some(t) = timeout {
                walk_expr(t, false, mark)?;
            }
            Ok(())
        }
        Expr::Spawn { .. } => {
            // The spawned expression runs in another task; an inner `recur`
            // would target a frame that is not on that task's stack, and the
            // body was validated when its enclosing function was parsed.
            Ok(())
        }
        Expr::Fn { .. }
        | Expr::StructDef { .. }
        | Expr::Nil { .. }
        | Expr::Bool { .. }
        | Expr::Num { .. }
        | Expr::Bytes { .. }
        | Expr::Symbol { .. }
        | Expr::Ident { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Struct schema placement
// ---------------------------------------------------------------------------

/// `struct { … }` is only valid as the direct RHS of `val`/`var`.
fn validate_struct_placement(stmt: &Stmt) -> Result<(), ParseError> {
    match stmt {
        Stmt::Val { value, .. } | Stmt::Var { value, .. } => {
            if let Expr::StructDef { fields, .. } = value {
                for field in fields {
                    if let Some(default) = &field.default {
                        forbid_structs(default)?;
                    }
                }
                Ok(())
            } else {
                forbid_structs(value)
            }
        }
        Stmt::Return { value: Some(v), .. } | Stmt::Throw { value: v, .. } => forbid_structs(v),
        Stmt::Expr { expr, .. } => forbid_structs(expr),
        _ => Ok(()),
    }
}

fn forbid_structs(expr: &Expr) -> Result<(), ParseError> {
    let mut found: Option<Position> = None;
    visit_exprs(expr, &mut |e| {
        if let Expr::StructDef { pos, .. } = e {
            if found.is_none() {
                found = Some(*pos);
            }
        }
    });
    match found {
        Some(pos) => Err(ParseError {
            message: "struct schema is only allowed as a val/var initializer".to_string(),
            pos,
        }),
        None => Ok(()),
    }
}

fn visit_exprs(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::List { items, .. } => {
            for item in items {
                match item {
                    ListItem::Item(e) | ListItem::Spread(e) => visit_exprs(e, visit),
                }
            }
        }
        Expr::Map { entries, .. } => {
            for entry in entries {
                match entry {
                    MapEntry::Pair(_, e) | MapEntry::Spread(e) => visit_exprs(e, visit),
                }
            }
        }
        Expr::Str { pieces, .. } => {
            for piece in pieces {
                if let StrPiece::Interp(e) = piece {
                    visit_exprs(e, visit);
                }
            }
        }
        Expr::Fn { decl, .. } => {
            for stmt in &decl.body.stmts {
                visit_stmt_exprs(stmt, visit);
            }
        }
        Expr::StructInit { target, fields, .. } => {
            visit_exprs(target, visit);
            for (_, e) in fields {
                visit_exprs(e, visit);
            }
        }
        Expr::Prefix { operand, .. } => visit_exprs(operand, visit),
        Expr::Infix { left, right, .. } | Expr::Pipe { left, right, .. } => {
            visit_exprs(left, visit);
            visit_exprs(right, visit);
        }
        Expr::Assign { target, value, .. } => {
            visit_exprs(target, visit);
            visit_exprs(value, visit);
        }
        Expr::Index { target, index, .. } => {
            visit_exprs(target, visit);
            visit_exprs(index, visit);
        }
        Expr::SliceArg { start, end, .. } => {
            if let Some(s) = start {
                visit_exprs(s, visit);
            }
            if let Some(e) = end {
                visit_exprs(e, visit);
            }
        }
        Expr::Dot { target, .. } => visit_exprs(target, visit),
        Expr::Call { callee, args, .. } => {
            visit_exprs(callee, visit);
            for arg in args {
                match arg {
                    CallArg::Positional(e) | CallArg::Named(_, e) | CallArg::Spread(e) => {
                        visit_exprs(e, visit)
                    }
                }
            }
        }
        Expr::Recur { args, .. } => {
            for arg in args {
                match arg {
                    CallArg::Positional(e) | CallArg::Named(_, e) | CallArg::Spread(e) => {
                        visit_exprs(e, visit)
                    }
                }
            }
        }
        Expr::Match { subject, arms, .. } => {
            visit_exprs(subject, visit);
            for arm in arms {
                if let Some(guard) = &arm.guard {
                    visit_exprs(guard, visit);
                }
                visit_exprs(&arm.body, visit);
            }
        }
        Expr::If {
            cond, then, alt, ..
        } => {
            visit_exprs(cond, visit);
            visit_exprs(then, visit);
            if let Some(alt) = alt {
                visit_exprs(alt, visit);
            }
        }
        Expr::Block(block) => {
            for stmt in &block.stmts {
                visit_stmt_exprs(stmt, visit);
            }
        }
        Expr::Spawn { body, .. } => visit_exprs(body, visit),
        Expr::Await {
            target, timeout, ..
        } => {
            visit_exprs(target, visit);
            if let Some(t) = timeout {
                visit_exprs(t, visit);
            }
        }
        Expr::Select { arms, .. } => {
            for arm in arms {
                match &arm.op {
                    SelectOp::Recv(c) | SelectOp::After(c) | SelectOp::AwaitTask(c) => {
                        visit_exprs(c, visit)
                    }
                    SelectOp::Send(c, v) => {
                        visit_exprs(c, visit);
                        visit_exprs(v, visit);
                    }
                    SelectOp::Default => {}
                }
                if let Some(handler) = &arm.handler {
                    visit_exprs(handler, visit);
                }
            }
        }
        _ => {}
    }
}

fn visit_stmt_exprs(stmt: &Stmt, visit: &mut dyn FnMut(&Expr)) {
    match stmt {
        Stmt::Val { value, .. } | Stmt::Var { value, .. } | Stmt::Throw { value, .. } => {
            // struct defs are allowed on val/var, checked at their own site
            if !matches!(value, Expr::StructDef { .. }) {
                visit_exprs(value, visit);
            }
        }
        Stmt::Return { value, .. } => {
            if let Some(v) = value {
                visit_exprs(v, visit);
            }
        }
        Stmt::Defer { body, .. } => {
            for stmt in &body.stmts {
                visit_stmt_exprs(stmt, visit);
            }
        }
        Stmt::Expr { expr, .. } => visit_exprs(expr, visit),
        Stmt::Import { .. } | Stmt::ForeignDecl { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse(src).unwrap_or_else(|e| panic!("parse failed: {} ({})", e.message, src))
    }

    fn first_expr(src: &str) -> Expr {
        match parse_ok(src).stmts.into_iter().next().unwrap() {
            Stmt::Expr { expr, .. } => expr,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        assert_eq!(first_expr("1 + 2 * 3").to_string(), "(1 + (2 * 3))");
        assert_eq!(first_expr("1 * 2 + 3").to_string(), "((1 * 2) + 3)");
        assert_eq!(
            first_expr("a || b && c == d").to_string(),
            "(a || (b && (c == d)))"
        );
        assert_eq!(
            first_expr("1 | 2 ^ 3 & 4 << 5").to_string(),
            "(1 | (2 ^ (3 & (4 << 5))))"
        );
        assert_eq!(first_expr("-a * b").to_string(), "((-a) * b)");
        assert_eq!(first_expr("!a == b").to_string(), "((!a) == b)");
    }

    #[test]
    fn test_concat_operators() {
        assert_eq!(first_expr("1 +: xs :+ 2").to_string(), "((1 +: xs) :+ 2)");
    }

    #[test]
    fn test_pipe_chain() {
        assert_eq!(first_expr("x /> f /> g").to_string(), "((x /> f) /> g)");
    }

    #[test]
    fn test_call_and_index() {
        assert_eq!(
            first_expr("f(1, x = 2, ...xs)").to_string(),
            "f(1, x = 2, ...xs)"
        );
        assert_eq!(first_expr("a[1]").to_string(), "a[1]");
        assert_eq!(first_expr("a[1:2]").to_string(), "a[1:2]");
        assert_eq!(first_expr("a[:2]").to_string(), "a[:2]");
        assert_eq!(first_expr("a.b.c").to_string(), "a.b.c");
    }

    #[test]
    fn test_newline_terminates_before_paren() {
        let program = parse_ok("f\n(1)");
        assert_eq!(program.stmts.len(), 2);
    }

    #[test]
    fn test_newline_continuation_after_operator() {
        let program = parse_ok("val x = 1 +\n2");
        assert_eq!(program.stmts.len(), 1);
        let program = parse_ok("val x = 1\n+ 2");
        assert_eq!(program.stmts.len(), 1);
    }

    #[test]
    fn test_map_vs_block() {
        assert!(matches!(first_expr("{a: 1}"), Expr::Map { .. }));
        assert!(matches!(first_expr("{}"), Expr::Map { .. }));
        assert!(matches!(first_expr("{ f(1) }"), Expr::Block(_)));
    }

    #[test]
    fn test_fn_signature() {
        let expr = first_expr("fn(a, @num b, c = 1, ...rest) { a }");
        match expr {
            Expr::Fn { decl, .. } => {
                assert_eq!(decl.sig.min, 2);
                assert_eq!(decl.sig.max, None);
                assert!(decl.sig.variadic);
                assert_eq!(decl.sig.tags, "_,num,_,_");
            }
            other => panic!("expected fn, got {:?}", other),
        }
    }

    #[test]
    fn test_fn_match_sugar() {
        let expr = first_expr("fn(x) match { 1 => \"one\"; _ => \"other\" }");
        match expr {
            Expr::Fn { decl, .. } => {
                assert_eq!(decl.body.stmts.len(), 1);
                assert!(matches!(
                    decl.body.stmts[0],
                    Stmt::Expr {
                        expr: Expr::Match { .. },
                        ..
                    }
                ));
            }
            other => panic!("expected fn, got {:?}", other),
        }
    }

    #[test]
    fn test_tail_marking_through_if() {
        let expr =
            first_expr("fn(n, acc) { if (n == 0) { acc } else { recur(n - 1, n * acc) } }");
        match expr {
            Expr::Fn { decl, .. } => match &decl.body.stmts[0] {
                Stmt::Expr {
                    expr: Expr::If { alt, .. },
                    ..
                } => match alt.as_deref() {
                    Some(Expr::Block(b)) => match &b.stmts[0] {
                        Stmt::Expr {
                            expr: Expr::Recur { tail, .. },
                            ..
                        } => assert!(*tail),
                        other => panic!("expected recur, got {:?}", other),
                    },
                    other => panic!("expected block, got {:?}", other),
                },
                other => panic!("expected if, got {:?}", other),
            },
            other => panic!("expected fn, got {:?}", other),
        }
    }

    #[test]
    fn test_recur_outside_tail_rejected() {
        assert!(parse("val f = fn(n) { recur(n) + 1 }").is_err());
        assert!(parse("val f = fn(n) { val x = recur(n)\nx }").is_err());
        assert!(parse("recur(1)").is_err());
    }

    #[test]
    fn test_recur_in_tail_accepted() {
        assert!(parse("val f = fn(n) { recur(n - 1) }").is_ok());
        assert!(parse("val f = fn(n) { if (n > 0) { recur(n - 1) } else { 0 } }").is_ok());
        assert!(parse("val f = fn(n) { match (n) { 0 => 0; _ => recur(n - 1) } }").is_ok());
        assert!(parse("val f = fn(n) { return recur(n - 1) }").is_ok());
    }

    #[test]
    fn test_defer_disables_tail_marks() {
        let expr = first_expr("fn(n) { defer { cleanup() }\nf(n) }");
        match expr {
            Expr::Fn { decl, .. } => {
                assert!(decl.has_defer);
                let last = decl.body.stmts.last().unwrap();
                match last {
                    Stmt::Expr {
                        expr: Expr::Call { tail, .. },
                        ..
                    } => assert!(!tail),
                    other => panic!("expected call, got {:?}", other),
                }
            }
            other => panic!("expected fn, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_only_in_binding() {
        assert!(parse("val Point = struct { x, y = 0 }").is_ok());
        assert!(parse("f(struct { x })").is_err());
        assert!(parse("struct { x }").is_err());
    }

    #[test]
    fn test_struct_init_and_copy() {
        assert_eq!(
            first_expr("Point{x: 1, y: 2}").to_string(),
            "Point{x: 1, y: 2}"
        );
    }

    #[test]
    fn test_match_multi_pattern_non_binding() {
        assert!(parse("match (x) { 1, 2 => \"low\"; _ => \"hi\" }").is_ok());
        assert!(parse("match (x) { 1, n => n; _ => 0 }").is_err());
    }

    #[test]
    fn test_patterns() {
        let program = parse_ok("val [a, b, ...rest] = xs");
        match &program.stmts[0] {
            Stmt::Val { pattern, .. } => {
                assert_eq!(pattern.to_string(), "[a, b, ...rest]");
            }
            other => panic!("expected val, got {:?}", other),
        }
        assert!(parse("val [..., a] = xs").is_err());
        let program = parse_ok("val {name: n, ...} = m");
        match &program.stmts[0] {
            Stmt::Val { pattern, .. } => assert_eq!(pattern.to_string(), "{name: n, ...}"),
            other => panic!("expected val, got {:?}", other),
        }
    }

    #[test]
    fn test_pinned_pattern() {
        let program = parse_ok("match (3) { ^x => \"eq\"; _ => \"neq\" }");
        match &program.stmts[0] {
            Stmt::Expr {
                expr: Expr::Match { arms, .. },
                ..
            } => {
                assert!(matches!(arms[0].patterns[0], Pattern::Pinned { .. }));
                assert!(!arms[0].patterns[0].binds());
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrency_forms() {
        assert!(parse("spawn { f() }").is_ok());
        assert!(parse("val t = spawn f(1)").is_ok());
        assert!(parse("await t").is_ok());
        assert!(parse("await t, timeout = 50").is_ok());
        assert!(parse("await t, 50").is_ok());
        assert!(parse("nursery { spawn f() }").is_ok());
        assert!(parse("nursery limit 4 { spawn f() }").is_ok());
        assert!(parse("val worker = nursery fn(x) { spawn g(x) }").is_ok());
    }

    #[test]
    fn test_select_arms() {
        let src = "select { recv ch /> handle; send out, 1; after 100 /> onTimeout; await t; _ }";
        let expr = first_expr(src);
        match expr {
            Expr::Select { arms, .. } => {
                assert_eq!(arms.len(), 5);
                assert!(matches!(arms[0].op, SelectOp::Recv(_)));
                assert!(arms[0].handler.is_some());
                assert!(matches!(arms[1].op, SelectOp::Send(_, _)));
                assert!(matches!(arms[2].op, SelectOp::After(_)));
                assert!(matches!(arms[3].op, SelectOp::AwaitTask(_)));
                assert!(matches!(arms[4].op, SelectOp::Default));
            }
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_defer_variants() {
        assert!(parse("val f = fn() { defer { close(c) }\n1 }").is_ok());
        assert!(parse("val f = fn() { defer onsuccess { commit() }\n1 }").is_ok());
        assert!(parse("val f = fn() { defer onerror(e) { log(e) }\n1 }").is_ok());
    }

    #[test]
    fn test_import_and_foreign() {
        assert!(parse("import slug.io.fs").is_ok());
        assert!(parse("foreign readFile = fn(@str path)").is_ok());
        assert!(parse("@export val x = 1").is_ok());
    }

    #[test]
    fn test_string_interpolation() {
        let expr = first_expr("\"sum: {{1 + 2}}!\"");
        match expr {
            Expr::Str { pieces, .. } => {
                assert_eq!(pieces.len(), 3);
                assert!(matches!(&pieces[0], StrPiece::Lit(s) if s == "sum: "));
                assert!(matches!(&pieces[1], StrPiece::Interp(_)));
                assert!(matches!(&pieces[2], StrPiece::Lit(s) if s == "!"));
            }
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_render_roundtrip() {
        // structure equivalence: render, reparse, render again
        let sources = [
            "val x = 1 + 2 * 3",
            "val f = fn(a, @num b = 1, ...rest) { a + b }",
            "match (x) { [a, ...rest] if a > 0 => a; {k: v} => v; _ => nil }",
            "val p = Point{x: 1, y: 2}",
            "x /> f /> g",
            "\"a{{x + 1}}b\"",
            "select { recv ch /> h; _ }",
            "nursery limit 2 { spawn f() }",
        ];
        for src in sources {
            let once = parse_ok(src).to_string();
            let twice = parse_ok(&once).to_string();
            assert_eq!(once, twice, "round-trip failed for {}", src);
        }
    }

    #[test]
    fn test_assignment() {
        assert_eq!(first_expr("x = 1").to_string(), "(x = 1)");
        assert_eq!(first_expr("a.b = 1").to_string(), "(a.b = 1)");
        assert_eq!(first_expr("a[0] = 1").to_string(), "(a[0] = 1)");
        assert!(parse("1 = 2").is_err());
    }
}
