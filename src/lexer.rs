// ABOUTME: Mode-switching lexer turning Slug source into a token stream

use crate::token::{Position, Token, TokenKind};

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Ordinary code. `brace_depth` tracks `{`/`}` nesting so that `}}`
    /// closing an interpolation is not confused with two block closers.
    Default { brace_depth: u32 },
    /// Inside a string literal; `multiline` for `"""` strings.
    Str { multiline: bool },
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    modes: Vec<Mode>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            modes: vec![Mode::Default { brace_depth: 0 }],
        }
    }

    /// Tokenize an entire source text, ending with a single EOF token.
    pub fn tokenize(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn here(&self) -> Position {
        Position {
            line: self.line,
            col: self.col,
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub fn next_token(&mut self) -> Token {
        match *self.modes.last().expect("mode stack never empty") {
            Mode::Str { multiline } => self.next_string_token(multiline),
            Mode::Default { .. } => self.next_default_token(),
        }
    }

    // ------------------------------------------------------------------
    // String mode
    // ------------------------------------------------------------------

    fn next_string_token(&mut self, multiline: bool) -> Token {
        let pos = self.here();
        // Closing quote?
        if self.peek() == Some('"') {
            if multiline {
                if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
                    self.bump();
                    self.bump();
                    self.bump();
                    self.modes.pop();
                    return Token::new(TokenKind::StrEnd, pos);
                }
            } else {
                self.bump();
                self.modes.pop();
                return Token::new(TokenKind::StrEnd, pos);
            }
        }
        // Interpolation?
        if self.peek() == Some('{') && self.peek_at(1) == Some('{') {
            self.bump();
            self.bump();
            self.modes.push(Mode::Default { brace_depth: 0 });
            return Token::new(TokenKind::InterpStart, pos);
        }
        // Literal chunk until quote, `{{`, or EOF.
        let mut chunk = String::new();
        loop {
            match self.peek() {
                None => {
                    self.modes.pop();
                    return Token::new(
                        TokenKind::Illegal("unterminated string".to_string()),
                        pos,
                    );
                }
                Some('"') => {
                    if multiline {
                        if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
                            break;
                        }
                        chunk.push('"');
                        self.bump();
                    } else {
                        break;
                    }
                }
                Some('{') if self.peek_at(1) == Some('{') => break,
                Some('\n') if !multiline => {
                    self.modes.pop();
                    return Token::new(
                        TokenKind::Illegal("newline in string".to_string()),
                        pos,
                    );
                }
                Some('\\') => {
                    self.bump();
                    match self.read_escape() {
                        Ok(c) => chunk.push(c),
                        Err(msg) => {
                            self.modes.pop();
                            return Token::new(TokenKind::Illegal(msg), pos);
                        }
                    }
                }
                Some(c) => {
                    chunk.push(c);
                    self.bump();
                }
            }
        }
        Token::new(TokenKind::StrPart(chunk), pos)
    }

    fn read_escape(&mut self) -> Result<char, String> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('t') => Ok('\t'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('{') => Ok('{'),
            Some(d) if d.is_ascii_digit() => {
                // 1-3 digit octal
                let mut value = d.to_digit(8).ok_or("bad octal escape")?;
                for _ in 0..2 {
                    match self.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            self.bump();
                            value = value * 8 + digit;
                        }
                        None => break,
                    }
                }
                char::from_u32(value).ok_or_else(|| "bad octal escape".to_string())
            }
            Some(c) => Err(format!("unknown escape '\\{}'", c)),
            None => Err("unterminated escape".to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Default mode
    // ------------------------------------------------------------------

    fn skip_trivia(&mut self) -> Option<Token> {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('/') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('*') => {
                    return Some(self.read_doc_comment());
                }
                _ => return None,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    /// `/** … */` with every body line prefixed by `*`. Anything else that
    /// starts with `/*` is malformed.
    fn read_doc_comment(&mut self) -> Token {
        let pos = self.here();
        self.bump(); // /
        self.bump(); // *
        if !self.eat('*') {
            self.skip_block_comment_tail();
            return Token::new(
                TokenKind::Illegal("malformed doc comment".to_string()),
                pos,
            );
        }
        let mut body = String::new();
        loop {
            match self.peek() {
                None => {
                    return Token::new(
                        TokenKind::Illegal("unterminated doc comment".to_string()),
                        pos,
                    );
                }
                Some('*') if self.peek_at(1) == Some('/') => {
                    self.bump();
                    self.bump();
                    break;
                }
                Some(c) => {
                    body.push(c);
                    self.bump();
                }
            }
        }
        let mut lines = Vec::new();
        for (i, line) in body.lines().enumerate() {
            let trimmed = line.trim_start();
            if i == 0 && trimmed.is_empty() {
                continue;
            }
            match trimmed.strip_prefix('*') {
                Some(rest) => lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string()),
                None if trimmed.is_empty() => lines.push(String::new()),
                None => {
                    return Token::new(
                        TokenKind::Illegal("malformed doc comment".to_string()),
                        pos,
                    );
                }
            }
        }
        while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        Token::new(TokenKind::DocComment(lines.join("\n")), pos)
    }

    fn skip_block_comment_tail(&mut self) {
        while let Some(c) = self.peek() {
            if c == '*' && self.peek_at(1) == Some('/') {
                self.bump();
                self.bump();
                return;
            }
            self.bump();
        }
    }

    fn next_default_token(&mut self) -> Token {
        if let Some(token) = self.skip_trivia() {
            return token;
        }
        let pos = self.here();
        let c = match self.peek() {
            Some(c) => c,
            None => return Token::new(TokenKind::Eof, pos),
        };

        if c == '\n' {
            self.bump();
            return Token::new(TokenKind::Newline, pos);
        }

        // `}}` at interpolation depth zero closes the interpolation.
        if c == '}' {
            if let Mode::Default { brace_depth } = self.modes.last().copied().unwrap() {
                if brace_depth == 0 && self.modes.len() > 1 && self.peek_at(1) == Some('}') {
                    self.bump();
                    self.bump();
                    self.modes.pop();
                    return Token::new(TokenKind::InterpEnd, pos);
                }
            }
        }

        if c.is_ascii_digit() {
            return self.read_number(pos);
        }
        if c == '_' || c.is_alphabetic() {
            return self.read_ident(pos);
        }
        if c == '"' {
            return self.read_string_start(pos);
        }

        self.bump();
        let kind = match c {
            '+' => {
                if self.eat(':') {
                    TokenKind::PrependOp
                } else {
                    TokenKind::Plus
                }
            }
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => {
                if self.eat('>') {
                    TokenKind::PipeCall
                } else {
                    TokenKind::Slash
                }
            }
            '%' => TokenKind::Percent,
            '=' => {
                if self.eat('=') {
                    TokenKind::Eq
                } else if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::LtEq
                } else if self.eat('<') {
                    TokenKind::Shl
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::GtEq
                } else if self.eat('>') {
                    TokenKind::Shr
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.eat('&') {
                    TokenKind::AndAnd
                } else {
                    TokenKind::Amp
                }
            }
            '|' => {
                if self.eat('|') {
                    TokenKind::OrOr
                } else {
                    TokenKind::Pipe
                }
            }
            '^' => TokenKind::Caret,
            '~' => TokenKind::Tilde,
            '.' => {
                if self.peek() == Some('.') && self.peek_at(1) == Some('.') {
                    self.bump();
                    self.bump();
                    TokenKind::Ellipsis
                } else {
                    TokenKind::Dot
                }
            }
            ':' => {
                if self.eat('+') {
                    TokenKind::AppendOp
                } else if self.peek() == Some('"') {
                    self.bump();
                    return self.read_quoted_symbol(pos);
                } else if self
                    .peek()
                    .map(|c| c == '_' || c.is_alphabetic())
                    .unwrap_or(false)
                {
                    return self.read_symbol(pos);
                } else {
                    TokenKind::Colon
                }
            }
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => {
                if let Some(Mode::Default { brace_depth }) = self.modes.last_mut() {
                    *brace_depth += 1;
                }
                TokenKind::LBrace
            }
            '}' => {
                if let Some(Mode::Default { brace_depth }) = self.modes.last_mut() {
                    *brace_depth = brace_depth.saturating_sub(1);
                }
                TokenKind::RBrace
            }
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '@' => TokenKind::At,
            other => TokenKind::Illegal(format!("unexpected character '{}'", other)),
        };
        Token::new(kind, pos)
    }

    fn read_number(&mut self, pos: Position) -> Token {
        // Hex number `0x1F` or bytes literal `0x"…"`.
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            if self.peek_at(2) == Some('"') {
                self.bump();
                self.bump();
                self.bump();
                return self.read_bytes_literal(pos);
            }
            if self.peek_at(2).map(|c| c.is_ascii_hexdigit()).unwrap_or(false) {
                let mut text = String::from("0x");
                self.bump();
                self.bump();
                while let Some(c) = self.peek() {
                    if c.is_ascii_hexdigit() {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                return Token::new(TokenKind::Number(text), pos);
            }
        }
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.')
            && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
        {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        Token::new(TokenKind::Number(text), pos)
    }

    fn read_bytes_literal(&mut self, pos: Position) -> Token {
        let mut hex = String::new();
        loop {
            match self.peek() {
                None => {
                    return Token::new(
                        TokenKind::Illegal("unterminated bytes literal".to_string()),
                        pos,
                    );
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some(' ') | Some('\t') => {
                    self.bump();
                }
                Some(c) if c.is_ascii_hexdigit() => {
                    hex.push(c);
                    self.bump();
                }
                Some(c) => {
                    self.bump();
                    return Token::new(
                        TokenKind::Illegal(format!("bad hex digit '{}' in bytes literal", c)),
                        pos,
                    );
                }
            }
        }
        if hex.len() % 2 != 0 {
            return Token::new(
                TokenKind::Illegal("odd-length bytes literal".to_string()),
                pos,
            );
        }
        Token::new(TokenKind::Bytes(hex), pos)
    }

    fn read_ident(&mut self, pos: Position) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if word == "_" {
            return Token::new(TokenKind::Underscore, pos);
        }
        match TokenKind::keyword(&word) {
            Some(kind) => Token::new(kind, pos),
            None => Token::new(TokenKind::Ident(word), pos),
        }
    }

    fn read_symbol(&mut self, pos: Position) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token::new(TokenKind::Symbol(name), pos)
    }

    fn read_quoted_symbol(&mut self, pos: Position) -> Token {
        let mut name = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Token::new(
                        TokenKind::Illegal("unterminated symbol literal".to_string()),
                        pos,
                    );
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    match self.read_escape() {
                        Ok(c) => name.push(c),
                        Err(msg) => return Token::new(TokenKind::Illegal(msg), pos),
                    }
                }
                Some(c) => {
                    name.push(c);
                    self.bump();
                }
            }
        }
        Token::new(TokenKind::Symbol(name), pos)
    }

    fn read_string_start(&mut self, pos: Position) -> Token {
        self.bump(); // opening quote
        let multiline = self.peek() == Some('"') && self.peek_at(1) == Some('"');
        if multiline {
            self.bump();
            self.bump();
            // A newline directly after `"""` is not part of the content.
            if self.peek() == Some('\n') {
                self.bump();
            }
        }
        self.modes.push(Mode::Str { multiline });
        Token::new(TokenKind::StrStart { multiline }, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::tokenize(source)
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("== != <= >= && || << >> => ... +: :+ />"),
            vec![
                TokenKind::Eq,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Arrow,
                TokenKind::Ellipsis,
                TokenKind::PrependOp,
                TokenKind::AppendOp,
                TokenKind::PipeCall,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_underscore_vs_ident() {
        assert_eq!(
            kinds("_ _x x_1"),
            vec![
                TokenKind::Underscore,
                TokenKind::Ident("_x".to_string()),
                TokenKind::Ident("x_1".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_bytes() {
        assert_eq!(
            kinds("42 1.5 0xFF 0x\"DEAD BEEF\""),
            vec![
                TokenKind::Number("42".to_string()),
                TokenKind::Number("1.5".to_string()),
                TokenKind::Number("0xFF".to_string()),
                TokenKind::Bytes("DEADBEEF".to_string()),
                TokenKind::Eof,
            ]
        );
        assert!(matches!(
            kinds("0x\"ABC\"")[0],
            TokenKind::Illegal(_)
        ));
    }

    #[test]
    fn test_symbols() {
        assert_eq!(
            kinds(":ok :\"two words\""),
            vec![
                TokenKind::Symbol("ok".to_string()),
                TokenKind::Symbol("two words".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_interpolation_modes() {
        assert_eq!(
            kinds("\"a{{x}}b\""),
            vec![
                TokenKind::StrStart { multiline: false },
                TokenKind::StrPart("a".to_string()),
                TokenKind::InterpStart,
                TokenKind::Ident("x".to_string()),
                TokenKind::InterpEnd,
                TokenKind::StrPart("b".to_string()),
                TokenKind::StrEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_interpolation_with_nested_braces() {
        let toks = kinds("\"v={{ {a: 1} }}\"");
        assert!(toks.contains(&TokenKind::InterpStart));
        assert!(toks.contains(&TokenKind::LBrace));
        assert!(toks.contains(&TokenKind::InterpEnd));
    }

    #[test]
    fn test_escapes() {
        assert_eq!(
            kinds(r#""a\n\t\"\{\101""#),
            vec![
                TokenKind::StrStart { multiline: false },
                TokenKind::StrPart("a\n\t\"{A".to_string()),
                TokenKind::StrEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_multiline_string() {
        let toks = kinds("\"\"\"\nline1\nline2\n\"\"\"");
        assert_eq!(toks[0], TokenKind::StrStart { multiline: true });
        assert_eq!(toks[1], TokenKind::StrPart("line1\nline2\n".to_string()));
        assert_eq!(toks[2], TokenKind::StrEnd);
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            kinds("1 // comment\n2 # another\n3"),
            vec![
                TokenKind::Number("1".to_string()),
                TokenKind::Newline,
                TokenKind::Number("2".to_string()),
                TokenKind::Newline,
                TokenKind::Number("3".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_doc_comments() {
        let toks = kinds("/**\n * Adds things.\n * Second line.\n */");
        assert_eq!(
            toks[0],
            TokenKind::DocComment("Adds things.\nSecond line.".to_string())
        );
        assert!(matches!(
            kinds("/**\n no star prefix\n */")[0],
            TokenKind::Illegal(_)
        ));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("val var fn recur nil"),
            vec![
                TokenKind::Val,
                TokenKind::Var,
                TokenKind::Fn,
                TokenKind::Recur,
                TokenKind::Nil,
                TokenKind::Eof,
            ]
        );
        // contextual keywords stay identifiers
        assert_eq!(
            kinds("recv limit")[0],
            TokenKind::Ident("recv".to_string())
        );
    }

    #[test]
    fn test_positions() {
        let toks = Lexer::tokenize("a\n  b");
        assert_eq!(toks[0].pos, Position { line: 1, col: 1 });
        assert_eq!(toks[2].pos, Position { line: 2, col: 3 });
    }
}
