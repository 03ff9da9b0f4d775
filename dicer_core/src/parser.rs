//! Lexer and recursive-descent parser for oracle rule text.
//!
//! The language is a small indentation-structured rule syntax:
//!
//! ```text
//! if size Is Integer:
//!     if size Gt 0:
//!         return success()
//!     else:
//!         return fail("size must be positive")
//! ```
//!
//! A block is either an indented run of statements or one inline statement
//! after the colon, so the example above may also be written on one line. An
//! inline `else` binds to the innermost `if`.

use crate::trace::Verdict;
use crate::value::{FieldPath, Value};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Is,
    IsNot,
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
}

impl CmpOp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Is" => Some(CmpOp::Is),
            "IsNot" => Some(CmpOp::IsNot),
            "Eq" => Some(CmpOp::Eq),
            "NotEq" => Some(CmpOp::NotEq),
            "Lt" => Some(CmpOp::Lt),
            "LtE" => Some(CmpOp::LtE),
            "Gt" => Some(CmpOp::Gt),
            "GtE" => Some(CmpOp::GtE),
            "In" => Some(CmpOp::In),
            "NotIn" => Some(CmpOp::NotIn),
            _ => None,
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::NotEq),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::LtE),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::GtE),
            _ => None,
        }
    }

    /// Logical complement used when compiling the `else` side of a branch.
    pub fn negated(self) -> Self {
        match self {
            CmpOp::Is => CmpOp::IsNot,
            CmpOp::IsNot => CmpOp::Is,
            CmpOp::Eq => CmpOp::NotEq,
            CmpOp::NotEq => CmpOp::Eq,
            CmpOp::Lt => CmpOp::GtE,
            CmpOp::GtE => CmpOp::Lt,
            CmpOp::Gt => CmpOp::LtE,
            CmpOp::LtE => CmpOp::Gt,
            CmpOp::In => CmpOp::NotIn,
            CmpOp::NotIn => CmpOp::In,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CmpOp::Is => "Is",
            CmpOp::IsNot => "IsNot",
            CmpOp::Eq => "Eq",
            CmpOp::NotEq => "NotEq",
            CmpOp::Lt => "Lt",
            CmpOp::LtE => "LtE",
            CmpOp::Gt => "Gt",
            CmpOp::GtE => "GtE",
            CmpOp::In => "In",
            CmpOp::NotIn => "NotIn",
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A helper call argument: an item field read at solve time, or a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Field(FieldPath),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Argument>,
}

/// Right-hand side of a comparison. `Name` is a bare identifier (a symbol type in
/// oracles, a status word in preconditions) and is resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Name(String),
    Literal(Value),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub left: FieldPath,
    pub op: CmpOp,
    pub right: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    Compare(Comparison),
    Any(Comparison),
    All(Comparison),
}

impl Test {
    pub fn comparison(&self) -> &Comparison {
        match self {
            Test::Compare(cmp) | Test::Any(cmp) | Test::All(cmp) => cmp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    If {
        test: Test,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    Assert(Test),
    Return(Verdict),
}

pub(crate) fn fmt_literal(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Int(n) => write!(f, "{n}"),
        Value::List(items) => {
            f.write_str("[")?;
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                fmt_literal(item, f)?;
            }
            f.write_str("]")
        }
        other => write!(f, "{:?}", other.to_string()),
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Field(path) => write!(f, "{path}"),
            Argument::Literal(value) => fmt_literal(value, f),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Name(name) => f.write_str(name),
            Operand::Literal(value) => fmt_literal(value, f),
            Operand::Call(call) => {
                write!(f, "{}(", call.name)?;
                for (idx, arg) in call.args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op, self.right)
    }
}

impl fmt::Display for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Test::Compare(cmp) => write!(f, "{cmp}"),
            Test::Any(cmp) => write!(f, "any({cmp})"),
            Test::All(cmp) => write!(f, "all({cmp})"),
        }
    }
}

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "return", "assert", "is", "not", "in", "any", "all",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Path(String),
    Int(i64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Newline,
    Indent,
    Dedent,
    Eof,
}

static EOF: Tok = Tok::Eof;

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    line_start: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    nesting: usize,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().filter(|c| *c != '\r').collect(),
            pos: 0,
            line: 1,
            line_start: 0,
            tokens: Vec::new(),
            indents: vec![0],
            nesting: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.pos - self.line_start + 1,
            message: message.into(),
        }
    }

    fn push(&mut self, tok: Tok, column: usize) {
        self.tokens.push(Token {
            tok,
            line: self.line,
            column,
        });
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.nesting == 0 {
                at_line_start = false;
                if !self.handle_indentation()? {
                    at_line_start = true;
                    continue;
                }
            }
            let c = self.chars[self.pos];
            let column = self.pos - self.line_start + 1;
            match c {
                '\n' => {
                    if self.nesting == 0 {
                        self.push(Tok::Newline, column);
                    }
                    self.pos += 1;
                    self.line += 1;
                    self.line_start = self.pos;
                    at_line_start = self.nesting == 0;
                }
                ' ' | '\t' => self.pos += 1,
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '(' | '[' => {
                    self.nesting += 1;
                    self.push(if c == '(' { Tok::LParen } else { Tok::LBracket }, column);
                    self.pos += 1;
                }
                ')' | ']' => {
                    self.nesting = self
                        .nesting
                        .checked_sub(1)
                        .ok_or_else(|| self.error(format!("unbalanced '{c}'")))?;
                    self.push(if c == ')' { Tok::RParen } else { Tok::RBracket }, column);
                    self.pos += 1;
                }
                ',' => {
                    self.push(Tok::Comma, column);
                    self.pos += 1;
                }
                ':' => {
                    self.push(Tok::Colon, column);
                    self.pos += 1;
                }
                '"' | '\'' => {
                    let s = self.lex_string(c)?;
                    self.push(Tok::Str(s), column);
                }
                '/' => {
                    let path = self.lex_path()?;
                    self.push(Tok::Path(path), column);
                }
                '-' if self.peek_next().is_some_and(|n| n.is_ascii_digit()) => {
                    self.pos += 1;
                    let n = self.lex_int(true)?;
                    self.push(Tok::Int(n), column);
                }
                c if c.is_ascii_digit() => {
                    let n = self.lex_int(false)?;
                    self.push(Tok::Int(n), column);
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let ident = self.lex_ident();
                    self.push(Tok::Ident(ident), column);
                }
                '=' | '!' | '<' | '>' => {
                    let op = self.lex_op()?;
                    self.push(Tok::Op(op), column);
                }
                other => return Err(self.error(format!("unexpected character '{other}'"))),
            }
        }
        if self.nesting > 0 {
            return Err(self.error("unclosed bracket at end of oracle"));
        }
        let column = self.pos - self.line_start + 1;
        if !matches!(self.tokens.last().map(|t| &t.tok), None | Some(Tok::Newline)) {
            self.push(Tok::Newline, column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, column);
        }
        self.push(Tok::Eof, column);
        Ok(self.tokens)
    }

    /// Measures leading whitespace and emits layout tokens. Returns false for
    /// blank and comment-only lines, which carry no layout.
    fn handle_indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0;
        let mut cursor = self.pos;
        while let Some(c) = self.chars.get(cursor) {
            match c {
                ' ' => width += 1,
                '\t' => width += 8 - width % 8,
                _ => break,
            }
            cursor += 1;
        }
        match self.chars.get(cursor) {
            None | Some('\n') | Some('#') => {
                while self.chars.get(cursor).is_some_and(|c| *c != '\n') {
                    cursor += 1;
                }
                self.pos = cursor;
                if self.pos < self.chars.len() {
                    self.pos += 1;
                    self.line += 1;
                    self.line_start = self.pos;
                }
                return Ok(false);
            }
            _ => {}
        }
        self.pos = cursor;
        let column = width + 1;
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, column);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent, column);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("dedent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn lex_string(&mut self, quote: char) -> Result<String, ParseError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self
                .peek()
                .filter(|c| *c != '\n')
                .ok_or_else(|| self.error("unterminated string literal"))?;
            self.pos += 1;
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self
                .peek()
                .ok_or_else(|| self.error("unterminated escape sequence"))?;
            self.pos += 1;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' => out.push(escaped),
                'x' => {
                    let hex: String = self.chars.iter().skip(self.pos).take(2).collect();
                    let code = u8::from_str_radix(&hex, 16)
                        .map_err(|_| self.error(format!("invalid \\x escape '{hex}'")))?;
                    out.push(code as char);
                    self.pos += 2;
                }
                other => return Err(self.error(format!("unknown escape '\\{other}'"))),
            }
        }
    }

    fn lex_path(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c == '/' || c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            self.pos += 1;
        }
        let path: String = self.chars[start..self.pos].iter().collect();
        if path.len() < 2 || path.ends_with('/') {
            return Err(self.error(format!("malformed field path '{path}'")));
        }
        Ok(path)
    }

    fn lex_int(&mut self, negative: bool) -> Result<i64, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        let text = if negative {
            format!("-{digits}")
        } else {
            digits
        };
        text.parse::<i64>()
            .map_err(|_| self.error(format!("integer literal {text} out of range")))
    }

    fn lex_ident(&mut self) -> String {
        let start = self.pos;
        loop {
            while let Some(c) = self.peek() {
                let hyphen = c == '-'
                    && self
                        .peek_next()
                        .is_some_and(|n| n.is_ascii_alphanumeric() || n == '_');
                if !(c.is_ascii_alphanumeric() || c == '_' || hyphen) {
                    break;
                }
                self.pos += 1;
            }
            let dotted = self.peek() == Some('.')
                && self
                    .peek_next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if !dotted {
                break;
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn lex_op(&mut self) -> Result<&'static str, ParseError> {
        let pair: String = self.chars.iter().skip(self.pos).take(2).collect();
        let op = match pair.as_str() {
            "==" => "==",
            "!=" => "!=",
            "<=" => "<=",
            ">=" => ">=",
            _ => match self.chars[self.pos] {
                '<' => "<",
                '>' => ">",
                other => return Err(self.error(format!("unexpected character '{other}'"))),
            },
        };
        self.pos += op.len();
        Ok(op)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: Lexer::new(src).tokenize()?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map_or(&EOF, |t| &t.tok)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let (line, column) = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or((1, 1), |t| (t.line, t.column));
        ParseError {
            line,
            column,
            message: message.into(),
        }
    }

    fn is_keyword(&self, offset: usize, keyword: &str) -> bool {
        matches!(self.peek_at(offset), Tok::Ident(name) if name == keyword)
    }

    fn expect(&mut self, expected: Tok, what: &str) -> Result<(), ParseError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", describe(self.peek()))))
        }
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Tok::Newline {
            self.advance();
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::Indent => return Err(self.error("unexpected indentation")),
                _ => {
                    stmts.push(self.parse_stmt()?);
                    self.end_of_statement()?;
                }
            }
        }
        if stmts.is_empty() {
            return Err(self.error("oracle is empty"));
        }
        Ok(stmts)
    }

    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        // An indented block already ended the statement.
        if self.pos > 0 && self.tokens[self.pos - 1].tok == Tok::Dedent {
            return Ok(());
        }
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Dedent | Tok::Eof => Ok(()),
            other => Err(self.error(format!("expected end of line, found {}", describe(other)))),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        if self.is_keyword(0, "if") {
            return self.parse_if();
        }
        if self.is_keyword(0, "return") {
            return self.parse_return();
        }
        if self.is_keyword(0, "assert") {
            self.advance();
        }
        Ok(Stmt::Assert(self.parse_test()?))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        let test = self.parse_test()?;
        self.expect(Tok::Colon, "':' after if condition")?;
        let body = self.parse_suite()?;

        let continues = |p: &Parser, offset: usize| p.is_keyword(offset, "else") || p.is_keyword(offset, "elif");
        if *self.peek() == Tok::Newline && continues(self, 1) {
            self.advance();
        }
        let orelse = if self.is_keyword(0, "elif") {
            vec![self.parse_if()?]
        } else if self.is_keyword(0, "else") {
            self.advance();
            self.expect(Tok::Colon, "':' after else")?;
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If { test, body, orelse })
    }

    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if *self.peek() != Tok::Newline {
            return Ok(vec![self.parse_stmt()?]);
        }
        self.skip_newlines();
        self.expect(Tok::Indent, "an indented block")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                _ => {
                    stmts.push(self.parse_stmt()?);
                    self.end_of_statement()?;
                }
            }
        }
        Ok(stmts)
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        let verdict = match self.advance() {
            Tok::Ident(name) if name == "success" => {
                self.expect(Tok::LParen, "'(' after success")?;
                Verdict::Pass
            }
            Tok::Ident(name) if name == "fail" => {
                self.expect(Tok::LParen, "'(' after fail")?;
                match self.peek().clone() {
                    Tok::Str(pattern) => {
                        self.advance();
                        Verdict::Fail(Some(pattern))
                    }
                    _ => Verdict::Fail(None),
                }
            }
            other => {
                self.pos -= 1;
                return Err(self.error(format!(
                    "return must call success() or fail(), found {}",
                    describe(&other)
                )));
            }
        };
        self.expect(Tok::RParen, "')' closing the verdict")?;
        Ok(Stmt::Return(verdict))
    }

    fn parse_test(&mut self) -> Result<Test, ParseError> {
        for (keyword, wrap) in [
            ("any", Test::Any as fn(Comparison) -> Test),
            ("all", Test::All as fn(Comparison) -> Test),
        ] {
            if self.is_keyword(0, keyword) && *self.peek_at(1) == Tok::LParen {
                self.advance();
                self.advance();
                let cmp = self.parse_comparison()?;
                self.expect(Tok::RParen, "')' closing the quantifier")?;
                return Ok(wrap(cmp));
            }
        }
        Ok(Test::Compare(self.parse_comparison()?))
    }

    fn parse_comparison(&mut self) -> Result<Comparison, ParseError> {
        let left = self.parse_field("a variable")?;
        let op = self.parse_op()?;
        let right = self.parse_operand()?;
        Ok(Comparison { left, op, right })
    }

    fn parse_field(&mut self, what: &str) -> Result<FieldPath, ParseError> {
        let raw = match self.peek() {
            Tok::Ident(name) if !KEYWORDS.contains(&name.as_str()) => name.clone(),
            Tok::Path(path) => path.clone(),
            other => return Err(self.error(format!("expected {what}, found {}", describe(other)))),
        };
        let path = raw
            .parse::<FieldPath>()
            .map_err(|e| self.error(e.to_string()))?;
        self.advance();
        Ok(path)
    }

    fn parse_op(&mut self) -> Result<CmpOp, ParseError> {
        let op = match self.peek().clone() {
            Tok::Ident(word) if word == "is" => {
                self.advance();
                if self.is_keyword(0, "not") {
                    self.advance();
                    return Ok(CmpOp::IsNot);
                }
                return Ok(CmpOp::Is);
            }
            Tok::Ident(word) if word == "not" => {
                self.advance();
                if !self.is_keyword(0, "in") {
                    return Err(self.error("expected 'in' after 'not'"));
                }
                CmpOp::NotIn
            }
            Tok::Ident(word) if word == "in" => CmpOp::In,
            Tok::Ident(word) => CmpOp::from_name(&word)
                .ok_or_else(|| self.error(format!("unknown operator '{word}'")))?,
            Tok::Op(symbol) => CmpOp::from_symbol(symbol)
                .ok_or_else(|| self.error(format!("unknown operator '{symbol}'")))?,
            other => {
                return Err(self.error(format!(
                    "expected a comparison operator, found {}",
                    describe(&other)
                )));
            }
        };
        self.advance();
        Ok(op)
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        match self.peek().clone() {
            Tok::Int(_) | Tok::Str(_) | Tok::LBracket => Ok(Operand::Literal(self.parse_literal()?)),
            Tok::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                if *self.peek() != Tok::LParen {
                    return Ok(Operand::Name(name));
                }
                self.advance();
                let mut args = Vec::new();
                while *self.peek() != Tok::RParen {
                    args.push(self.parse_argument()?);
                    if *self.peek() != Tok::Comma {
                        break;
                    }
                    self.advance();
                }
                self.expect(Tok::RParen, "')' closing the call")?;
                Ok(Operand::Call(Call { name, args }))
            }
            other => Err(self.error(format!(
                "expected a type name, literal or call, found {}",
                describe(&other)
            ))),
        }
    }

    fn parse_argument(&mut self) -> Result<Argument, ParseError> {
        match self.peek() {
            Tok::Ident(_) | Tok::Path(_) => Ok(Argument::Field(self.parse_field("an argument")?)),
            _ => Ok(Argument::Literal(self.parse_literal()?)),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, ParseError> {
        match self.peek().clone() {
            Tok::Int(n) => {
                self.advance();
                Ok(Value::Int(n))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Value::Str(s))
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while *self.peek() != Tok::RBracket {
                    items.push(self.parse_literal()?);
                    if *self.peek() != Tok::Comma {
                        break;
                    }
                    self.advance();
                }
                self.expect(Tok::RBracket, "']' closing the list")?;
                Ok(Value::List(items))
            }
            other => Err(self.error(format!("expected a literal, found {}", describe(&other)))),
        }
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(name) => format!("'{name}'"),
        Tok::Path(path) => format!("'{path}'"),
        Tok::Int(n) => format!("'{n}'"),
        Tok::Str(s) => format!("{s:?}"),
        Tok::Op(op) => format!("'{op}'"),
        Tok::LParen => "'('".to_string(),
        Tok::RParen => "')'".to_string(),
        Tok::LBracket => "'['".to_string(),
        Tok::RBracket => "']'".to_string(),
        Tok::Comma => "','".to_string(),
        Tok::Colon => "':'".to_string(),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indentation".to_string(),
        Tok::Dedent => "end of block".to_string(),
        Tok::Eof => "end of oracle".to_string(),
    }
}

/// Parses a whole oracle into its statement list.
pub fn parse_oracle(src: &str) -> Result<Vec<Stmt>, ParseError> {
    Parser::new(src)?.parse_program()
}

/// Parses exactly one comparison, as used by constraint preconditions.
pub fn parse_comparison(src: &str) -> Result<Comparison, ParseError> {
    let mut parser = Parser::new(src)?;
    parser.skip_newlines();
    let cmp = parser.parse_comparison()?;
    parser.skip_newlines();
    if *parser.peek() != Tok::Eof {
        return Err(parser.error(format!(
            "expected a single comparison, found trailing {}",
            describe(parser.peek())
        )));
    }
    Ok(cmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> FieldPath {
        name.parse().unwrap()
    }

    fn cmp(left: &str, op: CmpOp, right: Operand) -> Comparison {
        Comparison {
            left: var(left),
            op,
            right,
        }
    }

    #[test]
    fn parses_inline_nested_if_with_dangling_else() {
        let stmts = parse_oracle(
            "if x Is Integer: if x Gt 0: return success() else: return fail(\"neg\")",
        )
        .unwrap();
        assert_eq!(
            stmts,
            vec![Stmt::If {
                test: Test::Compare(cmp("x", CmpOp::Is, Operand::Name("Integer".into()))),
                body: vec![Stmt::If {
                    test: Test::Compare(cmp("x", CmpOp::Gt, Operand::Literal(Value::Int(0)))),
                    body: vec![Stmt::Return(Verdict::Pass)],
                    orelse: vec![Stmt::Return(Verdict::Fail(Some("neg".into())))],
                }],
                orelse: vec![],
            }]
        );
    }

    #[test]
    fn parses_indented_blocks_and_elif() {
        let src = "\
# leading comment
if size is Integer:
    if size > 10:
        return fail('too big')
    elif size < 0:
        return fail()

    return success()
else:
    return fail(\"not a number\")
";
        let stmts = parse_oracle(src).unwrap();
        assert_eq!(stmts.len(), 1);
        let Stmt::If { body, orelse, .. } = &stmts[0] else {
            panic!("expected an if statement, got {stmts:?}");
        };
        assert_eq!(body.len(), 2, "nested if plus trailing return");
        assert!(matches!(&body[0], Stmt::If { orelse, .. } if matches!(orelse.as_slice(), [Stmt::If { .. }])));
        assert_eq!(
            orelse,
            &vec![Stmt::Return(Verdict::Fail(Some("not a number".into())))]
        );
    }

    #[test]
    fn symbolic_and_named_operators_agree() {
        let pairs = [
            ("x is Integer", CmpOp::Is),
            ("x is not Integer", CmpOp::IsNot),
            ("x == 1", CmpOp::Eq),
            ("x != 1", CmpOp::NotEq),
            ("x < 1", CmpOp::Lt),
            ("x <= 1", CmpOp::LtE),
            ("x > 1", CmpOp::Gt),
            ("x >= 1", CmpOp::GtE),
            ("x in [1]", CmpOp::In),
            ("x not in [1]", CmpOp::NotIn),
            ("x NotIn [1]", CmpOp::NotIn),
            ("x LtE 1", CmpOp::LtE),
        ];
        for (src, op) in pairs {
            assert_eq!(parse_comparison(src).unwrap().op, op, "operator of {src:?}");
        }
    }

    #[test]
    fn parses_calls_paths_and_literal_lists() {
        let parsed = parse_comparison("/disk/format In fs.formats(/disk/kind, 3, \"a\")").unwrap();
        assert_eq!(parsed.left, var("disk.format"));
        assert_eq!(
            parsed.right,
            Operand::Call(Call {
                name: "fs.formats".into(),
                args: vec![
                    Argument::Field(var("disk.kind")),
                    Argument::Literal(Value::Int(3)),
                    Argument::Literal(Value::from("a")),
                ],
            })
        );

        let list = parse_comparison("mode not in ['a', -2, [1]]").unwrap();
        assert_eq!(
            list.right,
            Operand::Literal(Value::List(vec![
                Value::from("a"),
                Value::Int(-2),
                Value::List(vec![Value::Int(1)]),
            ]))
        );
    }

    #[test]
    fn hyphenated_names_lex_like_field_paths() {
        let parsed = parse_comparison("disk-size Gt -1").unwrap();
        assert_eq!(parsed.left, var("disk-size"));
        assert_eq!(parsed.right, Operand::Literal(Value::Int(-1)));

        let dotted = parse_comparison("meta.disk-label In [\"a\"]").unwrap();
        assert_eq!(dotted.left, var("meta.disk-label"));

        assert!(parse_comparison("size- Gt 1").is_err());
    }

    #[test]
    fn parses_quantified_tests_and_assertions() {
        let stmts = parse_oracle("assert all(tags In known.tags())\nany(tags NotIn [\"x\"])").unwrap();
        assert!(matches!(&stmts[0], Stmt::Assert(Test::All(_))));
        assert!(matches!(&stmts[1], Stmt::Assert(Test::Any(_))));
    }

    #[test]
    fn display_round_trips_through_parser() {
        let src = "any(a.b In helpers.list(c, 1, \"s\"))";
        let stmts = parse_oracle(src).unwrap();
        let Stmt::Assert(test) = &stmts[0] else {
            panic!("expected assertion");
        };
        assert_eq!(test.to_string(), "any(a.b In helpers.list(c, 1, \"s\"))");
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = parse_comparison("x Like 3").unwrap_err();
        assert!(err.message.contains("unknown operator 'Like'"), "{err}");
    }

    #[test]
    fn rejects_bad_return_and_trailing_tokens() {
        assert!(parse_oracle("return maybe()").is_err());
        assert!(parse_oracle("if x Is Integer return success()").is_err());
        assert!(parse_comparison("x Is Integer y").is_err());
    }

    #[test]
    fn rejects_inconsistent_dedent() {
        let src = "if x Is Integer:\n        return success()\n    return fail()\n";
        let err = parse_oracle(src).unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn rejects_empty_oracle() {
        assert!(parse_oracle("  \n# nothing\n").is_err());
    }

    #[test]
    fn reports_line_of_unterminated_string() {
        let err = parse_oracle("if x Is Integer:\n    return fail(\"oops)\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }
}
