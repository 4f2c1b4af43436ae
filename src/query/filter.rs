//! Backend-style filter compiler.
//!
//! Compiles filter strings such as
//! `tags ?~ "flutter" && created >= @todayStart && name:lower = "alpha"`
//! into parameterized SQL predicates over the `services` table. Every
//! literal is bound as a parameter; field references resolve either to the
//! system columns (`id`, `created`, `updated`) or to
//! `json_extract(data, '$.path')`, which safely yields NULL for unknown
//! fields.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

use crate::error::{Error, Result};
use crate::time::to_iso;

// ============================================================================
// Bound parameters
// ============================================================================

/// A literal bound into the generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
    Null,
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlParam::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlParam::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlParam::Null => ToSqlOutput::Borrowed(ValueRef::Null),
        })
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Lower,
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Field {
        path: Vec<String>,
        modifier: Option<Modifier>,
    },
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    AnyEq,
    AnyNe,
    AnyGt,
    AnyGe,
    AnyLt,
    AnyLe,
    AnyLike,
    AnyNotLike,
}

impl CmpOp {
    fn is_any(self) -> bool {
        matches!(
            self,
            CmpOp::AnyEq
                | CmpOp::AnyNe
                | CmpOp::AnyGt
                | CmpOp::AnyGe
                | CmpOp::AnyLt
                | CmpOp::AnyLe
                | CmpOp::AnyLike
                | CmpOp::AnyNotLike
        )
    }

    /// The plain comparison this op applies (any-of ops apply it per element).
    fn base(self) -> CmpOp {
        match self {
            CmpOp::AnyEq => CmpOp::Eq,
            CmpOp::AnyNe => CmpOp::Ne,
            CmpOp::AnyGt => CmpOp::Gt,
            CmpOp::AnyGe => CmpOp::Ge,
            CmpOp::AnyLt => CmpOp::Lt,
            CmpOp::AnyLe => CmpOp::Le,
            CmpOp::AnyLike => CmpOp::Like,
            CmpOp::AnyNotLike => CmpOp::NotLike,
            other => other,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Like => "LIKE",
            CmpOp::NotLike => "NOT LIKE",
            any => any.base().sql(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Cmp {
        lhs: Atom,
        op: CmpOp,
        rhs: Atom,
    },
}

// ============================================================================
// Compiled output
// ============================================================================

/// A parsed filter together with its SQL rendering.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub expr: FilterExpr,
}

/// Compile a filter string. Date macros are resolved against `now`.
pub fn compile(input: &str, now: DateTime<Utc>) -> Result<CompiledFilter> {
    let expr = parse(input, now)?;
    let mut sql = String::new();
    let mut params = Vec::new();
    emit(&expr, &mut sql, &mut params);
    Ok(CompiledFilter { sql, params, expr })
}

/// Parse a filter string into its expression tree.
pub fn parse(input: &str, now: DateTime<Utc>) -> Result<FilterExpr> {
    let stripped = strip_comments(input);
    let tokens = lex(&stripped)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        now,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::Parse(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

// ============================================================================
// Comment stripping
// ============================================================================

/// Remove `// …` line comments, respecting string literals.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_str: Option<char> = None;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if let Some(quote) = in_str {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_str = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                in_str = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>, Option<Modifier>),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Macro(String),
    And,
    Or,
    LParen,
    RParen,
    Op(CmpOp),
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(Error::Parse("expected '&&'".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(Error::Parse("expected '||'".into()));
                }
            }
            '\'' | '"' => {
                let (s, next) = lex_string(&chars, i, c)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '@' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric()) {
                    end += 1;
                }
                if end == start {
                    return Err(Error::Parse("empty macro name after '@'".into()));
                }
                tokens.push(Token::Macro(chars[start..end].iter().collect()));
                i = end;
            }
            '?' | '!' | '=' | '>' | '<' | '~' => {
                let (op, next) = lex_op(&chars, i)?;
                tokens.push(Token::Op(op));
                i = next;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let (token, next) = lex_number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (token, next) = lex_word(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            other => return Err(Error::Parse(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize, quote: char) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if let Some(&next) = chars.get(i + 1) {
                out.push(next);
                i += 2;
                continue;
            }
            return Err(Error::Parse("dangling escape in string literal".into()));
        }
        if c == quote {
            return Ok((out, i + 1));
        }
        out.push(c);
        i += 1;
    }
    Err(Error::Parse("unterminated string literal".into()))
}

fn lex_op(chars: &[char], start: usize) -> Result<(CmpOp, usize)> {
    // Longest match first.
    const OPS: &[(&str, CmpOp)] = &[
        ("?!~", CmpOp::AnyNotLike),
        ("?!=", CmpOp::AnyNe),
        ("?>=", CmpOp::AnyGe),
        ("?<=", CmpOp::AnyLe),
        ("?~", CmpOp::AnyLike),
        ("?=", CmpOp::AnyEq),
        ("?>", CmpOp::AnyGt),
        ("?<", CmpOp::AnyLt),
        ("!~", CmpOp::NotLike),
        ("!=", CmpOp::Ne),
        (">=", CmpOp::Ge),
        ("<=", CmpOp::Le),
        ("~", CmpOp::Like),
        ("=", CmpOp::Eq),
        (">", CmpOp::Gt),
        ("<", CmpOp::Lt),
    ];
    let rest: String = chars[start..chars.len().min(start + 3)].iter().collect();
    for (text, op) in OPS {
        if rest.starts_with(text) {
            return Ok((*op, start + text.len()));
        }
    }
    Err(Error::Parse(format!("invalid operator near '{rest}'")))
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize)> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    let digits_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i == digits_start {
        return Err(Error::Parse("expected digits after '-'".into()));
    }
    let mut is_float = false;
    if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text: String = chars[start..i].iter().collect();
    let token = if is_float {
        Token::Float(
            text.parse::<f64>()
                .map_err(|e| Error::Parse(format!("bad number '{text}': {e}")))?,
        )
    } else {
        Token::Int(
            text.parse::<i64>()
                .map_err(|e| Error::Parse(format!("bad number '{text}': {e}")))?,
        )
    };
    Ok((token, i))
}

fn lex_word(chars: &[char], start: usize) -> Result<(Token, usize)> {
    let mut i = start;
    let mut path = Vec::new();
    loop {
        let seg_start = i;
        while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
            i += 1;
        }
        if i == seg_start {
            return Err(Error::Parse("expected identifier".into()));
        }
        path.push(chars[seg_start..i].iter().collect::<String>());
        if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(is_ident_start) {
            i += 1;
        } else {
            break;
        }
    }

    // Keywords only apply to bare single-segment words.
    if path.len() == 1 {
        match path[0].as_str() {
            "true" => return Ok((Token::Bool(true), i)),
            "false" => return Ok((Token::Bool(false), i)),
            "null" => return Ok((Token::Null, i)),
            s if s.eq_ignore_ascii_case("AND") => return Ok((Token::And, i)),
            s if s.eq_ignore_ascii_case("OR") => return Ok((Token::Or, i)),
            _ => {}
        }
    }

    let mut modifier = None;
    if i < chars.len() && chars[i] == ':' {
        let mod_start = i + 1;
        let mut end = mod_start;
        while end < chars.len() && chars[end].is_ascii_alphabetic() {
            end += 1;
        }
        let word: String = chars[mod_start..end].iter().collect();
        modifier = Some(match word.as_str() {
            "lower" => Modifier::Lower,
            "length" => Modifier::Length,
            other => return Err(Error::Parse(format!("unknown field modifier ':{other}'"))),
        });
        i = end;
    }

    Ok((Token::Field(path, modifier), i))
}

fn is_ident_start(c: &char) -> bool {
    c.is_ascii_alphabetic() || *c == '_'
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    now: DateTime<Utc>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_cmp()?;
        while self.eat(&Token::And) {
            let right = self.parse_cmp()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<FilterExpr> {
        if self.eat(&Token::LParen) {
            let expr = self.parse_or()?;
            if !self.eat(&Token::RParen) {
                return Err(Error::Parse("expected ')'".into()));
            }
            return Ok(expr);
        }

        let lhs = self.parse_atom()?;
        let op = match self.advance() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(Error::Parse(format!(
                    "expected a comparison operator, got {other:?}"
                )))
            }
        };
        let rhs = self.parse_atom()?;
        Ok(FilterExpr::Cmp { lhs, op, rhs })
    }

    fn parse_atom(&mut self) -> Result<Atom> {
        match self.advance() {
            Some(Token::Field(path, modifier)) => Ok(Atom::Field { path, modifier }),
            Some(Token::Str(s)) => Ok(Atom::Str(s)),
            Some(Token::Int(n)) => Ok(Atom::Int(n)),
            Some(Token::Float(f)) => Ok(Atom::Float(f)),
            Some(Token::Bool(b)) => Ok(Atom::Bool(b)),
            Some(Token::Null) => Ok(Atom::Null),
            Some(Token::Macro(name)) => resolve_macro(&name, self.now),
            other => Err(Error::Parse(format!("expected a value, got {other:?}"))),
        }
    }
}

// ============================================================================
// Date/time macros
// ============================================================================

fn resolve_macro(name: &str, now: DateTime<Utc>) -> Result<Atom> {
    let date = now.date_naive();
    let atom = match name {
        "now" => Atom::Str(to_iso(now)),
        "todayStart" => Atom::Str(to_iso(start_of_day(now))),
        "todayEnd" => Atom::Str(to_iso(end_of_day(now))),
        "yesterday" => Atom::Str(to_iso(now - Duration::days(1))),
        "tomorrow" => Atom::Str(to_iso(now + Duration::days(1))),
        "monthStart" => {
            let first = date.with_day(1).expect("day 1 exists");
            Atom::Str(to_iso(start_of_day(first.and_time(now.time()).and_utc())))
        }
        "monthEnd" => {
            let next = if date.month() == 12 {
                date.with_year(date.year() + 1)
                    .and_then(|d| d.with_month(1))
            } else {
                date.with_month(date.month() + 1)
            }
            .and_then(|d| d.with_day(1))
            .expect("first of next month exists");
            Atom::Str(to_iso(
                start_of_day(next.and_time(now.time()).and_utc()) - Duration::milliseconds(1),
            ))
        }
        "yearStart" => {
            let first = date
                .with_month(1)
                .and_then(|d| d.with_day(1))
                .expect("jan 1 exists");
            Atom::Str(to_iso(start_of_day(first.and_time(now.time()).and_utc())))
        }
        "yearEnd" => {
            let next = date
                .with_year(date.year() + 1)
                .and_then(|d| d.with_month(1))
                .and_then(|d| d.with_day(1))
                .expect("next jan 1 exists");
            Atom::Str(to_iso(
                start_of_day(next.and_time(now.time()).and_utc()) - Duration::milliseconds(1),
            ))
        }
        "second" => Atom::Int(now.second() as i64),
        "minute" => Atom::Int(now.minute() as i64),
        "hour" => Atom::Int(now.hour() as i64),
        "day" => Atom::Int(now.day() as i64),
        "weekday" => Atom::Int(now.weekday().num_days_from_sunday() as i64),
        "month" => Atom::Int(now.month() as i64),
        "year" => Atom::Int(now.year() as i64),
        other => return Err(Error::Parse(format!("unknown macro '@{other}'"))),
    };
    Ok(atom)
}

fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
}

fn end_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive()
        .and_hms_milli_opt(23, 59, 59, 999)
        .expect("end of day exists")
        .and_utc()
}

// ============================================================================
// SQL emission
// ============================================================================

const SYSTEM_FIELDS: &[&str] = &["id", "created", "updated"];

/// SQL fragment addressing a field: a system column directly, anything else
/// through `json_extract`.
pub fn field_sql(path: &[String], modifier: Option<Modifier>) -> String {
    let base = if path.len() == 1 && SYSTEM_FIELDS.contains(&path[0].as_str()) {
        path[0].clone()
    } else {
        format!("json_extract(data,'$.{}')", path.join("."))
    };
    match modifier {
        Some(Modifier::Lower) => format!("LOWER({base})"),
        Some(Modifier::Length) => format!("json_array_length({base})"),
        None => base,
    }
}

fn emit(expr: &FilterExpr, out: &mut String, params: &mut Vec<SqlParam>) {
    match expr {
        FilterExpr::And(l, r) => {
            out.push('(');
            emit(l, out, params);
            out.push_str(" AND ");
            emit(r, out, params);
            out.push(')');
        }
        FilterExpr::Or(l, r) => {
            out.push('(');
            emit(l, out, params);
            out.push_str(" OR ");
            emit(r, out, params);
            out.push(')');
        }
        FilterExpr::Cmp { lhs, op, rhs } => emit_cmp(lhs, *op, rhs, out, params),
    }
}

fn emit_cmp(lhs: &Atom, op: CmpOp, rhs: &Atom, out: &mut String, params: &mut Vec<SqlParam>) {
    if op.is_any() {
        // Any-of: unnest the LHS array and compare each element.
        let lhs_sql = match lhs {
            Atom::Field { path, .. } => field_sql(path, None),
            other => {
                params.push(literal_param(other));
                "?".to_string()
            }
        };
        out.push_str("EXISTS (SELECT 1 FROM json_each(");
        out.push_str(&lhs_sql);
        out.push_str(") WHERE value ");
        emit_rhs(op.base(), rhs, out, params);
        out.push(')');
        return;
    }

    out.push_str(&atom_sql(lhs, params));
    out.push(' ');
    emit_rhs(op, rhs, out, params);
}

/// Emit `OP rhs` with NULL and LIKE special cases.
fn emit_rhs(op: CmpOp, rhs: &Atom, out: &mut String, params: &mut Vec<SqlParam>) {
    if matches!(rhs, Atom::Null) && matches!(op, CmpOp::Eq | CmpOp::Ne) {
        out.push_str(if op == CmpOp::Eq {
            "IS NULL"
        } else {
            "IS NOT NULL"
        });
        return;
    }
    match op {
        CmpOp::Like | CmpOp::NotLike => {
            out.push_str(op.sql());
            out.push_str(" ?");
            params.push(SqlParam::Text(like_pattern(rhs)));
        }
        _ => {
            out.push_str(op.sql());
            out.push(' ');
            out.push_str(&atom_sql(rhs, params));
        }
    }
}

fn atom_sql(atom: &Atom, params: &mut Vec<SqlParam>) -> String {
    match atom {
        Atom::Field { path, modifier } => field_sql(path, *modifier),
        other => {
            params.push(literal_param(other));
            "?".to_string()
        }
    }
}

fn literal_param(atom: &Atom) -> SqlParam {
    match atom {
        Atom::Str(s) => SqlParam::Text(s.clone()),
        Atom::Int(n) => SqlParam::Int(*n),
        Atom::Float(f) => SqlParam::Real(*f),
        Atom::Bool(b) => SqlParam::Int(i64::from(*b)),
        Atom::Null => SqlParam::Null,
        Atom::Field { path, modifier } => {
            // Unreachable via the emitters; keep a sane fallback.
            SqlParam::Text(field_display(path, *modifier))
        }
    }
}

/// LIKE patterns wrap the operand in `%…%` unless it already carries one.
fn like_pattern(rhs: &Atom) -> String {
    let raw = match rhs {
        Atom::Str(s) => s.clone(),
        Atom::Int(n) => n.to_string(),
        Atom::Float(f) => f.to_string(),
        Atom::Bool(b) => b.to_string(),
        Atom::Null => String::new(),
        Atom::Field { path, modifier } => field_display(path, *modifier),
    };
    if raw.contains('%') {
        raw
    } else {
        format!("%{raw}%")
    }
}

// ============================================================================
// Canonical re-serialization
// ============================================================================

fn field_display(path: &[String], modifier: Option<Modifier>) -> String {
    let mut s = path.join(".");
    match modifier {
        Some(Modifier::Lower) => s.push_str(":lower"),
        Some(Modifier::Length) => s.push_str(":length"),
        None => {}
    }
    s
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Field { path, modifier } => write!(f, "{}", field_display(path, *modifier)),
            Atom::Str(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Atom::Int(n) => write!(f, "{n}"),
            Atom::Float(v) => write!(f, "{v}"),
            Atom::Bool(b) => write!(f, "{b}"),
            Atom::Null => write!(f, "null"),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Like => "~",
            CmpOp::NotLike => "!~",
            CmpOp::AnyEq => "?=",
            CmpOp::AnyNe => "?!=",
            CmpOp::AnyGt => "?>",
            CmpOp::AnyGe => "?>=",
            CmpOp::AnyLt => "?<",
            CmpOp::AnyLe => "?<=",
            CmpOp::AnyLike => "?~",
            CmpOp::AnyNotLike => "?!~",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FilterExpr {
    /// Canonical filter text: reparsing it yields the same SQL predicate.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::And(l, r) => write!(f, "({l} && {r})"),
            FilterExpr::Or(l, r) => write!(f, "({l} || {r})"),
            FilterExpr::Cmp { lhs, op, rhs } => write!(f, "{lhs} {op} {rhs}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
