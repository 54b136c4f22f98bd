/// Expression evaluator - precedence climbing directly over token slices
///
/// Statements keep their clauses as (start, end) ranges over one shared token
/// buffer; evaluation walks the slice with a cursor instead of building an
/// AST, so trigger bodies and user-function bodies can store raw tokens.
use super::token::{tokens_text, Token, TokenKind};
use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::types::{ColumnType, Row, Value};

pub const AGGREGATE_NAMES: [&str; 5] = ["COUNT", "SUM", "AVG", "MIN", "MAX"];

pub fn is_aggregate_name(name: &str) -> bool {
    AGGREGATE_NAMES.contains(&name.to_uppercase().as_str())
}

/// Canonical key an aggregate is precomputed under: uppercased name, inner
/// tokens joined with no separators, `*` preserved, `DISTINCT ` prefix kept.
pub fn aggregate_key(name: &str, distinct: bool, inner: &[Token]) -> String {
    let args = tokens_text(inner);
    if distinct {
        format!("{}(DISTINCT {})", name.to_uppercase(), args)
    } else {
        format!("{}({})", name.to_uppercase(), args)
    }
}

/// Everything one expression evaluation can see: the current row bindings and
/// the database registries (user functions, add-ins, tables, pattern cache).
pub struct EvalContext<'a> {
    pub db: &'a Database,
    pub row: &'a Row,
}

impl<'a> EvalContext<'a> {
    pub fn new(db: &'a Database, row: &'a Row) -> Self {
        Self { db, row }
    }

    pub fn eval(&self, tokens: &[Token]) -> Result<Value> {
        let mut ev = Evaluator { tokens, pos: 0, ctx: self };
        ev.eval_or()
    }
}

struct Evaluator<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a EvalContext<'a>,
}

impl<'a> Evaluator<'a> {
    fn current(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn match_kw(&mut self, word: &str) -> bool {
        if self.current().is_kw(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, word: &str) -> Result<()> {
        if self.match_kw(word) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", word)))
        }
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if *self.current() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_tok(&mut self, kind: TokenKind) -> Result<()> {
        if self.match_tok(kind.clone()) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", kind)))
        }
    }

    fn error(&self, msg: &str) -> EngineError {
        match self.tokens.get(self.pos) {
            Some(t) => EngineError::ParseError(format!(
                "{} at line {} column {}",
                msg, t.line, t.column
            )),
            None => EngineError::ParseError(format!("{} at end of input", msg)),
        }
    }

    // precedence low to high: OR, AND, NOT, comparison, + -, * / %, unary -, primary

    fn eval_or(&mut self) -> Result<Value> {
        let mut value = self.eval_and()?;
        while self.match_kw("OR") {
            // both sides evaluate; the engine collapses three-valued logic
            let rhs = self.eval_and()?;
            value = Value::Bool(value.truthy() || rhs.truthy());
        }
        Ok(value)
    }

    fn eval_and(&mut self) -> Result<Value> {
        let mut value = self.eval_not()?;
        while self.match_kw("AND") {
            let rhs = self.eval_not()?;
            value = Value::Bool(value.truthy() && rhs.truthy());
        }
        Ok(value)
    }

    fn eval_not(&mut self) -> Result<Value> {
        if self.match_kw("NOT") {
            let value = self.eval_not()?;
            return Ok(Value::Bool(!value.truthy()));
        }
        self.eval_comparison()
    }

    fn eval_comparison(&mut self) -> Result<Value> {
        let mut left = self.eval_additive()?;
        loop {
            match self.current() {
                TokenKind::Keyword(k) if *k == "IS" => {
                    self.advance();
                    let negated = self.match_kw("NOT");
                    self.expect_kw("NULL")?;
                    left = Value::Bool(left.is_null() != negated);
                }
                TokenKind::Keyword(k) if *k == "NOT" => {
                    self.advance();
                    if self.match_kw("BETWEEN") {
                        left = self.eval_between(left, true)?;
                    } else if self.match_kw("IN") {
                        left = self.eval_in(left, true)?;
                    } else if self.match_kw("LIKE") {
                        left = self.eval_like(left, true)?;
                    } else {
                        // bare trailing NOT negates what we have
                        left = Value::Bool(!left.truthy());
                    }
                }
                TokenKind::Keyword(k) if *k == "BETWEEN" => {
                    self.advance();
                    left = self.eval_between(left, false)?;
                }
                TokenKind::Keyword(k) if *k == "IN" => {
                    self.advance();
                    left = self.eval_in(left, false)?;
                }
                TokenKind::Keyword(k) if *k == "LIKE" => {
                    self.advance();
                    left = self.eval_like(left, false)?;
                }
                TokenKind::Eq => {
                    self.advance();
                    let rhs = self.eval_additive()?;
                    left = Value::Bool(left.sql_eq(&rhs));
                }
                TokenKind::Ne => {
                    self.advance();
                    let rhs = self.eval_additive()?;
                    left = Value::Bool(!left.sql_eq(&rhs));
                }
                TokenKind::Lt => {
                    self.advance();
                    let rhs = self.eval_additive()?;
                    left = Value::Bool(left.total_cmp(&rhs) == std::cmp::Ordering::Less);
                }
                TokenKind::Gt => {
                    self.advance();
                    let rhs = self.eval_additive()?;
                    left = Value::Bool(left.total_cmp(&rhs) == std::cmp::Ordering::Greater);
                }
                TokenKind::Le => {
                    self.advance();
                    let rhs = self.eval_additive()?;
                    left = Value::Bool(left.total_cmp(&rhs) != std::cmp::Ordering::Greater);
                }
                TokenKind::Ge => {
                    self.advance();
                    let rhs = self.eval_additive()?;
                    left = Value::Bool(left.total_cmp(&rhs) != std::cmp::Ordering::Less);
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn eval_between(&mut self, left: Value, negated: bool) -> Result<Value> {
        let low = self.eval_additive()?;
        self.expect_kw("AND")?;
        let high = self.eval_additive()?;
        let in_range = left.total_cmp(&low) != std::cmp::Ordering::Less
            && left.total_cmp(&high) != std::cmp::Ordering::Greater;
        Ok(Value::Bool(in_range != negated))
    }

    fn eval_in(&mut self, left: Value, negated: bool) -> Result<Value> {
        self.expect_tok(TokenKind::LParen)?;
        let mut found = false;
        loop {
            let item = self.eval_or()?;
            if left.sql_eq(&item) {
                found = true;
            }
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }
        self.expect_tok(TokenKind::RParen)?;
        Ok(Value::Bool(found != negated))
    }

    fn eval_like(&mut self, left: Value, negated: bool) -> Result<Value> {
        let pattern = self.eval_additive()?;
        let matched = if left.is_null() || pattern.is_null() {
            false
        } else {
            let re = self.ctx.db.like_regex(&pattern.render())?;
            re.is_match(&left.render())
        };
        Ok(Value::Bool(matched != negated))
    }

    fn eval_additive(&mut self) -> Result<Value> {
        let mut value = self.eval_term()?;
        loop {
            if self.match_tok(TokenKind::Plus) {
                let rhs = self.eval_term()?;
                value = add_values(value, rhs);
            } else if self.match_tok(TokenKind::Minus) {
                let rhs = self.eval_term()?;
                value = numeric_op(value, rhs, |a, b| a - b, |a, b| a - b);
            } else {
                break;
            }
        }
        Ok(value)
    }

    fn eval_term(&mut self) -> Result<Value> {
        let mut value = self.eval_unary()?;
        loop {
            if self.match_tok(TokenKind::Star) {
                let rhs = self.eval_unary()?;
                value = numeric_op(value, rhs, |a, b| a.wrapping_mul(b), |a, b| a * b);
            } else if self.match_tok(TokenKind::Slash) {
                let rhs = self.eval_unary()?;
                value = div_values(value, rhs)?;
            } else if self.match_tok(TokenKind::Percent) {
                let rhs = self.eval_unary()?;
                value = mod_values(value, rhs)?;
            } else {
                break;
            }
        }
        Ok(value)
    }

    fn eval_unary(&mut self) -> Result<Value> {
        if self.match_tok(TokenKind::Minus) {
            let value = self.eval_unary()?;
            return match value {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EngineError::TypeMismatch(format!(
                    "cannot negate {}",
                    other.key_text()
                ))),
            };
        }
        self.eval_primary()
    }

    fn eval_primary(&mut self) -> Result<Value> {
        match self.current().clone() {
            TokenKind::LParen => {
                self.advance();
                let value = self.eval_or()?;
                self.expect_tok(TokenKind::RParen)?;
                Ok(value)
            }
            TokenKind::Integer(i) => {
                self.advance();
                Ok(Value::Int(i))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Value::Float(f))
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Value::Text(s))
            }
            TokenKind::Keyword("NULL") => {
                self.advance();
                Ok(Value::Null)
            }
            TokenKind::Keyword("TRUE") => {
                self.advance();
                Ok(Value::Bool(true))
            }
            TokenKind::Keyword("FALSE") => {
                self.advance();
                Ok(Value::Bool(false))
            }
            TokenKind::Keyword("CASE") => {
                self.advance();
                self.eval_case()
            }
            TokenKind::Keyword("CAST") => {
                self.advance();
                self.eval_cast()
            }
            TokenKind::Keyword("CONVERT") => {
                self.advance();
                self.eval_convert()
            }
            TokenKind::Identifier(name) => {
                if *self.peek() == TokenKind::LParen {
                    self.advance();
                    return self.eval_call(&name);
                }
                if *self.peek() == TokenKind::Dot {
                    self.advance(); // identifier
                    self.advance(); // dot
                    let column = self
                        .current()
                        .word()
                        .map(str::to_string)
                        .ok_or_else(|| self.error("expected column name after '.'"))?;
                    self.advance();
                    return self.lookup_qualified(&name, &column);
                }
                self.advance();
                self.lookup_column(&name)
            }
            TokenKind::Keyword(word) => {
                // LEFT, RIGHT, CHAR and friends are reserved but callable
                if *self.peek() == TokenKind::LParen {
                    self.advance();
                    return self.eval_call(word);
                }
                Err(self.error("expected expression"))
            }
            _ => Err(self.error("expected expression")),
        }
    }

    fn lookup_column(&self, name: &str) -> Result<Value> {
        self.ctx
            .row
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ColumnNotFound(name.to_string()))
    }

    fn lookup_qualified(&self, alias: &str, column: &str) -> Result<Value> {
        let qualified = format!("{}.{}", alias, column);
        if let Some(v) = self.ctx.row.get(&qualified) {
            return Ok(v.clone());
        }
        self.ctx
            .row
            .get(column)
            .cloned()
            .ok_or(EngineError::ColumnNotFound(qualified))
    }

    /// Function call; cursor sits on the opening paren. Aggregates are
    /// intercepted here: a grouped row carries the precomputed value under the
    /// canonical key, and the call's tokens are consumed without evaluation.
    fn eval_call(&mut self, name: &str) -> Result<Value> {
        if is_aggregate_name(name) {
            return self.eval_aggregate_ref(name);
        }

        self.advance(); // (
        let mut args = Vec::new();
        // DATEDIFF takes its part name bare: DATEDIFF(YEAR, a, b)
        if name.eq_ignore_ascii_case("DATEDIFF") {
            let part = self.current().word().map(str::to_string);
            if let Some(part) = part {
                if *self.peek() == TokenKind::Comma {
                    args.push(Value::Text(part));
                    self.advance();
                    self.advance();
                }
            }
        }
        if *self.current() != TokenKind::RParen {
            loop {
                args.push(self.eval_or()?);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect_tok(TokenKind::RParen)?;
        dispatch_function(self.ctx.db, name, &args)
    }

    fn eval_aggregate_ref(&mut self, name: &str) -> Result<Value> {
        let open = self.pos; // at '('
        let close = matching_paren(self.tokens, open)
            .ok_or_else(|| self.error("unterminated aggregate call"))?;
        let mut inner = &self.tokens[open + 1..close];
        let distinct = inner.first().map(|t| t.kind.is_kw("DISTINCT")).unwrap_or(false);
        if distinct {
            inner = &inner[1..];
        }

        let key = aggregate_key(name, distinct, inner);
        if let Some(v) = self.ctx.row.get(&key) {
            self.pos = close + 1;
            return Ok(v.clone());
        }

        // row-level placeholder contribution
        if name.eq_ignore_ascii_case("COUNT")
            || inner.len() == 1 && inner[0].kind == TokenKind::Star
        {
            self.pos = close + 1;
            return Ok(Value::Int(1));
        }
        self.pos = open + if distinct { 2 } else { 1 };
        let value = self.eval_or()?;
        self.pos = close + 1;
        Ok(value)
    }

    /// CASE, both forms. Only the taken branch is evaluated; the rest are
    /// skipped with a depth-aware scan.
    fn eval_case(&mut self) -> Result<Value> {
        let operand = if self.current().is_kw("WHEN") {
            None
        } else {
            Some(self.eval_or()?)
        };

        let mut matched: Option<Value> = None;
        while self.match_kw("WHEN") {
            if matched.is_some() {
                self.skip_branch(&["THEN"]);
                self.expect_kw("THEN")?;
                self.skip_branch(&["WHEN", "ELSE", "END"]);
                continue;
            }
            let test = self.eval_or()?;
            self.expect_kw("THEN")?;
            let hit = match &operand {
                Some(op) => op.sql_eq(&test),
                None => test.truthy(),
            };
            if hit {
                matched = Some(self.eval_or()?);
            } else {
                self.skip_branch(&["WHEN", "ELSE", "END"]);
            }
        }

        if self.match_kw("ELSE") {
            if matched.is_some() {
                self.skip_branch(&["END"]);
            } else {
                matched = Some(self.eval_or()?);
            }
        }
        self.expect_kw("END")?;
        Ok(matched.unwrap_or(Value::Null))
    }

    /// Skip tokens until one of the stop keywords at paren/CASE depth zero.
    /// The stop token itself is not consumed.
    fn skip_branch(&mut self, stops: &[&str]) {
        let mut parens = 0usize;
        let mut cases = 0usize;
        loop {
            match self.current() {
                TokenKind::Eof => return,
                TokenKind::LParen => parens += 1,
                TokenKind::RParen => {
                    if parens == 0 {
                        return;
                    }
                    parens -= 1;
                }
                TokenKind::Keyword("CASE") if parens == 0 => cases += 1,
                TokenKind::Keyword("END") if parens == 0 => {
                    if cases == 0 {
                        return;
                    }
                    cases -= 1;
                }
                TokenKind::Keyword(k)
                    if parens == 0 && cases == 0 && stops.contains(k) =>
                {
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// CAST(expr AS type [(precision[, scale])])
    fn eval_cast(&mut self) -> Result<Value> {
        self.expect_tok(TokenKind::LParen)?;
        let value = self.eval_or()?;
        self.expect_kw("AS")?;
        let ty = self.parse_cast_type()?;
        self.expect_tok(TokenKind::RParen)?;
        value.coerce_to(ty)
    }

    /// CONVERT(type [(precision[, scale])], expr)
    fn eval_convert(&mut self) -> Result<Value> {
        self.expect_tok(TokenKind::LParen)?;
        let ty = self.parse_cast_type()?;
        self.expect_tok(TokenKind::Comma)?;
        let value = self.eval_or()?;
        self.expect_tok(TokenKind::RParen)?;
        value.coerce_to(ty)
    }

    fn parse_cast_type(&mut self) -> Result<ColumnType> {
        let name = self
            .current()
            .word()
            .map(str::to_string)
            .ok_or_else(|| self.error("expected type name"))?;
        self.advance();
        // precision/scale is parsed and discarded
        if self.match_tok(TokenKind::LParen) {
            while *self.current() != TokenKind::RParen && *self.current() != TokenKind::Eof {
                self.advance();
            }
            self.expect_tok(TokenKind::RParen)?;
        }
        Ok(ColumnType::from_sql_name(&name))
    }
}

/// Resolution order: user-defined function, host add-in, built-in. Unknown
/// names evaluate to Null rather than erroring.
pub fn dispatch_function(db: &Database, name: &str, args: &[Value]) -> Result<Value> {
    if let Some(func) = db.lookup_function(name) {
        let mut params = Row::new();
        for (i, (pname, pty)) in func.params.iter().enumerate() {
            let bound = args.get(i).cloned().unwrap_or(Value::Null);
            params.insert(pname, bound.coerce_to(*pty).unwrap_or(bound));
        }
        let ctx = EvalContext::new(db, &params);
        let result = ctx.eval(&func.body)?;
        return result.coerce_to(func.return_type);
    }
    if let Some(addin) = db.lookup_add_in(name) {
        return addin.invoke(args);
    }
    match super::functions::call_builtin(&name.to_uppercase(), args)? {
        Some(v) => Ok(v),
        None => Ok(Value::Null),
    }
}

/// Index of the `)` matching the `(` at `open`.
pub fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        match t.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn add_values(a: Value, b: Value) -> Value {
    if a.is_null() || b.is_null() {
        return Value::Null;
    }
    // '+' is polymorphic: any text operand makes it concatenation
    if matches!(a, Value::Text(_)) || matches!(b, Value::Text(_)) {
        return Value::Text(format!("{}{}", a.render(), b.render()));
    }
    numeric_op(a, b, |x, y| x.wrapping_add(y), |x, y| x + y)
}

fn numeric_op(a: Value, b: Value, int_op: fn(i64, i64) -> i64, float_op: fn(f64, f64) -> f64) -> Value {
    if a.is_null() || b.is_null() {
        return Value::Null;
    }
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Value::Int(int_op(*x, *y)),
        _ => Value::Float(float_op(a.to_f64(), b.to_f64())),
    }
}

fn div_values(a: Value, b: Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    let divisor = b.to_f64();
    if divisor == 0.0 {
        return Err(EngineError::DivisionByZero);
    }
    Ok(Value::Float(a.to_f64() / divisor))
}

fn mod_values(a: Value, b: Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                Err(EngineError::DivisionByZero)
            } else {
                Ok(Value::Int(x % y))
            }
        }
        _ => {
            let divisor = b.to_f64();
            if divisor == 0.0 {
                Err(EngineError::DivisionByZero)
            } else {
                Ok(Value::Float(a.to_f64() % divisor))
            }
        }
    }
}

/// Find the end (exclusive) of the expression starting at `start`, without
/// evaluating it. Stops at a depth-zero comma, clause keyword, closing paren,
/// statement terminator, or where a new operand begins directly after a
/// completed one (which is how a bare select-item alias reads).
pub fn scan_expr(tokens: &[Token], start: usize) -> usize {
    // keywords that continue an expression rather than starting a new clause
    const CONTINUERS: [&str; 7] = ["AND", "OR", "NOT", "IN", "BETWEEN", "LIKE", "IS"];

    let mut parens = 0usize;
    let mut cases = 0usize;
    let mut ends_operand = false;
    let mut i = start;

    while i < tokens.len() {
        let kind = &tokens[i].kind;
        match kind {
            TokenKind::Eof | TokenKind::Semicolon => break,
            TokenKind::Comma if parens == 0 => break,
            TokenKind::LParen => {
                parens += 1;
                ends_operand = false;
            }
            TokenKind::RParen => {
                if parens == 0 {
                    break;
                }
                parens -= 1;
                ends_operand = true;
            }
            TokenKind::Keyword(k) if parens == 0 && cases == 0 => {
                match *k {
                    "CASE" => {
                        if ends_operand {
                            break;
                        }
                        cases += 1;
                    }
                    "END" => break,
                    k2 if CONTINUERS.contains(&k2) => ends_operand = false,
                    "NULL" | "TRUE" | "FALSE" => {
                        if ends_operand {
                            break;
                        }
                        ends_operand = true;
                    }
                    "WHEN" | "THEN" | "ELSE" | "ELSEIF" | "AS" | "ASC" | "DESC" | "FROM"
                    | "WHERE" | "GROUP" | "HAVING" | "ORDER" | "LIMIT" | "OFFSET" | "ON"
                    | "JOIN" | "INNER" | "FULL" | "CROSS" | "OUTER" | "SET" | "VALUES"
                    | "FOR" | "BEGIN" | "IF" | "RETURN" => break,
                    // LEFT/RIGHT and the rest are callable keywords: they
                    // start an operand unless one just finished, in which
                    // case they open the next clause (e.g. LEFT JOIN).
                    _ => {
                        if ends_operand {
                            break;
                        }
                        ends_operand = !matches!(
                            tokens.get(i + 1).map(|t| &t.kind),
                            Some(TokenKind::LParen)
                        );
                    }
                }
            }
            TokenKind::Keyword(k) if parens == 0 => {
                // inside CASE: track nesting, ignore the rest
                match *k {
                    "CASE" => cases += 1,
                    "END" => {
                        cases -= 1;
                        if cases == 0 {
                            ends_operand = true;
                        }
                    }
                    _ => {}
                }
            }
            TokenKind::Identifier(_) | TokenKind::Integer(_) | TokenKind::Float(_)
            | TokenKind::StringLit(_) => {
                if parens == 0 && cases == 0 && ends_operand {
                    break;
                }
                ends_operand = true;
            }
            TokenKind::Dot => ends_operand = false,
            TokenKind::Star => {
                // '*' as COUNT(*) argument or multiplication
                ends_operand = parens > 0 && !ends_operand;
            }
            _ => ends_operand = false,
        }
        i += 1;
    }
    i
}
