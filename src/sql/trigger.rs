/// Trigger model and runtime
///
/// A trigger body is pre-parsed into a small statement tree at CREATE TRIGGER
/// time, then interpreted per affected row against a mutable NEW/OLD context.
use log::warn;

use super::eval::{scan_expr, EvalContext};
use super::token::{tokens_text, Token, TokenKind};
use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::types::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

/// One statement of a trigger body
#[derive(Debug, Clone)]
pub enum TriggerStmt {
    SetNewOld {
        is_new: bool,
        column: String,
        expr: Vec<Token>,
    },
    If {
        branches: Vec<(Vec<Token>, Vec<TriggerStmt>)>,
        else_body: Vec<TriggerStmt>,
    },
    Dml {
        tokens: Vec<Token>,
    },
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub table: String,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    pub body: Vec<TriggerStmt>,
    /// Exact CREATE TRIGGER text, retained so snapshots can replay it.
    pub source: String,
}

/// Parse the tokens between BEGIN and END into a statement tree.
pub fn parse_trigger_body(tokens: &[Token]) -> Result<Vec<TriggerStmt>> {
    let mut parser = BodyParser { tokens, pos: 0 };
    parser.parse_stmts(&[])
}

struct BodyParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> BodyParser<'a> {
    fn current(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
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
            Err(EngineError::ParseError(format!(
                "expected {} in trigger body",
                word
            )))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len() || *self.current() == TokenKind::Eof
    }

    /// Parse statements until end of input or one of the stop keywords
    /// (used for IF branch bodies).
    fn parse_stmts(&mut self, stops: &[&str]) -> Result<Vec<TriggerStmt>> {
        let mut stmts = Vec::new();
        loop {
            while *self.current() == TokenKind::Semicolon {
                self.advance();
            }
            if self.at_end() {
                break;
            }
            if let TokenKind::Keyword(k) = self.current() {
                if stops.contains(k) {
                    break;
                }
            }
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<TriggerStmt> {
        if self.current().is_kw("SET") && self.is_new_old_target() {
            return self.parse_set();
        }
        if self.current().is_kw("IF") {
            return self.parse_if();
        }
        self.parse_dml()
    }

    /// SET only claims the statement when it assigns to NEW.x or OLD.x;
    /// anything else is raw DML.
    fn is_new_old_target(&self) -> bool {
        matches!(
            self.tokens.get(self.pos + 1).map(|t| &t.kind),
            Some(TokenKind::Identifier(id))
                if id.eq_ignore_ascii_case("NEW") || id.eq_ignore_ascii_case("OLD")
        ) && matches!(
            self.tokens.get(self.pos + 2).map(|t| &t.kind),
            Some(TokenKind::Dot)
        )
    }

    fn parse_set(&mut self) -> Result<TriggerStmt> {
        self.advance(); // SET
        let is_new = match self.current() {
            TokenKind::Identifier(id) => id.eq_ignore_ascii_case("NEW"),
            _ => return Err(EngineError::ParseError("expected NEW or OLD".into())),
        };
        self.advance(); // NEW / OLD
        self.advance(); // .
        let column = self
            .current()
            .word()
            .map(str::to_string)
            .ok_or_else(|| EngineError::ParseError("expected column after NEW./OLD.".into()))?;
        self.advance();
        if !matches!(self.current(), TokenKind::Eq | TokenKind::Assign) {
            return Err(EngineError::ParseError("expected = in SET".into()));
        }
        self.advance();
        let end = scan_expr(self.tokens, self.pos);
        let expr = self.tokens[self.pos..end].to_vec();
        if expr.is_empty() {
            return Err(EngineError::ParseError("empty SET expression".into()));
        }
        self.pos = end;
        if *self.current() == TokenKind::Semicolon {
            self.advance();
        }
        Ok(TriggerStmt::SetNewOld { is_new, column, expr })
    }

    /// IF cond THEN stmts [ELSEIF cond THEN stmts]* [ELSE stmts] END IF;
    fn parse_if(&mut self) -> Result<TriggerStmt> {
        self.advance(); // IF
        let mut branches = Vec::new();
        let mut else_body = Vec::new();

        loop {
            let end = scan_expr(self.tokens, self.pos);
            let cond = self.tokens[self.pos..end].to_vec();
            if cond.is_empty() {
                return Err(EngineError::ParseError("empty IF condition".into()));
            }
            self.pos = end;
            self.expect_kw("THEN")?;
            let body = self.parse_stmts(&["ELSEIF", "ELSE", "END"])?;
            branches.push((cond, body));
            if !self.match_kw("ELSEIF") {
                break;
            }
        }
        if self.match_kw("ELSE") {
            else_body = self.parse_stmts(&["END"])?;
        }
        self.expect_kw("END")?;
        self.expect_kw("IF")?;
        if *self.current() == TokenKind::Semicolon {
            self.advance();
        }
        Ok(TriggerStmt::If { branches, else_body })
    }

    /// Anything else up to the terminating semicolon is kept as raw DML.
    fn parse_dml(&mut self) -> Result<TriggerStmt> {
        let start = self.pos;
        let mut parens = 0usize;
        while !self.at_end() {
            match self.current() {
                TokenKind::Semicolon if parens == 0 => break,
                TokenKind::LParen => parens += 1,
                TokenKind::RParen => parens = parens.saturating_sub(1),
                _ => {}
            }
            self.advance();
        }
        let tokens = self.tokens[start..self.pos].to_vec();
        if *self.current() == TokenKind::Semicolon {
            self.advance();
        }
        if tokens.is_empty() {
            return Err(EngineError::ParseError("empty trigger statement".into()));
        }
        Ok(TriggerStmt::Dml { tokens })
    }
}

/// Build the per-row trigger context: NEW.col and OLD.col for every table
/// column, plus bare-column aliases of NEW.
pub fn trigger_context(columns: &[String], new: Option<&Row>, old: Option<&Row>) -> Row {
    let mut ctx = Row::new();
    for col in columns {
        let new_v = new.and_then(|r| r.get(col).cloned()).unwrap_or(Value::Null);
        let old_v = old.and_then(|r| r.get(col).cloned()).unwrap_or(Value::Null);
        ctx.insert(&format!("NEW.{}", col), new_v.clone());
        ctx.insert(&format!("OLD.{}", col), old_v);
        ctx.insert(col, new_v);
    }
    ctx
}

/// Run one trigger's body against the context. SET and IF evaluation errors
/// abort the outer statement; errors inside embedded DML are swallowed so the
/// trigger keeps its fire-and-forget shape.
pub fn run_trigger(db: &Database, trigger: &Trigger, ctx: &mut Row) -> Result<()> {
    exec_stmts(db, &trigger.name, &trigger.body, ctx)
}

fn exec_stmts(db: &Database, name: &str, stmts: &[TriggerStmt], ctx: &mut Row) -> Result<()> {
    for stmt in stmts {
        match stmt {
            TriggerStmt::SetNewOld { is_new, column, expr } => {
                let value = EvalContext::new(db, ctx).eval(expr)?;
                let prefix = if *is_new { "NEW" } else { "OLD" };
                ctx.insert(&format!("{}.{}", prefix, column), value.clone());
                if *is_new {
                    ctx.insert(column, value);
                }
            }
            TriggerStmt::If { branches, else_body } => {
                let mut taken = false;
                for (cond, body) in branches {
                    if EvalContext::new(db, ctx).eval(cond)?.truthy() {
                        exec_stmts(db, name, body, ctx)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    exec_stmts(db, name, else_body, ctx)?;
                }
            }
            TriggerStmt::Dml { tokens } => {
                let rewritten = rewrite_new_old(tokens, ctx);
                let text = tokens_text(&rewritten);
                if let Err(e) = crate::sql::executor::execute_tokens(db, rewritten, &text, None) {
                    warn!("trigger {}: embedded statement failed: {}", name, e);
                }
            }
        }
    }
    Ok(())
}

/// Replace NEW.col / OLD.col token triples with literal tokens holding the
/// current context values, so the embedded statement can be executed on its
/// own.
fn rewrite_new_old(tokens: &[Token], ctx: &Row) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let is_ref = matches!(
            &tokens[i].kind,
            TokenKind::Identifier(id)
                if id.eq_ignore_ascii_case("NEW") || id.eq_ignore_ascii_case("OLD")
        ) && matches!(tokens.get(i + 1).map(|t| &t.kind), Some(TokenKind::Dot))
            && tokens.get(i + 2).map(|t| t.kind.word().is_some()).unwrap_or(false);

        if is_ref {
            let prefix = match &tokens[i].kind {
                TokenKind::Identifier(id) => id.to_uppercase(),
                _ => unreachable!(),
            };
            let column = tokens[i + 2].kind.word().unwrap_or_default();
            let key = format!("{}.{}", prefix, column);
            let value = ctx.get(&key).cloned().unwrap_or(Value::Null);
            out.push(Token::new(value_token(&value), tokens[i].line, tokens[i].column));
            i += 3;
        } else {
            out.push(tokens[i].clone());
            i += 1;
        }
    }
    // the end marker keeps the executor's cursor in bounds
    let (line, column) = tokens
        .last()
        .map(|t| (t.line, t.column))
        .unwrap_or((1, 1));
    out.push(Token::new(TokenKind::Eof, line, column));
    out
}

fn value_token(value: &Value) -> TokenKind {
    match value {
        Value::Null => TokenKind::Keyword("NULL"),
        Value::Bool(true) => TokenKind::Keyword("TRUE"),
        Value::Bool(false) => TokenKind::Keyword("FALSE"),
        Value::Int(i) => TokenKind::Integer(*i),
        Value::Float(f) => TokenKind::Float(*f),
        other => TokenKind::StringLit(other.render()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::lexer::Lexer;

    fn body(sql: &str) -> Vec<TriggerStmt> {
        let mut tokens = Lexer::new(sql).tokenize();
        tokens.pop(); // drop Eof so the slice is exactly the body
        parse_trigger_body(&tokens).unwrap()
    }

    #[test]
    fn test_parse_set_new() {
        let stmts = body("SET NEW.Price = 1.0;");
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            TriggerStmt::SetNewOld { is_new, column, expr } => {
                assert!(is_new);
                assert_eq!(column, "Price");
                assert_eq!(expr.len(), 1);
            }
            other => panic!("expected SET, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_if_elseif_else() {
        let stmts = body(
            "IF NEW.Price < 1.0 THEN SET NEW.Price = 1.0; \
             ELSEIF NEW.Price > 100 THEN SET NEW.Price = 100; \
             ELSE SET NEW.Tier = 'normal'; END IF;",
        );
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            TriggerStmt::If { branches, else_body } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[0].1.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected IF, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_nested_if() {
        let stmts = body(
            "IF NEW.a > 0 THEN IF NEW.b > 0 THEN SET NEW.c = 1; END IF; END IF;",
        );
        match &stmts[0] {
            TriggerStmt::If { branches, .. } => match &branches[0].1[0] {
                TriggerStmt::If { branches: inner, .. } => assert_eq!(inner.len(), 1),
                other => panic!("expected nested IF, got {:?}", other),
            },
            other => panic!("expected IF, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_raw_dml_collected() {
        let stmts = body("INSERT INTO audit VALUES (NEW.Id, 'inserted');");
        assert_eq!(stmts.len(), 1);
        assert!(matches!(&stmts[0], TriggerStmt::Dml { tokens } if !tokens.is_empty()));
    }

    #[test]
    fn test_rewrite_new_old_triples() {
        let mut tokens = Lexer::new("INSERT INTO audit VALUES (NEW.Id, OLD.Name)").tokenize();
        tokens.pop();
        let mut ctx = Row::new();
        ctx.insert("NEW.Id", Value::Int(7));
        ctx.insert("OLD.Name", Value::Text("Hammer".into()));
        let rewritten = rewrite_new_old(&tokens, &ctx);
        let text = tokens_text(&rewritten);
        assert!(text.contains('7'));
        assert!(text.contains("'Hammer'"));
        assert!(!text.to_uppercase().contains("NEW"));
    }

    #[test]
    fn test_trigger_context_seeding() {
        let mut new = Row::new();
        new.insert("Price", Value::Float(5.0));
        let cols = vec!["Id".to_string(), "Price".to_string()];
        let ctx = trigger_context(&cols, Some(&new), None);
        assert!(matches!(ctx.get("NEW.Price"), Some(Value::Float(_))));
        assert!(ctx.get("OLD.Price").unwrap().is_null());
        assert!(matches!(ctx.get("Price"), Some(Value::Float(_))));
        assert!(ctx.get("NEW.Id").unwrap().is_null());
    }
}
