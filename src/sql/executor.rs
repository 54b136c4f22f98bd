/// Statement executor - parses SQL statements and runs them against the
/// database, including the SELECT row pipeline and DML trigger firing
use std::collections::{HashMap, HashSet};

use log::debug;

use super::eval::{
    aggregate_key, is_aggregate_name, matching_paren, scan_expr, EvalContext,
};
use super::lexer::Lexer;
use super::token::{tokens_text, Token, TokenKind};
use super::trigger::{
    parse_trigger_body, run_trigger, trigger_context, Trigger, TriggerEvent, TriggerTiming,
};
use crate::database::{CancelFlag, Database, UserFunction};
use crate::error::{EngineError, Result};
use crate::types::{Column, ColumnType, Row, Table, Value};

/// SELECT output grid
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// What a statement produced
#[derive(Debug)]
pub enum ExecOutcome {
    Rows(ResultSet),
    Affected(usize),
}

impl ExecOutcome {
    pub fn affected_rows(&self) -> usize {
        match self {
            ExecOutcome::Affected(n) => *n,
            ExecOutcome::Rows(_) => 0,
        }
    }
}

/// Execute one SQL statement.
pub fn execute(db: &Database, sql: &str, cancel: Option<&CancelFlag>) -> Result<ExecOutcome> {
    let tokens = Lexer::new(sql).tokenize();
    execute_tokens(db, tokens, sql, cancel)
}

/// Execute an already-tokenized statement (trigger bodies re-enter here).
pub fn execute_tokens(
    db: &Database,
    tokens: Vec<Token>,
    source: &str,
    cancel: Option<&CancelFlag>,
) -> Result<ExecOutcome> {
    let mut executor = Executor { db, tokens, pos: 0, source: source.to_string(), cancel };
    executor.run()
}

type TokenRange = (usize, usize);

struct AggSpec {
    name: String,
    distinct: bool,
    inner: TokenRange,
    key: String,
}

enum SelectItem {
    Star,
    QualifiedStar(String),
    Expr {
        range: TokenRange,
        alias: Option<String>,
        agg: Option<AggSpec>,
    },
}

struct SourceRef {
    table: String,
    alias: String,
}

#[derive(Clone, Copy, PartialEq)]
enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

struct JoinClause {
    kind: JoinKind,
    source: SourceRef,
    on: Option<TokenRange>,
}

struct SelectStmt {
    distinct: bool,
    top: Option<usize>,
    items: Vec<SelectItem>,
    sources: Vec<SourceRef>,
    joins: Vec<JoinClause>,
    where_clause: Option<TokenRange>,
    group_by: Vec<TokenRange>,
    having: Option<TokenRange>,
    order_by: Vec<(TokenRange, bool)>,
    limit: Option<usize>,
    offset: Option<usize>,
}

struct Executor<'a> {
    db: &'a Database,
    tokens: Vec<Token>,
    pos: usize,
    source: String,
    cancel: Option<&'a CancelFlag>,
}

impl<'a> Executor<'a> {
    fn run(&mut self) -> Result<ExecOutcome> {
        match self.current().clone() {
            TokenKind::Keyword("SELECT") => {
                debug!("executing SELECT");
                let stmt = self.parse_select()?;
                self.execute_select(&stmt)
            }
            TokenKind::Keyword("INSERT") => self.execute_insert(),
            TokenKind::Keyword("UPDATE") => self.execute_update(),
            TokenKind::Keyword("DELETE") => self.execute_delete(),
            TokenKind::Keyword("CREATE") => self.execute_create(),
            TokenKind::Keyword("ALTER") => self.execute_alter(),
            TokenKind::Keyword("DROP") => self.execute_drop(),
            _ => Err(self.error("expected a SQL statement")),
        }
    }

    // ------------------------------------------------------------------
    // cursor helpers
    // ------------------------------------------------------------------

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

    fn parse_identifier(&mut self) -> Result<String> {
        if let TokenKind::Identifier(name) = self.current() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("expected identifier"))
        }
    }

    /// Identifier or keyword used as a name (column names after '.', type
    /// names, trigger column targets).
    fn parse_word(&mut self) -> Result<String> {
        match self.current().word() {
            Some(w) => {
                let w = w.to_string();
                self.advance();
                Ok(w)
            }
            None => Err(self.error("expected name")),
        }
    }

    fn parse_usize(&mut self) -> Result<usize> {
        if let TokenKind::Integer(n) = self.current() {
            if *n < 0 {
                return Err(self.error("expected non-negative integer"));
            }
            let n = *n as usize;
            self.advance();
            Ok(n)
        } else {
            Err(self.error("expected integer"))
        }
    }

    /// Capture one expression as a token range, without evaluating it.
    fn take_expr(&mut self) -> Result<TokenRange> {
        let start = self.pos;
        let end = scan_expr(&self.tokens, start);
        if end == start {
            return Err(self.error("expected expression"));
        }
        self.pos = end;
        Ok((start, end))
    }

    fn eval_range(&self, range: TokenRange, row: &Row) -> Result<Value> {
        EvalContext::new(self.db, row).eval(&self.tokens[range.0..range.1])
    }

    fn range_text(&self, range: TokenRange) -> String {
        tokens_text(&self.tokens[range.0..range.1])
    }

    fn check_cancel(&self) -> Result<()> {
        if let Some(flag) = self.cancel {
            if flag.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn parse_select(&mut self) -> Result<SelectStmt> {
        self.expect_kw("SELECT")?;
        let distinct = self.match_kw("DISTINCT");
        let top = if self.match_kw("TOP") {
            Some(self.parse_usize()?)
        } else {
            None
        };

        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        let mut sources = Vec::new();
        let mut joins = Vec::new();
        if self.match_kw("FROM") {
            loop {
                sources.push(self.parse_source()?);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
            while let Some(kind) = self.parse_join_kind()? {
                let source = self.parse_source()?;
                let on = if kind == JoinKind::Cross {
                    None
                } else {
                    self.expect_kw("ON")?;
                    Some(self.take_expr()?)
                };
                joins.push(JoinClause { kind, source, on });
            }
        }

        let where_clause = if self.match_kw("WHERE") {
            Some(self.take_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.match_kw("GROUP") {
            self.expect_kw("BY")?;
            loop {
                group_by.push(self.take_expr()?);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }

        let having = if self.match_kw("HAVING") {
            Some(self.take_expr()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.match_kw("ORDER") {
            self.expect_kw("BY")?;
            loop {
                let range = self.take_expr()?;
                let asc = if self.match_kw("DESC") {
                    false
                } else {
                    self.match_kw("ASC");
                    true
                };
                order_by.push((range, asc));
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }

        let limit = if self.match_kw("LIMIT") {
            Some(self.parse_usize()?)
        } else {
            None
        };
        let offset = if self.match_kw("OFFSET") {
            Some(self.parse_usize()?)
        } else {
            None
        };

        Ok(SelectStmt {
            distinct,
            top,
            items,
            sources,
            joins,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.match_tok(TokenKind::Star) {
            return Ok(SelectItem::Star);
        }
        if let TokenKind::Identifier(alias) = self.current() {
            if *self.peek() == TokenKind::Dot
                && matches!(
                    self.tokens.get(self.pos + 2).map(|t| &t.kind),
                    Some(TokenKind::Star)
                )
            {
                let alias = alias.clone();
                self.advance();
                self.advance();
                self.advance();
                return Ok(SelectItem::QualifiedStar(alias));
            }
        }

        let range = self.take_expr()?;
        let agg = self.detect_aggregate(range);
        let alias = if self.match_kw("AS") {
            Some(self.parse_identifier()?)
        } else if let TokenKind::Identifier(name) = self.current() {
            let name = name.clone();
            self.advance();
            Some(name)
        } else {
            None
        };
        Ok(SelectItem::Expr { range, alias, agg })
    }

    /// Aggregates are detected syntactically: the whole item is one call to
    /// COUNT/SUM/AVG/MIN/MAX, optionally with a leading DISTINCT.
    fn detect_aggregate(&self, range: TokenRange) -> Option<AggSpec> {
        let (start, end) = range;
        let name = self.tokens.get(start)?.kind.word()?;
        if !is_aggregate_name(name) {
            return None;
        }
        if self.tokens.get(start + 1)?.kind != TokenKind::LParen {
            return None;
        }
        let close = matching_paren(&self.tokens[..end], start + 1)?;
        if close != end - 1 {
            return None;
        }
        let mut inner_start = start + 2;
        let distinct = self
            .tokens
            .get(inner_start)
            .map(|t| t.kind.is_kw("DISTINCT"))
            .unwrap_or(false);
        if distinct {
            inner_start += 1;
        }
        let inner = (inner_start, close);
        let key = aggregate_key(name, distinct, &self.tokens[inner.0..inner.1]);
        Some(AggSpec { name: name.to_uppercase(), distinct, inner, key })
    }

    fn parse_source(&mut self) -> Result<SourceRef> {
        let table = self.parse_identifier()?;
        let alias = if self.match_kw("AS") {
            self.parse_identifier()?
        } else if let TokenKind::Identifier(name) = self.current() {
            let name = name.clone();
            self.advance();
            name
        } else {
            table.clone()
        };
        Ok(SourceRef { table, alias })
    }

    fn parse_join_kind(&mut self) -> Result<Option<JoinKind>> {
        let kind = if self.match_kw("INNER") {
            self.expect_kw("JOIN")?;
            JoinKind::Inner
        } else if self.match_kw("LEFT") {
            self.match_kw("OUTER");
            self.expect_kw("JOIN")?;
            JoinKind::Left
        } else if self.match_kw("RIGHT") {
            self.match_kw("OUTER");
            self.expect_kw("JOIN")?;
            JoinKind::Right
        } else if self.match_kw("FULL") {
            self.match_kw("OUTER");
            self.expect_kw("JOIN")?;
            JoinKind::Full
        } else if self.match_kw("CROSS") {
            self.expect_kw("JOIN")?;
            JoinKind::Cross
        } else if self.match_kw("JOIN") {
            JoinKind::Inner
        } else {
            return Ok(None);
        };
        Ok(Some(kind))
    }

    fn execute_select(&mut self, stmt: &SelectStmt) -> Result<ExecOutcome> {
        // source rows merged under bare and alias.column keys
        let mut source_columns: Vec<(String, Vec<String>)> = Vec::new();
        let mut rows: Vec<Row> = if stmt.sources.is_empty() {
            vec![Row::new()]
        } else {
            let mut rows = self.load_source(&stmt.sources[0], &mut source_columns)?;
            for src in &stmt.sources[1..] {
                let right = self.load_source(src, &mut source_columns)?;
                rows = cross_product(&rows, &right);
            }
            rows
        };

        for join in &stmt.joins {
            let right = self.load_source(&join.source, &mut source_columns)?;
            rows = self.apply_join(rows, right, join)?;
        }

        if let Some(range) = stmt.where_clause {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if self.eval_range(range, &row)?.truthy() {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        let has_aggregates = !stmt.group_by.is_empty()
            || stmt
                .items
                .iter()
                .any(|i| matches!(i, SelectItem::Expr { agg: Some(_), .. }));

        if has_aggregates {
            self.execute_grouped(stmt, rows, &source_columns)
        } else {
            self.execute_flat(stmt, rows, &source_columns)
        }
    }

    fn load_source(
        &self,
        source: &SourceRef,
        source_columns: &mut Vec<(String, Vec<String>)>,
    ) -> Result<Vec<Row>> {
        let (names, rows) = self.db.with_table(&source.table, |table| {
            let names: Vec<String> = table.columns().iter().map(|c| c.name.clone()).collect();
            let mut rows = Vec::with_capacity(table.row_count());
            for i in 0..table.row_count() {
                let mut row = Row::new();
                for (c, name) in names.iter().enumerate() {
                    let v = table.get_value(i, c).clone();
                    row.insert(&format!("{}.{}", source.alias, name), v.clone());
                    row.insert(name, v);
                }
                rows.push(row);
            }
            (names, rows)
        })?;
        source_columns.push((source.alias.clone(), names));
        Ok(rows)
    }

    fn apply_join(
        &self,
        left: Vec<Row>,
        right: Vec<Row>,
        join: &JoinClause,
    ) -> Result<Vec<Row>> {
        if join.kind == JoinKind::Cross {
            return Ok(cross_product(&left, &right));
        }
        let on = join.on.expect("non-cross join carries ON");
        let right_pad = null_padding(right.first());
        let left_pad = null_padding(left.first());
        let mut result = Vec::new();
        let mut right_matched = vec![false; right.len()];

        for left_row in &left {
            let mut matched = false;
            for (ri, right_row) in right.iter().enumerate() {
                let merged = merge_rows(left_row, right_row);
                if self.eval_range(on, &merged)?.truthy() {
                    result.push(merged);
                    matched = true;
                    right_matched[ri] = true;
                }
            }
            if !matched && matches!(join.kind, JoinKind::Left | JoinKind::Full) {
                result.push(merge_rows(left_row, &right_pad));
            }
        }
        if matches!(join.kind, JoinKind::Right | JoinKind::Full) {
            for (ri, right_row) in right.iter().enumerate() {
                if !right_matched[ri] {
                    result.push(merge_rows(&left_pad, right_row));
                }
            }
        }
        Ok(result)
    }

    /// Non-aggregated tail of the pipeline: ORDER BY, paging, projection
    /// (with the cancellation point between rows), DISTINCT.
    fn execute_flat(
        &self,
        stmt: &SelectStmt,
        mut rows: Vec<Row>,
        source_columns: &[(String, Vec<String>)],
    ) -> Result<ExecOutcome> {
        // without grouping, HAVING is just a second WHERE
        if let Some(range) = stmt.having {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if self.eval_range(range, &row)?.truthy() {
                    kept.push(row);
                }
            }
            rows = kept;
        }
        if !stmt.order_by.is_empty() {
            rows = self.sort_rows(rows, &stmt.order_by, |row| row.clone())?;
        }
        let rows = page(rows, stmt.offset, stmt.limit.or(stmt.top));

        let headers = self.output_headers(stmt, source_columns)?;
        let mut grid = Vec::with_capacity(rows.len());
        for row in &rows {
            self.check_cancel()?;
            grid.push(self.project_row(stmt, row, source_columns)?);
        }

        let grid = if stmt.distinct {
            distinct_rows(grid, &star_mask(stmt, source_columns))
        } else {
            grid
        };
        Ok(ExecOutcome::Rows(ResultSet { columns: headers, rows: grid }))
    }

    /// Grouped tail: partition, aggregate, HAVING, ORDER BY over grouped
    /// rows, paging, DISTINCT.
    fn execute_grouped(
        &self,
        stmt: &SelectStmt,
        rows: Vec<Row>,
        source_columns: &[(String, Vec<String>)],
    ) -> Result<ExecOutcome> {
        for item in &stmt.items {
            if !matches!(item, SelectItem::Expr { .. }) {
                return Err(EngineError::InvalidArgument(
                    "SELECT * cannot be combined with aggregation".into(),
                ));
            }
        }

        // partition preserving first-seen order
        let mut order: Vec<Vec<String>> = Vec::new();
        let mut groups: HashMap<Vec<String>, Vec<Row>> = HashMap::new();
        for row in rows {
            let mut key = Vec::with_capacity(stmt.group_by.len());
            for range in &stmt.group_by {
                key.push(self.eval_range(*range, &row)?.key_text());
            }
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }
        if groups.is_empty() && stmt.group_by.is_empty() {
            // aggregates over empty input still emit one row
            order.push(Vec::new());
            groups.insert(Vec::new(), Vec::new());
        }

        let mut grouped: Vec<(Row, Vec<Value>)> = Vec::new();
        for key in order {
            self.check_cancel()?;
            let members = groups.remove(&key).unwrap_or_default();
            let first = members.first().cloned().unwrap_or_default();

            let mut grouped_row = Row::new();
            for range in &stmt.group_by {
                let value = self.eval_range(*range, &first).unwrap_or(Value::Null);
                grouped_row.insert(&self.range_text(*range), value);
            }

            let mut output = Vec::with_capacity(stmt.items.len());
            for item in &stmt.items {
                let (range, alias, agg) = match item {
                    SelectItem::Expr { range, alias, agg } => (range, alias, agg),
                    _ => unreachable!(),
                };
                let value = match agg {
                    Some(spec) => {
                        let v = self.compute_aggregate(spec, &members)?;
                        grouped_row.insert(&spec.key, v.clone());
                        if let Some(alias) = alias {
                            grouped_row.insert(alias, v.clone());
                        }
                        v
                    }
                    None => {
                        let v = self.eval_range(*range, &first)?;
                        let name = alias
                            .clone()
                            .unwrap_or_else(|| self.display_name(*range, None));
                        grouped_row.insert(&name, v.clone());
                        v
                    }
                };
                output.push(value);
            }

            if let Some(range) = stmt.having {
                if !self.eval_range(range, &grouped_row)?.truthy() {
                    continue;
                }
            }
            grouped.push((grouped_row, output));
        }

        if !stmt.order_by.is_empty() {
            grouped = self.sort_rows(grouped, &stmt.order_by, |(row, _)| row.clone())?;
        }
        let grouped = page(grouped, stmt.offset, stmt.limit.or(stmt.top));

        let headers = self.output_headers(stmt, source_columns)?;
        let grid: Vec<Vec<Value>> = grouped.into_iter().map(|(_, out)| out).collect();
        let grid = if stmt.distinct {
            distinct_rows(grid, &vec![true; stmt.items.len()])
        } else {
            grid
        };
        Ok(ExecOutcome::Rows(ResultSet { columns: headers, rows: grid }))
    }

    /// Stable multi-key sort using the total order on values.
    fn sort_rows<T>(
        &self,
        rows: Vec<T>,
        order_by: &[(TokenRange, bool)],
        key_row: impl Fn(&T) -> Row,
    ) -> Result<Vec<T>> {
        let mut keyed: Vec<(Vec<Value>, T)> = Vec::with_capacity(rows.len());
        for item in rows {
            let row = key_row(&item);
            let mut keys = Vec::with_capacity(order_by.len());
            for (range, _) in order_by {
                keys.push(self.eval_range(*range, &row)?);
            }
            keyed.push((keys, item));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, (_, asc)) in order_by.iter().enumerate() {
                let ord = a[i].total_cmp(&b[i]);
                let ord = if *asc { ord } else { ord.reverse() };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(_, item)| item).collect())
    }

    fn compute_aggregate(&self, spec: &AggSpec, members: &[Row]) -> Result<Value> {
        let inner = &self.tokens[spec.inner.0..spec.inner.1];
        let is_star = inner.len() == 1 && inner[0].kind == TokenKind::Star;

        if spec.name == "COUNT" && is_star {
            return Ok(Value::Int(members.len() as i64));
        }
        if is_star {
            return Err(EngineError::InvalidArgument(format!(
                "{}(*) is not supported",
                spec.name
            )));
        }

        let mut values = Vec::with_capacity(members.len());
        for row in members {
            let v = EvalContext::new(self.db, row).eval(inner)?;
            if !v.is_null() {
                values.push(v);
            }
        }
        if spec.distinct {
            let mut seen = HashSet::new();
            values.retain(|v| seen.insert(v.key_text()));
        }

        match spec.name.as_str() {
            "COUNT" => Ok(Value::Int(values.len() as i64)),
            "SUM" | "AVG" => {
                let all_int = values.iter().all(|v| matches!(v, Value::Int(_)));
                let sum: f64 = values.iter().map(Value::to_f64).sum();
                if spec.name == "AVG" {
                    if values.is_empty() {
                        Ok(Value::Float(0.0))
                    } else {
                        Ok(Value::Float(sum / values.len() as f64))
                    }
                } else if values.is_empty() {
                    Ok(Value::Int(0))
                } else if all_int {
                    Ok(Value::Int(sum as i64))
                } else {
                    Ok(Value::Float(sum))
                }
            }
            "MIN" => Ok(fold_extreme(values, std::cmp::Ordering::Less)),
            "MAX" => Ok(fold_extreme(values, std::cmp::Ordering::Greater)),
            other => Err(EngineError::FunctionNotFound(other.to_string())),
        }
    }

    fn output_headers(
        &self,
        stmt: &SelectStmt,
        source_columns: &[(String, Vec<String>)],
    ) -> Result<Vec<String>> {
        let mut headers = Vec::new();
        for item in &stmt.items {
            match item {
                SelectItem::Star => {
                    for (_, cols) in source_columns {
                        headers.extend(cols.iter().cloned());
                    }
                }
                SelectItem::QualifiedStar(alias) => {
                    let cols = source_columns
                        .iter()
                        .find(|(a, _)| a.eq_ignore_ascii_case(alias))
                        .ok_or_else(|| EngineError::TableNotFound(alias.clone()))?;
                    headers.extend(cols.1.iter().cloned());
                }
                SelectItem::Expr { range, alias, agg } => {
                    let name = match alias {
                        Some(a) => a.clone(),
                        None => self.display_name(*range, agg.as_ref()),
                    };
                    headers.push(name);
                }
            }
        }
        Ok(headers)
    }

    /// Derived display name: bare identifier for a one-token column ref,
    /// `alias.column` reduced to the column, aggregates use their canonical
    /// key, anything else falls back to the expression text.
    fn display_name(&self, range: TokenRange, agg: Option<&AggSpec>) -> String {
        if let Some(spec) = agg {
            return spec.key.clone();
        }
        let slice = &self.tokens[range.0..range.1];
        if slice.len() == 1 {
            if let TokenKind::Identifier(name) = &slice[0].kind {
                return name.clone();
            }
        }
        if slice.len() == 3 && slice[1].kind == TokenKind::Dot {
            if let Some(col) = slice[2].kind.word() {
                return col.to_string();
            }
        }
        tokens_text(slice)
    }

    fn project_row(
        &self,
        stmt: &SelectStmt,
        row: &Row,
        source_columns: &[(String, Vec<String>)],
    ) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for item in &stmt.items {
            match item {
                SelectItem::Star => {
                    for (alias, cols) in source_columns {
                        for col in cols {
                            out.push(lookup_source_value(row, alias, col));
                        }
                    }
                }
                SelectItem::QualifiedStar(alias) => {
                    let (alias, cols) = source_columns
                        .iter()
                        .find(|(a, _)| a.eq_ignore_ascii_case(alias))
                        .ok_or_else(|| EngineError::TableNotFound(alias.clone()))?;
                    for col in cols {
                        out.push(lookup_source_value(row, alias, col));
                    }
                }
                SelectItem::Expr { range, .. } => {
                    out.push(self.eval_range(*range, row)?);
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // INSERT / UPDATE / DELETE
    // ------------------------------------------------------------------

    fn execute_insert(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("INSERT")?;
        self.expect_kw("INTO")?;
        let table = self.parse_identifier()?;

        let column_names: Vec<String> =
            self.db.with_table(&table, |t| t.columns().iter().map(|c| c.name.clone()).collect())?;

        let targets = if self.match_tok(TokenKind::LParen) {
            let mut cols = Vec::new();
            loop {
                cols.push(self.parse_identifier()?);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
            self.expect_tok(TokenKind::RParen)?;
            for col in &cols {
                if !column_names.iter().any(|c| c.eq_ignore_ascii_case(col)) {
                    return Err(EngineError::ColumnNotFound(col.clone()));
                }
            }
            cols
        } else {
            column_names.clone()
        };

        self.expect_kw("VALUES")?;
        let mut tuples: Vec<Vec<TokenRange>> = Vec::new();
        loop {
            self.expect_tok(TokenKind::LParen)?;
            let mut tuple = Vec::new();
            loop {
                tuple.push(self.take_expr()?);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
            self.expect_tok(TokenKind::RParen)?;
            if tuple.len() != targets.len() {
                return Err(EngineError::TypeMismatch(format!(
                    "INSERT expects {} values, got {}",
                    targets.len(),
                    tuple.len()
                )));
            }
            tuples.push(tuple);
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        debug!("INSERT INTO {}: {} row(s)", table, tuples.len());
        let before = self.db.triggers_for(&table, TriggerTiming::Before, TriggerEvent::Insert);
        let after = self.db.triggers_for(&table, TriggerTiming::After, TriggerEvent::Insert);

        let empty = Row::new();
        let mut appended = 0usize;
        for tuple in tuples {
            // values see an empty row context: literals and functions only
            let mut new = Row::new();
            for name in &column_names {
                new.insert(name, Value::Null);
            }
            for (col, range) in targets.iter().zip(&tuple) {
                new.insert(col, self.eval_range(*range, &empty)?);
            }

            let mut ctx = trigger_context(&column_names, Some(&new), None);
            for trig in &before {
                run_trigger(self.db, trig, &mut ctx)?;
            }

            let values: Vec<Value> = column_names
                .iter()
                .map(|c| ctx.get(&format!("NEW.{}", c)).cloned().unwrap_or(Value::Null))
                .collect();
            let index = self.db.with_table_mut(&table, |t| {
                t.add_row(values)?;
                Ok(t.row_count() - 1)
            })?;
            appended += 1;

            if !after.is_empty() {
                let actual = self.db.with_table(&table, |t| t.row_map(index))?;
                let mut ctx = trigger_context(&column_names, Some(&actual), None);
                for trig in &after {
                    run_trigger(self.db, trig, &mut ctx)?;
                }
            }
        }
        Ok(ExecOutcome::Affected(appended))
    }

    fn execute_update(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("UPDATE")?;
        let table = self.parse_identifier()?;
        self.expect_kw("SET")?;

        let column_names: Vec<String> =
            self.db.with_table(&table, |t| t.columns().iter().map(|c| c.name.clone()).collect())?;

        let mut assignments: Vec<(String, TokenRange)> = Vec::new();
        loop {
            let col = self.parse_identifier()?;
            if !column_names.iter().any(|c| c.eq_ignore_ascii_case(&col)) {
                return Err(EngineError::ColumnNotFound(col));
            }
            if !matches!(self.current(), TokenKind::Eq | TokenKind::Assign) {
                return Err(self.error("expected = in SET"));
            }
            self.advance();
            assignments.push((col, self.take_expr()?));
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        let where_clause = if self.match_kw("WHERE") {
            Some(self.take_expr()?)
        } else {
            None
        };

        let before = self.db.triggers_for(&table, TriggerTiming::Before, TriggerEvent::Update);
        let after = self.db.triggers_for(&table, TriggerTiming::After, TriggerEvent::Update);

        let mut updated = 0usize;
        let mut i = 0usize;
        loop {
            let total = self.db.with_table(&table, |t| t.row_count())?;
            if i >= total {
                break;
            }
            let old = self.db.with_table(&table, |t| t.row_map(i))?;
            if let Some(range) = where_clause {
                if !self.eval_range(range, &old)?.truthy() {
                    i += 1;
                    continue;
                }
            }

            // trial NEW: every assignment sees the pre-update row
            let mut new = old.clone();
            for (col, range) in &assignments {
                new.insert(col, self.eval_range(*range, &old)?);
            }

            let mut ctx = trigger_context(&column_names, Some(&new), Some(&old));
            for trig in &before {
                run_trigger(self.db, trig, &mut ctx)?;
            }

            let values: Vec<Value> = column_names
                .iter()
                .map(|c| ctx.get(&format!("NEW.{}", c)).cloned().unwrap_or(Value::Null))
                .collect();
            self.db.with_table_mut(&table, |t| t.update_row(i, values))?;
            updated += 1;

            if !after.is_empty() {
                let actual = self.db.with_table(&table, |t| t.row_map(i))?;
                let mut ctx = trigger_context(&column_names, Some(&actual), Some(&old));
                for trig in &after {
                    run_trigger(self.db, trig, &mut ctx)?;
                }
            }
            i += 1;
        }
        debug!("UPDATE {}: {} row(s)", table, updated);
        Ok(ExecOutcome::Affected(updated))
    }

    fn execute_delete(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("DELETE")?;
        self.expect_kw("FROM")?;
        let table = self.parse_identifier()?;

        let column_names: Vec<String> =
            self.db.with_table(&table, |t| t.columns().iter().map(|c| c.name.clone()).collect())?;

        let where_clause = if self.match_kw("WHERE") {
            Some(self.take_expr()?)
        } else {
            None
        };

        let before = self.db.triggers_for(&table, TriggerTiming::Before, TriggerEvent::Delete);
        let after = self.db.triggers_for(&table, TriggerTiming::After, TriggerEvent::Delete);

        let total = self.db.with_table(&table, |t| t.row_count())?;
        let mut removed = 0usize;
        // highest index first, so earlier removals do not shift later ones
        for i in (0..total).rev() {
            let current = self.db.with_table(&table, |t| t.row_count())?;
            if i >= current {
                continue;
            }
            let old = self.db.with_table(&table, |t| t.row_map(i))?;
            if let Some(range) = where_clause {
                if !self.eval_range(range, &old)?.truthy() {
                    continue;
                }
            }
            let mut ctx = trigger_context(&column_names, None, Some(&old));
            for trig in &before {
                run_trigger(self.db, trig, &mut ctx)?;
            }
            self.db.with_table_mut(&table, |t| {
                t.delete_row(i);
                Ok(())
            })?;
            removed += 1;
            let mut ctx = trigger_context(&column_names, None, Some(&old));
            for trig in &after {
                run_trigger(self.db, trig, &mut ctx)?;
            }
        }
        debug!("DELETE FROM {}: {} row(s)", table, removed);
        Ok(ExecOutcome::Affected(removed))
    }

    // ------------------------------------------------------------------
    // CREATE / ALTER / DROP
    // ------------------------------------------------------------------

    fn execute_create(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("CREATE")?;
        if self.current().is_kw("TABLE") {
            self.execute_create_table()
        } else if self.current().is_kw("FUNCTION") {
            self.execute_create_function()
        } else if self.current().is_kw("TRIGGER") {
            self.execute_create_trigger()
        } else {
            Err(self.error("expected TABLE, FUNCTION, or TRIGGER after CREATE"))
        }
    }

    fn execute_create_table(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("TABLE")?;
        let name = self.parse_identifier()?;
        self.expect_tok(TokenKind::LParen)?;

        const TABLE_CONSTRAINTS: [&str; 6] =
            ["PRIMARY", "UNIQUE", "FOREIGN", "CONSTRAINT", "INDEX", "KEY"];

        let mut columns = Vec::new();
        loop {
            let is_constraint = matches!(
                self.current(),
                TokenKind::Keyword(k) if TABLE_CONSTRAINTS.contains(k)
            );
            if is_constraint {
                self.skip_constraint_entry();
            } else {
                let col_name = self.parse_identifier()?;
                let ty = self.parse_type()?;
                columns.push(Column::new(col_name, ty));
                // per-column constraints are parsed and discarded
                self.skip_constraint_entry();
            }
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }
        self.expect_tok(TokenKind::RParen)?;

        debug!("CREATE TABLE {} ({} columns)", name, columns.len());
        self.db.add_table(Table::new(name, columns)?)?;
        Ok(ExecOutcome::Affected(0))
    }

    /// Skip the remainder of a column or constraint entry, up to the next
    /// depth-zero comma or the closing paren.
    fn skip_constraint_entry(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.current() {
                TokenKind::Eof => return,
                TokenKind::Comma if depth == 0 => return,
                TokenKind::RParen if depth == 0 => return,
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Type name with optional, discarded precision arguments.
    fn parse_type(&mut self) -> Result<ColumnType> {
        let name = self.parse_word()?;
        if self.match_tok(TokenKind::LParen) {
            while !matches!(self.current(), TokenKind::RParen | TokenKind::Eof) {
                self.advance();
            }
            self.expect_tok(TokenKind::RParen)?;
        }
        Ok(ColumnType::from_sql_name(&name))
    }

    /// CREATE FUNCTION name(@p type, ...) RETURNS type AS BEGIN RETURN expr; END
    ///
    /// Only the single RETURN expression is honored; any other body content
    /// is scanned past.
    fn execute_create_function(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("FUNCTION")?;
        let name = self.parse_identifier()?;
        self.expect_tok(TokenKind::LParen)?;

        let mut params = Vec::new();
        if *self.current() != TokenKind::RParen {
            loop {
                let pname = self.parse_identifier()?;
                let ty = self.parse_type()?;
                params.push((pname, ty));
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect_tok(TokenKind::RParen)?;
        self.expect_kw("RETURNS")?;
        let return_type = self.parse_type()?;
        self.match_kw("AS");
        self.expect_kw("BEGIN")?;

        while !self.current().is_kw("RETURN") {
            if *self.current() == TokenKind::Eof {
                return Err(self.error("expected RETURN in function body"));
            }
            self.advance();
        }
        self.advance(); // RETURN
        let range = self.take_expr()?;
        let body = self.tokens[range.0..range.1].to_vec();

        self.db.add_function(UserFunction { name, params, return_type, body })?;
        Ok(ExecOutcome::Affected(0))
    }

    /// CREATE TRIGGER name {BEFORE|AFTER} {INSERT|UPDATE|DELETE} ON t
    /// [FOR EACH ROW] [AS] BEGIN body END
    fn execute_create_trigger(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("TRIGGER")?;
        let name = self.parse_identifier()?;

        let timing = if self.match_kw("BEFORE") {
            TriggerTiming::Before
        } else if self.match_kw("AFTER") {
            TriggerTiming::After
        } else {
            return Err(self.error("expected BEFORE or AFTER"));
        };
        let event = if self.match_kw("INSERT") {
            TriggerEvent::Insert
        } else if self.match_kw("UPDATE") {
            TriggerEvent::Update
        } else if self.match_kw("DELETE") {
            TriggerEvent::Delete
        } else {
            return Err(self.error("expected INSERT, UPDATE, or DELETE"));
        };

        self.expect_kw("ON")?;
        let table = self.parse_identifier()?;
        if self.match_kw("FOR") {
            self.expect_kw("EACH")?;
            self.expect_kw("ROW")?;
        }
        self.match_kw("AS");
        self.expect_kw("BEGIN")?;

        let body_start = self.pos;
        let body_end = self.find_trigger_body_end(body_start)?;
        let body = parse_trigger_body(&self.tokens[body_start..body_end])?;
        self.pos = body_end;
        self.expect_kw("END")?;

        debug!("CREATE TRIGGER {} on {}", name, table);
        self.db.add_trigger(Trigger {
            name,
            table,
            timing,
            event,
            body,
            source: self.source.trim().to_string(),
        })?;
        Ok(ExecOutcome::Affected(0))
    }

    /// Locate the END that closes the trigger body, stepping over END IF
    /// pairs and CASE...END expressions.
    fn find_trigger_body_end(&self, start: usize) -> Result<usize> {
        let mut depth = 0usize;
        let mut i = start;
        while i < self.tokens.len() {
            let kind = &self.tokens[i].kind;
            let next = self.tokens.get(i + 1).map(|t| &t.kind);
            if kind.is_kw("IF") && !matches!(next, Some(TokenKind::LParen)) {
                depth += 1;
            } else if kind.is_kw("CASE") {
                depth += 1;
            } else if kind.is_kw("END") {
                if matches!(next, Some(k) if k.is_kw("IF")) {
                    depth = depth.saturating_sub(1);
                    i += 2;
                    continue;
                }
                if depth == 0 {
                    return Ok(i);
                }
                depth -= 1;
            }
            i += 1;
        }
        Err(EngineError::ParseError("unterminated trigger body".into()))
    }

    fn execute_alter(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("ALTER")?;
        self.expect_kw("TABLE")?;
        let table = self.parse_identifier()?;

        if self.match_kw("ADD") {
            self.match_kw("COLUMN");
            if !matches!(self.current(), TokenKind::Identifier(_)) {
                // ADD CONSTRAINT and friends: parsed, ignored
                self.skip_rest();
                return Ok(ExecOutcome::Affected(0));
            }
            let name = self.parse_identifier()?;
            let ty = self.parse_type()?;
            self.db.with_table_mut(&table, |t| t.add_column(Column::new(name, ty)))?;
            return Ok(ExecOutcome::Affected(0));
        }
        if self.match_kw("DROP") {
            self.match_kw("COLUMN");
            if self.current().is_kw("CONSTRAINT") {
                self.skip_rest();
                return Ok(ExecOutcome::Affected(0));
            }
            let name = self.parse_identifier()?;
            self.db.with_table_mut(&table, |t| t.drop_column(&name))?;
            return Ok(ExecOutcome::Affected(0));
        }
        if self.current().is_kw("RENAME") {
            return Err(self.error("ALTER TABLE ... RENAME is not supported"));
        }
        // other ALTER variants are parsed and silently ignored
        self.skip_rest();
        Ok(ExecOutcome::Affected(0))
    }

    fn skip_rest(&mut self) {
        while !matches!(self.current(), TokenKind::Eof) {
            self.advance();
        }
    }

    fn execute_drop(&mut self) -> Result<ExecOutcome> {
        self.expect_kw("DROP")?;
        if self.match_kw("TABLE") {
            let if_exists = self.match_if_exists()?;
            let name = self.parse_identifier()?;
            if !self.db.drop_table(&name) && !if_exists {
                return Err(EngineError::TableNotFound(name));
            }
            return Ok(ExecOutcome::Affected(0));
        }
        if self.match_kw("FUNCTION") {
            let name = self.parse_identifier()?;
            if !self.db.drop_function(&name) {
                return Err(EngineError::FunctionNotFound(name));
            }
            return Ok(ExecOutcome::Affected(0));
        }
        if self.match_kw("TRIGGER") {
            let if_exists = self.match_if_exists()?;
            let name = self.parse_identifier()?;
            if !self.db.drop_trigger(&name) && !if_exists {
                return Err(EngineError::TriggerNotFound(name));
            }
            return Ok(ExecOutcome::Affected(0));
        }
        Err(self.error("expected TABLE, FUNCTION, or TRIGGER after DROP"))
    }

    fn match_if_exists(&mut self) -> Result<bool> {
        if self.match_kw("IF") {
            self.expect_kw("EXISTS")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ----------------------------------------------------------------------
// row combinators
// ----------------------------------------------------------------------

/// Merge one row from each side: qualified keys always carry over, bare keys
/// keep the earlier source's binding.
fn merge_rows(left: &Row, right: &Row) -> Row {
    let mut merged = left.clone();
    for (key, value) in right.iter() {
        if key.contains('.') {
            merged.insert(key, value.clone());
        } else {
            merged.insert_if_absent(key, value.clone());
        }
    }
    merged
}

fn cross_product(left: &[Row], right: &[Row]) -> Vec<Row> {
    let mut result = Vec::with_capacity(left.len() * right.len());
    for l in left {
        for r in right {
            result.push(merge_rows(l, r));
        }
    }
    result
}

/// Null row over the key set of a side's first row, used to pad unmatched
/// rows in outer joins.
fn null_padding(template: Option<&Row>) -> Row {
    let mut pad = Row::new();
    if let Some(row) = template {
        for (key, _) in row.iter() {
            pad.insert(key, Value::Null);
        }
    }
    pad
}

fn lookup_source_value(row: &Row, alias: &str, col: &str) -> Value {
    row.get(&format!("{}.{}", alias, col))
        .or_else(|| row.get(col))
        .cloned()
        .unwrap_or(Value::Null)
}

fn page<T>(rows: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    rows.into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn fold_extreme(values: Vec<Value>, keep: std::cmp::Ordering) -> Value {
    let mut best: Option<Value> = None;
    for v in values {
        best = Some(match best {
            None => v,
            Some(current) => {
                if v.total_cmp(&current) == keep {
                    v
                } else {
                    current
                }
            }
        });
    }
    best.unwrap_or(Value::Null)
}

/// Which output positions participate in the DISTINCT key (everything a
/// `*` expanded is excluded).
fn star_mask(stmt: &SelectStmt, source_columns: &[(String, Vec<String>)]) -> Vec<bool> {
    let mut mask = Vec::new();
    for item in &stmt.items {
        match item {
            SelectItem::Star => {
                for (_, cols) in source_columns {
                    mask.extend(std::iter::repeat(false).take(cols.len()));
                }
            }
            SelectItem::QualifiedStar(alias) => {
                let n = source_columns
                    .iter()
                    .find(|(a, _)| a.eq_ignore_ascii_case(alias))
                    .map(|(_, c)| c.len())
                    .unwrap_or(0);
                mask.extend(std::iter::repeat(false).take(n));
            }
            SelectItem::Expr { .. } => mask.push(true),
        }
    }
    mask
}

/// Deduplicate output rows by the concatenated text of the masked values.
/// With no masked positions at all, every value participates.
fn distinct_rows(rows: Vec<Vec<Value>>, mask: &[bool]) -> Vec<Vec<Value>> {
    let any_masked = mask.iter().any(|m| *m);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        let key: String = row
            .iter()
            .enumerate()
            .filter(|(i, _)| !any_masked || mask.get(*i).copied().unwrap_or(true))
            .map(|(_, v)| format!("{}|", v.key_text()))
            .collect();
        if seen.insert(key) {
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn db_with_products() -> Database {
        let db = Database::new();
        db.execute_non_query(
            "CREATE TABLE Products (Id INT, Name VARCHAR(50), Category VARCHAR(50), Price FLOAT, Stock INT)",
        )
        .unwrap();
        for row in [
            "(1, 'Hammer', 'Tools', 12.99, 200)",
            "(2, 'Wrench', 'Tools', 19.99, 85)",
            "(3, 'Drill', 'Tools', 149.99, 32)",
            "(4, 'Paint', 'Supplies', 8.49, 500)",
            "(5, 'Paintbrush', 'Supplies', 3.99, 1200)",
        ] {
            db.execute_non_query(&format!("INSERT INTO Products VALUES {}", row)).unwrap();
        }
        db
    }

    fn texts(rs: &ResultSet, col: usize) -> Vec<String> {
        rs.rows.iter().map(|r| r[col].render()).collect()
    }

    #[test]
    fn test_select_without_from() {
        let db = Database::new();
        let rs = db.execute_reader("SELECT 1 + 1 AS Two").unwrap();
        assert_eq!(rs.columns, vec!["Two"]);
        assert!(matches!(rs.rows[0][0], Value::Int(2)));
    }

    #[test]
    fn test_select_star_and_headers() {
        let db = db_with_products();
        let rs = db.execute_reader("SELECT * FROM Products").unwrap();
        assert_eq!(rs.columns, vec!["Id", "Name", "Category", "Price", "Stock"]);
        assert_eq!(rs.row_count(), 5);
    }

    #[test]
    fn test_where_and_like() {
        let db = db_with_products();
        let rs = db
            .execute_reader("SELECT Name FROM Products WHERE Name LIKE 'Dr__l'")
            .unwrap();
        assert_eq!(texts(&rs, 0), vec!["Drill"]);
    }

    #[test]
    fn test_group_by_count_order() {
        let db = db_with_products();
        let rs = db
            .execute_reader(
                "SELECT Category, COUNT(*) FROM Products GROUP BY Category ORDER BY Category ASC",
            )
            .unwrap();
        assert_eq!(rs.columns, vec!["Category", "COUNT(*)"]);
        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.rows[0][0].render(), "Supplies");
        assert!(matches!(rs.rows[0][1], Value::Int(2)));
        assert_eq!(rs.rows[1][0].render(), "Tools");
        assert!(matches!(rs.rows[1][1], Value::Int(3)));
    }

    #[test]
    fn test_having_resolves_aggregate_by_shape_and_alias() {
        let db = db_with_products();
        let rs = db
            .execute_reader(
                "SELECT Category, COUNT(*) AS Cnt FROM Products GROUP BY Category \
                 HAVING COUNT(*) > 2",
            )
            .unwrap();
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.rows[0][0].render(), "Tools");

        let rs = db
            .execute_reader(
                "SELECT Category, COUNT(*) AS Cnt FROM Products GROUP BY Category \
                 HAVING Cnt > 2 ORDER BY Cnt DESC",
            )
            .unwrap();
        assert_eq!(rs.row_count(), 1);
    }

    #[test]
    fn test_having_without_group_by_is_second_where() {
        let db = db_with_products();
        let rs = db
            .execute_reader(
                "SELECT Name FROM Products WHERE Category = 'Tools' HAVING Price < 20 \
                 ORDER BY Id",
            )
            .unwrap();
        assert_eq!(texts(&rs, 0), vec!["Hammer", "Wrench"]);
    }

    #[test]
    fn test_aggregates_sum_avg_min_max() {
        let db = db_with_products();
        let rs = db
            .execute_reader(
                "SELECT SUM(Stock), AVG(Price), MIN(Price), MAX(Name) FROM Products",
            )
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Int(2017)));
        assert!(matches!(rs.rows[0][1], Value::Float(f) if (f - 39.09).abs() < 0.001));
        assert!(matches!(rs.rows[0][2], Value::Float(f) if f == 3.99));
        assert_eq!(rs.rows[0][3].render(), "Wrench");
    }

    #[test]
    fn test_count_distinct() {
        let db = db_with_products();
        let rs = db
            .execute_reader("SELECT COUNT(DISTINCT Category) FROM Products")
            .unwrap();
        assert_eq!(rs.columns, vec!["COUNT(DISTINCT Category)"]);
        assert!(matches!(rs.rows[0][0], Value::Int(2)));
    }

    #[test]
    fn test_aggregate_over_empty_input() {
        let db = db_with_products();
        let rs = db
            .execute_reader("SELECT COUNT(*), SUM(Price) FROM Products WHERE Price > 1000")
            .unwrap();
        assert_eq!(rs.row_count(), 1);
        assert!(matches!(rs.rows[0][0], Value::Int(0)));
        assert!(matches!(rs.rows[0][1], Value::Int(0)));
    }

    #[test]
    fn test_order_by_desc_and_paging() {
        let db = db_with_products();
        let rs = db
            .execute_reader(
                "SELECT Name FROM Products ORDER BY Price DESC LIMIT 2 OFFSET 1",
            )
            .unwrap();
        assert_eq!(texts(&rs, 0), vec!["Wrench", "Hammer"]);
    }

    #[test]
    fn test_top_sets_limit() {
        let db = db_with_products();
        let rs = db
            .execute_reader("SELECT TOP 3 Name FROM Products ORDER BY Id")
            .unwrap();
        assert_eq!(rs.row_count(), 3);
    }

    #[test]
    fn test_distinct_output() {
        let db = db_with_products();
        let rs = db.execute_reader("SELECT DISTINCT Category FROM Products").unwrap();
        assert_eq!(rs.row_count(), 2);
    }

    #[test]
    fn test_expression_item_and_alias() {
        let db = db_with_products();
        let rs = db
            .execute_reader("SELECT Name, Price * 2 AS Doubled FROM Products WHERE Id = 1")
            .unwrap();
        assert_eq!(rs.columns, vec!["Name", "Doubled"]);
        assert!(matches!(rs.rows[0][1], Value::Float(f) if f == 25.98));
    }

    #[test]
    fn test_case_in_projection() {
        let db = db_with_products();
        let rs = db
            .execute_reader(
                "SELECT CASE WHEN 12.99 < 10 THEN 'Budget' WHEN 12.99 < 50 THEN 'Mid' \
                 ELSE 'Premium' END AS Tier",
            )
            .unwrap();
        assert_eq!(rs.rows[0][0].render(), "Mid");
    }

    fn db_with_orders() -> Database {
        let db = db_with_products();
        db.execute_non_query("CREATE TABLE Orders (OrderId INT, ProductId INT, Qty INT)")
            .unwrap();
        db.execute_non_query(
            "INSERT INTO Orders VALUES (100, 1, 2), (101, 3, 1), (102, 99, 5)",
        )
        .unwrap();
        db
    }

    #[test]
    fn test_inner_join() {
        let db = db_with_orders();
        let rs = db
            .execute_reader(
                "SELECT o.OrderId, p.Name FROM Orders o \
                 INNER JOIN Products p ON o.ProductId = p.Id ORDER BY o.OrderId",
            )
            .unwrap();
        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.rows[0][1].render(), "Hammer");
        assert_eq!(rs.rows[1][1].render(), "Drill");
    }

    #[test]
    fn test_left_join_pads_nulls() {
        let db = db_with_orders();
        let rs = db
            .execute_reader(
                "SELECT o.OrderId, p.Name FROM Orders o \
                 LEFT JOIN Products p ON o.ProductId = p.Id ORDER BY o.OrderId",
            )
            .unwrap();
        assert_eq!(rs.row_count(), 3);
        assert!(rs.rows[2][1].is_null());
    }

    #[test]
    fn test_right_and_full_join() {
        let db = db_with_orders();
        let rs = db
            .execute_reader(
                "SELECT p.Name, o.OrderId FROM Orders o \
                 RIGHT JOIN Products p ON o.ProductId = p.Id",
            )
            .unwrap();
        assert_eq!(rs.row_count(), 5); // 2 matches + 3 unmatched products
        let rs = db
            .execute_reader(
                "SELECT p.Name, o.OrderId FROM Orders o \
                 FULL JOIN Products p ON o.ProductId = p.Id",
            )
            .unwrap();
        assert_eq!(rs.row_count(), 6); // 2 matches + order 102 + 3 products
    }

    #[test]
    fn test_cross_join_and_comma_sources() {
        let db = db_with_orders();
        let rs = db
            .execute_reader("SELECT o.OrderId, p.Id FROM Orders o CROSS JOIN Products p")
            .unwrap();
        assert_eq!(rs.row_count(), 15);
        let rs = db
            .execute_reader("SELECT o.OrderId, p.Id FROM Orders o, Products p")
            .unwrap();
        assert_eq!(rs.row_count(), 15);
    }

    #[test]
    fn test_insert_named_columns_defaults_null() {
        let db = db_with_products();
        let n = db
            .execute_non_query("INSERT INTO Products (Id, Name) VALUES (6, 'Saw')")
            .unwrap();
        assert_eq!(n, 1);
        let rs = db
            .execute_reader("SELECT Category, Price FROM Products WHERE Id = 6")
            .unwrap();
        assert!(rs.rows[0][0].is_null());
        assert!(rs.rows[0][1].is_null());
    }

    #[test]
    fn test_insert_unknown_column_fails() {
        let db = db_with_products();
        let result = db.execute_non_query("INSERT INTO Products (Nope) VALUES (1)");
        assert!(matches!(result, Err(EngineError::ColumnNotFound(_))));
    }

    #[test]
    fn test_update_with_where_counts_filtered() {
        let db = db_with_products();
        let n = db
            .execute_non_query("UPDATE Products SET Price = Price * 2 WHERE Category = 'Tools'")
            .unwrap();
        assert_eq!(n, 3);
        let rs = db
            .execute_reader("SELECT Price FROM Products WHERE Id = 1")
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Float(f) if f == 25.98));
    }

    #[test]
    fn test_update_assignments_see_pre_update_row() {
        let db = db_with_products();
        db.execute_non_query("UPDATE Products SET Price = Stock, Stock = Price WHERE Id = 1")
            .unwrap();
        let rs = db
            .execute_reader("SELECT Price, Stock FROM Products WHERE Id = 1")
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Float(f) if f == 200.0));
        assert!(matches!(rs.rows[0][1], Value::Int(12)));
    }

    #[test]
    fn test_delete_with_where() {
        let db = db_with_products();
        let n = db
            .execute_non_query("DELETE FROM Products WHERE Category = 'Supplies'")
            .unwrap();
        assert_eq!(n, 2);
        let rs = db.execute_reader("SELECT * FROM Products").unwrap();
        assert_eq!(rs.row_count(), 3);
    }

    #[test]
    fn test_create_table_constraints_discarded() {
        let db = Database::new();
        db.execute_non_query(
            "CREATE TABLE T (Id INT NOT NULL PRIMARY KEY IDENTITY(1,1), \
             Name VARCHAR(20) DEFAULT 'x' UNIQUE, \
             Other INT REFERENCES U(Id), \
             PRIMARY KEY (Id), \
             CONSTRAINT fk FOREIGN KEY (Other) REFERENCES U(Id))",
        )
        .unwrap();
        let rs = db.execute_reader("SELECT * FROM T").unwrap();
        assert_eq!(rs.columns, vec!["Id", "Name", "Other"]);
    }

    #[test]
    fn test_create_table_unknown_type_defaults_text() {
        let db = Database::new();
        db.execute_non_query("CREATE TABLE T (X FROBNICATOR)").unwrap();
        db.execute_non_query("INSERT INTO T VALUES (123)").unwrap();
        let rs = db.execute_reader("SELECT X FROM T").unwrap();
        assert_eq!(rs.rows[0][0].render(), "123");
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let db = Database::new();
        db.execute_non_query("CREATE TABLE T (Id INT)").unwrap();
        assert!(matches!(
            db.execute_non_query("CREATE TABLE t (Id INT)"),
            Err(EngineError::Duplicate(_))
        ));
    }

    #[test]
    fn test_alter_add_drop_column() {
        let db = db_with_products();
        db.execute_non_query("ALTER TABLE Products ADD COLUMN Sku VARCHAR(20)").unwrap();
        let rs = db.execute_reader("SELECT Sku FROM Products WHERE Id = 1").unwrap();
        assert!(rs.rows[0][0].is_null());
        db.execute_non_query("ALTER TABLE Products DROP COLUMN Sku").unwrap();
        assert!(db.execute_reader("SELECT Sku FROM Products").is_err());
    }

    #[test]
    fn test_alter_rename_rejected() {
        let db = db_with_products();
        assert!(matches!(
            db.execute_non_query("ALTER TABLE Products RENAME TO Items"),
            Err(EngineError::ParseError(_))
        ));
    }

    #[test]
    fn test_drop_table_if_exists() {
        let db = Database::new();
        db.execute_non_query("DROP TABLE IF EXISTS Nope").unwrap();
        assert!(matches!(
            db.execute_non_query("DROP TABLE Nope"),
            Err(EngineError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_create_function_and_call() {
        let db = Database::new();
        db.execute_non_query(
            "CREATE FUNCTION Tax(@amount FLOAT) RETURNS FLOAT AS BEGIN RETURN @amount * 0.2; END",
        )
        .unwrap();
        let rs = db.execute_reader("SELECT Tax(100)").unwrap();
        assert!(matches!(rs.rows[0][0], Value::Float(f) if f == 20.0));
        assert!(db.execute_non_query("DROP FUNCTION Tax").is_ok());
        assert!(matches!(
            db.execute_non_query("DROP FUNCTION Tax"),
            Err(EngineError::FunctionNotFound(_))
        ));
    }

    #[test]
    fn test_before_insert_trigger_clamps_price() {
        let db = db_with_products();
        db.execute_non_query(
            "CREATE TRIGGER PriceFloor BEFORE INSERT ON Products FOR EACH ROW BEGIN \
             IF NEW.Price < 1.0 THEN SET NEW.Price = 1.0; END IF; END",
        )
        .unwrap();
        db.execute_non_query("INSERT INTO Products VALUES (6, 'Freebie', 'Samples', 0.0, 10)")
            .unwrap();
        let rs = db
            .execute_reader("SELECT Price FROM Products WHERE Id = 6")
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Float(f) if f == 1.0));
    }

    #[test]
    fn test_last_before_trigger_wins() {
        let db = db_with_products();
        db.execute_non_query(
            "CREATE TRIGGER SetA BEFORE INSERT ON Products BEGIN SET NEW.Stock = 1; END",
        )
        .unwrap();
        db.execute_non_query(
            "CREATE TRIGGER SetB BEFORE INSERT ON Products BEGIN SET NEW.Stock = 2; END",
        )
        .unwrap();
        db.execute_non_query("INSERT INTO Products VALUES (7, 'X', 'Y', 5.0, 99)").unwrap();
        let rs = db
            .execute_reader("SELECT Stock FROM Products WHERE Id = 7")
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Int(2)));
    }

    #[test]
    fn test_after_insert_trigger_embedded_dml() {
        let db = db_with_products();
        db.execute_non_query("CREATE TABLE Audit (ProductId INT, Note VARCHAR(50))").unwrap();
        db.execute_non_query(
            "CREATE TRIGGER LogInsert AFTER INSERT ON Products BEGIN \
             INSERT INTO Audit VALUES (NEW.Id, 'inserted'); END",
        )
        .unwrap();
        db.execute_non_query("INSERT INTO Products VALUES (8, 'Chisel', 'Tools', 9.99, 40)")
            .unwrap();
        let rs = db.execute_reader("SELECT ProductId, Note FROM Audit").unwrap();
        assert_eq!(rs.row_count(), 1);
        assert!(matches!(rs.rows[0][0], Value::Int(8)));
    }

    #[test]
    fn test_trigger_embedded_dml_errors_swallowed() {
        let db = db_with_products();
        db.execute_non_query(
            "CREATE TRIGGER Broken AFTER INSERT ON Products BEGIN \
             INSERT INTO NoSuchTable VALUES (1); END",
        )
        .unwrap();
        // the outer insert still succeeds
        let n = db
            .execute_non_query("INSERT INTO Products VALUES (9, 'Plane', 'Tools', 25.0, 5)")
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_delete_trigger_sees_old() {
        let db = db_with_products();
        db.execute_non_query("CREATE TABLE Graveyard (Name VARCHAR(50))").unwrap();
        db.execute_non_query(
            "CREATE TRIGGER Bury BEFORE DELETE ON Products BEGIN \
             INSERT INTO Graveyard VALUES (OLD.Name); END",
        )
        .unwrap();
        db.execute_non_query("DELETE FROM Products WHERE Id = 3").unwrap();
        let rs = db.execute_reader("SELECT Name FROM Graveyard").unwrap();
        assert_eq!(rs.rows[0][0].render(), "Drill");
    }

    #[test]
    fn test_drop_trigger_stops_firing() {
        let db = db_with_products();
        db.execute_non_query(
            "CREATE TRIGGER Clamp BEFORE INSERT ON Products BEGIN SET NEW.Stock = 0; END",
        )
        .unwrap();
        db.execute_non_query("DROP TRIGGER Clamp").unwrap();
        db.execute_non_query("INSERT INTO Products VALUES (10, 'Vise', 'Tools', 30.0, 77)")
            .unwrap();
        let rs = db
            .execute_reader("SELECT Stock FROM Products WHERE Id = 10")
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Int(77)));
        assert!(db.execute_non_query("DROP TRIGGER IF EXISTS Clamp").is_ok());
        assert!(matches!(
            db.execute_non_query("DROP TRIGGER Clamp"),
            Err(EngineError::TriggerNotFound(_))
        ));
    }

    #[test]
    fn test_update_trigger_mutates_new() {
        let db = db_with_products();
        db.execute_non_query(
            "CREATE TRIGGER CapPrice BEFORE UPDATE ON Products BEGIN \
             IF NEW.Price > 100 THEN SET NEW.Price = 100; END IF; END",
        )
        .unwrap();
        db.execute_non_query("UPDATE Products SET Price = 500 WHERE Id = 1").unwrap();
        let rs = db
            .execute_reader("SELECT Price FROM Products WHERE Id = 1")
            .unwrap();
        assert!(matches!(rs.rows[0][0], Value::Float(f) if f == 100.0));
    }

    #[test]
    fn test_division_by_zero_aborts_statement() {
        let db = db_with_products();
        assert!(matches!(
            db.execute_reader("SELECT Price / 0 FROM Products"),
            Err(EngineError::DivisionByZero)
        ));
    }

    #[test]
    fn test_cancel_flag_between_rows() {
        let db = db_with_products();
        let flag = CancelFlag::new();
        flag.cancel();
        assert!(matches!(
            db.execute_reader_cancellable("SELECT Name FROM Products", &flag),
            Err(EngineError::Cancelled)
        ));
    }
}
