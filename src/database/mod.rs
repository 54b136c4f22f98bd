//! Database facade: table, function, trigger and add-in registries plus the
//! query entry points
//!
//! The engine is single-threaded per database instance; the locks below exist
//! so the facade can expose `&self` entry points, not to support concurrent
//! writers. No guard is ever held across trigger firing, user-function
//! evaluation, or embedded DML.

mod snapshot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{EngineError, Result};
use crate::sql::executor::{self, ExecOutcome, ResultSet};
use crate::sql::token::Token;
use crate::sql::trigger::{Trigger, TriggerEvent, TriggerTiming};
use crate::types::{ColumnType, Table, Value};

/// User-defined SQL function: named parameters bound by position, and the
/// single RETURN expression captured as tokens.
#[derive(Debug, Clone)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<(String, ColumnType)>,
    pub return_type: ColumnType,
    pub body: Vec<Token>,
}

/// Host-registered callable exposed as a SQL function name. Add-ins resolve
/// before built-ins, so a host can replace UPPER with its own.
pub trait AddIn: Send + Sync {
    fn name(&self) -> &str;
    fn invoke(&self, args: &[Value]) -> Result<Value>;
}

struct ClosureAddIn {
    name: String,
    callback: Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl AddIn for ClosureAddIn {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, args: &[Value]) -> Result<Value> {
        (self.callback)(args)
    }
}

/// Cancellation signal for the async contract: checked between row
/// evaluations, never inside one.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An in-memory SQL database: named tables, user functions, triggers, and
/// host add-ins, with SQL entry points.
#[derive(Default)]
pub struct Database {
    tables: RwLock<HashMap<String, Table>>,
    functions: RwLock<HashMap<String, UserFunction>>,
    triggers: RwLock<Vec<Trigger>>,
    add_ins: RwLock<HashMap<String, Arc<dyn AddIn>>>,
    like_cache: RwLock<HashMap<String, Regex>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // entry points
    // ------------------------------------------------------------------

    /// Execute DML/DDL; returns rows affected (0 for DDL).
    pub fn execute_non_query(&self, sql: &str) -> Result<usize> {
        Ok(executor::execute(self, sql, None)?.affected_rows())
    }

    /// Execute a query; returns the result grid. DML statements yield an
    /// empty grid.
    pub fn execute_reader(&self, sql: &str) -> Result<ResultSet> {
        match executor::execute(self, sql, None)? {
            ExecOutcome::Rows(rs) => Ok(rs),
            ExecOutcome::Affected(_) => Ok(ResultSet { columns: Vec::new(), rows: Vec::new() }),
        }
    }

    /// Reader variant for the async facade: the flag is observed between row
    /// evaluations and surfaces as [`EngineError::Cancelled`].
    pub fn execute_reader_cancellable(&self, sql: &str, cancel: &CancelFlag) -> Result<ResultSet> {
        match executor::execute(self, sql, Some(cancel))? {
            ExecOutcome::Rows(rs) => Ok(rs),
            ExecOutcome::Affected(_) => Ok(ResultSet { columns: Vec::new(), rows: Vec::new() }),
        }
    }

    /// First column of the first row for SELECT, affected count for DML,
    /// Null for an empty result.
    pub fn execute_scalar(&self, sql: &str) -> Result<Value> {
        match executor::execute(self, sql, None)? {
            ExecOutcome::Rows(rs) => Ok(rs
                .rows
                .first()
                .and_then(|r| r.first())
                .cloned()
                .unwrap_or(Value::Null)),
            ExecOutcome::Affected(n) => Ok(Value::Int(n as i64)),
        }
    }

    // ------------------------------------------------------------------
    // tables
    // ------------------------------------------------------------------

    pub fn add_table(&self, table: Table) -> Result<()> {
        let key = table.name.to_lowercase();
        let mut tables = self.tables.write();
        if tables.contains_key(&key) {
            return Err(EngineError::Duplicate(format!("table {}", table.name)));
        }
        tables.insert(key, table);
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> bool {
        self.tables.write().remove(&name.to_lowercase()).is_some()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.tables.read().values().map(|t| t.name.clone()).collect();
        names.sort_by_key(|n| n.to_lowercase());
        names
    }

    pub(crate) fn with_table<R>(&self, name: &str, f: impl FnOnce(&Table) -> R) -> Result<R> {
        let tables = self.tables.read();
        let table = tables
            .get(&name.to_lowercase())
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))?;
        Ok(f(table))
    }

    pub(crate) fn with_table_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Table) -> Result<R>,
    ) -> Result<R> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))?;
        f(table)
    }

    // ------------------------------------------------------------------
    // user functions
    // ------------------------------------------------------------------

    pub(crate) fn add_function(&self, func: UserFunction) -> Result<()> {
        let key = func.name.to_lowercase();
        let mut functions = self.functions.write();
        if functions.contains_key(&key) {
            return Err(EngineError::Duplicate(format!("function {}", func.name)));
        }
        functions.insert(key, func);
        Ok(())
    }

    pub(crate) fn drop_function(&self, name: &str) -> bool {
        self.functions.write().remove(&name.to_lowercase()).is_some()
    }

    pub(crate) fn lookup_function(&self, name: &str) -> Option<UserFunction> {
        self.functions.read().get(&name.to_lowercase()).cloned()
    }

    // ------------------------------------------------------------------
    // triggers
    // ------------------------------------------------------------------

    pub(crate) fn add_trigger(&self, trigger: Trigger) -> Result<()> {
        let mut triggers = self.triggers.write();
        if triggers.iter().any(|t| t.name.eq_ignore_ascii_case(&trigger.name)) {
            return Err(EngineError::Duplicate(format!("trigger {}", trigger.name)));
        }
        triggers.push(trigger);
        Ok(())
    }

    pub(crate) fn drop_trigger(&self, name: &str) -> bool {
        let mut triggers = self.triggers.write();
        let before = triggers.len();
        triggers.retain(|t| !t.name.eq_ignore_ascii_case(name));
        triggers.len() != before
    }

    pub(crate) fn has_trigger(&self, name: &str) -> bool {
        self.triggers.read().iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Matching triggers in registration order.
    pub(crate) fn triggers_for(
        &self,
        table: &str,
        timing: TriggerTiming,
        event: TriggerEvent,
    ) -> Vec<Trigger> {
        self.triggers
            .read()
            .iter()
            .filter(|t| {
                t.table.eq_ignore_ascii_case(table) && t.timing == timing && t.event == event
            })
            .cloned()
            .collect()
    }

    pub(crate) fn trigger_sources(&self) -> Vec<(String, String)> {
        self.triggers
            .read()
            .iter()
            .map(|t| (t.name.clone(), t.source.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // add-ins
    // ------------------------------------------------------------------

    /// Register a host callback under a SQL function name. Last registration
    /// wins.
    pub fn register_add_in<F>(&self, name: &str, callback: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let addin = ClosureAddIn { name: name.to_string(), callback: Box::new(callback) };
        self.add_ins.write().insert(name.to_lowercase(), Arc::new(addin));
    }

    /// Register an add-in object carrying its own name.
    pub fn register_add_in_object(&self, addin: Arc<dyn AddIn>) {
        self.add_ins.write().insert(addin.name().to_lowercase(), addin);
    }

    pub fn unregister_add_in(&self, name: &str) -> bool {
        self.add_ins.write().remove(&name.to_lowercase()).is_some()
    }

    pub fn registered_add_ins(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.add_ins.read().values().map(|a| a.name().to_string()).collect();
        names.sort();
        names
    }

    pub(crate) fn lookup_add_in(&self, name: &str) -> Option<Arc<dyn AddIn>> {
        self.add_ins.read().get(&name.to_lowercase()).cloned()
    }

    // ------------------------------------------------------------------
    // LIKE pattern cache
    // ------------------------------------------------------------------

    /// Compiled LIKE pattern: `%` to `.*`, `_` to `.`, the rest escaped;
    /// anchored and case-insensitive. Compilations are cached per pattern
    /// text.
    pub(crate) fn like_regex(&self, pattern: &str) -> Result<Regex> {
        if let Some(re) = self.like_cache.read().get(pattern) {
            return Ok(re.clone());
        }
        let mut text = String::from("(?i)^");
        for ch in pattern.chars() {
            match ch {
                '%' => text.push_str(".*"),
                '_' => text.push('.'),
                c => text.push_str(&regex::escape(&c.to_string())),
            }
        }
        text.push('$');
        let re = Regex::new(&text)
            .map_err(|e| EngineError::InvalidArgument(format!("LIKE pattern: {}", e)))?;
        self.like_cache.write().insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, Table};

    #[test]
    fn test_scalar_select_and_dml() {
        let db = Database::new();
        db.execute_non_query("CREATE TABLE T (Id INT)").unwrap();
        db.execute_non_query("INSERT INTO T VALUES (41), (42)").unwrap();
        let v = db.execute_scalar("SELECT Id FROM T ORDER BY Id DESC").unwrap();
        assert!(matches!(v, Value::Int(42)));
        let v = db.execute_scalar("DELETE FROM T WHERE Id = 41").unwrap();
        assert!(matches!(v, Value::Int(1)));
        let v = db.execute_scalar("SELECT Id FROM T WHERE Id = 0").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn test_add_table_duplicate() {
        let db = Database::new();
        db.add_table(Table::new("T", vec![Column::new("a", ColumnType::Int)]).unwrap())
            .unwrap();
        let again = Table::new("t", vec![Column::new("a", ColumnType::Int)]).unwrap();
        assert!(matches!(db.add_table(again), Err(EngineError::Duplicate(_))));
    }

    #[test]
    fn test_add_in_registration_and_dispatch() {
        let db = Database::new();
        db.register_add_in("Double", |args| {
            Ok(Value::Int(args.first().map(|v| v.to_i64()).unwrap_or(0) * 2))
        });
        let v = db.execute_scalar("SELECT Double(21)").unwrap();
        assert!(matches!(v, Value::Int(42)));
        assert_eq!(db.registered_add_ins(), vec!["Double".to_string()]);

        assert!(db.unregister_add_in("double"));
        assert!(!db.unregister_add_in("double"));
        // back to unknown-function-is-null
        assert!(db.execute_scalar("SELECT Double(21)").unwrap().is_null());
    }

    #[test]
    fn test_add_in_shadows_builtin() {
        let db = Database::new();
        db.register_add_in("UPPER", |_| Ok(Value::Text("shadowed".into())));
        let v = db.execute_scalar("SELECT UPPER('abc')").unwrap();
        assert_eq!(v.render(), "shadowed");
        db.unregister_add_in("upper");
        let v = db.execute_scalar("SELECT UPPER('abc')").unwrap();
        assert_eq!(v.render(), "ABC");
    }

    #[test]
    fn test_add_in_object_last_registration_wins() {
        struct Fixed;
        impl AddIn for Fixed {
            fn name(&self) -> &str {
                "Marker"
            }
            fn invoke(&self, _args: &[Value]) -> Result<Value> {
                Ok(Value::Int(1))
            }
        }
        let db = Database::new();
        db.register_add_in("Marker", |_| Ok(Value::Int(0)));
        db.register_add_in_object(Arc::new(Fixed));
        let v = db.execute_scalar("SELECT Marker()").unwrap();
        assert!(matches!(v, Value::Int(1)));
    }

    #[test]
    fn test_user_function_beats_add_in() {
        let db = Database::new();
        db.register_add_in("Pick", |_| Ok(Value::Int(2)));
        db.execute_non_query("CREATE FUNCTION Pick() RETURNS INT AS BEGIN RETURN 1; END")
            .unwrap();
        let v = db.execute_scalar("SELECT Pick()").unwrap();
        assert!(matches!(v, Value::Int(1)));
    }

    #[test]
    fn test_like_cache_reuse() {
        let db = Database::new();
        let a = db.like_regex("Dr__l").unwrap();
        let b = db.like_regex("Dr__l").unwrap();
        assert_eq!(a.as_str(), b.as_str());
        assert!(a.is_match("Drill"));
        assert!(!a.is_match("Drl"));
    }
}
