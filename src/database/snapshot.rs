//! JSON snapshot persistence
//!
//! Tables are written as coarse-typed column lists plus a row grid; triggers
//! are written as their original CREATE TRIGGER text and rebuilt by replaying
//! it. User-defined functions and add-ins are not persisted.

use std::fs;
use std::path::Path;

use serde_json::{json, Value as Json};
use uuid::Uuid;

use super::Database;
use crate::error::{EngineError, Result};
use crate::types::{parse_timestamp, Column, ColumnType, Table, Value};

fn type_name(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Int => "Int64",
        ColumnType::Float => "Double",
        ColumnType::Bool => "Boolean",
        ColumnType::Timestamp => "DateTime",
        ColumnType::Uuid => "Guid",
        ColumnType::Text | ColumnType::Any => "String",
    }
}

/// Unknown names read back as String.
fn type_from_name(name: &str) -> ColumnType {
    match name {
        "Int64" => ColumnType::Int,
        "Double" => ColumnType::Float,
        "Boolean" => ColumnType::Bool,
        "DateTime" => ColumnType::Timestamp,
        "Guid" => ColumnType::Uuid,
        _ => ColumnType::Text,
    }
}

fn cell_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        other => json!(other.render()),
    }
}

/// String cells are re-typed according to the column hint; anything that does
/// not parse stays text.
fn cell_from_json(cell: &Json, hint: ColumnType) -> Value {
    match cell {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) if hint == ColumnType::Bool => Value::Bool(i != 0),
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(0.0)),
        },
        Json::String(s) => match hint {
            ColumnType::Timestamp => parse_timestamp(s)
                .map(Value::Timestamp)
                .unwrap_or_else(|| Value::Text(s.clone())),
            ColumnType::Uuid => Uuid::parse_str(s)
                .map(Value::Uuid)
                .unwrap_or_else(|_| Value::Text(s.clone())),
            ColumnType::Int => s
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(s.clone())),
            ColumnType::Float => s
                .parse::<f64>()
                .map(Value::Float)
                .unwrap_or_else(|_| Value::Text(s.clone())),
            ColumnType::Bool => match s.to_lowercase().as_str() {
                "1" | "true" => Value::Bool(true),
                "0" | "false" => Value::Bool(false),
                _ => Value::Text(s.clone()),
            },
            _ => Value::Text(s.clone()),
        },
        other => Value::Text(other.to_string()),
    }
}

fn table_to_json(table: &Table) -> Json {
    let columns: Vec<Json> = table
        .columns()
        .iter()
        .map(|c| json!({ "name": c.name, "type": type_name(c.ty) }))
        .collect();
    let rows: Vec<Json> = (0..table.row_count())
        .map(|i| {
            Json::Array(
                (0..table.columns().len())
                    .map(|c| cell_to_json(table.get_value(i, c)))
                    .collect(),
            )
        })
        .collect();
    json!({ "name": table.name, "columns": columns, "rows": rows })
}

fn bad(msg: &str) -> EngineError {
    EngineError::Serialization(msg.to_string())
}

fn table_from_json(entry: &Json) -> Result<Table> {
    let name = entry
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| bad("table entry is missing 'name'"))?;
    let columns = entry
        .get("columns")
        .and_then(Json::as_array)
        .ok_or_else(|| bad("table entry is missing 'columns'"))?;

    let mut defs = Vec::with_capacity(columns.len());
    for col in columns {
        let col_name = col
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| bad("column entry is missing 'name'"))?;
        let ty = col.get("type").and_then(Json::as_str).unwrap_or("String");
        defs.push(Column::new(col_name, type_from_name(ty)));
    }
    let hints: Vec<ColumnType> = defs.iter().map(|c| c.ty).collect();
    let mut table = Table::new(name, defs)?;

    let rows = entry
        .get("rows")
        .and_then(Json::as_array)
        .ok_or_else(|| bad("table entry is missing 'rows'"))?;
    for row in rows {
        let cells = row.as_array().ok_or_else(|| bad("row is not an array"))?;
        if cells.len() != hints.len() {
            return Err(bad("row length does not match column count"));
        }
        let values: Vec<Value> = cells
            .iter()
            .zip(&hints)
            .map(|(c, hint)| cell_from_json(c, *hint))
            .collect();
        table
            .add_row_raw(values)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
    }
    Ok(table)
}

struct Parsed {
    tables: Vec<Table>,
    triggers: Vec<(String, String)>,
}

fn parse_snapshot(text: &str) -> Result<Parsed> {
    let root: Json = serde_json::from_str(text)?;
    let tables_json = root
        .get("tables")
        .and_then(Json::as_array)
        .ok_or_else(|| bad("snapshot is missing 'tables'"))?;

    let mut tables = Vec::with_capacity(tables_json.len());
    for entry in tables_json {
        tables.push(table_from_json(entry)?);
    }

    let mut triggers = Vec::new();
    if let Some(entries) = root.get("triggers").and_then(Json::as_array) {
        for entry in entries {
            let name = entry
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| bad("trigger entry is missing 'name'"))?;
            let sql = entry
                .get("sql")
                .and_then(Json::as_str)
                .ok_or_else(|| bad("trigger entry is missing 'sql'"))?;
            triggers.push((name.to_string(), sql.to_string()));
        }
    }
    Ok(Parsed { tables, triggers })
}

impl Database {
    /// Serialize tables and trigger sources to snapshot text.
    pub fn to_snapshot(&self, pretty: bool) -> Result<String> {
        let tables: Vec<Json> = {
            let guard = self.tables.read();
            let mut names: Vec<&String> = guard.keys().collect();
            names.sort();
            names.iter().map(|k| table_to_json(&guard[*k])).collect()
        };
        let triggers: Vec<Json> = self
            .trigger_sources()
            .into_iter()
            .map(|(name, sql)| json!({ "name": name, "sql": sql }))
            .collect();
        let root = json!({ "tables": tables, "triggers": triggers });
        let text = if pretty {
            serde_json::to_string_pretty(&root)?
        } else {
            serde_json::to_string(&root)?
        };
        Ok(text)
    }

    /// Build a fresh database from snapshot text.
    pub fn from_snapshot(text: &str) -> Result<Database> {
        let db = Database::new();
        db.apply_snapshot(parse_snapshot(text)?, true)?;
        Ok(db)
    }

    /// Merge a snapshot into this database. Each incoming table or trigger is
    /// taken only if its name is absent, unless `overwrite` is set.
    pub fn merge_snapshot(&self, text: &str, overwrite: bool) -> Result<()> {
        self.apply_snapshot(parse_snapshot(text)?, overwrite)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>, pretty: bool) -> Result<()> {
        fs::write(path, self.to_snapshot(pretty)?)?;
        Ok(())
    }

    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Database> {
        Database::from_snapshot(&fs::read_to_string(path)?)
    }

    fn apply_snapshot(&self, parsed: Parsed, overwrite: bool) -> Result<()> {
        for table in parsed.tables {
            let exists = self.with_table(&table.name, |_| ()).is_ok();
            if exists {
                if !overwrite {
                    continue;
                }
                self.drop_table(&table.name);
            }
            self.add_table(table)?;
        }
        for (name, sql) in parsed.triggers {
            if self.has_trigger(&name) {
                if !overwrite {
                    continue;
                }
                self.drop_trigger(&name);
            }
            self.execute_non_query(&sql)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn sample_db() -> Database {
        let db = Database::new();
        db.execute_non_query(
            "CREATE TABLE Products (Id INT, Name VARCHAR(50), Price FLOAT, \
             Added DATETIME, Tag UNIQUEIDENTIFIER, Active BIT)",
        )
        .unwrap();
        db.execute_non_query(
            "INSERT INTO Products VALUES \
             (1, 'Hammer', 12.99, '2024-03-01T08:30:00', '6ba7b810-9dad-11d1-80b4-00c04fd430c8', TRUE), \
             (2, 'Wrench', 19.99, NULL, NULL, FALSE)",
        )
        .unwrap();
        db.execute_non_query(
            "CREATE TRIGGER PriceFloor BEFORE INSERT ON Products BEGIN \
             IF NEW.Price < 1.0 THEN SET NEW.Price = 1.0; END IF; END",
        )
        .unwrap();
        db
    }

    #[test]
    fn test_round_trip_preserves_tables() {
        let db = sample_db();
        let text = db.to_snapshot(false).unwrap();
        let restored = Database::from_snapshot(&text).unwrap();

        let rs = restored
            .execute_reader("SELECT Id, Name, Price, Added, Tag, Active FROM Products ORDER BY Id")
            .unwrap();
        assert_eq!(rs.row_count(), 2);
        assert!(matches!(rs.rows[0][0], Value::Int(1)));
        assert_eq!(rs.rows[0][1].render(), "Hammer");
        assert!(matches!(rs.rows[0][2], Value::Float(f) if f == 12.99));
        assert!(matches!(rs.rows[0][3], Value::Timestamp(_)));
        assert!(matches!(rs.rows[0][4], Value::Uuid(_)));
        assert!(matches!(rs.rows[0][5], Value::Bool(true)));
        assert!(rs.rows[1][3].is_null());
    }

    #[test]
    fn test_round_trip_restores_triggers() {
        let db = sample_db();
        let restored = Database::from_snapshot(&db.to_snapshot(true).unwrap()).unwrap();
        restored
            .execute_non_query(
                "INSERT INTO Products VALUES (3, 'Freebie', 0.0, NULL, NULL, TRUE)",
            )
            .unwrap();
        let v = restored
            .execute_scalar("SELECT Price FROM Products WHERE Id = 3")
            .unwrap();
        assert!(matches!(v, Value::Float(f) if f == 1.0));
    }

    #[test]
    fn test_merge_keeps_existing_without_overwrite() {
        let db = sample_db();
        let text = db.to_snapshot(false).unwrap();

        let target = Database::new();
        target.execute_non_query("CREATE TABLE Products (Id INT)").unwrap();
        target.execute_non_query("INSERT INTO Products VALUES (99)").unwrap();

        target.merge_snapshot(&text, false).unwrap();
        let rs = target.execute_reader("SELECT * FROM Products").unwrap();
        assert_eq!(rs.columns, vec!["Id"]);
        assert_eq!(rs.row_count(), 1);

        target.merge_snapshot(&text, true).unwrap();
        let rs = target.execute_reader("SELECT * FROM Products").unwrap();
        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.columns.len(), 6);
    }

    #[test]
    fn test_merge_adds_missing_table() {
        let db = sample_db();
        let target = Database::new();
        target.merge_snapshot(&db.to_snapshot(false).unwrap(), false).unwrap();
        assert_eq!(target.table_names(), vec!["Products".to_string()]);
    }

    #[test]
    fn test_unknown_column_type_reads_as_string() {
        let text = r#"{"tables":[{"name":"T","columns":[{"name":"X","type":"Blob"}],
                      "rows":[["data"]]}]}"#;
        let db = Database::from_snapshot(text).unwrap();
        let v = db.execute_scalar("SELECT X FROM T").unwrap();
        assert!(matches!(v, Value::Text(s) if s == "data"));
    }

    #[test]
    fn test_string_cells_parsed_by_hint() {
        let text = r#"{"tables":[{"name":"T",
            "columns":[{"name":"N","type":"Int64"},{"name":"B","type":"Boolean"}],
            "rows":[["42","true"],["oops","2"]]}]}"#;
        let db = Database::from_snapshot(text).unwrap();
        let rs = db.execute_reader("SELECT N, B FROM T").unwrap();
        assert!(matches!(rs.rows[0][0], Value::Int(42)));
        assert!(matches!(rs.rows[0][1], Value::Bool(true)));
        // unparseable cells are stored as text
        assert!(matches!(&rs.rows[1][0], Value::Text(s) if s == "oops"));
        assert!(matches!(&rs.rows[1][1], Value::Text(s) if s == "2"));
    }

    #[test]
    fn test_malformed_snapshot() {
        assert!(matches!(
            Database::from_snapshot("not json"),
            Err(EngineError::Serialization(_))
        ));
        assert!(matches!(
            Database::from_snapshot("{\"nope\": []}"),
            Err(EngineError::Serialization(_))
        ));
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let db = sample_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        db.save_snapshot(&path, true).unwrap();
        let restored = Database::load_snapshot(&path).unwrap();
        assert_eq!(restored.table_names(), vec!["Products".to_string()]);
    }
}
