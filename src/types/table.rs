/// Table storage: named, ordered, typed columns over columnar value lists
use serde::{Deserialize, Serialize};

use super::{Row, Value};
use crate::error::{EngineError, Result};

/// Coarse column type tag. `Any` means the type is not yet known and will be
/// pinned by the first non-null value written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    Bool,
    Text,
    Timestamp,
    Uuid,
    Any,
}

impl ColumnType {
    /// Map a SQL type name onto a coarse tag. Unknown names default to Text.
    pub fn from_sql_name(name: &str) -> ColumnType {
        match name.to_uppercase().as_str() {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "LONG" => ColumnType::Int,
            "FLOAT" | "REAL" | "DOUBLE" | "DECIMAL" | "NUMERIC" | "MONEY" => ColumnType::Float,
            "BIT" | "BOOL" | "BOOLEAN" => ColumnType::Bool,
            "DATETIME" | "DATETIME2" | "DATE" | "TIME" | "TIMESTAMP" | "SMALLDATETIME" => {
                ColumnType::Timestamp
            }
            "UNIQUEIDENTIFIER" | "GUID" | "UUID" => ColumnType::Uuid,
            _ => ColumnType::Text,
        }
    }
}

/// Column definition
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// In-memory table: an ordered column list plus one value vector per column.
/// Every column vector holds exactly `row_count` entries.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    columns: Vec<Column>,
    data: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let name = name.into();
        for (i, col) in columns.iter().enumerate() {
            if columns[..i]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&col.name))
            {
                return Err(EngineError::Duplicate(format!(
                    "column {} in table {}",
                    col.name, name
                )));
            }
        }
        let data = columns.iter().map(|_| Vec::new()).collect();
        Ok(Self { name, columns, data })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Append a row given one value per column in declared order. Values are
    /// coerced to the declared types; a non-null value written into an `Any`
    /// column pins the column type.
    pub fn add_row(&mut self, values: Vec<Value>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(EngineError::TypeMismatch(format!(
                "table {} expects {} values, got {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            coerced.push(self.coerce_for_column(i, value)?);
        }
        for (col, value) in self.data.iter_mut().zip(coerced) {
            col.push(value);
        }
        Ok(())
    }

    /// Overwrite one row in place, with the same coercion rules as insert.
    pub fn update_row(&mut self, index: usize, values: Vec<Value>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(EngineError::TypeMismatch(format!(
                "table {} expects {} values, got {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            coerced.push(self.coerce_for_column(i, value)?);
        }
        for (col, value) in self.data.iter_mut().zip(coerced) {
            col[index] = value;
        }
        Ok(())
    }

    /// Append a row without write coercion. Snapshot loading uses this: a
    /// string cell that does not parse under the column hint is stored as
    /// text rather than rejected.
    pub(crate) fn add_row_raw(&mut self, values: Vec<Value>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(EngineError::TypeMismatch(format!(
                "table {} expects {} values, got {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        for (col, value) in self.data.iter_mut().zip(values) {
            col.push(value);
        }
        Ok(())
    }

    pub fn delete_row(&mut self, index: usize) {
        for col in self.data.iter_mut() {
            col.remove(index);
        }
    }

    pub fn get_row(&self, index: usize) -> Vec<Value> {
        self.data.iter().map(|col| col[index].clone()).collect()
    }

    pub fn get_value(&self, row: usize, col: usize) -> &Value {
        &self.data[col][row]
    }

    /// Materialize a row as a case-insensitive map of bare column names.
    pub fn row_map(&self, index: usize) -> Row {
        let mut row = Row::new();
        for (col, values) in self.columns.iter().zip(&self.data) {
            row.insert(&col.name, values[index].clone());
        }
        row
    }

    /// Add a column, appending Null for every existing row.
    pub fn add_column(&mut self, column: Column) -> Result<()> {
        if self.column_index(&column.name).is_some() {
            return Err(EngineError::Duplicate(format!(
                "column {} in table {}",
                column.name, self.name
            )));
        }
        let rows = self.row_count();
        self.columns.push(column);
        self.data.push(vec![Value::Null; rows]);
        Ok(())
    }

    /// Drop a column, preserving the order of the rest.
    pub fn drop_column(&mut self, name: &str) -> Result<()> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| EngineError::ColumnNotFound(name.to_string()))?;
        self.columns.remove(idx);
        self.data.remove(idx);
        Ok(())
    }

    fn coerce_for_column(&mut self, col_idx: usize, value: Value) -> Result<Value> {
        if self.columns[col_idx].ty == ColumnType::Any {
            if let Some(ty) = value.natural_type() {
                self.columns[col_idx].ty = ty;
            }
            return Ok(value);
        }
        value.coerce_to(self.columns[col_idx].ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> Table {
        Table::new(
            "products",
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("name", ColumnType::Text),
                Column::new("price", ColumnType::Float),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let result = Table::new(
            "t",
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("ID", ColumnType::Text),
            ],
        );
        assert!(matches!(result, Err(EngineError::Duplicate(_))));
    }

    #[test]
    fn test_add_row_coerces() {
        let mut t = products();
        t.add_row(vec![
            Value::Text("1".into()),
            Value::Text("Hammer".into()),
            Value::Int(12),
        ])
        .unwrap();
        assert_eq!(t.row_count(), 1);
        assert!(matches!(t.get_value(0, 0), Value::Int(1)));
        assert!(matches!(t.get_value(0, 2), Value::Float(f) if *f == 12.0));
    }

    #[test]
    fn test_add_row_type_mismatch() {
        let mut t = products();
        let result = t.add_row(vec![
            Value::Text("not a number".into()),
            Value::Null,
            Value::Null,
        ]);
        assert!(matches!(result, Err(EngineError::TypeMismatch(_))));
        assert_eq!(t.row_count(), 0);
    }

    #[test]
    fn test_any_column_pins_on_first_non_null() {
        let mut t = Table::new("t", vec![Column::new("x", ColumnType::Any)]).unwrap();
        t.add_row(vec![Value::Null]).unwrap();
        assert_eq!(t.columns()[0].ty, ColumnType::Any);
        t.add_row(vec![Value::Int(7)]).unwrap();
        assert_eq!(t.columns()[0].ty, ColumnType::Int);
    }

    #[test]
    fn test_add_and_drop_column() {
        let mut t = products();
        t.add_row(vec![Value::Int(1), Value::Text("Hammer".into()), Value::Float(12.99)])
            .unwrap();
        t.add_column(Column::new("stock", ColumnType::Int)).unwrap();
        assert!(t.get_value(0, 3).is_null());
        assert!(t.add_column(Column::new("STOCK", ColumnType::Int)).is_err());
        t.drop_column("name").unwrap();
        assert_eq!(t.columns().len(), 3);
        assert_eq!(t.columns()[1].name, "price");
        assert!(matches!(t.drop_column("gone"), Err(EngineError::ColumnNotFound(_))));
    }

    #[test]
    fn test_column_lists_stay_aligned() {
        let mut t = products();
        for i in 0..5 {
            t.add_row(vec![Value::Int(i), Value::Null, Value::Null]).unwrap();
        }
        t.delete_row(2);
        assert_eq!(t.row_count(), 4);
        assert!(matches!(t.get_value(2, 0), Value::Int(3)));
    }
}
