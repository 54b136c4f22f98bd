//! WrenDB: an embeddable, in-memory SQL engine
//!
//! SQL text in, result grids out, over in-process tables. No server, no
//! storage engine, no native dependencies.
//!
//! ## Features
//! - DDL/DML: CREATE TABLE/FUNCTION/TRIGGER, ALTER, DROP, INSERT, UPDATE, DELETE
//! - SELECT with joins, grouping and aggregation, HAVING, ORDER BY, paging, DISTINCT
//! - BEFORE/AFTER row triggers with NEW/OLD references and embedded DML
//! - User-defined SQL functions and host-registered add-ins
//! - JSON snapshots for persistence and merge
//!
//! ```
//! use wrendb::Database;
//!
//! let db = Database::new();
//! db.execute_non_query("CREATE TABLE users (id INT, name VARCHAR(50))")?;
//! db.execute_non_query("INSERT INTO users VALUES (1, 'Ada')")?;
//! let grid = db.execute_reader("SELECT name FROM users WHERE id = 1")?;
//! assert_eq!(grid.rows[0][0].render(), "Ada");
//! # Ok::<(), wrendb::EngineError>(())
//! ```

pub mod database;
pub mod sql;
pub mod types;

mod error;

pub use database::{AddIn, CancelFlag, Database, UserFunction};
pub use error::{EngineError, Result};
pub use sql::{ExecOutcome, ResultSet};
pub use types::{Column, ColumnType, Row, Table, Value};
