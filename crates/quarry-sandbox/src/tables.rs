//! Read-only access to the analytic tables that sandboxed code queries.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableStoreError {
    #[error("{0}")]
    Query(String),
    #[error("{0}")]
    Io(String),
}

impl From<rusqlite::Error> for TableStoreError {
    fn from(err: rusqlite::Error) -> Self {
        TableStoreError::Query(err.to_string())
    }
}

/// One result row, column name to JSON value.
pub type TableRow = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
}

/// The analytic store the function router executes against. Callers hand
/// it already-validated SQL; the router owns the validation.
pub trait TableStore: Send + Sync {
    fn query(&self, sql: &str) -> Result<Vec<TableRow>, TableStoreError>;

    fn table_names(&self) -> Result<Vec<String>, TableStoreError>;

    fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, TableStoreError>;
}

/// SQLite-backed store. Datasets are loaded up front; queries run against
/// a shared connection behind a mutex.
pub struct SqliteTableStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTableStore {
    pub fn in_memory() -> Result<Self, TableStoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableStoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| TableStoreError::Io(e.to_string()))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Runs raw SQL against the store. Intended for loading fixture data.
    pub fn execute_batch(&self, sql: &str) -> Result<(), TableStoreError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Markdown rendering of every table and its columns, for inclusion in
    /// an agent's context.
    pub fn schema_markdown(&self) -> Result<String, TableStoreError> {
        let mut out = String::new();
        for table in self.table_names()? {
            out.push_str(&format!("### {table}\n"));
            for column in self.describe(&table)? {
                let constraint = if column.nullable { "" } else { " NOT NULL" };
                out.push_str(&format!(
                    "- {} ({}{})\n",
                    column.name, column.column_type, constraint
                ));
            }
            out.push('\n');
        }
        Ok(out)
    }
}

impl TableStore for SqliteTableStore {
    fn query(&self, sql: &str) -> Result<Vec<TableRow>, TableStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|name| name.to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (idx, name) in column_names.iter().enumerate() {
                object.insert(name.clone(), sql_value_to_json(row.get_ref(idx)?));
            }
            out.push(object);
        }
        Ok(out)
    }

    fn table_names(&self) -> Result<Vec<String>, TableStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, TableStoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1)")?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    column_type: row.get(1)?,
                    nullable: row.get::<_, i64>(2)? == 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> SqliteTableStore {
        let store = SqliteTableStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE trips (
                     id INTEGER NOT NULL,
                     city TEXT,
                     fare REAL
                 );
                 INSERT INTO trips VALUES (1, 'austin', 12.5), (2, NULL, 3.0);",
            )
            .unwrap();
        store
    }

    #[test]
    fn query_maps_sql_types_to_json() {
        let store = seeded();
        let rows = store.query("SELECT * FROM trips ORDER BY id").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
        assert_eq!(rows[0].get("city"), Some(&json!("austin")));
        assert_eq!(rows[0].get("fare"), Some(&json!(12.5)));
        assert_eq!(rows[1].get("city"), Some(&Value::Null));
    }

    #[test]
    fn table_names_skips_internal_tables() {
        let store = seeded();
        assert_eq!(store.table_names().unwrap(), vec!["trips".to_string()]);
    }

    #[test]
    fn describe_reports_columns() {
        let store = seeded();
        let columns = store.describe("trips").unwrap();
        assert_eq!(
            columns[0],
            ColumnInfo { name: "id".into(), column_type: "INTEGER".into(), nullable: false }
        );
        assert_eq!(
            columns[1],
            ColumnInfo { name: "city".into(), column_type: "TEXT".into(), nullable: true }
        );
    }

    #[test]
    fn schema_markdown_lists_every_column() {
        let store = seeded();
        let markdown = store.schema_markdown().unwrap();
        assert!(markdown.contains("### trips"));
        assert!(markdown.contains("- id (INTEGER NOT NULL)"));
        assert!(markdown.contains("- city (TEXT)"));
    }

    #[test]
    fn describe_unknown_table_is_empty() {
        let store = seeded();
        assert!(store.describe("missing").unwrap().is_empty());
    }
}
