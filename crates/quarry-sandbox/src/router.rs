//! Validates and executes the allow-listed data-access calls made by
//! sandboxed code. This is the only place query text is composed, so it
//! owns injection defense: every identifier is regex-allow-listed and
//! every literal is escaped or type-checked before interpolation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::engine::PauseRequest;
use crate::tables::{TableStore, TableStoreError};

/// Function names reachable from inside a code unit.
pub const EXTERNAL_FUNCTIONS: [&str; 4] = ["fetch", "count", "describe", "tables"];

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("identifier regex"))
}

fn order_by_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^[a-zA-Z_][a-zA-Z0-9_]*(\s+(ASC|DESC))?$").expect("order_by regex")
    })
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Unknown external function: {0}")]
    UnknownFunction(String),
    #[error("Unknown table: {}. Available: {}", .table, .available.join(", "))]
    UnknownTable { table: String, available: Vec<String> },
    #[error("Invalid column name: {0}")]
    InvalidColumn(String),
    #[error("Invalid order_by: {0}")]
    InvalidOrderBy(String),
    #[error("{0}")]
    BadArguments(String),
    #[error("{0}")]
    Store(#[from] TableStoreError),
}

/// Routes pause requests to the four data-access primitives. Faults are
/// returned to the caller, never retried here.
pub struct FunctionRouter {
    store: Arc<dyn TableStore>,
    dispatched: AtomicU64,
}

impl FunctionRouter {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store, dispatched: AtomicU64::new(0) }
    }

    /// Calls dispatched so far, counting ones that failed validation.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, request), fields(function = %request.function))]
    pub fn dispatch(&self, request: &PauseRequest) -> Result<Value, RouterError> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        match request.function.as_str() {
            "fetch" => self.fetch(request),
            "count" => self.count(request),
            "describe" => self.describe(request),
            "tables" => self.tables(request),
            other => Err(RouterError::UnknownFunction(other.to_string())),
        }
    }

    fn fetch(&self, request: &PauseRequest) -> Result<Value, RouterError> {
        let mut args = CallArgs::new("fetch", 5, request);
        let table = args.required_str("table")?;
        let columns = args.opt_string_list("columns")?;
        let filters = args.opt_object("where")?;
        let order_by = args.opt_str("order_by")?;
        let limit = args.opt_limit("limit")?;
        args.finish()?;

        let table = self.validated_table(&table)?;
        let col_expr = match &columns {
            Some(cols) if !cols.is_empty() => {
                for column in cols {
                    if !ident_re().is_match(column) {
                        return Err(RouterError::InvalidColumn(column.clone()));
                    }
                }
                cols.join(", ")
            }
            _ => "*".to_string(),
        };

        let mut sql = format!("SELECT {col_expr} FROM {table}");
        if let Some(filters) = &filters {
            if let Some(predicate) = where_clause(filters)? {
                sql.push_str(" WHERE ");
                sql.push_str(&predicate);
            }
        }
        if let Some(order) = order_by {
            if !order_by_re().is_match(&order) {
                return Err(RouterError::InvalidOrderBy(order));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let preview: String = sql.chars().take(200).collect();
        debug!(query = %preview, "fetch");
        let rows = self.store.query(&sql)?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }

    fn count(&self, request: &PauseRequest) -> Result<Value, RouterError> {
        let mut args = CallArgs::new("count", 2, request);
        let table = args.required_str("table")?;
        let filters = args.opt_object("where")?;
        args.finish()?;

        let table = self.validated_table(&table)?;
        let mut sql = format!("SELECT COUNT(*) AS cnt FROM {table}");
        if let Some(filters) = &filters {
            if let Some(predicate) = where_clause(filters)? {
                sql.push_str(" WHERE ");
                sql.push_str(&predicate);
            }
        }

        let rows = self.store.query(&sql)?;
        let count = rows
            .first()
            .and_then(|row| row.get("cnt"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(Value::Number(count.into()))
    }

    fn describe(&self, request: &PauseRequest) -> Result<Value, RouterError> {
        let mut args = CallArgs::new("describe", 1, request);
        let table = args.required_str("table")?;
        args.finish()?;

        let table = self.validated_table(&table)?;
        debug!(%table, "describe");
        let columns = self.store.describe(&table)?;
        let entries = columns
            .into_iter()
            .map(|column| {
                json!({
                    "column_name": column.name,
                    "column_type": column.column_type,
                    "nullable": column.nullable,
                })
            })
            .collect();
        Ok(Value::Array(entries))
    }

    fn tables(&self, request: &PauseRequest) -> Result<Value, RouterError> {
        let args = CallArgs::new("tables", 0, request);
        args.finish()?;
        let names = self.store.table_names()?;
        Ok(Value::Array(names.into_iter().map(Value::String).collect()))
    }

    fn validated_table(&self, table: &str) -> Result<String, RouterError> {
        let available = self.store.table_names()?;
        if !available.iter().any(|name| name == table) {
            return Err(RouterError::UnknownTable { table: table.to_string(), available });
        }
        Ok(table.to_string())
    }
}

/// Builds the conjoined equality predicate for a where mapping. Keys are
/// allow-listed identifiers; values must be scalar or null.
fn where_clause(filters: &Map<String, Value>) -> Result<Option<String>, RouterError> {
    let mut conditions = Vec::new();
    for (column, value) in filters {
        if !ident_re().is_match(column) {
            return Err(RouterError::InvalidColumn(column.clone()));
        }
        let condition = match value {
            Value::String(s) => format!("{column} = '{}'", s.replace('\'', "''")),
            Value::Number(n) => format!("{column} = {n}"),
            Value::Bool(b) => format!("{column} = {}", if *b { "TRUE" } else { "FALSE" }),
            Value::Null => format!("{column} IS NULL"),
            other => {
                return Err(RouterError::BadArguments(format!(
                    "where value for '{column}' must be a scalar or null, got {}",
                    type_name(other)
                )));
            }
        };
        conditions.push(condition);
    }
    if conditions.is_empty() {
        Ok(None)
    } else {
        Ok(Some(conditions.join(" AND ")))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Binds positional and keyword arguments to named parameters in
/// declaration order, with descriptive faults for misuse.
struct CallArgs {
    function: &'static str,
    param_count: usize,
    given_positional: usize,
    positional: VecDeque<Value>,
    kwargs: Map<String, Value>,
}

impl CallArgs {
    fn new(function: &'static str, param_count: usize, request: &PauseRequest) -> Self {
        Self {
            function,
            param_count,
            given_positional: request.args.len(),
            positional: request.args.iter().cloned().collect(),
            kwargs: request.kwargs.clone(),
        }
    }

    fn take(&mut self, name: &str) -> Result<Option<Value>, RouterError> {
        if let Some(value) = self.positional.pop_front() {
            if self.kwargs.contains_key(name) {
                return Err(self.fault(format!("got multiple values for argument '{name}'")));
            }
            return Ok(Some(value));
        }
        Ok(self.kwargs.remove(name))
    }

    fn required_str(&mut self, name: &str) -> Result<String, RouterError> {
        match self.take(name)? {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(self.type_fault(name, "a string", &other)),
            None => Err(self.fault(format!("missing required argument: '{name}'"))),
        }
    }

    fn opt_str(&mut self, name: &str) -> Result<Option<String>, RouterError> {
        match self.take(name)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.type_fault(name, "a string", &other)),
        }
    }

    fn opt_string_list(&mut self, name: &str) -> Result<Option<Vec<String>>, RouterError> {
        match self.take(name)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => out.push(s),
                        other => return Err(self.type_fault(name, "a list of strings", &other)),
                    }
                }
                Ok(Some(out))
            }
            Some(other) => Err(self.type_fault(name, "a list of strings", &other)),
        }
    }

    fn opt_object(&mut self, name: &str) -> Result<Option<Map<String, Value>>, RouterError> {
        match self.take(name)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(self.type_fault(name, "an object", &other)),
        }
    }

    fn opt_limit(&mut self, name: &str) -> Result<Option<i64>, RouterError> {
        match self.take(name)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(Some(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Some(f as i64))
                } else {
                    Err(self.fault(format!("argument '{name}' must be an integer")))
                }
            }
            Some(Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Ok(Some(i)),
                Err(_) => Err(self.fault(format!("argument '{name}' must be an integer"))),
            },
            Some(other) => Err(self.type_fault(name, "an integer", &other)),
        }
    }

    fn finish(self) -> Result<(), RouterError> {
        if !self.positional.is_empty() {
            let expected = match self.param_count {
                0 => "no arguments".to_string(),
                1 => "at most 1 argument".to_string(),
                n => format!("at most {n} arguments"),
            };
            return Err(RouterError::BadArguments(format!(
                "{}() takes {expected} ({} given)",
                self.function, self.given_positional
            )));
        }
        if let Some(key) = self.kwargs.keys().next() {
            return Err(RouterError::BadArguments(format!(
                "{}() got an unexpected keyword argument '{key}'",
                self.function
            )));
        }
        Ok(())
    }

    fn fault(&self, detail: String) -> RouterError {
        RouterError::BadArguments(format!("{}() {detail}", self.function))
    }

    fn type_fault(&self, name: &str, expected: &str, actual: &Value) -> RouterError {
        self.fault(format!(
            "argument '{name}' must be {expected}, got {}",
            type_name(actual)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::SqliteTableStore;
    use serde_json::json;

    fn setup() -> FunctionRouter {
        let store = SqliteTableStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE test_table (id INTEGER, name TEXT);
                 INSERT INTO test_table VALUES (1, 'a'), (2, 'b'), (3, 'c');
                 CREATE TABLE quotes (id INTEGER, name TEXT);
                 INSERT INTO quotes VALUES (1, 'a'), (2, 'a'' OR ''1''=''1');",
            )
            .unwrap();
        FunctionRouter::new(Arc::new(store))
    }

    fn fetch_req(kwargs: &[(&str, Value)]) -> PauseRequest {
        let mut request = PauseRequest::new("fetch").with_arg(json!("test_table"));
        for (name, value) in kwargs {
            request = request.with_kwarg(*name, value.clone());
        }
        request
    }

    #[test]
    fn fetch_returns_all_rows() {
        let router = setup();
        let rows = router.dispatch(&fetch_req(&[])).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("a"));
    }

    #[test]
    fn fetch_projects_columns() {
        let router = setup();
        let rows = router
            .dispatch(&fetch_req(&[("columns", json!(["name"]))]))
            .unwrap();
        let first = rows.as_array().unwrap()[0].as_object().unwrap();
        assert_eq!(first.len(), 1);
        assert!(first.contains_key("name"));
    }

    #[test]
    fn fetch_filters_with_where() {
        let router = setup();
        let rows = router
            .dispatch(&fetch_req(&[("where", json!({"name": "a"}))]))
            .unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[test]
    fn fetch_orders_descending() {
        let router = setup();
        let rows = router
            .dispatch(&fetch_req(&[("order_by", json!("id DESC"))]))
            .unwrap();
        assert_eq!(rows.as_array().unwrap()[0]["id"], json!(3));

        // case-insensitive direction keyword
        let rows = router
            .dispatch(&fetch_req(&[("order_by", json!("id desc"))]))
            .unwrap();
        assert_eq!(rows.as_array().unwrap()[0]["id"], json!(3));
    }

    #[test]
    fn fetch_limit_coercions() {
        let router = setup();
        for limit in [json!(2), json!(2.9), json!("2")] {
            let rows = router.dispatch(&fetch_req(&[("limit", limit)])).unwrap();
            assert_eq!(rows.as_array().unwrap().len(), 2);
        }
        let err = router
            .dispatch(&fetch_req(&[("limit", json!("abc"))]))
            .unwrap_err();
        assert_eq!(err.to_string(), "fetch() argument 'limit' must be an integer");
    }

    #[test]
    fn count_matches_fetch_length() {
        let router = setup();
        let rows = router.dispatch(&fetch_req(&[])).unwrap();
        let count = router
            .dispatch(&PauseRequest::new("count").with_arg(json!("test_table")))
            .unwrap();
        assert_eq!(count, json!(rows.as_array().unwrap().len()));
    }

    #[test]
    fn count_with_where() {
        let router = setup();
        let count = router
            .dispatch(
                &PauseRequest::new("count")
                    .with_arg(json!("test_table"))
                    .with_kwarg("where", json!({"name": "a"})),
            )
            .unwrap();
        assert_eq!(count, json!(1));
    }

    #[test]
    fn embedded_quotes_match_literally() {
        let router = setup();
        // A classic tautology payload must match only the row whose value
        // is literally that string, never widen the filter.
        let rows = router
            .dispatch(
                &PauseRequest::new("fetch")
                    .with_arg(json!("quotes"))
                    .with_kwarg("where", json!({"name": "a' OR '1'='1"})),
            )
            .unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(2));
    }

    #[test]
    fn column_injection_rejected_without_executing() {
        let router = setup();
        let err = router
            .dispatch(&fetch_req(&[("columns", json!(["; DROP TABLE test_table"]))]))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid column name: ; DROP TABLE test_table");

        let tables = router.dispatch(&PauseRequest::new("tables")).unwrap();
        assert!(tables.as_array().unwrap().contains(&json!("test_table")));
    }

    #[test]
    fn where_key_validated_as_identifier() {
        let router = setup();
        let err = router
            .dispatch(&fetch_req(&[("where", json!({"1=1; --": "x"}))]))
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidColumn(_)));
    }

    #[test]
    fn where_value_must_be_scalar() {
        let router = setup();
        let err = router
            .dispatch(&fetch_req(&[("where", json!({"name": [1, 2]}))]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "where value for 'name' must be a scalar or null, got array"
        );
    }

    #[test]
    fn where_null_becomes_is_null() {
        let router = setup();
        let rows = router
            .dispatch(&fetch_req(&[("where", json!({"name": null}))]))
            .unwrap();
        assert!(rows.as_array().unwrap().is_empty());
    }

    #[test]
    fn invalid_order_by_rejected() {
        let router = setup();
        let err = router
            .dispatch(&fetch_req(&[("order_by", json!("id; DROP TABLE test_table"))]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid order_by: id; DROP TABLE test_table"
        );
    }

    #[test]
    fn unknown_table_enumerates_catalog() {
        let router = setup();
        let err = router
            .dispatch(&PauseRequest::new("fetch").with_arg(json!("nope")))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown table: nope. Available: quotes, test_table"
        );
    }

    #[test]
    fn unknown_function_rejected() {
        let router = setup();
        let err = router
            .dispatch(&PauseRequest::new("frobnicate"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown external function: frobnicate");
    }

    #[test]
    fn describe_reports_every_column() {
        let router = setup();
        let entries = router
            .dispatch(&PauseRequest::new("describe").with_arg(json!("test_table")))
            .unwrap();
        let entries = entries.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["column_name"], json!("id"));
        assert_eq!(entries[0]["column_type"], json!("INTEGER"));
        assert_eq!(entries[0]["nullable"], json!(true));
        assert_eq!(entries[1]["column_name"], json!("name"));
    }

    #[test]
    fn describe_validates_table() {
        let router = setup();
        let err = router
            .dispatch(&PauseRequest::new("describe").with_arg(json!("nope")))
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownTable { .. }));
    }

    #[test]
    fn tables_lists_catalog_and_rejects_arguments() {
        let router = setup();
        let tables = router.dispatch(&PauseRequest::new("tables")).unwrap();
        assert_eq!(tables, json!(["quotes", "test_table"]));

        let err = router
            .dispatch(&PauseRequest::new("tables").with_arg(json!("x")))
            .unwrap_err();
        assert_eq!(err.to_string(), "tables() takes no arguments (1 given)");
    }

    #[test]
    fn argument_binding_faults() {
        let router = setup();
        let err = router
            .dispatch(&fetch_req(&[("frobs", json!(1))]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "fetch() got an unexpected keyword argument 'frobs'"
        );

        let err = router
            .dispatch(&fetch_req(&[("table", json!("test_table"))]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "fetch() got multiple values for argument 'table'"
        );

        let err = router.dispatch(&PauseRequest::new("count")).unwrap_err();
        assert_eq!(err.to_string(), "count() missing required argument: 'table'");

        let extra = PauseRequest::new("describe")
            .with_arg(json!("test_table"))
            .with_arg(json!("extra"));
        let err = router.dispatch(&extra).unwrap_err();
        assert_eq!(err.to_string(), "describe() takes at most 1 argument (2 given)");
    }

    #[test]
    fn dispatch_count_includes_failures() {
        let router = setup();
        assert_eq!(router.dispatch_count(), 0);
        router.dispatch(&PauseRequest::new("tables")).unwrap();
        router.dispatch(&PauseRequest::new("frobnicate")).unwrap_err();
        assert_eq!(router.dispatch_count(), 2);
    }
}
