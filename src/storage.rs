//! Backing store adapters.
//!
//! The engine consumes durable tabular storage through the narrow
//! [`TableStore`] contract: schema creation, insert, equality-filtered
//! select, update and delete against named tables. Rows travel as JSON
//! objects, matching what the sqlite CLI emits in `-json` mode.
//!
//! Two adapters are provided: [`MemoryStore`] for tests, benchmarks and
//! throwaway stores, and [`SqliteStore`], which drives the `sqlite3`
//! binary for durable single-writer persistence (one database file per
//! shard). Each adapter is expected to provide its own per-call
//! durability; the engine never wraps multi-step sequences in a
//! transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::StorageError;

/// A stored row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Column kinds understood by the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Auto-incrementing integer primary key. Explicit values in an
    /// inserted row are honored; otherwise the adapter assigns one.
    PrimaryKey,
    Integer,
    Real,
    Text,
}

/// A column descriptor for `ensure_schema`.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self { name, kind }
    }
}

/// Narrow contract over one backing-store instance (one shard).
pub trait TableStore: Send + Sync {
    /// Idempotent create-if-absent.
    fn ensure_schema(&self, table: &str, columns: &[Column]) -> Result<(), StorageError>;

    /// Insert a row, returning the generated (or honored explicit)
    /// primary-key value.
    fn insert(&self, table: &str, row: Row) -> Result<i64, StorageError>;

    fn select_all(&self, table: &str) -> Result<Vec<Row>, StorageError>;

    fn select_where(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StorageError>;

    fn update_where(
        &self,
        table: &str,
        column: &str,
        value: &Value,
        patch: Row,
    ) -> Result<(), StorageError>;

    fn delete_where(&self, table: &str, column: &str, value: &Value) -> Result<(), StorageError>;
}

/// Opens the backing-store instance for a physical shard index.
pub type ShardFactory =
    Box<dyn Fn(usize) -> Result<Arc<dyn TableStore>, StorageError> + Send + Sync>;

fn values_match(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

// ============================================================================
// In-memory adapter
// ============================================================================

#[derive(Default)]
struct MemoryTable {
    primary_key: Option<&'static str>,
    next_id: i64,
    rows: Vec<Row>,
}

/// In-process table storage. Volatile; every instance is one shard.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out one independent in-memory store per shard
    /// index, stable across repeated calls for the same index.
    pub fn factory() -> ShardFactory {
        let shards: Mutex<HashMap<usize, Arc<MemoryStore>>> = Mutex::new(HashMap::new());
        Box::new(move |index| {
            Ok(shards
                .lock()
                .entry(index)
                .or_insert_with(|| Arc::new(MemoryStore::new()))
                .clone() as Arc<dyn TableStore>)
        })
    }
}

impl TableStore for MemoryStore {
    fn ensure_schema(&self, table: &str, columns: &[Column]) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        tables.entry(table.to_string()).or_insert_with(|| MemoryTable {
            primary_key: columns
                .iter()
                .find(|c| c.kind == ColumnKind::PrimaryKey)
                .map(|c| c.name),
            next_id: 1,
            rows: Vec::new(),
        });
        Ok(())
    }

    fn insert(&self, table: &str, mut row: Row) -> Result<i64, StorageError> {
        let mut tables = self.tables.lock();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;

        let id = match data.primary_key {
            Some(pk) => match row.get(pk).and_then(Value::as_i64) {
                Some(explicit) => {
                    data.next_id = data.next_id.max(explicit + 1);
                    explicit
                }
                None => {
                    let assigned = data.next_id;
                    data.next_id += 1;
                    row.insert(pk.to_string(), Value::from(assigned));
                    assigned
                }
            },
            None => {
                let assigned = data.next_id;
                data.next_id += 1;
                assigned
            }
        };

        data.rows.push(row);
        Ok(id)
    }

    fn select_all(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        let tables = self.tables.lock();
        let data = tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        Ok(data.rows.clone())
    }

    fn select_where(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StorageError> {
        let tables = self.tables.lock();
        let data = tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        Ok(data
            .rows
            .iter()
            .filter(|row| row.get(column).is_some_and(|v| values_match(v, value)))
            .cloned()
            .collect())
    }

    fn update_where(
        &self,
        table: &str,
        column: &str,
        value: &Value,
        patch: Row,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        for row in data
            .rows
            .iter_mut()
            .filter(|row| row.get(column).is_some_and(|v| values_match(v, value)))
        {
            for (key, val) in &patch {
                row.insert(key.clone(), val.clone());
            }
        }
        Ok(())
    }

    fn delete_where(&self, table: &str, column: &str, value: &Value) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        data.rows
            .retain(|row| !row.get(column).is_some_and(|v| values_match(v, value)));
        Ok(())
    }
}

// ============================================================================
// sqlite adapter
// ============================================================================

/// Durable adapter over one sqlite database file, driven through the
/// `sqlite3` CLI with `-json` output.
pub struct SqliteStore {
    path: PathBuf,
    schemas: Mutex<HashMap<String, Vec<Column>>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            path: path.to_path_buf(),
            schemas: Mutex::new(HashMap::new()),
        };

        store.exec("PRAGMA journal_mode=WAL;")?;
        store.exec("PRAGMA synchronous=FULL;")?;
        store.exec("PRAGMA busy_timeout=5000;")?;
        Ok(store)
    }

    /// Factory opening `<data_dir>/<namespace>/<index>.db` per shard.
    pub fn factory(data_dir: &Path, namespace: &str) -> ShardFactory {
        let base = data_dir.join(namespace);
        Box::new(move |index| {
            let store = SqliteStore::open(&base.join(format!("{index}.db")))?;
            Ok(Arc::new(store) as Arc<dyn TableStore>)
        })
    }

    fn exec(&self, sql: &str) -> Result<(), StorageError> {
        let output = Command::new("sqlite3").arg(&self.path).arg(sql).output()?;
        if !output.status.success() {
            return Err(StorageError::Backend(format!(
                "sqlite exec failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn query_json(&self, sql: &str) -> Result<Vec<Row>, StorageError> {
        let output = Command::new("sqlite3")
            .arg("-json")
            .arg(&self.path)
            .arg(sql)
            .output()?;
        if !output.status.success() {
            return Err(StorageError::Backend(format!(
                "sqlite query failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        if output.stdout.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn primary_key(&self, table: &str) -> Option<&'static str> {
        self.schemas
            .lock()
            .get(table)?
            .iter()
            .find(|c| c.kind == ColumnKind::PrimaryKey)
            .map(|c| c.name)
    }
}

fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", sql_quote(s)),
        other => format!("'{}'", sql_quote(&other.to_string())),
    }
}

impl TableStore for SqliteStore {
    fn ensure_schema(&self, table: &str, columns: &[Column]) -> Result<(), StorageError> {
        let defs = columns
            .iter()
            .map(|c| {
                let sql_type = match c.kind {
                    ColumnKind::PrimaryKey => "INTEGER PRIMARY KEY AUTOINCREMENT",
                    ColumnKind::Integer => "INTEGER NOT NULL",
                    ColumnKind::Real => "REAL NOT NULL",
                    ColumnKind::Text => "TEXT NOT NULL",
                };
                format!("{} {}", c.name, sql_type)
            })
            .collect::<Vec<_>>()
            .join(", ");

        self.exec(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            table, defs
        ))?;
        self.schemas
            .lock()
            .insert(table.to_string(), columns.to_vec());
        Ok(())
    }

    fn insert(&self, table: &str, row: Row) -> Result<i64, StorageError> {
        let pk = self.primary_key(table);
        let explicit_id = pk.and_then(|pk| row.get(pk).and_then(Value::as_i64));

        let columns = row.keys().cloned().collect::<Vec<_>>().join(", ");
        let values = row
            .values()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", ");
        self.exec(&format!(
            "INSERT INTO {} ({}) VALUES ({});",
            table, columns, values
        ))?;

        if let Some(id) = explicit_id {
            return Ok(id);
        }

        // Each call runs its own sqlite3 process, so last_insert_rowid()
        // is gone by the time we could ask; read the key back instead.
        let pk = pk.ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        let rows = self.query_json(&format!("SELECT MAX({pk}) AS id FROM {table};"))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("id"))
            .and_then(Value::as_i64)
            .unwrap_or_default())
    }

    fn select_all(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        self.query_json(&format!("SELECT * FROM {table};"))
    }

    fn select_where(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StorageError> {
        self.query_json(&format!(
            "SELECT * FROM {} WHERE {} = {};",
            table,
            column,
            render_value(value)
        ))
    }

    fn update_where(
        &self,
        table: &str,
        column: &str,
        value: &Value,
        patch: Row,
    ) -> Result<(), StorageError> {
        if patch.is_empty() {
            return Ok(());
        }
        let assignments = patch
            .iter()
            .map(|(k, v)| format!("{} = {}", k, render_value(v)))
            .collect::<Vec<_>>()
            .join(", ");
        self.exec(&format!(
            "UPDATE {} SET {} WHERE {} = {};",
            table,
            assignments,
            column,
            render_value(value)
        ))
    }

    fn delete_where(&self, table: &str, column: &str, value: &Value) -> Result<(), StorageError> {
        self.exec(&format!(
            "DELETE FROM {} WHERE {} = {};",
            table,
            column,
            render_value(value)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COLUMNS: &[Column] = &[
        Column::new("id", ColumnKind::PrimaryKey),
        Column::new("cluster_id", ColumnKind::Integer),
        Column::new("payload", ColumnKind::Text),
    ];

    fn row(cluster_id: i64, payload: &str) -> Row {
        let mut row = Row::new();
        row.insert("cluster_id".into(), json!(cluster_id));
        row.insert("payload".into(), json!(payload));
        row
    }

    #[test]
    fn test_memory_insert_assigns_sequential_ids() {
        let store = MemoryStore::new();
        store.ensure_schema("t", COLUMNS).unwrap();

        assert_eq!(store.insert("t", row(0, "a")).unwrap(), 1);
        assert_eq!(store.insert("t", row(0, "b")).unwrap(), 2);

        let rows = store.select_all("t").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[test]
    fn test_memory_insert_honors_explicit_key() {
        let store = MemoryStore::new();
        store.ensure_schema("t", COLUMNS).unwrap();

        let mut explicit = row(3, "x");
        explicit.insert("id".into(), json!(7));
        assert_eq!(store.insert("t", explicit).unwrap(), 7);
        // The counter moves past the explicit key.
        assert_eq!(store.insert("t", row(3, "y")).unwrap(), 8);
    }

    #[test]
    fn test_memory_select_where_filters_by_equality() {
        let store = MemoryStore::new();
        store.ensure_schema("t", COLUMNS).unwrap();
        store.insert("t", row(0, "a")).unwrap();
        store.insert("t", row(1, "b")).unwrap();
        store.insert("t", row(0, "c")).unwrap();

        let hits = store.select_where("t", "cluster_id", &json!(0)).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r["cluster_id"] == json!(0)));
    }

    #[test]
    fn test_memory_update_where_patches_matches_only() {
        let store = MemoryStore::new();
        store.ensure_schema("t", COLUMNS).unwrap();
        store.insert("t", row(0, "a")).unwrap();
        store.insert("t", row(1, "b")).unwrap();

        let mut patch = Row::new();
        patch.insert("payload".into(), json!("patched"));
        store
            .update_where("t", "cluster_id", &json!(0), patch)
            .unwrap();

        let rows = store.select_all("t").unwrap();
        assert_eq!(rows[0]["payload"], json!("patched"));
        assert_eq!(rows[1]["payload"], json!("b"));
    }

    #[test]
    fn test_memory_delete_where_removes_matches() {
        let store = MemoryStore::new();
        store.ensure_schema("t", COLUMNS).unwrap();
        let first = store.insert("t", row(0, "a")).unwrap();
        store.insert("t", row(0, "b")).unwrap();

        store.delete_where("t", "id", &json!(first)).unwrap();
        let rows = store.select_all("t").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["payload"], json!("b"));
    }

    #[test]
    fn test_memory_unknown_table_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.select_all("missing"),
            Err(StorageError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_factory_returns_stable_instances_per_index() {
        let factory = MemoryStore::factory();
        let first = factory(0).unwrap();
        first.ensure_schema("t", COLUMNS).unwrap();
        first.insert("t", row(0, "a")).unwrap();

        // Same index again sees the data; a different index does not.
        let again = factory(0).unwrap();
        assert_eq!(again.select_all("t").unwrap().len(), 1);
        let other = factory(1).unwrap();
        assert!(other.select_all("t").is_err());
    }
}
