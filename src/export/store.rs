//! Tabular storage of processed records.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use super::schema;

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl Value {
    /// Integer value of a `u64` column. Values above `i64::MAX` saturate.
    pub fn from_u64(v: u64) -> Self {
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// SQLite ordering: NULL first, numbers by value, then text.
    fn sql_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
            }
        }
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (a, b) if rank(a) == 1 && rank(b) == 1 => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl From<Option<u64>> for Value {
    fn from(v: Option<u64>) -> Self {
        v.map_or(Self::Null, Self::from_u64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Self::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Null => ToSqlOutput::Borrowed(ValueRef::Null),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(f) => Self::Real(f),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                Self::Text(String::from_utf8_lossy(t).into_owned())
            }
        }
    }
}

/// One row, cells in the table's column order.
pub type Row = Vec<Value>;

/// Fixed set of output tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    PcieBandwidth,
    TaskTrack,
    HostTask,
    ComputeOp,
    CollectiveOp,
    StepTrace,
}

const SPAN_COLUMNS: &[&str] = &[
    "connection_id",
    "parent_connection_id",
    "thread_id",
    "start_ns",
    "end_ns",
    "name",
];

impl Table {
    pub const fn name(self) -> &'static str {
        match self {
            Self::PcieBandwidth => "pcie_bandwidth",
            Self::TaskTrack => "task_track",
            Self::HostTask => "host_task",
            Self::ComputeOp => "compute_op",
            Self::CollectiveOp => "collective_op",
            Self::StepTrace => "step_trace",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::PcieBandwidth => &[
                "device_id",
                "timestamp",
                "tx_post_min",
                "tx_post_max",
                "tx_post_avg",
                "tx_nonpost_min",
                "tx_nonpost_max",
                "tx_nonpost_avg",
                "tx_cpl_min",
                "tx_cpl_max",
                "tx_cpl_avg",
                "tx_nonpost_latency_min",
                "tx_nonpost_latency_max",
                "tx_nonpost_latency_avg",
                "rx_post_min",
                "rx_post_max",
                "rx_post_avg",
                "rx_nonpost_min",
                "rx_nonpost_max",
                "rx_nonpost_avg",
                "rx_cpl_min",
                "rx_cpl_max",
                "rx_cpl_avg",
            ],
            Self::TaskTrack => &[
                "device_id",
                "stream_id",
                "task_id",
                "batch_id",
                "task_type",
                "timestamp",
            ],
            Self::HostTask => &[
                "connection_id",
                "parent_connection_id",
                "thread_id",
                "start_ns",
                "end_ns",
                "name",
                "device_id",
                "stream_id",
                "task_id",
            ],
            Self::ComputeOp | Self::CollectiveOp | Self::StepTrace => SPAN_COLUMNS,
        }
    }

    pub fn column_index(self, column: &str) -> Option<usize> {
        self.columns().iter().position(|c| *c == column)
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::PcieBandwidth,
            Self::TaskTrack,
            Self::HostTask,
            Self::ComputeOp,
            Self::CollectiveOp,
            Self::StepTrace,
        ]
    }

    fn insert_sql(self) -> String {
        let columns = self.columns();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name(),
            columns.join(", "),
            placeholders.join(", ")
        )
    }

    fn check_row(self, row: &Row) -> Result<()> {
        if row.len() != self.columns().len() {
            bail!(
                "{}: row has {} values, table has {} columns",
                self.name(),
                row.len(),
                self.columns().len()
            );
        }
        Ok(())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row selection: equality filters, optional ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    table: Table,
    filters: Vec<(&'static str, Value)>,
    order_by: Option<&'static str>,
    limit: Option<usize>,
}

impl Selector {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter_eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push((column, value.into()));
        self
    }

    pub fn order_by(mut self, column: &'static str) -> Self {
        self.order_by = Some(column);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn table(&self) -> Table {
        self.table
    }

    fn check_columns(&self) -> Result<()> {
        let named = self
            .filters
            .iter()
            .map(|(c, _)| *c)
            .chain(self.order_by);
        for column in named {
            if self.table.column_index(column).is_none() {
                bail!("{}: unknown column {column}", self.table);
            }
        }
        Ok(())
    }

    /// Parameterised SQL and its parameters. Column names are checked against
    /// the table schema before they reach the statement text.
    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        self.check_columns()?;

        let mut sql = format!(
            "SELECT {} FROM {}",
            self.table.columns().join(", "),
            self.table.name()
        );
        let mut params = Vec::with_capacity(self.filters.len());
        for (i, (column, value)) in self.filters.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            if *value == Value::Null {
                sql.push_str(&format!("{column} IS NULL"));
            } else {
                params.push(value.clone());
                sql.push_str(&format!("{column} = ?{}", params.len()));
            }
        }
        if let Some(column) = self.order_by {
            sql.push_str(&format!(" ORDER BY {column}"));
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        Ok((sql, params))
    }
}

/// Relational store for processed rows.
pub trait RecordStore: Send + Sync {
    /// Inserts rows atomically and returns how many were written.
    fn insert(&self, table: Table, rows: Vec<Row>) -> Result<usize>;

    fn query(&self, selector: &Selector) -> Result<Vec<Row>>;
}

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store. One connection, serialized by a mutex.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Opens (or creates) the database file and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`SqliteRecordStore::open`], waiting up to `busy_timeout` for a
    /// lock held by another connection to the same file.
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("setting database busy timeout")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        let version = schema::migrate(&mut conn)?;
        tracing::debug!(version, "record store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, table: Table, rows: Vec<Row>) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in &rows {
            table.check_row(row)?;
        }

        let sql = table.insert_sql();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .with_context(|| format!("starting insert into {table}"))?;
        {
            let mut stmt = tx
                .prepare_cached(&sql)
                .with_context(|| format!("preparing insert into {table}"))?;
            for row in &rows {
                stmt.execute(params_from_iter(row.iter()))
                    .with_context(|| format!("inserting into {table}"))?;
            }
        }
        tx.commit()
            .with_context(|| format!("committing insert into {table}"))?;

        Ok(rows.len())
    }

    fn query(&self, selector: &Selector) -> Result<Vec<Row>> {
        let (sql, params) = selector.to_sql()?;
        let width = selector.table().columns().len();

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("preparing query on {}", selector.table()))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(Value::from))
                    .collect::<rusqlite::Result<Row>>()
            })
            .with_context(|| format!("querying {}", selector.table()))?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .with_context(|| format!("reading rows of {}", selector.table()))?;

        Ok(rows)
    }
}

/// In-process store with the same semantics as [`SqliteRecordStore`].
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, Vec::len)
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, table: Table, rows: Vec<Row>) -> Result<usize> {
        for row in &rows {
            table.check_row(row)?;
        }
        let n = rows.len();
        self.tables.write().entry(table).or_default().extend(rows);
        Ok(n)
    }

    fn query(&self, selector: &Selector) -> Result<Vec<Row>> {
        selector.check_columns()?;
        let table = selector.table();

        let filters: Vec<(usize, &Value)> = selector
            .filters
            .iter()
            .filter_map(|(c, v)| table.column_index(c).map(|i| (i, v)))
            .collect();

        let tables = self.tables.read();
        let mut rows: Vec<Row> = tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|(i, v)| row.get(*i) == Some(*v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(i) = selector.order_by.and_then(|c| table.column_index(c)) {
            rows.sort_by(|a, b| match (a.get(i), b.get(i)) {
                (Some(x), Some(y)) => x.sql_cmp(y),
                _ => Ordering::Equal,
            });
        }
        if let Some(n) = selector.limit {
            rows.truncate(n);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_row(stream: u16, task_id: u32, ts: u64) -> Row {
        vec![
            Value::from(0u16),
            Value::from(stream),
            Value::from(task_id),
            Value::from(0u16),
            Value::from(1u16),
            Value::from_u64(ts),
        ]
    }

    fn exercise(store: &dyn RecordStore) {
        let rows = vec![task_row(2, 7, 30), task_row(1, 5, 20), task_row(2, 6, 10)];
        assert_eq!(store.insert(Table::TaskTrack, rows).expect("insert"), 3);

        let selected = store
            .query(
                &Selector::new(Table::TaskTrack)
                    .filter_eq("stream_id", 2u16)
                    .order_by("timestamp"),
            )
            .expect("query");
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0][2], Value::Integer(6));
        assert_eq!(selected[1][2], Value::Integer(7));

        let limited = store
            .query(&Selector::new(Table::TaskTrack).order_by("task_id").limit(1))
            .expect("query");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0][2], Value::Integer(5));
    }

    #[test]
    fn test_sqlite_store() {
        let store = SqliteRecordStore::open_in_memory().expect("open");
        exercise(&store);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryRecordStore::new();
        exercise(&store);
        assert_eq!(store.row_count(Table::TaskTrack), 3);
    }

    #[test]
    fn test_sqlite_file_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("npuprof.db");
        {
            let store = SqliteRecordStore::open(&path).expect("open");
            store
                .insert(Table::TaskTrack, vec![task_row(1, 1, 1)])
                .expect("insert");
        }
        let store = SqliteRecordStore::open(&path).expect("reopen");
        let rows = store
            .query(&Selector::new(Table::TaskTrack))
            .expect("query");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_row_width_checked() {
        let store = MemoryRecordStore::new();
        let err = store
            .insert(Table::TaskTrack, vec![vec![Value::Null]])
            .expect_err("short row");
        assert!(err.to_string().contains("task_track"));
    }

    #[test]
    fn test_selector_rejects_unknown_column() {
        let err = Selector::new(Table::HostTask)
            .filter_eq("nope; DROP TABLE host_task", 1u32)
            .to_sql()
            .expect_err("unknown column");
        assert!(err.to_string().contains("unknown column"));
    }

    #[test]
    fn test_selector_sql() {
        let (sql, params) = Selector::new(Table::StepTrace)
            .filter_eq("thread_id", 3u32)
            .filter_eq("parent_connection_id", Value::Null)
            .order_by("start_ns")
            .limit(10)
            .to_sql()
            .expect("sql");
        assert_eq!(
            sql,
            "SELECT connection_id, parent_connection_id, thread_id, start_ns, end_ns, name \
             FROM step_trace WHERE thread_id = ?1 AND parent_connection_id IS NULL \
             ORDER BY start_ns LIMIT 10"
        );
        assert_eq!(params, vec![Value::Integer(3)]);
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(Value::Null.sql_cmp(&Value::Integer(0)), Ordering::Less);
        assert_eq!(Value::Integer(2).sql_cmp(&Value::Real(1.5)), Ordering::Greater);
        assert_eq!(Value::Real(9.0).sql_cmp(&Value::from("a")), Ordering::Less);
    }
}
