//! Schema Cache
//!
//! Caches the table list and per-table column metadata with a TTL.
//!
//! # Single Flight
//! Every key maps to a shared `OnceCell`. Concurrent misses on the same key wait on the same
//! cell, so only one metadata query runs; if that fetch fails the cell stays empty and the next
//! waiter runs its own. Expired cells are swapped for fresh ones under the map lock, but all
//! backend I/O happens after the lock is released.
//!
//! Misses are never cached: a table that does not exist yields `TableNotFound` every time,
//! and a failed fetch leaves no entry behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::backend::Backend;
use crate::coerce::{Param, SqlValue};
use crate::error::{GatewayError, Result};
use crate::executor::{Execution, Executor, Statement};
use crate::pool::Pool;

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Type name as reported by the backend
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

/// Cached description of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    pub table: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnInfo>,
    pub fetched_at: Instant,
}

impl SchemaEntry {
    /// Find a column by exact name, falling back to a case-insensitive match
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }
}

#[derive(Debug)]
struct TableList {
    tables: Vec<String>,
    fetched_at: Instant,
}

trait Fetched {
    fn fetched_at(&self) -> Instant;
}

impl Fetched for SchemaEntry {
    fn fetched_at(&self) -> Instant {
        self.fetched_at
    }
}

impl Fetched for TableList {
    fn fetched_at(&self) -> Instant {
        self.fetched_at
    }
}

type Cell<T> = Arc<OnceCell<Arc<T>>>;

#[derive(Default)]
struct Entries {
    tables: Option<Cell<TableList>>,
    columns: HashMap<String, Cell<SchemaEntry>>,
}

/// TTL cache over the backend's metadata queries
pub struct SchemaCache {
    ttl: Duration,
    /// Upper bound on waiting for a fetch, own or shared
    wait_timeout: Duration,
    entries: Mutex<Entries>,
}

impl SchemaCache {
    pub fn new(ttl: Duration, wait_timeout: Duration) -> Self {
        Self {
            ttl,
            wait_timeout,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of tables holding a column entry, fetched or in flight
    pub fn cached_tables(&self) -> usize {
        self.lock().columns.len()
    }

    /// Names of the base tables visible to the connection, sorted by the backend
    pub async fn list_tables<B: Backend>(
        &self,
        pool: &Pool<B>,
        executor: &Executor<B>,
    ) -> Result<Vec<String>> {
        let cell = {
            let mut entries = self.lock();
            current_cell(&mut entries.tables, self.ttl)
        };

        let list = self
            .await_cell(&cell, "table list", || async {
                let sql = pool.backend().dialect().list_tables_sql;
                let rows = fetch_rows(pool, executor, sql, Vec::new()).await?;
                let tables = rows
                    .into_iter()
                    .filter_map(|row| row.into_iter().next().and_then(text))
                    .collect();
                Ok(Arc::new(TableList {
                    tables,
                    fetched_at: Instant::now(),
                }))
            })
            .await?;

        Ok(list.tables.clone())
    }

    /// Column metadata for one table
    pub async fn describe_table<B: Backend>(
        &self,
        pool: &Pool<B>,
        executor: &Executor<B>,
        table: &str,
    ) -> Result<Arc<SchemaEntry>> {
        let cell = {
            let mut entries = self.lock();
            let mut slot = entries.columns.remove(table);
            let cell = current_cell(&mut slot, self.ttl);
            entries.columns.insert(table.to_string(), Arc::clone(&cell));
            cell
        };

        let fetched = self.await_cell(&cell, table, || async {
            let sql = pool.backend().dialect().describe_table_sql;
            let params = vec![Param::new("table_name", SqlValue::Text(table.to_string()))];
            let rows = fetch_rows(pool, executor, sql, params).await?;
            let columns: Vec<ColumnInfo> = rows.into_iter().filter_map(column_info).collect();
            if columns.is_empty() {
                return Err(GatewayError::table_not_found(table));
            }
            Ok(Arc::new(SchemaEntry {
                table: table.to_string(),
                columns,
                fetched_at: Instant::now(),
            }))
        })
        .await;

        if fetched.is_err() {
            self.forget_unfilled(table, &cell);
        }
        fetched
    }

    /// Drop one table's entry and the table list
    pub fn invalidate_table(&self, table: &str) {
        let mut entries = self.lock();
        entries.columns.remove(table);
        entries.tables = None;
        debug!(table, "schema cache entry invalidated");
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.columns.clear();
        entries.tables = None;
        debug!("schema cache cleared");
    }

    /// Remove a table's key if it still maps to `cell` and the cell never got a value
    fn forget_unfilled(&self, table: &str, cell: &Cell<SchemaEntry>) {
        let mut entries = self.lock();
        let unfilled = entries
            .columns
            .get(table)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && current.get().is_none());
        if unfilled {
            entries.columns.remove(table);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn await_cell<T, F, Fut>(&self, cell: &Cell<T>, key: &str, fetch: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<T>>>,
    {
        if let Some(value) = cell.get() {
            debug!(key, "schema cache hit");
            return Ok(Arc::clone(value));
        }

        let init = async {
            debug!(key, "schema cache miss, fetching");
            fetch().await
        };
        match tokio::time::timeout(self.wait_timeout, cell.get_or_try_init(|| init)).await {
            Ok(Ok(value)) => Ok(Arc::clone(value)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::timeout(format!(
                "metadata for '{key}' was not available within {}ms",
                self.wait_timeout.as_millis()
            ))),
        }
    }
}

/// The slot's cell, replaced first if it holds an expired value
fn current_cell<T: Fetched>(slot: &mut Option<Cell<T>>, ttl: Duration) -> Cell<T> {
    let expired = slot
        .as_ref()
        .and_then(|cell| cell.get())
        .is_some_and(|value| value.fetched_at().elapsed() >= ttl);
    if expired {
        *slot = None;
    }
    Arc::clone(slot.get_or_insert_with(Default::default))
}

async fn fetch_rows<B: Backend>(
    pool: &Pool<B>,
    executor: &Executor<B>,
    sql: &str,
    params: Vec<Param>,
) -> Result<Vec<Vec<Value>>> {
    let mut lease = pool.acquire().await?;
    let execution = executor.execute(&mut lease, Statement::new(sql, params)).await?;
    match execution {
        Execution::Rows(set) => {
            Ok(set.rows.into_iter().map(|row| row.into_iter().map(|(_, v)| v).collect()).collect())
        }
        Execution::Affected(_) => Ok(Vec::new()),
    }
}

fn text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// `(column_name, data_type, is_nullable)`
fn column_info(row: Vec<Value>) -> Option<ColumnInfo> {
    let mut values = row.into_iter();
    let name = values.next().and_then(text)?;
    let data_type = values.next().and_then(text).unwrap_or_default();
    let nullable = values
        .next()
        .and_then(text)
        .map_or(true, |flag| flag.eq_ignore_ascii_case("YES"));
    Some(ColumnInfo {
        name,
        data_type,
        nullable,
    })
}
