//! `SQLite` Backend
//!
//! # Features
//! - File-based databases (created on first connect)
//! - Positional `?` parameters bound from [`SqlValue`]
//! - Result columns decoded using the column's declared type
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); all calls run on `spawn_blocking`
//! - Temporal values are stored as ISO-8601 text, `SQLite`'s native representation
//! - BLOB data is returned as bytes and Base64-encoded by the coercion layer
//! - Lock waits are bounded by `busy_timeout`
//! - Each session is an independent connection, so `:memory:` databases are not shared
//!   between pool slots; use a file

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags};

use crate::backend::{Address, Backend, ConnectionDescriptor, Dialect, DriverError, Fault, Outcome};
use crate::coerce::{DeclaredType, Param, SqlValue};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite` backend
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    busy_timeout: Duration,
}

impl SqliteBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_busy_timeout(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }
}

impl Default for SqliteBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One open `SQLite` connection
///
/// The connection lives behind a mutex so it can be moved onto blocking worker threads.
#[derive(Debug, Clone)]
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSession {
    /// Run `f` against the connection on a blocking worker thread
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DriverError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| DriverError::other(format!("SQLite worker failed: {e}")))?
    }
}

impl Backend for SqliteBackend {
    type Session = SqliteSession;

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SqliteSession, DriverError> {
        let Address::File(path) = &descriptor.address else {
            return Err(DriverError::connect("SQLite requires a database file path"));
        };
        let path = path.clone();
        let busy_timeout = self.busy_timeout;

        let conn = tokio::task::spawn_blocking(move || open_connection(&path, busy_timeout))
            .await
            .map_err(|e| DriverError::connect(format!("SQLite worker failed: {e}")))??;

        Ok(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn execute(
        &self,
        session: &mut SqliteSession,
        sql: &str,
        params: &[Param],
    ) -> Result<Outcome, DriverError> {
        let sql = sql.to_string();
        let values: Vec<Value> = params.iter().map(|p| bind_value(&p.value)).collect();
        session.with_conn(move |conn| execute_statement(conn, &sql, values)).await
    }

    async fn ping(&self, session: &mut SqliteSession) -> Result<(), DriverError> {
        session
            .with_conn(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map(|_| ())
                    .map_err(driver_error)
            })
            .await
    }

    async fn close(&self, session: SqliteSession) {
        drop(session);
    }

    fn dialect(&self) -> &Dialect {
        &Dialect::SQLITE
    }
}

/// Open `SQLite` connection with read-write flags, creating the file if needed
fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, DriverError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(path, flags)
        .map_err(|e| DriverError::connect(format!("Failed to open SQLite database: {e}")))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| DriverError::connect(format!("Failed to set busy timeout: {e}")))?;
    Ok(conn)
}

fn execute_statement(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Outcome, DriverError> {
    let mut stmt = conn.prepare(sql).map_err(driver_error)?;

    if stmt.column_count() == 0 {
        let affected = stmt
            .execute(rusqlite::params_from_iter(values.iter()))
            .map_err(driver_error)?;
        return Ok(Outcome::Affected(affected as u64));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
    let declared: Vec<DeclaredType> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().map_or(DeclaredType::Unknown, |t| Dialect::SQLITE.classify(t)))
        .collect();

    let mut rows = stmt
        .query(rusqlite::params_from_iter(values.iter()))
        .map_err(driver_error)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(driver_error)? {
        let mut values = Vec::with_capacity(columns.len());
        for (idx, declared) in declared.iter().enumerate() {
            let value = row.get_ref(idx).map_err(driver_error)?;
            values.push(decode_value(value, *declared)?);
        }
        out.push(values);
    }

    Ok(Outcome::Rows { columns, rows: out })
}

/// Bind a neutral value as a `SQLite` value
fn bind_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Int(i) => Value::Integer(*i),
        SqlValue::Float(f) => Value::Real(*f),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Decimal(s) | SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Json(v) => Value::Text(v.to_string()),
        temporal_or_uuid => match temporal_or_uuid.to_wire() {
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        },
    }
}

/// Decode a `SQLite` value using the column's declared type
fn decode_value(value: ValueRef<'_>, declared: DeclaredType) -> Result<SqlValue, DriverError> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) if declared == DeclaredType::Boolean => SqlValue::Bool(i != 0),
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| DriverError::other(format!("Invalid UTF-8 in text column: {e}")))?;
            match declared {
                DeclaredType::Json => serde_json::from_str(text)
                    .map_or_else(|_| SqlValue::Text(text.to_string()), SqlValue::Json),
                DeclaredType::Decimal => SqlValue::Decimal(text.to_string()),
                _ => SqlValue::Text(text.to_string()),
            }
        }
        ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
    })
}

/// Classify a `rusqlite` error
fn driver_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| err.to_string());
            let fault = match failure.code {
                ErrorCode::ConstraintViolation => Fault::Constraint,
                ErrorCode::OperationInterrupted => Fault::Cancelled,
                ErrorCode::SystemIoFailure | ErrorCode::DatabaseCorrupt => Fault::Io,
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => Fault::Connect,
                ErrorCode::Unknown if is_compile_error(&message) => Fault::Syntax,
                _ => Fault::Other,
            };
            DriverError::new(fault, message).with_code(failure.extended_code.to_string())
        }
        _ => DriverError::other(err.to_string()),
    }
}

/// Statement compilation failures reported under the generic `SQLITE_ERROR` code
fn is_compile_error(message: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "syntax error",
        "no such table",
        "no such column",
        "incomplete input",
        "unrecognized token",
        "already exists",
    ];
    MARKERS.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Credentials, Encryption};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn descriptor(name: &str) -> (ConnectionDescriptor, PathBuf) {
        let path = std::env::temp_dir().join(format!("sqlgate_backend_{name}.db"));
        let _ = std::fs::remove_file(&path);
        let descriptor = ConnectionDescriptor {
            id: 0,
            address: Address::File(path.clone()),
            credentials: Arc::new(Credentials::default()),
            encryption: Encryption::Disabled,
        };
        (descriptor, path)
    }

    #[tokio::test]
    async fn test_execute_with_parameters() {
        let (descriptor, path) = descriptor("params");
        let backend = SqliteBackend::new();
        let mut session = backend.connect(&descriptor).await.unwrap();

        backend
            .execute(&mut session, "CREATE TABLE t (id INTEGER, name TEXT, flag BOOLEAN)", &[])
            .await
            .unwrap();
        let inserted = backend
            .execute(
                &mut session,
                "INSERT INTO t (id, name, flag) VALUES (?, ?, ?)",
                &[
                    Param::new("parameters[0]", SqlValue::Int(1)),
                    Param::new("parameters[1]", SqlValue::Text("a".into())),
                    Param::new("parameters[2]", SqlValue::Bool(true)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted, Outcome::Affected(1));

        let selected = backend
            .execute(&mut session, "SELECT id, name, flag FROM t WHERE id = ?", &[Param::new(
                "parameters[0]",
                SqlValue::Int(1),
            )])
            .await
            .unwrap();
        assert_eq!(
            selected,
            Outcome::Rows {
                columns: vec!["id".into(), "name".into(), "flag".into()],
                rows: vec![vec![
                    SqlValue::Int(1),
                    SqlValue::Text("a".into()),
                    SqlValue::Bool(true),
                ]],
            }
        );

        backend.close(session).await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let (descriptor, path) = descriptor("blob");
        let backend = SqliteBackend::new();
        let mut session = backend.connect(&descriptor).await.unwrap();

        let outcome = backend
            .execute(&mut session, "SELECT ? AS payload", &[Param::new(
                "parameters[0]",
                SqlValue::Bytes(vec![0, 255, 7]),
            )])
            .await
            .unwrap();
        let Outcome::Rows { rows, .. } = outcome else { panic!("expected rows") };
        assert_eq!(rows[0][0], SqlValue::Bytes(vec![0, 255, 7]));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let (descriptor, path) = descriptor("errors");
        let backend = SqliteBackend::new();
        let mut session = backend.connect(&descriptor).await.unwrap();

        let err = backend.execute(&mut session, "SELEC 1", &[]).await.unwrap_err();
        assert_eq!(err.fault, Fault::Syntax);

        let err = backend.execute(&mut session, "SELECT * FROM missing", &[]).await.unwrap_err();
        assert_eq!(err.fault, Fault::Syntax);

        backend
            .execute(&mut session, "CREATE TABLE u (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        backend.execute(&mut session, "INSERT INTO u VALUES (1)", &[]).await.unwrap();
        let err = backend.execute(&mut session, "INSERT INTO u VALUES (1)", &[]).await.unwrap_err();
        assert_eq!(err.fault, Fault::Constraint);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_ping() {
        let (descriptor, path) = descriptor("ping");
        let backend = SqliteBackend::new();
        let mut session = backend.connect(&descriptor).await.unwrap();
        assert!(backend.ping(&mut session).await.is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_connect_requires_file_address() {
        let descriptor = ConnectionDescriptor {
            id: 0,
            address: Address::Network {
                host: "h".into(),
                port: 1,
                database: "d".into(),
            },
            credentials: Arc::new(Credentials::default()),
            encryption: Encryption::Disabled,
        };
        let err = SqliteBackend::new().connect(&descriptor).await.unwrap_err();
        assert_eq!(err.fault, Fault::Connect);
    }
}
