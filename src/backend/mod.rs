//! Database Backends
//!
//! This module defines the driver interface the gateway core talks to.
//! Each engine (`PostgreSQL`, `MySQL`, SQL Server, `SQLite`) implements the `Backend` trait.
//!
//! # Session Model
//! A backend is stateless; all connection state lives in its `Session` type.
//! The pool owns sessions and hands them to the executor one statement at a time.
//!
//! # Fault Model
//! Drivers report failures as [`DriverError`] with a coarse [`Fault`] class.
//! Translation into gateway error kinds happens in the executor, never here.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coerce::{DeclaredType, Param, SqlValue};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "mssql")]
pub mod mssql;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// Microsoft SQL Server (includes Azure SQL)
    MsSql,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::MsSql => "mssql",
            Self::SQLite => "sqlite",
        }
    }

    /// Default TCP port for network engines
    #[must_use]
    pub const fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySQL => Some(3306),
            Self::MsSql => Some(1433),
            Self::SQLite => None,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport encryption requirement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    /// Plain TCP
    Disabled,
    /// TLS when the server offers it
    Preferred,
    /// TLS or no connection
    #[default]
    Required,
}

/// Where a backend lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Network {
        host: String,
        port: u16,
        database: String,
    },
    File(PathBuf),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { host, port, database } => write!(f, "{host}:{port}/{database}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Login credentials
///
/// WARNING: the password is sensitive. `Debug` redacts it and it must never be logged
/// or included in error messages.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    user: Option<String>,
    password: Option<String>,
}

impl Credentials {
    #[must_use]
    pub const fn new(user: Option<String>, password: Option<String>) -> Self {
        Self { user, password }
    }

    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Immutable description of one pool slot's connection target
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub id: usize,
    pub address: Address,
    pub credentials: Arc<Credentials>,
    pub encryption: Encryption,
}

/// Connection target shared by every descriptor of a pool
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: Address,
    pub credentials: Arc<Credentials>,
    pub encryption: Encryption,
}

impl Endpoint {
    /// Descriptor for the slot with the given id
    #[must_use]
    pub fn descriptor(&self, id: usize) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id,
            address: self.address.clone(),
            credentials: Arc::clone(&self.credentials),
            encryption: self.encryption,
        }
    }
}

/// Raw statement outcome as produced by a driver
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Result set, values in column order
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// Statement without a result set
    Affected(u64),
}

/// Placeholder syntax for positional parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `@P1`, `@P2`, ...
    AtP,
}

/// Engine-specific SQL surface the core needs to build statements
///
/// Metadata queries return rows positionally:
/// - `list_tables_sql`: `(table_name)`
/// - `describe_table_sql`: `(column_name, data_type, is_nullable)` with the table name bound
///   as the single parameter; `is_nullable` is `'YES'`/`'NO'`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub engine: DatabaseType,
    pub identifier_quote: char,
    /// Closing quote; equal to `identifier_quote` except for bracket quoting
    pub identifier_close: char,
    pub placeholder: Placeholder,
    pub max_bind_params: usize,
    /// Rows a single `INSERT ... VALUES` list may carry
    pub max_insert_rows: usize,
    pub list_tables_sql: &'static str,
    pub describe_table_sql: &'static str,
}

impl Dialect {
    pub const POSTGRES: Self = Self {
        engine: DatabaseType::Postgres,
        identifier_quote: '"',
        identifier_close: '"',
        placeholder: Placeholder::Dollar,
        max_bind_params: 65_535,
        max_insert_rows: usize::MAX,
        list_tables_sql: "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        describe_table_sql: "SELECT column_name::text, data_type::text, is_nullable::text \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
    };

    pub const MYSQL: Self = Self {
        engine: DatabaseType::MySQL,
        identifier_quote: '`',
        identifier_close: '`',
        placeholder: Placeholder::Question,
        max_bind_params: 65_535,
        max_insert_rows: usize::MAX,
        list_tables_sql: "SELECT TABLE_NAME FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
             ORDER BY TABLE_NAME",
        describe_table_sql: "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ORDINAL_POSITION",
    };

    pub const MSSQL: Self = Self {
        engine: DatabaseType::MsSql,
        identifier_quote: '[',
        identifier_close: ']',
        placeholder: Placeholder::AtP,
        // 2100 per RPC call, two of which carry the statement and its parameter list
        max_bind_params: 2_098,
        max_insert_rows: 1_000,
        list_tables_sql: "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = SCHEMA_NAME() \
             ORDER BY TABLE_NAME",
        describe_table_sql: "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = SCHEMA_NAME() AND TABLE_NAME = @P1 \
             ORDER BY ORDINAL_POSITION",
    };

    pub const SQLITE: Self = Self {
        engine: DatabaseType::SQLite,
        identifier_quote: '"',
        identifier_close: '"',
        placeholder: Placeholder::Question,
        max_bind_params: 32_766,
        max_insert_rows: usize::MAX,
        list_tables_sql: "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        describe_table_sql: "SELECT name, type, \
             CASE WHEN \"notnull\" = 0 THEN 'YES' ELSE 'NO' END \
             FROM pragma_table_info(?) ORDER BY cid",
    };

    /// Quote an identifier, doubling any embedded closing quote character
    #[must_use]
    pub fn quote_ident(&self, ident: &str) -> String {
        let (open, close) = (self.identifier_quote, self.identifier_close);
        let escaped = ident.replace(close, &format!("{close}{close}"));
        format!("{open}{escaped}{close}")
    }

    /// Placeholder for the 1-based parameter position
    #[must_use]
    pub fn placeholder(&self, position: usize) -> String {
        match self.placeholder {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${position}"),
            Placeholder::AtP => format!("@P{position}"),
        }
    }

    /// Classify a column type name reported by this engine
    ///
    /// `SQLite` stores every integer as 64 bits and every real as a double, and falls back to
    /// its type-affinity rules for names it does not recognise.
    #[must_use]
    pub fn classify(&self, type_name: &str) -> DeclaredType {
        let declared = DeclaredType::classify(type_name);
        match self.engine {
            DatabaseType::Postgres => declared,
            DatabaseType::MySQL => mysql_type(type_name, declared),
            DatabaseType::MsSql => mssql_type(type_name, declared),
            DatabaseType::SQLite => sqlite_affinity(type_name, declared),
        }
    }
}

/// `BOOL` and `BOOLEAN` columns report their storage type, `tinyint(1)`
fn mysql_type(type_name: &str, declared: DeclaredType) -> DeclaredType {
    let compact: String = type_name
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    match compact.as_str() {
        "tinyint(1)" | "bit(1)" => DeclaredType::Boolean,
        _ => declared,
    }
}

fn mssql_type(type_name: &str, declared: DeclaredType) -> DeclaredType {
    let lowered = type_name.trim().to_ascii_lowercase();
    let base = lowered.split('(').next().unwrap_or_default().trim();
    match base {
        "bit" => DeclaredType::Boolean,
        // unsigned, 0 to 255
        "tinyint" => DeclaredType::Integer { bits: 16 },
        "float" => DeclaredType::Float { single: false },
        "money" | "smallmoney" => DeclaredType::Decimal,
        "ntext" | "sysname" | "xml" => DeclaredType::Text,
        // `timestamp` is the old name of `rowversion`, not a point in time
        "image" | "timestamp" | "rowversion" => DeclaredType::Binary,
        "datetime2" | "smalldatetime" => DeclaredType::Timestamp,
        "datetimeoffset" => DeclaredType::TimestampTz,
        "uniqueidentifier" => DeclaredType::Uuid,
        _ => declared,
    }
}

fn sqlite_affinity(type_name: &str, declared: DeclaredType) -> DeclaredType {
    match declared {
        DeclaredType::Integer { .. } => DeclaredType::Integer { bits: 64 },
        DeclaredType::Float { .. } => DeclaredType::Float { single: false },
        DeclaredType::Unknown => {
            let upper = type_name.to_ascii_uppercase();
            if upper.contains("INT") {
                DeclaredType::Integer { bits: 64 }
            } else if ["CHAR", "CLOB", "TEXT"].iter().any(|t| upper.contains(t)) {
                DeclaredType::Text
            } else if ["REAL", "FLOA", "DOUB"].iter().any(|t| upper.contains(t)) {
                DeclaredType::Float { single: false }
            } else {
                DeclaredType::Unknown
            }
        }
        other => other,
    }
}

/// Coarse classification of a driver failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Could not establish or authenticate a session
    Connect,
    /// Statement text or referenced objects rejected
    Syntax,
    /// Integrity constraint rejected the statement
    Constraint,
    /// Server cancelled the statement (statement timeout)
    Cancelled,
    /// Transport failure while the session was in use
    Io,
    /// A parameter could not be bound to the server-side type
    UnsupportedParameter { argument: String },
    /// Anything else the backend reported
    Other,
}

/// Failure reported by a driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub fault: Fault,
    pub message: String,
    /// SQLSTATE or vendor error code
    pub code: Option<String>,
}

impl DriverError {
    pub fn new(fault: Fault, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(Fault::Connect, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(Fault::Io, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Fault::Other, message)
    }

    pub fn unsupported_parameter(argument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Fault::UnsupportedParameter { argument: argument.into() }, message)
    }

    /// Classify by SQLSTATE: class 42 syntax/access, class 23 integrity,
    /// class 08 connection, 57014 query cancelled
    pub fn from_sqlstate(sqlstate: &str, message: impl Into<String>) -> Self {
        let fault = match sqlstate {
            "57014" => Fault::Cancelled,
            s if s.starts_with("42") => Fault::Syntax,
            s if s.starts_with("23") => Fault::Constraint,
            s if s.starts_with("08") => Fault::Io,
            _ => Fault::Other,
        };
        Self::new(fault, message).with_code(sqlstate)
    }
}

/// Database driver interface
///
/// Implementations hold no per-connection state; everything lives in `Session`.
/// Futures must be `Send` so statements can run on spawned tasks.
pub trait Backend: Send + Sync + 'static {
    /// One live connection
    type Session: Send + 'static;

    /// Establish a session for the descriptor
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> impl Future<Output = Result<Self::Session, DriverError>> + Send;

    /// Run one statement with positional parameters
    ///
    /// Parameters are bound exactly as given, in order. SQL text is never rewritten.
    fn execute(
        &self,
        session: &mut Self::Session,
        sql: &str,
        params: &[Param],
    ) -> impl Future<Output = Result<Outcome, DriverError>> + Send;

    /// Lightweight liveness check
    fn ping(&self, session: &mut Self::Session)
        -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Close a session, ignoring errors
    fn close(&self, session: Self::Session) -> impl Future<Output = ()> + Send;

    fn dialect(&self) -> &Dialect;
}
