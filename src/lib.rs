//! sqlgate - Agent-Facing SQL Gateway
//!
//! sqlgate exposes a relational database to AI agents as a small fixed set of tools
//! (`execute_query`, `list_tables`, `describe_table`, `create_table`, `insert_data`),
//! served over MCP.
//!
//! # Core Principles
//! - Values always travel as bound parameters; SQL text is never rewritten
//! - Structured results and structured errors with stable kinds
//! - Bounded resources: a fixed-size connection pool and per-statement deadlines
//!
//! # Module Organization
//! - [`error`] - Error taxonomy
//! - [`output`] - Result envelope
//! - [`backend`] - Driver interface and the `PostgreSQL`, `MySQL`, SQL Server and `SQLite` drivers
//! - [`coerce`] - Conversion between wire values and SQL values
//! - [`pool`] - Connection pool
//! - [`executor`] - Statement execution under a deadline
//! - [`schema`] - Schema metadata cache
//! - [`dispatch`] - Tool dispatcher
//! - [`config`] - Configuration loading
//! - [`mcp`] - MCP server over stdio

pub mod backend;
pub mod coerce;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod mcp;
pub mod output;
pub mod pool;
pub mod schema;

pub use backend::{Backend, DatabaseType, Dialect, DriverError, Fault, Outcome};
pub use coerce::{DeclaredType, Param, SqlValue};
pub use config::GatewayConfig;
pub use dispatch::{Dispatcher, Tool, ToolCall};
pub use error::{GatewayError, Result};
pub use executor::{Execution, Executor, RowSet, Statement};
pub use output::{ErrorInfo, ResultEnvelope};
pub use pool::{LeasedConnection, Pool, PoolSettings, PoolStatus};
pub use schema::{ColumnInfo, SchemaCache, SchemaEntry};
