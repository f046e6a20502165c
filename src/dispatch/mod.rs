//! Tool Dispatcher
//!
//! Maps a tool call onto one of the fixed tool handlers and shapes the result envelope.
//!
//! # Call States
//! `received → validated → executing → completed | failed`
//!
//! Validation happens entirely before a connection is acquired: an unknown tool, a malformed
//! argument or an unsafe identifier fails with `InvalidArgument` and never reaches the backend.
//! Every failure leaves as an error envelope; nothing escapes unmapped.

pub mod args;

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::coerce::{to_sql_value, DeclaredType, Param};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::executor::{Execution, Executor, Statement};
use crate::output::ResultEnvelope;
use crate::pool::Pool;
use crate::schema::SchemaCache;

use args::{
    check_bind_limit, check_row_limit, create_table_sql, insert_sql, validate_identifier,
    CreateTableArgs, DescribeTableArgs, ExecuteQueryArgs, InsertDataArgs, ListTablesArgs,
};

/// The fixed tool set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    ExecuteQuery,
    ListTables,
    DescribeTable,
    CreateTable,
    InsertData,
}

impl Tool {
    pub const ALL: [Self; 5] = [
        Self::ExecuteQuery,
        Self::ListTables,
        Self::DescribeTable,
        Self::CreateTable,
        Self::InsertData,
    ];

    /// Parse a tool name, accepting the legacy aliases `get_tables` and `get_table_schema`
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "execute_query" => Some(Self::ExecuteQuery),
            "list_tables" | "get_tables" => Some(Self::ListTables),
            "describe_table" | "get_table_schema" => Some(Self::DescribeTable),
            "create_table" => Some(Self::CreateTable),
            "insert_data" => Some(Self::InsertData),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::ExecuteQuery => "execute_query",
            Self::ListTables => "list_tables",
            Self::DescribeTable => "describe_table",
            Self::CreateTable => "create_table",
            Self::InsertData => "insert_data",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::ExecuteQuery => {
                "Execute one SQL statement with positional parameters. Reads return \
                 {rows, row_count, columns, truncated}; writes return {affected, row_count}. \
                 Always pass values through 'parameters' instead of splicing them into the SQL. \
                 Use max_rows on tables of unknown size."
            }
            Self::ListTables => "List the base tables of the connected database",
            Self::DescribeTable => {
                "Describe a table's columns in order: {table, columns: [{name, type, nullable}]}"
            }
            Self::CreateTable => {
                "Create a table from structured column definitions. Names must be plain \
                 identifiers; types are SQL type names such as INTEGER or VARCHAR(100). \
                 Returns status 'created', or 'exists' when if_not_exists is set and the \
                 table is already there."
            }
            Self::InsertData => {
                "Insert one or more rows into a table in a single statement. Values are \
                 converted to each column's declared type."
            }
        }
    }

    /// JSON schema of the tool's arguments
    pub fn input_schema(self) -> Value {
        match self {
            Self::ExecuteQuery => schema_of::<ExecuteQueryArgs>(),
            Self::ListTables => schema_of::<ListTablesArgs>(),
            Self::DescribeTable => schema_of::<DescribeTableArgs>(),
            Self::CreateTable => schema_of::<CreateTableArgs>(),
            Self::InsertData => schema_of::<InsertDataArgs>(),
        }
    }

    /// `[{name, description, inputSchema}]` for every tool
    pub fn catalogue() -> Value {
        Value::Array(
            Self::ALL
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name(),
                        "description": tool.description(),
                        "inputSchema": tool.input_schema(),
                    })
                })
                .collect(),
        )
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

/// A tool invocation as received from the transport
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Build a call from a JSON arguments value; `null` means no arguments
    pub fn from_value(name: impl Into<String>, arguments: Value) -> Result<Self> {
        match arguments {
            Value::Object(map) => Ok(Self::new(name, map)),
            Value::Null => Ok(Self::new(name, Map::new())),
            other => Err(GatewayError::invalid_argument(format!(
                "tool arguments must be an object, got {other}"
            ))),
        }
    }
}

/// Routes tool calls to their handlers
///
/// Holds no per-call state; share it behind an `Arc` across tasks.
pub struct Dispatcher<B: Backend> {
    pool: Pool<B>,
    executor: Executor<B>,
    cache: SchemaCache,
    default_max_rows: Option<usize>,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(backend: Arc<B>, config: &GatewayConfig) -> Self {
        let pool = Pool::new(Arc::clone(&backend), config.pool_settings(), &config.endpoint);
        let executor = Executor::new(backend, config.statement_timeout);
        let cache =
            SchemaCache::new(config.schema_ttl, config.acquire_timeout + config.statement_timeout);
        Self::from_parts(pool, executor, cache, config.max_rows)
    }

    pub const fn from_parts(
        pool: Pool<B>,
        executor: Executor<B>,
        cache: SchemaCache,
        default_max_rows: Option<usize>,
    ) -> Self {
        Self {
            pool,
            executor,
            cache,
            default_max_rows,
        }
    }

    pub const fn pool(&self) -> &Pool<B> {
        &self.pool
    }

    pub const fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Run one tool call to completion
    pub async fn dispatch(&self, call: ToolCall) -> ResultEnvelope {
        let ToolCall { name, arguments } = call;
        debug!(tool = %name, state = "received");

        let outcome = match Tool::from_name(&name) {
            Some(tool) => self.run(tool, arguments).await,
            None => Err(GatewayError::invalid_argument(format!("unknown tool '{name}'"))),
        };

        match &outcome {
            Ok(_) => debug!(tool = %name, state = "completed"),
            Err(e) if e.is_validation() => {
                debug!(tool = %name, state = "failed", kind = e.kind(), error = %e);
            }
            Err(e) => info!(tool = %name, state = "failed", kind = e.kind(), error = %e),
        }
        ResultEnvelope::from_result(outcome)
    }

    /// Close idle sessions
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }

    async fn run(&self, tool: Tool, arguments: Map<String, Value>) -> Result<Value> {
        match tool {
            Tool::ExecuteQuery => self.execute_query(parse(tool, arguments)?).await,
            Tool::ListTables => {
                let ListTablesArgs {} = parse(tool, arguments)?;
                validated(tool);
                let tables = self.cache.list_tables(&self.pool, &self.executor).await?;
                Ok(json!({ "tables": tables }))
            }
            Tool::DescribeTable => self.describe_table(parse(tool, arguments)?).await,
            Tool::CreateTable => self.create_table(parse(tool, arguments)?).await,
            Tool::InsertData => self.insert_data(parse(tool, arguments)?).await,
        }
    }

    async fn execute_query(&self, args: ExecuteQueryArgs) -> Result<Value> {
        if args.sql.trim().is_empty() {
            return Err(GatewayError::invalid_argument("execute_query: 'sql' must not be empty"));
        }
        let params = args
            .parameters
            .iter()
            .enumerate()
            .map(|(index, wire)| {
                let name = format!("parameters[{index}]");
                to_sql_value(&name, wire, DeclaredType::Unknown)
                    .map(|value| Param::new(name, value))
            })
            .collect::<Result<Vec<_>>>()?;
        let max_rows = args.max_rows.or(self.default_max_rows);
        validated(Tool::ExecuteQuery);

        let statement = Statement::new(args.sql, params).with_max_rows(max_rows);
        match self.execute(statement).await? {
            Execution::Rows(set) => Ok(json!({
                "row_count": set.rows.len(),
                "columns": set.columns,
                "truncated": set.truncated,
                "rows": set.rows,
            })),
            Execution::Affected(affected) => {
                // writes and DDL may have changed the schema under the cache
                self.cache.clear();
                Ok(json!({ "affected": affected, "row_count": affected }))
            }
        }
    }

    async fn describe_table(&self, args: DescribeTableArgs) -> Result<Value> {
        if args.table_name.trim().is_empty() {
            return Err(GatewayError::invalid_argument(
                "describe_table: 'table_name' must not be empty",
            ));
        }
        validated(Tool::DescribeTable);

        let entry = self.cache.describe_table(&self.pool, &self.executor, &args.table_name).await?;
        Ok(json!({ "table": entry.table, "columns": entry.columns }))
    }

    async fn create_table(&self, args: CreateTableArgs) -> Result<Value> {
        let sql = create_table_sql(self.pool.backend().dialect(), &args)?;
        validated(Tool::CreateTable);

        if args.if_not_exists {
            // fresh metadata, not a cached answer
            self.cache.invalidate_table(&args.table_name);
            match self.cache.describe_table(&self.pool, &self.executor, &args.table_name).await {
                Ok(_) => return Ok(json!({ "affected": 0, "status": "exists" })),
                Err(GatewayError::TableNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let result = self.execute(Statement::new(sql, Vec::new())).await;
        self.cache.invalidate_table(&args.table_name);
        result?;
        Ok(json!({ "affected": 0, "status": "created" }))
    }

    async fn insert_data(&self, args: InsertDataArgs) -> Result<Value> {
        validate_identifier("table_name", &args.table_name)?;
        let table = args.table_name.clone();
        let input = args.into_rows()?;
        let dialect = self.pool.backend().dialect();
        check_bind_limit(dialect, input.param_count())?;
        check_row_limit(dialect, input.rows.len())?;
        validated(Tool::InsertData);

        let entry = self.cache.describe_table(&self.pool, &self.executor, &table).await?;
        let mut columns = Vec::with_capacity(input.columns.len());
        let mut declared = Vec::with_capacity(input.columns.len());
        for name in &input.columns {
            let column = entry.column(name).ok_or_else(|| {
                GatewayError::invalid_argument(format!("table '{table}' has no column '{name}'"))
            })?;
            columns.push(column.name.clone());
            declared.push(dialect.classify(&column.data_type));
        }

        let mut params = Vec::with_capacity(input.param_count());
        for (index, row) in input.rows.iter().enumerate() {
            for ((wire, name), declared) in row.iter().zip(&input.columns).zip(&declared) {
                let argument = format!("rows[{index}].{name}");
                let value = to_sql_value(&argument, wire, *declared)?;
                params.push(Param::new(argument, value));
            }
        }

        let sql = insert_sql(dialect, &entry.table, &columns, input.rows.len());
        let row_count = match self.execute(Statement::new(sql, params)).await? {
            Execution::Affected(n) => n,
            Execution::Rows(set) => set.rows.len() as u64,
        };
        Ok(json!({ "row_count": row_count }))
    }

    /// Lease a connection for one statement; the lease goes back when this returns
    async fn execute(&self, statement: Statement) -> Result<Execution> {
        let mut lease = self.pool.acquire().await?;
        debug!(slot = lease.descriptor().id, state = "executing");
        self.executor.execute(&mut lease, statement).await
    }
}

fn parse<T: DeserializeOwned>(tool: Tool, arguments: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|e| GatewayError::invalid_argument(format!("{}: {e}", tool.name())))
}

fn validated(tool: Tool) {
    debug!(tool = tool.name(), state = "validated");
}
