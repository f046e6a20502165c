//! Tool arguments
//!
//! One struct per tool, deserialized with `deny_unknown_fields` so typos fail fast instead of
//! being ignored. The same structs generate the tool input schemas.
//!
//! Everything here runs before a connection is acquired; failures are `InvalidArgument`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::backend::{DatabaseType, Dialect};
use crate::error::{GatewayError, Result};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("static regex"));

/// Words, optionally one `(n)` or `(p, s)` modifier, then more words:
/// `VARCHAR(100)`, `DOUBLE PRECISION`, `NUMERIC(10, 2)`, `TIMESTAMP WITH TIME ZONE`
static COLUMN_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^[A-Za-z][A-Za-z0-9_]*( [A-Za-z][A-Za-z0-9_]*)*",
        r"( ?\( ?\d{1,5} ?(, ?\d{1,5} ?)?\))?",
        r"( [A-Za-z][A-Za-z0-9_]*)*$",
    ))
    .expect("static regex")
});

/// Arguments of `execute_query`
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecuteQueryArgs {
    /// SQL statement in the backend's own dialect. Use positional placeholders
    /// (`$1` for PostgreSQL, `@P1` for SQL Server, `?` for MySQL and SQLite) for every value.
    #[serde(alias = "query")]
    pub sql: String,

    /// Values bound to the placeholders, in order. Binary values are written as
    /// `{"$base64": "..."}`.
    #[serde(default)]
    pub parameters: Vec<Value>,

    /// Maximum number of rows to return; extra rows are dropped and `truncated` is set
    #[serde(default)]
    pub max_rows: Option<usize>,
}

/// Arguments of `list_tables`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListTablesArgs {}

/// Arguments of `describe_table`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DescribeTableArgs {
    /// Name of the table
    pub table_name: String,
}

/// One column of `create_table`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    /// Column name (letters, digits, underscore)
    pub name: String,

    /// SQL type, e.g. `INTEGER`, `VARCHAR(100)`, `NUMERIC(10, 2)`
    #[serde(rename = "type")]
    pub data_type: String,

    /// Whether the column accepts NULL (default true)
    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Part of the primary key (default false)
    #[serde(default)]
    pub primary_key: bool,
}

const fn default_true() -> bool {
    true
}

/// Arguments of `create_table`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateTableArgs {
    /// Name of the table to create (letters, digits, underscore)
    pub table_name: String,

    /// Column definitions, in order
    pub columns: Vec<ColumnSpec>,

    /// Succeed without changes when the table already exists
    #[serde(default)]
    pub if_not_exists: bool,
}

/// Arguments of `insert_data`
///
/// Either `rows` (one object per row) or `columns` with a single row of `values`.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InsertDataArgs {
    /// Name of the target table
    pub table_name: String,

    /// Rows to insert; every row must have the same columns
    #[serde(default)]
    pub rows: Option<Vec<Map<String, Value>>>,

    /// Column names for a single-row insert (use with `values`)
    #[serde(default)]
    pub columns: Option<Vec<String>>,

    /// Values for a single-row insert, in the order of `columns`
    #[serde(default)]
    pub values: Option<Vec<Value>>,
}

/// Rows of an insert, validated and laid out by column
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl InsertRows {
    pub fn param_count(&self) -> usize {
        self.columns.len() * self.rows.len()
    }
}

impl InsertDataArgs {
    /// Normalize either input form into column-ordered rows
    pub fn into_rows(self) -> Result<InsertRows> {
        let rows = match (self.rows, self.columns, self.values) {
            (Some(rows), None, None) => rows,
            (None, Some(columns), Some(values)) => {
                if columns.len() != values.len() {
                    return Err(GatewayError::invalid_argument(format!(
                        "insert_data: {} columns but {} values",
                        columns.len(),
                        values.len()
                    )));
                }
                let mut row = Map::new();
                for (column, value) in columns.into_iter().zip(values) {
                    if row.insert(column.clone(), value).is_some() {
                        return Err(GatewayError::invalid_argument(format!(
                            "insert_data: column '{column}' given twice"
                        )));
                    }
                }
                vec![row]
            }
            (None, None, None) => {
                return Err(GatewayError::invalid_argument("insert_data: 'rows' is required"));
            }
            _ => {
                return Err(GatewayError::invalid_argument(
                    "insert_data: pass either 'rows' or both 'columns' and 'values'",
                ));
            }
        };

        let Some(first) = rows.first() else {
            return Err(GatewayError::invalid_argument("insert_data: 'rows' must not be empty"));
        };
        if first.is_empty() {
            return Err(GatewayError::invalid_argument("insert_data: rows[0] has no columns"));
        }

        let columns: Vec<String> = first.keys().cloned().collect();
        for column in &columns {
            validate_identifier(&format!("rows[0].{column}"), column)?;
        }
        let expected: HashSet<&str> = columns.iter().map(String::as_str).collect();

        let mut laid_out = Vec::with_capacity(rows.len());
        for (index, mut row) in rows.into_iter().enumerate() {
            let keys: HashSet<&str> = row.keys().map(String::as_str).collect();
            if keys != expected {
                return Err(GatewayError::invalid_argument(format!(
                    "insert_data: rows[{index}] does not have the same columns as rows[0]"
                )));
            }
            laid_out.push(columns.iter().map(|c| row.remove(c).unwrap_or(Value::Null)).collect());
        }

        Ok(InsertRows {
            columns,
            rows: laid_out,
        })
    }
}

/// Check a table or column name against the identifier pattern
pub fn validate_identifier(argument: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(GatewayError::invalid_argument(format!(
            "{argument}: '{name}' is not a valid identifier (letters, digits and underscore, \
             not starting with a digit, at most 128 characters)"
        )))
    }
}

fn validate_column_type(argument: &str, data_type: &str) -> Result<()> {
    if COLUMN_TYPE.is_match(data_type.trim()) {
        Ok(())
    } else {
        Err(GatewayError::invalid_argument(format!(
            "{argument}: '{data_type}' is not an accepted column type"
        )))
    }
}

/// Build the `CREATE TABLE` statement
pub fn create_table_sql(dialect: &Dialect, args: &CreateTableArgs) -> Result<String> {
    validate_identifier("table_name", &args.table_name)?;
    if args.columns.is_empty() {
        return Err(GatewayError::invalid_argument("create_table: 'columns' must not be empty"));
    }

    let mut seen = HashSet::new();
    let mut definitions = Vec::with_capacity(args.columns.len() + 1);
    let mut primary_key = Vec::new();
    for (index, column) in args.columns.iter().enumerate() {
        validate_identifier(&format!("columns[{index}].name"), &column.name)?;
        validate_column_type(&format!("columns[{index}].type"), &column.data_type)?;
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(GatewayError::invalid_argument(format!(
                "columns[{index}].name: '{}' is defined twice",
                column.name
            )));
        }

        let mut definition =
            format!("{} {}", dialect.quote_ident(&column.name), column.data_type.trim());
        if !column.nullable || column.primary_key {
            definition.push_str(" NOT NULL");
        }
        definitions.push(definition);
        if column.primary_key {
            primary_key.push(dialect.quote_ident(&column.name));
        }
    }
    if !primary_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", primary_key.join(", ")));
    }

    let table = dialect.quote_ident(&args.table_name);
    let definitions = definitions.join(", ");
    Ok(match (args.if_not_exists, dialect.engine) {
        // SQL Server has no IF NOT EXISTS clause for tables
        (true, DatabaseType::MsSql) => format!(
            "IF OBJECT_ID(N'{table}', N'U') IS NULL CREATE TABLE {table} ({definitions})"
        ),
        (true, _) => format!("CREATE TABLE IF NOT EXISTS {table} ({definitions})"),
        (false, _) => format!("CREATE TABLE {table} ({definitions})"),
    })
}

/// Build a multi-row `INSERT` with positional placeholders
pub fn insert_sql(dialect: &Dialect, table: &str, columns: &[String], row_count: usize) -> String {
    let column_list = columns.iter().map(|c| dialect.quote_ident(c)).collect::<Vec<_>>().join(", ");
    let mut position = 0;
    let tuples = (0..row_count)
        .map(|_| {
            let placeholders = columns
                .iter()
                .map(|_| {
                    position += 1;
                    dialect.placeholder(position)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({placeholders})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({column_list}) VALUES {tuples}", dialect.quote_ident(table))
}

/// Reject statements that would bind more parameters than the backend accepts
pub fn check_bind_limit(dialect: &Dialect, count: usize) -> Result<()> {
    if count > dialect.max_bind_params {
        return Err(GatewayError::invalid_argument(format!(
            "insert_data: {count} values exceed the {} engine limit of {} bound parameters; \
             split the rows into smaller batches",
            dialect.engine, dialect.max_bind_params
        )));
    }
    Ok(())
}

/// Reject inserts with more rows than one `VALUES` list may hold
pub fn check_row_limit(dialect: &Dialect, rows: usize) -> Result<()> {
    if rows > dialect.max_insert_rows {
        return Err(GatewayError::invalid_argument(format!(
            "insert_data: {rows} rows exceed the {} limit of {} rows per statement; \
             split the rows into smaller batches",
            dialect.engine, dialect.max_insert_rows
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn column(name: &str, data_type: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
        }
    }

    #[test]
    fn test_execute_query_accepts_query_alias() {
        let args: ExecuteQueryArgs =
            serde_json::from_value(json!({"query": "SELECT 1", "parameters": [1]})).unwrap();
        assert_eq!(args.sql, "SELECT 1");
        assert_eq!(args.parameters, vec![json!(1)]);
        assert_eq!(args.max_rows, None);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: std::result::Result<ExecuteQueryArgs, _> =
            serde_json::from_value(json!({"sql": "SELECT 1", "params": []}));
        assert!(result.is_err());

        let result: std::result::Result<ListTablesArgs, _> =
            serde_json::from_value(json!({"schema": "public"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_column_spec_defaults() {
        let spec: ColumnSpec =
            serde_json::from_value(json!({"name": "id", "type": "INT"})).unwrap();
        assert!(spec.nullable);
        assert!(!spec.primary_key);
    }

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("t", "orders").is_ok());
        assert!(validate_identifier("t", "_tmp_2").is_ok());
        assert!(validate_identifier("t", &"a".repeat(128)).is_ok());
        assert!(validate_identifier("t", &"a".repeat(129)).is_err());
        assert!(validate_identifier("t", "2fast").is_err());
        assert!(validate_identifier("t", "orders; DROP TABLE x").is_err());
        assert!(validate_identifier("t", "").is_err());
    }

    #[test]
    fn test_column_types() {
        for accepted in ["INTEGER", "VARCHAR(100)", "DOUBLE PRECISION", "NUMERIC(10, 2)",
            "numeric(10,2)", "TIMESTAMP WITH TIME ZONE", "INT UNSIGNED"]
        {
            assert!(validate_column_type("c", accepted).is_ok(), "{accepted}");
        }
        for rejected in ["INT; DROP TABLE t", "TEXT DEFAULT 'x'", "VARCHAR(", "INT -- x", ""] {
            assert!(validate_column_type("c", rejected).is_err(), "{rejected}");
        }
    }

    #[test]
    fn test_create_table_sql() {
        let args = CreateTableArgs {
            table_name: "orders".into(),
            columns: vec![
                ColumnSpec {
                    primary_key: true,
                    ..column("id", "INTEGER")
                },
                ColumnSpec {
                    nullable: false,
                    ..column("total", "NUMERIC(10, 2)")
                },
                column("note", "TEXT"),
            ],
            if_not_exists: true,
        };
        assert_eq!(
            create_table_sql(&Dialect::POSTGRES, &args).unwrap(),
            r#"CREATE TABLE IF NOT EXISTS "orders" ("id" INTEGER NOT NULL, "total" NUMERIC(10, 2) NOT NULL, "note" TEXT, PRIMARY KEY ("id"))"#
        );
        assert_eq!(
            create_table_sql(&Dialect::MSSQL, &args).unwrap(),
            "IF OBJECT_ID(N'[orders]', N'U') IS NULL CREATE TABLE [orders] \
             ([id] INTEGER NOT NULL, [total] NUMERIC(10, 2) NOT NULL, [note] TEXT, \
             PRIMARY KEY ([id]))"
        );

        let unguarded = CreateTableArgs {
            if_not_exists: false,
            ..args
        };
        assert_eq!(
            create_table_sql(&Dialect::MYSQL, &unguarded).unwrap(),
            "CREATE TABLE `orders` (`id` INTEGER NOT NULL, `total` NUMERIC(10, 2) NOT NULL, \
             `note` TEXT, PRIMARY KEY (`id`))"
        );
    }

    #[test]
    fn test_create_table_rejects_bad_input() {
        let bad_name = CreateTableArgs {
            table_name: "orders; DROP TABLE users".into(),
            columns: vec![column("id", "INT")],
            if_not_exists: false,
        };
        assert_eq!(
            create_table_sql(&Dialect::SQLITE, &bad_name).unwrap_err().kind(),
            "InvalidArgument"
        );

        let duplicate = CreateTableArgs {
            table_name: "t".into(),
            columns: vec![column("id", "INT"), column("ID", "INT")],
            if_not_exists: false,
        };
        assert!(create_table_sql(&Dialect::SQLITE, &duplicate).is_err());

        let empty = CreateTableArgs {
            table_name: "t".into(),
            columns: vec![],
            if_not_exists: false,
        };
        assert!(create_table_sql(&Dialect::SQLITE, &empty).is_err());
    }

    #[test]
    fn test_insert_sql_numbering() {
        let columns = vec!["id".to_string(), "name".to_string()];
        assert_eq!(
            insert_sql(&Dialect::POSTGRES, "t", &columns, 2),
            r#"INSERT INTO "t" ("id", "name") VALUES ($1, $2), ($3, $4)"#
        );
        assert_eq!(
            insert_sql(&Dialect::SQLITE, "t", &columns, 1),
            r#"INSERT INTO "t" ("id", "name") VALUES (?, ?)"#
        );
        assert_eq!(
            insert_sql(&Dialect::MSSQL, "t", &columns, 2),
            "INSERT INTO [t] ([id], [name]) VALUES (@P1, @P2), (@P3, @P4)"
        );
    }

    #[test]
    fn test_insert_rows_from_objects() {
        let args: InsertDataArgs = serde_json::from_value(json!({
            "table_name": "t",
            "rows": [{"id": 1, "name": "a"}, {"name": "b", "id": 2}]
        }))
        .unwrap();
        let rows = args.into_rows().unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.rows, vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]]);
        assert_eq!(rows.param_count(), 4);
    }

    #[test]
    fn test_insert_rows_from_columns_and_values() {
        let args: InsertDataArgs = serde_json::from_value(json!({
            "table_name": "t",
            "columns": ["id", "name"],
            "values": [7, "x"]
        }))
        .unwrap();
        let rows = args.into_rows().unwrap();
        assert_eq!(rows.rows, vec![vec![json!(7), json!("x")]]);
    }

    #[test]
    fn test_insert_rows_rejects_mismatched_shapes() {
        let cases = [
            json!({"table_name": "t", "rows": []}),
            json!({"table_name": "t", "rows": [{}]}),
            json!({"table_name": "t", "rows": [{"a": 1}, {"b": 2}]}),
            json!({"table_name": "t", "rows": [{"a": 1}, {"a": 1, "b": 2}]}),
            json!({"table_name": "t", "rows": [{"bad name": 1}]}),
            json!({"table_name": "t", "columns": ["a"], "values": [1, 2]}),
            json!({"table_name": "t"}),
        ];
        for case in cases {
            let args: InsertDataArgs = serde_json::from_value(case.clone()).unwrap();
            assert_eq!(args.into_rows().unwrap_err().kind(), "InvalidArgument", "{case}");
        }
    }

    #[test]
    fn test_bind_limit() {
        assert!(check_bind_limit(&Dialect::SQLITE, 32_766).is_ok());
        let err = check_bind_limit(&Dialect::SQLITE, 32_767).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
        assert!(err.message().contains("32766"));
    }

    #[test]
    fn test_row_limit() {
        assert!(check_row_limit(&Dialect::MSSQL, 1_000).is_ok());
        let err = check_row_limit(&Dialect::MSSQL, 1_001).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
        assert!(err.message().contains("mssql"));
        assert!(check_row_limit(&Dialect::POSTGRES, 50_000).is_ok());
    }
}
