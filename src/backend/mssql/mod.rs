//! SQL Server Backend
//!
//! # Features
//! - TDS connections to SQL Server and Azure SQL, TLS through `rustls`
//! - Azure SQL gateway redirects are followed once
//! - Parameters travel as RPC parameters named `@P1`, `@P2`, ...
//!
//! # Implementation Notes
//! - Uses `tiberius` over a tokio `TcpStream` (`tokio-util` compat layer)
//! - TDS hands out row counts and result sets through different calls. Statements whose
//!   leading keyword is `SELECT`, `WITH`, `EXEC` or `VALUES` are read as result sets,
//!   everything else as a row count
//! - DECIMAL and MONEY values are returned as exact decimal text
//! - `Preferred` encryption negotiates TLS when the server supports it

use std::borrow::Cow;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::backend::{
    Address, Backend, ConnectionDescriptor, Dialect, DriverError, Encryption, Fault, Outcome,
};
use crate::coerce::{widen_single, Param, SqlValue};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server backend
#[derive(Debug, Clone)]
pub struct MsSqlBackend {
    connect_timeout: Duration,
}

impl MsSqlBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for MsSqlBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MsSqlBackend {
    type Session = TdsClient;

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<TdsClient, DriverError> {
        let config = build_config(descriptor)?;
        match tokio::time::timeout(self.connect_timeout, open(config)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::connect(format!(
                "Timed out connecting to SQL Server after {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }

    async fn execute(
        &self,
        client: &mut TdsClient,
        sql: &str,
        params: &[Param],
    ) -> Result<Outcome, DriverError> {
        let bound: Vec<TdsParam<'_>> = params.iter().map(|p| TdsParam(&p.value)).collect();
        let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p as &dyn ToSql).collect();

        if !returns_rows(sql) {
            let result = client.execute(sql, &refs).await.map_err(driver_error)?;
            return Ok(Outcome::Affected(result.total()));
        }

        let mut stream = client.query(sql, &refs).await.map_err(driver_error)?;
        let names: Option<Vec<String>> = stream
            .columns()
            .await
            .map_err(driver_error)?
            .map(|columns| columns.iter().map(|c| c.name().to_string()).collect());
        let Some(names) = names else {
            // EXEC of a procedure that returns no result set
            stream.into_results().await.map_err(driver_error)?;
            return Ok(Outcome::Affected(0));
        };

        let rows = stream.into_first_result().await.map_err(driver_error)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = row
                .cells()
                .map(|(_, data)| decode_value(data))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(values);
        }

        Ok(Outcome::Rows {
            columns: names,
            rows: out,
        })
    }

    async fn ping(&self, client: &mut TdsClient) -> Result<(), DriverError> {
        let stream = client.simple_query("SELECT 1").await.map_err(driver_error)?;
        stream.into_results().await.map_err(driver_error)?;
        Ok(())
    }

    async fn close(&self, client: TdsClient) {
        let _ = client.close().await;
    }

    fn dialect(&self) -> &Dialect {
        &Dialect::MSSQL
    }
}

/// Build a `tiberius` config from a descriptor
fn build_config(descriptor: &ConnectionDescriptor) -> Result<Config, DriverError> {
    let Address::Network {
        host,
        port,
        database,
    } = &descriptor.address
    else {
        return Err(DriverError::connect("SQL Server requires a network address"));
    };
    let Some(user) = descriptor.credentials.user() else {
        return Err(DriverError::connect("SQL Server requires a user name"));
    };

    let mut config = Config::new();
    config.host(host);
    config.port(*port);
    config.database(database);
    config.application_name("sqlgate");
    config.authentication(AuthMethod::sql_server(
        user,
        descriptor.credentials.password().unwrap_or_default(),
    ));
    config.encryption(match descriptor.encryption {
        Encryption::Disabled => EncryptionLevel::NotSupported,
        Encryption::Preferred => EncryptionLevel::On,
        Encryption::Required => EncryptionLevel::Required,
    });
    Ok(config)
}

async fn open(config: Config) -> Result<TdsClient, DriverError> {
    let client = match dial(config.clone()).await {
        // Azure SQL gateways redirect to the node that hosts the database
        Err(TdsError::Routing { host, port }) => {
            tracing::debug!(%host, port, "following SQL Server redirect");
            let mut config = config;
            config.host(&host);
            config.port(port);
            dial(config).await
        }
        other => other,
    };
    client.map_err(|e| DriverError::connect(format!("Failed to connect to SQL Server: {e}")))
}

async fn dial(config: Config) -> tiberius::Result<TdsClient> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config, tcp.compat_write()).await
}

/// Whether the statement's leading keyword produces a result set
fn returns_rows(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "SELECT" | "WITH" | "EXEC" | "EXECUTE" | "VALUES"
    )
}

fn leading_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Parameter bound from a neutral value
struct TdsParam<'a>(&'a SqlValue);

impl ToSql for TdsParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0 {
            SqlValue::Null => ColumnData::String(None),
            SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
            SqlValue::Int(i) => ColumnData::I64(Some(*i)),
            SqlValue::Float(f) => ColumnData::F64(Some(*f)),
            // the server converts nvarchar to DECIMAL without losing digits
            SqlValue::Decimal(s) | SqlValue::Text(s) => {
                ColumnData::String(Some(Cow::Borrowed(s.as_str())))
            }
            SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            SqlValue::Date(d) => d.to_sql(),
            SqlValue::Time(t) => t.to_sql(),
            SqlValue::Timestamp(ts) => ts.to_sql(),
            SqlValue::TimestampTz(ts) => ts.to_sql(),
            SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
            SqlValue::Json(v) => ColumnData::String(Some(Cow::Owned(v.to_string()))),
        }
    }
}

fn decode_value(data: &ColumnData<'static>) -> Result<SqlValue, DriverError> {
    let value = match data {
        ColumnData::Bit(Some(b)) => SqlValue::Bool(*b),
        ColumnData::U8(Some(v)) => SqlValue::Int(i64::from(*v)),
        ColumnData::I16(Some(v)) => SqlValue::Int(i64::from(*v)),
        ColumnData::I32(Some(v)) => SqlValue::Int(i64::from(*v)),
        ColumnData::I64(Some(v)) => SqlValue::Int(*v),
        ColumnData::F32(Some(v)) => SqlValue::Float(widen_single(*v)),
        ColumnData::F64(Some(v)) => SqlValue::Float(*v),
        ColumnData::Numeric(Some(n)) => SqlValue::Decimal(numeric_text(n.value(), n.scale())),
        ColumnData::String(Some(s)) => SqlValue::Text(s.to_string()),
        ColumnData::Guid(Some(g)) => SqlValue::Uuid(*g),
        ColumnData::Binary(Some(b)) => SqlValue::Bytes(b.to_vec()),
        ColumnData::Xml(Some(xml)) => SqlValue::Text(xml.to_string()),
        ColumnData::Date(Some(_)) => temporal(NaiveDate::from_sql(data), SqlValue::Date)?,
        ColumnData::Time(Some(_)) => temporal(NaiveTime::from_sql(data), SqlValue::Time)?,
        ColumnData::DateTime(Some(_))
        | ColumnData::SmallDateTime(Some(_))
        | ColumnData::DateTime2(Some(_)) => {
            temporal(NaiveDateTime::from_sql(data), SqlValue::Timestamp)?
        }
        ColumnData::DateTimeOffset(Some(_)) => {
            temporal(DateTime::<FixedOffset>::from_sql(data), SqlValue::TimestampTz)?
        }
        _ => SqlValue::Null,
    };
    Ok(value)
}

fn temporal<T>(
    decoded: tiberius::Result<Option<T>>,
    wrap: impl FnOnce(T) -> SqlValue,
) -> Result<SqlValue, DriverError> {
    Ok(decoded.map_err(driver_error)?.map_or(SqlValue::Null, wrap))
}

/// Render a scaled integer (`-1250`, scale 2) as decimal text (`-12.50`)
fn numeric_text(value: i128, scale: u8) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let digits = value.unsigned_abs().to_string();
    let scale = usize::from(scale);
    if scale == 0 {
        return format!("{sign}{digits}");
    }
    let padded = format!("{digits:0>width$}", width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    format!("{sign}{int_part}.{frac_part}")
}

/// Classify a `tiberius` error
fn driver_error(err: TdsError) -> DriverError {
    match &err {
        TdsError::Server(token) => {
            let number = token.code();
            let message = format!("{} (error {number})", token.message());
            DriverError::new(server_fault(number), message).with_code(number.to_string())
        }
        TdsError::Io { .. } => DriverError::io(err.to_string()),
        _ => DriverError::other(err.to_string()),
    }
}

/// Fault class for a SQL Server error number
fn server_fault(number: u32) -> Fault {
    match number {
        // 2601/2627 duplicate key, 547 foreign key or check, 515 NULL into NOT NULL
        515 | 547 | 2601 | 2627 => Fault::Constraint,
        // 102/105/156/170 parse errors, 207/208/4104 unknown names, 2714 object exists
        102 | 105 | 156 | 170 | 207 | 208 | 209 | 2714 | 4104 => Fault::Syntax,
        // 3980/3988 request aborted by an attention signal
        3980 | 3988 => Fault::Cancelled,
        // 4060 database unavailable, 18456 login failed, 40613 Azure database offline
        4060 | 18456 | 40613 => Fault::Connect,
        _ => Fault::Other,
    }
}
