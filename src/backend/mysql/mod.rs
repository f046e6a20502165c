//! `MySQL` Backend
//!
//! # Features
//! - Client-server connections via TCP (`MySQL` and `MariaDB`), TLS through `rustls`
//! - Statements with parameters run as prepared statements (binary protocol);
//!   statements without parameters use the text protocol so non-preparable commands work
//! - Result columns decoded by column type, for both protocols
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - `Preferred` encryption behaves like `Required`: the driver has no opportunistic TLS
//! - DECIMAL values are returned as exact decimal text
//! - Binary-charset string columns (BLOB, VARBINARY) are returned as bytes

use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Column, Conn, Opts, OptsBuilder, Params, Row, SslOpts, Value};

use crate::backend::{
    Address, Backend, ConnectionDescriptor, Dialect, DriverError, Encryption, Fault, Outcome,
};
use crate::coerce::{widen_single, Param, SqlValue};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Character set id `MySQL` reports for binary strings
const BINARY_CHARSET: u16 = 63;

/// `MySQL` backend
#[derive(Debug, Clone)]
pub struct MySqlBackend {
    connect_timeout: Duration,
}

impl MySqlBackend {
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

impl Default for MySqlBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MySqlBackend {
    type Session = Conn;

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Conn, DriverError> {
        let opts = build_mysql_opts(descriptor)?;
        match tokio::time::timeout(self.connect_timeout, Conn::new(opts)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(DriverError::connect(format!("Failed to connect to MySQL: {e}"))),
            Err(_) => Err(DriverError::connect(format!(
                "Timed out connecting to MySQL after {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }

    async fn execute(
        &self,
        conn: &mut Conn,
        sql: &str,
        params: &[Param],
    ) -> Result<Outcome, DriverError> {
        let (columns, rows, affected) = if params.is_empty() {
            let mut result = conn.query_iter(sql).await.map_err(driver_error)?;
            let columns = result.columns();
            let rows: Vec<Row> = result.collect().await.map_err(driver_error)?;
            let affected = result.affected_rows();
            result.drop_result().await.map_err(driver_error)?;
            (columns, rows, affected)
        } else {
            let values: Vec<Value> = params.iter().map(|p| bind_value(&p.value)).collect();
            let mut result =
                conn.exec_iter(sql, Params::Positional(values)).await.map_err(driver_error)?;
            let columns = result.columns();
            let rows: Vec<Row> = result.collect().await.map_err(driver_error)?;
            let affected = result.affected_rows();
            result.drop_result().await.map_err(driver_error)?;
            (columns, rows, affected)
        };

        let Some(columns) = columns.filter(|c| !c.is_empty()) else {
            return Ok(Outcome::Affected(affected));
        };

        let names: Vec<String> = columns.iter().map(|c| c.name_str().to_string()).collect();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let value = row.as_ref(idx).unwrap_or(&Value::NULL);
                values.push(decode_value(value, column));
            }
            out.push(values);
        }

        Ok(Outcome::Rows {
            columns: names,
            rows: out,
        })
    }

    async fn ping(&self, conn: &mut Conn) -> Result<(), DriverError> {
        conn.ping().await.map_err(driver_error)
    }

    async fn close(&self, conn: Conn) {
        let _ = conn.disconnect().await;
    }

    fn dialect(&self) -> &Dialect {
        &Dialect::MYSQL
    }
}

/// Build `MySQL` connection options from a descriptor
fn build_mysql_opts(descriptor: &ConnectionDescriptor) -> Result<Opts, DriverError> {
    let Address::Network { host, port, database } = &descriptor.address else {
        return Err(DriverError::connect("MySQL requires a network address"));
    };

    let ssl_opts = match descriptor.encryption {
        Encryption::Disabled => None,
        Encryption::Preferred | Encryption::Required => Some(SslOpts::default()),
    };

    let opts = OptsBuilder::default()
        .ip_or_hostname(host.clone())
        .tcp_port(*port)
        .user(descriptor.credentials.user())
        .pass(descriptor.credentials.password())
        .db_name(Some(database.clone()))
        .prefer_socket(false)
        .ssl_opts(ssl_opts);

    Ok(Opts::from(opts))
}

/// Bind a neutral value as a `MySQL` value
fn bind_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Bool(b) => Value::Int(i64::from(*b)),
        SqlValue::Int(i) => Value::Int(*i),
        SqlValue::Float(f) => Value::Double(*f),
        SqlValue::Decimal(s) | SqlValue::Text(s) => Value::Bytes(s.clone().into_bytes()),
        SqlValue::Bytes(b) => Value::Bytes(b.clone()),
        SqlValue::Date(d) => datetime_value(d.and_time(NaiveTime::default())),
        SqlValue::Time(t) => Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
        SqlValue::Timestamp(ts) => datetime_value(*ts),
        SqlValue::TimestampTz(ts) => datetime_value(ts.naive_utc()),
        SqlValue::Uuid(u) => Value::Bytes(u.hyphenated().to_string().into_bytes()),
        SqlValue::Json(v) => Value::Bytes(v.to_string().into_bytes()),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn datetime_value(ts: NaiveDateTime) -> Value {
    Value::Date(
        ts.year() as u16,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        ts.nanosecond() / 1_000,
    )
}

/// Decode a `MySQL` value using its column metadata
///
/// The text protocol delivers every value as bytes, so the column type decides the shape.
fn decode_value(value: &Value, column: &Column) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(i) => SqlValue::Int(*i),
        Value::UInt(u) => {
            i64::try_from(*u).map_or_else(|_| SqlValue::Decimal(u.to_string()), SqlValue::Int)
        }
        Value::Float(f) => SqlValue::Float(widen_single(*f)),
        Value::Double(d) => SqlValue::Float(*d),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date =
                NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day));
            let time = NaiveTime::from_hms_micro_opt(
                u32::from(*hour),
                u32::from(*minute),
                u32::from(*second),
                *micros,
            );
            match (column.column_type(), date, time) {
                (ColumnType::MYSQL_TYPE_DATE, Some(d), _) => SqlValue::Date(d),
                (_, Some(d), Some(t)) => SqlValue::Timestamp(d.and_time(t)),
                // zero dates ('0000-00-00') have no calendar representation
                _ => SqlValue::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                )),
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            match NaiveTime::from_hms_micro_opt(
                u32::from(*hours),
                u32::from(*minutes),
                u32::from(*seconds),
                *micros,
            ) {
                Some(t) if !negative && *days == 0 => SqlValue::Time(t),
                _ => {
                    // TIME is an interval in MySQL and may exceed a day or be negative
                    let sign = if *negative { "-" } else { "" };
                    let total_hours = days * 24 + u32::from(*hours);
                    SqlValue::Text(format!(
                        "{sign}{total_hours}:{minutes:02}:{seconds:02}.{micros:06}"
                    ))
                }
            }
        }
        Value::Bytes(bytes) => decode_bytes(bytes, column),
    }
}

fn decode_bytes(bytes: &[u8], column: &Column) -> SqlValue {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return SqlValue::Bytes(bytes.to_vec());
    };

    let parsed = match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text.parse::<i64>().ok().map(SqlValue::Int).or_else(|| {
            text.parse::<u64>().ok().map(|u| SqlValue::Decimal(u.to_string()))
        }),
        ColumnType::MYSQL_TYPE_FLOAT => {
            text.parse::<f32>().ok().map(|f| SqlValue::Float(widen_single(f)))
        }
        ColumnType::MYSQL_TYPE_DOUBLE => text.parse::<f64>().ok().map(SqlValue::Float),
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
            Some(SqlValue::Decimal(text.to_string()))
        }
        ColumnType::MYSQL_TYPE_DATE => {
            NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(SqlValue::Date)
        }
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_TIMESTAMP => {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(SqlValue::Timestamp)
        }
        ColumnType::MYSQL_TYPE_TIME => {
            NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok().map(SqlValue::Time)
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(text).ok().map(SqlValue::Json),
        ColumnType::MYSQL_TYPE_BIT => Some(SqlValue::Bytes(bytes.to_vec())),
        _ if column.character_set() == BINARY_CHARSET => Some(SqlValue::Bytes(bytes.to_vec())),
        _ => None,
    };

    parsed.unwrap_or_else(|| SqlValue::Text(text.to_string()))
}

/// Classify a `mysql_async` error
fn driver_error(err: mysql_async::Error) -> DriverError {
    match &err {
        mysql_async::Error::Server(server) => {
            let message = format!("{} (error {})", server.message, server.code);
            match server.code {
                // max_statement_time exceeded / query interrupted
                3024 | 1317 | 1969 => {
                    DriverError::new(Fault::Cancelled, message).with_code(server.state.clone())
                }
                _ => DriverError::from_sqlstate(&server.state, message),
            }
        }
        mysql_async::Error::Io(_) => DriverError::io(err.to_string()),
        _ => DriverError::other(err.to_string()),
    }
}
