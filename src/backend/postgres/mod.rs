//! `PostgreSQL` Backend
//!
//! # Features
//! - Client-server connections via TCP, TLS through `rustls` with the platform's root store
//! - Parameters bound against the types `prepare` reports, so `'2024-05-01'` lands in a
//!   `DATE` parameter as a date and `"12.50"` in a `NUMERIC` parameter as an exact value
//! - Result columns decoded by column type (JSON/JSONB nested, BYTEA as bytes, NUMERIC exact)
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver); the connection future runs on its own task
//! - Liveness check is a `SELECT 1` simple query
//! - Connection errors are not logged to prevent credential leakage

mod numeric;

use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rustls::{ClientConfig, RootCertStore};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use uuid::Uuid;

use crate::backend::{
    Address, Backend, ConnectionDescriptor, Dialect, DriverError, Encryption, Fault, Outcome,
};
use crate::coerce::{widen_single, DeclaredType, Param, SqlValue};

pub use numeric::PgNumeric;

/// Login timeout for new sessions
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// `PostgreSQL` backend
pub struct PostgresBackend {
    connect_timeout: Duration,
    tls: Mutex<Option<MakeRustlsConnect>>,
}

impl PostgresBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    #[must_use]
    pub const fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            tls: Mutex::new(None),
        }
    }

    /// TLS connector, built on first use and shared by every session
    fn tls_connector(&self) -> Result<MakeRustlsConnect, DriverError> {
        let mut cached = self.tls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tls) = cached.as_ref() {
            return Ok(tls.clone());
        }
        let tls = build_tls_connector()?;
        *cached = Some(tls.clone());
        Ok(tls)
    }
}

impl Default for PostgresBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One `PostgreSQL` connection
pub struct PgSession {
    client: Client,
    connection: JoinHandle<()>,
}

impl Backend for PostgresBackend {
    type Session = PgSession;

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<PgSession, DriverError> {
        let pg_config = build_pg_config(descriptor, self.connect_timeout)?;

        let (client, connection) = if descriptor.encryption == Encryption::Disabled {
            let (client, connection) = pg_config
                .connect(NoTls)
                .await
                .map_err(|e| {
                    DriverError::connect(format!("Failed to connect to PostgreSQL: {e}"))
                })?;
            (
                client,
                tokio::spawn(async move {
                    let _ = connection.await;
                }),
            )
        } else {
            let tls = self.tls_connector()?;
            let (client, connection) = pg_config
                .connect(tls)
                .await
                .map_err(|e| {
                    DriverError::connect(format!("Failed to connect to PostgreSQL: {e}"))
                })?;
            (
                client,
                tokio::spawn(async move {
                    let _ = connection.await;
                }),
            )
        };

        Ok(PgSession { client, connection })
    }

    async fn execute(
        &self,
        session: &mut PgSession,
        sql: &str,
        params: &[Param],
    ) -> Result<Outcome, DriverError> {
        let stmt = session.client.prepare(sql).await.map_err(driver_error)?;

        let mut bound = Vec::with_capacity(params.len());
        for (idx, param) in params.iter().enumerate() {
            let declared = stmt
                .params()
                .get(idx)
                .map_or(DeclaredType::Unknown, |ty| DeclaredType::classify(ty.name()));
            let value = param.value.refine(&param.name, declared).map_err(|e| {
                DriverError::unsupported_parameter(param.name.clone(), e.to_string())
            })?;
            bound.push(PgParam(value));
        }
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        if stmt.columns().is_empty() {
            let affected = session.client.execute(&stmt, &refs).await.map_err(driver_error)?;
            return Ok(Outcome::Affected(affected));
        }

        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = session.client.query(&stmt, &refs).await.map_err(driver_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(decode_value(row, idx)?);
            }
            out.push(values);
        }

        Ok(Outcome::Rows { columns, rows: out })
    }

    async fn ping(&self, session: &mut PgSession) -> Result<(), DriverError> {
        session.client.simple_query("SELECT 1").await.map(|_| ()).map_err(driver_error)
    }

    async fn close(&self, session: PgSession) {
        drop(session.client);
        session.connection.abort();
    }

    fn dialect(&self) -> &Dialect {
        &Dialect::POSTGRES
    }
}

/// Build `PostgreSQL` connection config from a descriptor
fn build_pg_config(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Config, DriverError> {
    let Address::Network { host, port, database } = &descriptor.address else {
        return Err(DriverError::connect("PostgreSQL requires a network address"));
    };

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(*port)
        .dbname(database)
        .connect_timeout(connect_timeout)
        .application_name("sqlgate");

    if let Some(user) = descriptor.credentials.user() {
        pg_config.user(user);
    }
    if let Some(password) = descriptor.credentials.password() {
        pg_config.password(password);
    }

    pg_config.ssl_mode(match descriptor.encryption {
        Encryption::Disabled => SslMode::Disable,
        Encryption::Preferred => SslMode::Prefer,
        Encryption::Required => SslMode::Require,
    });

    Ok(pg_config)
}

fn build_tls_connector() -> Result<MakeRustlsConnect, DriverError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!(error = %err, "skipping unreadable native certificate source");
    }
    for cert in native.certs {
        roots
            .add(cert)
            .map_err(|e| DriverError::connect(format!("invalid root certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(DriverError::connect("no root certificates available for TLS"));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| DriverError::connect(format!("TLS configuration failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

/// Parameter bound from a refined neutral value
#[derive(Debug)]
struct PgParam(SqlValue);

impl ToSql for PgParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match &self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::OID => u32::try_from(*i)?.to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            #[allow(clippy::cast_possible_truncation)]
            SqlValue::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            SqlValue::Decimal(d) if *ty == Type::NUMERIC => {
                numeric::encode(d, out)?;
                Ok(IsNull::No)
            }
            SqlValue::Decimal(s) | SqlValue::Text(s) => s.as_str().to_sql(ty, out),
            SqlValue::Bytes(b) => b.as_slice().to_sql(ty, out),
            SqlValue::Date(d) => d.to_sql(ty, out),
            SqlValue::Time(t) => t.to_sql(ty, out),
            SqlValue::Timestamp(ts) => ts.to_sql(ty, out),
            SqlValue::TimestampTz(ts) => ts.to_sql(ty, out),
            SqlValue::Uuid(u) => u.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Decode a `PostgreSQL` column value by its type
fn decode_value(row: &Row, idx: usize) -> Result<SqlValue, DriverError> {
    let col_type = row.columns()[idx].type_().clone();

    let value = match col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(SqlValue::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|v| SqlValue::Int(i64::from(v))),
        Type::INT4 => get::<i32>(row, idx)?.map(|v| SqlValue::Int(i64::from(v))),
        Type::INT8 => get::<i64>(row, idx)?.map(SqlValue::Int),
        Type::OID => get::<u32>(row, idx)?.map(|v| SqlValue::Int(i64::from(v))),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| SqlValue::Float(widen_single(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(SqlValue::Float),
        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map(|n| SqlValue::Decimal(n.0)),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.map(SqlValue::Json),
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(SqlValue::Bytes),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?.map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => get::<DateTime<FixedOffset>>(row, idx)?.map(SqlValue::TimestampTz),
        Type::DATE => get::<NaiveDate>(row, idx)?.map(SqlValue::Date),
        Type::TIME => get::<NaiveTime>(row, idx)?.map(SqlValue::Time),
        Type::UUID => get::<Uuid>(row, idx)?.map(SqlValue::Uuid),

        // Text types and anything else representable as text (enums, citext)
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map_err(|e| {
                DriverError::other(format!(
                    "Cannot convert PostgreSQL type '{}' to JSON: {e}",
                    col_type.name()
                ))
            })?
            .map(SqlValue::Text),
    };

    Ok(value.unwrap_or(SqlValue::Null))
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>, DriverError> {
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| DriverError::other(format!("Failed to decode column {idx}: {e}")))
}

/// Classify a `tokio-postgres` error
fn driver_error(err: tokio_postgres::Error) -> DriverError {
    if let Some(db) = err.as_db_error() {
        return DriverError::from_sqlstate(db.code().code(), db.message());
    }
    if err.is_closed() {
        return DriverError::io("connection closed");
    }
    let io_failure = err
        .source()
        .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if io_failure {
        DriverError::io(err.to_string())
    } else {
        DriverError::new(Fault::Other, err.to_string())
    }
}
