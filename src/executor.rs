//! Statement Executor
//!
//! Runs one statement on a leased connection and materializes the outcome.
//!
//! Each statement runs on a spawned task that owns the session while it executes. The caller
//! waits for the result under the statement timeout:
//! - on completion the session goes back into the lease
//! - on timeout the lease is marked unhealthy and the session is closed by the task
//!   once the statement finishes
//! - if the caller goes away, the task finishes the statement, discards the result and
//!   closes the session
//!
//! This is the only place where [`DriverError`]s become [`GatewayError`]s.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backend::{Backend, DriverError, Fault, Outcome};
use crate::coerce::Param;
use crate::error::{GatewayError, Result};
use crate::pool::LeasedConnection;

/// SQL text plus ordered parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
    /// Cap on materialized rows; extra rows are dropped and reported as truncated
    pub max_rows: Option<usize>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            sql: sql.into(),
            params,
            max_rows: None,
        }
    }

    #[must_use]
    pub const fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }
}

/// Materialized result set
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    /// Column name → wire value, in column order
    pub rows: Vec<Map<String, Value>>,
    pub truncated: bool,
}

/// Statement result
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Rows(RowSet),
    Affected(u64),
}

/// Executes statements under a deadline
pub struct Executor<B: Backend> {
    backend: Arc<B>,
    statement_timeout: Duration,
}

impl<B: Backend> Clone for Executor<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            statement_timeout: self.statement_timeout,
        }
    }
}

impl<B: Backend> Executor<B> {
    pub const fn new(backend: Arc<B>, statement_timeout: Duration) -> Self {
        Self {
            backend,
            statement_timeout,
        }
    }

    pub const fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// Execute one statement on the lease's session
    ///
    /// Parameters are passed to the backend exactly as given; SQL is never inspected.
    pub async fn execute(
        &self,
        lease: &mut LeasedConnection<B>,
        statement: Statement,
    ) -> Result<Execution> {
        let session = lease.take_session().ok_or_else(|| {
            lease.mark_unhealthy();
            GatewayError::connection_lost("lease holds no live session")
        })?;

        let Statement { sql, params, max_rows } = statement;
        debug!(slot = lease.descriptor().id, params = params.len(), "executing statement");

        let (tx, rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let mut session = session;
            let outcome = backend.execute(&mut session, &sql, &params).await;
            if let Err((session, _)) = tx.send((session, outcome)) {
                debug!("statement finished after its caller gave up, closing session");
                backend.close(session).await;
            }
        });

        match tokio::time::timeout(self.statement_timeout, rx).await {
            Ok(Ok((session, outcome))) => {
                lease.restore_session(session);
                match outcome {
                    Ok(outcome) => Ok(materialize(outcome, max_rows)),
                    Err(err) => {
                        if err.fault == Fault::Io {
                            lease.mark_unhealthy();
                        }
                        Err(map_driver_error(err))
                    }
                }
            }
            Ok(Err(_)) => {
                lease.mark_unhealthy();
                Err(GatewayError::execution_failed("statement task ended without a result"))
            }
            Err(_) => {
                warn!(
                    slot = lease.descriptor().id,
                    timeout_ms = self.statement_timeout.as_millis() as u64,
                    "statement timed out, session will be replaced"
                );
                lease.mark_unhealthy();
                Err(GatewayError::timeout(format!(
                    "statement exceeded {}ms",
                    self.statement_timeout.as_millis()
                )))
            }
        }
    }
}

/// Translate a driver fault into the gateway taxonomy
pub fn map_driver_error(err: DriverError) -> GatewayError {
    let DriverError { fault, message, code } = err;
    match fault {
        Fault::Connect => GatewayError::BackendUnreachable(message),
        Fault::Syntax => GatewayError::SyntaxError { message, code },
        Fault::Constraint => GatewayError::ConstraintViolation { message, code },
        Fault::Cancelled => GatewayError::Timeout(message),
        Fault::Io => GatewayError::ConnectionLost(message),
        Fault::UnsupportedParameter { argument } => {
            GatewayError::UnsupportedType {
                argument,
                detail: message,
            }
        }
        Fault::Other => GatewayError::ExecutionFailed { message, code },
    }
}

fn materialize(outcome: Outcome, max_rows: Option<usize>) -> Execution {
    match outcome {
        Outcome::Affected(n) => Execution::Affected(n),
        Outcome::Rows { columns, mut rows } => {
            let truncated = max_rows.is_some_and(|max| rows.len() > max);
            if let Some(max) = max_rows {
                rows.truncate(max);
            }
            let rows = rows
                .into_iter()
                .map(|values| {
                    columns
                        .iter()
                        .cloned()
                        .zip(values.iter().map(|v| v.to_wire()))
                        .collect::<Map<String, Value>>()
                })
                .collect();
            Execution::Rows(RowSet {
                columns,
                rows,
                truncated,
            })
        }
    }
}
