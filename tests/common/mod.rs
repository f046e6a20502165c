//! Scripted in-memory backend for deterministic pool, executor, cache and dispatch tests
//!
//! Speaks the `SQLite` dialect. Metadata queries are answered from a table map; every other
//! statement takes the next scripted response, or a default echo (`SELECT`) / affected count.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlgate::backend::{
    Address, Backend, ConnectionDescriptor, Credentials, Dialect, DriverError, Encryption,
    Endpoint, Outcome,
};
use sqlgate::coerce::{Param, SqlValue};
use sqlgate::config::GatewayConfig;
use sqlgate::pool::PoolSettings;

#[derive(Debug, Default)]
struct Script {
    fail_connect: bool,
    fail_ping: bool,
    hang_ping: bool,
    hang_connect: bool,
    fail_next_metadata: usize,
    delay: Duration,
    metadata_delay: Duration,
    tables: BTreeMap<String, Vec<(String, String, bool)>>,
    responses: VecDeque<Result<Outcome, DriverError>>,
    executed: Vec<(String, Vec<Param>)>,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    pub connects: AtomicUsize,
    pub pings: AtomicUsize,
    pub closes: AtomicUsize,
    pub metadata_queries: AtomicUsize,
    pub leased_now: AtomicUsize,
    script: Mutex<Script>,
}

/// Session handed out by [`MockBackend`]; `serial` is the connect count when it was created
#[derive(Debug)]
pub struct MockSession {
    pub serial: usize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn add_table(&self, name: &str, columns: &[(&str, &str, bool)]) {
        self.script().tables.insert(
            name.to_string(),
            columns
                .iter()
                .map(|(n, t, null)| ((*n).to_string(), (*t).to_string(), *null))
                .collect(),
        );
    }

    pub fn drop_table(&self, name: &str) {
        self.script().tables.remove(name);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.script().fail_connect = fail;
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.script().fail_ping = fail;
    }

    /// Pings never answer, like a half-open TCP session
    pub fn set_hang_ping(&self, hang: bool) {
        self.script().hang_ping = hang;
    }

    pub fn set_hang_connect(&self, hang: bool) {
        self.script().hang_connect = hang;
    }

    pub fn fail_next_metadata(&self, count: usize) {
        self.script().fail_next_metadata = count;
    }

    /// Delay applied to every non-metadata statement
    pub fn set_delay(&self, delay: Duration) {
        self.script().delay = delay;
    }

    pub fn set_metadata_delay(&self, delay: Duration) {
        self.script().metadata_delay = delay;
    }

    pub fn push_response(&self, response: Result<Outcome, DriverError>) {
        self.script().responses.push_back(response);
    }

    /// Every statement executed so far, metadata queries included
    pub fn executed(&self) -> Vec<(String, Vec<Param>)> {
        self.script().executed.clone()
    }

    /// Statements other than metadata queries
    pub fn statements(&self) -> Vec<(String, Vec<Param>)> {
        self.executed().into_iter().filter(|(sql, _)| !is_metadata(sql)).collect()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn is_metadata(sql: &str) -> bool {
    sql == Dialect::SQLITE.list_tables_sql || sql == Dialect::SQLITE.describe_table_sql
}

impl Backend for MockBackend {
    type Session = MockSession;

    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
    ) -> Result<MockSession, DriverError> {
        let (fail, hang) = {
            let script = self.script();
            (script.fail_connect, script.hang_connect)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(DriverError::connect("connection refused"));
        }
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockSession { serial })
    }

    async fn execute(
        &self,
        _session: &mut MockSession,
        sql: &str,
        params: &[Param],
    ) -> Result<Outcome, DriverError> {
        let metadata = is_metadata(sql);
        let delay = {
            let mut script = self.script();
            script.executed.push((sql.to_string(), params.to_vec()));
            if metadata { script.metadata_delay } else { script.delay }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if metadata {
            self.metadata_queries.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script();
            if script.fail_next_metadata > 0 {
                script.fail_next_metadata -= 1;
                return Err(DriverError::io("connection reset during metadata query"));
            }
            if sql == Dialect::SQLITE.list_tables_sql {
                let rows = script.tables.keys().map(|t| vec![SqlValue::Text(t.clone())]).collect();
                return Ok(Outcome::Rows {
                    columns: vec!["name".into()],
                    rows,
                });
            }
            let table = match params.first().map(|p| &p.value) {
                Some(SqlValue::Text(t)) => t.clone(),
                _ => String::new(),
            };
            let rows = script
                .tables
                .get(&table)
                .map(|columns| {
                    columns
                        .iter()
                        .map(|(name, ty, nullable)| {
                            vec![
                                SqlValue::Text(name.clone()),
                                SqlValue::Text(ty.clone()),
                                SqlValue::Text(if *nullable { "YES" } else { "NO" }.into()),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            return Ok(Outcome::Rows {
                columns: vec!["name".into(), "type".into(), "nullable".into()],
                rows,
            });
        }

        if let Some(response) = self.script().responses.pop_front() {
            return response;
        }
        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            let columns = (1..=params.len()).map(|i| format!("p{i}")).collect();
            let row = params.iter().map(|p| p.value.clone()).collect();
            return Ok(Outcome::Rows {
                columns,
                rows: vec![row],
            });
        }
        Ok(Outcome::Affected(1))
    }

    async fn ping(&self, _session: &mut MockSession) -> Result<(), DriverError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let (fail, hang) = {
            let script = self.script();
            (script.fail_ping, script.hang_ping)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(DriverError::io("server has gone away"));
        }
        Ok(())
    }

    async fn close(&self, _session: MockSession) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn dialect(&self) -> &Dialect {
        &Dialect::SQLITE
    }
}

pub fn endpoint() -> Endpoint {
    Endpoint {
        address: Address::File(PathBuf::from("mock.db")),
        credentials: Arc::new(Credentials::default()),
        encryption: Encryption::Disabled,
    }
}

pub fn settings(size: usize) -> PoolSettings {
    PoolSettings {
        size,
        acquire_timeout: Duration::from_millis(100),
        validate_after: Duration::from_secs(60),
    }
}

/// Gateway config with short timeouts for tests
pub fn config(pool_size: usize) -> GatewayConfig {
    let mut config = GatewayConfig::sqlite("mock.db");
    config.pool_size = pool_size;
    config.acquire_timeout = Duration::from_millis(100);
    config.statement_timeout = Duration::from_millis(200);
    config
}

/// Let spawned close tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
