//! Configuration Management
//!
//! This module loads the gateway configuration: which backend to talk to, and the
//! pool, timeout and cache settings the core runs with.
//!
//! # Configuration Locations
//! - Explicit: `--config <file>` (used alone when given)
//! - Local: `.sqlgate/config.json` (per-project)
//! - Global: `<config dir>/sqlgate/config.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Environment variables (`SQLGATE_ENGINE`, `SQLGATE_HOST`, ...)
//! 2. Explicit config file, or local config layered over global config
//! 3. Built-in defaults
//!
//! # Credentials
//! Passwords can be kept out of config files with `password_env`, the name of an
//! environment variable resolved at load time.
//!
//! ```json
//! {
//!   "engine": "postgres",
//!   "host": "db.internal",
//!   "database": "app",
//!   "user": "agent",
//!   "password_env": "APP_DB_PASSWORD",
//!   "pool_size": 8
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{Address, Credentials, DatabaseType, Encryption, Endpoint};
use crate::error::{GatewayError, Result};
use crate::pool::PoolSettings;

const DEFAULT_POOL_SIZE: usize = 5;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SCHEMA_TTL_MS: u64 = 30_000;
const DEFAULT_VALIDATE_AFTER_MS: u64 = 60_000;

/// Configuration as written in a file
///
/// Every field is optional so files and environment variables can be layered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<DatabaseType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable holding the password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Database file (sqlite)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Encryption>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_ttl_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_after_ms: Option<u64>,
    /// Default row cap for `execute_query`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

/// Resolved configuration the gateway runs with
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub engine: DatabaseType,
    pub endpoint: Endpoint,
    pub pool_size: usize,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
    pub schema_ttl: Duration,
    pub validate_after: Duration,
    pub max_rows: Option<usize>,
}

impl GatewayConfig {
    /// Configuration with default settings for the given target
    pub fn new(engine: DatabaseType, endpoint: Endpoint) -> Self {
        Self {
            engine,
            endpoint,
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            statement_timeout: Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS),
            schema_ttl: Duration::from_millis(DEFAULT_SCHEMA_TTL_MS),
            validate_after: Duration::from_millis(DEFAULT_VALIDATE_AFTER_MS),
            max_rows: None,
        }
    }

    /// Defaults for a SQLite database file
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::new(
            DatabaseType::SQLite,
            Endpoint {
                address: Address::File(path.into()),
                credentials: Arc::new(Credentials::default()),
                encryption: Encryption::Disabled,
            },
        )
    }

    pub const fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            size: self.pool_size,
            acquire_timeout: self.acquire_timeout,
            validate_after: self.validate_after,
        }
    }

    /// Load with full precedence: files, then environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut file = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(GatewayError::config_error(format!(
                        "Config file {} does not exist",
                        path.display()
                    )));
                }
                ConfigFile::read(path)?
            }
            None => {
                let global = global_config_path().map(|p| ConfigFile::read(&p)).transpose()?;
                let local = ConfigFile::read(&local_config_path()?)?;
                global.unwrap_or_default().overlay(local)
            }
        };
        file.apply_env(|key| std::env::var(key).ok())?;
        file.resolve(|key| std::env::var(key).ok())
    }
}

impl ConfigFile {
    /// Read a config file; a missing file reads as empty
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|e| {
            GatewayError::config_error(format!(
                "Could not read config file {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            GatewayError::config_error(format!("Invalid config file {}: {e}", path.display()))
        })
    }

    /// Fields set in `other` win
    #[must_use]
    pub fn overlay(self, other: Self) -> Self {
        Self {
            engine: other.engine.or(self.engine),
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            database: other.database.or(self.database),
            user: other.user.or(self.user),
            password: other.password.or(self.password),
            password_env: other.password_env.or(self.password_env),
            file: other.file.or(self.file),
            encryption: other.encryption.or(self.encryption),
            pool_size: other.pool_size.or(self.pool_size),
            acquire_timeout_ms: other.acquire_timeout_ms.or(self.acquire_timeout_ms),
            statement_timeout_ms: other.statement_timeout_ms.or(self.statement_timeout_ms),
            schema_ttl_ms: other.schema_ttl_ms.or(self.schema_ttl_ms),
            validate_after_ms: other.validate_after_ms.or(self.validate_after_ms),
            max_rows: other.max_rows.or(self.max_rows),
        }
    }

    /// Apply `SQLGATE_*` overrides
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(engine) = lookup("SQLGATE_ENGINE") {
            self.engine = Some(parse_engine(&engine)?);
        }
        if let Some(host) = lookup("SQLGATE_HOST") {
            self.host = Some(host);
        }
        if let Some(port) = lookup("SQLGATE_PORT") {
            self.port = Some(port.parse().map_err(|_| {
                GatewayError::config_error(format!("SQLGATE_PORT: '{port}' is not a port number"))
            })?);
        }
        if let Some(database) = lookup("SQLGATE_DATABASE") {
            self.database = Some(database);
        }
        if let Some(user) = lookup("SQLGATE_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("SQLGATE_PASSWORD") {
            self.password = Some(password);
            self.password_env = None;
        }
        if let Some(file) = lookup("SQLGATE_FILE") {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(encrypt) = lookup("SQLGATE_ENCRYPT") {
            self.encryption = Some(parse_encryption(&encrypt)?);
        }
        if let Some(size) = lookup("SQLGATE_POOL_SIZE") {
            self.pool_size = Some(size.parse().map_err(|_| {
                GatewayError::config_error(format!("SQLGATE_POOL_SIZE: '{size}' is not a number"))
            })?);
        }
        Ok(())
    }

    /// Validate and resolve into a [`GatewayConfig`]
    ///
    /// `password_env` is looked up through `lookup`.
    pub fn resolve(self, lookup: impl Fn(&str) -> Option<String>) -> Result<GatewayConfig> {
        let engine = self.engine.ok_or_else(|| {
            GatewayError::config_error(
                "No engine configured: set 'engine' in a config file or SQLGATE_ENGINE",
            )
        })?;

        let password = match (&self.password, &self.password_env) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(var)) => Some(lookup(var).ok_or_else(|| {
                GatewayError::config_error(format!(
                    "Environment variable {var} not found for password"
                ))
            })?),
            (None, None) => None,
        };

        let (address, encryption) = match engine {
            DatabaseType::SQLite => {
                let file = self.file.ok_or_else(|| {
                    GatewayError::config_error("sqlite requires 'file' (or SQLGATE_FILE)")
                })?;
                (Address::File(file), Encryption::Disabled)
            }
            DatabaseType::Postgres | DatabaseType::MySQL | DatabaseType::MsSql => {
                let host = self.host.ok_or_else(|| {
                    GatewayError::config_error(format!(
                        "{engine} requires 'host' (or SQLGATE_HOST)"
                    ))
                })?;
                let database = self.database.ok_or_else(|| {
                    GatewayError::config_error(format!(
                        "{engine} requires 'database' (or SQLGATE_DATABASE)"
                    ))
                })?;
                let port = self.port.or(engine.default_port()).unwrap_or_default();
                (Address::Network { host, port, database }, self.encryption.unwrap_or_default())
            }
        };

        let pool_size = self.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 {
            return Err(GatewayError::config_error("pool_size must be at least 1"));
        }
        let millis =
            |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));
        let statement_timeout = millis(self.statement_timeout_ms, DEFAULT_STATEMENT_TIMEOUT_MS);
        if statement_timeout.is_zero() {
            return Err(GatewayError::config_error("statement_timeout_ms must be positive"));
        }

        Ok(GatewayConfig {
            engine,
            endpoint: Endpoint {
                address,
                credentials: Arc::new(Credentials::new(self.user, password)),
                encryption,
            },
            pool_size,
            acquire_timeout: millis(self.acquire_timeout_ms, DEFAULT_ACQUIRE_TIMEOUT_MS),
            statement_timeout,
            schema_ttl: millis(self.schema_ttl_ms, DEFAULT_SCHEMA_TTL_MS),
            validate_after: millis(self.validate_after_ms, DEFAULT_VALIDATE_AFTER_MS),
            max_rows: self.max_rows,
        })
    }
}

fn parse_engine(value: &str) -> Result<DatabaseType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
        "mysql" | "mariadb" => Ok(DatabaseType::MySQL),
        "mssql" | "sqlserver" | "azuresql" => Ok(DatabaseType::MsSql),
        "sqlite" => Ok(DatabaseType::SQLite),
        other => Err(GatewayError::config_error(format!(
            "Unknown engine '{other}' (expected postgres, mysql, mssql or sqlite)"
        ))),
    }
}

fn parse_encryption(value: &str) -> Result<Encryption> {
    match value.trim().to_ascii_lowercase().as_str() {
        "required" | "yes" | "true" | "mandatory" => Ok(Encryption::Required),
        "preferred" | "optional" => Ok(Encryption::Preferred),
        "disabled" | "no" | "false" => Ok(Encryption::Disabled),
        other => Err(GatewayError::config_error(format!(
            "SQLGATE_ENCRYPT: unknown value '{other}'"
        ))),
    }
}

/// Get path to local config file (`.sqlgate/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        GatewayError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".sqlgate").join("config.json"))
}

/// Get path to global config file (`<config dir>/sqlgate/config.json`)
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sqlgate").join("config.json"))
}
