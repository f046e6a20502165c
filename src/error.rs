//! Error Handling Infrastructure
//!
//! This module defines the closed error taxonomy of the gateway.
//! Every failure that reaches a tool caller is one of these variants, and each variant
//! maps to a stable kind string for the JSON error envelope.
//!
//! # Error Kinds
//! - `InvalidArgument`: malformed tool arguments or unsafe identifiers (never reaches the backend)
//! - `UnsupportedType`: a value could not be coerced into a backend parameter
//! - `PoolExhausted` / `BackendUnreachable`: connection-layer failures
//! - `SyntaxError` / `ConstraintViolation`: the backend rejected the statement
//! - `Timeout`: a deadline was exceeded
//! - `TableNotFound`: schema lookup miss
//! - `ConnectionLost`: I/O failure while a statement was in flight
//! - `ExecutionFailed`: any other backend-reported failure
//! - `ConfigError`: configuration could not be loaded (outer shell only)

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Malformed or missing tool arguments, unknown tool, or unsafe identifiers
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A value could not be represented as a backend parameter
    #[error("Unsupported type for '{argument}': {detail}")]
    UnsupportedType { argument: String, detail: String },

    /// No pooled connection became free before the acquisition deadline
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// The backend could not be reached (connect or revalidation failed)
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The backend rejected the statement text or the objects it references
    #[error("Syntax error: {message}")]
    SyntaxError {
        message: String,
        code: Option<String>,
    },

    /// The backend rejected the statement on an integrity constraint
    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        message: String,
        code: Option<String>,
    },

    /// Execution or wait deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Schema lookup found no such table
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// The session failed mid-execution
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Any other backend-reported failure
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        message: String,
        code: Option<String>,
    },

    /// Configuration error (file not found, invalid JSON, missing settings)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl GatewayError {
    /// Stable kind string for the JSON error envelope
    ///
    /// Kinds are suitable for programmatic handling by agents.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::UnsupportedType { .. } => "UnsupportedType",
            Self::PoolExhausted(_) => "PoolExhausted",
            Self::BackendUnreachable(_) => "BackendUnreachable",
            Self::SyntaxError { .. } => "SyntaxError",
            Self::ConstraintViolation { .. } => "ConstraintViolation",
            Self::Timeout(_) => "Timeout",
            Self::TableNotFound(_) => "TableNotFound",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
            Self::ConfigError(_) => "ConfigError",
        }
    }

    /// Human-readable message (agent-appropriate, no credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Backend error code (SQLSTATE or vendor code) when the backend supplied one
    #[must_use]
    pub fn backend_code(&self) -> Option<&str> {
        match self {
            Self::SyntaxError { code, .. }
            | Self::ConstraintViolation { code, .. }
            | Self::ExecutionFailed { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether the failure was detected before any resource was acquired
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::UnsupportedType { .. })
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unsupported_type(argument: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnsupportedType {
            argument: argument.into(),
            detail: detail.into(),
        }
    }

    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted(message.into())
    }

    pub fn backend_unreachable(message: impl Into<String>) -> Self {
        Self::BackendUnreachable(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound(table.into())
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            code: None,
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
