//! JSON Result Envelope Types
//!
//! Every tool invocation produces exactly one `ResultEnvelope`.
//!
//! # Output Contract
//! - Success: `{"ok": true, "result": {...}}`
//! - Error: `{"ok": false, "error": {"kind": "...", "message": "...", "code": "..."}}`
//!
//! `code` carries the backend's SQLSTATE or vendor code and is omitted when absent.
//! Output is stable and suitable for programmatic parsing by agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Result envelope returned to the tool caller
///
/// Exactly one of `result` / `error` is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResultEnvelope {
    /// Create a success envelope
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error envelope from a gateway error
    pub fn failure(err: &GatewayError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorInfo::from(err)),
        }
    }

    /// Shape a handler outcome into an envelope
    pub fn from_result(outcome: crate::error::Result<Value>) -> Self {
        match outcome {
            Ok(value) => Self::success(value),
            Err(err) => Self::failure(&err),
        }
    }

    /// Error kind, if this is an error envelope
    pub fn kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    /// Serialize to a JSON string
    ///
    /// Serializing a `Value`-backed envelope cannot fail, so the fallback is never hit in practice.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"kind":"ExecutionFailed","message":"failed to serialize result"}}"#
                .to_string()
        })
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error kind (e.g., "InvalidArgument", "PoolExhausted")
    pub kind: String,

    /// Human-readable error message (agent-appropriate, no credentials)
    pub message: String,

    /// Backend error code, when one was reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&GatewayError> for ErrorInfo {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.message(),
            code: err.backend_code().map(str::to_string),
        }
    }
}
