//! JSON Output Envelope Types
//!
//! Tool and resource results are wrapped in one of two envelopes before they
//! are handed to the protocol layer.
//!
//! # Output Contract
//! - Success: `{"ok": true, "source": "...", "operation": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "source": "...", "operation": "...", "error": {"code": "...", "message": "..."}}`
//!
//! `error.code` is one of the stable codes from [`SqlGateError::error_code`],
//! so a policy rejection (`VALIDATION_REJECTED`) is distinguishable from a
//! backend failure (`QUERY_FAILED`).

use serde::{Deserialize, Serialize};

use crate::error::SqlGateError;

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Source the operation ran against (empty when not source-specific)
    pub source: String,

    /// Tool name or resource URI
    pub operation: String,

    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(source: impl Into<String>, operation: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, source: source.into(), operation: operation.into(), data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Source the operation targeted (empty when unknown)
    pub source: String,

    pub operation: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(source: impl Into<String>, operation: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, source: source.into(), operation: operation.into(), error }
    }

    pub fn from_error(
        source: impl Into<String>,
        operation: impl Into<String>,
        err: &SqlGateError,
    ) -> Self {
        Self::new(source, operation, ErrorInfo::from(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "VALIDATION_REJECTED", "QUERY_FAILED")
    pub code: String,

    /// Human-readable error message (no credentials)
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

impl From<&SqlGateError> for ErrorInfo {
    fn from(err: &SqlGateError) -> Self {
        Self::new(err.error_code(), err.message())
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub execution_ms: u64,

    /// Rows returned (query results only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    pub fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    pub fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}
