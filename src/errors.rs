//! The structured error taxonomy shared by the dispatcher, the template
//! registry, and the health client.
//!
//! `FlyError` is the internal result type handlers return; the dispatcher
//! boundary converts it to the wire-level [`crate::mcp::transport::RpcError`]
//! via [`FlyError::code`] / [`FlyError::data`].

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlyError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {message}")]
    InvalidRequest { message: String, data: Option<Value> },

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {message}")]
    InvalidParams { message: String, data: Option<Value> },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("canceled")]
    Canceled,

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("payload too large: {actual} bytes (limit {limit})")]
    TooLarge { actual: usize, limit: usize },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("template incompatible: {0}")]
    TemplateIncompatible(String),

    #[error("template corrupted: {0}")]
    TemplateCorrupted(String),

    #[error("offline and no cache available: {0}")]
    OfflineUnavailable(String),

    #[error("retryable network error: {0}")]
    NetworkRetryable(String),

    #[error("network error: {0}")]
    NetworkFatal(String),
}

/// JSON-RPC / MCP error codes, per the taxonomy in the spec.
pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL: i64 = -32603;
pub const CODE_CANCELED: i64 = -32800;
pub const CODE_TIMEOUT: i64 = -32801;
pub const CODE_TOO_LARGE: i64 = -32802;
pub const CODE_PERMISSION_DENIED: i64 = -32803;
pub const CODE_NOT_FOUND: i64 = -32804;

impl FlyError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params_with(message: impl Into<String>, data: Value) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: Some(data),
        }
    }

    /// An `invalid_request` failure with a structured `reason` tag, e.g. the
    /// admission-pool-saturated `{reason:"busy"}` case in the backpressure
    /// policy.
    pub fn invalid_request_with(message: impl Into<String>, data: Value) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            data: Some(data),
        }
    }

    /// The JSON-RPC error code this variant maps to on the wire.
    ///
    /// The four domain categories (`template_incompatible`,
    /// `template_corrupted`, `offline_unavailable`, `network_*`) are not
    /// standard JSON-RPC codes; they surface as `internal` on the wire with
    /// a `data.category` tag so clients that don't know about them still get
    /// a sane error, while ones that do can branch on `data.category`.
    pub fn code(&self) -> i64 {
        match self {
            FlyError::Parse(_) => CODE_PARSE_ERROR,
            FlyError::InvalidRequest { .. } => CODE_INVALID_REQUEST,
            FlyError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            FlyError::InvalidParams { .. } => CODE_INVALID_PARAMS,
            FlyError::Internal(_) => CODE_INTERNAL,
            FlyError::Canceled => CODE_CANCELED,
            FlyError::Timeout(_) => CODE_TIMEOUT,
            FlyError::TooLarge { .. } => CODE_TOO_LARGE,
            FlyError::PermissionDenied(_) => CODE_PERMISSION_DENIED,
            FlyError::NotFound(_) => CODE_NOT_FOUND,
            FlyError::TemplateIncompatible(_)
            | FlyError::TemplateCorrupted(_)
            | FlyError::OfflineUnavailable(_)
            | FlyError::NetworkRetryable(_)
            | FlyError::NetworkFatal(_) => CODE_INTERNAL,
        }
    }

    /// Structured `data` payload carried alongside the error message.
    pub fn data(&self) -> Option<Value> {
        match self {
            FlyError::InvalidParams { data, .. } => data.clone(),
            FlyError::InvalidRequest { data, .. } => data.clone(),
            FlyError::TooLarge { actual, limit } => {
                Some(serde_json::json!({ "actual": actual, "limit": limit }))
            }
            FlyError::TemplateIncompatible(_) => {
                Some(serde_json::json!({ "category": "template_incompatible" }))
            }
            FlyError::TemplateCorrupted(_) => {
                Some(serde_json::json!({ "category": "template_corrupted" }))
            }
            FlyError::OfflineUnavailable(_) => {
                Some(serde_json::json!({ "category": "offline_unavailable" }))
            }
            FlyError::NetworkRetryable(_) => {
                Some(serde_json::json!({ "category": "network_retryable" }))
            }
            FlyError::NetworkFatal(_) => Some(serde_json::json!({ "category": "network_fatal" })),
            _ => None,
        }
    }

    /// Exit code for tooling invoked outside the MCP loop (§7).
    pub fn exit_code(&self) -> i32 {
        match self {
            FlyError::InvalidParams { .. } | FlyError::InvalidRequest { .. } => 2,
            FlyError::Timeout(_) => 3,
            FlyError::Canceled => 4,
            _ => 1,
        }
    }
}
