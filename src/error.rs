//! Error types for the gateway.
//!
//! Each layer gets its own error enum: configuration failures are fatal at
//! load time, protocol-client failures affect a single connection or call,
//! and governance failures (permission, budget, approval) are terminal and
//! never retried. Only transient execution failures enter the retry loop.

use std::time::Duration;

use thiserror::Error;

use crate::approvals::ApprovalStatus;

/// Errors raised while loading or validating provider configuration.
///
/// These are fatal at load time: a provider with invalid configuration is
/// never registered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid provider config '{id}': {reason}")]
    Invalid { id: String, reason: String },

    #[error("Duplicate provider id: {0}")]
    DuplicateId(String),
}

/// Errors from a single provider connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to spawn provider '{id}': {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider '{0}' is not connected")]
    NotConnected(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Provider error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Failed to write to provider stdin: {0}")]
    Write(#[from] std::io::Error),
}

/// Errors from the server manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider '{0}' is not running")]
    NotRunning(String),

    #[error("Transport '{transport}' is not supported for provider '{id}'")]
    UnsupportedTransport { id: String, transport: String },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Errors from the budget ledger collaborator.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger request failed: {0}")]
    Request(String),

    #[error("Unknown run: {0}")]
    UnknownRun(String),
}

/// Errors from the approval service collaborator.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval request failed: {0}")]
    Request(String),

    #[error("Unknown approval action: {0}")]
    UnknownAction(String),
}

/// Errors from evaluating a custom policy rule.
///
/// Any rule evaluation error is treated as a denial by the permission
/// engine, never as a crash.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid rule pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to inspect arguments: {0}")]
    Inspect(String),
}

/// Terminal governance failures. These short-circuit before execution and
/// are never retried.
#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("Permission denied: {0}")]
    Denied(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Approval {status}: {reason}")]
    Approval {
        status: ApprovalStatus,
        reason: String,
    },

    #[error("Approval timed out after {0:?}")]
    ApprovalTimeout(Duration),

    #[error(transparent)]
    ApprovalService(#[from] ApprovalError),
}

/// Errors surfaced from `InvocationGateway::invoke`.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Client(#[from] ClientError),
}
