use std::fmt;
use thiserror::Error;

use crate::domain::{ObjectKey, ResourceKind};

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum OperatorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Route validation errors (terminal for the reconcile)
    #[error("Validation failed for route {key}: {reason}")]
    Validation { key: ObjectKey, reason: String },

    // Declarative store errors
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    #[error("Version conflict on {operation} of {kind} {key}")]
    Conflict {
        kind: ResourceKind,
        key: ObjectKey,
        operation: StoreOperation,
    },

    #[error("Store {operation} of {kind} {key} failed: {message}")]
    Store {
        kind: ResourceKind,
        key: ObjectKey,
        operation: StoreOperation,
        message: String,
    },

    // Monitoring service errors
    #[error("Monitoring service {operation} failed for {subject}: {message}")]
    External {
        operation: ExternalOperation,
        subject: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Monitoring service has no record {id} ({operation})")]
    ExternalNotFound {
        operation: ExternalOperation,
        id: String,
    },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for OperatorError
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Store operation named in error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    List,
    Watch,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Get => "get",
            StoreOperation::List => "list",
            StoreOperation::Watch => "watch",
            StoreOperation::Create => "create",
            StoreOperation::Update => "update",
            StoreOperation::UpdateStatus => "update-status",
            StoreOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Monitoring service operation named in error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOperation {
    Create,
    Update,
    Delete,
}

impl ExternalOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalOperation::Create => "create",
            ExternalOperation::Update => "update",
            ExternalOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for ExternalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OperatorError {
    /// Store or monitoring-service not-found
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OperatorError::NotFound { .. } | OperatorError::ExternalNotFound { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict { .. })
    }

    /// Whether the controller runtime should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OperatorError::Validation { .. }
                | OperatorError::InvalidConfig(_)
                | OperatorError::Cancelled
        )
    }

    pub fn validation(key: &ObjectKey, reason: impl Into<String>) -> Self {
        OperatorError::Validation {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    pub fn store(
        kind: ResourceKind,
        key: &ObjectKey,
        operation: StoreOperation,
        message: impl Into<String>,
    ) -> Self {
        OperatorError::Store {
            kind,
            key: key.clone(),
            operation,
            message: message.into(),
        }
    }

    /// Monitoring service failure without an HTTP status (transport, decode)
    pub fn external(
        operation: ExternalOperation,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        OperatorError::External {
            operation,
            subject: subject.into(),
            status: None,
            message: message.into(),
        }
    }
}
