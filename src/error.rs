use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Per-field validation messages, keyed by parameter name.
///
/// Collected by the query-kind validators and surfaced verbatim in the HTTP
/// error body so clients can see every failing field at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ValidationMessages(pub BTreeMap<String, Vec<String>>);

impl ValidationMessages {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge_nested(&mut self, prefix: &str, other: ValidationMessages) {
        for (field, messages) in other.0 {
            self.0
                .entry(format!("{prefix}.{field}"))
                .or_default()
                .extend(messages);
        }
    }
}

impl fmt::Display for ValidationMessages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", field, messages.join(", "))?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("unknown query kind '{0}'")]
    InvalidQueryKind(String),

    #[error("query parameters failed validation: {0}")]
    QueryParamsValidation(ValidationMessages),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("query kind '{0}' does not support aggregation")]
    AggregationNotSupported(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("result stream terminated: {0}")]
    StreamTerminated(String),

    #[error("warehouse error: {0}")]
    Warehouse(String),

    #[error("coordination store error: {0}")]
    Coordination(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl From<ValidationMessages> for FlowError {
    fn from(messages: ValidationMessages) -> Self {
        FlowError::QueryParamsValidation(messages)
    }
}

impl From<tokio_postgres::Error> for FlowError {
    fn from(err: tokio_postgres::Error) -> Self {
        FlowError::Warehouse(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for FlowError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        FlowError::Warehouse(err.to_string())
    }
}

impl From<redis::RedisError> for FlowError {
    fn from(err: redis::RedisError) -> Self {
        FlowError::Coordination(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FlowError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FlowError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}
