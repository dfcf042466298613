//! Error types for flowrun

use thiserror::Error;

/// Main error type for flowrun operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed input rejected before any work started
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration for node '{node_id}': {reason}")]
    InvalidNodeConfig { node_id: String, reason: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow run not found: {0}")]
    RunNotFound(String),

    /// A collaborator (state store, notifier, HTTP endpoint) failed
    #[error("{service} error: {message}")]
    ExternalService { service: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node '{node_id}' of flow '{flow_id}' failed: {message}")]
    FlowExecution {
        flow_id: String,
        node_id: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an invalid node configuration error
    pub fn invalid_node(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidNodeConfig {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an external service error
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a flow execution error
    pub fn execution(
        flow_id: impl Into<String>,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::FlowExecution {
            flow_id: flow_id.into(),
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error came from a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
