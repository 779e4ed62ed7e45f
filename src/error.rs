//! Error types for the NodeAllocationState controller

use std::fmt;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling claims or publishing node status
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error that fits no more specific category
    KubeApi(String),
    /// The object does not exist
    NotFound(String),
    /// A create raced with another creator of the same name
    AlreadyExists(String),
    /// A conditional write was rejected because the resourceVersion moved
    Conflict(String),
    /// Network failure, throttling or a 5xx answer from the API server
    TransientApi(String),
    /// Cluster credentials could not be resolved
    ClientConfig(String),
    /// Invalid user input, rejected before any network call
    Validation(String),
    /// Invalid flag combination or runtime configuration
    Configuration(String),
    /// Malformed claim or record that no retry can fix
    InvalidState(String),
    /// The node's allocation state is not marked Ready yet
    NotReady(String),
    /// No free device is left for a claim
    ResourceExhausted(String),
    /// Serialization error
    Serialization(String),
    /// HTTP diagnostics server error
    Http(String),
    /// A retry budget ran out; carries the last error seen
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<OperatorError>,
    },
    /// The root context was cancelled while work was pending
    Cancelled(String),
}

impl OperatorError {
    /// True for a rejected optimistic-concurrency write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound(_))
    }

    /// Errors that redelivery cannot fix. The engine parks these until the
    /// object changes instead of requeueing them.
    pub fn is_terminal(&self) -> bool {
        match self {
            OperatorError::Validation(_)
            | OperatorError::InvalidState(_)
            | OperatorError::ClientConfig(_)
            | OperatorError::Configuration(_)
            | OperatorError::Cancelled(_) => true,
            OperatorError::RetriesExhausted { last, .. } => last.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::AlreadyExists(msg) => write!(f, "Resource already exists: {}", msg),
            OperatorError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            OperatorError::TransientApi(msg) => write!(f, "Transient API error: {}", msg),
            OperatorError::ClientConfig(msg) => write!(f, "Client configuration error: {}", msg),
            OperatorError::Validation(msg) => write!(f, "Validation error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            OperatorError::NotReady(msg) => write!(f, "Not ready: {}", msg),
            OperatorError::ResourceExhausted(msg) => write!(f, "Resources exhausted: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::Http(msg) => write!(f, "HTTP error: {}", msg),
            OperatorError::RetriesExhausted {
                operation,
                attempts,
                last,
            } => write!(
                f,
                "{} failed after {} attempts: {}",
                operation, attempts, last
            ),
            OperatorError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => OperatorError::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => OperatorError::AlreadyExists(ae.message),
                409 => OperatorError::Conflict(ae.message),
                429 | 500..=599 => OperatorError::TransientApi(ae.message),
                _ => OperatorError::KubeApi(format!("{} ({})", ae.message, ae.code)),
            },
            kube::Error::SerdeError(e) => OperatorError::Serialization(e.to_string()),
            kube::Error::InferConfig(e) => OperatorError::ClientConfig(e.to_string()),
            // Everything else is transport level: connection resets, TLS hiccups, timeouts.
            other => OperatorError::TransientApi(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OperatorError {
    fn from(err: std::io::Error) -> Self {
        OperatorError::Http(err.to_string())
    }
}
