//! Error types for conflux-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for conflux-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in conflux-core and the engine built on it
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file could not be found
    #[error("configuration file not found: {path}")]
    ConfigNotFound {
        /// Path that was searched
        path: String,
    },

    /// Failed to parse a YAML document
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid configuration: missing property, malformed workflow graph, ...
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
    },

    /// No connector is registered for the requested kind/provider
    #[error("unsupported connector kind '{kind}'{}", .provider.as_ref().map(|p| format!(" with provider '{p}'")).unwrap_or_default())]
    Unsupported {
        /// Source or destination type
        kind: String,
        /// Provider, when one was given
        provider: Option<String>,
    },

    /// Transient failure reaching a source or destination
    #[error("connection to '{target}' failed: {message}")]
    Connection {
        /// Target identity
        target: String,
        /// Description of the failure
        message: String,
    },

    /// Remote endpoint answered with an error status
    #[error("'{target}' responded with status {status}: {message}")]
    Remote {
        /// Target identity
        target: String,
        /// HTTP-style status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Destination rejected a write
    #[error("write to '{target}' failed: {message}")]
    Write {
        /// Target identity
        target: String,
        /// Description of the failure
        message: String,
    },

    /// Record failed schema or rule validation
    #[error("record '{record_id}' failed validation: {message}")]
    Validation {
        /// Offending record
        record_id: String,
        /// Description of the failure
        message: String,
    },

    /// Transform execution error
    #[error("transform error in '{transform}': {message}")]
    TransformError {
        /// Name or type of the transform
        transform: String,
        /// Description of the error
        message: String,
    },

    /// Enricher execution error
    #[error("enrich error in '{enricher}': {message}")]
    EnrichError {
        /// Name of the enricher
        enricher: String,
        /// Description of the error
        message: String,
    },

    /// A workflow step's wrapped stage failed
    #[error("workflow step '{step_id}' failed: {message}")]
    WorkflowStepFailed {
        /// Step identifier
        step_id: String,
        /// Description of the failure
        message: String,
    },

    /// A single attempt exceeded its time budget
    #[error("call to '{target}' timed out after {after_ms}ms")]
    Timeout {
        /// Target identity
        target: String,
        /// Configured timeout
        after_ms: u64,
    },

    /// The breaker for the target is open
    #[error("circuit open for '{target}'")]
    CircuitOpen {
        /// Target identity
        target: String,
    },

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// Template rendering error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV reader/writer error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Database driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Serializable classification of an [`Error`], carried in run results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unresolvable connector, malformed graph, missing property
    Configuration,
    /// Transient I/O failure
    Connection,
    /// Record validation failure
    Validation,
    /// Transform failure
    Transform,
    /// Enrichment failure
    Enrich,
    /// Destination write failure
    Write,
    /// Non-retryable response from a remote endpoint
    Remote,
    /// Workflow step failure
    WorkflowStepFailed,
    /// Attempt timed out
    Timeout,
    /// Breaker rejected the call
    CircuitOpen,
    /// Run cancelled
    Cancelled,
    /// Malformed payload or document
    Serialization,
}

impl Error {
    /// Build a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Build a connection error against a target
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound { .. }
            | Self::ConfigParse(_)
            | Self::Configuration { .. }
            | Self::Unsupported { .. }
            | Self::Template(_) => ErrorKind::Configuration,
            Self::Connection { .. } | Self::Io(_) | Self::Database(_) | Self::Http(_) => {
                ErrorKind::Connection
            }
            Self::Remote { status, .. } if is_transient_status(*status) => ErrorKind::Connection,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Write { .. } => ErrorKind::Write,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::TransformError { .. } => ErrorKind::Transform,
            Self::EnrichError { .. } => ErrorKind::Enrich,
            Self::WorkflowStepFailed { .. } => ErrorKind::WorkflowStepFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Json(_) | Self::Csv(_) => ErrorKind::Serialization,
        }
    }

    /// Whether a retry may succeed where this attempt failed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. } => true,
            Self::Remote { status, .. } => is_transient_status(*status),
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::AlreadyExists
            ),
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::WorkerCrashed
            ),
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
            }
            _ => false,
        }
    }

    /// Whether this error counts against a target's consecutive-failure budget
    ///
    /// Breaker rejections never do, otherwise an open breaker would keep
    /// extending its own open window.
    pub fn counts_as_target_failure(&self) -> bool {
        !matches!(self, Self::CircuitOpen { .. }) && self.is_transient()
    }
}

/// 5xx, 408 and 429 are worth retrying; the rest of 4xx is not
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_and_timeout_are_transient() {
        assert!(Error::connection("db", "reset").is_transient());
        assert!(
            Error::Timeout {
                target: "db".to_string(),
                after_ms: 10
            }
            .is_transient()
        );
        assert!(
            Error::CircuitOpen {
                target: "db".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_circuit_open_does_not_count_against_target() {
        let err = Error::CircuitOpen {
            target: "db".to_string(),
        };
        assert!(!err.counts_as_target_failure());
        assert!(Error::connection("db", "reset").counts_as_target_failure());
    }

    #[test]
    fn test_remote_status_classification() {
        let server = Error::Remote {
            target: "api".to_string(),
            status: 503,
            message: "unavailable".to_string(),
        };
        let client = Error::Remote {
            target: "api".to_string(),
            status: 404,
            message: "missing".to_string(),
        };
        assert!(server.is_transient());
        assert_eq!(server.kind(), ErrorKind::Connection);
        assert!(!client.is_transient());
        assert_eq!(client.kind(), ErrorKind::Remote);
    }

    #[test]
    fn test_validation_and_config_are_not_transient() {
        let validation = Error::Validation {
            record_id: "r1".to_string(),
            message: "missing email".to_string(),
        };
        assert!(!validation.is_transient());
        assert!(!Error::config("bad").is_transient());
    }

    #[test]
    fn test_unsupported_is_a_configuration_error() {
        let err = Error::Unsupported {
            kind: "Database".to_string(),
            provider: Some("oracle".to_string()),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "unsupported connector kind 'Database' with provider 'oracle'"
        );
    }

    #[test]
    fn test_io_not_found_is_permanent() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_transient());
    }
}
