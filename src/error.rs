use crate::types::{BackendKind, Operation};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for objstore-bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for objstore-bridge
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed configuration (credential bundle shape, endpoints, files)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Credentials could not be resolved, or were rejected by the backend
    #[error("Authentication failed for {backend}: {message}")]
    Authentication {
        backend: BackendKind,
        message: String,
    },

    /// Container creation against a name that already exists
    #[error("Container already exists: {0}")]
    ContainerConflict(String),

    /// Listing or reading from a container that does not exist
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Object not found
    #[error("Object not found: {container}/{key}")]
    ObjectNotFound { container: String, key: String },

    /// Local filesystem failure
    #[error("Local I/O error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Transport failure while reading from the backend
    #[error("Remote read failed during {operation} of {target}: {source}")]
    RemoteRead {
        operation: Operation,
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// Transport failure while writing to the backend
    #[error("Remote write failed during {operation} of {target}: {source}")]
    RemoteWrite {
        operation: Operation,
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// A download failed after bytes already landed in the destination file
    #[error(
        "Partial download to {}: {objects_written} object(s) and {bytes_written} byte(s) written before failure: {source}",
        path.display()
    )]
    PartialDownload {
        path: PathBuf,
        objects_written: usize,
        bytes_written: u64,
        #[source]
        source: Box<Error>,
    },

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failure reported by the `object_store` client (Azure Blob and GCS
    /// object operations). Its own retry settings have already been applied.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Connection failure or timeout reported by an SDK client
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unexpected HTTP status from the backend
    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// Invalid response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// An identity provider could not produce an access token
    #[error("Token error: {0}")]
    Token(String),
}

impl Error {
    /// Build a `LocalIo` error for `path`.
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, connection failures, and HTTP 408/429/5xx are transient.
    /// Wrapped errors are classified by their cause. `ObjectStore` errors are
    /// not: that client retries internally per `HttpOptions::max_retries`.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Transport(_) => true,
            Error::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..=599).contains(status)
            }
            Error::RemoteRead { source, .. } | Error::RemoteWrite { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Whether the error means the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound { .. } | Error::ContainerNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = Error::ObjectNotFound {
            container: "reports".to_string(),
            key: "q1.csv".to_string(),
        };
        assert_eq!(err.to_string(), "Object not found: reports/q1.csv");
    }

    #[test]
    fn test_configuration_error() {
        let err = Error::Configuration("invalid config".to_string());
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_authentication_names_backend() {
        let err = Error::Authentication {
            backend: BackendKind::S3,
            message: "missing secret".to_string(),
        };
        assert_eq!(err.to_string(), "Authentication failed for s3: missing secret");
    }

    #[test]
    fn test_remote_write_keeps_cause() {
        let err = Error::RemoteWrite {
            operation: Operation::PutData,
            target: "reports/q1.csv".to_string(),
            source: Box::new(Error::Status {
                status: 503,
                message: "slow down".to_string(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("put_data"));
        assert!(msg.contains("reports/q1.csv"));
        assert!(err.source().unwrap().to_string().contains("503"));
    }

    #[test]
    fn test_transient_classification() {
        let status = |status| Error::Status {
            status,
            message: String::new(),
        };
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(404).is_transient());
        assert!(!Error::ContainerConflict("c".to_string()).is_transient());

        let wrapped = Error::RemoteRead {
            operation: Operation::GetData,
            target: "c/k".to_string(),
            source: Box::new(status(502)),
        };
        assert!(wrapped.is_transient());
    }

    #[test]
    fn test_sdk_errors_classification() {
        assert!(Error::Transport("connection reset".to_string()).is_transient());

        let store = Error::from(object_store::Error::NotImplemented);
        assert!(!store.is_transient());
        assert!(store.to_string().starts_with("Object store error"));
    }

    #[test]
    fn test_local_io_display() {
        let err = Error::local_io(
            "/tmp/out.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/out.bin"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::ContainerNotFound("c".to_string()).is_not_found());
        assert!(!Error::Configuration("c".to_string()).is_not_found());
    }
}
