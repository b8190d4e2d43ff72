use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch resources: {message}")]
    WatchFailed { message: String },
    #[error("Kubernetes API request failed: {message}")]
    ApiFailure { message: String },
    #[error("Invalid fleet resource: {message}")]
    InvalidResource { message: String },
}
