use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker channel failed: {0}")]
    Channel(String),

    #[error("Topology declaration failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Consumer stopped: {0}")]
    ConsumerStopped(String),

    #[error("Image decode failed: {0}")]
    ImageDecode(String),

    #[error("Image encode failed: {0}")]
    ImageEncode(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Malformed job message: {0}")]
    MalformedJob(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Capture request failed: {0}")]
    Capture(String),

    #[error("Storage request failed: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Broad failure classes used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Dial, channel, declare and publish failures. Recovered by reconnecting.
    Connectivity,
    /// Bytes that could not be understood: job JSON, image data.
    Decoding,
    /// Failures of the capture/storage collaborators.
    Domain,
    Configuration,
}

impl WorkerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkerError::Connection(_)
            | WorkerError::Channel(_)
            | WorkerError::Declare(_)
            | WorkerError::Publish(_)
            | WorkerError::PublishTimeout(_)
            | WorkerError::ConsumerStopped(_) => ErrorCategory::Connectivity,
            WorkerError::ImageDecode(_)
            | WorkerError::ImageEncode(_)
            | WorkerError::InvalidGeometry(_)
            | WorkerError::MalformedJob(_)
            | WorkerError::Serialization(_) => ErrorCategory::Decoding,
            WorkerError::Capture(_) | WorkerError::Storage(_) => ErrorCategory::Domain,
            WorkerError::Configuration(_) | WorkerError::Io(_) => ErrorCategory::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Connectivity
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for WorkerError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(e) => WorkerError::ImageEncode(e.to_string()),
            other => WorkerError::ImageDecode(other.to_string()),
        }
    }
}

impl From<lapin::Error> for WorkerError {
    fn from(err: lapin::Error) -> Self {
        WorkerError::Channel(err.to_string())
    }
}
