//! Error types for rag-worker operations.
//!
//! Defines error types for the major subsystems:
//! - Queue transport (Redis list / in-memory)
//! - Result store writes and reads
//! - RAG pipeline (index loading, retrieval, generation)
//! - LLM and embedding API interactions
//! - Load generation

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during queue transport operations.
///
/// `Unavailable` is kept apart from every other failure so the worker loop can
/// tell "transport unreachable" (back off and retry) from a rejected command.
/// An empty queue is never an error; it is the `None` result of a blocking pop.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to reach the queue backend.
    #[error("Queue transport unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed a command.
    #[error("Queue command failed: {0}")]
    Command(String),

    /// The transport was closed locally.
    #[error("Queue '{0}' is closed")]
    Closed(String),
}

impl QueueError {
    /// Returns true when the failure means the backend could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
            || err.is_timeout()
        {
            QueueError::Unavailable(err.to_string())
        } else {
            QueueError::Command(err.to_string())
        }
    }
}

/// Errors that can occur while writing or reading job results.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result store unavailable: {0}")]
    Unavailable(String),

    #[error("Result store rejected write for '{key}': {reason}")]
    WriteRejected { key: String, reason: String },

    #[error("Malformed result record at '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Errors that can occur during LLM and embedding API operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty response from model '{0}'")]
    EmptyResponse(String),
}

/// Errors that can occur while loading or querying the vector index artifact.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index not found at {0}. Build the index before starting workers.")]
    NotFound(PathBuf),

    #[error("Failed to read index at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse index at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Index entry {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Query embedding has dimension {actual}, index expects {expected}")]
    QueryDimension { expected: usize, actual: usize },
}

/// Errors surfaced by the retrieve/generate pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline initialization failed: {0}")]
    Initialization(#[from] IndexError),

    #[error("Embedding failed: {0}")]
    Embedding(#[source] LlmError),

    #[error("Generation failed: {0}")]
    Generation(#[source] LlmError),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),
}

/// Errors that can occur while producing load-generation jobs.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Questions file not found: {0}")]
    QuestionsNotFound(PathBuf),

    #[error("No questions available in {0}")]
    NoQuestions(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while running the metrics endpoint.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("Failed to bind metrics endpoint on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_classification() {
        assert!(QueueError::Unavailable("refused".to_string()).is_unavailable());
        assert!(!QueueError::Command("WRONGTYPE".to_string()).is_unavailable());
        assert!(!QueueError::Closed("rag:jobs".to_string()).is_unavailable());
    }

    #[test]
    fn test_redis_io_error_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: QueueError = redis::RedisError::from(io).into();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_redis_type_error_maps_to_command() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::TypeError, "bad type"));
        let err: QueueError = redis_err.into();
        assert!(matches!(err, QueueError::Command(_)));
    }

    #[test]
    fn test_error_display() {
        let err = IndexError::NotFound(PathBuf::from("/tmp/missing"));
        assert!(err.to_string().contains("/tmp/missing"));

        let err = LlmError::ApiError {
            code: 503,
            message: "overloaded".to_string(),
        };
        assert!(err.to_string().contains("503"));

        let err = PipelineError::Generation(LlmError::RequestFailed("refused".to_string()));
        assert!(err.to_string().contains("Generation failed"));
    }
}
