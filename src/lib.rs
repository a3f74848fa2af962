//! rag-worker: distributed retrieval-augmented question answering.
//!
//! Workers pull question jobs from a shared Redis list, answer them with a
//! retrieve-then-generate pipeline, store results with a TTL and export
//! Prometheus metrics that drive autoscaling.

pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod rag;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{
    IndexError, LlmError, MetricsError, PipelineError, ProducerError, QueueError, StoreError,
};
