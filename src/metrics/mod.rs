//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides the worker's operational metrics, the background
//! queue-depth collector, and the HTTP endpoint the autoscaler scrapes.
//!
//! # Example
//!
//! ```ignore
//! use rag_worker::metrics::{MetricsRegistry, MetricsServer, QueueDepthSampler};
//!
//! let metrics = MetricsRegistry::new()?;
//! let shutdown = CancellationToken::new();
//!
//! // Serve /metrics and keep the queue depth fresh
//! let server = MetricsServer::bind(8000, metrics.clone()).await?;
//! tokio::spawn(server.run(shutdown.clone()));
//! QueueDepthSampler::new(transport, "rag:jobs", metrics.clone()).spawn(shutdown.clone());
//!
//! // Record job outcomes
//! metrics.inc_inflight();
//! metrics.record_job_success();
//! metrics.dec_inflight();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

// Re-export key types for convenient access
pub use self::collectors::{QueueDepthSampler, DEFAULT_SAMPLE_INTERVAL};
pub use self::prometheus::{
    MetricsRegistry, DEFAULT_QUEUE_LABEL, JOB_DURATION_BUCKETS, LLM_LATENCY_BUCKETS,
    RETRIEVAL_LATENCY_BUCKETS, STATUS_ERR, STATUS_OK,
};
pub use self::server::{router, MetricsServer};
