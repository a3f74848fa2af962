//! Job queue, worker runtime and result storage.
//!
//! This module provides the distributed side of the system:
//!
//! - **QueueTransport**: push / blocking-pop over a shared list (Redis or in-memory)
//! - **WorkerRuntime**: the per-process loop that claims and answers jobs
//! - **ResultStore**: per-job result records with a fixed TTL
//! - **JobProducer**: load generator that fills the queue
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ JobProducer  │
//!                      │ (push / CLI) │
//!                      └──────┬───────┘
//!                             │ LPUSH
//!                      ┌──────▼───────┐
//!                      │    Redis     │◄──── LLEN (queue-depth sampler)
//!                      │  rag:jobs    │
//!                      └──────┬───────┘
//!                             │ BRPOP
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             ▼ HSET + EXPIRE
//!                      rag:result:<job_id>
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_worker::scheduler::{Job, RedisQueue, QueueTransport, WorkerConfig, WorkerRuntime};
//! use tokio_util::sync::CancellationToken;
//!
//! let queue = RedisQueue::connect("redis://localhost:6379").await?;
//! queue.push("rag:jobs", &Job::new("What is the refund policy?").to_payload()?).await?;
//!
//! let runtime = WorkerRuntime::new(WorkerConfig::default(), Arc::new(queue), pipeline, results, metrics);
//! let summary = runtime.run(CancellationToken::new()).await;
//! ```
//!
//! # Delivery
//!
//! - **Atomic claim**: each payload is popped by exactly one worker
//! - **At most once**: there is no processing list; a worker killed between
//!   pop and result write loses that job
//! - **Graceful shutdown**: workers finish the job they hold before stopping

pub mod job;
pub mod producer;
pub mod queue;
pub mod results;
pub mod worker;

// Re-export main types for convenience
pub use job::{
    generate_job_id, Job, JobOutcome, JobParseError, JobResult, JobStatus, JobValidationError,
    SourceExcerpt,
};
pub use producer::{
    load_questions, parse_questions, JobProducer, ProducerConfig, PushReport, QuestionOrder,
};
pub use queue::{MemoryQueue, QueueTransport, RedisQueue};
pub use results::{
    MemoryResultBackend, RedisResultBackend, ResultBackend, ResultStore, DEFAULT_RESULT_PREFIX,
    DEFAULT_RESULT_TTL,
};
pub use worker::{
    resolve_worker_id, PayloadOutcome, RunSummary, WorkerConfig, WorkerRuntime, WorkerState,
    DEFAULT_QUEUE_NAME, FALLBACK_WORKER_ID,
};
