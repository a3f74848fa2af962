//! Worker runtime that pulls jobs from the queue and answers them.
//!
//! One runtime is one sequential loop: pop, parse, validate, answer, record.
//! Scaling out means running more runtimes (normally more processes) against
//! the same queue; the atomic pop is the only coordination between them.
//!
//! # Loop protocol
//!
//! - An empty pop is not an event; the loop simply pops again.
//! - A payload that does not parse is counted as an error and discarded with
//!   no result written.
//! - A job without a question, or one whose pipeline call fails or panics,
//!   gets an `error` result under its id.
//! - A transport failure backs off before the next pop and is not counted
//!   against any job. An unreachable backend waits `transport_backoff`;
//!   any other queue error waits `error_backoff`.
//! - Shutdown is checked between pops only, so a job that has been popped is
//!   always finished and recorded.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::Job;
use super::queue::QueueTransport;
use super::results::ResultStore;
use crate::metrics::MetricsRegistry;
use crate::rag::RagPipeline;

/// Default queue the worker pops from.
pub const DEFAULT_QUEUE_NAME: &str = "rag:jobs";

/// Worker identity used when neither `WORKER_ID` nor `HOSTNAME` is set.
pub const FALLBACK_WORKER_ID: &str = "worker-local";

/// Configuration for a worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of the job queue.
    pub queue_name: String,
    /// How long one blocking pop waits for a job.
    pub pop_timeout: Duration,
    /// Pause after the transport fails.
    pub transport_backoff: Duration,
    /// Pause after an unexpected failure while handling a job.
    pub error_backoff: Duration,
    /// Identity written into results and logs.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            pop_timeout: Duration::from_secs(5),
            transport_backoff: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            worker_id: FALLBACK_WORKER_ID.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the blocking pop timeout.
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    /// Sets the backoff after transport failures.
    pub fn with_transport_backoff(mut self, backoff: Duration) -> Self {
        self.transport_backoff = backoff;
        self
    }

    /// Sets the backoff after unexpected failures.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Sets the worker identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// Picks the worker identity: explicit value, then `HOSTNAME`, then
/// [`FALLBACK_WORKER_ID`].
pub fn resolve_worker_id(explicit: Option<String>) -> String {
    explicit
        .filter(|id| !id.trim().is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_WORKER_ID.to_string())
}

/// What the runtime is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting on the queue.
    Idle,
    /// Decoding a popped payload.
    Parsing,
    /// Running the pipeline.
    Processing,
    /// Writing the result.
    Recording,
    /// Shutdown was requested; no further pops.
    ShuttingDown,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Parsing => 1,
            WorkerState::Processing => 2,
            WorkerState::Recording => 3,
            WorkerState::ShuttingDown => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Parsing,
            2 => WorkerState::Processing,
            3 => WorkerState::Recording,
            4 => WorkerState::ShuttingDown,
            _ => WorkerState::Idle,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Parsing => "parsing",
            WorkerState::Processing => "processing",
            WorkerState::Recording => "recording",
            WorkerState::ShuttingDown => "shutting_down",
        };
        write!(f, "{}", name)
    }
}

/// How a single popped payload was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// An answer was produced.
    Completed,
    /// Validation or the pipeline failed; an error result was written.
    Failed,
    /// The payload was not a job and was dropped.
    Discarded,
}

/// Totals for one call to [`WorkerRuntime::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub payloads_discarded: u64,
    /// Panics that escaped per-job handling and were caught by the loop.
    pub unexpected_failures: u64,
}

impl RunSummary {
    /// Payloads that were popped and handled to an outcome.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.payloads_discarded
    }
}

#[derive(Default)]
struct SharedRunStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    payloads_discarded: AtomicU64,
    unexpected_failures: AtomicU64,
}

impl SharedRunStats {
    fn record(&self, outcome: PayloadOutcome) {
        let counter = match outcome {
            PayloadOutcome::Completed => &self.jobs_completed,
            PayloadOutcome::Failed => &self.jobs_failed,
            PayloadOutcome::Discarded => &self.payloads_discarded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn record_unexpected(&self) {
        self.unexpected_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> RunSummary {
        RunSummary {
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            payloads_discarded: self.payloads_discarded.load(Ordering::SeqCst),
            unexpected_failures: self.unexpected_failures.load(Ordering::SeqCst),
        }
    }
}

/// Holds the inflight gauge up for the lifetime of one job.
///
/// Dropping records the job duration and decrements inflight, including
/// when the job future unwinds.
struct InflightGuard<'a> {
    metrics: &'a MetricsRegistry,
    started: Instant,
}

impl<'a> InflightGuard<'a> {
    fn start(metrics: &'a MetricsRegistry) -> Self {
        metrics.inc_inflight();
        Self {
            metrics,
            started: Instant::now(),
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .observe_job_duration(self.started.elapsed().as_secs_f64());
        self.metrics.dec_inflight();
    }
}

/// The per-process job loop.
pub struct WorkerRuntime {
    config: WorkerConfig,
    transport: Arc<dyn QueueTransport>,
    pipeline: Arc<dyn RagPipeline>,
    results: ResultStore,
    metrics: MetricsRegistry,
    state: AtomicU8,
    stats: SharedRunStats,
}

impl WorkerRuntime {
    /// Creates a runtime. Nothing runs until [`WorkerRuntime::run`].
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn QueueTransport>,
        pipeline: Arc<dyn RagPipeline>,
        results: ResultStore,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            config,
            transport,
            pipeline,
            results,
            metrics,
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            stats: SharedRunStats::default(),
        }
    }

    /// Current loop state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Totals so far.
    pub fn summary(&self) -> RunSummary {
        self.stats.snapshot()
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Returns after the current pop (bounded by the pop timeout) or the
    /// current job completes.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        let worker_id = self.config.worker_id.as_str();
        info!(
            worker_id,
            queue = %self.config.queue_name,
            pop_timeout_secs = self.config.pop_timeout.as_secs_f64(),
            "Worker started"
        );

        while !shutdown.is_cancelled() {
            self.set_state(WorkerState::Idle);

            let popped = self
                .transport
                .blocking_pop(&self.config.queue_name, self.config.pop_timeout)
                .await;

            match popped {
                Ok(Some(payload)) => {
                    let handled = AssertUnwindSafe(self.process_payload(&payload))
                        .catch_unwind()
                        .await;
                    match handled {
                        Ok(outcome) => self.stats.record(outcome),
                        Err(panic) => {
                            self.stats.record_unexpected();
                            error!(
                                worker_id,
                                error = %panic_message(panic.as_ref()),
                                "Unexpected failure while handling payload"
                            );
                            self.backoff(self.config.error_backoff, &shutdown).await;
                        }
                    }
                }
                Ok(None) => {
                    debug!(worker_id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to pop from queue");
                    let delay = if e.is_unavailable() {
                        self.config.transport_backoff
                    } else {
                        self.config.error_backoff
                    };
                    self.backoff(delay, &shutdown).await;
                }
            }
        }

        self.set_state(WorkerState::ShuttingDown);
        let summary = self.stats.snapshot();
        info!(
            worker_id,
            completed = summary.jobs_completed,
            failed = summary.jobs_failed,
            discarded = summary.payloads_discarded,
            "Worker stopped"
        );
        summary
    }

    /// Handles one popped payload end to end.
    ///
    /// Never fails: every error is turned into a metric, a log line and, when
    /// the payload carried a job id, an `error` result.
    pub async fn process_payload(&self, payload: &str) -> PayloadOutcome {
        self.set_state(WorkerState::Parsing);
        let job = match Job::parse(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    error = %e,
                    payload_len = payload.len(),
                    "Discarding malformed payload"
                );
                self.metrics.record_job_error();
                return PayloadOutcome::Discarded;
            }
        };

        let _inflight = InflightGuard::start(&self.metrics);
        let job_id = job.job_id.as_str();
        if let Some(age) = job.age() {
            debug!(job_id, queued_ms = age.num_milliseconds(), "Job dequeued");
        }

        self.set_state(WorkerState::Processing);
        let answered = match job.validate() {
            Ok(question) => {
                info!(job_id, question, "Processing job");
                match AssertUnwindSafe(self.pipeline.answer(question))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(answer)) => Ok((question, answer)),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(panic) => Err(format!(
                        "Pipeline panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        self.set_state(WorkerState::Recording);
        match answered {
            Ok((question, answer)) => {
                if let Err(e) = self.results.write_success(job_id, question, answer).await {
                    error!(job_id, error = %e, "Failed to store job result");
                }
                self.metrics.record_job_success();
                info!(job_id, "Job completed");
                PayloadOutcome::Completed
            }
            Err(message) => {
                error!(job_id, error = %message, "Job failed");
                if let Err(e) = self.results.write_error(job_id, &message).await {
                    error!(job_id, error = %e, "Failed to store job error");
                }
                self.metrics.record_job_error();
                PayloadOutcome::Failed
            }
        }
    }

    async fn backoff(&self, delay: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
