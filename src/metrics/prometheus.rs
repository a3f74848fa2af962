//! Prometheus metrics registration and export.
//!
//! Defines the worker's metrics and provides the text exposition served to
//! the scraper. Every metric is an atomic prometheus value, so the worker
//! loop, the pipeline and the queue-depth sampler can update them from
//! different tasks without extra locking.

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Label value used for the `queue` label on queue gauges.
pub const DEFAULT_QUEUE_LABEL: &str = "default";

/// `status` label value for successfully processed jobs.
pub const STATUS_OK: &str = "ok";

/// `status` label value for failed or discarded jobs.
pub const STATUS_ERR: &str = "err";

/// Buckets for `agent_job_duration_seconds`.
pub const JOB_DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Buckets for `agent_retrieval_latency_seconds`.
pub const RETRIEVAL_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0];

/// Buckets for `agent_llm_latency_seconds`.
pub const LLM_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Process-wide worker metrics.
///
/// Cloning is cheap and every clone updates the same underlying values.
/// Build one per process at startup and hand clones to the components that
/// record into it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    queue_label: String,
    queue_depth: GaugeVec,
    inflight: GaugeVec,
    jobs_processed: CounterVec,
    job_duration: Histogram,
    retrieval_latency: Histogram,
    llm_latency: Histogram,
}

impl MetricsRegistry {
    /// Creates and registers all worker metrics.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if metric registration fails, typically
    /// due to invalid metric configurations.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_queue_label(DEFAULT_QUEUE_LABEL)
    }

    /// Creates the metrics with a custom `queue` label value.
    pub fn with_queue_label(queue_label: impl Into<String>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Queue metrics
        let queue_depth = GaugeVec::new(
            Opts::new("agent_queue_depth", "Number of jobs waiting in the queue"),
            &["queue"],
        )?;

        let inflight = GaugeVec::new(
            Opts::new("agent_inflight", "Number of jobs currently being processed"),
            &["queue"],
        )?;

        let jobs_processed = CounterVec::new(
            Opts::new("agent_jobs_processed_total", "Total number of jobs processed"),
            &["status"],
        )?;

        // Latency metrics
        let job_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_job_duration_seconds",
                "Time taken to process a job end-to-end",
            )
            .buckets(JOB_DURATION_BUCKETS.to_vec()),
        )?;

        let retrieval_latency = Histogram::with_opts(
            HistogramOpts::new(
                "agent_retrieval_latency_seconds",
                "Time taken for vector retrieval",
            )
            .buckets(RETRIEVAL_LATENCY_BUCKETS.to_vec()),
        )?;

        let llm_latency = Histogram::with_opts(
            HistogramOpts::new("agent_llm_latency_seconds", "Time taken for LLM generation")
                .buckets(LLM_LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(inflight.clone()))?;
        registry.register(Box::new(jobs_processed.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(retrieval_latency.clone()))?;
        registry.register(Box::new(llm_latency.clone()))?;

        let metrics = Self {
            registry,
            queue_label: queue_label.into(),
            queue_depth,
            inflight,
            jobs_processed,
            job_duration,
            retrieval_latency,
            llm_latency,
        };

        // Materialise the labelled series so a fresh worker exports zeros
        // instead of omitting them.
        metrics.inflight_gauge().set(0.0);
        metrics.queue_depth_gauge().set(0.0);
        metrics.jobs_processed.with_label_values(&[STATUS_OK]);
        metrics.jobs_processed.with_label_values(&[STATUS_ERR]);

        tracing::debug!("Prometheus metrics registered");

        Ok(metrics)
    }

    fn inflight_gauge(&self) -> prometheus::Gauge {
        self.inflight.with_label_values(&[self.queue_label.as_str()])
    }

    fn queue_depth_gauge(&self) -> prometheus::Gauge {
        self.queue_depth
            .with_label_values(&[self.queue_label.as_str()])
    }

    /// Increment the inflight gauge.
    pub fn inc_inflight(&self) {
        self.inflight_gauge().inc();
    }

    /// Decrement the inflight gauge.
    pub fn dec_inflight(&self) {
        self.inflight_gauge().dec();
    }

    /// Current value of the inflight gauge.
    pub fn inflight(&self) -> f64 {
        self.inflight_gauge().get()
    }

    /// Record a successfully processed job.
    pub fn record_job_success(&self) {
        self.jobs_processed.with_label_values(&[STATUS_OK]).inc();
    }

    /// Record a failed job or discarded payload.
    pub fn record_job_error(&self) {
        self.jobs_processed.with_label_values(&[STATUS_ERR]).inc();
    }

    /// Number of jobs processed with the given `status` label.
    pub fn jobs_processed(&self, status: &str) -> f64 {
        self.jobs_processed.with_label_values(&[status]).get()
    }

    /// Observe an end-to-end job duration.
    pub fn observe_job_duration(&self, seconds: f64) {
        self.job_duration.observe(seconds);
    }

    /// Observe a retrieval-phase latency.
    pub fn observe_retrieval_latency(&self, seconds: f64) {
        self.retrieval_latency.observe(seconds);
    }

    /// Observe a generation-phase latency.
    pub fn observe_llm_latency(&self, seconds: f64) {
        self.llm_latency.observe(seconds);
    }

    /// Number of observations recorded by the job duration histogram.
    pub fn job_duration_count(&self) -> u64 {
        self.job_duration.get_sample_count()
    }

    /// Number of observations recorded by the retrieval histogram.
    pub fn retrieval_latency_count(&self) -> u64 {
        self.retrieval_latency.get_sample_count()
    }

    /// Number of observations recorded by the generation histogram.
    pub fn llm_latency_count(&self) -> u64 {
        self.llm_latency.get_sample_count()
    }

    /// Set the queue-depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth_gauge().set(depth as f64);
    }

    /// Current value of the queue-depth gauge.
    pub fn queue_depth(&self) -> f64 {
        self.queue_depth_gauge().get()
    }

    /// Returns the underlying prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all registered metrics in Prometheus text format.
    ///
    /// If encoding fails, returns a comment line describing the error so the
    /// scrape still gets a well-formed body.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}
