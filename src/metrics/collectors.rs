//! Background collectors that refresh derived metrics.
//!
//! The queue depth is not updated by pushes or pops. A sampler task reads
//! the queue length on a fixed interval and writes it into the
//! `agent_queue_depth` gauge, so the exported value may lag the real queue
//! by up to one interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::prometheus::MetricsRegistry;
use crate::scheduler::QueueTransport;

/// Default interval between queue-depth samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically copies the transport's queue length into the depth gauge.
pub struct QueueDepthSampler {
    transport: Arc<dyn QueueTransport>,
    queue_name: String,
    metrics: MetricsRegistry,
    interval: Duration,
}

impl QueueDepthSampler {
    /// Creates a sampler with the default interval.
    ///
    /// The transport should not be shared with a worker's blocking pop, or
    /// samples will queue behind it.
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            transport,
            queue_name: queue_name.into(),
            metrics,
            interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    /// Sets the sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Takes one sample.
    ///
    /// Returns the observed depth, or `None` if the transport failed. A
    /// failed sample leaves the gauge at its previous value.
    pub async fn sample_once(&self) -> Option<usize> {
        match self.transport.length(&self.queue_name).await {
            Ok(depth) => {
                self.metrics.set_queue_depth(depth);
                debug!(queue = %self.queue_name, depth, "Sampled queue depth");
                Some(depth)
            }
            Err(e) => {
                warn!(queue = %self.queue_name, error = %e, "Failed to get queue depth");
                None
            }
        }
    }

    /// Runs the sampler until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts the wait between samples immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            queue = %self.queue_name,
            interval_secs = self.interval.as_secs_f64(),
            "Queue depth collector started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.sample_once().await;
                }
            }
        }

        info!(queue = %self.queue_name, "Queue depth collector stopped");
    }

    /// Spawns the sampler onto the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryQueue;

    #[tokio::test]
    async fn test_sample_once_sets_gauge() {
        let queue = Arc::new(MemoryQueue::new());
        for i in 0..3 {
            queue.push("jobs", &i.to_string()).await.unwrap();
        }
        let metrics = MetricsRegistry::new().unwrap();
        let sampler = QueueDepthSampler::new(queue, "jobs", metrics.clone());

        assert_eq!(sampler.sample_once().await, Some(3));
        assert_eq!(metrics.queue_depth(), 3.0);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_previous_value() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push("jobs", "a").await.unwrap();
        let metrics = MetricsRegistry::new().unwrap();
        let sampler = QueueDepthSampler::new(queue.clone(), "jobs", metrics.clone());

        sampler.sample_once().await;
        queue.set_unavailable(true);

        assert_eq!(sampler.sample_once().await, None);
        assert_eq!(metrics.queue_depth(), 1.0);
    }

    #[tokio::test]
    async fn test_background_sampler_tracks_queue_and_survives_outage() {
        let queue = Arc::new(MemoryQueue::new());
        let metrics = MetricsRegistry::new().unwrap();
        let shutdown = CancellationToken::new();

        let handle = QueueDepthSampler::new(queue.clone(), "jobs", metrics.clone())
            .with_interval(Duration::from_millis(10))
            .spawn(shutdown.clone());

        queue.push("jobs", "a").await.unwrap();
        queue.push("jobs", "b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(metrics.queue_depth(), 2.0);

        queue.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!handle.is_finished(), "sampler must survive transport failures");

        queue.set_unavailable(false);
        queue.push("jobs", "c").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(metrics.queue_depth(), 3.0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_long_wait() {
        let metrics = MetricsRegistry::new().unwrap();
        let shutdown = CancellationToken::new();
        let handle = QueueDepthSampler::new(Arc::new(MemoryQueue::new()), "jobs", metrics)
            .with_interval(Duration::from_secs(3600))
            .spawn(shutdown.clone());

        shutdown.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .is_ok());
    }
}
