//! Queue transport for job payloads.
//!
//! This module provides the push / blocking-pop primitive workers pull jobs
//! through:
//!
//! - [`RedisQueue`]: a Redis list shared by every worker process
//! - [`MemoryQueue`]: an in-process list with the same semantics, for tests
//!   and single-process runs
//!
//! # Queue Structure
//!
//! Producers `LPUSH` payloads onto the head of the list and workers `BRPOP`
//! from the tail, so jobs are handed out in push order. The pop is the
//! atomicity boundary: Redis hands each element to exactly one blocked client.
//!
//! There is no processing list and no acknowledgement. A worker that dies
//! between pop and result write loses that job.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::QueueError;

/// Push / blocking-pop primitive over a shared ordered list.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Appends a payload to the head of the queue.
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError>;

    /// Waits up to `timeout` for the oldest payload.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(payload))` if a payload was claimed by this caller
    /// - `Ok(None)` if the timeout expired with nothing available
    /// - `Err(QueueError::Unavailable)` if the backend could not be reached
    async fn blocking_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Returns the number of pending payloads without modifying the queue.
    async fn length(&self, queue: &str) -> Result<usize, QueueError>;
}

/// Redis-list queue transport.
///
/// Cloning is cheap and shares the underlying connection. A blocking pop holds
/// the connection for up to its timeout, so components that must not wait
/// behind it (the queue-depth sampler) should connect their own instance.
#[derive(Clone)]
pub struct RedisQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisQueue {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Unavailable` if the server cannot be reached and
    /// `QueueError::Command` if the URL is invalid.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Returns a handle to the underlying connection.
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();

        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(brpop_timeout_secs(timeout))
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|(_, payload)| payload))
    }

    async fn length(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }
}

/// BRPOP timeout argument in seconds.
///
/// Fractional values need Redis 6 or later. BRPOP treats 0 as "block forever",
/// so anything under one second is sent as one second.
fn brpop_timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(1.0)
}

/// In-process queue transport with Redis list semantics.
///
/// Every queue name maps to its own list; all waiters share one [`Notify`]
/// and re-check their list after each push. The mutex makes the pop atomic.
#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a backend outage: while set, every operation fails with
    /// `QueueError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        // Wake blocked poppers so they observe the outage.
        self.pushed.notify_waiters();
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable(
                "in-memory queue marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn try_pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
        self.check_available()?;
        let mut lists = self
            .lists
            .lock()
            .map_err(|_| QueueError::Closed(queue.to_string()))?;
        Ok(lists.get_mut(queue).and_then(VecDeque::pop_back))
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        self.check_available()?;
        {
            let mut lists = self
                .lists
                .lock()
                .map_err(|_| QueueError::Closed(queue.to_string()))?;
            lists
                .entry(queue.to_string())
                .or_default()
                .push_front(payload.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(queue)? {
                return Ok(Some(payload));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn length(&self, queue: &str) -> Result<usize, QueueError> {
        self.check_available()?;
        let lists = self
            .lists
            .lock()
            .map_err(|_| QueueError::Closed(queue.to_string()))?;
        Ok(lists.get(queue).map_or(0, VecDeque::len))
    }
}
