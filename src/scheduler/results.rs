//! Expiring job result records.
//!
//! Each processed job leaves one record under `<prefix><job_id>` that expires
//! after a fixed retention window. Records are replaced wholesale: writing a
//! second result for the same job leaves only the second one visible.
//!
//! # Record layout
//!
//! Completed jobs:
//!
//! | field | value |
//! |---|---|
//! | `status` | `completed` |
//! | `question` | the question answered |
//! | `answer` | generated answer |
//! | `sources` | JSON array of `{content, metadata}` |
//! | `worker_id` | identity of the worker |
//! | `completed_at` | RFC 3339 UTC timestamp |
//!
//! Failed jobs carry `status = error`, `error`, `worker_id` and `completed_at`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;

use super::job::{JobOutcome, JobResult, JobStatus, SourceExcerpt};
use crate::error::StoreError;
use crate::rag::RagAnswer;

/// Default key prefix for result records.
pub const DEFAULT_RESULT_PREFIX: &str = "rag:result:";

/// Default retention for result records (1 hour).
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// Storage backend for flat string records with expiry.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Replaces the record at `key` with `fields` and applies `ttl`, as one
    /// operation.
    async fn replace(
        &self,
        key: &str,
        fields: &[(&'static str, String)],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Reads the record at `key`, or `None` if absent or expired.
    async fn read(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError>;

    /// Returns the remaining time to live of `key`, or `None` if absent or
    /// without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

/// Redis hash backend.
#[derive(Clone)]
pub struct RedisResultBackend {
    redis: ConnectionManager,
}

impl RedisResultBackend {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    /// Creates a backend from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn replace(
        &self,
        key: &str,
        fields: &[(&'static str, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();

        // MULTI/EXEC so readers never see the record without its TTL, or a
        // mix of old and new fields.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, fields)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore();

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::WriteRejected {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn read(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.redis.clone();
        // -2: no key, -1: no expiry.
        let secs: i64 = conn.ttl(key).await?;
        if secs < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_secs(secs as u64)))
    }
}

struct StoredRecord {
    fields: HashMap<String, String>,
    expires_at: Instant,
}

/// In-process backend with the same replace/expiry behaviour as Redis.
#[derive(Default)]
pub struct MemoryResultBackend {
    records: Mutex<HashMap<String, StoredRecord>>,
}

impl MemoryResultBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .map(|records| records.values().filter(|r| r.expires_at > now).count())
            .unwrap_or(0)
    }

    /// Returns true when no live records exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("result map poisoned".to_string()))
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn replace(
        &self,
        key: &str,
        fields: &[(&'static str, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let record = StoredRecord {
            fields: fields
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            expires_at: Instant::now() + ttl,
        };
        self.lock()?.insert(key.to_string(), record);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut records = self.lock()?;
        match records.get(key) {
            Some(record) if record.expires_at > Instant::now() => Ok(Some(record.fields.clone())),
            Some(_) => {
                records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let records = self.lock()?;
        let now = Instant::now();
        Ok(records
            .get(key)
            .filter(|record| record.expires_at > now)
            .map(|record| record.expires_at - now))
    }
}

/// Writes and reads job results for one worker.
///
/// Every record written through a store carries this worker's identity and
/// the configured TTL.
#[derive(Clone)]
pub struct ResultStore {
    backend: Arc<dyn ResultBackend>,
    prefix: String,
    ttl: Duration,
    worker_id: String,
}

impl ResultStore {
    /// Creates a store over `backend` with the default prefix and TTL.
    pub fn new(backend: Arc<dyn ResultBackend>, worker_id: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: DEFAULT_RESULT_PREFIX.to_string(),
            ttl: DEFAULT_RESULT_TTL,
            worker_id: worker_id.into(),
        }
    }

    /// Sets the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the record retention.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the key a job's result is stored under.
    pub fn key_for(&self, job_id: &str) -> String {
        format!("{}{}", self.prefix, job_id)
    }

    /// Returns the identity stamped on written records.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the configured retention.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records a completed job and returns the written result.
    pub async fn write_success(
        &self,
        job_id: &str,
        question: &str,
        answer: RagAnswer,
    ) -> Result<JobResult, StoreError> {
        let result = JobResult::completed(
            job_id,
            &self.worker_id,
            question,
            answer.answer,
            answer.sources,
        );
        self.write(&result).await?;
        Ok(result)
    }

    /// Records a failed job and returns the written result.
    pub async fn write_error(&self, job_id: &str, message: &str) -> Result<JobResult, StoreError> {
        let result = JobResult::error(job_id, &self.worker_id, message);
        self.write(&result).await?;
        Ok(result)
    }

    /// Persists a fully built result under its namespaced key.
    pub async fn write(&self, result: &JobResult) -> Result<(), StoreError> {
        let key = self.key_for(&result.job_id);
        let fields = encode_fields(result)?;
        self.backend.replace(&key, &fields, self.ttl).await
    }

    /// Reads a job's result, or `None` if absent or expired.
    pub async fn fetch(&self, job_id: &str) -> Result<Option<JobResult>, StoreError> {
        let key = self.key_for(job_id);
        match self.backend.read(&key).await? {
            Some(fields) => decode_fields(&key, job_id, fields).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the remaining retention of a job's result.
    pub async fn remaining_ttl(&self, job_id: &str) -> Result<Option<Duration>, StoreError> {
        self.backend.ttl(&self.key_for(job_id)).await
    }
}

fn encode_fields(result: &JobResult) -> Result<Vec<(&'static str, String)>, StoreError> {
    let mut fields = vec![("status", result.status().to_string())];

    match &result.outcome {
        JobOutcome::Completed {
            question,
            answer,
            sources,
        } => {
            fields.push(("question", question.clone()));
            fields.push(("answer", answer.clone()));
            fields.push(("sources", serde_json::to_string(sources)?));
        }
        JobOutcome::Error { message } => {
            fields.push(("error", message.clone()));
        }
    }

    fields.push(("worker_id", result.worker_id.clone()));
    fields.push(("completed_at", result.completed_at_rfc3339()));
    Ok(fields)
}

fn decode_fields(
    key: &str,
    job_id: &str,
    mut fields: HashMap<String, String>,
) -> Result<JobResult, StoreError> {
    let malformed = |reason: String| StoreError::MalformedRecord {
        key: key.to_string(),
        reason,
    };

    let status: JobStatus = fields
        .get("status")
        .ok_or_else(|| malformed("missing status".to_string()))?
        .parse()
        .map_err(malformed)?;

    let completed_at = fields
        .get("completed_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| malformed("missing or invalid completed_at".to_string()))?;

    let outcome = match status {
        JobStatus::Completed => {
            let sources: Vec<SourceExcerpt> = match fields.get("sources") {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|e| malformed(format!("invalid sources: {}", e)))?,
                None => Vec::new(),
            };
            JobOutcome::Completed {
                question: fields.remove("question").unwrap_or_default(),
                answer: fields.remove("answer").unwrap_or_default(),
                sources,
            }
        }
        JobStatus::Error => JobOutcome::Error {
            message: fields.remove("error").unwrap_or_default(),
        },
    };

    Ok(JobResult {
        job_id: job_id.to_string(),
        outcome,
        worker_id: fields.remove("worker_id").unwrap_or_default(),
        completed_at,
    })
}
