//! Job definitions for the worker runtime.
//!
//! This module defines the records that travel through the queue and the
//! result store:
//!
//! - `Job`: one question to be answered, as pushed by a producer
//! - `JobResult`: the recorded outcome of processing a job
//! - `JobOutcome`: completed answer or error message
//! - `JobStatus`: the `status` field of a stored result

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Maximum number of characters kept from a passage in a result excerpt.
pub const EXCERPT_CHARS: usize = 200;

/// A payload popped from the queue that could not be turned into a job.
///
/// No job id can be trusted for these, so no result record is written.
#[derive(Debug, Error)]
pub enum JobParseError {
    #[error("Invalid job JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Job payload has no job_id")]
    MissingJobId,
}

/// A job whose fields parsed but whose content cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobValidationError {
    #[error("Job missing 'question' field")]
    MissingQuestion,
}

/// A question-answering job.
///
/// Jobs are immutable once enqueued. The wire format is a JSON object:
///
/// ```json
/// {"job_id": "job_abc123", "question": "What is the refund policy?", "submitted_at": "2024-01-01T00:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Producer-assigned unique identifier.
    pub job_id: String,
    /// The question to answer. Empty means the job fails validation.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub question: String,
    /// When the producer created the job, if known.
    #[serde(
        default,
        serialize_with = "serialize_timestamp",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a job for `question` with a fresh `job_xxxxxxxx` id.
    pub fn new(question: impl Into<String>) -> Self {
        Self::with_id(generate_job_id(), question)
    }

    /// Creates a job with an explicit id, stamped with the current time.
    pub fn with_id(job_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            question: question.into(),
            submitted_at: Some(Utc::now()),
        }
    }

    /// Parses a queue payload.
    ///
    /// Fails only when the payload is not a JSON object with a non-empty string
    /// `job_id`. A missing `question` still parses; call [`Job::validate`].
    pub fn parse(payload: &str) -> Result<Self, JobParseError> {
        let job: Job = serde_json::from_str(payload)?;
        if job.job_id.trim().is_empty() {
            return Err(JobParseError::MissingJobId);
        }
        Ok(job)
    }

    /// Serializes the job into its queue payload.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the question if the job can be processed.
    pub fn validate(&self) -> Result<&str, JobValidationError> {
        let question = self.question.trim();
        if question.is_empty() {
            return Err(JobValidationError::MissingQuestion);
        }
        Ok(question)
    }

    /// Returns how long the job waited since submission, if known.
    pub fn age(&self) -> Option<chrono::Duration> {
        self.submitted_at.map(|at| Utc::now() - at)
    }
}

/// Generates a job id of the form `job_` followed by 8 hex characters.
pub fn generate_job_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..8])
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }))
}

fn serialize_timestamp<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => serializer.serialize_none(),
    }
}

/// A retrieved passage as recorded in a job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceExcerpt {
    /// The first [`EXCERPT_CHARS`] characters of the passage, followed by `...`.
    pub content: String,
    /// Metadata carried by the passage in the index.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SourceExcerpt {
    /// Builds an excerpt from a full passage.
    pub fn from_passage(content: &str, metadata: serde_json::Value) -> Self {
        let excerpt: String = content.chars().take(EXCERPT_CHARS).collect();
        Self {
            content: format!("{}...", excerpt),
            metadata,
        }
    }
}

/// Status stored alongside a job result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The pipeline produced an answer.
    Completed,
    /// Validation or the pipeline failed.
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        question: String,
        answer: String,
        sources: Vec<SourceExcerpt>,
    },
    Error {
        message: String,
    },
}

/// Result of processing one job, written once to the result store.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// ID of the job that was processed.
    pub job_id: String,
    /// Completed answer or error.
    pub outcome: JobOutcome,
    /// Identity of the worker that processed the job.
    pub worker_id: String,
    /// When the worker finished with the job.
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// Creates a completed result stamped with the current time.
    pub fn completed(
        job_id: impl Into<String>,
        worker_id: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
        sources: Vec<SourceExcerpt>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: JobOutcome::Completed {
                question: question.into(),
                answer: answer.into(),
                sources,
            },
            worker_id: worker_id.into(),
            completed_at: Utc::now(),
        }
    }

    /// Creates an error result stamped with the current time.
    pub fn error(
        job_id: impl Into<String>,
        worker_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: JobOutcome::Error {
                message: message.into(),
            },
            worker_id: worker_id.into(),
            completed_at: Utc::now(),
        }
    }

    /// Returns the stored status for this result.
    pub fn status(&self) -> JobStatus {
        match self.outcome {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Error { .. } => JobStatus::Error,
        }
    }

    /// Returns whether the job completed successfully.
    pub fn is_success(&self) -> bool {
        self.status() == JobStatus::Completed
    }

    /// Returns the answer for completed results.
    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Completed { answer, .. } => Some(answer),
            JobOutcome::Error { .. } => None,
        }
    }

    /// Returns the error message for failed results.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Completed { .. } => None,
            JobOutcome::Error { message } => Some(message),
        }
    }

    /// Returns the completion time in the stored text format.
    pub fn completed_at_rfc3339(&self) -> String {
        self.completed_at
            .to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}
