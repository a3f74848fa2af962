//! Load generator that fills the job queue.
//!
//! Used to exercise autoscaling: push a burst of jobs, watch the queue-depth
//! gauge climb, and watch workers drain it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use super::job::Job;
use super::queue::QueueTransport;
use super::worker::DEFAULT_QUEUE_NAME;
use crate::error::ProducerError;

/// Default number of jobs per run.
pub const DEFAULT_JOB_COUNT: usize = 50;

/// Queue depth is reported after this many pushes, and after the last one.
pub const DEPTH_REPORT_EVERY: usize = 10;

/// How questions are picked from the question set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuestionOrder {
    /// Uniform sampling with replacement.
    #[default]
    Random,
    /// Cycle through the set in file order.
    Sequential,
}

/// Configuration for a producer run.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub queue_name: String,
    pub count: usize,
    /// Pause between pushes. Zero pushes as fast as the transport allows.
    pub delay: Duration,
    pub order: QuestionOrder,
    /// Seed for reproducible random sampling.
    pub seed: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            count: DEFAULT_JOB_COUNT,
            delay: Duration::ZERO,
            order: QuestionOrder::Random,
            seed: None,
        }
    }
}

impl ProducerConfig {
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_order(mut self, order: QuestionOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

/// Summary of a producer run.
#[derive(Debug, Clone, PartialEq)]
pub struct PushReport {
    pub pushed: usize,
    pub last_job_id: Option<String>,
    pub elapsed: Duration,
    /// Queue length after the last push, if it could be read.
    pub final_depth: Option<usize>,
}

/// Parses a questions file body: one question per line, skipping blank lines
/// and `#` comments.
pub fn parse_questions(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Loads questions from a file.
///
/// # Errors
///
/// Returns `ProducerError::QuestionsNotFound` when the file is missing and
/// `ProducerError::NoQuestions` when it holds no usable lines.
pub fn load_questions(path: impl AsRef<Path>) -> Result<Vec<String>, ProducerError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ProducerError::QuestionsNotFound(path.to_path_buf()));
    }

    let questions = parse_questions(&std::fs::read_to_string(path)?);
    if questions.is_empty() {
        return Err(ProducerError::NoQuestions(path.display().to_string()));
    }

    info!(count = questions.len(), path = %path.display(), "Loaded questions");
    Ok(questions)
}

/// Pushes synthetic jobs onto the queue.
pub struct JobProducer {
    transport: Arc<dyn QueueTransport>,
    config: ProducerConfig,
    questions: Vec<String>,
    rng: ChaCha8Rng,
}

impl JobProducer {
    /// Creates a producer over a non-empty question set.
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        questions: Vec<String>,
        config: ProducerConfig,
    ) -> Result<Self, ProducerError> {
        if questions.is_empty() {
            return Err(ProducerError::NoQuestions("question set".to_string()));
        }

        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };

        Ok(Self {
            transport,
            config,
            questions,
            rng,
        })
    }

    fn pick_question(&mut self, position: usize) -> Option<String> {
        match self.config.order {
            QuestionOrder::Random => self.questions.choose(&mut self.rng).cloned(),
            QuestionOrder::Sequential => self
                .questions
                .get(position % self.questions.len())
                .cloned(),
        }
    }

    /// Pushes `config.count` jobs.
    pub async fn run(&mut self) -> Result<PushReport, ProducerError> {
        let queue = self.config.queue_name.clone();
        let count = self.config.count;
        info!(
            queue = %queue,
            count,
            delay_secs = self.config.delay.as_secs_f64(),
            order = ?self.config.order,
            "Pushing jobs"
        );

        let started = Instant::now();
        let mut last_job_id = None;

        for i in 0..count {
            let question = self
                .pick_question(i)
                .ok_or_else(|| ProducerError::NoQuestions("question set".to_string()))?;
            let job = Job::new(question);
            self.transport.push(&queue, &job.to_payload()?).await?;

            if (i + 1) % DEPTH_REPORT_EVERY == 0 || i + 1 == count {
                match self.transport.length(&queue).await {
                    Ok(depth) => info!(
                        progress = %format!("{}/{}", i + 1, count),
                        job_id = %job.job_id,
                        queue_depth = depth,
                        "Pushed jobs"
                    ),
                    Err(e) => warn!(error = %e, "Failed to read queue depth"),
                }
            }
            last_job_id = Some(job.job_id);

            if !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }
        }

        let final_depth = self.transport.length(&queue).await.ok();
        let report = PushReport {
            pushed: count,
            last_job_id,
            elapsed: started.elapsed(),
            final_depth,
        };

        info!(
            pushed = report.pushed,
            elapsed_secs = report.elapsed.as_secs_f64(),
            final_depth = ?report.final_depth,
            "Done pushing jobs"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryQueue;
    use std::collections::HashSet;
    use std::io::Write;

    fn questions() -> Vec<String> {
        vec![
            "What is the refund policy?".to_string(),
            "How long does shipping take?".to_string(),
            "Do you ship abroad?".to_string(),
        ]
    }

    async fn drain(queue: &MemoryQueue, name: &str) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Some(payload) = queue
            .blocking_pop(name, Duration::from_millis(1))
            .await
            .unwrap()
        {
            jobs.push(Job::parse(&payload).unwrap());
        }
        jobs
    }

    #[test]
    fn test_parse_questions_skips_blanks_and_comments() {
        let text = "# sample questions\n\nWhat is the refund policy?\n   \n  How long does shipping take?  \n#skip\n";
        assert_eq!(
            parse_questions(text),
            vec!["What is the refund policy?", "How long does shipping take?"]
        );
    }

    #[test]
    fn test_load_questions_errors() {
        let missing = load_questions("/definitely/not/here.txt").unwrap_err();
        assert!(matches!(missing, ProducerError::QuestionsNotFound(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# only comments").unwrap();
        let empty = load_questions(file.path()).unwrap_err();
        assert!(matches!(empty, ProducerError::NoQuestions(_)));

        writeln!(file, "Is there a warranty?").unwrap();
        assert_eq!(load_questions(file.path()).unwrap(), vec!["Is there a warranty?"]);
    }

    #[test]
    fn test_empty_question_set_rejected() {
        let result = JobProducer::new(Arc::new(MemoryQueue::new()), Vec::new(), ProducerConfig::default());
        assert!(matches!(result, Err(ProducerError::NoQuestions(_))));
    }

    #[tokio::test]
    async fn test_sequential_run_pushes_in_order_with_unique_ids() {
        let queue = Arc::new(MemoryQueue::new());
        let config = ProducerConfig::default()
            .with_queue_name("jobs")
            .with_count(7)
            .with_order(QuestionOrder::Sequential);
        let mut producer = JobProducer::new(queue.clone(), questions(), config).unwrap();

        let report = producer.run().await.unwrap();
        assert_eq!(report.pushed, 7);
        assert_eq!(report.final_depth, Some(7));

        let jobs = drain(&queue, "jobs").await;
        assert_eq!(jobs.len(), 7);
        assert_eq!(jobs[0].question, "What is the refund policy?");
        assert_eq!(jobs[3].question, "What is the refund policy?");
        assert_eq!(jobs[5].question, "Do you ship abroad?");
        assert_eq!(report.last_job_id.as_deref(), Some(jobs[6].job_id.as_str()));

        let ids: HashSet<_> = jobs.iter().map(|j| j.job_id.clone()).collect();
        assert_eq!(ids.len(), 7);
        assert!(jobs.iter().all(|j| j.submitted_at.is_some()));
    }

    #[tokio::test]
    async fn test_seeded_random_runs_are_reproducible() {
        let mut picks = Vec::new();
        for _ in 0..2 {
            let queue = Arc::new(MemoryQueue::new());
            let config = ProducerConfig::default()
                .with_queue_name("jobs")
                .with_count(20)
                .with_seed(Some(42));
            JobProducer::new(queue.clone(), questions(), config)
                .unwrap()
                .run()
                .await
                .unwrap();
            let questions: Vec<String> =
                drain(&queue, "jobs").await.into_iter().map(|j| j.question).collect();
            picks.push(questions);
        }

        assert_eq!(picks[0], picks[1]);
        assert!(picks[0].iter().all(|q| questions().contains(q)));
    }

    #[tokio::test]
    async fn test_unavailable_transport_fails_run() {
        let queue = Arc::new(MemoryQueue::new());
        queue.set_unavailable(true);
        let mut producer =
            JobProducer::new(queue, questions(), ProducerConfig::default().with_count(1)).unwrap();

        assert!(matches!(
            producer.run().await,
            Err(ProducerError::Queue(_))
        ));
    }
}
