//! CLI command definitions for rag-worker.
//!
//! Every option can also be set through the environment variable named in
//! its help text, which is how container deployments configure the worker.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::llm::{
    BackendConfig, ChatClient, EmbeddingClient, DEFAULT_EMBEDDING_BASE_URL,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL,
};
use crate::metrics::{MetricsRegistry, MetricsServer, QueueDepthSampler};
use crate::rag::{RagPipeline, VectorRagPipeline, DEFAULT_INDEX_DIR, DEFAULT_TOP_K};
use crate::scheduler::{
    load_questions, resolve_worker_id, JobOutcome, JobProducer, ProducerConfig, QuestionOrder,
    RedisQueue, RedisResultBackend, ResultStore, WorkerConfig, WorkerRuntime,
    DEFAULT_QUEUE_NAME, DEFAULT_RESULT_PREFIX,
};

/// Default Redis URL.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default questions file for the load generator.
const DEFAULT_QUESTIONS_FILE: &str = "./data/sample_questions.txt";

/// Distributed RAG job worker.
#[derive(Parser)]
#[command(name = "rag-worker")]
#[command(about = "Answer questions from a Redis job queue with retrieval-augmented generation")]
#[command(version)]
#[command(
    long_about = "rag-worker pulls question jobs from a Redis list, answers them with a retrieve-then-generate pipeline, and stores results with a TTL.\n\nExample usage:\n  rag-worker worker --index-dir ./data/faiss_index\n  rag-worker push -n 100 --questions ./data/sample_questions.txt\n  rag-worker result job_1a2b3c4d"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker until SIGINT/SIGTERM.
    Worker(Box<WorkerArgs>),

    /// Push synthetic jobs onto the queue.
    #[command(alias = "loadgen")]
    Push(PushArgs),

    /// Show the stored result for a job.
    Result(ResultArgs),
}

/// Redis connection options shared by all subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct RedisArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Name of the job queue list.
    #[arg(long, env = "QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,

    /// Key prefix for result records.
    #[arg(long, env = "RESULT_PREFIX", default_value = DEFAULT_RESULT_PREFIX)]
    pub result_prefix: String,
}

/// Arguments for `rag-worker worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Seconds a result record is kept.
    #[arg(long, env = "RESULT_TTL", default_value = "3600")]
    pub result_ttl: u64,

    /// Seconds one blocking pop waits for a job.
    #[arg(long, env = "BRPOP_TIMEOUT", default_value = "5")]
    pub brpop_timeout: u64,

    /// Worker identity (defaults to $HOSTNAME, then "worker-local").
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Port of the Prometheus metrics endpoint.
    #[arg(long, env = "METRICS_PORT", default_value = "8000")]
    pub metrics_port: u16,

    /// Seconds between queue-depth samples.
    #[arg(long, env = "METRICS_SAMPLE_INTERVAL", default_value = "5")]
    pub metrics_sample_interval: u64,

    /// Passages retrieved per question.
    #[arg(long, env = "TOP_K", default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Directory holding the vector index artifact.
    #[arg(long, env = "INDEX_DIR", default_value = DEFAULT_INDEX_DIR)]
    pub index_dir: PathBuf,

    /// Base URL of the OpenAI-compatible embedding server.
    #[arg(long, env = "EMBEDDING_BASE_URL", default_value = DEFAULT_EMBEDDING_BASE_URL)]
    pub embedding_base_url: String,

    /// Embedding model name.
    #[arg(long, env = "EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    pub embedding_model: String,

    /// Base URL of the OpenAI-compatible chat server.
    #[arg(long, env = "LLM_BASE_URL", default_value = DEFAULT_LLM_BASE_URL)]
    pub llm_base_url: String,

    /// Chat model name.
    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_LLM_MODEL)]
    pub llm_model: String,

    /// Bearer token for the model servers.
    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Seconds before a model request is abandoned.
    #[arg(long, default_value = "120")]
    pub request_timeout: u64,

    /// Seconds between Redis connection attempts at startup.
    #[arg(long, default_value = "5")]
    pub connect_retry: u64,
}

/// Arguments for `rag-worker push`.
#[derive(Parser, Debug)]
pub struct PushArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Number of jobs to push.
    #[arg(short = 'n', long, default_value = "50")]
    pub count: usize,

    /// Delay between jobs in seconds.
    #[arg(short = 'd', long, default_value = "0")]
    pub delay: f64,

    /// Path to the questions file.
    #[arg(short = 'q', long, default_value = DEFAULT_QUESTIONS_FILE)]
    pub questions: PathBuf,

    /// Use questions in file order instead of sampling randomly.
    #[arg(long)]
    pub sequential: bool,

    /// Seed for reproducible random sampling.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `rag-worker result`.
#[derive(Parser, Debug)]
pub struct ResultArgs {
    /// Job id to look up.
    pub job_id: String,

    #[command(flatten)]
    pub redis: RedisArgs,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(*args).await,
        Commands::Push(args) => run_push_command(args).await,
        Commands::Result(args) => run_result_command(args).await,
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let worker_id = resolve_worker_id(args.worker_id.clone());
    let queue_name = args.redis.queue_name.clone();

    info!(
        worker_id = %worker_id,
        redis = %args.redis.redis_url,
        queue = %queue_name,
        "RAG worker starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown requested; finishing current job");
            shutdown.cancel();
        }
    });

    let metrics = MetricsRegistry::new().context("Failed to register metrics")?;
    let server = MetricsServer::bind(args.metrics_port, metrics.clone()).await?;
    let server_handle = tokio::spawn(server.run(shutdown.clone()));

    let pipeline = build_pipeline(&args, metrics.clone())?;
    info!(index_dir = %args.index_dir.display(), "Initializing RAG pipeline");
    pipeline
        .initialize()
        .await
        .context("Failed to initialize RAG pipeline")?;
    info!("RAG pipeline ready");

    let retry = Duration::from_secs(args.connect_retry.max(1));
    let redis_url = args.redis.redis_url.as_str();
    let Some(queue) = connect_with_retry("queue", retry, &shutdown, || {
        RedisQueue::connect(redis_url)
    })
    .await
    else {
        info!("Shutdown before Redis became reachable");
        return Ok(());
    };
    let Some(sampler_queue) = connect_with_retry("sampler", retry, &shutdown, || {
        RedisQueue::connect(redis_url)
    })
    .await
    else {
        return Ok(());
    };
    info!(queue = %queue_name, "Connected to Redis");

    let results = ResultStore::new(
        Arc::new(RedisResultBackend::from_connection(queue.connection())),
        worker_id.clone(),
    )
    .with_prefix(args.redis.result_prefix.clone())
    .with_ttl(Duration::from_secs(args.result_ttl));

    let sampler_handle =
        QueueDepthSampler::new(Arc::new(sampler_queue), queue_name.clone(), metrics.clone())
            .with_interval(Duration::from_secs(args.metrics_sample_interval.max(1)))
            .spawn(shutdown.clone());

    let config = WorkerConfig::default()
        .with_queue_name(queue_name)
        .with_pop_timeout(Duration::from_secs(args.brpop_timeout))
        .with_worker_id(worker_id);
    let runtime = WorkerRuntime::new(config, Arc::new(queue), pipeline, results, metrics);

    let summary = runtime.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sampler_handle.await {
        warn!(error = %e, "Queue depth collector task failed");
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Metrics endpoint stopped with an error"),
        Err(e) => warn!(error = %e, "Metrics endpoint task failed"),
    }

    info!(
        completed = summary.jobs_completed,
        failed = summary.jobs_failed,
        discarded = summary.payloads_discarded,
        "Shutdown complete"
    );
    Ok(())
}

fn build_pipeline(
    args: &WorkerArgs,
    metrics: MetricsRegistry,
) -> anyhow::Result<Arc<VectorRagPipeline>> {
    let timeout = Duration::from_secs(args.request_timeout.max(1));

    let embedder = EmbeddingClient::new(
        BackendConfig::new(&args.embedding_base_url, &args.embedding_model)
            .with_api_key(args.llm_api_key.clone())
            .with_timeout(timeout),
    )
    .context("Failed to create embedding client")?;

    let llm = ChatClient::new(
        BackendConfig::new(&args.llm_base_url, &args.llm_model)
            .with_api_key(args.llm_api_key.clone())
            .with_timeout(timeout),
    )
    .context("Failed to create LLM client")?;

    info!(
        embedding_model = %embedder.model(),
        llm_model = %llm.default_model(),
        llm_base_url = %llm.base_url(),
        "Model backends configured"
    );

    Ok(Arc::new(
        VectorRagPipeline::new(&args.index_dir, Arc::new(embedder), Arc::new(llm), metrics)
            .with_top_k(args.top_k),
    ))
}

/// Retries `connect` until it succeeds or `shutdown` fires.
async fn connect_with_retry<T, E, F, Fut>(
    purpose: &str,
    delay: Duration,
    shutdown: &CancellationToken,
    connect: F,
) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    loop {
        match connect().await {
            Ok(conn) => return Some(conn),
            Err(e) => warn!(
                purpose,
                error = %e,
                retry_secs = delay.as_secs(),
                "Redis not reachable, retrying"
            ),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}

// ============================================================================
// Push
// ============================================================================

async fn run_push_command(args: PushArgs) -> anyhow::Result<()> {
    let questions = load_questions(&args.questions)?;

    let queue = RedisQueue::connect(&args.redis.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", args.redis.redis_url))?;

    let config = ProducerConfig::default()
        .with_queue_name(args.redis.queue_name.clone())
        .with_count(args.count)
        .with_delay(Duration::from_secs_f64(args.delay.max(0.0)))
        .with_order(if args.sequential {
            QuestionOrder::Sequential
        } else {
            QuestionOrder::Random
        })
        .with_seed(args.seed);

    let mut producer = JobProducer::new(Arc::new(queue), questions, config)?;
    let report = producer.run().await?;

    if args.json {
        let output = serde_json::json!({
            "pushed": report.pushed,
            "queue": args.redis.queue_name,
            "last_job_id": report.last_job_id,
            "elapsed_secs": report.elapsed.as_secs_f64(),
            "final_depth": report.final_depth,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "Pushed {} jobs to {} in {:.2}s",
        report.pushed,
        args.redis.queue_name,
        report.elapsed.as_secs_f64()
    );
    if let Some(depth) = report.final_depth {
        println!("Final queue depth: {}", depth);
    }
    if let Some(job_id) = report.last_job_id {
        println!();
        println!("To check a result:");
        println!("  rag-worker result {}", job_id);
    }
    Ok(())
}

// ============================================================================
// Result
// ============================================================================

async fn run_result_command(args: ResultArgs) -> anyhow::Result<()> {
    let backend = RedisResultBackend::connect(&args.redis.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", args.redis.redis_url))?;
    let store = ResultStore::new(Arc::new(backend), "").with_prefix(args.redis.result_prefix);

    let result = store
        .fetch(&args.job_id)
        .await
        .with_context(|| format!("Failed to read result for {}", args.job_id))?;
    let ttl = store.remaining_ttl(&args.job_id).await.ok().flatten();

    let Some(result) = result else {
        if args.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job_id": args.job_id,
                    "status": "pending",
                }))?
            );
        } else {
            println!("No result for {} (pending, unknown or expired)", args.job_id);
        }
        return Ok(());
    };

    if args.json {
        let mut output = serde_json::json!({
            "job_id": result.job_id,
            "status": result.status().to_string(),
            "worker_id": result.worker_id,
            "completed_at": result.completed_at_rfc3339(),
            "ttl_secs": ttl.map(|t| t.as_secs()),
        });
        match &result.outcome {
            JobOutcome::Completed {
                question,
                answer,
                sources,
            } => {
                output["question"] = serde_json::json!(question);
                output["answer"] = serde_json::json!(answer);
                output["sources"] = serde_json::to_value(sources)?;
            }
            JobOutcome::Error { message } => {
                output["error"] = serde_json::json!(message);
            }
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Job:        {}", result.job_id);
    println!("Status:     {}", result.status());
    println!("Worker:     {}", result.worker_id);
    println!("Completed:  {}", result.completed_at_rfc3339());
    if let Some(ttl) = ttl {
        println!("Expires in: {}s", ttl.as_secs());
    }
    match &result.outcome {
        JobOutcome::Completed {
            question,
            answer,
            sources,
        } => {
            println!();
            println!("Q: {}", question);
            println!("A: {}", answer);
            for (i, source) in sources.iter().enumerate() {
                println!("  [{}] {}", i + 1, source.content);
            }
        }
        JobOutcome::Error { message } => {
            println!("Error:      {}", message);
        }
    }
    Ok(())
}
