//! Tests against a live Redis server.
//!
//! Run with `REDIS_URL=redis://localhost:6379 cargo test -- --ignored`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rag_worker::rag::RagAnswer;
use rag_worker::scheduler::{
    generate_job_id, JobStatus, QueueTransport, RedisQueue, RedisResultBackend, ResultStore,
    SourceExcerpt,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Queue name unique to one test run.
fn scratch_queue(tag: &str) -> String {
    format!("rag:test:{}:{}", tag, generate_job_id())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_queue_is_fifo() {
    let queue = RedisQueue::connect(&redis_url()).await.unwrap();
    let name = scratch_queue("fifo");

    for payload in ["first", "second", "third"] {
        queue.push(&name, payload).await.unwrap();
    }
    assert_eq!(queue.length(&name).await.unwrap(), 3);

    let mut popped = Vec::new();
    while let Some(payload) = queue.blocking_pop(&name, Duration::from_secs(1)).await.unwrap() {
        popped.push(payload);
    }
    assert_eq!(popped, vec!["first", "second", "third"]);
    assert_eq!(queue.length(&name).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_empty_pop_waits_for_timeout() {
    let queue = RedisQueue::connect(&redis_url()).await.unwrap();
    let name = scratch_queue("empty");

    let started = Instant::now();
    let popped = queue.blocking_pop(&name, Duration::from_secs(1)).await.unwrap();
    assert!(popped.is_none());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_concurrent_poppers_never_share_a_payload() {
    let queue = RedisQueue::connect(&redis_url()).await.unwrap();
    let name = scratch_queue("race");
    for i in 0..100 {
        queue.push(&name, &format!("payload-{}", i)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = RedisQueue::connect(&redis_url()).await.unwrap();
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(p) = queue.blocking_pop(&name, Duration::from_secs(1)).await.unwrap() {
                seen.push(p);
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_result_record_expires_and_overwrites() {
    let backend = RedisResultBackend::connect(&redis_url()).await.unwrap();
    let store = ResultStore::new(Arc::new(backend), "worker-it")
        .with_prefix("rag:test:result:")
        .with_ttl(Duration::from_secs(120));
    let job_id = generate_job_id();

    store.write_error(&job_id, "first attempt failed").await.unwrap();
    let answer = RagAnswer {
        answer: "30 days".to_string(),
        sources: vec![SourceExcerpt::from_passage(
            "Refunds are accepted within 30 days.",
            serde_json::json!({"source": "policy.md"}),
        )],
    };
    store
        .write_success(&job_id, "What is the refund policy?", answer)
        .await
        .unwrap();

    let result = store.fetch(&job_id).await.unwrap().unwrap();
    assert_eq!(result.status(), JobStatus::Completed);
    assert_eq!(result.answer(), Some("30 days"));
    assert!(result.error_message().is_none(), "stale error field survived overwrite");

    let ttl = store.remaining_ttl(&job_id).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(120));
    assert!(ttl >= Duration::from_secs(110));
}
