//! Vector-search RAG pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::index::VectorIndex;
use super::{Passage, RagPipeline};
use crate::error::{LlmError, PipelineError};
use crate::llm::{Embedder, GenerationRequest, LlmProvider, Message};
use crate::metrics::MetricsRegistry;

/// Default number of passages retrieved per question.
pub const DEFAULT_TOP_K: usize = 4;

/// Sampling temperature for answer generation.
pub const GENERATION_TEMPERATURE: f64 = 0.1;

/// Answer the model is told to give when the context does not cover the
/// question.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I don't have enough information to answer this question.";

/// Prompt template. `{insufficient}`, `{context}` and `{question}` are
/// substituted in a single pass.
pub const RAG_PROMPT: &str = r#"You are a helpful assistant that answers questions based on the provided context.
Use only the information from the context to answer. If the context doesn't contain
enough information to answer, say "{insufficient}"

Context:
{context}

Question: {question}

Answer:"#;

/// Separator placed between numbered context blocks.
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Formats passages as `[1] ...`, `[2] ...` blocks.
pub fn build_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {}", i + 1, p.content))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Renders the full generation prompt.
pub fn build_prompt(question: &str, passages: &[Passage]) -> String {
    let context = build_context(passages);
    render(
        RAG_PROMPT,
        &[
            ("insufficient", INSUFFICIENT_CONTEXT_ANSWER),
            ("context", context.as_str()),
            ("question", question),
        ],
    )
}

/// Substitutes `{name}` placeholders. Substituted text is never rescanned,
/// so braces inside passages or questions come through verbatim.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let var = vars
            .iter()
            .find(|(name, _)| tail.starts_with(name) && tail[name.len()..].starts_with('}'));
        match var {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Pipeline backed by a local vector index, an embedder and a chat model.
///
/// The index is loaded on first use and shared by every later call.
pub struct VectorRagPipeline {
    index_dir: PathBuf,
    index: OnceCell<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmProvider>,
    metrics: MetricsRegistry,
    top_k: usize,
}

impl VectorRagPipeline {
    pub fn new(
        index_dir: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmProvider>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            index_dir: index_dir.into(),
            index: OnceCell::new(),
            embedder,
            llm,
            metrics,
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Sets the number of passages retrieved per question.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Whether the index has been loaded.
    pub fn is_initialized(&self) -> bool {
        self.index.initialized()
    }

    async fn index(&self) -> Result<&VectorIndex, PipelineError> {
        self.index
            .get_or_try_init(|| async {
                info!(index_dir = %self.index_dir.display(), "Loading vector index");
                let index = VectorIndex::load(&self.index_dir)?;
                info!(
                    passages = index.len(),
                    dimension = index.dimension(),
                    "Vector index loaded"
                );
                Ok::<_, PipelineError>(index)
            })
            .await
    }
}

#[async_trait]
impl RagPipeline for VectorRagPipeline {
    async fn initialize(&self) -> Result<(), PipelineError> {
        self.index().await.map(|_| ())
    }

    fn top_k(&self) -> usize {
        self.top_k
    }

    async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<Passage>, PipelineError> {
        let index = self.index().await?;

        let start = Instant::now();
        let result = async {
            let query = self
                .embedder
                .embed_query(question)
                .await
                .map_err(PipelineError::Embedding)?;
            index
                .search(&query, top_k)
                .map_err(|e| PipelineError::Retrieval(e.to_string()))
        }
        .await;
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_retrieval_latency(elapsed);

        let hits = result?;
        debug!(docs = hits.len(), elapsed_secs = elapsed, "Retrieved passages");
        Ok(hits.into_iter().map(|h| h.passage).collect())
    }

    async fn generate(&self, question: &str, context: &[Passage]) -> Result<String, PipelineError> {
        let request = GenerationRequest::new("", vec![Message::user(build_prompt(question, context))])
            .with_temperature(GENERATION_TEMPERATURE);

        let start = Instant::now();
        let result = self.llm.generate(request).await;
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_llm_latency(elapsed);

        let response = result.map_err(PipelineError::Generation)?;
        debug!(model = %response.model, elapsed_secs = elapsed, "Generated answer");

        response
            .first_content()
            .map(|content| content.trim().to_string())
            .ok_or_else(|| PipelineError::Generation(LlmError::EmptyResponse(response.model.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use crate::llm::{Choice, GenerationResponse};
    use crate::rag::INDEX_FILE;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Maps a fixed vocabulary onto axis vectors.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("refund") { 1.0 } else { 0.0 },
                        if t.contains("ship") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Err(LlmError::RequestFailed("connection refused".to_string()))
        }
    }

    /// Records prompts and replies with a fixed answer.
    #[derive(Default)]
    struct RecordingLlm {
        prompts: Mutex<Vec<GenerationRequest>>,
        reply: Option<String>,
    }

    #[async_trait]
    impl LlmProvider for RecordingLlm {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.prompts.lock().unwrap().push(request);
            let choices = self
                .reply
                .iter()
                .map(|content| Choice {
                    index: 0,
                    message: Message {
                        role: "assistant".to_string(),
                        content: content.clone(),
                    },
                    finish_reason: Some("stop".to_string()),
                })
                .collect();
            Ok(GenerationResponse {
                model: "stub".to_string(),
                choices,
                usage: None,
            })
        }
    }

    fn write_index(dir: &TempDir) {
        let index = json!({
            "dimension": 3,
            "entries": [
                {"content": "Refunds are accepted within 30 days of purchase.", "metadata": {"source": "refunds.md"}, "embedding": [1.0, 0.0, 0.1]},
                {"content": "Standard shipping takes 5 business days.", "metadata": {"source": "shipping.md"}, "embedding": [0.0, 1.0, 0.1]},
                {"content": "Our office is closed on holidays.", "metadata": {"source": "hours.md"}, "embedding": [0.0, 0.0, 1.0]}
            ]
        });
        std::fs::write(dir.path().join(INDEX_FILE), index.to_string()).unwrap();
    }

    fn pipeline(
        dir: &TempDir,
        embedder: Arc<dyn Embedder>,
        reply: Option<&str>,
    ) -> (VectorRagPipeline, Arc<RecordingLlm>, MetricsRegistry) {
        let llm = Arc::new(RecordingLlm {
            reply: reply.map(String::from),
            ..Default::default()
        });
        let metrics = MetricsRegistry::new().unwrap();
        let pipeline = VectorRagPipeline::new(dir.path(), embedder, llm.clone(), metrics.clone());
        (pipeline, llm, metrics)
    }

    #[test]
    fn test_prompt_format() {
        let passages = vec![
            Passage::new("first", json!({})),
            Passage::new("second", json!({})),
        ];
        assert_eq!(build_context(&passages), "[1] first\n\n---\n\n[2] second");

        let prompt = build_prompt("What is it?", &passages);
        assert!(prompt.contains(INSUFFICIENT_CONTEXT_ANSWER));
        assert!(prompt.contains("Context:\n[1] first"));
        assert!(prompt.ends_with("Question: What is it?\n\nAnswer:"));
    }

    #[test]
    fn test_prompt_keeps_placeholders_inside_passages() {
        let passages = vec![Passage::new("Use {question} and {context} literally {", json!({}))];
        let prompt = build_prompt("Why {braces}?", &passages);

        assert!(prompt.contains("[1] Use {question} and {context} literally {"));
        assert!(prompt.contains("Question: Why {braces}?"));
        assert_eq!(prompt.matches("Why {braces}?").count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_index(&dir);
        let (pipeline, _, _) = pipeline(&dir, Arc::new(KeywordEmbedder), Some("ok"));

        assert!(!pipeline.is_initialized());
        pipeline.initialize().await.unwrap();
        pipeline.initialize().await.unwrap();
        assert!(pipeline.is_initialized());
    }

    #[tokio::test]
    async fn test_missing_index_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _, _) = pipeline(&dir, Arc::new(KeywordEmbedder), Some("ok"));

        let err = pipeline.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Initialization(IndexError::NotFound(_))
        ));
        assert!(!pipeline.is_initialized());
    }

    #[tokio::test]
    async fn test_retrieve_ranks_relevant_passage_first() {
        let dir = TempDir::new().unwrap();
        write_index(&dir);
        let (pipeline, _, metrics) = pipeline(&dir, Arc::new(KeywordEmbedder), Some("ok"));

        let passages = pipeline.retrieve("What is the refund policy?", 2).await.unwrap();
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].metadata["source"], "refunds.md");
        assert_eq!(metrics.retrieval_latency_count(), 1);
    }

    #[tokio::test]
    async fn test_answer_runs_both_stages() {
        let dir = TempDir::new().unwrap();
        write_index(&dir);
        let (pipeline, llm, metrics) = pipeline(
            &dir,
            Arc::new(KeywordEmbedder),
            Some("  Refunds are accepted within 30 days.  "),
        );
        let pipeline = pipeline.with_top_k(1);

        let answer = pipeline.answer("How do refunds work?").await.unwrap();
        assert_eq!(answer.answer, "Refunds are accepted within 30 days.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(
            answer.sources[0].content,
            "Refunds are accepted within 30 days of purchase...."
        );

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].temperature, Some(GENERATION_TEMPERATURE));
        assert!(prompts[0].messages[0]
            .content
            .contains("[1] Refunds are accepted within 30 days of purchase."));
        assert_eq!(metrics.llm_latency_count(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        write_index(&dir);
        let (pipeline, _, metrics) = pipeline(&dir, Arc::new(FailingEmbedder), Some("ok"));

        let err = pipeline.answer("anything").await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
        assert_eq!(metrics.retrieval_latency_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_completion_is_generation_error() {
        let dir = TempDir::new().unwrap();
        write_index(&dir);
        let (pipeline, _, _) = pipeline(&dir, Arc::new(KeywordEmbedder), None);

        let err = pipeline.generate("q", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Generation(LlmError::EmptyResponse(_))
        ));
    }
}
