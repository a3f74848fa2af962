//! Retrieval-augmented generation.
//!
//! The worker only depends on the [`RagPipeline`] trait. The concrete
//! [`VectorRagPipeline`] embeds the question, searches a local vector index
//! and asks an OpenAI-compatible chat model to answer from the retrieved
//! passages.
//!
//! # Example
//!
//! ```ignore
//! use rag_worker::rag::{RagPipeline, VectorRagPipeline};
//!
//! let pipeline = VectorRagPipeline::new("./data/faiss_index", embedder, llm, metrics);
//! pipeline.initialize().await?;
//! let answer = pipeline.answer("What is the refund policy?").await?;
//! println!("{} ({} sources)", answer.answer, answer.sources.len());
//! ```

pub mod index;
pub mod pipeline;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::scheduler::SourceExcerpt;

pub use index::{ScoredPassage, VectorIndex, DEFAULT_INDEX_DIR, INDEX_FILE};
pub use pipeline::{
    build_context, build_prompt, VectorRagPipeline, DEFAULT_TOP_K, GENERATION_TEMPERATURE,
    INSUFFICIENT_CONTEXT_ANSWER, RAG_PROMPT,
};

/// A retrieved unit of source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Passage {
    pub fn new(content: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }
}

/// Output of a full retrieve-then-generate run.
#[derive(Debug, Clone, PartialEq)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<SourceExcerpt>,
}

/// Two-stage question answering contract used by the worker.
#[async_trait]
pub trait RagPipeline: Send + Sync {
    /// Prepares the pipeline. Safe to call more than once; only the first
    /// call does any work.
    async fn initialize(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Number of passages `answer` retrieves.
    fn top_k(&self) -> usize {
        DEFAULT_TOP_K
    }

    /// Returns up to `top_k` passages ranked by relevance. An empty result is
    /// valid.
    async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<Passage>, PipelineError>;

    /// Produces an answer grounded in `context`.
    async fn generate(&self, question: &str, context: &[Passage]) -> Result<String, PipelineError>;

    /// Retrieves, then generates.
    async fn answer(&self, question: &str) -> Result<RagAnswer, PipelineError> {
        let passages = self.retrieve(question, self.top_k()).await?;
        let answer = self.generate(question, &passages).await?;

        Ok(RagAnswer {
            answer,
            sources: passages
                .into_iter()
                .map(|p| SourceExcerpt::from_passage(&p.content, p.metadata))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoPipeline;

    #[async_trait]
    impl RagPipeline for EchoPipeline {
        fn top_k(&self) -> usize {
            2
        }

        async fn retrieve(
            &self,
            question: &str,
            top_k: usize,
        ) -> Result<Vec<Passage>, PipelineError> {
            Ok((0..top_k)
                .map(|i| Passage::new(format!("{} #{}", question, i), json!({ "rank": i })))
                .collect())
        }

        async fn generate(
            &self,
            question: &str,
            context: &[Passage],
        ) -> Result<String, PipelineError> {
            Ok(format!("{} from {} passages", question, context.len()))
        }
    }

    #[tokio::test]
    async fn test_answer_combines_both_stages() {
        let pipeline = EchoPipeline;
        pipeline.initialize().await.unwrap();

        let answer = pipeline.answer("why").await.unwrap();
        assert_eq!(answer.answer, "why from 2 passages");
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.sources[1].metadata, json!({"rank": 1}));
        assert!(answer.sources[0].content.starts_with("why #0"));
    }

    #[test]
    fn test_passage_metadata_defaults_to_null() {
        let passage: Passage = serde_json::from_str(r#"{"content":"text"}"#).unwrap();
        assert!(passage.metadata.is_null());
    }
}
