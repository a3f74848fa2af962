//! Text embedding client.
//!
//! Posts to `{base}/embeddings` in the OpenAI request shape, which Ollama,
//! LiteLLM and most hosted providers accept.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::chat::{api_error, BackendConfig};
use crate::error::LlmError;

/// Default base URL for the embedding backend.
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "http://localhost:11434/v1";

/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Turns text into dense vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Embeds a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::EmptyResponse("embedding".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Orders response vectors by their reported index and checks the count.
fn collect_vectors(
    mut data: Vec<EmbeddingData>,
    expected: usize,
    model: &str,
) -> Result<Vec<Vec<f32>>, LlmError> {
    if data.len() != expected {
        return Err(LlmError::ParseError(format!(
            "expected {} embeddings from '{}', got {}",
            expected,
            model,
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

/// Embedding client for OpenAI-compatible servers.
pub struct EmbeddingClient {
    config: BackendConfig,
    http_client: Client,
}

impl EmbeddingClient {
    /// Creates a client.
    pub fn new(config: BackendConfig) -> Result<Self, LlmError> {
        let http_client = config.http_client()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Embedding model in use.
    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let mut http_request = self
            .http_client
            .post(self.config.endpoint("embeddings"))
            .json(&body);
        if let Some(ref api_key) = self.config.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let http_response = http_request
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let body = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(api_error(status.as_u16(), body));
        }

        let parsed: EmbeddingResponse = http_response.json().await.map_err(|e| {
            LlmError::ParseError(format!("Failed to parse embedding response: {}", e))
        })?;

        collect_vectors(parsed.data, texts.len(), &self.config.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[test]
    fn test_vectors_are_reordered_by_index() {
        let body = r#"{"data":[{"index":1,"embedding":[2.0]},{"index":0,"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        let vectors = collect_vectors(parsed.data, 2, "m").unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_count_mismatch_is_parse_error() {
        let body = r#"{"data":[{"index":0,"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        let err = collect_vectors(parsed.data, 3, "m").unwrap_err();
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_embed_query_uses_batch() {
        let vector = FixedEmbedder.embed_query("abc").await.unwrap();
        assert_eq!(vector, vec![3.0, 1.0]);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let client = EmbeddingClient::new(BackendConfig::new("http://127.0.0.1:9", "m")).unwrap();
        assert!(client.embed(&[]).await.unwrap().is_empty());
        assert_eq!(client.model(), "m");
    }
}
