//! HTTP clients for the model backends used by the RAG pipeline.
//!
//! Both clients speak the OpenAI wire format, so the same code drives a local
//! Ollama server, a LiteLLM proxy or a hosted provider.
//!
//! ```ignore
//! use rag_worker::llm::{BackendConfig, ChatClient, GenerationRequest, LlmProvider, Message};
//!
//! let client = ChatClient::new(BackendConfig::new("http://localhost:11434/v1", "mistral"))?;
//! let request = GenerationRequest::new("", vec![Message::user("Hello")]).with_temperature(0.1);
//! let response = client.generate(request).await?;
//! ```

pub mod chat;
pub mod embeddings;

pub use chat::{
    BackendConfig, ChatClient, Choice, GenerationRequest, GenerationResponse, LlmProvider,
    Message, Usage, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL, DEFAULT_REQUEST_TIMEOUT,
};
pub use embeddings::{
    Embedder, EmbeddingClient, DEFAULT_EMBEDDING_BASE_URL, DEFAULT_EMBEDDING_MODEL,
};
