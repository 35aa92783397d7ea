use alayasiki_core::error::{AlayasikiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, serde::Deserialize)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub dimension: usize,
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding service returned no vectors")]
    Empty,
}

impl AlayasikiError for EmbeddingError {
    fn error_code(&self) -> ErrorCode {
        match self {
            EmbeddingError::Timeout => ErrorCode::ResourceExhausted,
            EmbeddingError::Request(_) | EmbeddingError::Empty => ErrorCode::UpstreamUnavailable,
        }
    }
}

/// Turns query text into vectors for Stage 1's vector seed (spec §6). An
/// HTTP implementation calls an external embedding server; the deterministic
/// implementation wraps `alayasiki_core::embedding::deterministic_embedding`
/// for tests and local-dev runs with no `EMBEDDING_URL` configured — the same
/// trait-seam shape `ingestion::embedding::Embedder` uses.
#[async_trait::async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResponse, EmbeddingError>;
}

pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct EmbedRequestBody<'a> {
    texts: &'a [String],
}

#[async_trait::async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResponse, EmbeddingError> {
        let url = format!("{}/v1/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequestBody { texts })
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        if body.embeddings.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        Ok(body)
    }
}

pub struct DeterministicEmbeddingClient {
    dims: usize,
    model_id: String,
}

impl DeterministicEmbeddingClient {
    pub fn new(dims: usize, model_id: impl Into<String>) -> Self {
        Self { dims: dims.max(1), model_id: model_id.into() }
    }
}

impl Default for DeterministicEmbeddingClient {
    fn default() -> Self {
        Self::new(768, "embedding-default-v1")
    }
}

#[async_trait::async_trait]
impl EmbeddingClient for DeterministicEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResponse, EmbeddingError> {
        let embeddings: Vec<Vec<f32>> = texts
            .iter()
            .map(|text| alayasiki_core::embedding::deterministic_embedding(text, &self.model_id, self.dims))
            .collect();
        Ok(EmbeddingResponse { dimension: self.dims, embeddings })
    }
}
