use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, text: &'a str, model_id: &'a str) -> BoxFuture<'a, Vec<f32>>;
}

pub struct DeterministicEmbedder {
    dims: usize,
}

impl DeterministicEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new(768)
    }
}

impl Embedder for DeterministicEmbedder {
    fn embed<'a>(&'a self, text: &'a str, model_id: &'a str) -> BoxFuture<'a, Vec<f32>> {
        let text = text.to_string();
        let model_id = model_id.to_string();
        let dims = self.dims; // Capture copy

        Box::pin(async move {
            alayasiki_core::embedding::deterministic_embedding(&text, &model_id, dims)
        })
    }
}

/// Calls an external embedding service over HTTP. Falls back to the
/// deterministic embedder if the request fails, so ingestion never blocks
/// on an embedding provider outage (spec §4.2 callers treat the vector seed
/// as one signal among several, not a hard dependency).
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    fallback: DeterministicEmbedder,
}

#[derive(serde::Serialize)]
struct EmbedHttpRequest<'a> {
    text: &'a str,
    model: &'a str,
}

#[derive(serde::Deserialize)]
struct EmbedHttpResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, fallback_dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            fallback: DeterministicEmbedder::new(fallback_dims),
        }
    }
}

impl Embedder for HttpEmbedder {
    fn embed<'a>(&'a self, text: &'a str, model_id: &'a str) -> BoxFuture<'a, Vec<f32>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&EmbedHttpRequest { text, model: model_id })
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match response {
                Ok(resp) => match resp.json::<EmbedHttpResponse>().await {
                    Ok(body) if !body.embedding.is_empty() => body.embedding,
                    _ => self.fallback.embed(text, model_id).await,
                },
                Err(err) => {
                    tracing::warn!("embedding service call failed, using deterministic fallback: {err}");
                    self.fallback.embed(text, model_id).await
                }
            }
        })
    }
}
