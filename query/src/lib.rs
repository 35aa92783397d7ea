pub mod api;
pub mod dsl;
pub mod embedding_client;
pub mod engine;

pub use api::{DebugWeightsResponse, HealthResponse, HealthStatus};
pub use dsl::{RetrieveMode, RetrieveRequest, RetrieveValidationError};
pub use embedding_client::{
    DeterministicEmbeddingClient, EmbeddingClient, EmbeddingError, EmbeddingResponse, HttpEmbeddingClient,
};
pub use engine::{DebugEnvelope, QueryError, RetrievalEngine, RetrieveResponse, RetrievedSpan};
