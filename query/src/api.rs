//! Wire-contract payload shapes for the external interfaces (`POST
//! /v1/retrieve`, `GET /v1/debug/weights`, `GET /v1/health`). The gateway
//! that actually routes HTTP to these shapes is an external collaborator;
//! this crate only owns the request/response bodies it exchanges, same
//! division of labor as `ingestion::api` draws for the ingest endpoint.
//! `/v1/retrieve`'s contract is already `RetrieveRequest`/`RetrieveResponse`
//! in `dsl`/`engine` — nothing to add here.

use crate::engine::RetrievalEngine;
use alayasiki_core::config::RetrievalConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of the tunables behind a retrieval response, for `GET
/// /v1/debug/weights`. Mirrors `RetrievalConfig` field-for-field rather than
/// re-exporting it directly, so the wire contract doesn't shift if internal
/// config fields (timeouts, poll cadence) are added later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugWeightsResponse {
    pub seed_k: usize,
    pub hop_depth: u8,
    pub hop_fanout: usize,
    pub final_k: usize,
    pub alpha_vec: f32,
    pub beta_bm25: f32,
    pub gamma_graph: f32,
    pub delta_recency: f32,
    pub recency_halflife_days: f32,
    pub use_mmr: bool,
    pub mmr_lambda: f32,
    pub mmr_pool: usize,
    pub graph_bonus_map: HashMap<String, f32>,
}

impl From<&RetrievalConfig> for DebugWeightsResponse {
    fn from(cfg: &RetrievalConfig) -> Self {
        Self {
            seed_k: cfg.seed_k,
            hop_depth: cfg.hop_depth,
            hop_fanout: cfg.hop_fanout,
            final_k: cfg.final_k,
            alpha_vec: cfg.alpha_vec,
            beta_bm25: cfg.beta_bm25,
            gamma_graph: cfg.gamma_graph,
            delta_recency: cfg.delta_recency,
            recency_halflife_days: cfg.recency_halflife_days,
            use_mmr: cfg.use_mmr,
            mmr_lambda: cfg.mmr_lambda,
            mmr_pool: cfg.mmr_pool,
            graph_bonus_map: cfg.graph_bonus_map.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: HealthStatus::Ok,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RetrievalEngine {
    /// Body for `GET /v1/debug/weights`: the pipeline knobs active for this
    /// engine instance, for operators diagnosing a scoring result.
    pub fn debug_weights(&self) -> DebugWeightsResponse {
        DebugWeightsResponse::from(self.current_config())
    }

    /// Body for `GET /v1/health`. Liveness only — this crate never reaches
    /// the store or the embedding service to answer it, since a slow
    /// dependency shouldn't flip the gateway's liveness probe.
    pub fn health(&self) -> HealthResponse {
        HealthResponse::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_weights_mirrors_config_defaults() {
        let cfg = RetrievalConfig::default();
        let weights = DebugWeightsResponse::from(&cfg);
        assert_eq!(weights.final_k, cfg.final_k);
        assert_eq!(weights.mmr_lambda, cfg.mmr_lambda);
        assert_eq!(weights.graph_bonus_map, cfg.graph_bonus_map);
    }

    #[test]
    fn health_response_defaults_to_ok() {
        let health = HealthResponse::default();
        assert_eq!(health.status, HealthStatus::Ok);
        assert!(!health.version.is_empty());
    }
}
