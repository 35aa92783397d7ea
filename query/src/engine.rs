use crate::dsl::{RetrieveRequest, RetrieveValidationError};
use crate::embedding_client::{EmbeddingClient, EmbeddingError};
use alayasiki_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use alayasiki_core::config::RetrievalConfig;
use alayasiki_core::error::{AlayasikiError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use storage::{parse_query, HydratedSpan, RepoError, Repository, SpanFeatures};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSpan {
    pub id: u64,
    pub artifact_id: u64,
    pub text: String,
    pub start_char: u32,
    pub end_char: u32,
    pub confidence: f32,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugEnvelope {
    pub seed_spans: usize,
    pub seed_nodes: usize,
    pub expanded_nodes_count: usize,
    pub candidate_spans_count: usize,
    pub allowed_spans_count: usize,
    pub returned: usize,
    pub mmr_enabled: bool,
    pub mmr_lambda: f32,
    pub mmr_pool: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub org_id: String,
    pub query: String,
    pub top_k: usize,
    pub results: Vec<RetrievedSpan>,
    pub debug: DebugEnvelope,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RetrieveValidationError),
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),
    #[error("embedding service error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("request timed out")]
    Timeout,
}

impl AlayasikiError for QueryError {
    fn error_code(&self) -> ErrorCode {
        match self {
            QueryError::InvalidRequest(err) => err.error_code(),
            QueryError::Repository(err) => err.error_code(),
            QueryError::Embedding(err) => err.error_code(),
            QueryError::Timeout => ErrorCode::ResourceExhausted,
        }
    }
}

/// The seven-stage evidence retrieval pipeline (spec §4.2): seed, derive
/// seed nodes, BFS-expand the graph, collect candidate spans, extract
/// features, filter by ACL, then score/rank/MMR-diversify/hydrate. One
/// struct, one long explicitly-ordered method per stage — the stages are the
/// algorithm, not independently swappable strategies (ground: donor
/// `query::engine::QueryEngine::execute_with_plan`).
pub struct RetrievalEngine {
    repo: Arc<Repository>,
    config: RetrievalConfig,
    embedding_client: Arc<dyn EmbeddingClient>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    clock_override: Option<i64>,
}

impl RetrievalEngine {
    pub fn new(repo: Arc<Repository>, config: RetrievalConfig, embedding_client: Arc<dyn EmbeddingClient>) -> Self {
        Self { repo, config, embedding_client, audit_sink: None, clock_override: None }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Pins the recency clock to a fixed Unix timestamp instead of
    /// wall-clock `now()`, so halflife decay is reproducible in tests
    /// without sleeping.
    pub fn with_clock(mut self, now: i64) -> Self {
        self.clock_override = Some(now);
        self
    }

    fn now(&self) -> i64 {
        self.clock_override.unwrap_or_else(current_timestamp)
    }

    /// Library-entry-point equivalent of `GET /v1/debug/weights`'s backing
    /// data (spec §6) — the HTTP layer itself is an external collaborator.
    pub fn current_config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve_json(&self, raw: &str) -> Result<RetrieveResponse, QueryError> {
        let request = RetrieveRequest::parse_json(raw).map_err(|_| RetrieveValidationError::EmptyQuery)?;
        self.retrieve(request).await
    }

    pub async fn retrieve(&self, request: RetrieveRequest) -> Result<RetrieveResponse, QueryError> {
        use tracing::Instrument;
        let span = tracing::info_span!("retrieve", org_id = %request.org_id, principal_id = %request.principal_id);

        async {
            request.validate()?;
            let result = self.retrieve_internal(&request).await;
            self.emit_audit(&request, &result);
            result
        }
        .instrument(span)
        .await
    }

    fn emit_audit(&self, request: &RetrieveRequest, result: &Result<RetrieveResponse, QueryError>) {
        let Some(sink) = &self.audit_sink else { return };
        let outcome = match result {
            Ok(_) => AuditOutcome::Succeeded,
            Err(_) => AuditOutcome::Failed,
        };
        let mut event = AuditEvent::new(AuditOperation::Query, outcome);
        event.actor = Some(request.principal_id.clone());
        event.tenant = Some(request.org_id.clone());
        if let Err(err) = result {
            event.metadata.insert("error".to_string(), err.to_string());
        }
        let _ = sink.record(event);
    }

    async fn retrieve_internal(&self, request: &RetrieveRequest) -> Result<RetrieveResponse, QueryError> {
        let org_id = request.org_id.as_str();
        let cfg = &self.config;

        // Stage 0: query embedding (external call, not a pipeline stage proper).
        let embed_response = tokio::time::timeout(
            std::time::Duration::from_secs(cfg.embedding_timeout_secs),
            self.embedding_client.embed(&[request.query_text.clone()]),
        )
        .await
        .map_err(|_| QueryError::Timeout)??;
        let query_embedding = embed_response.embeddings.into_iter().next().unwrap_or_default();

        // Stage 1: seed.
        let lexical_k = (cfg.seed_k / 4).max(10);
        let vector_hits = self.repo.seed_vector(org_id, &query_embedding, cfg.seed_k).await;
        let lexical_hits = self.repo.seed_lexical(org_id, &request.query_text, lexical_k).await;

        let mut seed_ids: HashSet<u64> = HashSet::new();
        seed_ids.extend(vector_hits.iter().map(|(id, _)| *id));
        seed_ids.extend(lexical_hits.iter().map(|(id, _)| *id));
        let seed_span_ids: Vec<u64> = seed_ids.into_iter().collect();
        debug!(seed_spans = seed_span_ids.len(), "stage1_seed");

        if seed_span_ids.is_empty() {
            return Ok(empty_response(request, cfg));
        }

        // Stage 2: seed nodes from spans.
        let seed_nodes = self.repo.seed_nodes_from_spans(org_id, &seed_span_ids).await;
        let seed_node_set: HashSet<u64> = seed_nodes.iter().copied().collect();
        debug!(seed_nodes = seed_nodes.len(), "stage2_seed_nodes");

        // Stage 3: BFS expand.
        let mut visited: HashSet<u64> = seed_node_set.clone();
        let mut frontier = seed_nodes.clone();
        for _ in 0..cfg.hop_depth {
            if frontier.is_empty() {
                break;
            }
            let next = self.repo.expand_one_hop(org_id, &frontier, &visited, cfg.hop_fanout).await;
            if next.is_empty() {
                break;
            }
            for &id in &next {
                visited.insert(id);
            }
            frontier = next;
        }
        debug!(expanded_nodes_count = visited.len(), "stage3_expand");

        // Stage 4: candidate spans.
        let expanded_node_ids: Vec<u64> = visited.iter().copied().collect();
        let mut candidate_spans: HashSet<u64> = seed_span_ids.iter().copied().collect();
        let support_spans = self.repo.candidate_spans_for_nodes(org_id, &expanded_node_ids).await;
        for span_id in support_spans {
            if candidate_spans.len() >= 5000 {
                break;
            }
            candidate_spans.insert(span_id);
        }
        let candidate_span_ids: Vec<u64> = candidate_spans.into_iter().collect();
        debug!(candidate_spans_count = candidate_span_ids.len(), "stage4_candidates");

        // Stage 5: feature extraction.
        let lexical_query = parse_query(&request.query_text);
        let features = self
            .repo
            .span_features(org_id, &candidate_span_ids, &query_embedding, &lexical_query, &visited, &cfg.graph_bonus_map)
            .await;
        let feature_by_id: HashMap<u64, &SpanFeatures> = features.iter().map(|f| (f.span_id, f)).collect();

        // Stage 6: policy filter, before any truncation.
        let allowed_span_ids = self
            .repo
            .policy_filter(org_id, &request.principal_id, &candidate_span_ids)
            .await;
        debug!(allowed_spans_count = allowed_span_ids.len(), "stage6_policy_filter");

        if allowed_span_ids.is_empty() {
            let mut response = empty_response(request, cfg);
            response.debug.seed_spans = seed_span_ids.len();
            response.debug.seed_nodes = seed_nodes.len();
            response.debug.expanded_nodes_count = visited.len();
            response.debug.candidate_spans_count = candidate_span_ids.len();
            return Ok(response);
        }

        // Stage 7: score, rank, diversify.
        let allowed_features: Vec<&SpanFeatures> = allowed_span_ids
            .iter()
            .filter_map(|id| feature_by_id.get(id).copied())
            .collect();

        let vec_sims: Vec<f32> = allowed_features.iter().map(|f| f.vec_sim).collect();
        let lexes: Vec<f32> = allowed_features.iter().map(|f| f.lex).collect();
        let edges: Vec<f32> = allowed_features.iter().map(|f| f.edge_support).collect();

        let vec_norm = min_max_normalize(&vec_sims);
        let lex_norm = min_max_normalize(&lexes);
        let edge_norm = min_max_normalize(&edges);

        let now = self.now();
        let halflife = cfg.recency_halflife_days.max(f32::MIN_POSITIVE);

        let mut scored: Vec<ScoredSpan> = allowed_features
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let age_days = ((now - f.created_at).max(0) as f32) / 86_400.0;
                let recency = (-std::f32::consts::LN_2 * age_days / halflife).exp();
                let score = cfg.alpha_vec * vec_norm[i]
                    + cfg.beta_bm25 * lex_norm[i]
                    + cfg.gamma_graph * edge_norm[i]
                    + cfg.delta_recency * recency;
                ScoredSpan { span_id: f.span_id, score, created_at: f.created_at }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.span_id.cmp(&b.span_id))
        });

        let selected_ids: Vec<u64> = if cfg.use_mmr {
            let pool: Vec<ScoredSpan> = scored.into_iter().take(cfg.mmr_pool).collect();
            let pool_ids: Vec<u64> = pool.iter().map(|s| s.span_id).collect();
            let embeddings = self.repo.span_embeddings(org_id, &pool_ids).await;
            mmr_select(&pool, &embeddings, cfg.mmr_lambda, cfg.final_k)
        } else {
            scored.into_iter().take(cfg.final_k).map(|s| s.span_id).collect()
        };

        // Per-artifact overlap dedup.
        let artifact_ids = self.repo.artifact_ids_for_spans(&selected_ids).await;
        let hydrated_all = self.repo.hydrate_spans(org_id, &selected_ids).await;
        let hydrated_by_id: HashMap<u64, &HydratedSpan> = hydrated_all.iter().map(|h| (h.span.id, h)).collect();

        let mut kept: Vec<u64> = Vec::new();
        let mut kept_ranges: HashMap<u64, Vec<(u32, u32)>> = HashMap::new();
        for span_id in &selected_ids {
            if kept.len() >= cfg.final_k {
                break;
            }
            let Some(hydrated) = hydrated_by_id.get(span_id) else { continue };
            let artifact_id = *artifact_ids.get(span_id).unwrap_or(&hydrated.artifact.id);
            let (start, end) = (hydrated.span.start_char, hydrated.span.end_char);
            let overlaps = kept_ranges
                .get(&artifact_id)
                .map(|ranges| ranges.iter().any(|&(s, e)| start < e && s < end))
                .unwrap_or(false);
            if overlaps {
                continue;
            }
            kept_ranges.entry(artifact_id).or_default().push((start, end));
            kept.push(*span_id);
        }

        let results: Vec<RetrievedSpan> = kept
            .iter()
            .filter_map(|id| hydrated_by_id.get(id))
            .map(|hydrated| RetrievedSpan {
                id: hydrated.span.id,
                artifact_id: hydrated.artifact.id,
                text: hydrated.excerpt.clone(),
                start_char: hydrated.span.start_char,
                end_char: hydrated.span.end_char,
                confidence: hydrated.span.confidence,
                created_at: hydrated.span.created_at,
            })
            .collect();

        debug!(returned = results.len(), "stage7_complete");

        Ok(RetrieveResponse {
            org_id: request.org_id.clone(),
            query: request.query_text.clone(),
            top_k: cfg.final_k,
            debug: DebugEnvelope {
                seed_spans: seed_span_ids.len(),
                seed_nodes: seed_nodes.len(),
                expanded_nodes_count: visited.len(),
                candidate_spans_count: candidate_span_ids.len(),
                allowed_spans_count: allowed_span_ids.len(),
                returned: results.len(),
                mmr_enabled: cfg.use_mmr,
                mmr_lambda: cfg.mmr_lambda,
                mmr_pool: cfg.mmr_pool,
            },
            results,
        })
    }
}

struct ScoredSpan {
    span_id: u64,
    score: f32,
    created_at: i64,
}

fn empty_response(request: &RetrieveRequest, cfg: &RetrievalConfig) -> RetrieveResponse {
    RetrieveResponse {
        org_id: request.org_id.clone(),
        query: request.query_text.clone(),
        top_k: cfg.final_k,
        results: Vec::new(),
        debug: DebugEnvelope {
            mmr_enabled: cfg.use_mmr,
            mmr_lambda: cfg.mmr_lambda,
            mmr_pool: cfg.mmr_pool,
            ..Default::default()
        },
    }
}

fn min_max_normalize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

/// Greedy MMR selection (spec §4.2 Stage 7.5): iteratively pick the span
/// maximizing `lambda * relevance - (1 - lambda) * max_sim_to_selected`.
/// Spans missing a stored embedding contribute 0.0 similarity, i.e. they are
/// treated as uncorrelated with everything already selected.
fn mmr_select(pool: &[ScoredSpan], embeddings: &HashMap<u64, Vec<f32>>, lambda: f32, final_k: usize) -> Vec<u64> {
    let mut remaining: Vec<&ScoredSpan> = pool.iter().collect();
    let mut selected: Vec<u64> = Vec::new();

    while selected.len() < final_k && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_value = f32::NEG_INFINITY;
        for (i, candidate) in remaining.iter().enumerate() {
            let relevance = candidate.score;
            let max_sim = selected
                .iter()
                .filter_map(|id| {
                    let a = embeddings.get(&candidate.span_id)?;
                    let b = embeddings.get(id)?;
                    cosine_similarity(a, b)
                })
                .fold(0.0f32, f32::max);
            let value = lambda * relevance - (1.0 - lambda) * max_sim;
            if value > best_value {
                best_value = value;
                best_idx = i;
            }
        }
        let chosen = remaining.remove(best_idx);
        selected.push(chosen.span_id);
    }

    selected
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
