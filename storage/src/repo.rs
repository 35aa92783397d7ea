use crate::crypto::{AtRestCipher, NoOpCipher};
use crate::hyper_index::HyperIndex;
use crate::index::lexical::parse_query;
use crate::snapshot::{SnapshotError, SnapshotManager};
use crate::wal::{Wal, WalError};
use alayasiki_core::error::{AlayasikiError, ErrorCode};
use alayasiki_core::model::{
    Acl, AclAllow, AllowType, Artifact, ArtifactText, DeriverCursor, EdgeEvidence, EventLogEntry,
    EvidenceEmbedding, EvidenceSpan, GraphEdge, GraphNode, PrincipalRole, SpanNode,
};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("Serialization error")]
    Serialization,
    #[error("Deserialization error")]
    Deserialization,
    #[error("Not found")]
    NotFound,
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Snapshot manager is not configured")]
    SnapshotNotConfigured,
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl AlayasikiError for RepoError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RepoError::NotFound | RepoError::SnapshotNotFound(_) => ErrorCode::NotFound,
            RepoError::InvalidTransaction(_) => ErrorCode::InvalidArgument,
            _ => ErrorCode::Internal,
        }
    }
}

/// A single durable mutation. `Repository::apply_transaction` writes a batch
/// of these as one WAL record so a crash mid-batch never leaves a partial
/// derivation visible (spec §4.1: a derivation and its cursor advance commit
/// atomically).
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum Mutation {
    PutArtifact(Artifact),
    PutArtifactText(ArtifactText),
    PutEvidenceSpan(EvidenceSpan),
    PutEvidenceEmbedding(EvidenceEmbedding),
    PutGraphNode(GraphNode),
    PutGraphEdge(GraphEdge),
    PutEdgeEvidence(EdgeEvidence),
    PutSpanNode(SpanNode),
    AppendEvent(EventLogEntry),
    MarkEventProcessed {
        org_id: String,
        event_id: u64,
        processed_at: i64,
    },
    PutAcl(Acl),
    PutAclAllow(AclAllow),
    PutPrincipalRole(PrincipalRole),
    AdvanceCursor(DeriverCursor),
    RecordIdempotency {
        key: String,
        ids: Vec<u64>,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum WalEntry {
    Single(Mutation),
    Transaction(Vec<Mutation>),
}

/// In-memory materialized state. Per-tenant isolation is enforced by keying
/// every table's rows by `org_id` and by keeping one `HyperIndex` per
/// tenant rather than a single shared index.
#[derive(Default)]
struct Tables {
    artifacts: HashMap<u64, Artifact>,
    artifact_texts: HashMap<u64, ArtifactText>,
    evidence_spans: HashMap<u64, EvidenceSpan>,
    evidence_embeddings: HashMap<(u64, String, String), EvidenceEmbedding>,
    graph_nodes: HashMap<u64, GraphNode>,
    graph_edges: HashMap<u64, GraphEdge>,
    edge_evidence: HashMap<u64, Vec<EdgeEvidence>>,
    span_node: HashMap<u64, HashSet<u64>>,
    event_log: HashMap<u64, EventLogEntry>,
    acls: HashMap<u64, Acl>,
    acl_allow: HashMap<u64, Vec<AclAllow>>,
    principal_role: HashMap<(String, String), HashSet<String>>,
    deriver_cursor: HashMap<String, DeriverCursor>,
    idempotency_index: HashMap<String, Vec<u64>>,
    hyper_indices: HashMap<String, HyperIndex>,
}

impl Tables {
    fn index_for(&mut self, org_id: &str) -> &mut HyperIndex {
        self.hyper_indices.entry(org_id.to_string()).or_default()
    }

    fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::PutArtifact(artifact) => {
                self.artifacts.insert(artifact.id, artifact.clone());
            }
            Mutation::PutArtifactText(text) => {
                self.artifact_texts.insert(text.id, text.clone());
            }
            Mutation::PutEvidenceSpan(span) => {
                let span_id = span.id;
                self.evidence_spans.insert(span_id, span.clone());
                if let Some(text) = self.artifact_texts.get(&span.artifact_text_id) {
                    if let Some((start, end)) =
                        char_range(&text.text_utf8, span.start_char, span.end_char)
                    {
                        let excerpt = text.text_utf8[start..end].to_string();
                        self.index_for(&span.org_id).index_span_text(span_id, &excerpt);
                    }
                }
            }
            Mutation::PutEvidenceEmbedding(embedding) => {
                let key = (
                    embedding.evidence_span_id,
                    embedding.model_name.clone(),
                    embedding.model_version.clone(),
                );
                self.index_for(&embedding.org_id)
                    .index_span_embedding(embedding.evidence_span_id, embedding.embedding.clone());
                self.evidence_embeddings.insert(key, embedding.clone());
            }
            Mutation::PutGraphNode(node) => {
                self.graph_nodes.insert(node.id, node.clone());
            }
            Mutation::PutGraphEdge(edge) => {
                self.index_for(&edge.org_id)
                    .upsert_edge(edge.src, edge.dst, edge.edge_type.clone(), edge.weight);
                self.graph_edges.insert(edge.id, edge.clone());
            }
            Mutation::PutEdgeEvidence(evidence) => {
                self.edge_evidence
                    .entry(evidence.edge_id)
                    .or_default()
                    .push(evidence.clone());
            }
            Mutation::PutSpanNode(link) => {
                self.span_node.entry(link.evidence_span_id).or_default().insert(link.node_id);
            }
            Mutation::AppendEvent(event) => {
                self.event_log.insert(event.id, event.clone());
            }
            Mutation::MarkEventProcessed {
                event_id,
                processed_at,
                ..
            } => {
                if let Some(event) = self.event_log.get_mut(event_id) {
                    event.processed_at = Some(*processed_at);
                }
            }
            Mutation::PutAcl(acl) => {
                self.acls.insert(acl.id, acl.clone());
            }
            Mutation::PutAclAllow(allow) => {
                self.acl_allow.entry(allow.acl_id).or_default().push(allow.clone());
            }
            Mutation::PutPrincipalRole(membership) => {
                self.principal_role
                    .entry((membership.org_id.clone(), membership.principal_id.clone()))
                    .or_default()
                    .insert(membership.role_id.clone());
            }
            Mutation::AdvanceCursor(cursor) => {
                self.deriver_cursor.insert(cursor.org_id.clone(), cursor.clone());
            }
            Mutation::RecordIdempotency { key, ids } => {
                self.idempotency_index.insert(key.clone(), ids.clone());
            }
        }
    }
}

fn char_range(text: &str, start_char: u32, end_char: u32) -> Option<(usize, usize)> {
    let mut starts = text.char_indices().map(|(b, _)| b).chain([text.len()]);
    let start = starts.nth(start_char as usize)?;
    let mut ends = text.char_indices().map(|(b, _)| b).chain([text.len()]);
    let end = ends.nth(end_char as usize)?;
    Some((start, end))
}

/// Per-span features computed for Stage 5 scoring (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct SpanFeatures {
    pub span_id: u64,
    pub vec_sim: f32,
    pub lex: f32,
    pub edge_support: f32,
    pub created_at: i64,
}

/// A fully hydrated evidence span ready for response assembly (Stage 7).
#[derive(Debug, Clone)]
pub struct HydratedSpan {
    pub span: EvidenceSpan,
    pub artifact: Artifact,
    pub excerpt: String,
}

/// A claimed, not-yet-processed event handed to the graph deriver.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub event: EventLogEntry,
}

pub struct Repository {
    wal: Arc<Mutex<Wal>>,
    tx_lock: Arc<Mutex<()>>,
    tables: Arc<RwLock<Tables>>,
    snapshot_manager: Option<SnapshotManager>,
}

impl Repository {
    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, RepoError> {
        Self::open_with_cipher(wal_path, Arc::new(NoOpCipher)).await
    }

    pub async fn open_with_cipher(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
    ) -> Result<Self, RepoError> {
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, None).await
    }

    pub async fn open_with_snapshots(
        wal_path: impl AsRef<Path>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        Self::open_with_cipher_and_snapshots(wal_path, Arc::new(NoOpCipher), snapshot_dir).await
    }

    pub async fn open_with_cipher_and_snapshots(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        let snapshot_manager = SnapshotManager::new(snapshot_dir.as_ref());
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, Some(snapshot_manager)).await
    }

    async fn open_internal(
        wal_path: PathBuf,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_manager: Option<SnapshotManager>,
    ) -> Result<Self, RepoError> {
        let mut wal_instance = Wal::open_with_cipher(&wal_path, cipher).await?;
        let (mut tables, base_lsn) = load_tables_from_backup(snapshot_manager.as_ref(), None).await?;

        let last_replayed_lsn = wal_instance
            .replay(|lsn, data| {
                if lsn <= base_lsn {
                    return Ok(());
                }
                let entry = decode_wal_entry(&data)?;
                apply_wal_entry(&entry, &mut tables);
                Ok(())
            })
            .await?;

        if base_lsn > last_replayed_lsn {
            return Err(RepoError::SnapshotNotFound(format!("wal-lsn-{base_lsn}")));
        }

        Ok(Self {
            wal: Arc::new(Mutex::new(wal_instance)),
            tx_lock: Arc::new(Mutex::new(())),
            tables: Arc::new(RwLock::new(tables)),
            snapshot_manager,
        })
    }

    /// Apply a batch of mutations atomically: validated, then WAL-logged as
    /// one record, then applied to in-memory state under write lock.
    pub async fn apply_transaction(&self, mutations: Vec<Mutation>) -> Result<(), RepoError> {
        if mutations.is_empty() {
            return Ok(());
        }

        let _tx_guard = self.tx_lock.lock().await;

        {
            let tables = self.tables.read().await;
            validate_transaction(&tables, &mutations)?;
        }

        let entry = WalEntry::Transaction(mutations.clone());
        let bytes = serialize_wal_entry(&entry)?;
        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }

        let mut tables = self.tables.write().await;
        for mutation in &mutations {
            tables.apply(mutation);
        }

        Ok(())
    }

    pub async fn put_single(&self, mutation: Mutation) -> Result<(), RepoError> {
        self.apply_transaction(vec![mutation]).await
    }

    // --- Ingestion-side writes ----------------------------------------------

    pub async fn put_artifact(&self, artifact: Artifact) -> Result<(), RepoError> {
        self.put_single(Mutation::PutArtifact(artifact)).await
    }

    pub async fn put_artifact_text(&self, text: ArtifactText) -> Result<(), RepoError> {
        self.put_single(Mutation::PutArtifactText(text)).await
    }

    pub async fn put_evidence_span(&self, span: EvidenceSpan) -> Result<(), RepoError> {
        self.put_single(Mutation::PutEvidenceSpan(span)).await
    }

    pub async fn put_evidence_embedding(&self, embedding: EvidenceEmbedding) -> Result<(), RepoError> {
        self.put_single(Mutation::PutEvidenceEmbedding(embedding)).await
    }

    pub async fn append_event(&self, event: EventLogEntry) -> Result<(), RepoError> {
        self.put_single(Mutation::AppendEvent(event)).await
    }

    pub async fn check_idempotency(&self, key: &str) -> Option<Vec<u64>> {
        let tables = self.tables.read().await;
        tables.idempotency_index.get(key).cloned()
    }

    pub async fn record_idempotency(&self, key: &str, ids: Vec<u64>) -> Result<(), RepoError> {
        {
            let tables = self.tables.read().await;
            if tables.idempotency_index.contains_key(key) {
                return Ok(());
            }
        }
        self.put_single(Mutation::RecordIdempotency {
            key: key.to_string(),
            ids,
        })
        .await
    }

    // --- ACL administration --------------------------------------------------

    pub async fn put_acl(&self, acl: Acl) -> Result<(), RepoError> {
        self.put_single(Mutation::PutAcl(acl)).await
    }

    pub async fn put_acl_allow(&self, allow: AclAllow) -> Result<(), RepoError> {
        self.put_single(Mutation::PutAclAllow(allow)).await
    }

    pub async fn put_principal_role(&self, membership: PrincipalRole) -> Result<(), RepoError> {
        self.put_single(Mutation::PutPrincipalRole(membership)).await
    }

    // --- Deriver-side writes --------------------------------------------------

    /// Returns the oldest unprocessed event for `org_id` strictly after the
    /// tenant's cursor, or `None` if the tenant is caught up. The deriver
    /// loop is single-writer per tenant (spec §4.1), so no row-level lock is
    /// needed beyond the tenant's own serialized poll loop.
    pub async fn claim_next_event(&self, org_id: &str) -> Option<ClaimedEvent> {
        let tables = self.tables.read().await;
        let cursor_last_id = tables
            .deriver_cursor
            .get(org_id)
            .map(|c| c.last_event_id)
            .unwrap_or(0);

        tables
            .event_log
            .values()
            .filter(|e| e.org_id == org_id && e.id > cursor_last_id && e.processed_at.is_none())
            .min_by_key(|e| (e.occurred_at, e.id))
            .cloned()
            .map(|event| ClaimedEvent { event })
    }

    pub async fn get_graph_node_by_key(&self, org_id: &str, key: &str) -> Option<GraphNode> {
        let tables = self.tables.read().await;
        tables
            .graph_nodes
            .values()
            .find(|n| n.org_id == org_id && n.key == key)
            .cloned()
    }

    pub async fn get_graph_edge(
        &self,
        org_id: &str,
        src: u64,
        dst: u64,
        edge_type: &str,
    ) -> Option<GraphEdge> {
        let tables = self.tables.read().await;
        tables
            .graph_edges
            .values()
            .find(|e| e.org_id == org_id && e.src == src && e.dst == dst && e.edge_type == edge_type)
            .cloned()
    }

    pub async fn get_graph_node(&self, id: u64) -> Option<GraphNode> {
        let tables = self.tables.read().await;
        tables.graph_nodes.get(&id).cloned()
    }

    /// Resolves a reference like `outcome.decision_ref` that may name either a
    /// node's key directly or its title (case-insensitive), scoped to
    /// `node_type` (spec §4.1: "`decision_ref` matches (by key or by title
    /// ILIKE)").
    pub async fn find_graph_node_by_reference(&self, org_id: &str, node_type: &str, reference: &str) -> Option<GraphNode> {
        let tables = self.tables.read().await;
        if let Some(node) = tables
            .graph_nodes
            .values()
            .find(|n| n.org_id == org_id && n.key == reference)
        {
            return Some(node.clone());
        }
        let needle = reference.to_lowercase();
        tables
            .graph_nodes
            .values()
            .find(|n| n.org_id == org_id && n.node_type == node_type && n.title.to_lowercase() == needle)
            .cloned()
    }

    /// Spans belonging to one artifact, used by the deriver to attach
    /// evidence to newly created/updated edges (spec §4.1 step 4).
    pub async fn spans_for_artifact(&self, org_id: &str, artifact_id: u64) -> Vec<u64> {
        let tables = self.tables.read().await;
        tables
            .evidence_spans
            .values()
            .filter(|s| s.org_id == org_id && s.artifact_id == artifact_id)
            .map(|s| s.id)
            .collect()
    }

    /// Commits a node/edge/evidence upsert plus the cursor advance in one WAL
    /// transaction, so a crash never leaves a dangling un-advanced cursor
    /// pointing at an event whose derivation was already durable (or the
    /// reverse).
    pub async fn commit_derivation(
        &self,
        mutations: Vec<Mutation>,
        cursor: DeriverCursor,
    ) -> Result<(), RepoError> {
        let mut all = mutations;
        all.push(Mutation::AdvanceCursor(cursor));
        self.apply_transaction(all).await
    }

    pub async fn deriver_cursor(&self, org_id: &str) -> Option<DeriverCursor> {
        let tables = self.tables.read().await;
        tables.deriver_cursor.get(org_id).cloned()
    }

    // --- Retrieval pipeline reads ---------------------------------------------

    /// Stage 1 (vector half): top-`k` evidence spans by cosine similarity to
    /// `query_embedding`, scoped to `org_id`.
    pub async fn seed_vector(&self, org_id: &str, query_embedding: &[f32], k: usize) -> Vec<(u64, f32)> {
        let tables = self.tables.read().await;
        tables
            .hyper_indices
            .get(org_id)
            .map(|idx| idx.search_vector(query_embedding, k))
            .unwrap_or_default()
    }

    /// Stage 1 (lexical half): top-`k` evidence spans matching the
    /// phrase-aware query, scoped to `org_id`.
    pub async fn seed_lexical(&self, org_id: &str, query_text: &str, k: usize) -> Vec<(u64, f32)> {
        let tables = self.tables.read().await;
        let Some(index) = tables.hyper_indices.get(org_id) else {
            return Vec::new();
        };
        let parsed = parse_query(query_text);
        index.lexical_index.search(&parsed, k)
    }

    /// Stage 2: spans -> graph nodes, via the `span_node` cache falling back
    /// to an `edge_evidence` join (spec §4.1: "denormalized cache").
    pub async fn seed_nodes_from_spans(&self, org_id: &str, span_ids: &[u64]) -> Vec<u64> {
        let tables = self.tables.read().await;
        let mut nodes: HashSet<u64> = HashSet::new();

        for &span_id in span_ids {
            if let Some(cached) = tables.span_node.get(&span_id) {
                let mut any = false;
                for &node_id in cached {
                    if tables.graph_nodes.get(&node_id).is_some_and(|n| n.org_id == org_id) {
                        nodes.insert(node_id);
                        any = true;
                    }
                }
                if any {
                    continue;
                }
            }
            for (edge_id, evidences) in &tables.edge_evidence {
                if evidences.iter().any(|e| e.evidence_span_id == span_id && e.org_id == org_id) {
                    if let Some(edge) = tables.graph_edges.get(edge_id) {
                        if edge.org_id == org_id {
                            nodes.insert(edge.src);
                            nodes.insert(edge.dst);
                        }
                    }
                }
            }
        }

        nodes.into_iter().collect()
    }

    /// Stage 3: one undirected BFS hop from `frontier`, fanout-capped.
    pub async fn expand_one_hop(
        &self,
        org_id: &str,
        frontier: &[u64],
        visited: &HashSet<u64>,
        fanout: usize,
    ) -> Vec<u64> {
        let tables = self.tables.read().await;
        tables
            .hyper_indices
            .get(org_id)
            .map(|idx| idx.graph_index.expand_one_hop(frontier, visited, fanout))
            .unwrap_or_default()
    }

    /// Stage 4: nodes -> evidence spans, the reverse of `seed_nodes_from_spans`.
    pub async fn candidate_spans_for_nodes(&self, org_id: &str, node_ids: &[u64]) -> Vec<u64> {
        let tables = self.tables.read().await;
        let node_set: HashSet<u64> = node_ids.iter().copied().collect();
        let mut spans: HashSet<u64> = HashSet::new();

        for (&span_id, node_ids) in &tables.span_node {
            if node_ids.iter().any(|n| node_set.contains(n)) {
                if let Some(span) = tables.evidence_spans.get(&span_id) {
                    if span.org_id == org_id {
                        spans.insert(span_id);
                    }
                }
            }
        }
        for (edge_id, evidences) in &tables.edge_evidence {
            let Some(edge) = tables.graph_edges.get(edge_id) else {
                continue;
            };
            if edge.org_id != org_id {
                continue;
            }
            if node_set.contains(&edge.src) || node_set.contains(&edge.dst) {
                for evidence in evidences {
                    spans.insert(evidence.evidence_span_id);
                }
            }
        }

        spans.into_iter().collect()
    }

    /// Stage 5 inputs: raw per-span features before normalization/weighting.
    /// `edge_support` sums, over every edge this span is evidence for that
    /// touches `expanded_nodes`, `confidence * weight * max(bonus[src_type],
    /// bonus[dst_type])` (spec §4.2 Stage 5).
    pub async fn span_features(
        &self,
        org_id: &str,
        span_ids: &[u64],
        query_embedding: &[f32],
        lexical_query: &crate::index::lexical::ParsedQuery,
        expanded_nodes: &HashSet<u64>,
        bonus_map: &HashMap<String, f32>,
    ) -> Vec<SpanFeatures> {
        let tables = self.tables.read().await;
        let Some(index) = tables.hyper_indices.get(org_id) else {
            return Vec::new();
        };

        let mut span_edges: HashMap<u64, Vec<(u64, f32)>> = HashMap::new();
        for evidences in tables.edge_evidence.values() {
            for evidence in evidences {
                if evidence.org_id != org_id {
                    continue;
                }
                span_edges
                    .entry(evidence.evidence_span_id)
                    .or_default()
                    .push((evidence.edge_id, evidence.confidence));
            }
        }

        span_ids
            .iter()
            .filter_map(|&span_id| {
                let span = tables.evidence_spans.get(&span_id)?;
                if span.org_id != org_id {
                    return None;
                }

                let vec_sim = index
                    .vector_index
                    .get(span_id)
                    .and_then(|embedding| cosine_similarity(query_embedding, embedding))
                    .unwrap_or(0.0);

                let lex = index.lexical_index.score_span(span_id, lexical_query);

                let edge_support = span_edges
                    .get(&span_id)
                    .map(|edges| {
                        edges
                            .iter()
                            .filter_map(|(edge_id, confidence)| {
                                let edge = tables.graph_edges.get(edge_id)?;
                                if edge.org_id != org_id {
                                    return None;
                                }
                                if !expanded_nodes.contains(&edge.src) && !expanded_nodes.contains(&edge.dst) {
                                    return None;
                                }
                                let src_bonus = tables
                                    .graph_nodes
                                    .get(&edge.src)
                                    .and_then(|n| bonus_map.get(&n.node_type))
                                    .copied()
                                    .unwrap_or(1.0);
                                let dst_bonus = tables
                                    .graph_nodes
                                    .get(&edge.dst)
                                    .and_then(|n| bonus_map.get(&n.node_type))
                                    .copied()
                                    .unwrap_or(1.0);
                                let bonus = src_bonus.max(dst_bonus);
                                Some(confidence * edge.weight * bonus)
                            })
                            .sum()
                    })
                    .unwrap_or(0.0);

                Some(SpanFeatures {
                    span_id,
                    vec_sim,
                    lex,
                    edge_support,
                    created_at: span.created_at,
                })
            })
            .collect()
    }

    /// Stage 6: ACL-join policy filter. Fails closed — a principal with no
    /// matching `acl_allow` row (direct or via role) sees nothing, and this
    /// never surfaces as an error (spec §7: never leak existence via errors).
    pub async fn policy_filter(&self, org_id: &str, principal_id: &str, span_ids: &[u64]) -> Vec<u64> {
        let tables = self.tables.read().await;
        let roles: HashSet<String> = tables
            .principal_role
            .get(&(org_id.to_string(), principal_id.to_string()))
            .cloned()
            .unwrap_or_default();

        span_ids
            .iter()
            .copied()
            .filter(|span_id| {
                let Some(span) = tables.evidence_spans.get(span_id) else {
                    return false;
                };
                if span.org_id != org_id {
                    return false;
                }
                let Some(artifact) = tables.artifacts.get(&span.artifact_id) else {
                    return false;
                };
                if artifact.org_id != org_id {
                    return false;
                }
                let Some(allows) = tables.acl_allow.get(&artifact.acl_id) else {
                    return false;
                };
                allows.iter().any(|allow| match allow.allow_type {
                    AllowType::Principal => allow.principal_id.as_deref() == Some(principal_id),
                    AllowType::Role => allow.role_id.as_ref().is_some_and(|role| roles.contains(role)),
                })
            })
            .collect()
    }

    /// Stage 7 input: embeddings for MMR's pairwise cosine comparisons.
    pub async fn span_embeddings(&self, org_id: &str, span_ids: &[u64]) -> HashMap<u64, Vec<f32>> {
        let tables = self.tables.read().await;
        let Some(index) = tables.hyper_indices.get(org_id) else {
            return HashMap::new();
        };
        span_ids
            .iter()
            .filter_map(|&id| index.vector_index.get(id).map(|emb| (id, emb.clone())))
            .collect()
    }

    /// Stage 7: hydrate final spans with their backing artifact and excerpt.
    pub async fn hydrate_spans(&self, org_id: &str, span_ids: &[u64]) -> Vec<HydratedSpan> {
        let tables = self.tables.read().await;
        span_ids
            .iter()
            .filter_map(|span_id| {
                let span = tables.evidence_spans.get(span_id)?;
                if span.org_id != org_id {
                    return None;
                }
                let artifact = tables.artifacts.get(&span.artifact_id)?.clone();
                let text = tables.artifact_texts.get(&span.artifact_text_id)?;
                let excerpt = char_range(&text.text_utf8, span.start_char, span.end_char)
                    .map(|(s, e)| text.text_utf8[s..e].to_string())
                    .unwrap_or_default();
                Some(HydratedSpan {
                    span: span.clone(),
                    artifact,
                    excerpt,
                })
            })
            .collect()
    }

    pub async fn artifact_ids_for_spans(&self, span_ids: &[u64]) -> HashMap<u64, u64> {
        let tables = self.tables.read().await;
        span_ids
            .iter()
            .filter_map(|id| tables.evidence_spans.get(id).map(|s| (*id, s.artifact_id)))
            .collect()
    }

    // --- Snapshot/backup machinery (unchanged shape from the donor) ----------

    pub async fn current_snapshot_id(&self) -> String {
        let wal = self.wal.lock().await;
        format!("wal-lsn-{}", wal.current_lsn())
    }

    pub async fn create_backup_snapshot(&self) -> Result<String, RepoError> {
        let snapshot_manager = self
            .snapshot_manager
            .as_ref()
            .ok_or(RepoError::SnapshotNotConfigured)?;

        let (lsn, encoded) = {
            let _tx_guard = self.tx_lock.lock().await;
            let lsn = {
                let wal = self.wal.lock().await;
                wal.current_lsn()
            };
            let tables = self.tables.read().await;
            let snapshot = encode_backup_snapshot(lsn, &tables);
            (lsn, serialize_backup_snapshot(&snapshot)?)
        };

        snapshot_manager.create_snapshot(lsn, &encoded).await?;
        Ok(format!("wal-lsn-{lsn}"))
    }

    pub async fn restore_from_latest_backup(&self) -> Result<String, RepoError> {
        if self.snapshot_manager.is_none() {
            return Err(RepoError::SnapshotNotConfigured);
        }

        let _tx_guard = self.tx_lock.lock().await;
        let target_lsn = {
            let wal = self.wal.lock().await;
            wal.current_lsn()
        };

        let (mut tables, base_lsn) =
            load_tables_from_backup(self.snapshot_manager.as_ref(), Some(target_lsn)).await?;

        {
            let mut wal = self.wal.lock().await;
            wal.replay(|lsn, data| {
                if lsn <= base_lsn || lsn > target_lsn {
                    return Ok(());
                }
                let entry = decode_wal_entry(&data)?;
                apply_wal_entry(&entry, &mut tables);
                Ok(())
            })
            .await?;
        }

        *self.tables.write().await = tables;
        Ok(format!("wal-lsn-{target_lsn}"))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a * norm_b))
}

fn validate_transaction(tables: &Tables, mutations: &[Mutation]) -> Result<(), RepoError> {
    let mut visible_nodes: HashSet<u64> = tables.graph_nodes.keys().copied().collect();
    let mut visible_texts: HashMap<u64, u32> = tables
        .artifact_texts
        .values()
        .map(|t| (t.id, t.text_utf8.chars().count() as u32))
        .collect();

    for mutation in mutations {
        match mutation {
            Mutation::PutGraphNode(node) => {
                visible_nodes.insert(node.id);
            }
            Mutation::PutArtifactText(text) => {
                visible_texts.insert(text.id, text.text_utf8.chars().count() as u32);
            }
            Mutation::PutGraphEdge(edge) => {
                if !visible_nodes.contains(&edge.src) {
                    return Err(RepoError::InvalidTransaction(format!(
                        "edge src {} does not exist",
                        edge.src
                    )));
                }
                if !visible_nodes.contains(&edge.dst) {
                    return Err(RepoError::InvalidTransaction(format!(
                        "edge dst {} does not exist",
                        edge.dst
                    )));
                }
            }
            Mutation::PutEvidenceSpan(span) => {
                let Some(&text_len) = visible_texts.get(&span.artifact_text_id) else {
                    return Err(RepoError::InvalidTransaction(format!(
                        "span references unknown artifact_text {}",
                        span.artifact_text_id
                    )));
                };
                if !span.is_bounds_valid(text_len) {
                    return Err(RepoError::InvalidTransaction(format!(
                        "span {} has invalid bounds [{}, {}) over text of length {}",
                        span.id, span.start_char, span.end_char, text_len
                    )));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn serialize_wal_entry(entry: &WalEntry) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(entry)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn decode_wal_entry(data: &[u8]) -> Result<WalEntry, WalError> {
    let archived = rkyv::check_archived_root::<WalEntry>(data).map_err(|_| WalError::CorruptEntry)?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_: std::convert::Infallible| WalError::CorruptEntry)
}

fn apply_wal_entry(entry: &WalEntry, tables: &mut Tables) {
    match entry {
        WalEntry::Single(mutation) => tables.apply(mutation),
        WalEntry::Transaction(mutations) => {
            for mutation in mutations {
                tables.apply(mutation);
            }
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
struct BackupSnapshot {
    lsn: u64,
    artifacts: Vec<Artifact>,
    artifact_texts: Vec<ArtifactText>,
    evidence_spans: Vec<EvidenceSpan>,
    evidence_embeddings: Vec<EvidenceEmbedding>,
    graph_nodes: Vec<GraphNode>,
    graph_edges: Vec<GraphEdge>,
    edge_evidence: Vec<EdgeEvidence>,
    span_node: Vec<SpanNode>,
    event_log: Vec<EventLogEntry>,
    acls: Vec<Acl>,
    acl_allow: Vec<AclAllow>,
    principal_role: Vec<PrincipalRole>,
    deriver_cursor: Vec<DeriverCursor>,
}

fn encode_backup_snapshot(lsn: u64, tables: &Tables) -> BackupSnapshot {
    let mut artifacts: Vec<Artifact> = tables.artifacts.values().cloned().collect();
    artifacts.sort_by_key(|a| a.id);
    let mut artifact_texts: Vec<ArtifactText> = tables.artifact_texts.values().cloned().collect();
    artifact_texts.sort_by_key(|t| t.id);
    let mut evidence_spans: Vec<EvidenceSpan> = tables.evidence_spans.values().cloned().collect();
    evidence_spans.sort_by_key(|s| s.id);
    let mut graph_nodes: Vec<GraphNode> = tables.graph_nodes.values().cloned().collect();
    graph_nodes.sort_by_key(|n| n.id);
    let mut graph_edges: Vec<GraphEdge> = tables.graph_edges.values().cloned().collect();
    graph_edges.sort_by_key(|e| e.id);
    let mut event_log: Vec<EventLogEntry> = tables.event_log.values().cloned().collect();
    event_log.sort_by_key(|e| e.id);
    let mut acls: Vec<Acl> = tables.acls.values().cloned().collect();
    acls.sort_by_key(|a| a.id);

    BackupSnapshot {
        lsn,
        artifacts,
        artifact_texts,
        evidence_spans,
        evidence_embeddings: tables.evidence_embeddings.values().cloned().collect(),
        graph_nodes,
        graph_edges,
        edge_evidence: tables.edge_evidence.values().flatten().cloned().collect(),
        span_node: tables
            .span_node
            .iter()
            .flat_map(|(&span_id, node_ids)| {
                let org_id = tables
                    .evidence_spans
                    .get(&span_id)
                    .map(|s| s.org_id.clone())
                    .unwrap_or_default();
                node_ids.iter().map(move |&node_id| SpanNode {
                    org_id: org_id.clone(),
                    evidence_span_id: span_id,
                    node_id,
                })
            })
            .collect(),
        event_log,
        acls,
        acl_allow: tables.acl_allow.values().flatten().cloned().collect(),
        principal_role: tables
            .principal_role
            .iter()
            .flat_map(|((org_id, principal_id), roles)| {
                roles.iter().map(move |role_id| PrincipalRole {
                    org_id: org_id.clone(),
                    principal_id: principal_id.clone(),
                    role_id: role_id.clone(),
                })
            })
            .collect(),
        deriver_cursor: tables.deriver_cursor.values().cloned().collect(),
    }
}

fn serialize_backup_snapshot(snapshot: &BackupSnapshot) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(snapshot)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

async fn deserialize_backup_snapshot(path: &Path) -> Result<BackupSnapshot, RepoError> {
    let bytes = fs::read(path)
        .await
        .map_err(|err| RepoError::Snapshot(SnapshotError::Io(err)))?;
    let archived =
        rkyv::check_archived_root::<BackupSnapshot>(&bytes[..]).map_err(|_| RepoError::Deserialization)?;
    archived.deserialize(&mut rkyv::Infallible).map_err(|_| RepoError::Deserialization)
}

async fn load_tables_from_backup(
    snapshot_manager: Option<&SnapshotManager>,
    target_lsn: Option<u64>,
) -> Result<(Tables, u64), RepoError> {
    let Some(manager) = snapshot_manager else {
        return Ok((Tables::default(), 0));
    };

    let selected = match target_lsn {
        Some(lsn) => manager.latest_snapshot_at_or_before(lsn).await?,
        None => manager.latest_snapshot().await?,
    };

    let Some((snapshot_lsn, path)) = selected else {
        return Ok((Tables::default(), 0));
    };

    let snapshot = deserialize_backup_snapshot(&path).await?;
    if snapshot.lsn != snapshot_lsn {
        return Err(RepoError::Deserialization);
    }

    let mut tables = Tables::default();
    for artifact in snapshot.artifacts {
        tables.artifacts.insert(artifact.id, artifact);
    }
    for text in snapshot.artifact_texts {
        tables.artifact_texts.insert(text.id, text);
    }
    for span in snapshot.evidence_spans {
        tables.apply(&Mutation::PutEvidenceSpan(span));
    }
    for embedding in snapshot.evidence_embeddings {
        tables.apply(&Mutation::PutEvidenceEmbedding(embedding));
    }
    for node in snapshot.graph_nodes {
        tables.apply(&Mutation::PutGraphNode(node));
    }
    for edge in snapshot.graph_edges {
        tables.apply(&Mutation::PutGraphEdge(edge));
    }
    for evidence in snapshot.edge_evidence {
        tables.apply(&Mutation::PutEdgeEvidence(evidence));
    }
    for link in snapshot.span_node {
        tables.apply(&Mutation::PutSpanNode(link));
    }
    for event in snapshot.event_log {
        tables.apply(&Mutation::AppendEvent(event));
    }
    for acl in snapshot.acls {
        tables.apply(&Mutation::PutAcl(acl));
    }
    for allow in snapshot.acl_allow {
        tables.apply(&Mutation::PutAclAllow(allow));
    }
    for membership in snapshot.principal_role {
        tables.apply(&Mutation::PutPrincipalRole(membership));
    }
    for cursor in snapshot.deriver_cursor {
        tables.apply(&Mutation::AdvanceCursor(cursor));
    }

    Ok((tables, snapshot_lsn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alayasiki_core::embedding::{id_from_key, node_key};
    use tempfile::tempdir;

    fn artifact(id: u64, org_id: &str, acl_id: u64) -> Artifact {
        Artifact {
            id,
            org_id: org_id.to_string(),
            source_system: "test".to_string(),
            source_uri: "uri".to_string(),
            captured_at: 1_700_000_000,
            occurred_at: 1_700_000_000,
            author_principal_id: "alice".to_string(),
            content_type: "text/plain".to_string(),
            storage_uri: "blob://1".to_string(),
            content_hash: "hash".to_string(),
            size_bytes: 10,
            acl_id,
            pii_classification: "none".to_string(),
        }
    }

    fn artifact_text(id: u64, org_id: &str, artifact_id: u64, text: &str) -> ArtifactText {
        ArtifactText {
            id,
            org_id: org_id.to_string(),
            artifact_id,
            normaliser_version: "v1".to_string(),
            language: "en".to_string(),
            text_utf8: text.to_string(),
            text_sha256: "sha".to_string(),
        }
    }

    fn span(id: u64, org_id: &str, artifact_id: u64, text_id: u64, start: u32, end: u32) -> EvidenceSpan {
        EvidenceSpan {
            id,
            org_id: org_id.to_string(),
            artifact_id,
            artifact_text_id: text_id,
            span_type: "sentence".to_string(),
            start_char: start,
            end_char: end,
            section_path: "/".to_string(),
            extracted_by: "test".to_string(),
            confidence: 1.0,
            created_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn rejects_span_with_out_of_bounds_range() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("bounds.wal")).await.unwrap();

        repo.put_artifact(artifact(1, "org-a", 1)).await.unwrap();
        repo.put_artifact_text(artifact_text(1, "org-a", 1, "hello world"))
            .await
            .unwrap();

        let bad_span = span(1, "org-a", 1, 1, 0, 999);
        let result = repo.apply_transaction(vec![Mutation::PutEvidenceSpan(bad_span)]).await;
        assert!(matches!(result, Err(RepoError::InvalidTransaction(_))));
    }

    #[tokio::test]
    async fn policy_filter_fails_closed_with_no_grants() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("acl.wal")).await.unwrap();

        repo.put_artifact(artifact(1, "org-a", 1)).await.unwrap();
        repo.put_artifact_text(artifact_text(1, "org-a", 1, "hello world"))
            .await
            .unwrap();
        repo.put_evidence_span(span(1, "org-a", 1, 1, 0, 5)).await.unwrap();

        let allowed = repo.policy_filter("org-a", "alice", &[1]).await;
        assert!(allowed.is_empty(), "no acl_allow rows must yield empty, not an error");
    }

    #[tokio::test]
    async fn policy_filter_allows_direct_principal_grant() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("acl_grant.wal")).await.unwrap();

        repo.put_artifact(artifact(1, "org-a", 1)).await.unwrap();
        repo.put_artifact_text(artifact_text(1, "org-a", 1, "hello world"))
            .await
            .unwrap();
        repo.put_evidence_span(span(1, "org-a", 1, 1, 0, 5)).await.unwrap();
        repo.put_acl(Acl {
            id: 1,
            org_id: "org-a".to_string(),
            name: "default".to_string(),
            description: String::new(),
        })
        .await
        .unwrap();
        repo.put_acl_allow(AclAllow {
            id: 1,
            org_id: "org-a".to_string(),
            acl_id: 1,
            allow_type: AllowType::Principal,
            principal_id: Some("alice".to_string()),
            role_id: None,
        })
        .await
        .unwrap();

        let allowed = repo.policy_filter("org-a", "alice", &[1]).await;
        assert_eq!(allowed, vec![1]);

        let denied = repo.policy_filter("org-a", "mallory", &[1]).await;
        assert!(denied.is_empty());
    }

    #[tokio::test]
    async fn tenant_isolation_prevents_cross_org_reads() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("tenancy.wal")).await.unwrap();

        repo.put_artifact(artifact(1, "org-a", 1)).await.unwrap();
        repo.put_artifact_text(artifact_text(1, "org-a", 1, "hello world")).await.unwrap();
        repo.put_evidence_span(span(1, "org-a", 1, 1, 0, 5)).await.unwrap();
        repo.put_evidence_embedding(EvidenceEmbedding {
            evidence_span_id: 1,
            org_id: "org-a".to_string(),
            model_name: "m".to_string(),
            model_version: "v1".to_string(),
            embedding: vec![1.0, 0.0],
        })
        .await
        .unwrap();

        let other_org_results = repo.seed_vector("org-b", &[1.0, 0.0], 10).await;
        assert!(other_org_results.is_empty());

        let own_org_results = repo.seed_vector("org-a", &[1.0, 0.0], 10).await;
        assert_eq!(own_org_results.len(), 1);
    }

    #[tokio::test]
    async fn graph_node_upsert_is_idempotent_by_key() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("upsert.wal")).await.unwrap();

        let key = node_key("org-a", "ship feature x");
        let id = id_from_key(&key);
        let node = GraphNode::new(id, "org-a", "decision", key.clone(), "Ship X", "ship feature x", 100);
        repo.put_single(Mutation::PutGraphNode(node)).await.unwrap();

        let fetched = repo.get_graph_node_by_key("org-a", &key).await.unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn commit_derivation_advances_cursor_atomically() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("cursor.wal")).await.unwrap();

        repo.append_event(EventLogEntry {
            id: 1,
            org_id: "org-a".to_string(),
            event_type: "decision_recorded".to_string(),
            occurred_at: 1,
            ingested_at: 1,
            actor_principal_id: "alice".to_string(),
            artifact_id: None,
            payload_json: "{}".to_string(),
            idempotency_key: None,
            trace_id: None,
            processed_at: None,
        })
        .await
        .unwrap();

        let claimed = repo.claim_next_event("org-a").await.unwrap();
        assert_eq!(claimed.event.id, 1);

        repo.commit_derivation(
            vec![Mutation::MarkEventProcessed {
                org_id: "org-a".to_string(),
                event_id: 1,
                processed_at: 2,
            }],
            DeriverCursor {
                org_id: "org-a".to_string(),
                last_event_id: 1,
                last_occurred_at: 1,
                last_processed_at: 2,
            },
        )
        .await
        .unwrap();

        assert!(repo.claim_next_event("org-a").await.is_none());
        assert_eq!(repo.deriver_cursor("org-a").await.unwrap().last_event_id, 1);
    }

    #[tokio::test]
    async fn repo_replay_on_restart_restores_all_tables() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("replay.wal");

        {
            let repo = Repository::open(&wal_path).await.unwrap();
            repo.put_artifact(artifact(1, "org-a", 1)).await.unwrap();
            repo.put_artifact_text(artifact_text(1, "org-a", 1, "hello world")).await.unwrap();
            repo.put_evidence_span(span(1, "org-a", 1, 1, 0, 5)).await.unwrap();
        }

        {
            let repo = Repository::open(&wal_path).await.unwrap();
            let hydrated = repo.hydrate_spans("org-a", &[1]).await;
            assert_eq!(hydrated.len(), 1);
            assert_eq!(hydrated[0].excerpt, "hello");
        }
    }

    #[tokio::test]
    async fn undirected_expand_one_hop_respects_fanout() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("expand.wal")).await.unwrap();

        let mk_node = |id: u64| GraphNode::new(id, "org-a", "topic", format!("k{id}"), "t", "t", 1);
        for id in 1..=5u64 {
            repo.put_single(Mutation::PutGraphNode(mk_node(id))).await.unwrap();
        }
        for target in 2..=5u64 {
            repo.put_single(Mutation::PutGraphEdge(GraphEdge::new(
                target + 100,
                "org-a",
                1,
                target,
                "relates",
                1.0,
                1,
            )))
            .await
            .unwrap();
        }

        let visited: HashSet<u64> = HashSet::from([1]);
        let expanded = repo.expand_one_hop("org-a", &[1], &visited, 2).await;
        assert_eq!(expanded.len(), 2);
    }

    #[tokio::test]
    async fn backup_snapshot_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("snapshot.wal");
        let snapshot_dir = dir.path().join("snapshots");

        let repo = Repository::open_with_snapshots(&wal_path, &snapshot_dir).await.unwrap();
        repo.put_artifact(artifact(1, "org-a", 1)).await.unwrap();
        repo.put_artifact_text(artifact_text(1, "org-a", 1, "hello world")).await.unwrap();
        repo.put_evidence_span(span(1, "org-a", 1, 1, 0, 5)).await.unwrap();
        repo.create_backup_snapshot().await.unwrap();

        repo.put_evidence_span(span(2, "org-a", 1, 1, 6, 11)).await.unwrap();

        let restored_id = repo.restore_from_latest_backup().await.unwrap();
        assert!(restored_id.starts_with("wal-lsn-"));
        let hydrated = repo.hydrate_spans("org-a", &[1, 2]).await;
        assert_eq!(hydrated.len(), 2);
    }
}
