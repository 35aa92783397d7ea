use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;

/// Typed graph entity keyed by `(org_id, node_type, key)`. `key` is a stable
/// content-hash of `canonical_text` (see `crate::embedding::node_key`).
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct GraphNode {
    pub id: u64,
    pub org_id: String,
    pub node_type: String,
    pub key: String,
    pub title: String,
    pub canonical_text: String,
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GraphNode {
    pub fn new(
        id: u64,
        org_id: impl Into<String>,
        node_type: impl Into<String>,
        key: impl Into<String>,
        title: impl Into<String>,
        canonical_text: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id,
            org_id: org_id.into(),
            node_type: node_type.into(),
            key: key.into(),
            title: title.into(),
            canonical_text: canonical_text.into(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Upsert-merge semantics per spec §3 Lifecycle: title overwritten, metadata
    /// deep-merged, timestamps bumped.
    pub fn merge_from(&mut self, other: &GraphNode, now: i64) {
        self.title = other.title.clone();
        self.canonical_text = other.canonical_text.clone();
        for (k, v) in &other.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.updated_at = now;
    }
}

/// Directed graph edge keyed by `(org_id, src, dst, edge_type)`.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct GraphEdge {
    pub id: u64,
    pub org_id: String,
    pub src: u64,
    pub dst: u64,
    pub edge_type: String,
    pub weight: f32,
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GraphEdge {
    pub fn new(
        id: u64,
        org_id: impl Into<String>,
        src: u64,
        dst: u64,
        edge_type: impl Into<String>,
        weight: f32,
        now: i64,
    ) -> Self {
        Self {
            id,
            org_id: org_id.into(),
            src,
            dst,
            edge_type: edge_type.into(),
            weight,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn merge_from(&mut self, other: &GraphEdge, now: i64) {
        self.weight = other.weight;
        for (k, v) in &other.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.updated_at = now;
    }
}

/// An ingested document. Owns at most one `ArtifactText` and many `EvidenceSpan`s.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct Artifact {
    pub id: u64,
    pub org_id: String,
    pub source_system: String,
    pub source_uri: String,
    pub captured_at: i64,
    pub occurred_at: i64,
    pub author_principal_id: String,
    pub content_type: String,
    pub storage_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub acl_id: u64,
    pub pii_classification: String,
}

/// Normalized UTF-8 body of an artifact plus the data needed to derive a
/// full-text index over it (see `storage::index::lexical`).
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct ArtifactText {
    pub id: u64,
    pub org_id: String,
    pub artifact_id: u64,
    pub normaliser_version: String,
    pub language: String,
    pub text_utf8: String,
    pub text_sha256: String,
}

/// A half-open `[start_char, end_char)` window into an artifact's text.
/// Invariant: `0 <= start_char <= end_char <= text.chars().count()`.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct EvidenceSpan {
    pub id: u64,
    pub org_id: String,
    pub artifact_id: u64,
    pub artifact_text_id: u64,
    pub span_type: String,
    pub start_char: u32,
    pub end_char: u32,
    pub section_path: String,
    pub extracted_by: String,
    pub confidence: f32,
    pub created_at: i64,
}

impl EvidenceSpan {
    pub fn is_bounds_valid(&self, text_len: u32) -> bool {
        self.start_char <= self.end_char && self.end_char <= text_len
    }
}

/// One embedding vector per `(span, model_name, model_version)`. Replaces any
/// prior embedding for the same triple on reindex.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct EvidenceEmbedding {
    pub evidence_span_id: u64,
    pub org_id: String,
    pub model_name: String,
    pub model_version: String,
    pub embedding: Vec<f32>,
}

/// Many-to-many link between a graph edge and the spans that justify it.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct EdgeEvidence {
    pub edge_id: u64,
    pub evidence_span_id: u64,
    pub org_id: String,
    pub confidence: f32,
    pub evidence_type: String,
}

/// Denormalized span -> node link, present as a fast-path cache over
/// `edge_evidence JOIN graph_edge`.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct SpanNode {
    pub org_id: String,
    pub evidence_span_id: u64,
    pub node_id: u64,
}

/// Append-only per-tenant event. Ordering key is `occurred_at`.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct EventLogEntry {
    pub id: u64,
    pub org_id: String,
    pub event_type: String,
    pub occurred_at: i64,
    pub ingested_at: i64,
    pub actor_principal_id: String,
    pub artifact_id: Option<u64>,
    pub payload_json: String,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    pub processed_at: Option<i64>,
}

/// Named per-tenant policy; artifacts reference exactly one.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct Acl {
    pub id: u64,
    pub org_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone, Copy)]
#[archive(check_bytes)]
pub enum AllowType {
    Principal,
    Role,
}

/// Grants an `acl_id` to either a principal directly or to a role.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct AclAllow {
    pub id: u64,
    pub org_id: String,
    pub acl_id: u64,
    pub allow_type: AllowType,
    pub principal_id: Option<String>,
    pub role_id: Option<String>,
}

/// A principal holds a role via this membership row.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct PrincipalRole {
    pub org_id: String,
    pub principal_id: String,
    pub role_id: String,
}

/// Per-tenant bookmark into the event log tracking deriver progress.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct DeriverCursor {
    pub org_id: String,
    pub last_event_id: u64,
    pub last_occurred_at: i64,
    pub last_processed_at: i64,
}
