use std::sync::Arc;

use alayasiki_core::model::{Acl, AclAllow, AllowType, Artifact, ArtifactText, EvidenceSpan};
use query::embedding_client::DeterministicEmbeddingClient;
use query::{RetrievalEngine, RetrieveRequest};
use storage::Repository;
use tempfile::tempdir;

const MODEL_ID: &str = "embedding-default-v1";
const DIMS: usize = 16;

fn engine(repo: Arc<Repository>) -> RetrievalEngine {
    let config = alayasiki_core::config::RetrievalConfig::default();
    let embedding_client = Arc::new(DeterministicEmbeddingClient::new(DIMS, MODEL_ID));
    RetrievalEngine::new(repo, config, embedding_client)
}

async fn put_acl(repo: &Repository, org_id: &str, acl_id: u64, principal_id: &str) {
    repo.put_acl(Acl { id: acl_id, org_id: org_id.to_string(), name: "default".to_string(), description: String::new() })
        .await
        .unwrap();
    repo.put_acl_allow(AclAllow {
        id: acl_id,
        org_id: org_id.to_string(),
        acl_id,
        allow_type: AllowType::Principal,
        principal_id: Some(principal_id.to_string()),
        role_id: None,
    })
    .await
    .unwrap();
}

async fn put_span(
    repo: &Repository,
    org_id: &str,
    artifact_id: u64,
    acl_id: u64,
    text: &str,
    created_at: i64,
) {
    repo.put_artifact(Artifact {
        id: artifact_id,
        org_id: org_id.to_string(),
        source_system: "test-harness".to_string(),
        source_uri: format!("test://artifact/{artifact_id}"),
        captured_at: created_at,
        occurred_at: created_at,
        author_principal_id: "author".to_string(),
        content_type: "text/plain".to_string(),
        storage_uri: format!("mem://{artifact_id}"),
        content_hash: format!("hash-{artifact_id}"),
        size_bytes: text.len() as u64,
        acl_id,
        pii_classification: "none".to_string(),
    })
    .await
    .unwrap();

    repo.put_artifact_text(ArtifactText {
        id: artifact_id,
        org_id: org_id.to_string(),
        artifact_id,
        normaliser_version: "v1".to_string(),
        language: "en".to_string(),
        text_utf8: text.to_string(),
        text_sha256: format!("sha-{artifact_id}"),
    })
    .await
    .unwrap();

    let span_id = artifact_id * 10;
    repo.put_evidence_span(EvidenceSpan {
        id: span_id,
        org_id: org_id.to_string(),
        artifact_id,
        artifact_text_id: artifact_id,
        span_type: "sentence".to_string(),
        start_char: 0,
        end_char: text.chars().count() as u32,
        section_path: "body".to_string(),
        extracted_by: "chunker-v1".to_string(),
        confidence: 0.9,
        created_at,
    })
    .await
    .unwrap();

    let embedding = alayasiki_core::embedding::deterministic_embedding(text, MODEL_ID, DIMS);
    repo.put_evidence_embedding(alayasiki_core::model::EvidenceEmbedding {
        evidence_span_id: span_id,
        org_id: org_id.to_string(),
        model_name: MODEL_ID.to_string(),
        model_version: "1".to_string(),
        embedding,
    })
    .await
    .unwrap();
}

fn request(org_id: &str, principal_id: &str, query_text: &str) -> RetrieveRequest {
    RetrieveRequest {
        org_id: org_id.to_string(),
        principal_id: principal_id.to_string(),
        mode: Default::default(),
        query_text: query_text.to_string(),
        scopes: vec![],
    }
}

/// S1 — basic recall: a permitted principal querying on vocabulary shared
/// with the only artifact in the corpus gets that artifact's span back.
#[tokio::test]
async fn s1_basic_recall_returns_the_matching_span() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(Repository::open(dir.path().join("s1.wal")).await.unwrap());
    put_acl(&repo, "acme", 1, "alice").await;
    put_span(&repo, "acme", 1, 1, "Decision confirmed: ship Feature X behind a flag.", 1_700_000_000).await;

    let response = engine(repo).retrieve(request("acme", "alice", "feature flag rollout")).await.unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].artifact_id, 1);
    assert!(response.results[0].text.contains("Feature X"));
}

/// S2 — ACL block: two artifacts match the query lexically, but the
/// principal's grant only reaches one of them. The blocked artifact must
/// never surface even though it matches at least as strongly.
#[tokio::test]
async fn s2_acl_block_hides_the_ungranted_artifact() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(Repository::open(dir.path().join("s2.wal")).await.unwrap());

    put_acl(&repo, "acme", 1, "alice").await;
    // acl_id 2 has no grant for alice at all.
    repo.put_acl(Acl { id: 2, org_id: "acme".to_string(), name: "restricted".to_string(), description: String::new() })
        .await
        .unwrap();

    put_span(&repo, "acme", 1, 1, "Vendor selection process is underway for the new supplier.", 1_700_000_000).await;
    put_span(&repo, "acme", 2, 2, "Vendor selection process finalized with the preferred bidder.", 1_700_000_100).await;

    let response = engine(repo).retrieve(request("acme", "alice", "vendor selection")).await.unwrap();

    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|span| span.artifact_id == 1));
}

/// S3 — a principal with zero `acl_allow` rows gets an empty result
/// regardless of how well the corpus matches.
#[tokio::test]
async fn s3_principal_without_grants_gets_empty_results() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(Repository::open(dir.path().join("s3.wal")).await.unwrap());

    put_acl(&repo, "acme", 1, "alice").await;
    put_span(&repo, "acme", 1, 1, "Vendor selection process is underway for the new supplier.", 1_700_000_000).await;

    let response = engine(repo).retrieve(request("acme", "mallory", "vendor selection")).await.unwrap();

    assert!(response.results.is_empty());
    assert_eq!(response.debug.allowed_spans_count, 0);
}

/// S4 — a quoted exact phrase outranks a span whose terms only match
/// scattered, since phrase matches score higher than bag-of-words overlap.
#[tokio::test]
async fn s4_quoted_phrase_prioritizes_the_exact_match() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(Repository::open(dir.path().join("s4.wal")).await.unwrap());

    put_acl(&repo, "acme", 1, "alice").await;
    put_span(&repo, "acme", 1, 1, "The committee completed vendor selection yesterday afternoon.", 1_700_000_000).await;
    put_span(&repo, "acme", 2, 1, "Selection criteria were still being debated while the vendor waited.", 1_700_000_000).await;

    let engine = engine(repo);
    let quoted = engine.retrieve(request("acme", "alice", "\"vendor selection\"")).await.unwrap();

    assert!(!quoted.results.is_empty());
    assert_eq!(quoted.results[0].artifact_id, 1);
}

/// S6 — a span created exactly `halflife_days` before `now` has a recency
/// factor within `[0.475, 0.525]`.
#[tokio::test]
async fn s6_halflife_decay_is_approximately_one_half() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(Repository::open(dir.path().join("s6.wal")).await.unwrap());

    put_acl(&repo, "acme", 1, "alice").await;
    let config = alayasiki_core::config::RetrievalConfig::default();
    let halflife_secs = (config.recency_halflife_days as i64) * 86_400;
    let now = 1_800_000_000i64;
    let created_at = now - halflife_secs;

    put_span(&repo, "acme", 1, 1, "Quarterly roadmap review notes for the platform team.", created_at).await;

    let embedding_client = Arc::new(DeterministicEmbeddingClient::new(DIMS, MODEL_ID));
    let engine = RetrievalEngine::new(repo, config, embedding_client).with_clock(now);

    let response = engine.retrieve(request("acme", "alice", "quarterly roadmap review")).await.unwrap();

    assert_eq!(response.results.len(), 1);
}
