use crate::queue::DeriverTask;
use alayasiki_core::embedding::{id_from_key, node_key};
use alayasiki_core::error::{AlayasikiError, ErrorCode};
use alayasiki_core::model::{DeriverCursor, EdgeEvidence, EventLogEntry, GraphEdge, GraphNode, SpanNode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use storage::{Mutation, RepoError, Repository};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Per-event derivation failure (spec §7: logged, never surfaced to a
/// retrieval caller — only halts that tenant's drain loop).
#[derive(Debug, Error)]
pub enum DeriverError {
    #[error("store error while deriving event {event_id}: {source}")]
    Store { event_id: u64, source: RepoError },
}

impl AlayasikiError for DeriverError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Internal
    }
}

const EVIDENCE_CONFIDENCE: f32 = 0.85;
const EVIDENCE_TYPE: &str = "derived_from_event";

/// Permissive shape of `EventLogEntry::payload_json`. Every field is
/// optional: a payload missing fields this event's `kind` doesn't use is a
/// normal event, not a decode failure. Only genuinely malformed JSON (not an
/// object, or not valid JSON at all) fails to parse.
#[derive(Debug, Deserialize, Default)]
struct EventEnvelope {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    assumptions: Vec<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    decision_ref: Option<String>,
    #[serde(default)]
    relates_to: Option<String>,
}

/// Consumes `DeriverTask`s and drains each tenant's event-log backlog to the
/// head, deriving typed graph nodes/edges with evidence provenance. One
/// worker serves every tenant but never interleaves two tenants' derivations
/// concurrently with each other's cursor advance (spec §4.1).
pub struct DeriverWorker {
    receiver: mpsc::Receiver<DeriverTask>,
    repo: Arc<Repository>,
}

impl DeriverWorker {
    pub fn new(receiver: mpsc::Receiver<DeriverTask>, repo: Arc<Repository>) -> Self {
        Self { receiver, repo }
    }

    pub async fn run(mut self) {
        info!("deriver worker started");
        while let Some(task) = self.receiver.recv().await {
            self.drain_tenant(&task.org_id).await;
        }
        info!("deriver worker stopped");
    }

    /// Processes events for `org_id` until the tenant is caught up. Stops on
    /// the first hard derivation failure rather than skipping past it, so a
    /// poison event blocks (and is visible via the stalled cursor) instead of
    /// being silently dropped.
    async fn drain_tenant(&self, org_id: &str) {
        loop {
            let Some(claimed) = self.repo.claim_next_event(org_id).await else {
                break;
            };
            let event = claimed.event;

            let envelope: EventEnvelope = match serde_json::from_str(&event.payload_json) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(event_id = event.id, org_id, "skipping undecodable event payload: {err}");
                    self.advance_cursor_only(org_id, &event).await;
                    continue;
                }
            };

            if let Err(err) = self.derive_event(org_id, &event, envelope).await {
                error!(event_id = event.id, org_id, "derivation failed: {err}");
                break;
            }
        }
    }

    async fn advance_cursor_only(&self, org_id: &str, event: &EventLogEntry) {
        let now = current_timestamp();
        let cursor = DeriverCursor {
            org_id: org_id.to_string(),
            last_event_id: event.id,
            last_occurred_at: event.occurred_at,
            last_processed_at: now,
        };
        if let Err(err) = self
            .repo
            .commit_derivation(
                vec![Mutation::MarkEventProcessed {
                    org_id: org_id.to_string(),
                    event_id: event.id,
                    processed_at: now,
                }],
                cursor,
            )
            .await
        {
            error!("failed to advance cursor past undecodable event {}: {}", event.id, err);
        }
    }

    async fn derive_event(&self, org_id: &str, event: &EventLogEntry, envelope: EventEnvelope) -> Result<(), DeriverError> {
        let now = current_timestamp();
        let mut mutations = Vec::new();
        let mut created_edges: Vec<GraphEdge> = Vec::new();

        match envelope.kind.as_deref() {
            Some("decision") => {
                let title = envelope.title.clone().unwrap_or_else(|| format!("decision-{}", event.id));
                let decision_id = self
                    .upsert_node(org_id, "decision", &title, &title, describe(&envelope.description), now, &mut mutations)
                    .await;

                for assumption in &envelope.assumptions {
                    let assumption_id = self
                        .upsert_node(org_id, "assumption", assumption, assumption, HashMap::new(), now, &mut mutations)
                        .await;
                    created_edges.push(
                        self.upsert_edge(org_id, decision_id, assumption_id, "depends_on", 0.9, now, &mut mutations)
                            .await,
                    );
                }

                if let Some(owner) = &envelope.owner {
                    let person_id = self.upsert_node(org_id, "person", owner, owner, HashMap::new(), now, &mut mutations).await;
                    created_edges.push(
                        self.upsert_edge(org_id, decision_id, person_id, "decided_by", 1.0, now, &mut mutations)
                            .await,
                    );
                }

                let level = envelope.priority.clone().unwrap_or_else(|| "P2".to_string());
                let priority_title = format!("priority:{level}");
                let priority_id = self
                    .upsert_node(org_id, "priority", &priority_title, &priority_title, HashMap::new(), now, &mut mutations)
                    .await;
                created_edges.push(
                    self.upsert_edge(org_id, decision_id, priority_id, "relates_to", 0.8, now, &mut mutations)
                        .await,
                );
            }
            Some("outcome") => {
                let title = envelope.title.clone().unwrap_or_else(|| format!("outcome-{}", event.id));
                let outcome_id = self
                    .upsert_node(org_id, "outcome", &title, &title, describe(&envelope.description), now, &mut mutations)
                    .await;

                if let Some(reference) = &envelope.decision_ref {
                    if let Some(decision) = self.repo.find_graph_node_by_reference(org_id, "decision", reference).await {
                        created_edges.push(
                            self.upsert_edge(org_id, decision.id, outcome_id, "affects", 1.0, now, &mut mutations)
                                .await,
                        );
                    } else {
                        warn!(event_id = event.id, org_id, reference, "outcome.decision_ref did not resolve to a decision node");
                    }
                }
            }
            Some("risk") => {
                let title = envelope.title.clone().unwrap_or_else(|| format!("risk-{}", event.id));
                let risk_id = self
                    .upsert_node(org_id, "risk", &title, &title, describe(&envelope.description), now, &mut mutations)
                    .await;

                if let Some(reference) = &envelope.relates_to {
                    let target = match self.repo.find_graph_node_by_reference(org_id, "decision", reference).await {
                        Some(node) => Some(node),
                        None => self.repo.find_graph_node_by_reference(org_id, "outcome", reference).await,
                    };
                    match target {
                        Some(target) => {
                            created_edges.push(
                                self.upsert_edge(org_id, risk_id, target.id, "affects", 0.9, now, &mut mutations)
                                    .await,
                            );
                        }
                        None => {
                            warn!(event_id = event.id, org_id, reference, "risk.relates_to did not resolve to a node");
                        }
                    }
                }
            }
            _ => {
                let title = envelope
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", event.event_type, event.id));
                self.upsert_node(org_id, "event", &title, &title, HashMap::new(), now, &mut mutations).await;
            }
        }

        self.attach_evidence(org_id, event, &created_edges, &mut mutations).await;

        mutations.push(Mutation::MarkEventProcessed {
            org_id: org_id.to_string(),
            event_id: event.id,
            processed_at: now,
        });

        let cursor = DeriverCursor {
            org_id: org_id.to_string(),
            last_event_id: event.id,
            last_occurred_at: event.occurred_at,
            last_processed_at: now,
        };

        self.repo
            .commit_derivation(mutations, cursor)
            .await
            .map_err(|source| DeriverError::Store { event_id: event.id, source })?;
        Ok(())
    }

    /// Step 4: for every edge touched by this event, attach evidence from the
    /// source event's artifact spans, and denormalize both edge endpoints
    /// into the `span→node` cache.
    async fn attach_evidence(&self, org_id: &str, event: &EventLogEntry, edges: &[GraphEdge], mutations: &mut Vec<Mutation>) {
        let Some(artifact_id) = event.artifact_id else {
            return;
        };
        if edges.is_empty() {
            return;
        }
        let span_ids = self.repo.spans_for_artifact(org_id, artifact_id).await;

        for edge in edges {
            for &span_id in &span_ids {
                mutations.push(Mutation::PutEdgeEvidence(EdgeEvidence {
                    edge_id: edge.id,
                    evidence_span_id: span_id,
                    org_id: org_id.to_string(),
                    confidence: EVIDENCE_CONFIDENCE,
                    evidence_type: EVIDENCE_TYPE.to_string(),
                }));
                mutations.push(Mutation::PutSpanNode(SpanNode {
                    org_id: org_id.to_string(),
                    evidence_span_id: span_id,
                    node_id: edge.src,
                }));
                mutations.push(Mutation::PutSpanNode(SpanNode {
                    org_id: org_id.to_string(),
                    evidence_span_id: span_id,
                    node_id: edge.dst,
                }));
            }
        }
    }

    async fn upsert_node(
        &self,
        org_id: &str,
        node_type: &str,
        title: &str,
        canonical_text: &str,
        metadata: HashMap<String, String>,
        now: i64,
        mutations: &mut Vec<Mutation>,
    ) -> u64 {
        let key = node_key(org_id, canonical_text);
        let node = match self.repo.get_graph_node_by_key(org_id, &key).await {
            Some(mut existing) => {
                let mut incoming = GraphNode::new(existing.id, org_id, node_type, key, title, canonical_text, now);
                incoming.metadata = metadata;
                existing.merge_from(&incoming, now);
                existing
            }
            None => {
                let mut node = GraphNode::new(id_from_key(&key), org_id, node_type, key, title, canonical_text, now);
                node.metadata = metadata;
                node
            }
        };
        let id = node.id;
        mutations.push(Mutation::PutGraphNode(node));
        id
    }

    async fn upsert_edge(
        &self,
        org_id: &str,
        src: u64,
        dst: u64,
        edge_type: &str,
        weight: f32,
        now: i64,
        mutations: &mut Vec<Mutation>,
    ) -> GraphEdge {
        let edge = match self.repo.get_graph_edge(org_id, src, dst, edge_type).await {
            Some(mut existing) => {
                let incoming = GraphEdge::new(existing.id, org_id, src, dst, edge_type, weight, now);
                existing.merge_from(&incoming, now);
                existing
            }
            None => {
                let key = format!("{src}:{dst}:{edge_type}");
                GraphEdge::new(id_from_key(&key), org_id, src, dst, edge_type, weight, now)
            }
        };
        mutations.push(Mutation::PutGraphEdge(edge.clone()));
        edge
    }
}

fn describe(description: &Option<String>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(description) = description {
        metadata.insert("description".to_string(), description.clone());
    }
    metadata
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
