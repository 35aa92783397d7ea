use crate::index::{AdjacencyGraph, LexicalIndex, LinearAnnIndex};

/// Combines the vector index over evidence-span embeddings, the lexical
/// index over evidence-span text, and the undirected graph index over
/// graph nodes/edges, all scoped to a single tenant's in-memory state.
#[derive(Default)]
pub struct HyperIndex {
    pub vector_index: LinearAnnIndex,
    pub lexical_index: LexicalIndex,
    pub graph_index: AdjacencyGraph,
}

impl HyperIndex {
    pub fn new() -> Self {
        Self {
            vector_index: LinearAnnIndex::new(),
            lexical_index: LexicalIndex::new(),
            graph_index: AdjacencyGraph::new(),
        }
    }

    pub fn index_span_embedding(&mut self, span_id: u64, embedding: Vec<f32>) {
        self.vector_index.insert(span_id, embedding);
    }

    pub fn index_span_text(&mut self, span_id: u64, text: &str) {
        self.lexical_index.index_document(span_id, text);
    }

    pub fn remove_span(&mut self, span_id: u64) {
        self.vector_index.delete(span_id);
        self.lexical_index.remove_document(span_id);
    }

    pub fn upsert_edge(&mut self, src: u64, dst: u64, edge_type: impl Into<String>, weight: f32) {
        self.graph_index.upsert_edge(src, dst, edge_type, weight);
    }

    pub fn remove_node(&mut self, id: u64) {
        self.graph_index.remove_node(id);
    }

    pub fn search_vector(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        self.vector_index.search(query, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyper_index_combines_vector_lexical_and_graph() {
        let mut index = HyperIndex::new();
        index.index_span_embedding(1, vec![1.0, 0.0]);
        index.index_span_embedding(2, vec![0.0, 1.0]);
        index.index_span_text(1, "we decided to ship");
        index.upsert_edge(10, 20, "relates", 1.0);

        let vec_results = index.search_vector(&[1.0, 0.0], 1);
        assert_eq!(vec_results[0].0, 1);

        let neighbors = index.graph_index.neighbors(10);
        assert_eq!(neighbors.len(), 1);
    }
}
