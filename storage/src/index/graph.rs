use std::collections::{HashMap, HashSet, VecDeque};

/// Edge representation: (target_id, edge_type, weight)
pub type EdgeData = (u64, String, f32);

/// Adjacency-list graph index. Maintains both forward (`src -> dst`) and
/// reverse (`dst -> src`) adjacency so that BFS expansion can treat edges as
/// undirected (spec §4.2 Stage 3: "undirected, capped-fanout BFS").
#[derive(Clone, Debug, Default)]
pub struct AdjacencyGraph {
    forward: HashMap<u64, Vec<EdgeData>>,
    reverse: HashMap<u64, Vec<EdgeData>>,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Insert or replace the single edge matching `(source, target, edge_type)`.
    pub fn upsert_edge(&mut self, source: u64, target: u64, edge_type: impl Into<String>, weight: f32) {
        let edge_type = edge_type.into();

        let fwd = self.forward.entry(source).or_default();
        if let Some(existing) = fwd.iter_mut().find(|(t, ty, _)| *t == target && *ty == edge_type) {
            existing.2 = weight;
        } else {
            fwd.push((target, edge_type.clone(), weight));
        }

        let rev = self.reverse.entry(target).or_default();
        if let Some(existing) = rev.iter_mut().find(|(s, ty, _)| *s == source && *ty == edge_type) {
            existing.2 = weight;
        } else {
            rev.push((source, edge_type, weight));
        }
    }

    pub fn remove_node(&mut self, id: u64) {
        if let Some(edges) = self.forward.remove(&id) {
            for (target, edge_type, _) in edges {
                if let Some(rev) = self.reverse.get_mut(&target) {
                    rev.retain(|(s, ty, _)| !(*s == id && *ty == edge_type));
                }
            }
        }
        if let Some(edges) = self.reverse.remove(&id) {
            for (source, edge_type, _) in edges {
                if let Some(fwd) = self.forward.get_mut(&source) {
                    fwd.retain(|(t, ty, _)| !(*t == id && *ty == edge_type));
                }
            }
        }
    }

    /// Outgoing edges only.
    pub fn outgoing(&self, id: u64) -> Vec<&EdgeData> {
        self.forward.get(&id).map(|e| e.iter().collect()).unwrap_or_default()
    }

    /// Incoming edges only.
    pub fn incoming(&self, id: u64) -> Vec<&EdgeData> {
        self.reverse.get(&id).map(|e| e.iter().collect()).unwrap_or_default()
    }

    /// Union of both directions, i.e. the undirected neighbor set.
    pub fn neighbors(&self, id: u64) -> Vec<EdgeData> {
        let mut out: Vec<EdgeData> = self.outgoing(id).into_iter().cloned().collect();
        out.extend(self.incoming(id).into_iter().cloned());
        out
    }

    /// One undirected BFS hop from the given frontier, capped at `fanout`
    /// distinct neighbors per source node (spec §4.1 `hop_fanout`). Already
    /// visited nodes (including the frontier itself) are excluded from the
    /// result.
    pub fn expand_one_hop(&self, frontier: &[u64], visited: &HashSet<u64>, fanout: usize) -> Vec<u64> {
        let mut seen_this_hop: HashSet<u64> = HashSet::new();
        let mut result = Vec::new();

        for &node_id in frontier {
            let mut neighbor_count = 0usize;
            for (neighbor, _, _) in self.neighbors(node_id) {
                if neighbor_count >= fanout {
                    break;
                }
                if visited.contains(&neighbor) || seen_this_hop.contains(&neighbor) {
                    continue;
                }
                seen_this_hop.insert(neighbor);
                result.push(neighbor);
                neighbor_count += 1;
            }
        }

        result
    }

    /// Multi-hop BFS from a single start node. Returns `(node_id, hop_distance)`
    /// pairs, excluding the start node. Used by tests and by callers that want
    /// the whole k-hop neighborhood rather than iterative per-hop control.
    pub fn expand(&self, start_id: u64, max_hops: u8, fanout: usize) -> Vec<(u64, u8)> {
        if max_hops == 0 {
            return vec![];
        }

        let mut visited: HashSet<u64> = HashSet::from([start_id]);
        let mut frontier = vec![start_id];
        let mut result = Vec::new();

        for hop in 1..=max_hops {
            let next = self.expand_one_hop(&frontier, &visited, fanout);
            if next.is_empty() {
                break;
            }
            for &id in &next {
                visited.insert(id);
                result.push((id, hop));
            }
            frontier = next;
        }

        result
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(|v| v.len()).sum()
    }

    pub fn node_ids(&self) -> Vec<u64> {
        let mut nodes: std::collections::BTreeSet<u64> = std::collections::BTreeSet::new();
        for (&source, edges) in &self.forward {
            nodes.insert(source);
            for (target, _, _) in edges {
                nodes.insert(*target);
            }
        }
        for &target in self.reverse.keys() {
            nodes.insert(target);
        }
        nodes.into_iter().collect()
    }

    pub fn contains_node(&self, id: u64) -> bool {
        self.forward.contains_key(&id) || self.reverse.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undirected_expansion_follows_edges_in_both_directions() {
        let mut graph = AdjacencyGraph::new();
        graph.upsert_edge(1, 2, "relates", 1.0);
        graph.upsert_edge(3, 1, "relates", 1.0); // incoming to 1

        let neighbors: Vec<u64> = graph.neighbors(1).into_iter().map(|(t, _, _)| t).collect();
        assert!(neighbors.contains(&2));
        assert!(neighbors.contains(&3));
    }

    #[test]
    fn expand_respects_hop_fanout_cap() {
        let mut graph = AdjacencyGraph::new();
        for target in 2..=10u64 {
            graph.upsert_edge(1, target, "relates", 1.0);
        }

        let one_hop = graph.expand_one_hop(&[1], &HashSet::from([1]), 3);
        assert_eq!(one_hop.len(), 3);
    }

    #[test]
    fn expand_two_hops_excludes_start_and_visited() {
        let mut graph = AdjacencyGraph::new();
        graph.upsert_edge(1, 2, "relates", 1.0);
        graph.upsert_edge(2, 3, "relates", 1.0);
        graph.upsert_edge(2, 1, "relates", 1.0); // back-edge must not revisit 1

        let result = graph.expand(1, 2, 80);
        let ids: Vec<u64> = result.iter().map(|(id, _)| *id).collect();
        assert!(ids.contains(&2));
        assert!(ids.contains(&3));
        assert!(!ids.contains(&1));
    }

    #[test]
    fn remove_node_clears_both_adjacency_directions() {
        let mut graph = AdjacencyGraph::new();
        graph.upsert_edge(1, 2, "relates", 1.0);
        graph.remove_node(2);
        assert!(graph.neighbors(1).is_empty());
        assert!(!graph.contains_node(2));
    }
}
