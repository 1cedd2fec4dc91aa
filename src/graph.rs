//! In-memory graph algorithms over one edge relation.

use crate::error::StoreError;
use crate::store::Store;
use crate::types::Relation;
use std::collections::{BTreeMap, BTreeSet};

/// Adjacency over one relation, captured at load time.
///
/// Edges are oriented prerequisite -> dependent: `blocks` edges keep
/// their stored direction, `depends-on` edges are flipped, so a
/// topological order is always a valid execution order. `related`
/// edges keep their stored direction. Algorithms run entirely in
/// memory; mutations after `load` do not affect a snapshot. Every
/// record is a vertex, as is every edge endpoint, including targets
/// that do not exist locally.
pub struct GraphSnapshot {
    vertices: BTreeSet<String>,
    forward: BTreeMap<String, BTreeSet<String>>,
    reverse: BTreeMap<String, BTreeSet<String>>,
    edge_count: usize,
}

impl GraphSnapshot {
    /// Capture the current graph of one relation.
    pub fn load(store: &Store, relation: Relation) -> Result<Self, StoreError> {
        let index = store.storage().index_fresh()?;
        let mut snapshot = Self {
            vertices: index.node_ids(None)?.into_iter().collect(),
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
            edge_count: 0,
        };
        for (source, target) in index.relation_edges(relation)? {
            let (from, to) = match relation {
                Relation::DependsOn => (target, source),
                _ => (source, target),
            };
            snapshot.insert_edge(from, to);
        }
        Ok(snapshot)
    }

    fn insert_edge(&mut self, from: String, to: String) {
        self.vertices.insert(from.clone());
        self.vertices.insert(to.clone());
        if self.forward.entry(from.clone()).or_default().insert(to.clone()) {
            self.reverse.entry(to).or_default().insert(from);
            self.edge_count += 1;
        }
    }

    pub fn node_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vertices.contains(id)
    }

    /// Vertices in lexicographic order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.vertices.iter().map(|s| s.as_str())
    }

    /// Number of prerequisites feeding `id`.
    pub fn fan_in(&self, id: &str) -> usize {
        self.reverse.get(id).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of records waiting on `id`.
    pub fn fan_out(&self, id: &str) -> usize {
        self.forward.get(id).map(|s| s.len()).unwrap_or(0)
    }

    /// First cycle found by depth-first search, as the ordered ids along
    /// its edges, or `None` when the graph is acyclic. Deterministic:
    /// vertices and successors are explored in lexicographic order.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut in_path = BTreeSet::new();
        let mut path = Vec::new();
        for start in &self.vertices {
            if visited.contains(start.as_str()) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(start, &mut visited, &mut in_path, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        in_path: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        in_path.insert(node.to_string());
        path.push(node.to_string());

        if let Some(nexts) = self.forward.get(node) {
            for next in nexts {
                if in_path.contains(next.as_str()) {
                    // The tail of the current path, from the revisited
                    // vertex onward, is exactly the cycle.
                    let start = path.iter().position(|p| p == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                if !visited.contains(next.as_str())
                    && let Some(cycle) = self.dfs_cycle(next, visited, in_path, path)
                {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        in_path.remove(node);
        visited.insert(node.to_string());
        None
    }

    /// Kahn's algorithm with lexicographic tie-break. `Err` carries the
    /// cycle that prevents a total order.
    pub fn topo_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> =
            self.vertices.iter().map(|v| (v.as_str(), 0)).collect();
        for targets in self.forward.values() {
            for target in targets {
                if let Some(d) = indegree.get_mut(target.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| *v)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(next);
            order.push(next.to_string());
            if let Some(targets) = self.forward.get(next) {
                for target in targets {
                    if let Some(d) = indegree.get_mut(target.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(target.as_str());
                        }
                    }
                }
            }
        }

        if order.len() == self.vertices.len() {
            Ok(order)
        } else {
            Err(self.find_cycle().unwrap_or_default())
        }
    }

    /// The longest prerequisite chain, prerequisites first. A graph with
    /// no edges yields a single vertex; a cyclic graph yields nothing.
    pub fn critical_path(&self) -> Vec<String> {
        let order = match self.topo_order() {
            Ok(order) => order,
            Err(_) => return Vec::new(),
        };

        // Longest path ending at each vertex, with its chosen predecessor.
        let mut best: BTreeMap<String, (usize, Option<String>)> = self
            .vertices
            .iter()
            .map(|v| (v.clone(), (1, None)))
            .collect();
        for v in &order {
            let len_v = best.get(v).map(|(len, _)| *len).unwrap_or(1);
            if let Some(targets) = self.forward.get(v) {
                for target in targets {
                    if let Some(entry) = best.get_mut(target)
                        && len_v + 1 > entry.0
                    {
                        *entry = (len_v + 1, Some(v.clone()));
                    }
                }
            }
        }

        let mut end: Option<(&String, usize)> = None;
        for (id, (len, _)) in &best {
            match end {
                Some((_, best_len)) if *len <= best_len => {}
                _ => end = Some((id, *len)),
            }
        }

        let mut path = Vec::new();
        let mut current = end.map(|(id, _)| id.clone());
        while let Some(id) = current {
            current = best.get(&id).and_then(|(_, prev)| prev.clone());
            path.push(id);
        }
        path.reverse();
        path
    }
}
