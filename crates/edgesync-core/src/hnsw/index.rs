//! Graph traversal over a prebuilt HNSW index
//!
//! **Search**: start at the entry point, greedy descent to layer 1, then a beam
//! search of width `ef` on layer 0. Distances are `1 - dot`, so with unit
//! vectors the returned score `1 - distance` is the cosine similarity.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::node::Node;
use super::visited::VisitedGuard;
use super::{GraphError, MAX_LAYERS};
use crate::simd::dot_product;

/// Frontier entry (min-heap by distance).
#[derive(Clone, Copy)]
struct Frontier {
    id: usize,
    distance: f32,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Beam entry (max-heap by distance, so the worst result is on top).
#[derive(Clone, Copy)]
struct Found {
    id: usize,
    distance: f32,
}

impl PartialEq for Found {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Found {}

impl Ord for Found {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Found {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A validated, read-only HNSW graph.
///
/// Node `i` always describes record ordinal `i`, and every edge stays inside
/// `0..len()`; [`HnswGraph::from_parts`] refuses anything else, so traversal
/// never needs bounds checks against the vector section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HnswGraph {
    nodes: Vec<Node>,
    entry_point: Option<usize>,
    max_layer: usize,
    /// Max neighbors per upper layer the server built with (informational).
    m: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    pub num_nodes: usize,
    pub max_layer: usize,
    pub total_edges: usize,
    pub m: usize,
}

impl HnswGraph {
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            m: 0,
        }
    }

    /// Assemble a graph, rejecting out-of-bounds ids, neighbors, or layers.
    pub fn from_parts(
        nodes: Vec<Node>,
        entry_point: Option<usize>,
        max_layer: usize,
        m: usize,
    ) -> Result<Self, GraphError> {
        if max_layer >= MAX_LAYERS {
            return Err(GraphError::TooManyLayers(max_layer + 1));
        }
        let n = nodes.len();
        match entry_point {
            None if n > 0 => return Err(GraphError::MissingEntryPoint),
            Some(entry) if entry >= n => {
                return Err(GraphError::EntryOutOfBounds { entry, nodes: n })
            }
            Some(entry) => {
                let entry_layer = nodes[entry].max_layer();
                if entry_layer != max_layer {
                    return Err(GraphError::EntryLayerMismatch {
                        entry_layer,
                        max_layer,
                    });
                }
            }
            None => {}
        }

        for (position, node) in nodes.iter().enumerate() {
            if node.id != position {
                return Err(GraphError::NodeIdMismatch {
                    position,
                    id: node.id,
                });
            }
            if node.max_layer() > max_layer {
                return Err(GraphError::NodeAboveMaxLayer {
                    node: node.id,
                    layer: node.max_layer(),
                    max_layer,
                });
            }
            for layer in &node.layers {
                if let Some(&neighbor) = layer.iter().find(|&&nb| nb >= n) {
                    return Err(GraphError::NeighborOutOfBounds {
                        node: node.id,
                        neighbor,
                        nodes: n,
                    });
                }
            }
        }

        Ok(Self {
            nodes,
            entry_point,
            max_layer,
            m,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn entry_point(&self) -> Option<usize> {
        self.entry_point
    }

    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            num_nodes: self.nodes.len(),
            max_layer: self.max_layer,
            total_edges: self.nodes.iter().map(Node::degree).sum(),
            m: self.m,
        }
    }

    /// Approximate top-`k` neighbors of `query`.
    ///
    /// `vector_fn(i)` must return the unit vector of ordinal `i`. Returns
    /// `(ordinal, similarity)` sorted by similarity descending.
    pub fn search<'v, F>(&self, query: &[f32], k: usize, ef: usize, vector_fn: F) -> Vec<(usize, f32)>
    where
        F: Fn(usize) -> &'v [f32],
    {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            let nearest = self.search_layer(query, current, 1, layer, &vector_fn);
            if let Some(&(id, _)) = nearest.first() {
                current = id;
            }
        }

        self.search_layer(query, current, ef.max(k), 0, &vector_fn)
            .into_iter()
            .take(k)
            .map(|(id, distance)| (id, 1.0 - distance))
            .collect()
    }

    fn search_layer<'v, F>(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
        vector_fn: &F,
    ) -> Vec<(usize, f32)>
    where
        F: Fn(usize) -> &'v [f32],
    {
        let distance = |id: usize| 1.0 - dot_product(query, vector_fn(id));
        let mut visited = VisitedGuard::new(self.nodes.len());
        let mut frontier: BinaryHeap<Frontier> = BinaryHeap::with_capacity(ef);
        let mut found: BinaryHeap<Found> = BinaryHeap::with_capacity(ef + 1);

        visited.insert(entry);
        let d = distance(entry);
        frontier.push(Frontier { id: entry, distance: d });
        found.push(Found { id: entry, distance: d });

        while let Some(current) = frontier.pop() {
            if let Some(worst) = found.peek() {
                if found.len() >= ef && current.distance > worst.distance {
                    break;
                }
            }

            for &neighbor in self.nodes[current.id].neighbors(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = distance(neighbor);
                let dominated = found.len() >= ef
                    && found.peek().map(|w| d > w.distance).unwrap_or(false);
                if dominated {
                    continue;
                }
                frontier.push(Frontier {
                    id: neighbor,
                    distance: d,
                });
                found.push(Found {
                    id: neighbor,
                    distance: d,
                });
                if found.len() > ef {
                    found.pop();
                }
            }
        }

        let mut out: Vec<(usize, f32)> = found.into_iter().map(|f| (f.id, f.distance)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }
}
