//! Node representation in a prebuilt HNSW graph

/// A node in the HNSW graph.
///
/// `id` is the ordinal of the record inside its snapshot, so vectors are looked
/// up by position without an indirection table. Layer 0 holds every node;
/// higher layers hold progressively fewer for long-range hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: usize,
    /// `layers[l]` = neighbor ordinals on layer `l`
    pub layers: Vec<Vec<usize>>,
}

impl Node {
    pub fn new(id: usize, layers: Vec<Vec<usize>>) -> Self {
        Self { id, layers }
    }

    /// Highest layer this node participates in.
    pub fn max_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    /// Neighbors at `layer`, empty if the node does not reach that layer.
    pub fn neighbors(&self, layer: usize) -> &[usize] {
        self.layers.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn degree(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }
}
