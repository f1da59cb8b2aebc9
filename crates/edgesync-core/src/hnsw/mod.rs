//! Search-only HNSW (Hierarchical Navigable Small World) graph
//!
//! Graphs are built by the indexing server and shipped inside snapshots; the
//! edge only validates and traverses them.
//!
//! ```text
//! Layer 2: ●───────────────────● (few nodes, long-range)
//!          │                   │
//! Layer 1: ●───●───────●───────● (more nodes)
//!          │   │       │       │
//! Layer 0: ●─●─●─●─●─●─●─●─●─●─● (every record)
//! ```

mod index;
mod node;
mod serialize;
mod visited;

use thiserror::Error;

pub use index::{GraphStats, HnswGraph};
pub use node::Node;
pub use serialize::GRAPH_MAGIC;
pub use visited::VisitedGuard;

/// Highest layer index a decoded graph may declare.
pub const MAX_LAYERS: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("invalid graph magic: expected EDGGRAPH")]
    InvalidMagic,

    #[error("graph truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("graph declares {0} layers (max {MAX_LAYERS})")]
    TooManyLayers(usize),

    #[error("node at position {position} carries id {id}")]
    NodeIdMismatch { position: usize, id: usize },

    #[error("entry_point {entry} out of bounds for {nodes} nodes")]
    EntryOutOfBounds { entry: usize, nodes: usize },

    #[error("non-empty graph has no entry point")]
    MissingEntryPoint,

    #[error("entry point reaches layer {entry_layer} but graph max_layer is {max_layer}")]
    EntryLayerMismatch { entry_layer: usize, max_layer: usize },

    #[error("node {node} reaches layer {layer} above graph max_layer {max_layer}")]
    NodeAboveMaxLayer {
        node: usize,
        layer: usize,
        max_layer: usize,
    },

    #[error("neighbor id {neighbor} of node {node} out of bounds for {nodes} nodes")]
    NeighborOutOfBounds {
        node: usize,
        neighbor: usize,
        nodes: usize,
    },

    #[error("graph covers {actual} nodes but snapshot holds {expected} records")]
    NodeCountMismatch { expected: usize, actual: usize },

    #[error("{0} trailing bytes after graph body")]
    TrailingBytes(usize),
}
