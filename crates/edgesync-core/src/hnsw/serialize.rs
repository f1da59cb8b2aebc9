use std::io::{self, Write};

use super::node::Node;
use super::{GraphError, HnswGraph, MAX_LAYERS};

pub const GRAPH_MAGIC: [u8; 8] = *b"EDGGRAPH";

const NO_ENTRY: u32 = u32::MAX;

impl HnswGraph {
    /// Serialize the graph.
    ///
    /// Format (all integers little-endian):
    /// - Magic: "EDGGRAPH" (8 bytes)
    /// - NumNodes: u32
    /// - EntryPoint: u32 (`u32::MAX` if none)
    /// - MaxLayer: u8
    /// - M: u32
    /// - Per node, in ordinal order:
    ///   - LayerCount: u8
    ///   - Per layer: NeighborCount u32, then `[u32; NeighborCount]`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&GRAPH_MAGIC)?;
        writer.write_all(&(self.len() as u32).to_le_bytes())?;
        let entry = self.entry_point().map(|e| e as u32).unwrap_or(NO_ENTRY);
        writer.write_all(&entry.to_le_bytes())?;
        writer.write_all(&[self.max_layer() as u8])?;
        writer.write_all(&(self.m() as u32).to_le_bytes())?;

        for node in self.nodes() {
            writer.write_all(&[node.layers.len() as u8])?;
            for neighbors in &node.layers {
                writer.write_all(&(neighbors.len() as u32).to_le_bytes())?;
                for &nb in neighbors {
                    writer.write_all(&(nb as u32).to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        // Vec<u8> writes are infallible
        let _ = self.write_to(&mut out);
        out
    }

    pub fn encoded_len(&self) -> usize {
        let body: usize = self
            .nodes()
            .iter()
            .map(|n| 1 + n.layers.iter().map(|l| 4 + 4 * l.len()).sum::<usize>())
            .sum();
        8 + 4 + 4 + 1 + 4 + body
    }

    /// Decode and validate a graph that must occupy all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        let mut cur = Cursor { bytes, pos: 0 };

        if cur.take(8)? != GRAPH_MAGIC {
            return Err(GraphError::InvalidMagic);
        }
        let num_nodes = cur.u32()? as usize;
        let entry_raw = cur.u32()?;
        let max_layer = cur.u8()? as usize;
        let m = cur.u32()? as usize;
        if max_layer >= MAX_LAYERS {
            return Err(GraphError::TooManyLayers(max_layer + 1));
        }

        // each node needs at least its layer-count byte
        cur.require(num_nodes)?;
        let mut nodes = Vec::with_capacity(num_nodes);
        for id in 0..num_nodes {
            let layer_count = cur.u8()? as usize;
            if layer_count > MAX_LAYERS {
                return Err(GraphError::TooManyLayers(layer_count));
            }
            let mut layers = Vec::with_capacity(layer_count);
            for _ in 0..layer_count {
                let count = cur.u32()? as usize;
                cur.require(count.saturating_mul(4))?;
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(cur.u32()? as usize);
                }
                layers.push(neighbors);
            }
            nodes.push(Node::new(id, layers));
        }

        let remaining = bytes.len() - cur.pos;
        if remaining != 0 {
            return Err(GraphError::TrailingBytes(remaining));
        }

        let entry_point = (entry_raw != NO_ENTRY).then_some(entry_raw as usize);
        HnswGraph::from_parts(nodes, entry_point, max_layer, m)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn require(&self, needed: usize) -> Result<(), GraphError> {
        let available = self.bytes.len() - self.pos;
        if needed > available {
            return Err(GraphError::Truncated {
                offset: self.pos,
                needed,
                available,
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], GraphError> {
        self.require(n)?;
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, GraphError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, GraphError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}
