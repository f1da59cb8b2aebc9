//! Snapshot binary format
//!
//! A snapshot is what the indexing server ships back to the edge: every record it
//! has indexed plus the prebuilt HNSW graph over them. The edge persists the
//! bytes as-is (or, for deltas, the deterministic merge onto its base) and mmaps
//! the vectors section for zero-copy search.
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "EDGSNAP1"
//! 0x08     4       u32 LE      Format version (1)
//! 0x0C     4       u32 LE      Flags (bit 0 = graph, bit 1 = delta)
//! 0x10     4       u32 LE      N: records in this file
//! 0x14     4       u32 LE      D: dimensions
//! 0x18     8       u64 LE      Snapshot version
//! 0x20     8       u64 LE      Base version (deltas only, else 0)
//! 0x28     8       u64 LE      Vectors section offset (64-aligned)
//! 0x30     8       u64 LE      Records section offset
//! 0x38     8       u64 LE      Graph section offset (0 if none)
//! ─────────────────────────────────────────────────
//! TOTAL: 64 bytes
//! ```
//!
//! Records section, per record in ordinal order: `id [u8; 16]`,
//! `captured_at u64`, `payload_len u32`, `payload` (JSON). The graph section is
//! the `EDGGRAPH` encoding and runs to end of file.
//!
//! A delta carries only the records added since `base_version`, but its graph
//! spans base + added ordinals, so it is only searchable after
//! [`apply_delta`] folds it onto the base.

use std::collections::HashSet;
use std::io::{self, Write};

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::hnsw::{GraphError, HnswGraph};
use crate::record::{EmbeddingRecord, RecordId, RecordMeta};
use crate::simd::is_finite;

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"EDGSNAP1";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;
pub const VECTOR_ALIGNMENT: u64 = 64;

/// Upper bound on a single payload; anything larger is treated as corruption.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 20;

pub mod flags {
    pub const HAS_GRAPH: u32 = 1 << 0;
    pub const DELTA: u32 = 1 << 1;
}

const RECORD_FIXED_BYTES: usize = 16 + 8 + 4;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("invalid snapshot magic bytes: expected EDGSNAP1")]
    InvalidMagic,

    #[error("unsupported snapshot format version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown snapshot flags: {0:#x}")]
    UnknownFlags(u32),

    #[error("snapshot truncated: need {needed} bytes, have {available}")]
    Truncated { needed: u64, available: u64 },

    #[error("section misaligned: {section} at offset {offset} (expected alignment {alignment})")]
    Misaligned {
        section: &'static str,
        offset: u64,
        alignment: u64,
    },

    #[error("{section} section [{start}, {end}) does not fit layout of {file_len}-byte snapshot")]
    SectionOutOfBounds {
        section: &'static str,
        start: u64,
        end: u64,
        file_len: u64,
    },

    #[error("snapshot dimension must be non-zero")]
    ZeroDimension,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector {ordinal} contains non-finite components")]
    NonFiniteVector { ordinal: usize },

    #[error("record {ordinal} malformed: {reason}")]
    MalformedRecord { ordinal: usize, reason: String },

    #[error("record id {0} appears more than once")]
    DuplicateRecord(RecordId),

    #[error("graph section invalid: {0}")]
    Graph(#[from] GraphError),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("snapshot is not a delta")]
    NotADelta,

    #[error("delta base version {actual} does not match current version {expected}")]
    BaseVersionMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed 64-byte snapshot header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: u32,
    pub flags: u32,
    pub count: u32,
    pub dimensions: u32,
    pub snapshot_version: u64,
    pub base_version: u64,
    pub vectors_offset: u64,
    pub records_offset: u64,
    pub graph_offset: u64,
}

impl SnapshotHeader {
    /// Parse and sanity-check the first 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                needed: HEADER_SIZE as u64,
                available: bytes.len() as u64,
            });
        }
        if bytes[0..8] != SNAPSHOT_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let header = Self {
            format_version: u32_at(0x08),
            flags: u32_at(0x0C),
            count: u32_at(0x10),
            dimensions: u32_at(0x14),
            snapshot_version: u64_at(0x18),
            base_version: u64_at(0x20),
            vectors_offset: u64_at(0x28),
            records_offset: u64_at(0x30),
            graph_offset: u64_at(0x38),
        };

        if header.format_version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(header.format_version));
        }
        if header.flags & !(flags::HAS_GRAPH | flags::DELTA) != 0 {
            return Err(FormatError::UnknownFlags(header.flags));
        }
        if header.dimensions == 0 {
            return Err(FormatError::ZeroDimension);
        }
        if header.vectors_offset % VECTOR_ALIGNMENT != 0 || header.vectors_offset < HEADER_SIZE as u64 {
            return Err(FormatError::Misaligned {
                section: "vectors",
                offset: header.vectors_offset,
                alignment: VECTOR_ALIGNMENT,
            });
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0x00..0x08].copy_from_slice(&SNAPSHOT_MAGIC);
        buf[0x08..0x0C].copy_from_slice(&self.format_version.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.count.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[0x18..0x20].copy_from_slice(&self.snapshot_version.to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&self.base_version.to_le_bytes());
        buf[0x28..0x30].copy_from_slice(&self.vectors_offset.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&self.records_offset.to_le_bytes());
        buf[0x38..0x40].copy_from_slice(&self.graph_offset.to_le_bytes());
        buf
    }

    #[inline]
    pub fn has_graph(&self) -> bool {
        self.flags & flags::HAS_GRAPH != 0
    }

    #[inline]
    pub fn is_delta(&self) -> bool {
        self.flags & flags::DELTA != 0
    }

    /// `Some(base)` for deltas.
    pub fn base(&self) -> Option<u64> {
        self.is_delta().then_some(self.base_version)
    }

    /// Saturates instead of overflowing; a saturated size never fits a real buffer.
    pub fn vectors_section_size(&self) -> u64 {
        (self.count as u64)
            .saturating_mul(self.dimensions as u64)
            .saturating_mul(std::mem::size_of::<f32>() as u64)
    }
}

/// A fully validated snapshot borrowed from a byte buffer (network body or mmap).
///
/// Parsing checks the header, the section layout, every record, vector
/// finiteness, id uniqueness and graph bounds, so a view that exists is safe to
/// publish.
#[derive(Debug)]
pub struct SnapshotView<'a> {
    bytes: &'a [u8],
    header: SnapshotHeader,
    records: Vec<RecordMeta>,
    graph: Option<HnswGraph>,
}

impl<'a> SnapshotView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FormatError> {
        let header = SnapshotHeader::from_bytes(bytes)?;
        let file_len = bytes.len() as u64;
        let out_of_bounds = |section: &'static str, start: u64, end: u64| FormatError::SectionOutOfBounds {
            section,
            start,
            end,
            file_len,
        };

        let vectors_end = header
            .vectors_offset
            .checked_add(header.vectors_section_size())
            .ok_or_else(|| out_of_bounds("vectors", header.vectors_offset, u64::MAX))?;
        if vectors_end > file_len || header.records_offset != vectors_end {
            return Err(out_of_bounds("vectors", header.vectors_offset, vectors_end));
        }

        let records_end = if header.has_graph() {
            if header.graph_offset < header.records_offset || header.graph_offset > file_len {
                return Err(out_of_bounds("graph", header.graph_offset, file_len));
            }
            header.graph_offset
        } else {
            if header.graph_offset != 0 {
                return Err(out_of_bounds("graph", header.graph_offset, file_len));
            }
            file_len
        };

        let records = parse_records(
            &bytes[header.records_offset as usize..records_end as usize],
            header.count as usize,
        )?;

        let dim = header.dimensions as usize;
        let vectors = &bytes[header.vectors_offset as usize..vectors_end as usize];
        for (ordinal, chunk) in vectors.chunks_exact(dim * 4).enumerate() {
            if chunk
                .chunks_exact(4)
                .any(|c| !f32::from_le_bytes([c[0], c[1], c[2], c[3]]).is_finite())
            {
                return Err(FormatError::NonFiniteVector { ordinal });
            }
        }

        let graph = if header.has_graph() {
            let graph = HnswGraph::decode(&bytes[header.graph_offset as usize..])?;
            // a delta's graph spans the merged ordinal space; checked in apply_delta
            if !header.is_delta() && graph.len() != header.count as usize {
                return Err(GraphError::NodeCountMismatch {
                    expected: header.count as usize,
                    actual: graph.len(),
                }
                .into());
            }
            Some(graph)
        } else {
            None
        };

        Ok(Self {
            bytes,
            header,
            records,
            graph,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn version(&self) -> u64 {
        self.header.snapshot_version
    }

    pub fn dim(&self) -> usize {
        self.header.dimensions as usize
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[RecordMeta] {
        &self.records
    }

    pub fn graph(&self) -> Option<&HnswGraph> {
        self.graph.as_ref()
    }

    /// Raw little-endian bytes of the vectors section.
    pub fn vectors_bytes(&self) -> &'a [u8] {
        let start = self.header.vectors_offset as usize;
        &self.bytes[start..start + self.header.vectors_section_size() as usize]
    }

    /// Zero-copy view of all vectors, or `None` if the buffer is not f32-aligned.
    pub fn vectors_f32(&self) -> Option<&'a [f32]> {
        bytemuck::try_cast_slice(self.vectors_bytes()).ok()
    }

    /// Copy of vector `ordinal` decoded from little-endian.
    pub fn vector(&self, ordinal: usize) -> Vec<f32> {
        let stride = self.dim() * 4;
        self.vectors_bytes()[ordinal * stride..(ordinal + 1) * stride]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn record(&self, ordinal: usize) -> EmbeddingRecord {
        self.records[ordinal].clone().into_record(self.vector(ordinal))
    }

    pub fn into_parts(self) -> (SnapshotHeader, Vec<RecordMeta>, Option<HnswGraph>) {
        (self.header, self.records, self.graph)
    }
}

fn parse_records(section: &[u8], count: usize) -> Result<Vec<RecordMeta>, FormatError> {
    if count.saturating_mul(RECORD_FIXED_BYTES) > section.len() {
        return Err(FormatError::Truncated {
            needed: count.saturating_mul(RECORD_FIXED_BYTES) as u64,
            available: section.len() as u64,
        });
    }

    let mut records = Vec::with_capacity(count);
    let mut seen: HashSet<RecordId> = HashSet::with_capacity(count);
    let mut pos = 0usize;
    for ordinal in 0..count {
        let malformed = |reason: &str| FormatError::MalformedRecord {
            ordinal,
            reason: reason.to_string(),
        };
        let fixed = section
            .get(pos..pos + RECORD_FIXED_BYTES)
            .ok_or_else(|| malformed("truncated record header"))?;
        let mut id_raw = [0u8; 16];
        id_raw.copy_from_slice(&fixed[0..16]);
        let mut ts_raw = [0u8; 8];
        ts_raw.copy_from_slice(&fixed[16..24]);
        let payload_len =
            u32::from_le_bytes([fixed[24], fixed[25], fixed[26], fixed[27]]) as usize;
        pos += RECORD_FIXED_BYTES;

        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(malformed("payload exceeds size limit"));
        }
        let payload_raw = section
            .get(pos..pos + payload_len)
            .ok_or_else(|| malformed("truncated payload"))?;
        pos += payload_len;

        let payload = if payload_raw.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(payload_raw)
                .map_err(|e| malformed(&format!("payload is not JSON: {e}")))?
        };

        let id = Uuid::from_bytes(id_raw);
        if !seen.insert(id) {
            return Err(FormatError::DuplicateRecord(id));
        }
        records.push(RecordMeta {
            id,
            captured_at: u64::from_le_bytes(ts_raw),
            payload,
        });
    }

    if pos != section.len() {
        return Err(FormatError::MalformedRecord {
            ordinal: count,
            reason: format!("{} unexpected trailing bytes", section.len() - pos),
        });
    }
    Ok(records)
}

/// Builds snapshot files. Used by the indexing-server side and to fold deltas.
pub struct SnapshotWriter {
    dim: usize,
    version: u64,
    base_version: Option<u64>,
    vectors: Vec<f32>,
    records: Vec<RecordMeta>,
    ids: HashSet<RecordId>,
    graph: Option<HnswGraph>,
}

impl SnapshotWriter {
    pub fn new(dim: usize, version: u64) -> Self {
        Self {
            dim,
            version,
            base_version: None,
            vectors: Vec::new(),
            records: Vec::new(),
            ids: HashSet::new(),
            graph: None,
        }
    }

    /// Mark the output as a delta on top of `base_version`.
    pub fn delta_on(mut self, base_version: u64) -> Self {
        self.base_version = Some(base_version);
        self
    }

    pub fn with_graph(mut self, graph: HnswGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: &EmbeddingRecord) -> Result<(), FormatError> {
        self.push_parts(record.meta(), &record.vector)
    }

    fn push_parts(&mut self, meta: RecordMeta, vector: &[f32]) -> Result<(), FormatError> {
        if vector.len() != self.dim {
            return Err(FormatError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if !is_finite(vector) {
            return Err(FormatError::NonFiniteVector {
                ordinal: self.records.len(),
            });
        }
        if !self.ids.insert(meta.id) {
            return Err(FormatError::DuplicateRecord(meta.id));
        }
        self.vectors.extend_from_slice(vector);
        self.records.push(meta);
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn write_to<W: Write>(self, writer: &mut W) -> Result<(), FormatError> {
        if self.dim == 0 {
            return Err(FormatError::ZeroDimension);
        }
        if let (Some(graph), None) = (&self.graph, self.base_version) {
            if graph.len() != self.records.len() {
                return Err(GraphError::NodeCountMismatch {
                    expected: self.records.len(),
                    actual: graph.len(),
                }
                .into());
            }
        }

        let mut records_section = Vec::new();
        for (ordinal, meta) in self.records.iter().enumerate() {
            let payload = if meta.payload.is_null() {
                Vec::new()
            } else {
                serde_json::to_vec(&meta.payload).map_err(|e| FormatError::MalformedRecord {
                    ordinal,
                    reason: e.to_string(),
                })?
            };
            records_section.extend_from_slice(meta.id.as_bytes());
            records_section.extend_from_slice(&meta.captured_at.to_le_bytes());
            records_section.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            records_section.extend_from_slice(&payload);
        }

        let vectors_offset = HEADER_SIZE as u64;
        let records_offset = vectors_offset + (self.vectors.len() * 4) as u64;
        let graph_offset = match &self.graph {
            Some(_) => records_offset + records_section.len() as u64,
            None => 0,
        };
        let mut header_flags = 0;
        if self.graph.is_some() {
            header_flags |= flags::HAS_GRAPH;
        }
        if self.base_version.is_some() {
            header_flags |= flags::DELTA;
        }

        let header = SnapshotHeader {
            format_version: FORMAT_VERSION,
            flags: header_flags,
            count: self.records.len() as u32,
            dimensions: self.dim as u32,
            snapshot_version: self.version,
            base_version: self.base_version.unwrap_or(0),
            vectors_offset,
            records_offset,
            graph_offset,
        };

        writer.write_all(&header.to_bytes())?;
        writer.write_all(bytemuck::cast_slice(&self.vectors))?;
        writer.write_all(&records_section)?;
        if let Some(graph) = &self.graph {
            graph.write_to(writer)?;
        }
        Ok(())
    }
}

/// Fold a delta onto its base, producing a full snapshot at the delta's version.
///
/// Base records keep their ordinals; delta records follow in file order, which
/// is the ordinal space the delta's graph was built over.
pub fn apply_delta(base: &SnapshotView<'_>, delta: &SnapshotView<'_>) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::new();
    apply_delta_to(base, delta, &mut out)?;
    Ok(out)
}

/// [`apply_delta`] streaming the merged snapshot into `out`.
pub fn apply_delta_to<W: Write>(
    base: &SnapshotView<'_>,
    delta: &SnapshotView<'_>,
    out: &mut W,
) -> Result<(), FormatError> {
    let delta_base = delta.header().base().ok_or(FormatError::NotADelta)?;
    if delta_base != base.version() {
        return Err(FormatError::BaseVersionMismatch {
            expected: base.version(),
            actual: delta_base,
        });
    }
    if delta.dim() != base.dim() {
        return Err(FormatError::DimensionMismatch {
            expected: base.dim(),
            actual: delta.dim(),
        });
    }

    let merged_len = base.len() + delta.len();
    let mut writer = SnapshotWriter::new(base.dim(), delta.version());
    if let Some(graph) = delta.graph() {
        if graph.len() != merged_len {
            return Err(GraphError::NodeCountMismatch {
                expected: merged_len,
                actual: graph.len(),
            }
            .into());
        }
        writer = writer.with_graph(graph.clone());
    }
    for (ordinal, meta) in base.records().iter().enumerate() {
        writer.push_parts(meta.clone(), &base.vector(ordinal))?;
    }
    for (ordinal, meta) in delta.records().iter().enumerate() {
        writer.push_parts(meta.clone(), &delta.vector(ordinal))?;
    }
    writer.write_to(out)
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compare `bytes` against an expected hex digest (case-insensitive).
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<(), FormatError> {
    let actual = sha256_hex(bytes);
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(FormatError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::Node;
    use crate::simd::l2_normalized;
    use serde_json::json;

    fn record(seed: usize, dim: usize) -> EmbeddingRecord {
        let v: Vec<f32> = (0..dim).map(|i| ((seed * 31 + i * 7) % 13) as f32 - 6.0).collect();
        EmbeddingRecord::with_id(
            Uuid::from_u128(seed as u128 + 1),
            l2_normalized(&v),
            1_700_000_000_000 + seed as u64,
            json!({"frame_ref": format!("frame_{seed}")}),
        )
    }

    fn chain_graph(n: usize) -> HnswGraph {
        let nodes = (0..n)
            .map(|i| {
                let mut l0 = Vec::new();
                if i > 0 {
                    l0.push(i - 1);
                }
                if i + 1 < n {
                    l0.push(i + 1);
                }
                Node::new(i, vec![l0])
            })
            .collect();
        HnswGraph::from_parts(nodes, (n > 0).then_some(0), 0, 2).unwrap()
    }

    fn full_snapshot(version: u64, records: &[EmbeddingRecord], dim: usize) -> Vec<u8> {
        let mut writer = SnapshotWriter::new(dim, version).with_graph(chain_graph(records.len()));
        for r in records {
            writer.push(r).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn parse_exposes_records_vectors_and_graph() {
        let records: Vec<_> = (0..5).map(|i| record(i, 8)).collect();
        let bytes = full_snapshot(3, &records, 8);

        let view = SnapshotView::parse(&bytes).unwrap();
        assert_eq!(view.version(), 3);
        assert_eq!(view.dim(), 8);
        assert_eq!(view.len(), 5);
        assert_eq!(view.header().base(), None);
        assert_eq!(view.graph().map(|g| g.len()), Some(5));
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&view.record(i), r);
        }
    }

    #[test]
    fn header_is_64_bytes_and_vectors_are_aligned() {
        let bytes = full_snapshot(1, &[record(0, 4)], 4);
        let header = SnapshotHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.vectors_offset, 64);
        assert_eq!(header.records_offset, 64 + 16);
        assert_eq!(header.to_bytes().len(), HEADER_SIZE);
    }

    #[test]
    fn empty_snapshot_is_valid() {
        let bytes = SnapshotWriter::new(4, 9).finish().unwrap();
        let view = SnapshotView::parse(&bytes).unwrap();
        assert!(view.is_empty());
        assert!(view.graph().is_none());
    }

    #[test]
    fn every_truncation_is_rejected() {
        let records: Vec<_> = (0..3).map(|i| record(i, 4)).collect();
        let bytes = full_snapshot(2, &records, 4);
        for cut in 0..bytes.len() {
            assert!(SnapshotView::parse(&bytes[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn rejects_bad_magic_version_and_flags() {
        let good = full_snapshot(1, &[record(0, 4)], 4);

        let mut bad = good.clone();
        bad[0] = b'Z';
        assert!(matches!(SnapshotView::parse(&bad), Err(FormatError::InvalidMagic)));

        let mut bad = good.clone();
        bad[0x08] = 7;
        assert!(matches!(
            SnapshotView::parse(&bad),
            Err(FormatError::UnsupportedVersion(7))
        ));

        let mut bad = good;
        bad[0x0C] |= 0x80;
        assert!(matches!(SnapshotView::parse(&bad), Err(FormatError::UnknownFlags(_))));
    }

    #[test]
    fn rejects_non_finite_vector() {
        let mut bytes = full_snapshot(1, &[record(0, 4), record(1, 4)], 4);
        let at = 64 + 16 + 4;
        bytes[at..at + 4].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(matches!(
            SnapshotView::parse(&bytes),
            Err(FormatError::NonFiniteVector { ordinal: 1 })
        ));
    }

    #[test]
    fn writer_rejects_duplicates_and_wrong_dims() {
        let mut writer = SnapshotWriter::new(4, 1);
        let r = record(0, 4);
        writer.push(&r).unwrap();
        assert!(matches!(writer.push(&r), Err(FormatError::DuplicateRecord(_))));
        assert!(matches!(
            writer.push(&record(1, 3)),
            Err(FormatError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn graph_must_cover_every_record() {
        let mut writer = SnapshotWriter::new(4, 1).with_graph(chain_graph(1));
        writer.push(&record(0, 4)).unwrap();
        writer.push(&record(1, 4)).unwrap();
        assert!(matches!(
            writer.finish(),
            Err(FormatError::Graph(GraphError::NodeCountMismatch { expected: 2, actual: 1 }))
        ));
    }

    #[test]
    fn delta_folds_onto_matching_base() {
        let base_records: Vec<_> = (0..3).map(|i| record(i, 4)).collect();
        let base_bytes = full_snapshot(4, &base_records, 4);
        let base = SnapshotView::parse(&base_bytes).unwrap();

        let added = vec![record(10, 4), record(11, 4)];
        let mut writer = SnapshotWriter::new(4, 5).delta_on(4).with_graph(chain_graph(5));
        for r in &added {
            writer.push(r).unwrap();
        }
        let delta_bytes = writer.finish().unwrap();
        let delta = SnapshotView::parse(&delta_bytes).unwrap();
        assert_eq!(delta.header().base(), Some(4));

        let merged_bytes = apply_delta(&base, &delta).unwrap();
        let merged = SnapshotView::parse(&merged_bytes).unwrap();
        assert_eq!(merged.version(), 5);
        assert_eq!(merged.header().base(), None);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.record(0), base_records[0]);
        assert_eq!(merged.record(4), added[1]);
    }

    #[test]
    fn delta_on_wrong_base_is_rejected() {
        let base_bytes = full_snapshot(4, &[record(0, 4)], 4);
        let base = SnapshotView::parse(&base_bytes).unwrap();
        let mut writer = SnapshotWriter::new(4, 6).delta_on(5);
        writer.push(&record(1, 4)).unwrap();
        let delta_bytes = writer.finish().unwrap();
        let delta = SnapshotView::parse(&delta_bytes).unwrap();
        assert!(matches!(
            apply_delta(&base, &delta),
            Err(FormatError::BaseVersionMismatch { expected: 4, actual: 5 })
        ));
        assert!(matches!(apply_delta(&delta, &base), Err(FormatError::NotADelta)));
    }

    #[test]
    fn checksum_verification() {
        let bytes = b"snapshot body";
        let digest = sha256_hex(bytes);
        assert_eq!(digest.len(), 64);
        verify_sha256(bytes, &digest.to_uppercase()).unwrap();
        assert!(matches!(
            verify_sha256(b"tampered body", &digest),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }
}
