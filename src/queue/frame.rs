//! On-disk framing for the queue log.
//!
//! ```text
//! Offset  Size  Field
//! 0       2     magic 0xED5C (LE)
//! 2       1     kind
//! 3       4     body length (LE)
//! 7       8     checksum: first 8 bytes of SHA-256(kind || body)
//! 15      N     body (JSON)
//! ```

use sha2::{Digest, Sha256};

pub const FRAME_MAGIC: u16 = 0xED5C;
pub const FRAME_HEADER_LEN: usize = 15;
/// Bodies above this are never written, so a larger length field means a damaged header.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Enqueue = 1,
    Lease = 2,
    Ack = 3,
    Purge = 4,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FrameKind::Enqueue),
            2 => Some(FrameKind::Lease),
            3 => Some(FrameKind::Ack),
            4 => Some(FrameKind::Purge),
            _ => None,
        }
    }
}

fn checksum(kind: u8, body: &[u8]) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update([kind]);
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

pub fn encode_frame(kind: FrameKind, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(kind as u8, body));
    out.extend_from_slice(body);
    out
}

/// One step of a log scan.
#[derive(Debug, PartialEq, Eq)]
pub enum Scanned<'a> {
    Frame {
        offset: usize,
        kind: FrameKind,
        body: &'a [u8],
    },
    /// Bytes that failed validation. `trailing` regions have no valid frame after them.
    Corrupt {
        offset: usize,
        len: usize,
        reason: &'static str,
        trailing: bool,
    },
    /// Incomplete final frame, typically a crash mid-append.
    TornTail { offset: usize },
}

enum Check<'a> {
    Valid(FrameKind, &'a [u8]),
    Short,
    /// Header or body failed validation; its length field is not trusted.
    Damaged(&'static str),
}

/// Iterates frames of an in-memory log, resynchronizing past damage.
pub struct FrameScanner<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> FrameScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            done: false,
        }
    }

    fn check_at(&self, at: usize) -> Check<'a> {
        let buf = self.buf;
        let Some(header) = buf.get(at..at + FRAME_HEADER_LEN) else {
            return Check::Short;
        };
        if u16::from_le_bytes([header[0], header[1]]) != FRAME_MAGIC {
            return Check::Damaged("bad magic");
        }
        let len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
        if len > MAX_FRAME_BODY {
            return Check::Damaged("length out of range");
        }
        let start = at + FRAME_HEADER_LEN;
        let Some(body) = buf.get(start..start + len) else {
            return Check::Short;
        };
        if header[7..15] != checksum(header[2], body) {
            return Check::Damaged("checksum mismatch");
        }
        match FrameKind::from_byte(header[2]) {
            Some(kind) => Check::Valid(kind, body),
            None => Check::Damaged("unknown frame kind"),
        }
    }

    /// Next offset after `from` holding a fully valid frame.
    fn resync(&self, from: usize) -> Option<usize> {
        let magic = FRAME_MAGIC.to_le_bytes();
        (from..self.buf.len().saturating_sub(1))
            .filter(|&p| self.buf[p] == magic[0] && self.buf[p + 1] == magic[1])
            .find(|&p| matches!(self.check_at(p), Check::Valid(..)))
    }
}

impl<'a> Iterator for FrameScanner<'a> {
    type Item = Scanned<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.buf.len() {
            return None;
        }
        let offset = self.pos;
        match self.check_at(offset) {
            Check::Valid(kind, body) => {
                self.pos += FRAME_HEADER_LEN + body.len();
                Some(Scanned::Frame { offset, kind, body })
            }
            Check::Damaged(reason) => match self.resync(offset + 1) {
                Some(next) => {
                    self.pos = next;
                    Some(Scanned::Corrupt {
                        offset,
                        len: next - offset,
                        reason,
                        trailing: false,
                    })
                }
                None => {
                    self.done = true;
                    Some(Scanned::Corrupt {
                        offset,
                        len: self.buf.len() - offset,
                        reason,
                        trailing: true,
                    })
                }
            },
            Check::Short => match self.resync(offset + 1) {
                // a damaged length can make a mid-log frame look short
                Some(next) => {
                    self.pos = next;
                    Some(Scanned::Corrupt {
                        offset,
                        len: next - offset,
                        reason: "length overruns next frame",
                        trailing: false,
                    })
                }
                None => {
                    self.done = true;
                    Some(Scanned::TornTail { offset })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(frames: &[(FrameKind, &[u8])]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|(k, b)| encode_frame(*k, b))
            .collect()
    }

    fn frames(buf: &[u8]) -> Vec<Scanned<'_>> {
        FrameScanner::new(buf).collect()
    }

    #[test]
    fn scans_clean_log() {
        let buf = log_of(&[(FrameKind::Enqueue, b"one"), (FrameKind::Ack, b"two")]);
        let got = frames(&buf);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[1],
            Scanned::Frame {
                offset: FRAME_HEADER_LEN + 3,
                kind: FrameKind::Ack,
                body: b"two"
            }
        );
    }

    #[test]
    fn torn_tail_is_reported_once() {
        let mut buf = log_of(&[(FrameKind::Enqueue, b"complete")]);
        let partial = encode_frame(FrameKind::Enqueue, b"partial body");
        buf.extend_from_slice(&partial[..partial.len() - 3]);
        let got = frames(&buf);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[1],
            Scanned::TornTail {
                offset: FRAME_HEADER_LEN + 8
            }
        );
    }

    #[test]
    fn flipped_body_byte_skips_only_that_frame() {
        let mut buf = log_of(&[
            (FrameKind::Enqueue, b"aaaa"),
            (FrameKind::Enqueue, b"bbbb"),
            (FrameKind::Enqueue, b"cccc"),
        ]);
        let second_body = 2 * FRAME_HEADER_LEN + 4;
        buf[second_body] ^= 0xFF;
        let got = frames(&buf);
        assert_eq!(got.len(), 3);
        assert!(matches!(
            got[1],
            Scanned::Corrupt {
                reason: "checksum mismatch",
                trailing: false,
                ..
            }
        ));
        assert!(matches!(got[2], Scanned::Frame { body: b"cccc", .. }));
    }

    #[test]
    fn inflated_length_does_not_swallow_next_frame() {
        let mut buf = log_of(&[
            (FrameKind::Enqueue, b"aaaa"),
            (FrameKind::Enqueue, b"bbbb"),
            (FrameKind::Enqueue, b"cccc"),
        ]);
        let frame_len = FRAME_HEADER_LEN + 4;
        buf[3..7].copy_from_slice(&((4 + frame_len) as u32).to_le_bytes());
        let got = frames(&buf);
        assert_eq!(got.len(), 3);
        assert_eq!(
            got[0],
            Scanned::Corrupt {
                offset: 0,
                len: frame_len,
                reason: "checksum mismatch",
                trailing: false
            }
        );
        assert!(matches!(got[1], Scanned::Frame { body: b"bbbb", .. }));
        assert!(matches!(got[2], Scanned::Frame { body: b"cccc", .. }));
    }

    #[test]
    fn unknown_kind_resyncs_to_next_frame() {
        let mut buf = log_of(&[(FrameKind::Enqueue, b"aaaa"), (FrameKind::Ack, b"bbbb")]);
        buf[2] = 9;
        let got = frames(&buf);
        assert_eq!(got.len(), 2);
        assert!(matches!(
            got[0],
            Scanned::Corrupt {
                len: 19,
                trailing: false,
                ..
            }
        ));
        assert!(matches!(got[1], Scanned::Frame { kind: FrameKind::Ack, .. }));
    }

    #[test]
    fn smashed_header_resyncs_to_next_frame() {
        let mut buf = log_of(&[(FrameKind::Enqueue, b"first"), (FrameKind::Lease, b"second")]);
        buf[0] = 0;
        buf[1] = 0;
        let got = frames(&buf);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[0],
            Scanned::Corrupt {
                offset: 0,
                len: FRAME_HEADER_LEN + 5,
                reason: "bad magic",
                trailing: false
            }
        );
        assert!(matches!(got[1], Scanned::Frame { kind: FrameKind::Lease, .. }));
    }

    #[test]
    fn trailing_garbage_is_marked_trailing() {
        let mut buf = log_of(&[(FrameKind::Ack, b"ok")]);
        buf.extend_from_slice(&[0xAB; 40]);
        let got = frames(&buf);
        assert!(matches!(
            got.last(),
            Some(Scanned::Corrupt { trailing: true, len: 40, .. })
        ));
    }

    #[test]
    fn empty_log_yields_nothing() {
        assert!(frames(&[]).is_empty());
    }
}
