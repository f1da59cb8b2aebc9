//! Durable upload queue.
//!
//! A single append-only log of checksummed frames (`queue/queue.log`). Every
//! state change is a frame that is fsynced before the call returns, and replay
//! on open rebuilds the entry table. In-flight leases never survive a restart;
//! attempt counts do.

mod frame;

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use edgesync_core::record::now_millis;
use edgesync_core::{EmbeddingRecord, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use frame::{encode_frame, FrameKind, FrameScanner, Scanned, FRAME_HEADER_LEN};

use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::fsutil::{quarantine_bytes, sync_parent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub seq: u64,
    pub record: EmbeddingRecord,
    pub enqueued_at: u64,
    pub attempt_count: u32,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub acknowledged: usize,
    pub quarantined: usize,
    pub log_bytes: u64,
    pub frames: usize,
    pub next_seq: u64,
}

/// What replay found when the queue was opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueRecovery {
    pub replayed_frames: usize,
    pub quarantined_frames: usize,
    pub truncated_bytes: u64,
    pub restored_entries: usize,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub lease_timeout: Duration,
    pub compact_min_dead: usize,
}

impl QueueOptions {
    pub fn from_config(config: &EdgeConfig) -> Self {
        Self {
            dir: config.queue_dir.clone(),
            quarantine_dir: config.quarantine_dir.clone(),
            lease_timeout: config.lease_timeout,
            compact_min_dead: config.queue_compact_min_dead,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("queue.log")
    }
}

#[derive(Serialize, Deserialize)]
struct EnqueueBody {
    seq: u64,
    enqueued_at: u64,
    #[serde(default)]
    attempt_count: u32,
    record: EmbeddingRecord,
}

#[derive(Serialize, Deserialize)]
struct SeqsBody {
    seqs: Vec<u64>,
}

struct ActiveLease {
    lease: u64,
    deadline: Instant,
}

struct QueueInner {
    file: File,
    entries: BTreeMap<u64, QueueEntry>,
    seq_by_id: HashMap<RecordId, u64>,
    leases: HashMap<u64, ActiveLease>,
    next_seq: u64,
    next_lease: u64,
    frames: usize,
    log_bytes: u64,
    quarantined: usize,
}

pub struct DurableQueue {
    options: QueueOptions,
    inner: Mutex<QueueInner>,
    recovery: QueueRecovery,
}

impl DurableQueue {
    /// Open (or create) the log and replay it.
    ///
    /// Corrupt frames are copied to the quarantine dir and skipped; a torn or
    /// garbage tail is cut off so new appends start on a frame boundary.
    pub fn open(options: QueueOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)
            .map_err(|e| EdgeError::fatal("creating queue dir", e))?;
        let path = options.log_path();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(EdgeError::fatal("reading queue log", e)),
        };

        let mut state = ReplayState::default();
        let mut recovery = QueueRecovery::default();
        let mut valid_end = raw.len();

        for scanned in FrameScanner::new(&raw) {
            match scanned {
                Scanned::Frame { offset, kind, body } => {
                    if let Err(reason) = state.apply(kind, body) {
                        // checksum passed but body is unusable
                        let bytes = &raw[offset..offset + FRAME_HEADER_LEN + body.len()];
                        quarantine_frame(&options.quarantine_dir, offset, bytes, &reason);
                        recovery.quarantined_frames += 1;
                        continue;
                    }
                    recovery.replayed_frames += 1;
                }
                Scanned::Corrupt {
                    offset,
                    len,
                    reason,
                    trailing,
                } => {
                    quarantine_frame(&options.quarantine_dir, offset, &raw[offset..offset + len], reason);
                    recovery.quarantined_frames += 1;
                    if trailing {
                        valid_end = offset;
                    }
                }
                Scanned::TornTail { offset } => {
                    tracing::warn!(
                        "queue log torn tail at offset {} ({} bytes), truncating",
                        offset,
                        raw.len() - offset
                    );
                    valid_end = offset;
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| EdgeError::fatal("opening queue log", e))?;
        if valid_end < raw.len() {
            file.set_len(valid_end as u64)
                .and_then(|_| file.sync_all())
                .map_err(|e| EdgeError::fatal("truncating queue log", e))?;
            recovery.truncated_bytes = (raw.len() - valid_end) as u64;
        }
        if raw.is_empty() {
            sync_parent(&path).map_err(|e| EdgeError::fatal("syncing queue dir", e))?;
        }

        recovery.restored_entries = state.entries.len();
        if recovery.quarantined_frames > 0 || recovery.truncated_bytes > 0 {
            tracing::warn!(
                "queue replay: {} frames replayed, {} quarantined, {} bytes truncated",
                recovery.replayed_frames,
                recovery.quarantined_frames,
                recovery.truncated_bytes
            );
        } else {
            tracing::info!(
                "queue replay: {} frames, {} entries restored",
                recovery.replayed_frames,
                recovery.restored_entries
            );
        }

        let inner = QueueInner {
            file,
            entries: state.entries,
            seq_by_id: state.seq_by_id,
            leases: HashMap::new(),
            next_seq: state.next_seq,
            next_lease: 1,
            frames: recovery.replayed_frames,
            log_bytes: valid_end as u64,
            quarantined: recovery.quarantined_frames,
        };

        Ok(Self {
            options,
            inner: Mutex::new(inner),
            recovery,
        })
    }

    pub fn recovery(&self) -> &QueueRecovery {
        &self.recovery
    }

    /// Append `record` and fsync. Returns its sequence number.
    ///
    /// Re-enqueueing an id that is still tracked is a no-op returning the
    /// existing sequence. Any write failure is [`EdgeError::Fatal`].
    pub fn enqueue(&self, record: &EmbeddingRecord) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Some(&seq) = inner.seq_by_id.get(&record.id) {
            return Ok(seq);
        }

        let seq = inner.next_seq;
        let enqueued_at = now_millis();
        let body = serde_json::to_vec(&EnqueueBody {
            seq,
            enqueued_at,
            attempt_count: 0,
            record: record.clone(),
        })
        .map_err(|e| EdgeError::fatal("encoding queue entry", e))?;
        inner
            .append(FrameKind::Enqueue, &body)
            .map_err(|e| EdgeError::fatal("appending to queue log", e))?;

        inner.next_seq = seq + 1;
        inner.seq_by_id.insert(record.id, seq);
        inner.entries.insert(
            seq,
            QueueEntry {
                seq,
                record: record.clone(),
                enqueued_at,
                attempt_count: 0,
                status: EntryStatus::Pending,
            },
        );
        Ok(seq)
    }

    /// Lazily lease pending entries in FIFO order, `batch_size` at a time.
    ///
    /// Each call starts again from the oldest pending entry.
    pub fn drain(&self, batch_size: usize) -> Drain<'_> {
        Drain {
            queue: self,
            batch_size: batch_size.max(1),
            after_seq: None,
            finished: false,
        }
    }

    /// Mark entries acknowledged by the server. Unknown or already
    /// acknowledged ids are ignored. Returns how many changed.
    pub fn acknowledge(&self, ids: &[RecordId]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let seqs: Vec<u64> = ids
            .iter()
            .filter_map(|id| inner.seq_by_id.get(id).copied())
            .collect();
        inner.acknowledge_seqs(&seqs)
    }

    /// Drop acknowledged entries whose ids the installed snapshot covers.
    pub fn purge_covered<F>(&self, covered: F) -> Result<usize>
    where
        F: Fn(&RecordId) -> bool,
    {
        let mut inner = self.inner.lock();
        let seqs: Vec<u64> = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Acknowledged && covered(&e.record.id))
            .map(|e| e.seq)
            .collect();
        if seqs.is_empty() {
            return Ok(0);
        }

        let body = serde_json::to_vec(&SeqsBody { seqs: seqs.clone() })
            .map_err(|e| EdgeError::transient("encoding purge frame", e))?;
        inner
            .append(FrameKind::Purge, &body)
            .map_err(|e| EdgeError::transient("appending purge frame", e))?;
        for seq in &seqs {
            if let Some(entry) = inner.entries.remove(seq) {
                inner.seq_by_id.remove(&entry.record.id);
            }
        }

        let dead = inner.frames.saturating_sub(inner.entries.len());
        if dead >= self.options.compact_min_dead {
            if let Err(err) = inner.compact(&self.options.log_path()) {
                tracing::warn!("queue compaction failed: {err}");
            }
        }
        Ok(seqs.len())
    }

    /// Every tracked record (pending, in-flight, acknowledged) in FIFO order.
    pub fn retained(&self) -> Vec<EmbeddingRecord> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn entry(&self, id: &RecordId) -> Option<QueueEntry> {
        let inner = self.inner.lock();
        let seq = inner.seq_by_id.get(id)?;
        inner.entries.get(seq).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats {
            quarantined: inner.quarantined,
            log_bytes: inner.log_bytes,
            frames: inner.frames,
            next_seq: inner.next_seq,
            ..QueueStats::default()
        };
        for entry in inner.entries.values() {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::InFlight => stats.in_flight += 1,
                EntryStatus::Acknowledged => stats.acknowledged += 1,
            }
        }
        stats
    }

    /// Entries still waiting for a server acknowledgement.
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.status != EntryStatus::Acknowledged)
            .count()
    }

    /// Rewrite the log to hold only live state.
    pub fn compact(&self) -> Result<()> {
        self.inner
            .lock()
            .compact(&self.options.log_path())
            .map_err(|e| EdgeError::transient("compacting queue log", e))
    }

    fn lease_next(&self, after_seq: Option<u64>, batch_size: usize) -> Result<Option<Batch<'_>>> {
        let mut inner = self.inner.lock();
        inner.reclaim_expired(Instant::now());

        let picked: Vec<u64> = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .filter(|e| after_seq.map(|after| e.seq > after).unwrap_or(true))
            .take(batch_size)
            .map(|e| e.seq)
            .collect();
        if picked.is_empty() {
            return Ok(None);
        }

        let body = serde_json::to_vec(&SeqsBody {
            seqs: picked.clone(),
        })
        .map_err(|e| EdgeError::transient("encoding lease frame", e))?;
        inner
            .append(FrameKind::Lease, &body)
            .map_err(|e| EdgeError::transient("appending lease frame", e))?;

        let lease = inner.next_lease;
        inner.next_lease += 1;
        let deadline = Instant::now() + self.options.lease_timeout;
        let mut records = Vec::with_capacity(picked.len());
        for seq in &picked {
            if let Some(entry) = inner.entries.get_mut(seq) {
                entry.status = EntryStatus::InFlight;
                entry.attempt_count = entry.attempt_count.saturating_add(1);
                records.push(entry.record.clone());
            }
            inner.leases.insert(*seq, ActiveLease { lease, deadline });
        }

        Ok(Some(Batch {
            queue: self,
            lease,
            seqs: picked,
            records,
            settled: false,
        }))
    }

    fn release(&self, lease: u64) {
        let mut inner = self.inner.lock();
        let seqs: Vec<u64> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.lease == lease)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in seqs {
            inner.leases.remove(&seq);
            if let Some(entry) = inner.entries.get_mut(&seq) {
                if entry.status == EntryStatus::InFlight {
                    entry.status = EntryStatus::Pending;
                }
            }
        }
    }

    fn acknowledge_lease(&self, seqs: &[u64]) -> Result<usize> {
        self.inner.lock().acknowledge_seqs(seqs)
    }
}

impl QueueInner {
    fn append(&mut self, kind: FrameKind, body: &[u8]) -> std::io::Result<()> {
        let frame = encode_frame(kind, body);
        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());
        if let Err(err) = written {
            // drop any partial frame so later appends stay aligned
            let _ = self.file.set_len(self.log_bytes);
            return Err(err);
        }
        self.log_bytes += frame.len() as u64;
        self.frames += 1;
        Ok(())
    }

    fn acknowledge_seqs(&mut self, seqs: &[u64]) -> Result<usize> {
        let changed: Vec<u64> = seqs
            .iter()
            .copied()
            .filter(|seq| {
                self.entries
                    .get(seq)
                    .map(|e| e.status != EntryStatus::Acknowledged)
                    .unwrap_or(false)
            })
            .collect();
        if changed.is_empty() {
            return Ok(0);
        }

        let body = serde_json::to_vec(&SeqsBody {
            seqs: changed.clone(),
        })
        .map_err(|e| EdgeError::transient("encoding ack frame", e))?;
        self.append(FrameKind::Ack, &body)
            .map_err(|e| EdgeError::transient("appending ack frame", e))?;
        for seq in &changed {
            self.leases.remove(seq);
            if let Some(entry) = self.entries.get_mut(seq) {
                entry.status = EntryStatus::Acknowledged;
            }
        }
        Ok(changed.len())
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        if expired.is_empty() {
            return;
        }
        tracing::warn!("reclaiming {} queue entries with expired leases", expired.len());
        for seq in expired {
            self.leases.remove(&seq);
            if let Some(entry) = self.entries.get_mut(&seq) {
                if entry.status == EntryStatus::InFlight {
                    entry.status = EntryStatus::Pending;
                }
            }
        }
    }

    fn compact(&mut self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("log.compact");
        let mut frames = 0usize;
        let mut out = Vec::new();
        for entry in self.entries.values() {
            let body = serde_json::to_vec(&EnqueueBody {
                seq: entry.seq,
                enqueued_at: entry.enqueued_at,
                attempt_count: entry.attempt_count,
                record: entry.record.clone(),
            })?;
            out.extend_from_slice(&encode_frame(FrameKind::Enqueue, &body));
            frames += 1;
        }
        let acked: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Acknowledged)
            .map(|e| e.seq)
            .collect();
        if !acked.is_empty() {
            let body = serde_json::to_vec(&SeqsBody { seqs: acked })?;
            out.extend_from_slice(&encode_frame(FrameKind::Ack, &body));
            frames += 1;
        }

        // the append handle is opened on the new inode before it replaces the log,
        // so a failure leaves both the old file and the old handle in place
        let written = (|| {
            let mut file = File::create(&tmp)?;
            file.write_all(&out)?;
            file.sync_all()?;
            let handle = OpenOptions::new().read(true).append(true).open(&tmp)?;
            std::fs::rename(&tmp, path)?;
            sync_parent(path)?;
            Ok(handle)
        })();
        match written {
            Ok(handle) => self.file = handle,
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(err);
            }
        }
        tracing::info!(
            "queue log compacted: {} frames -> {} frames, {} bytes",
            self.frames,
            frames,
            out.len()
        );
        self.frames = frames;
        self.log_bytes = out.len() as u64;
        Ok(())
    }
}

#[derive(Default)]
struct ReplayState {
    entries: BTreeMap<u64, QueueEntry>,
    seq_by_id: HashMap<RecordId, u64>,
    next_seq: u64,
}

impl ReplayState {
    fn apply(&mut self, kind: FrameKind, body: &[u8]) -> std::result::Result<(), String> {
        match kind {
            FrameKind::Enqueue => {
                let b: EnqueueBody = serde_json::from_slice(body).map_err(|e| e.to_string())?;
                self.next_seq = self.next_seq.max(b.seq + 1);
                if self.entries.contains_key(&b.seq) || self.seq_by_id.contains_key(&b.record.id) {
                    return Ok(());
                }
                self.seq_by_id.insert(b.record.id, b.seq);
                self.entries.insert(
                    b.seq,
                    QueueEntry {
                        seq: b.seq,
                        record: b.record,
                        enqueued_at: b.enqueued_at,
                        attempt_count: b.attempt_count,
                        status: EntryStatus::Pending,
                    },
                );
            }
            FrameKind::Lease | FrameKind::Ack | FrameKind::Purge => {
                let b: SeqsBody = serde_json::from_slice(body).map_err(|e| e.to_string())?;
                for seq in b.seqs {
                    match kind {
                        FrameKind::Lease => {
                            if let Some(e) = self.entries.get_mut(&seq) {
                                e.attempt_count = e.attempt_count.saturating_add(1);
                            }
                        }
                        FrameKind::Ack => {
                            if let Some(e) = self.entries.get_mut(&seq) {
                                e.status = EntryStatus::Acknowledged;
                            }
                        }
                        _ => {
                            if let Some(e) = self.entries.remove(&seq) {
                                self.seq_by_id.remove(&e.record.id);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn quarantine_frame(dir: &Path, offset: usize, bytes: &[u8], reason: &str) {
    tracing::warn!(
        "quarantining corrupt queue frame at offset {} ({} bytes): {}",
        offset,
        bytes.len(),
        reason
    );
    let name = format!("queue_{offset:012}_{}.frame", now_millis());
    if let Err(err) = quarantine_bytes(dir, &name, bytes) {
        tracing::warn!("failed to write quarantined queue frame {}: {}", name, err);
    }
}

/// Lazy iterator of leased batches; see [`DurableQueue::drain`].
pub struct Drain<'q> {
    queue: &'q DurableQueue,
    batch_size: usize,
    after_seq: Option<u64>,
    finished: bool,
}

impl<'q> Iterator for Drain<'q> {
    type Item = Result<Batch<'q>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.queue.lease_next(self.after_seq, self.batch_size) {
            Ok(Some(batch)) => {
                self.after_seq = batch.seqs.last().copied();
                Some(Ok(batch))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Entries leased in-flight. Dropping without [`Batch::acknowledge`] returns
/// them to pending.
pub struct Batch<'q> {
    queue: &'q DurableQueue,
    lease: u64,
    seqs: Vec<u64>,
    records: Vec<EmbeddingRecord>,
    settled: bool,
}

impl Batch<'_> {
    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn seqs(&self) -> &[u64] {
        &self.seqs
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn acknowledge(mut self) -> Result<usize> {
        let acked = self.queue.acknowledge_lease(&self.seqs)?;
        self.settled = true;
        Ok(acked)
    }

    pub fn release(self) {
        // Drop does the work
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.release(self.lease);
        }
    }
}
