//! Background snapshot synchronizer.
//!
//! One tokio task owns the cycle `Idle -> Uploading -> AwaitingSnapshot ->
//! Swapping -> Idle`. Any failure parks it in `Error` for an exponential,
//! jittered backoff before the next attempt.

pub mod client;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use client::{
    HttpIndexingServer, IndexingServer, SnapshotPayload, SnapshotResponse, UploadReceipt,
};

use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::queue::DurableQueue;
use crate::store::{install_snapshot_file, write_manifest, ImmutableHandle, MutableStore};

/// Snapshot bodies stream into this file under the tmp dir.
const DOWNLOAD_FILE: &str = "snapshot_download.partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Uploading,
    AwaitingSnapshot,
    Swapping,
    Error,
}

/// Outcome of one zero-downtime swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapReport {
    pub version: u64,
    pub previous: Option<u64>,
    pub records: usize,
    /// Mutable records dropped because the new snapshot covers them.
    pub superseded: usize,
    /// Mutable records left after the prune.
    pub retained: usize,
    /// Records that arrived while the new store was being built.
    pub captured_during_swap: usize,
    pub purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub uploaded: usize,
    pub upload_error: Option<String>,
    pub up_to_date: bool,
    pub swap: Option<SwapReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub snapshot_version: Option<u64>,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub consecutive_failures: u32,
    pub uploaded_total: u64,
    pub swaps: u64,
    pub last_swap: Option<SwapReport>,
}

struct SyncRequest {
    reply: Option<oneshot::Sender<Result<CycleReport>>>,
}

/// Everything a cycle touches.
pub struct Synchronizer {
    config: Arc<EdgeConfig>,
    queue: Arc<DurableQueue>,
    mutable: Arc<MutableStore>,
    immutable: Arc<ImmutableHandle>,
    server: Arc<dyn IndexingServer>,
    status: watch::Sender<SyncStatus>,
    force_full: bool,
}

impl Synchronizer {
    pub fn new(
        config: Arc<EdgeConfig>,
        queue: Arc<DurableQueue>,
        mutable: Arc<MutableStore>,
        immutable: Arc<ImmutableHandle>,
        server: Arc<dyn IndexingServer>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            snapshot_version: immutable.version(),
            ..SyncStatus::default()
        });
        Self {
            config,
            queue,
            mutable,
            immutable,
            server,
            status,
            force_full: false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// One full cycle: upload what is pending, then fetch and install any
    /// newer snapshot.
    ///
    /// A failed upload stops the upload phase and is reported, not raised; the
    /// snapshot fetch still runs. Fetch and swap failures are errors and leave
    /// the current store untouched.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.set_state(SyncState::Uploading);
        let (uploaded, upload_error) = self.upload_pending().await?;
        report.uploaded = uploaded;
        report.upload_error = upload_error;

        self.set_state(SyncState::AwaitingSnapshot);
        let dest = self.config.tmp_dir.join(DOWNLOAD_FILE);
        let fetched = self.fetch_and_install(&dest, &mut report).await;
        // an installed download has already been renamed away
        if let Err(err) = tokio::fs::remove_file(&dest).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove snapshot download {:?}: {}", dest, err);
            }
        }
        fetched?;

        self.status.send_modify(|s| {
            s.state = SyncState::Idle;
            s.cycles += 1;
            s.uploaded_total += report.uploaded as u64;
            s.snapshot_version = self.immutable.version();
            if let Some(swap) = &report.swap {
                s.swaps += 1;
                s.last_swap = Some(swap.clone());
            }
        });
        Ok(report)
    }

    async fn fetch_and_install(&mut self, dest: &Path, report: &mut CycleReport) -> Result<()> {
        let current = self.immutable.version();
        let since = if self.force_full { None } else { current };
        let response = tokio::time::timeout(
            self.config.download_timeout,
            self.server.fetch_snapshot(since, dest),
        )
        .await
        .map_err(|_| EdgeError::TransientIo("snapshot download timed out".into()))??;

        match response {
            SnapshotResponse::UpToDate => report.up_to_date = true,
            SnapshotResponse::Snapshot(payload) if Some(payload.version) == current => {
                tracing::debug!("snapshot v{} already installed", payload.version);
                report.up_to_date = true;
            }
            SnapshotResponse::Snapshot(payload) => {
                if let Some(base) = payload.base_version {
                    if Some(base) != current {
                        self.force_full = true;
                        return Err(EdgeError::Corruption(format!(
                            "delta v{} is on base {}, installed is {:?}; requesting full snapshot",
                            payload.version, base, current
                        )));
                    }
                }
                let swap = self.swap(payload).await;
                if let Err(EdgeError::Corruption(_)) = &swap {
                    self.force_full = true;
                }
                report.swap = Some(swap?);
                self.force_full = false;
            }
        }
        Ok(())
    }

    async fn upload_pending(&self) -> Result<(usize, Option<String>)> {
        let mut uploaded = 0;
        for batch in self.queue.drain(self.config.upload_batch_size) {
            let batch = batch?;
            let sent = tokio::time::timeout(
                self.config.upload_timeout,
                self.server.upload(batch.records()),
            )
            .await;
            match sent {
                Ok(Ok(_)) => uploaded += batch.acknowledge()?,
                Ok(Err(err)) => {
                    tracing::warn!("upload of {} records failed: {}", batch.len(), err);
                    return Ok((uploaded, Some(err.to_string())));
                }
                Err(_) => {
                    tracing::warn!("upload of {} records timed out", batch.len());
                    return Ok((uploaded, Some("upload timed out".into())));
                }
            }
        }
        if uploaded > 0 {
            tracing::info!("uploaded {} records", uploaded);
        }
        Ok((uploaded, None))
    }

    async fn swap(&self, payload: SnapshotPayload) -> Result<SwapReport> {
        self.set_state(SyncState::Swapping);
        let frozen: HashSet<_> = self.mutable.freeze_ids();
        let current = self.immutable.load();
        let previous = current.as_ref().map(|s| s.version());

        let config = Arc::clone(&self.config);
        let installed = tokio::task::spawn_blocking(move || {
            install_snapshot_file(&config, &payload.path, &payload.sha256, current.as_deref())
        })
        .await
        .map_err(|e| EdgeError::fatal("snapshot install task", e))??;

        write_manifest(&self.config, installed.manifest())?;
        let store = Arc::new(installed);
        drop(self.immutable.publish(Arc::clone(&store)));

        let superseded = self.mutable.remove_covered(|id| store.contains(id));
        let remaining = self.mutable.freeze_ids();
        let captured_during_swap = remaining.difference(&frozen).count();
        let purged = match self.queue.purge_covered(|id| store.contains(id)) {
            Ok(n) => n,
            Err(err) => {
                // retried on the next swap or restart
                tracing::warn!("purging covered queue entries failed: {}", err);
                0
            }
        };
        self.immutable.gc_retired();

        let report = SwapReport {
            version: store.version(),
            previous,
            records: store.len(),
            superseded,
            retained: remaining.len(),
            captured_during_swap,
            purged,
        };
        tracing::info!(
            "swapped to snapshot v{} (prev {:?}): {} records, {} superseded, {} retained",
            report.version,
            report.previous,
            report.records,
            report.superseded,
            report.retained
        );
        Ok(report)
    }

    fn record_failure(&self, err: &EdgeError, failures: u32) {
        self.status.send_modify(|s| {
            s.state = SyncState::Error;
            s.cycles += 1;
            s.consecutive_failures = failures;
            s.last_error = Some(err.to_string());
        });
    }

    /// Start the background loop.
    pub fn spawn(self) -> SyncHandle {
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = self.subscribe();
        let task = tokio::spawn(self.run(requests_rx, shutdown_rx));
        SyncHandle {
            requests: requests_tx,
            status,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<SyncRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;
        tracing::info!(
            "synchronizer started (interval {:?}, snapshot {:?})",
            self.config.sync_interval,
            self.immutable.version()
        );

        loop {
            let reply = tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => None,
                request = requests.recv() => match request {
                    Some(request) => request.reply,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                _ = shutdown.changed() => {
                    tracing::info!("sync cycle abandoned for shutdown");
                    break;
                }
            };

            let failed = match &outcome {
                Ok(report) => report.upload_error.is_some(),
                Err(err) => {
                    tracing::warn!("sync cycle failed: {}", err);
                    true
                }
            };
            if failed {
                failures = failures.saturating_add(1);
                if let Err(err) = &outcome {
                    self.record_failure(err, failures);
                } else {
                    self.status.send_modify(|s| s.consecutive_failures = failures);
                }
            } else if failures > 0 {
                failures = 0;
                self.status.send_modify(|s| {
                    s.consecutive_failures = 0;
                    s.last_error = None;
                });
            }
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }

            if failed {
                let delay = backoff_delay(
                    &mut rand::thread_rng(),
                    self.config.backoff_base,
                    self.config.backoff_max,
                    failures,
                );
                tracing::debug!("sync backing off for {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                self.set_state(SyncState::Idle);
                interval.reset();
            }
        }
        self.set_state(SyncState::Idle);
        tracing::info!("synchronizer stopped");
    }
}

/// `min(base * 2^(failures-1), max)` plus up to half of that again as jitter,
/// never above `max`.
pub fn backoff_delay<R: Rng>(rng: &mut R, base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exp).min(max);
    let jitter_ms = (delay.as_millis() as u64) / 2;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rng.gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    (delay + jitter).min(max)
}

/// Cloneable control surface of a running [`Synchronizer`].
#[derive(Clone)]
pub struct SyncHandle {
    requests: mpsc::Sender<SyncRequest>,
    status: watch::Receiver<SyncStatus>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Ask for a cycle soon. Coalesces when requests are already queued.
    pub fn request_sync(&self) {
        let _ = self.requests.try_send(SyncRequest { reply: None });
    }

    /// Run a cycle now and wait for its outcome.
    pub async fn force_sync(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(SyncRequest { reply: Some(tx) })
            .await
            .map_err(|_| EdgeError::Degraded("synchronizer is not running".into()))?;
        rx.await
            .map_err(|_| EdgeError::Degraded("synchronizer stopped before finishing".into()))?
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the loop and wait for it. In-flight leases are released on drop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!("synchronizer task panicked: {}", err);
            }
        }
    }
}
