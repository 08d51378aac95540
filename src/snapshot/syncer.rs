use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::engine::{SnapshotEngine, SnapshotInfo, TaskStatus};
use super::probe::UsageProber;
use super::{Error, Result, Snapshot, SnapshotKind, SnapshotStore};
use crate::error::ResultOkLogExt;

/// Snapshotters whose active snapshots are measured from inside the container.
const OVERLAY_SNAPSHOTTERS: [&str; 2] = ["overlayfs", "overlay1fs"];

/// What a single sync pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Snapshots listed by the engine.
    pub walked: usize,
    /// Unchanged inactive snapshots whose timestamp was bumped.
    pub refreshed: usize,
    /// Active overlay snapshots probed in their container.
    pub probed: usize,
    /// Snapshots left untouched because their usage couldn't be read.
    pub skipped: usize,
    pub evicted: usize,
}

fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

/// Keeps a [`SnapshotStore`] in line with the engine's snapshot catalog.
///
/// Passes must not overlap: liveness is judged only by an entry's timestamp being
/// newer than the start of the pass, so a pass starting before another finished
/// could evict fresh entries. [`SnapshotSyncer::start`] runs passes one at a time.
#[derive(Debug)]
pub struct SnapshotSyncer<E, P> {
    store: Arc<SnapshotStore>,
    engine: Arc<E>,
    prober: P,
    period: Duration,
    cancel: CancellationToken,
}

impl<E, P> SnapshotSyncer<E, P>
where
    E: SnapshotEngine + 'static,
    P: UsageProber + 'static,
{
    pub fn new(store: Arc<SnapshotStore>, engine: Arc<E>, prober: P, period: Duration) -> Self {
        Self {
            store,
            engine,
            prober,
            period,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the periodic loop and aborts running probes when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs a pass now and then one per period until cancelled.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Some(stats) = self
                    .sync()
                    .await
                    .ok_log_context("failed to sync snapshot stats")
                {
                    log::debug!("snapshot sync done: {:?}", stats);
                }
            }
            log::info!("snapshot syncer stopped");
        })
    }

    /// Updates the store from the engine's catalog and drops entries for
    /// snapshots that no longer exist.
    ///
    /// Inactive snapshots already in the store only get their timestamp bumped.
    /// New and active ones get fresh usage. A snapshot whose usage can't be read
    /// keeps its last known entry for this pass.
    ///
    /// # Errors
    ///
    /// Fails only if the catalog can't be listed.
    pub async fn sync(&self) -> Result<SyncStats> {
        let start = now_nanos();
        let infos = self.engine.walk_all().await?;
        let overlay = OVERLAY_SNAPSHOTTERS.contains(&self.engine.snapshotter_name());

        let mut stats = SyncStats {
            walked: infos.len(),
            ..SyncStats::default()
        };

        for info in infos {
            if let Ok(mut snapshot) = self.store.get(&info.name) {
                if snapshot.kind == info.kind && snapshot.kind != SnapshotKind::Active {
                    snapshot.timestamp = now_nanos();
                    self.store.add(snapshot);
                    stats.refreshed += 1;
                    continue;
                }
            }

            match self.fetch(&info, overlay, &mut stats).await {
                Ok(Some(snapshot)) => self.store.add(snapshot),
                Ok(None) => {
                    self.keep_last_known(&info.name);
                    stats.skipped += 1;
                }
                Err(err) => {
                    log::warn!("failed to get usage for snapshot {:?}: {}", info.name, err);
                    self.keep_last_known(&info.name);
                    stats.skipped += 1;
                }
            }
        }

        // TODO: tag entries with a pass sequence number instead of comparing
        // timestamps so a manual sync racing the periodic one can't evict live entries.
        for snapshot in self.store.list() {
            if snapshot.timestamp < start {
                self.store.delete(&snapshot.key);
                stats.evicted += 1;
            }
        }

        Ok(stats)
    }

    /// Bumps the timestamp of a stored entry whose usage couldn't be read, so a
    /// snapshot still in the catalog survives the pass with its last known usage.
    fn keep_last_known(&self, key: &str) {
        if let Ok(mut snapshot) = self.store.get(key) {
            snapshot.timestamp = now_nanos();
            self.store.add(snapshot);
        }
    }

    /// Reads fresh usage. `None` if the snapshot's container is gone or not running.
    async fn fetch(
        &self,
        info: &SnapshotInfo,
        overlay: bool,
        stats: &mut SyncStats,
    ) -> Result<Option<Snapshot>> {
        let timestamp = now_nanos();

        let (size, inodes, usage_percent) = if overlay && info.kind == SnapshotKind::Active {
            stats.probed += 1;
            match self.active_overlay_usage(&info.name).await {
                Ok(usage) => (usage.size, 0, usage.used_percent),
                Err(err) if err.is_not_found() || err.is_precondition_failed() => {
                    // stopped containers may lack df or a pid
                    log::debug!(
                        "failed to get usage for overlay kind of snapshot {:?}: {}",
                        info.name,
                        err
                    );
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        } else {
            let usage = self.engine.usage(&info.name).await?;
            (usage.size, usage.inodes, 0)
        };

        Ok(Some(Snapshot {
            key: info.name.clone(),
            kind: info.kind,
            size,
            inodes,
            usage_percent,
            timestamp,
        }))
    }

    async fn active_overlay_usage(&self, key: &str) -> Result<super::DiskUsage> {
        let pid = self.engine.container_pid(key).await?;
        let status = self.engine.container_status(key).await?;
        if status != TaskStatus::Running {
            return Err(Error::PreconditionFailed(format!(
                "container({key}) is not running"
            )));
        }
        self.prober.probe(pid, &self.cancel).await
    }
}
