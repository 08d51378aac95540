//! Creo Runtime: the resource lifecycle core of a container runtime daemon.
//!
//! This library tracks the lifecycle state of containers, enforces per-container disk
//! quotas through filesystem project quotas, keeps snapshot usage statistics in sync
//! with the snapshot engine and assembles the mount table a container is started with.
//!
//! [`Core`] wires these parts together from a [`config::Config`].
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod config;
pub mod container;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod mountinfo;
pub mod quota;
pub mod repair;
pub mod snapshot;
pub mod spec;

use container::{Container, ContainerLocks, StateError};
use quota::QuotaDriver;
use snapshot::{NsenterProber, SnapshotEngine, SnapshotStore, SnapshotSyncer};
use spec::{ContainerLookup, MountSetup, RuntimeSpec, ShmMounter, TmpfsShmMounter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Spec(#[from] spec::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shared services of the daemon.
///
/// Cloning is cheap; clones share the quota id allocator, the snapshot store and the
/// container locks.
#[derive(Clone)]
pub struct Core {
    config: config::Config,
    quota: QuotaDriver,
    snapshots: Arc<SnapshotStore>,
    locks: ContainerLocks,
    shm: Arc<dyn ShmMounter + Send + Sync>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("config", &self.config)
            .field("quota", &self.quota)
            .field("snapshots", &self.snapshots.len())
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Creates the services running the real system tools.
    pub fn new(config: config::Config) -> Self {
        let quota = QuotaDriver::system(&config.mounts_path, config.quota_min_id);
        Self::with_parts(config, quota, Arc::new(TmpfsShmMounter))
    }

    /// Reads the configuration from the environment, see [`config::Config::from_env`].
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(config::Config::from_env()?))
    }

    pub fn with_parts(
        config: config::Config,
        quota: QuotaDriver,
        shm: Arc<dyn ShmMounter + Send + Sync>,
    ) -> Self {
        Self {
            config,
            quota,
            snapshots: Arc::new(SnapshotStore::new()),
            locks: ContainerLocks::new(),
            shm,
        }
    }

    pub fn config(&self) -> &config::Config {
        &self.config
    }

    pub fn quota(&self) -> &QuotaDriver {
        &self.quota
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn locks(&self) -> &ContainerLocks {
        &self.locks
    }

    /// Starts syncing the snapshot store with `engine` on a background task.
    ///
    /// Cancel the returned token to stop the syncer.
    pub fn start_snapshot_syncer<E>(
        &self,
        engine: Arc<E>,
    ) -> (tokio::task::JoinHandle<()>, CancellationToken)
    where
        E: SnapshotEngine + 'static,
    {
        let prober = NsenterProber::new(
            &self.config.nsenter_path,
            &self.config.df_path,
            self.config.disk_probe_timeout,
        );
        let syncer = SnapshotSyncer::new(
            Arc::clone(&self.snapshots),
            engine,
            prober,
            self.config.snapshot_sync_period,
        );
        let cancel = syncer.cancellation_token();
        log::info!(
            "starting snapshot syncer, period: {:?}",
            self.config.snapshot_sync_period
        );
        (syncer.start(), cancel)
    }

    /// Checks that `container` may start and fills in the mounts of its runtime spec.
    ///
    /// The caller must hold the container's lock.
    ///
    /// # Errors
    ///
    /// - [`Error::State`] if the status forbids starting; check
    ///   [`StateError::is_not_modified`] for an already running container.
    /// - [`Error::Spec`] if the mount table can't be built.
    pub fn prepare_start(
        &self,
        container: &mut Container,
        spec: &mut RuntimeSpec,
        containers: &dyn ContainerLookup,
    ) -> Result<()> {
        container.validate_start()?;
        MountSetup::new(containers, self.shm.as_ref())
            .with_default_shm_size(self.config.default_shm_size)
            .setup_mounts(container, spec)?;
        log::debug!(
            "prepared {} mounts for container {}",
            spec.mounts.len(),
            container.id
        );
        Ok(())
    }

    /// Repairs the disk quota of `container`, see [`repair::fix_quota`].
    pub fn fix_quota(
        &self,
        container: &Container,
        request: repair::QuotaRepairRequest,
    ) -> repair::Result<repair::RepairReport> {
        repair::fix_quota(&self.quota, container, request)
    }
}
