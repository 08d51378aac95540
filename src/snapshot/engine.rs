use super::{Result, SnapshotKind};

/// A snapshot as listed by the engine's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub kind: SnapshotKind,
}

/// Usage as reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Bytes used.
    pub size: u64,
    pub inodes: u64,
}

/// Status of the task running in a snapshot's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Pausing,
    Paused,
    Stopped,
    Unknown,
}

/// The content engine owning the snapshot catalog.
pub trait SnapshotEngine: Send + Sync {
    /// Lists every snapshot the engine knows of.
    fn walk_all(&self) -> impl std::future::Future<Output = Result<Vec<SnapshotInfo>>> + Send;

    fn usage(&self, key: &str) -> impl std::future::Future<Output = Result<Usage>> + Send;

    /// Pid of the task of the container whose rootfs is snapshot `key`.
    fn container_pid(&self, key: &str) -> impl std::future::Future<Output = Result<u32>> + Send;

    fn container_status(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<TaskStatus>> + Send;

    /// Name of the snapshotter in use, e.g. `overlayfs`.
    fn snapshotter_name(&self) -> &str;
}
