//! Snapshot usage statistics.
//!
//! The [`SnapshotSyncer`] periodically walks the snapshot engine's catalog and keeps
//! the [`SnapshotStore`] up to date. Active overlay snapshots are measured by running
//! `df` inside the container since the engine can't see through the overlay.

mod engine;
mod error;
mod probe;
mod store;
mod syncer;

pub use engine::{SnapshotEngine, SnapshotInfo, TaskStatus, Usage};
pub use error::{Error, Result};
pub use probe::{DiskUsage, NsenterProber, UsageProber, parse_df_output};
pub use store::{Snapshot, SnapshotKind, SnapshotStore};
pub use syncer::{SnapshotSyncer, SyncStats};
