//! Filesystem project quotas for container root and volume directories.
//!
//! A directory is limited by stamping a project id on it and setting a block limit
//! for that id on the backing xfs, ext3 or ext4 filesystem.

mod allocator;
mod backend;
mod driver;
mod error;
mod size;

pub use allocator::{QuotaIdAllocator, QuotaIdSource, RepquotaSource};
pub use backend::{ExtBackend, QuotaBackend, XfsBackend, backend_for};
pub use driver::QuotaDriver;
pub use error::{Error, Result};
pub use size::{SizeError, to_bytes, to_kilobytes};

/// Project ids at or below this value are reserved for manual use.
pub const QUOTA_MIN_ID: u32 = 16_777_216;
