use std::path::PathBuf;

use crate::exec::CommandError;
use crate::mountinfo;

use super::size::SizeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    MountInfo(#[from] mountinfo::Error),
    #[error("failed to remount prjquota, mountpoint: `{mount_point}`: {source}")]
    Remount {
        mount_point: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("failed to turn quota on, mountpoint: `{mount_point}`: {source}")]
    QuotaOn {
        mount_point: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("failed to set quota id {id} on `{path}`: {source}")]
    AssignID {
        path: PathBuf,
        id: u32,
        #[source]
        source: CommandError,
    },
    #[error(
        "failed to set quota limit, mountpoint: `{mount_point}`, quota id: {id}, quota: {limit_kb} kbytes: {source}"
    )]
    ApplyLimit {
        mount_point: PathBuf,
        id: u32,
        limit_kb: u64,
        #[source]
        source: CommandError,
    },
    #[error("failed to load quota ids in use: {0}")]
    LoadQuotaIDs(#[source] CommandError),
    #[error("no quota id left above {last}")]
    QuotaIDsExhausted { last: u32 },
    #[error("failed to find quota id to set on `{path}`")]
    ZeroQuotaID { path: PathBuf },
    #[error("invalid quota size `{size}`: {source}")]
    InvalidSize {
        size: String,
        #[source]
        source: SizeError,
    },
    #[error("quota limit {limit_kb} kbytes for `{path}` exceeds device capacity {capacity_kb} kbytes")]
    ExceedsDevice {
        path: PathBuf,
        limit_kb: u64,
        capacity_kb: u64,
    },
    #[error("failed to get capacity of `{path}`: {source}")]
    DeviceCapacity {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to stat `{path}`: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file `{path}` is not regular file")]
    NotRegular { path: PathBuf },
    #[error("path `{path}` is not valid UTF-8")]
    NonUtf8Path { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, Error>;
