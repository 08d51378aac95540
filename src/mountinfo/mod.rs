//! Mount table inspection for locating quota-capable filesystems.
mod detect;
mod error;
mod parser;

pub use detect::{FsType, MountInfo, QuotaMountPoint, check_mountpoint, find_quota_mount};
pub use error::{Error, Result};
pub use parser::{MountEntry, ParseError, parse_mount_line};
