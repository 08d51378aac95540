use crate::fsutil;

use super::parser::parse_mount_line;
use super::{Error, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Filesystems that support project quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsType {
    Xfs,
    Ext3,
    Ext4,
}

impl FsType {
    /// Maps a mount table filesystem name to a quota-capable type.
    ///
    /// Returns `None` for every filesystem without project quota support.
    pub fn from_mount_type(fs_type: &str) -> Option<Self> {
        match fs_type {
            "xfs" => Some(FsType::Xfs),
            "ext3" => Some(FsType::Ext3),
            "ext4" => Some(FsType::Ext4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Xfs => "xfs",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
        }
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The quota-capable filesystem backing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub device_id: u64,
    pub fs_type: FsType,
}

/// Result of scanning the mount table for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaMountPoint {
    pub mount_point: PathBuf,
    /// Whether the chosen mount carries the `prjquota` option.
    pub quota_enabled: bool,
    pub fs_type: FsType,
}

/// Scans the mount table at `path` for xfs/ext3/ext4 mounts of the device `device_id`.
///
/// When the device is mounted several times (bind mounts), the mount point with the
/// shortest path wins.
///
/// # Errors
///
/// - [`Error::FileOpen`] if the file can't be opened.
/// - [`Error::ReadLine`] if reading from the file fails.
///
/// # Example
///
/// ```no_run
/// use creo_runtime::{fsutil, mountinfo};
///
/// let dev = fsutil::device_id("/var/lib/pouch").unwrap();
/// let found = mountinfo::check_mountpoint("/proc/mounts", dev).unwrap();
/// println!("{:?}", found);
/// ```
pub fn check_mountpoint(path: impl AsRef<Path>, device_id: u64) -> Result<Option<QuotaMountPoint>> {
    let path = path.as_ref();
    let buf = fsutil::open_file_reader(path)?;

    check_mountpoint_from_reader(buf, path, device_id)
}

/// Resolves the quota-capable mount for `dir` using the mount table at `mounts_path`.
///
/// # Errors
///
/// Returns errors from [`check_mountpoint`] and:
///
/// - [`Error::DeviceID`] if `dir` cannot be stat'ed.
/// - [`Error::MissingMountPoint`] if no xfs/ext3/ext4 mount of the device exists.
pub fn find_quota_mount(
    mounts_path: impl AsRef<Path>,
    dir: impl AsRef<Path>,
) -> Result<(MountInfo, bool)> {
    let dir = dir.as_ref();
    let device_id = fsutil::device_id(dir).map_err(|source| Error::DeviceID {
        path: dir.to_path_buf(),
        source,
    })?;

    let found = check_mountpoint(mounts_path, device_id)?.ok_or_else(|| {
        Error::MissingMountPoint {
            path: dir.to_path_buf(),
        }
    })?;

    Ok((
        MountInfo {
            mount_point: found.mount_point,
            device_id,
            fs_type: found.fs_type,
        },
        found.quota_enabled,
    ))
}

fn check_mountpoint_from_reader<R: BufRead>(
    mut reader: R,
    origin: &Path,
    device_id: u64,
) -> Result<Option<QuotaMountPoint>> {
    let mut line = String::with_capacity(256);
    let mut found: Option<QuotaMountPoint> = None;

    while reader
        .read_line(&mut line)
        .map_err(|source| Error::ReadLine {
            path: origin.to_path_buf(),
            source,
        })?
        != 0
    {
        match parse_mount_line(line.as_str()) {
            Ok(entry) => {
                if let Some(fs_type) = FsType::from_mount_type(entry.fs_type) {
                    let mount_point: &str = &entry.mount_point;
                    let shorter = found
                        .as_ref()
                        .is_none_or(|f| f.mount_point.as_os_str().len() >= mount_point.len());

                    if shorter && fsutil::device_id(mount_point).ok() == Some(device_id) {
                        found = Some(QuotaMountPoint {
                            mount_point: PathBuf::from(mount_point),
                            quota_enabled: entry.has_option("prjquota"),
                            fs_type,
                        });
                    }
                }
            }
            Err(err) => log::trace!("skipping mount table line in `{}`: {}", origin.display(), err),
        }

        line.clear();
    }

    log::debug!(
        "check device: ({}), mountpoint: ({:?}) in `{}`",
        device_id,
        found,
        origin.display()
    );

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn new_cursor_from_contents(contents: &str) -> Cursor<Vec<u8>> {
        Cursor::new(contents.as_bytes().to_vec())
    }

    #[test]
    fn test_shortest_mount_point_wins() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        let dev = fsutil::device_id(root.path()).unwrap();

        let input = format!(
            "/dev/sdb1 {nested} ext4 rw,relatime,prjquota 0 0\n/dev/sdb1 {root} ext4 rw,relatime 0 0\n",
            nested = nested.display(),
            root = root.path().display()
        );
        let reader = new_cursor_from_contents(&input);

        let found = check_mountpoint_from_reader(reader, Path::new("/dummy"), dev)
            .unwrap()
            .unwrap();
        assert_eq!(found.mount_point, root.path());
        assert_eq!(found.fs_type, FsType::Ext4);
        assert!(!found.quota_enabled);
    }

    #[test]
    fn test_ignores_unsupported_filesystems() {
        let root = tempfile::tempdir().unwrap();
        let dev = fsutil::device_id(root.path()).unwrap();
        let input = format!(
            "tmpfs {} tmpfs rw,prjquota 0 0\ngarbage\n",
            root.path().display()
        );
        let reader = new_cursor_from_contents(&input);

        let found = check_mountpoint_from_reader(reader, Path::new("/dummy"), dev).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_ignores_other_devices() {
        let root = tempfile::tempdir().unwrap();
        let dev = fsutil::device_id(root.path()).unwrap();
        let input = format!("/dev/sdb1 {} xfs rw,prjquota 0 0\n", root.path().display());
        let reader = new_cursor_from_contents(&input);

        let found =
            check_mountpoint_from_reader(reader, Path::new("/dummy"), dev.wrapping_add(1)).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_find_quota_mount_from_tempfile() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("upper");
        std::fs::create_dir(&dir).unwrap();

        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "/dev/sdb1 {} xfs rw,prjquota 0 0", root.path().display()).unwrap();

        let (info, enabled) = find_quota_mount(tmp.path(), &dir).unwrap();
        assert_eq!(info.mount_point, root.path());
        assert_eq!(info.fs_type, FsType::Xfs);
        assert_eq!(info.device_id, fsutil::device_id(&dir).unwrap());
        assert!(enabled);
    }

    #[test]
    fn test_find_quota_mount_missing() {
        let root = tempfile::tempdir().unwrap();
        let tmp = NamedTempFile::new().unwrap();

        let err = find_quota_mount(tmp.path(), root.path()).unwrap_err();
        match err {
            Error::MissingMountPoint { path } => assert_eq!(path, root.path()),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_mount_table() {
        let err = check_mountpoint("/definitely/does/not/exist", 1).unwrap_err();
        assert!(matches!(err, Error::FileOpen(_)));
    }
}
