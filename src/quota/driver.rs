use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::exec::{self, CommandRunner, SystemRunner};
use crate::fsutil;
use crate::mountinfo::{self, FsType, MountInfo, QuotaMountPoint};

use super::allocator::{QuotaIdAllocator, RepquotaSource};
use super::backend::{QuotaBackend, backend_for, path_str, read_project_id};
use super::{Error, Result, size};

/// Project quota driver for xfs, ext3 and ext4.
///
/// Cloning is cheap; clones share the command runner and the id allocator.
#[derive(Debug, Clone)]
pub struct QuotaDriver {
    runner: Arc<dyn CommandRunner>,
    allocator: Arc<QuotaIdAllocator>,
    mounts_path: PathBuf,
}

impl QuotaDriver {
    /// Creates a driver that runs its tools through `runner` and reads the mount
    /// table at `mounts_path`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        allocator: Arc<QuotaIdAllocator>,
        mounts_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            allocator,
            mounts_path: mounts_path.into(),
        }
    }

    /// Creates a driver running the real system tools, allocating ids above `min_id`.
    pub fn system(mounts_path: impl Into<PathBuf>, min_id: u32) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let source = RepquotaSource::new(Arc::clone(&runner));
        let allocator = Arc::new(QuotaIdAllocator::new(min_id, Box::new(source)));
        Self::new(runner, allocator, mounts_path)
    }

    pub fn min_quota_id(&self) -> u32 {
        self.allocator.min_id()
    }

    fn backend(&self, fs_type: FsType) -> Box<dyn QuotaBackend> {
        backend_for(fs_type, Arc::clone(&self.runner))
    }

    /// Makes sure project quotas are in effect on the filesystem holding `dir`.
    ///
    /// Remounts the filesystem with `prjquota` when the option is missing and, for
    /// ext3/ext4, turns quota accounting on.
    ///
    /// # Errors
    ///
    /// - [`Error::MountInfo`] if `dir` can't be stat'ed or lies on no xfs/ext3/ext4 mount.
    /// - [`Error::Remount`] or [`Error::QuotaOn`] if a tool fails.
    pub fn enforce_quota(&self, dir: impl AsRef<Path>) -> Result<MountInfo> {
        let dir = dir.as_ref();
        log::debug!("start project quota driver: `{}`", dir.display());

        let (mount, quota_enabled) = mountinfo::find_quota_mount(&self.mounts_path, dir)?;
        let mount_point = path_str(&mount.mount_point)?;

        if !quota_enabled {
            exec::run_checked(
                self.runner.as_ref(),
                "mount",
                &["-o", "remount,prjquota", mount_point],
            )
            .map_err(|source| {
                log::error!("failed to remount prjquota, mountpoint: `{}`: {}", mount_point, source);
                Error::Remount {
                    mount_point: mount.mount_point.clone(),
                    source,
                }
            })?;
        }

        // quotaon doesn't work on xfs
        if mount.fs_type != FsType::Xfs {
            match exec::run_checked(self.runner.as_ref(), "quotaon", &["-P", mount_point]) {
                Ok(_) => {}
                Err(err) if err.stderr().contains(" File exists") => {
                    log::debug!("quota already on, mountpoint: `{}`", mount_point);
                }
                Err(source) => {
                    log::error!("failed to quota on, mountpoint: `{}`: {}", mount_point, source);
                    return Err(Error::QuotaOn {
                        mount_point: mount.mount_point.clone(),
                        source,
                    });
                }
            }
        }

        Ok(mount)
    }

    /// Limits the disk usage of `dir` to `size`.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory to limit, usually a container's upper dir or a volume.
    /// * `size` - Human readable limit such as `10g`.
    /// * `quota_id` - Project id to use, or 0 to reuse the id on disk or allocate one.
    ///
    /// # Returns
    ///
    /// The project id the limit was applied to.
    ///
    /// # Errors
    ///
    /// Fails when quotas can't be enforced, `size` is invalid or exceeds the device,
    /// the id can't be assigned, or the limit can't be applied.
    pub fn set_disk_quota(&self, dir: impl AsRef<Path>, size: &str, quota_id: u32) -> Result<u32> {
        let dir = dir.as_ref();
        log::debug!(
            "set disk quota, dir: `{}`, size: {}, quota id: {}",
            dir.display(),
            size,
            quota_id
        );

        let mount = self.enforce_quota(dir)?;

        let limit_kb = size::to_kilobytes(size).map_err(|source| Error::InvalidSize {
            size: size.to_owned(),
            source,
        })?;
        check_dev_limit(dir, &mount, limit_kb)?;

        let id = self.set_quota_id(dir, quota_id, &mount)?;
        if id == 0 {
            return Err(Error::ZeroQuotaID {
                path: dir.to_path_buf(),
            });
        }

        self.backend(mount.fs_type).apply_limit(&mount, id, limit_kb)?;
        Ok(id)
    }

    /// Stamps a project id on `dir` and returns it.
    ///
    /// A nonzero `qid` is used as is. Otherwise the id already stamped on `dir` is
    /// reused, and a fresh one is allocated if there is none.
    pub fn set_quota_id(&self, dir: impl AsRef<Path>, qid: u32, mount: &MountInfo) -> Result<u32> {
        let dir = dir.as_ref();
        log::debug!("set subtree, dir: `{}`, quota id: {}", dir.display(), qid);
        check_regular(dir)?;

        let id = if qid != 0 {
            self.allocator.reserve(qid);
            qid
        } else {
            match self.get_quota_id_in_file_attr(dir) {
                0 => self.next_quota_id()?,
                existing => return Ok(existing),
            }
        };

        self.backend(mount.fs_type).assign_id(dir, id)?;
        Ok(id)
    }

    /// Allocates the next free project id.
    pub fn next_quota_id(&self) -> Result<u32> {
        self.allocator.next_id()
    }

    /// Returns the project id stamped on `dir`, or 0 if it can't be determined.
    pub fn get_quota_id_in_file_attr(&self, dir: impl AsRef<Path>) -> u32 {
        read_project_id(self.runner.as_ref(), dir.as_ref())
    }

    /// Stamps `id` on `dir` using the tool matching its filesystem.
    pub fn set_quota_id_in_file_attr(&self, dir: impl AsRef<Path>, id: u32) -> Result<()> {
        let dir = dir.as_ref();
        log::debug!("set file attr, dir: `{}`, quota id: {}", dir.display(), id);
        check_regular(dir)?;

        let (mount, _) = mountinfo::find_quota_mount(&self.mounts_path, dir)?;
        self.backend(mount.fs_type).assign_id(dir, id)
    }

    /// Stamps `id` on `dir` and everything below it.
    pub fn set_file_attr_recursive(&self, dir: impl AsRef<Path>, id: u32) -> Result<()> {
        let dir = dir.as_ref();
        check_regular(dir)?;

        let (mount, _) = mountinfo::find_quota_mount(&self.mounts_path, dir)?;
        self.backend(mount.fs_type).recursive_restamp(dir, id)
    }

    /// Runs [`QuotaDriver::set_file_attr_recursive`] on a background thread.
    ///
    /// Failures are logged. The returned handle may be dropped; propagation is not
    /// finished when this returns. `None` if the thread couldn't be spawned.
    pub fn spawn_file_attr_recursive(&self, dir: PathBuf, id: u32) -> Option<JoinHandle<()>> {
        let driver = self.clone();
        let spawned = std::thread::Builder::new()
            .name("quota-restamp".to_owned())
            .spawn(move || {
                if let Err(err) = driver.set_file_attr_recursive(&dir, id) {
                    log::warn!(
                        "failed to set quota id {} recursively on `{}`: {}",
                        id,
                        dir.display(),
                        err
                    );
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("failed to spawn quota restamp thread: {}", err);
                None
            }
        }
    }

    /// Finds the shortest xfs/ext3/ext4 mountpoint of `device_id`.
    ///
    /// Read failures are logged and reported as `None`.
    pub fn check_mountpoint(&self, device_id: u64) -> Option<QuotaMountPoint> {
        match mountinfo::check_mountpoint(&self.mounts_path, device_id) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("{}", err);
                None
            }
        }
    }
}

fn check_regular(path: &Path) -> Result<()> {
    let regular = fsutil::is_regular_file(path).map_err(|source| Error::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    if !regular {
        log::debug!("set quota id skip not regular file: `{}`", path.display());
        return Err(Error::NotRegular {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn check_dev_limit(dir: &Path, mount: &MountInfo, limit_kb: u64) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(&mount.mount_point).map_err(|source| {
        Error::DeviceCapacity {
            path: mount.mount_point.clone(),
            source,
        }
    })?;
    let capacity_kb = (stat.blocks() as u64).saturating_mul(stat.fragment_size() as u64) / 1024;
    if limit_kb > capacity_kb {
        return Err(Error::ExceedsDevice {
            path: dir.to_path_buf(),
            limit_kb,
            capacity_kb,
        });
    }
    Ok(())
}
