//! Filesystem specific ways of stamping project ids and applying block limits.

use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::exec::{self, CommandRunner};
use crate::mountinfo::{FsType, MountInfo};

use super::{Error, Result};

/// Project quota operations that differ between filesystems.
pub trait QuotaBackend: Send + Sync {
    /// Stamps `id` as the project id of `dir`.
    fn assign_id(&self, dir: &Path, id: u32) -> Result<()>;

    /// Sets a hard block limit of `limit_kb` kilobytes for project `id`.
    fn apply_limit(&self, mount: &MountInfo, id: u32, limit_kb: u64) -> Result<()>;

    /// Stamps `id` on `dir` and everything below it.
    fn recursive_restamp(&self, dir: &Path, id: u32) -> Result<()>;
}

/// Picks the backend for a detected filesystem type.
pub fn backend_for(fs_type: FsType, runner: Arc<dyn CommandRunner>) -> Box<dyn QuotaBackend> {
    match fs_type {
        FsType::Xfs => Box::new(XfsBackend { runner }),
        FsType::Ext3 | FsType::Ext4 => Box::new(ExtBackend { runner }),
    }
}

pub(super) fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: path.to_path_buf(),
    })
}

/// ext3/ext4 via `chattr` and `setquota`.
#[derive(Debug, Clone)]
pub struct ExtBackend {
    runner: Arc<dyn CommandRunner>,
}

impl QuotaBackend for ExtBackend {
    fn assign_id(&self, dir: &Path, id: u32) -> Result<()> {
        let strid = id.to_string();
        exec::run_checked(self.runner.as_ref(), "chattr", &["-p", &strid, "+P", path_str(dir)?])
            .map_err(|source| Error::AssignID {
                path: dir.to_path_buf(),
                id,
                source,
            })?;
        Ok(())
    }

    fn apply_limit(&self, mount: &MountInfo, id: u32, limit_kb: u64) -> Result<()> {
        let strid = id.to_string();
        let limit = limit_kb.to_string();
        let mount_point = path_str(&mount.mount_point)?;
        exec::run_checked(
            self.runner.as_ref(),
            "setquota",
            &["-P", &strid, "0", &limit, "0", "0", mount_point],
        )
        .map_err(|source| Error::ApplyLimit {
            mount_point: mount.mount_point.clone(),
            id,
            limit_kb,
            source,
        })?;
        Ok(())
    }

    fn recursive_restamp(&self, dir: &Path, id: u32) -> Result<()> {
        let strid = id.to_string();
        exec::run_checked(
            self.runner.as_ref(),
            "chattr",
            &["-R", "-p", &strid, "+P", path_str(dir)?],
        )
        .map_err(|source| Error::AssignID {
            path: dir.to_path_buf(),
            id,
            source,
        })?;
        Ok(())
    }
}

/// xfs via `xfs_quota`, which has no `quotaon` step.
#[derive(Debug, Clone)]
pub struct XfsBackend {
    runner: Arc<dyn CommandRunner>,
}

impl QuotaBackend for XfsBackend {
    fn assign_id(&self, dir: &Path, id: u32) -> Result<()> {
        let cmd = format!("project -s -p {} {}", path_str(dir)?, id);
        exec::run_checked(self.runner.as_ref(), "xfs_quota", &["-x", "-c", &cmd]).map_err(
            |source| Error::AssignID {
                path: dir.to_path_buf(),
                id,
                source,
            },
        )?;
        Ok(())
    }

    fn apply_limit(&self, mount: &MountInfo, id: u32, limit_kb: u64) -> Result<()> {
        let cmd = format!("limit -p bhard={}k {}", limit_kb, id);
        let mount_point = path_str(&mount.mount_point)?;
        exec::run_checked(self.runner.as_ref(), "xfs_quota", &["-x", "-c", &cmd, mount_point])
            .map_err(|source| Error::ApplyLimit {
                mount_point: mount.mount_point.clone(),
                id,
                limit_kb,
                source,
            })?;
        Ok(())
    }

    /// Walks the tree and re-stamps every file or directory whose id differs.
    ///
    /// Walk errors and failed stamps are logged and skipped.
    fn recursive_restamp(&self, dir: &Path, id: u32) -> Result<()> {
        for entry in WalkDir::new(dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("set quota walk dir `{}` get error: {}", dir.display(), err);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if !(file_type.is_file() || file_type.is_dir()) {
                log::debug!("set quota id skip not regular file: `{}`", entry.path().display());
                continue;
            }

            if read_project_id(self.runner.as_ref(), entry.path()) == id {
                continue;
            }

            if let Err(err) = self.assign_id(entry.path(), id) {
                log::error!("{}", err);
            }
        }
        Ok(())
    }
}

/// Reads the project id stamped on `dir` from `lsattr -p <parent>`.
///
/// Returns 0 on any failure; valid project ids are positive.
pub(super) fn read_project_id(runner: &dyn CommandRunner, dir: &Path) -> u32 {
    let (Some(dir_str), Some(parent)) = (dir.to_str(), dir.parent().and_then(Path::to_str)) else {
        log::error!("failed to get file attr of quota id for `{}`", dir.display());
        return 0;
    };
    let parent = if parent.is_empty() { "." } else { parent };

    let output = match exec::run_checked(runner, "lsattr", &["-p", parent]) {
        Ok(output) => output,
        Err(err) => {
            log::error!("failed to lsattr, dir: `{}`: {}", dir.display(), err);
            return 0;
        }
    };

    // 16777256 --------------e---P /var/lib/pouch/containers/abc
    let found = output
        .stdout
        .lines()
        .filter_map(parse_lsattr_line)
        .find(|(_, path)| *path == dir_str);

    match found {
        Some((id, _)) => {
            log::debug!("get file attr: `{}`, quota id: {}", dir.display(), id);
            id
        }
        None => {
            log::error!("failed to get file attr of quota id for `{}`", dir.display());
            0
        }
    }
}

/// Splits an `lsattr -p` line into project id and path. The path may contain spaces.
fn parse_lsattr_line(line: &str) -> Option<(u32, &str)> {
    let (id, rest) = line.trim_start().split_once(char::is_whitespace)?;
    let (_flags, path) = rest.trim_start().split_once(char::is_whitespace)?;
    Some((id.parse().ok()?, path.trim_start()))
}
