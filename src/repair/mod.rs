//! Repair of drifted project quotas on an existing container.
//!
//! A container created with a `DiskQuota` label has its upper dir and volumes
//! stamped with a project id. Copying or restoring those directories loses the
//! stamp; [`fix_quota`] puts the id and limit back.

mod error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use regex::Regex;

use crate::container::{Container, DISK_QUOTA_LABEL};
use crate::fsutil;
use crate::quota::QuotaDriver;

pub use error::{Error, Result};

/// Id value asking repair to reuse the id the container already has.
pub const ORIGIN_QUOTA_ID: i64 = -1;

/// Which parts of a container to repair. A target of 0 is not requested,
/// [`ORIGIN_QUOTA_ID`] reuses the recorded id, anything else is an explicit id.
///
/// Only the first requested target runs, in field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QuotaRepairRequest {
    pub container: i64,
    pub rootfs: i64,
    pub volumes: i64,
}

/// Outcome of a repair.
#[derive(Debug, Default)]
pub struct RepairReport {
    /// Directories a limit was applied to, with the id used.
    pub handled: Vec<(PathBuf, u32)>,
    /// Background threads still stamping the ids recursively.
    pub pending: Vec<JoinHandle<()>>,
}

impl RepairReport {
    /// Blocks until every recursive stamp finished.
    pub fn wait(self) {
        for handle in self.pending {
            if handle.join().is_err() {
                log::error!("quota restamp thread panicked");
            }
        }
    }
}

struct DiskQuotaPattern {
    pattern: Regex,
    size: String,
}

impl DiskQuotaPattern {
    /// Whether the pattern matches all of `dest`.
    fn matches(&self, dest: &str) -> bool {
        self.pattern
            .find(dest)
            .is_some_and(|m| m.as_str() == dest)
    }
}

/// Compiles the destination patterns, skipping invalid ones.
fn parse_disk_quota(quota: &BTreeMap<String, String>) -> Vec<DiskQuotaPattern> {
    quota
        .iter()
        .filter_map(|(exp, size)| match Regex::new(exp) {
            Ok(pattern) => Some(DiskQuotaPattern {
                pattern,
                size: size.clone(),
            }),
            Err(err) => {
                log::warn!("skip invalid disk quota pattern {:?}: {}", exp, err);
                None
            }
        })
        .collect()
}

fn root_limit(patterns: &[DiskQuotaPattern]) -> Result<&str> {
    patterns
        .iter()
        .find(|p| p.matches("/"))
        .map(|p| p.size.as_str())
        .ok_or(Error::MissingLimit)
}

fn check_target(id: i64, min_id: u32) -> Result<()> {
    if id != 0 && id != ORIGIN_QUOTA_ID && id < i64::from(min_id) {
        return Err(Error::InvalidQuotaID(id));
    }
    Ok(())
}

/// Repairs the quota of `container` as requested.
///
/// # Errors
///
/// Fails when a requested id is below the driver's minimum, the container has no
/// `DiskQuota` label, or the chosen repair can't determine a size or id. Failures
/// to apply a limit to a single directory are only logged.
pub fn fix_quota(
    driver: &QuotaDriver,
    container: &Container,
    request: QuotaRepairRequest,
) -> Result<RepairReport> {
    let min_id = driver.min_quota_id();
    check_target(request.container, min_id)?;
    check_target(request.rootfs, min_id)?;
    check_target(request.volumes, min_id)?;

    let labelled = container
        .config
        .labels
        .get(DISK_QUOTA_LABEL)
        .is_some_and(|size| !size.is_empty());
    if !labelled {
        return Err(Error::MissingDiskQuotaLabel);
    }

    if request.container != 0 {
        log::info!(
            "do quota fix, fix container {} all quota with quota id {}",
            container.id,
            request.container
        );
        fix_container(driver, container, request.container)
    } else if request.rootfs != 0 {
        log::info!(
            "do quota fix, fix container {} rootfs quota with quota id {}",
            container.id,
            request.rootfs
        );
        fix_rootfs(driver, container, request.rootfs)
    } else if request.volumes != 0 {
        log::info!(
            "do quota fix, fix container {} volumes quota with quota id {}",
            container.id,
            request.volumes
        );
        fix_volumes(driver, container, request.volumes)
    } else {
        log::info!("no quota fix requested for container {}", container.id);
        Ok(RepairReport::default())
    }
}

/// Reapplies the recorded id to every mountpoint matched by a size pattern.
///
/// Only [`ORIGIN_QUOTA_ID`] is supported. The root mount targets the upper dir.
pub fn fix_container(
    driver: &QuotaDriver,
    container: &Container,
    fixed_quota: i64,
) -> Result<RepairReport> {
    if fixed_quota != ORIGIN_QUOTA_ID {
        return Err(Error::NotOriginQuota(fixed_quota));
    }

    let patterns = parse_disk_quota(&container.config.disk_quota);
    if patterns.len() > 1 {
        return Err(Error::AmbiguousDiskQuota(container.config.disk_quota.clone()));
    }

    let qid = container.config.label_quota_id();
    if qid == 0 {
        return Err(Error::MissingConfigQuotaID(container.config.quota_id.clone()));
    }

    let root = container
        .base_fs
        .as_deref()
        .map(|base_fs| ("/", base_fs));
    let mounts = container
        .mounts
        .iter()
        .map(|m| (m.destination.as_str(), Path::new(&m.source)));

    let mut report = RepairReport::default();
    for (dest, source) in root.into_iter().chain(mounts) {
        if source.as_os_str().is_empty() {
            continue;
        }
        let Some(pattern) = patterns.iter().find(|p| p.matches(dest)) else {
            continue;
        };
        if pattern.size.is_empty() {
            continue;
        }

        let dir = if dest == "/" {
            match container.snapshotter.upper_dir() {
                Some(upper) => upper,
                None => {
                    log::warn!(
                        "failed to get upper dir of `{}` in fix quota",
                        source.display()
                    );
                    continue;
                }
            }
        } else {
            source
        };

        log::info!("fix container directory `{}` quota", dir.display());
        apply(driver, &mut report, dir, &pattern.size, qid);
    }

    Ok(report)
}

/// Reapplies the quota of the upper dir.
///
/// The id is taken from the request, then the container config, then the upper
/// dir itself. A config id disagreeing with the stamped one is only accepted with
/// an explicit id.
pub fn fix_rootfs(
    driver: &QuotaDriver,
    container: &Container,
    fixed_quota: i64,
) -> Result<RepairReport> {
    check_target(fixed_quota, driver.min_quota_id())?;

    let patterns = parse_disk_quota(&container.config.disk_quota);
    let size = root_limit(&patterns)?;

    let label_qid = container.config.label_quota_id();
    let upper = container
        .snapshotter
        .upper_dir()
        .ok_or(Error::MissingUpperDir)?;

    let on_disk = driver.get_quota_id_in_file_attr(upper);
    if label_qid != 0 && on_disk != 0 && on_disk != label_qid && fixed_quota == ORIGIN_QUOTA_ID {
        return Err(Error::QuotaIDMismatch {
            label: label_qid,
            on_disk,
        });
    }

    let qid = [explicit_id(fixed_quota)?, label_qid, on_disk]
        .into_iter()
        .find(|&id| id != 0)
        .ok_or(Error::UnresolvedQuotaID { target: "rootfs" })?;

    let mut report = RepairReport::default();
    apply(driver, &mut report, upper, size, qid);
    Ok(report)
}

/// Applies one id and size to every local volume backed by a host directory.
pub fn fix_volumes(
    driver: &QuotaDriver,
    container: &Container,
    fixed_quota: i64,
) -> Result<RepairReport> {
    check_target(fixed_quota, driver.min_quota_id())?;

    let volumes: BTreeMap<String, &Path> = container
        .mounts
        .iter()
        .filter(|m| m.driver == "local" && !m.source.is_empty())
        .filter(|m| std::fs::metadata(&m.source).is_ok_and(|meta| meta.is_dir()))
        .map(|m| (fsutil::clean_path(&m.destination), Path::new(&m.source)))
        .collect();

    if volumes.is_empty() {
        log::info!("no volume of container {} needs a quota fix", container.id);
        return Ok(RepairReport::default());
    }

    let patterns = parse_disk_quota(&container.config.disk_quota);
    if patterns.len() > 1 {
        return Err(Error::AmbiguousDiskQuota(container.config.disk_quota.clone()));
    }
    let size = root_limit(&patterns)?;

    let qid = match explicit_id(fixed_quota)? {
        0 => container.config.label_quota_id(),
        id => id,
    };
    if qid == 0 {
        return Err(Error::UnresolvedQuotaID { target: "volume" });
    }

    log::info!(
        "fix container {} volumes {:?} with quota id {}",
        container.id,
        volumes.keys().collect::<Vec<_>>(),
        qid
    );

    let mut report = RepairReport::default();
    for dir in volumes.into_values() {
        apply(driver, &mut report, dir, size, qid);
    }
    Ok(report)
}

/// The explicit id of a request, 0 for [`ORIGIN_QUOTA_ID`].
fn explicit_id(fixed_quota: i64) -> Result<u32> {
    if fixed_quota == ORIGIN_QUOTA_ID {
        return Ok(0);
    }
    u32::try_from(fixed_quota).map_err(|_| Error::InvalidQuotaID(fixed_quota))
}

fn apply(driver: &QuotaDriver, report: &mut RepairReport, dir: &Path, size: &str, qid: u32) {
    if let Err(err) = driver.set_disk_quota(dir, size, qid) {
        log::warn!(
            "failed to set `{}` quota, size({}), quota id({}): {}",
            dir.display(),
            size,
            qid,
            err
        );
    }
    report.handled.push((dir.to_path_buf(), qid));
    report
        .pending
        .extend(driver.spawn_file_attr_recursive(dir.to_path_buf(), qid));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerID, MountPoint, UPPER_DIR_KEY};
    use crate::exec::testing::FakeQuotaTools;
    use crate::quota::{QuotaIdAllocator, QuotaIdSource};
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::{NamedTempFile, TempDir};

    #[derive(Debug)]
    struct NoIDs;

    impl QuotaIdSource for NoIDs {
        fn load(&self) -> crate::quota::Result<HashSet<u32>> {
            Ok(HashSet::new())
        }
    }

    struct Fixture {
        root: TempDir,
        _mounts: NamedTempFile,
        tools: Arc<FakeQuotaTools>,
        driver: QuotaDriver,
        container: Container,
    }

    impl Fixture {
        fn dir(&self, name: &str) -> PathBuf {
            let dir = self.root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn id_of(&self, dir: &Path) -> Option<u32> {
            self.tools.id_of(dir.to_str().unwrap())
        }
    }

    /// A container labelled with quota id 4002 and an upper dir on an ext4 mount.
    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mut mounts = NamedTempFile::new().unwrap();
        writeln!(mounts, "/dev/sdb1 {} ext4 rw,prjquota 0 0", root.path().display()).unwrap();

        let tools = Arc::new(FakeQuotaTools::default());
        let allocator = Arc::new(QuotaIdAllocator::new(16_777_216, Box::new(NoIDs)));
        let driver = QuotaDriver::new(tools.clone(), allocator, mounts.path());

        let upper = root.path().join("upper");
        std::fs::create_dir_all(&upper).unwrap();

        let mut container = Container::new(ContainerID::new("c1").unwrap());
        container.config.quota_id = "4002".into();
        container
            .config
            .labels
            .insert(DISK_QUOTA_LABEL.into(), "1m".into());
        container.config.disk_quota.insert(".*".into(), "1m".into());
        container.base_fs = Some(root.path().join("rootfs"));
        container
            .snapshotter
            .data
            .insert(UPPER_DIR_KEY.into(), upper.to_str().unwrap().into());

        Fixture {
            root,
            _mounts: mounts,
            tools,
            driver,
            container,
        }
    }

    fn volume(source: &Path, dest: &str, driver: &str) -> MountPoint {
        MountPoint {
            source: source.to_str().unwrap().into(),
            destination: dest.into(),
            driver: driver.into(),
            rw: true,
            ..Default::default()
        }
    }

    fn rootfs(id: i64) -> QuotaRepairRequest {
        QuotaRepairRequest {
            rootfs: id,
            ..Default::default()
        }
    }

    #[test]
    fn test_request_validation() {
        let f = fixture();
        for id in [1, 4002, 16_777_215] {
            let err = fix_quota(&f.driver, &f.container, rootfs(id)).unwrap_err();
            assert!(matches!(err, Error::InvalidQuotaID(got) if got == id), "{err}");
        }

        let mut unlabelled = f.container.clone();
        unlabelled.config.labels.insert(DISK_QUOTA_LABEL.into(), String::new());
        let err = fix_quota(&f.driver, &unlabelled, rootfs(-1)).unwrap_err();
        assert!(matches!(err, Error::MissingDiskQuotaLabel), "{err}");

        let report = fix_quota(&f.driver, &f.container, QuotaRepairRequest::default()).unwrap();
        assert!(report.handled.is_empty());
        assert!(f.tools.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fix_rootfs_uses_label_id() {
        let f = fixture();
        let upper = f.dir("upper");

        let report = fix_quota(&f.driver, &f.container, rootfs(-1)).unwrap();

        assert_eq!(report.handled, vec![(upper.clone(), 4002)]);
        report.wait();
        assert_eq!(f.id_of(&upper), Some(4002));
        assert_eq!(f.tools.calls_to("setquota").len(), 1);
    }

    #[test]
    fn test_fix_rootfs_label_and_disk_disagree() {
        let f = fixture();
        let upper = f.dir("upper");
        f.tools.stamp(upper.to_str().unwrap(), 4003);

        let err = fix_quota(&f.driver, &f.container, rootfs(-1)).unwrap_err();
        assert!(
            matches!(err, Error::QuotaIDMismatch { label: 4002, on_disk: 4003 }),
            "{err}"
        );
        assert!(f.tools.calls_to("setquota").is_empty());

        let report = fix_quota(&f.driver, &f.container, rootfs(16_777_300)).unwrap();
        report.wait();
        assert_eq!(f.id_of(&upper), Some(16_777_300));
    }

    #[test]
    fn test_fix_rootfs_falls_back_to_disk_id() {
        let mut f = fixture();
        let upper = f.dir("upper");
        f.tools.stamp(upper.to_str().unwrap(), 4003);
        f.container.config.quota_id.clear();

        let report = fix_quota(&f.driver, &f.container, rootfs(-1)).unwrap();
        assert_eq!(report.handled, vec![(upper, 4003)]);
        report.wait();
    }

    #[test]
    fn test_fix_rootfs_without_id_or_limit() {
        let mut f = fixture();
        f.container.config.quota_id.clear();
        let err = fix_quota(&f.driver, &f.container, rootfs(-1)).unwrap_err();
        assert!(matches!(err, Error::UnresolvedQuotaID { .. }), "{err}");

        f.container.config.disk_quota.clear();
        f.container
            .config
            .disk_quota
            .insert("/data".into(), "1m".into());
        let err = fix_quota(&f.driver, &f.container, rootfs(-1)).unwrap_err();
        assert!(matches!(err, Error::MissingLimit), "{err}");
    }

    #[test]
    fn test_fix_container_targets_upper_and_matching_mounts() {
        let mut f = fixture();
        let upper = f.dir("upper");
        let data = f.dir("data");
        let logs = f.dir("logs");
        f.container.config.disk_quota.clear();
        f.container
            .config
            .disk_quota
            .insert("/data|/".into(), "1m".into());
        f.container.mounts = vec![volume(&data, "/data", "local"), volume(&logs, "/logs", "local")];

        let request = QuotaRepairRequest {
            container: -1,
            rootfs: 16_777_300,
            ..Default::default()
        };
        let report = fix_quota(&f.driver, &f.container, request).unwrap();

        assert_eq!(report.handled, vec![(upper.clone(), 4002), (data.clone(), 4002)]);
        report.wait();
        assert_eq!(f.id_of(&upper), Some(4002));
        assert_eq!(f.id_of(&data), Some(4002));
        assert_eq!(f.id_of(&logs), None);
    }

    #[test]
    fn test_fix_container_rejects_explicit_and_ambiguous() {
        let mut f = fixture();
        let request = QuotaRepairRequest {
            container: 16_777_300,
            ..Default::default()
        };
        let err = fix_quota(&f.driver, &f.container, request).unwrap_err();
        assert!(matches!(err, Error::NotOriginQuota(16_777_300)), "{err}");

        f.container
            .config
            .disk_quota
            .insert("/data".into(), "2m".into());
        let err = fix_container(&f.driver, &f.container, -1).unwrap_err();
        assert!(matches!(err, Error::AmbiguousDiskQuota(_)), "{err}");

        f.container.config.disk_quota.remove("/data");
        f.container.config.quota_id = "0".into();
        let err = fix_container(&f.driver, &f.container, -1).unwrap_err();
        assert!(matches!(err, Error::MissingConfigQuotaID(_)), "{err}");
    }

    #[test]
    fn test_fix_volumes() {
        let mut f = fixture();
        let data = f.dir("data");
        let file = f.root.path().join("file");
        std::fs::write(&file, b"").unwrap();
        f.container.mounts = vec![
            volume(&data, "/data/", "local"),
            volume(&file, "/file", "local"),
            volume(&f.root.path().join("absent"), "/absent", "local"),
            volume(&f.dir("nfs"), "/nfs", "nfs"),
        ];

        let request = QuotaRepairRequest {
            volumes: 16_777_300,
            ..Default::default()
        };
        let report = fix_quota(&f.driver, &f.container, request).unwrap();

        assert_eq!(report.handled, vec![(data.clone(), 16_777_300)]);
        report.wait();
        assert_eq!(f.id_of(&data), Some(16_777_300));
    }

    #[test]
    fn test_fix_volumes_nothing_to_do() {
        let mut f = fixture();
        f.container.config.disk_quota.insert("/data".into(), "2m".into());
        // no volumes, so the ambiguous patterns don't matter
        let report = fix_volumes(&f.driver, &f.container, -1).unwrap();
        assert!(report.handled.is_empty());

        f.container.mounts = vec![volume(&f.dir("data"), "/data", "local")];
        let err = fix_volumes(&f.driver, &f.container, -1).unwrap_err();
        assert!(matches!(err, Error::AmbiguousDiskQuota(_)), "{err}");
    }

    #[test]
    fn test_set_failures_are_only_logged() {
        let mut f = fixture();
        f.tools = Arc::new(FakeQuotaTools {
            failing: ["setquota"].into_iter().collect(),
            ..Default::default()
        });
        let allocator = Arc::new(QuotaIdAllocator::new(16_777_216, Box::new(NoIDs)));
        f.driver = QuotaDriver::new(f.tools.clone(), allocator, f._mounts.path());

        let report = fix_quota(&f.driver, &f.container, rootfs(-1)).unwrap();
        assert_eq!(report.handled.len(), 1);
        report.wait();
        assert_eq!(f.tools.calls_to("setquota").len(), 1);
    }

    #[test]
    fn test_pattern_must_match_whole_destination() {
        let patterns = parse_disk_quota(&BTreeMap::from([
            ("/data".to_owned(), "1m".to_owned()),
            ("[".to_owned(), "2m".to_owned()),
        ]));
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].matches("/data"));
        assert!(!patterns[0].matches("/data/sub"));
        assert!(!patterns[0].matches("/"));
    }
}
