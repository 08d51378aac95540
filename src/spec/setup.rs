use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

use crate::container::{Container, ContainerID, IpcMode, MountPoint};
use crate::fsutil;

use super::mount::{Mount, Propagation, RuntimeSpec, sort_mounts};
use super::{Error, Result};

/// Size of `/dev/shm` when the container doesn't ask for one: 64MiB.
pub const DEFAULT_SHM_SIZE: u64 = 64 * 1024 * 1024;

const SHM_DEST: &str = "/dev/shm";

/// Looks up other containers, e.g. the owner of a shared IPC namespace.
pub trait ContainerLookup {
    fn get_container(&self, id: &ContainerID) -> Option<Container>;
}

impl ContainerLookup for HashMap<ContainerID, Container> {
    fn get_container(&self, id: &ContainerID) -> Option<Container> {
        self.get(id).cloned()
    }
}

/// Mounts the tmpfs backing a container's private `/dev/shm`.
pub trait ShmMounter {
    fn mount_shm(&self, path: &Path, size: u64) -> nix::Result<()>;
}

/// [`ShmMounter`] doing a real `mount(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmpfsShmMounter;

impl ShmMounter for TmpfsShmMounter {
    fn mount_shm(&self, path: &Path, size: u64) -> nix::Result<()> {
        let data = format!("mode=1777,size={size}");
        nix::mount::mount(
            Some("shm"),
            path,
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(data.as_str()),
        )
    }
}

/// Returns true if the container has a user mount at `dest`, compared after cleaning.
pub fn is_in_mount(container: &Container, dest: &str) -> bool {
    container.mount_at(dest).is_some()
}

/// Builds the mount table of a container's runtime spec.
pub struct MountSetup<'a> {
    containers: &'a dyn ContainerLookup,
    shm: &'a dyn ShmMounter,
    default_shm_size: u64,
    host_shm: PathBuf,
}

impl<'a> MountSetup<'a> {
    pub fn new(containers: &'a dyn ContainerLookup, shm: &'a dyn ShmMounter) -> Self {
        Self {
            containers,
            shm,
            default_shm_size: DEFAULT_SHM_SIZE,
            host_shm: PathBuf::from(SHM_DEST),
        }
    }

    pub fn with_default_shm_size(mut self, size: u64) -> Self {
        self.default_shm_size = size;
        self
    }

    /// Overrides where the host's `/dev/shm` is looked up for `--ipc=host`.
    pub fn with_host_shm(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_shm = path.into();
        self
    }

    fn shm_size(&self, container: &Container) -> u64 {
        container
            .host_config
            .shm_size
            .filter(|size| *size != 0)
            .unwrap_or(self.default_shm_size)
    }

    /// Replaces `spec.mounts` with the container's complete, ordered mount table.
    ///
    /// Network file mounts requested by the user (`/etc/hostname`, `/etc/hosts`,
    /// `/etc/resolv.conf`) and the shm path are recorded on `container`.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateMountPoint`] if two user mounts share a destination.
    /// - Errors from resolving and mounting the shm path.
    pub fn setup_mounts(&self, container: &mut Container, spec: &mut RuntimeSpec) -> Result<()> {
        let mut mounts: Vec<Mount> = std::mem::take(&mut spec.mounts)
            .into_iter()
            .filter(|m| {
                !container
                    .mounts
                    .iter()
                    .any(|cm| cm.destination == m.destination)
            })
            .collect();

        if !is_in_mount(container, SHM_DEST) {
            log::info!("setup {} shm path", container.id);
            self.setup_ipc_shm_path(container)?;

            match &container.shm_path {
                None => {
                    log::warn!(
                        "container {} shm path is empty, it was an old container or a kata container",
                        container.id
                    );
                    let size = format!("size={}", self.shm_size(container));
                    mounts.push(Mount::new(
                        "shm",
                        SHM_DEST,
                        "tmpfs",
                        &["nosuid", "noexec", "nodev", "mode=1777", size.as_str()],
                    ));
                }
                Some(path) => mounts.push(Mount::bind(&path.to_string_lossy(), SHM_DEST)),
            }
        }

        merge_container_mounts(&mut mounts, container, spec)?;

        if container.host_config.privileged {
            for m in &mut mounts {
                if m.destination == "/sys" && !spec.root_readonly {
                    m.clear_readonly();
                }
                if m.mount_type == "cgroup" {
                    m.clear_readonly();
                }
            }
        }

        sort_mounts(&mut mounts);
        spec.mounts = mounts;
        Ok(())
    }

    fn setup_ipc_shm_path(&self, container: &mut Container) -> Result<()> {
        match container.host_config.ipc()? {
            IpcMode::Container(owner) => {
                let owner = self
                    .containers
                    .get_container(&owner)
                    .ok_or(Error::IpcContainerNotFound(owner))?;
                container.shm_path = owner.shm_path;
            }
            IpcMode::Host => {
                if std::fs::metadata(&self.host_shm).is_err() {
                    return Err(Error::HostShmMissing(self.host_shm.clone()));
                }
                container.shm_path = Some(self.host_shm.clone());
            }
            IpcMode::Private => {
                // set by the start path; empty only for old containers
                let Some(path) = &container.shm_path else {
                    return Ok(());
                };

                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(path)
                    .map_err(|source| Error::CreateShmPath {
                        id: container.id.clone(),
                        path: path.clone(),
                        source,
                    })?;

                self.shm
                    .mount_shm(path, self.shm_size(container))
                    .map_err(|source| Error::MountShm {
                        id: container.id.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

/// Records a user mount of a network file on the container instead of mounting it.
fn capture_network_mount(mp: &MountPoint, container: &mut Container) -> bool {
    let slot = match mp.destination.as_str() {
        "/etc/hostname" => &mut container.hostname_path,
        "/etc/hosts" => &mut container.hosts_path,
        "/etc/resolv.conf" => &mut container.resolv_conf_path,
        _ => return false,
    };
    *slot = Some(PathBuf::from(&mp.source)).filter(|p| !p.as_os_str().is_empty());
    true
}

fn merge_container_mounts(
    mounts: &mut Vec<Mount>,
    container: &mut Container,
    spec: &mut RuntimeSpec,
) -> Result<()> {
    for mp in container.mounts.clone() {
        if capture_network_mount(&mp, container) {
            continue;
        }

        if mounts.iter().any(|m| m.destination == mp.destination) {
            return Err(Error::DuplicateMountPoint(mp.destination));
        }

        let rootfs = spec.rootfs_propagation;
        match mp.propagation {
            Some(pg) if pg.is_shared() => {
                if !rootfs.is_some_and(|r| r.is_shared()) {
                    spec.rootfs_propagation = Some(Propagation::Shared);
                }
            }
            Some(pg) if pg.is_slave() => {
                if !rootfs.is_some_and(|r| r.is_shared() || r.is_slave()) {
                    spec.rootfs_propagation = Some(Propagation::RSlave);
                }
            }
            _ => {}
        }

        let mut options = Vec::new();
        let mount_type = match mp.mount_type.as_str() {
            fs @ ("ext4" | "ext3" | "xfs") => fs.to_owned(),
            _ => {
                options.push("rbind".to_owned());
                "bind".to_owned()
            }
        };
        if !mp.rw {
            options.push("ro".to_owned());
        }
        options.push(
            mp.propagation
                .unwrap_or(Propagation::RPrivate)
                .as_str()
                .to_owned(),
        );

        mounts.push(Mount {
            destination: mp.destination,
            mount_type,
            source: mp.source,
            options,
        });
    }

    if !container.config.disable_network_files {
        mounts.extend(network_mounts(container));
    }

    Ok(())
}

fn network_mounts(container: &Container) -> Vec<Mount> {
    let binds = [
        ("hostname path", &container.hostname_path, "/etc/hostname"),
        ("hosts path", &container.hosts_path, "/etc/hosts"),
        ("resolv.conf path", &container.resolv_conf_path, "/etc/resolv.conf"),
    ];

    binds
        .into_iter()
        .filter_map(|(name, source, dest)| {
            let source = source.as_ref()?;
            match std::fs::metadata(source) {
                Ok(_) => Some(Mount::bind(&source.to_string_lossy(), dest)),
                Err(err) => {
                    log::warn!(
                        "{} set to `{}`, but stat error: {}, skip it",
                        name,
                        source.display(),
                        err
                    );
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMounter {
        mounted: Mutex<Vec<(PathBuf, u64)>>,
    }

    impl ShmMounter for RecordingMounter {
        fn mount_shm(&self, path: &Path, size: u64) -> nix::Result<()> {
            self.mounted.lock().unwrap().push((path.to_path_buf(), size));
            Ok(())
        }
    }

    fn container() -> Container {
        Container::new(ContainerID::new("c1").unwrap())
    }

    fn user_mount(source: &str, dest: &str) -> MountPoint {
        MountPoint {
            source: source.into(),
            destination: dest.into(),
            rw: true,
            ..Default::default()
        }
    }

    fn setup(c: &mut Container, spec: &mut RuntimeSpec) -> Result<()> {
        let lookup: HashMap<ContainerID, Container> = HashMap::new();
        let mounter = RecordingMounter::default();
        MountSetup::new(&lookup, &mounter).setup_mounts(c, spec)
    }

    fn find<'a>(spec: &'a RuntimeSpec, dest: &str) -> Vec<&'a Mount> {
        spec.mounts.iter().filter(|m| m.destination == dest).collect()
    }

    #[test]
    fn test_defaults_plus_tmpfs_shm() {
        let mut c = container();
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        let shm = find(&spec, "/dev/shm");
        assert_eq!(shm.len(), 1);
        assert_eq!(shm[0].mount_type, "tmpfs");
        assert_eq!(
            shm[0].options,
            vec!["nosuid", "noexec", "nodev", "mode=1777", "size=67108864"]
        );
        assert_eq!(spec.mounts.len(), crate::spec::default_mounts().len() + 1);
    }

    #[test]
    fn test_shm_size_from_host_config() {
        let mut c = container();
        c.host_config.shm_size = Some(1 << 20);
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        assert!(find(&spec, "/dev/shm")[0].has_option("size=1048576"));
    }

    #[test]
    fn test_user_mount_overrides_default() {
        let mut c = container();
        c.mounts.push(user_mount("/host/proc", "/proc"));
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        let proc = find(&spec, "/proc");
        assert_eq!(proc.len(), 1);
        assert_eq!(proc[0].source, "/host/proc");
        assert_eq!(proc[0].options, vec!["rbind", "rprivate"]);
    }

    #[test]
    fn test_user_shm_mount_skips_shm_setup() {
        let mut c = container();
        c.mounts.push(user_mount("/host/shm", "/dev/shm/"));
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        let shm: Vec<_> = spec
            .mounts
            .iter()
            .filter(|m| fsutil::clean_path(&m.destination) == SHM_DEST)
            .collect();
        assert_eq!(shm.len(), 1);
        assert_eq!(shm[0].source, "/host/shm");
    }

    #[test]
    fn test_private_shm_is_created_and_mounted() {
        let tmp = tempfile::tempdir().unwrap();
        let shm_path = tmp.path().join("containers/c1/shm");
        let mut c = container();
        c.shm_path = Some(shm_path.clone());
        c.host_config.shm_size = Some(4096);

        let lookup: HashMap<ContainerID, Container> = HashMap::new();
        let mounter = RecordingMounter::default();
        let mut spec = RuntimeSpec::default();
        MountSetup::new(&lookup, &mounter)
            .setup_mounts(&mut c, &mut spec)
            .unwrap();

        assert!(shm_path.is_dir());
        assert_eq!(*mounter.mounted.lock().unwrap(), vec![(shm_path.clone(), 4096)]);
        let shm = find(&spec, "/dev/shm");
        assert_eq!(shm[0].source, shm_path.to_string_lossy());
        assert_eq!(shm[0].options, vec!["rbind", "rprivate"]);
    }

    #[test]
    fn test_host_ipc() {
        let tmp = tempfile::tempdir().unwrap();
        let lookup: HashMap<ContainerID, Container> = HashMap::new();
        let mounter = RecordingMounter::default();

        let mut c = container();
        c.host_config.ipc_mode = "host".into();
        let mut spec = RuntimeSpec::default();
        MountSetup::new(&lookup, &mounter)
            .with_host_shm(tmp.path())
            .setup_mounts(&mut c, &mut spec)
            .unwrap();
        assert_eq!(c.shm_path.as_deref(), Some(tmp.path()));

        let mut c = container();
        c.host_config.ipc_mode = "host".into();
        let err = MountSetup::new(&lookup, &mounter)
            .with_host_shm(tmp.path().join("missing"))
            .setup_mounts(&mut c, &mut RuntimeSpec::default())
            .unwrap_err();
        assert!(matches!(err, Error::HostShmMissing(_)), "{err}");
        assert!(mounter.mounted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_container_ipc() {
        let owner_id = ContainerID::new("c0").unwrap();
        let mut owner = Container::new(owner_id.clone());
        owner.shm_path = Some(PathBuf::from("/var/lib/pouch/containers/c0/shm"));
        let lookup = HashMap::from([(owner_id, owner)]);
        let mounter = RecordingMounter::default();

        let mut c = container();
        c.host_config.ipc_mode = "container:c0".into();
        let mut spec = RuntimeSpec::default();
        MountSetup::new(&lookup, &mounter)
            .setup_mounts(&mut c, &mut spec)
            .unwrap();
        assert_eq!(find(&spec, "/dev/shm")[0].source, "/var/lib/pouch/containers/c0/shm");

        let mut c = container();
        c.host_config.ipc_mode = "container:gone".into();
        let err = MountSetup::new(&lookup, &mounter)
            .setup_mounts(&mut c, &mut RuntimeSpec::default())
            .unwrap_err();
        assert!(matches!(err, Error::IpcContainerNotFound(_)), "{err}");
    }

    #[test]
    fn test_duplicate_user_mounts() {
        let mut c = container();
        c.mounts.push(user_mount("/a", "/data"));
        c.mounts.push(user_mount("/b", "/data"));
        let err = setup(&mut c, &mut RuntimeSpec::default()).unwrap_err();
        assert!(matches!(err, Error::DuplicateMountPoint(d) if d == "/data"));
    }

    #[test]
    fn test_user_mount_options() {
        let mut c = container();
        c.mounts.push(MountPoint {
            source: "/dev/sdc1".into(),
            destination: "/disk".into(),
            mount_type: "xfs".into(),
            rw: false,
            ..Default::default()
        });
        c.mounts.push(MountPoint {
            propagation: Some(Propagation::Slave),
            ..user_mount("/host", "/host")
        });
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        let disk = find(&spec, "/disk")[0];
        assert_eq!(disk.mount_type, "xfs");
        assert_eq!(disk.options, vec!["ro", "rprivate"]);

        let host = find(&spec, "/host")[0];
        assert_eq!(host.mount_type, "bind");
        assert_eq!(host.options, vec!["rbind", "slave"]);
        assert_eq!(spec.rootfs_propagation, Some(Propagation::RSlave));
    }

    #[test]
    fn test_rootfs_propagation_is_only_raised() {
        let mut c = container();
        c.mounts.push(MountPoint {
            propagation: Some(Propagation::RShared),
            ..user_mount("/a", "/a")
        });
        c.mounts.push(MountPoint {
            propagation: Some(Propagation::RSlave),
            ..user_mount("/b", "/b")
        });
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();
        assert_eq!(spec.rootfs_propagation, Some(Propagation::Shared));
    }

    #[test]
    fn test_network_files() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = tmp.path().join("hosts");
        std::fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();

        let mut c = container();
        c.hostname_path = Some(tmp.path().join("missing-hostname"));
        c.mounts
            .push(user_mount(&hosts.to_string_lossy(), "/etc/hosts"));
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        assert_eq!(c.hosts_path.as_deref(), Some(hosts.as_path()));
        let etc_hosts = find(&spec, "/etc/hosts");
        assert_eq!(etc_hosts.len(), 1);
        assert_eq!(etc_hosts[0].options, vec!["rbind", "rprivate"]);
        assert!(find(&spec, "/etc/hostname").is_empty());

        let mut c = container();
        c.config.disable_network_files = true;
        c.hosts_path = Some(hosts);
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();
        assert!(find(&spec, "/etc/hosts").is_empty());
    }

    #[test]
    fn test_privileged_clears_readonly() {
        let mut c = container();
        c.host_config.privileged = true;
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();
        assert!(!find(&spec, "/sys")[0].has_option("ro"));
        assert!(!find(&spec, "/sys/fs/cgroup")[0].has_option("ro"));

        let mut spec = RuntimeSpec {
            root_readonly: true,
            ..Default::default()
        };
        setup(&mut c, &mut spec).unwrap();
        assert!(find(&spec, "/sys")[0].has_option("ro"));
        assert!(!find(&spec, "/sys/fs/cgroup")[0].has_option("ro"));
    }

    #[test]
    fn test_parents_precede_children() {
        let mut c = container();
        for (src, dest) in [
            ("/a", "/etc/pki/tls"),
            ("/b", "/etc-extra"),
            ("/c", "/etc"),
            ("/d", "/dev/fuse"),
            ("/e", "/etc/pki"),
        ] {
            c.mounts.push(user_mount(src, dest));
        }
        let mut spec = RuntimeSpec::default();
        setup(&mut c, &mut spec).unwrap();

        let dests: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| fsutil::clean_path(&m.destination))
            .collect();
        for (i, parent) in dests.iter().enumerate() {
            for child in &dests[..i] {
                assert!(
                    !child.starts_with(&format!("{parent}/")),
                    "{child} mounted before its parent {parent}"
                );
            }
        }
    }
}
