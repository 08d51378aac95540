use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fsutil;

/// Mount propagation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Private,
    RPrivate,
    Shared,
    RShared,
    Slave,
    RSlave,
}

impl Propagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Private => "private",
            Propagation::RPrivate => "rprivate",
            Propagation::Shared => "shared",
            Propagation::RShared => "rshared",
            Propagation::Slave => "slave",
            Propagation::RSlave => "rslave",
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Propagation::Shared | Propagation::RShared)
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, Propagation::Slave | Propagation::RSlave)
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown mount propagation `{0}`")]
pub struct UnknownPropagation(String);

impl FromStr for Propagation {
    type Err = UnknownPropagation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Propagation::Private),
            "rprivate" => Ok(Propagation::RPrivate),
            "shared" => Ok(Propagation::Shared),
            "rshared" => Ok(Propagation::RShared),
            "slave" => Ok(Propagation::Slave),
            "rslave" => Ok(Propagation::RSlave),
            other => Err(UnknownPropagation(other.to_owned())),
        }
    }
}

/// One entry of the mount table handed to the container launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Absolute path inside the container.
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    pub fn new(source: &str, destination: &str, mount_type: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_owned(),
            mount_type: mount_type.to_owned(),
            source: source.to_owned(),
            options: options.iter().map(|o| (*o).to_owned()).collect(),
        }
    }

    /// A recursive private bind mount of `source`.
    pub fn bind(source: &str, destination: &str) -> Self {
        Self::new(source, destination, "bind", &["rbind", "rprivate"])
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    pub(crate) fn clear_readonly(&mut self) {
        self.options.retain(|o| o != "ro");
    }
}

/// The parts of a runtime spec the mount setup reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub mounts: Vec<Mount>,
    /// Whether the root filesystem is mounted read-only.
    pub root_readonly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_propagation: Option<Propagation>,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            mounts: default_mounts(),
            root_readonly: false,
            rootfs_propagation: None,
        }
    }
}

/// The standard set of kernel filesystem mounts every container gets.
///
/// `/dev/shm` is not part of it; it is set up per container from the IPC mode.
pub fn default_mounts() -> Vec<Mount> {
    vec![
        Mount::new("proc", "/proc", "proc", &["nosuid", "noexec", "nodev"]),
        Mount::new(
            "tmpfs",
            "/dev",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        Mount::new(
            "devpts",
            "/dev/pts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        Mount::new("mqueue", "/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        Mount::new("sysfs", "/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        Mount::new(
            "cgroup",
            "/sys/fs/cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ]
}

/// Stable-sorts mounts by cleaned destination so `/etc` is mounted before
/// `/etc/resolv.conf` and doesn't shadow it.
pub fn sort_mounts(mounts: &mut [Mount]) {
    mounts.sort_by_cached_key(|m| fsutil::clean_path(&m.destination));
}
