//! The persisted container record, as read from a container's `config.v2.json`-style
//! metadata file.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::spec::Propagation;

use super::state::ContainerState;
use super::{ContainerID, Error, Result};

/// Label carrying the disk quota the container was created with.
pub const DISK_QUOTA_LABEL: &str = "DiskQuota";

/// Key of the writable layer in [`SnapshotterData::data`].
pub const UPPER_DIR_KEY: &str = "UpperDir";

/// Deserializes an optional value, treating a missing field, `null` and `""` alike.
pub(crate) fn empty_as_none<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    #[serde(rename = "ID")]
    pub id: ContainerID,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub host_config: HostConfig,
    /// User mounts in the order they were requested.
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
    /// Nominal source of the root filesystem.
    #[serde(rename = "BaseFS", default, deserialize_with = "empty_as_none")]
    pub base_fs: Option<PathBuf>,
    #[serde(default)]
    pub snapshotter: SnapshotterData,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub shm_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub hostname_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub hosts_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub resolv_conf_path: Option<PathBuf>,
}

impl Container {
    /// Creates a container record in the `Created` state.
    pub fn new(id: ContainerID) -> Self {
        Self {
            id,
            state: ContainerState::default(),
            config: Config::default(),
            host_config: HostConfig::default(),
            mounts: Vec::new(),
            base_fs: None,
            snapshotter: SnapshotterData::default(),
            shm_path: None,
            hostname_path: None,
            hosts_path: None,
            resolv_conf_path: None,
        }
    }

    /// Returns the user mount whose cleaned destination equals `dest`, if any.
    pub fn mount_at(&self, dest: &str) -> Option<&MountPoint> {
        let dest = crate::fsutil::clean_path(dest);
        self.mounts
            .iter()
            .find(|m| crate::fsutil::clean_path(&m.destination) == dest)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Project quota id recorded at creation, as a decimal string.
    #[serde(rename = "QuotaID")]
    pub quota_id: String,
    /// Destination pattern (regular expression) to quota size.
    pub disk_quota: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub disable_network_files: bool,
}

impl Config {
    /// Parses [`Config::quota_id`], `0` if unset or malformed.
    pub fn label_quota_id(&self) -> u32 {
        self.quota_id.trim().parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    pub privileged: bool,
    pub ipc_mode: String,
    /// Size of `/dev/shm` in bytes, the daemon default when unset or zero.
    pub shm_size: Option<u64>,
}

/// How a container gets its IPC namespace and `/dev/shm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcMode {
    Private,
    Host,
    /// Shares the namespace of another container.
    Container(ContainerID),
}

impl HostConfig {
    /// Parses [`HostConfig::ipc_mode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIpcMode`] for `container:` without a valid id.
    pub fn ipc(&self) -> Result<IpcMode> {
        let mode = self.ipc_mode.as_str();
        if mode == "host" {
            return Ok(IpcMode::Host);
        }
        match mode.strip_prefix("container:") {
            Some(id) => ContainerID::new(id)
                .map(IpcMode::Container)
                .map_err(|_| Error::InvalidIpcMode(mode.to_owned())),
            None => Ok(IpcMode::Private),
        }
    }
}

/// A user requested mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MountPoint {
    pub source: String,
    pub destination: String,
    /// Volume driver, `local` for host directories managed by the daemon.
    pub driver: String,
    #[serde(rename = "Type")]
    pub mount_type: String,
    #[serde(rename = "RW")]
    pub rw: bool,
    #[serde(deserialize_with = "empty_as_none")]
    pub propagation: Option<Propagation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SnapshotterData {
    pub name: String,
    pub data: HashMap<String, String>,
}

impl SnapshotterData {
    /// The writable layer of the root filesystem, if the snapshotter reported one.
    pub fn upper_dir(&self) -> Option<&Path> {
        self.data
            .get(UPPER_DIR_KEY)
            .map(String::as_str)
            .filter(|dir| !dir.is_empty())
            .map(Path::new)
    }
}
