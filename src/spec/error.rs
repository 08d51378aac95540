use std::path::PathBuf;

use crate::container::{self, ContainerID};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate mount point: {0}")]
    DuplicateMountPoint(String),
    #[error(transparent)]
    Container(#[from] container::Error),
    #[error("run a container with --ipc=container, can not find ipc container: {0}")]
    IpcContainerNotFound(ContainerID),
    #[error("run a container with --ipc=host, but `{0}` is not mounted in host")]
    HostShmMissing(PathBuf),
    #[error("failed to create shm path `{path}` for {id}: {source}")]
    CreateShmPath {
        id: ContainerID,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to mount shm for container {id}: {source}")]
    MountShm {
        id: ContainerID,
        #[source]
        source: nix::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
