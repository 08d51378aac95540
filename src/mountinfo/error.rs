use std::path::PathBuf;

use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    FileOpen(#[from] fsutil::FileOpenError),
    #[error("failed to read line for file `{path}`: {source}")]
    ReadLine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to get device id for `{path}`: {source}")]
    DeviceID {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mount point not found for the device on which `{path}` lies")]
    MissingMountPoint { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, Error>;
