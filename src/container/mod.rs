use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

mod error;
mod lock;
mod model;
mod state;

pub use error::{Error, Result};
pub use lock::{ContainerLockGuard, ContainerLocks};
pub use model::{
    Config, Container, DISK_QUOTA_LABEL, HostConfig, IpcMode, MountPoint, SnapshotterData,
    UPPER_DIR_KEY,
};
pub use state::{ContainerState, StateError, Status, StatusFlags};

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// A validated container identifier.
///
/// # Examples
///
/// ```
/// # use creo_runtime::container::{ContainerID, Error};
/// let raw_id = "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd";
/// let container_id = ContainerID::new(raw_id).unwrap();
/// assert_eq!(container_id.as_ref(), "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is empty or its length
    /// exceeds [`CONTAINER_ID_MAX_LEN`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use creo_runtime::container::{ContainerID, Error};
    /// let valid = "abcdef012345abcdef012345abcdef012345abcdef012345abcdef012345abcd";
    /// assert!(ContainerID::new(valid).is_ok());
    /// assert!(ContainerID::new("").is_err());
    /// ```
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty() || src.len() > CONTAINER_ID_MAX_LEN {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContainerID {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerID> for String {
    fn from(value: ContainerID) -> Self {
        value.0.as_ref().to_owned()
    }
}
