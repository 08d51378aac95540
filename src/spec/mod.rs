//! Assembly of the ordered mount table handed to the container launcher.

mod error;
mod mount;
mod setup;

pub use error::{Error, Result};
pub use mount::{Mount, Propagation, RuntimeSpec, UnknownPropagation, default_mounts, sort_mounts};
pub use setup::{
    ContainerLookup, DEFAULT_SHM_SIZE, MountSetup, ShmMounter, TmpfsShmMounter, is_in_mount,
};
