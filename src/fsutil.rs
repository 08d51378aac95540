use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

/// Error that occurs when opening a file fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to open file `{path}`: {source}")]
pub struct FileOpenError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Opens a file at the given path and wraps it in a [`BufReader`].
///
/// # Errors
///
/// Returns a [`FileOpenError`] if the file cannot be opened.
///
/// # Example
/// ```no_run
/// # use creo_runtime::fsutil;
/// let reader = fsutil::open_file_reader("/proc/mounts")?;
/// # Ok::<(), fsutil::FileOpenError>(())
/// ```
pub fn open_file_reader(path: impl AsRef<Path>) -> Result<BufReader<File>, FileOpenError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| FileOpenError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Returns the device id of the filesystem the given path lives on.
pub fn device_id(path: impl AsRef<Path>) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;

    Ok(std::fs::metadata(path)?.dev())
}

/// Returns true if the path is a plain file or directory.
///
/// Symlinks, sockets, fifos and device nodes are not regular in the sense of
/// project-quota attributes and cannot carry a project id.
pub fn is_regular_file(path: impl AsRef<Path>) -> io::Result<bool> {
    let file_type = std::fs::symlink_metadata(path)?.file_type();
    Ok(file_type.is_file() || file_type.is_dir())
}

/// Lexically normalizes a path: collapses repeated separators, drops `.` and
/// resolves `..` against preceding components. The filesystem is not touched.
///
/// An empty input yields `.`.
///
/// ```
/// # use creo_runtime::fsutil::clean_path;
/// assert_eq!(clean_path("/etc//./resolv.conf"), "/etc/resolv.conf");
/// assert_eq!(clean_path("/var/lib/../run/"), "/var/run");
/// ```
pub fn clean_path(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let absolute = path.has_root();
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..".as_ref());
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    let joined = parts
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}
