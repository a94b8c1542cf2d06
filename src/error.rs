use core::fmt;

/// Enum representing errors that can occur during a filesystem operation.
///
/// Every failure the facade can surface maps to one of these kinds. The
/// system-call layer flattens them to the conventional `false`/`-1` returns;
/// library callers get the kind itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A path component does not exist.
    PathNotFound,
    /// A name or path exceeds `NAME_MAX` / `PATH_MAX`.
    NameTooLong,
    /// The name already exists in the target directory.
    NameExists,
    /// The free-map has no sectors left.
    NoSpace,
    /// Removal target directory still has entries besides `.` and `..`.
    DirNotEmpty,
    /// Removal target directory is the working directory of a live session.
    DirBusy,
    /// Empty name, empty path, or an operation applied to the wrong
    /// descriptor kind.
    InvalidArg,
    /// Writes are currently denied on this inode.
    DeniedWrite,
    /// The block device failed a sector transfer.
    Io,
    /// An on-disk structure failed a sanity check.
    Corrupted(&'static str),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::PathNotFound => write!(f, "path not found"),
            FsError::NameTooLong => write!(f, "name too long"),
            FsError::NameExists => write!(f, "name exists"),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::DirNotEmpty => write!(f, "directory not empty"),
            FsError::DirBusy => write!(f, "directory busy"),
            FsError::InvalidArg => write!(f, "invalid argument"),
            FsError::DeniedWrite => write!(f, "writes denied"),
            FsError::Io => write!(f, "device i/o error"),
            FsError::Corrupted(what) => write!(f, "corrupted filesystem: {}", what),
        }
    }
}

impl std::error::Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;
