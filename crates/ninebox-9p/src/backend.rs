//! Backend adapter.
//!
//! The dispatcher depends only on this interface: a set of async
//! POSIX-style operations over rooted paths, plus a typed error vocabulary
//! that maps onto the POSIX errno codes the protocol reports in `Rlerror`.
//!
//! Any backend call may suspend. Handlers must re-check the tag registry
//! after every await before touching the reply buffer.

use async_trait::async_trait;
use thiserror::Error;

/// POSIX errno values used on the wire.
pub mod errno {
    /// Operation not permitted.
    pub const EPERM: u32 = 1;
    /// No such file or directory.
    pub const ENOENT: u32 = 2;
    /// Input/output error.
    pub const EIO: u32 = 5;
    /// Bad file descriptor.
    pub const EBADF: u32 = 9;
    /// Resource busy.
    pub const EBUSY: u32 = 11;
    /// File exists.
    pub const EEXIST: u32 = 17;
    /// Not a directory.
    pub const ENOTDIR: u32 = 20;
    /// Is a directory.
    pub const EISDIR: u32 = 21;
    /// Invalid argument.
    pub const EINVAL: u32 = 22;
    /// Directory not empty.
    pub const ENOTEMPTY: u32 = 39;
    /// Too many levels of symbolic links.
    pub const ELOOP: u32 = 40;
}

/// Open flags carried by `Tlopen`/`Tlcreate` (Linux ABI values).
pub mod open_flags {
    /// Read-only.
    pub const RDONLY: u32 = 0o0;
    /// Write-only.
    pub const WRONLY: u32 = 0o1;
    /// Read-write.
    pub const RDWR: u32 = 0o2;
    /// Access-mode mask.
    pub const ACCMODE: u32 = 0o3;
    /// Create if absent.
    pub const CREATE: u32 = 0o100;
    /// Fail if present (with CREATE).
    pub const EXCL: u32 = 0o200;
    /// Truncate on open.
    pub const TRUNC: u32 = 0o1000;
    /// Append writes.
    pub const APPEND: u32 = 0o2000;
}

/// Kind of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Stat result for a node.
#[derive(Debug, Clone)]
pub struct NodeStat {
    /// Node kind.
    pub kind: NodeKind,
    /// Full mode word including the file-type nibble.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Hard-link count.
    pub nlinks: u64,
    /// Size in bytes.
    pub size: u64,
    /// Access time, milliseconds since the epoch.
    pub atime_ms: u64,
    /// Modification time, milliseconds since the epoch.
    pub mtime_ms: u64,
    /// Change time, milliseconds since the epoch.
    pub ctime_ms: u64,
    /// Monotonic version, bumped on every mutation.
    pub version: u32,
    /// Stable node identity (survives rename, shared by hardlinks).
    pub node: u64,
}

/// One directory entry from [`Backend::list`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// Stat of the entry.
    pub stat: NodeStat,
}

/// Filesystem usage figures for `Tstatfs`.
#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Filesystem id.
    pub fsid: u64,
}

impl Default for FsUsage {
    fn default() -> Self {
        Self {
            blocks: 0x0010_0000,
            bfree: 0x0008_0000,
            bavail: 0x0008_0000,
            files: 1_000_000,
            ffree: 500_000,
            fsid: 0,
        }
    }
}

/// Typed backend failures, one variant per POSIX kind the protocol maps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// EPERM.
    #[error("operation not permitted")]
    PermissionDenied,
    /// ENOENT.
    #[error("no such file or directory")]
    NotFound,
    /// EIO.
    #[error("input/output error")]
    Io,
    /// EBADF.
    #[error("bad file descriptor")]
    BadDescriptor,
    /// EBUSY.
    #[error("resource busy")]
    Busy,
    /// EEXIST.
    #[error("file exists")]
    AlreadyExists,
    /// ENOTDIR.
    #[error("not a directory")]
    NotDirectory,
    /// EISDIR.
    #[error("is a directory")]
    IsDirectory,
    /// EINVAL.
    #[error("invalid argument")]
    InvalidArgument,
    /// ENOTEMPTY.
    #[error("directory not empty")]
    NotEmpty,
    /// ELOOP.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    /// Anything the backend cannot express; reported as EIO.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// The errno reported in `Rlerror` for this failure.
    #[must_use]
    pub const fn errno(&self) -> u32 {
        match self {
            Self::PermissionDenied => errno::EPERM,
            Self::NotFound => errno::ENOENT,
            Self::BadDescriptor => errno::EBADF,
            Self::Busy => errno::EBUSY,
            Self::AlreadyExists => errno::EEXIST,
            Self::NotDirectory => errno::ENOTDIR,
            Self::IsDirectory => errno::EISDIR,
            Self::InvalidArgument => errno::EINVAL,
            Self::NotEmpty => errno::ENOTEMPTY,
            Self::SymlinkLoop => errno::ELOOP,
            Self::Io | Self::Unsupported(_) => errno::EIO,
        }
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Pluggable async filesystem backend.
///
/// Paths are absolute strings rooted in the backend namespace; `fd`s are
/// opaque handles scoped to an open/write/close sequence.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stats a path, following symlinks.
    async fn stat(&self, path: &str) -> BackendResult<NodeStat>;

    /// Stats a path without following a final symlink.
    async fn lstat(&self, path: &str) -> BackendResult<NodeStat>;

    /// Reads an entire file.
    async fn read_file(&self, path: &str) -> BackendResult<Vec<u8>>;

    /// Opens a file, returning an fd handle.
    async fn open(&self, path: &str, flags: u32, mode: u32) -> BackendResult<u64>;

    /// Closes an fd handle.
    async fn close(&self, fd: u64) -> BackendResult<()>;

    /// Writes at an offset through an fd, returning bytes written.
    async fn write(&self, fd: u64, data: &[u8], offset: u64) -> BackendResult<u32>;

    /// Reads a symlink target.
    async fn readlink(&self, path: &str) -> BackendResult<String>;

    /// Creates a symlink at `path` pointing to `target`.
    async fn symlink(&self, target: &str, path: &str) -> BackendResult<()>;

    /// Creates a directory.
    async fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()>;

    /// Creates a regular file node (special kinds collapse to files).
    async fn mknod(&self, path: &str, mode: u32) -> BackendResult<()>;

    /// Creates a hard link to `existing` at `new_path`.
    async fn link(&self, existing: &str, new_path: &str) -> BackendResult<()>;

    /// Renames a node; directories move with their subtree.
    async fn rename(&self, old: &str, new: &str) -> BackendResult<()>;

    /// Removes a file or symlink.
    async fn unlink(&self, path: &str) -> BackendResult<()>;

    /// Removes an empty directory.
    async fn rmdir(&self, path: &str) -> BackendResult<()>;

    /// Changes permission bits.
    async fn chmod(&self, path: &str, mode: u32) -> BackendResult<()>;

    /// Changes ownership.
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> BackendResult<()>;

    /// Sets access and modification times (milliseconds since the epoch).
    async fn utimes(&self, path: &str, atime_ms: u64, mtime_ms: u64) -> BackendResult<()>;

    /// Truncates or extends a file.
    async fn truncate(&self, path: &str, size: u64) -> BackendResult<()>;

    /// Flushes a node to stable storage. In-memory backends no-op.
    async fn fsync(&self, path: &str) -> BackendResult<()>;

    /// Lists a directory in backend order (no `.`/`..` entries).
    async fn list(&self, path: &str) -> BackendResult<Vec<DirEntry>>;

    /// Filesystem usage for `Tstatfs`. The default is static.
    async fn statfs(&self) -> BackendResult<FsUsage> {
        Ok(FsUsage::default())
    }
}
