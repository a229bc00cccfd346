use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use remote_error::Result;

/// The kind of a filesystem entry
///
/// Symlinks and other non-regular entries are treated as atomic leaves:
/// they are never traversed, only compared as a whole.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// A snapshot of the metadata of one filesystem entry
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct FileStat {
    /// The kind of the entry
    pub kind: EntryKind,
    /// Size in bytes (0 for directories on some backends)
    pub size: u64,
    /// Last modification time
    pub mtime: SystemTime,
    /// Permission bits (the low 12 bits of the POSIX mode)
    pub mode: u32,
    /// ID of the owning user
    pub uid: u32,
    /// ID of the owning group
    pub gid: u32,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// The live handle to a remote filesystem
///
/// This is the single seam between the session layer and a concrete
/// transfer backend: callers depend only on this interface, never on a
/// concrete implementation. A channel is owned exclusively by its
/// transport handle and is replaced wholesale after a connection loss,
/// never partially repaired, so implementations must not require any
/// state to survive across instances.
///
/// All operations are blocking and single-shot. File content moves as
/// whole files ([`Channel::read_file`] / [`Channel::write_file`]): open
/// handles cannot be carried across a reconnect, and a retried transfer
/// restarts from offset zero anyway.
pub trait Channel {
    /// Stat an entry, following symlinks.
    fn stat(&mut self, path: &Path) -> Result<FileStat>;

    /// Stat an entry without following symlinks.
    fn lstat(&mut self, path: &Path) -> Result<FileStat>;

    /// List the entries of a directory.
    ///
    /// Returns the full path of each child together with its lstat-style
    /// metadata. The order is unspecified.
    fn list(&mut self, path: &Path) -> Result<Vec<(PathBuf, FileStat)>>;

    /// Create a directory with the given permission bits.
    ///
    /// Fails with `AlreadyExists` if the path exists and with `NotFound`
    /// if the parent directory is missing; idempotent and recursive
    /// creation live above this layer.
    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()>;

    /// Remove an empty directory.
    fn rmdir(&mut self, path: &Path) -> Result<()>;

    /// Remove a file or symlink.
    fn remove(&mut self, path: &Path) -> Result<()>;

    /// Rename an entry, overwriting the destination if it exists
    /// (POSIX rename semantics).
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()>;

    /// Read the target of a symlink.
    fn readlink(&mut self, path: &Path) -> Result<PathBuf>;

    /// Create a symlink at `link` pointing to `target`.
    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()>;

    /// Change the permission bits of an entry.
    fn chmod(&mut self, path: &Path, mode: u32) -> Result<()>;

    /// Change the ownership of an entry.
    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Set the modification time of an entry.
    fn set_mtime(&mut self, path: &Path, mtime: SystemTime) -> Result<()>;

    /// Read the whole content of a file.
    fn read_file(&mut self, path: &Path) -> Result<Vec<u8>>;

    /// Write the whole content of a file, creating or truncating it.
    ///
    /// Not atomic on its own; atomicity comes from writing to a temporary
    /// path and renaming over the destination.
    fn write_file(&mut self, path: &Path, data: &[u8]) -> Result<()>;
}
