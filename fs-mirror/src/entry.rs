use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use remote_channel::{EntryKind, FileStat};

/// An immutable snapshot of one entry of a scanned tree.
///
/// Produced by the tree walks, keyed by path relative to the scan root,
/// and discarded after diffing.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct FileEntry {
    /// Path relative to the scan root
    pub path: PathBuf,
    /// The kind of the entry
    pub kind: EntryKind,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: SystemTime,
    /// Permission bits
    pub mode: u32,
    /// Target of the entry, for symlinks
    pub link_target: Option<PathBuf>,
}

impl FileEntry {
    pub fn from_stat(path: PathBuf, stat: &FileStat) -> Self {
        FileEntry {
            path,
            kind: stat.kind,
            size: stat.size,
            mtime: stat.mtime,
            mode: stat.mode,
            link_target: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}
