use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use filetime::FileTime;

use remote_error::{RemoteError, Result};

use crate::channel::{Channel, EntryKind, FileStat};

/// A [`Channel`] over the local filesystem.
///
/// The local counterpart of the SSH-backed channel: the same operation
/// set, routed to `std::fs`. Useful for mirroring trees between two local
/// roots, and as the channel implementation driven by tests.
#[derive(Default, Debug)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        LocalChannel
    }
}

fn stat_of(metadata: &fs::Metadata, path: &Path) -> Result<FileStat> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Other
    };

    let mtime = metadata
        .modified()
        .map_err(|err| RemoteError::from_io(err, path))?;

    Ok(FileStat {
        kind,
        size: metadata.len(),
        mtime,
        mode: mode_of(metadata),
        uid: uid_of(metadata),
        gid: gid_of(metadata),
    })
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn uid_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.uid()
}

#[cfg(not(unix))]
fn uid_of(_metadata: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn gid_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.gid()
}

#[cfg(not(unix))]
fn gid_of(_metadata: &fs::Metadata) -> u32 {
    0
}

impl Channel for LocalChannel {
    fn stat(&mut self, path: &Path) -> Result<FileStat> {
        let metadata = fs::metadata(path)
            .map_err(|err| RemoteError::from_io(err, path))?;
        stat_of(&metadata, path)
    }

    fn lstat(&mut self, path: &Path) -> Result<FileStat> {
        let metadata = fs::symlink_metadata(path)
            .map_err(|err| RemoteError::from_io(err, path))?;
        stat_of(&metadata, path)
    }

    fn list(&mut self, path: &Path) -> Result<Vec<(PathBuf, FileStat)>> {
        let mut entries = vec![];
        let dir = fs::read_dir(path)
            .map_err(|err| RemoteError::from_io(err, path))?;
        for entry in dir {
            let entry =
                entry.map_err(|err| RemoteError::from_io(err, path))?;
            let entry_path = entry.path();
            let metadata = fs::symlink_metadata(&entry_path)
                .map_err(|err| RemoteError::from_io(err, &entry_path))?;
            entries.push((entry_path.clone(), stat_of(&metadata, &entry_path)?));
        }
        Ok(entries)
    }

    #[cfg(unix)]
    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .mode(mode)
            .create(path)
            .map_err(|err| RemoteError::from_io(err, path))
    }

    #[cfg(not(unix))]
    fn mkdir(&mut self, path: &Path, _mode: u32) -> Result<()> {
        fs::create_dir(path).map_err(|err| RemoteError::from_io(err, path))
    }

    fn rmdir(&mut self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|err| RemoteError::from_io(err, path))
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|err| RemoteError::from_io(err, path))
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|err| RemoteError::from_io(err, from))
    }

    fn readlink(&mut self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).map_err(|err| RemoteError::from_io(err, path))
    }

    #[cfg(unix)]
    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link)
            .map_err(|err| RemoteError::from_io(err, link))
    }

    #[cfg(not(unix))]
    fn symlink(&mut self, _target: &Path, link: &Path) -> Result<()> {
        Err(RemoteError::Conflict(format!(
            "symlinks are not supported on this platform: {}",
            link.display()
        )))
    }

    #[cfg(unix)]
    fn chmod(&mut self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|err| RemoteError::from_io(err, path))
    }

    #[cfg(not(unix))]
    fn chmod(&mut self, _path: &Path, _mode: u32) -> Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
            .map_err(|err| RemoteError::from_io(err, path))
    }

    #[cfg(not(unix))]
    fn chown(&mut self, _path: &Path, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }

    fn set_mtime(&mut self, path: &Path, mtime: SystemTime) -> Result<()> {
        filetime::set_file_mtime(path, FileTime::from_system_time(mtime))
            .map_err(|err| RemoteError::from_io(err, path))
    }

    fn read_file(&mut self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|err| RemoteError::from_io(err, path))
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        fs::write(path, data).map_err(|err| RemoteError::from_io(err, path))
    }
}
