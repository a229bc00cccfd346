use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use md5::{Digest, Md5};
use walkdir::WalkDir;

use remote_channel::{Channel, EntryKind, FileStat};
use remote_error::{RemoteError, Result};

use crate::entry::FileEntry;

/// Walk a local directory tree into a flat mapping keyed by relative path.
///
/// Symlinks are not followed; they become atomic leaf entries carrying
/// their target. Nothing is filtered: the scan is an exact inventory of
/// the tree.
pub fn scan_local_tree(root: &Path) -> Result<BTreeMap<PathBuf, FileEntry>> {
    log::debug!("Scanning local tree at {:?}", root);

    let mut entries = BTreeMap::new();
    for dir_entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let dir_entry = dir_entry.map_err(|err| {
            RemoteError::Other(anyhow::anyhow!(
                "failed to walk {}: {}",
                root.display(),
                err
            ))
        })?;
        let path = dir_entry.path();

        let metadata = fs::symlink_metadata(path)
            .map_err(|err| RemoteError::from_io(err, path))?;
        let stat = local_stat(&metadata, path)?;

        let relative = path
            .strip_prefix(root)
            .map_err(|err| {
                RemoteError::Other(anyhow::anyhow!(
                    "entry {} escapes the scan root {}: {}",
                    path.display(),
                    root.display(),
                    err
                ))
            })?
            .to_path_buf();

        let mut entry = FileEntry::from_stat(relative.clone(), &stat);
        if entry.kind == EntryKind::Symlink {
            entry.link_target = Some(
                fs::read_link(path)
                    .map_err(|err| RemoteError::from_io(err, path))?,
            );
        }
        entries.insert(relative, entry);
    }

    log::trace!("Local scan of {:?} found {} entries", root, entries.len());
    Ok(entries)
}

/// Walk a remote directory tree through a channel into a flat mapping
/// keyed by relative path.
///
/// Mirror of [`scan_local_tree`] on the remote side: listing is
/// lstat-based, symlinked directories are not descended into.
pub fn scan_remote_tree(
    chan: &mut dyn Channel,
    root: &Path,
) -> Result<BTreeMap<PathBuf, FileEntry>> {
    log::debug!("Scanning remote tree at {:?}", root);

    let mut entries = BTreeMap::new();
    walk_remote(chan, root, root, &mut entries)?;

    log::trace!("Remote scan of {:?} found {} entries", root, entries.len());
    Ok(entries)
}

fn walk_remote(
    chan: &mut dyn Channel,
    root: &Path,
    dir: &Path,
    entries: &mut BTreeMap<PathBuf, FileEntry>,
) -> Result<()> {
    for (path, stat) in chan.list(dir)? {
        let relative = path
            .strip_prefix(root)
            .map_err(|err| {
                RemoteError::Other(anyhow::anyhow!(
                    "entry {} escapes the scan root {}: {}",
                    path.display(),
                    root.display(),
                    err
                ))
            })?
            .to_path_buf();

        let mut entry = FileEntry::from_stat(relative.clone(), &stat);
        match stat.kind {
            EntryKind::Dir => {
                entries.insert(relative, entry);
                walk_remote(chan, root, &path, entries)?;
            }
            EntryKind::Symlink => {
                entry.link_target = Some(chan.readlink(&path)?);
                entries.insert(relative, entry);
            }
            _ => {
                entries.insert(relative, entry);
            }
        }
    }
    Ok(())
}

fn local_stat(metadata: &fs::Metadata, path: &Path) -> Result<FileStat> {
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
        mode: local_mode(metadata),
        uid: 0,
        gid: 0,
    })
}

#[cfg(unix)]
fn local_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn local_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Hex-encoded MD5 digest of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    digest
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// On-demand content digests for the diff engine.
///
/// Digests are only computed when the cheaper size comparison cannot
/// settle a path, so they stay behind a seam the diff can call into
/// lazily.
pub trait DigestSource {
    fn local_md5(&mut self, relative: &Path) -> Result<String>;
    fn remote_md5(&mut self, relative: &Path) -> Result<String>;
}

/// A [`DigestSource`] reading local content from disk and remote content
/// through a channel.
pub struct ChannelDigests<'a> {
    local_root: &'a Path,
    remote_root: &'a Path,
    chan: &'a mut dyn Channel,
}

impl<'a> ChannelDigests<'a> {
    pub fn new(
        local_root: &'a Path,
        remote_root: &'a Path,
        chan: &'a mut dyn Channel,
    ) -> Self {
        ChannelDigests {
            local_root,
            remote_root,
            chan,
        }
    }
}

impl DigestSource for ChannelDigests<'_> {
    fn local_md5(&mut self, relative: &Path) -> Result<String> {
        let path = self.local_root.join(relative);
        let data =
            fs::read(&path).map_err(|err| RemoteError::from_io(err, &path))?;
        Ok(md5_hex(&data))
    }

    fn remote_md5(&mut self, relative: &Path) -> Result<String> {
        let path = self.remote_root.join(relative);
        let data = self.chan.read_file(&path)?;
        Ok(md5_hex(&data))
    }
}
