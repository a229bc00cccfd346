use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use fs_mirror::md5_hex;
use remote_channel::{Channel, FileStat};
use remote_error::{RemoteError, Result};

use crate::{
    reconnect::{ChannelOpener, ReconnectingChannel},
    sync::{sync_tree, SyncOptions, SyncReport},
};

/// Options for [`Shell::mkdir`].
#[derive(Clone, Copy, Debug)]
pub struct MkdirOptions {
    /// Permission bits of the created directories
    pub mode: u32,
    /// Create missing parent directories
    pub parents: bool,
    /// Treat "already exists as a directory" as success
    pub exist_ok: bool,
}

impl Default for MkdirOptions {
    fn default() -> Self {
        MkdirOptions {
            mode: 0o777,
            parents: false,
            exist_ok: false,
        }
    }
}

/// Options for [`Shell::write_bytes`] and [`Shell::write_text`].
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    /// Create the parent directories of the destination
    pub create_directories: bool,
    /// Write to a temporary sibling first and rename it over the
    /// destination
    pub consistent: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            create_directories: true,
            consistent: true,
        }
    }
}

/// Options for [`Shell::put`].
#[derive(Clone, Copy, Debug)]
pub struct PutOptions {
    /// Create the parent directories of the remote destination
    pub create_directories: bool,
    /// Mirror the local permission bits onto the uploaded file; rename
    /// does not guarantee carrying them on every remote filesystem, so
    /// they are reapplied after the rename. Prior ownership of an
    /// overwritten destination is restored as well.
    pub preserve_permissions: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        PutOptions {
            create_directories: true,
            preserve_permissions: false,
        }
    }
}

/// Options for [`Shell::get`].
#[derive(Clone, Copy, Debug)]
pub struct GetOptions {
    /// Create the parent directories of the local destination
    pub create_directories: bool,
    /// Mirror the remote permission bits onto the downloaded file
    pub preserve_permissions: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        GetOptions {
            create_directories: true,
            preserve_permissions: false,
        }
    }
}

/// A session to one remote filesystem.
///
/// Owns a [`ReconnectingChannel`] and layers the convenience surface on
/// top of it: one-liners for reading/writing files, idempotent directory
/// creation, atomic get/put, md5 computation and directory
/// synchronization. Operations are strictly sequential; a caller needing
/// concurrency runs multiple independent sessions.
pub struct Shell {
    chan: ReconnectingChannel,
}

impl Shell {
    /// Build a session over any channel opener.
    pub fn over(opener: ChannelOpener) -> Self {
        Shell {
            chan: ReconnectingChannel::new(opener),
        }
    }

    /// Build a session around an already-open channel, keeping the
    /// opener for reconnects.
    pub fn with_channel(
        opener: ChannelOpener,
        channel: Box<dyn Channel + Send>,
    ) -> Self {
        Shell {
            chan: ReconnectingChannel::with_channel(opener, channel),
        }
    }

    /// The contained reconnecting channel, for fine-grained operations
    /// the convenience surface does not cover.
    pub fn as_channel(&mut self) -> &mut ReconnectingChannel {
        &mut self.chan
    }

    pub fn exists(&mut self, path: &Path) -> Result<bool> {
        match self.chan.stat(path) {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Stat the given remote path; `None` if it does not exist.
    pub fn stat(&mut self, path: &Path) -> Result<Option<FileStat>> {
        match self.chan.stat(path) {
            Ok(stat) => Ok(Some(stat)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn mkdir(
        &mut self,
        path: &Path,
        options: &MkdirOptions,
    ) -> Result<()> {
        mkdir_with(&mut self.chan, path, options)
    }

    pub fn read_bytes(&mut self, path: &Path) -> Result<Vec<u8>> {
        self.chan.read_file(path)
    }

    pub fn read_text(&mut self, path: &Path) -> Result<String> {
        let data = self.chan.read_file(path)?;
        String::from_utf8(data).map_err(|err| {
            RemoteError::Other(anyhow::anyhow!(
                "remote file {} is not valid UTF-8: {}",
                path.display(),
                err
            ))
        })
    }

    pub fn write_bytes(
        &mut self,
        path: &Path,
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<()> {
        if options.create_directories {
            self.ensure_parent(path)?;
        }
        if options.consistent {
            self.chan.put_file(data, path)
        } else {
            self.chan.write_file(path, data)
        }
    }

    pub fn write_text(
        &mut self,
        path: &Path,
        text: &str,
        options: &WriteOptions,
    ) -> Result<()> {
        self.write_bytes(path, text.as_bytes(), options)
    }

    /// Put a local file on the remote host, atomically.
    pub fn put(
        &mut self,
        local: &Path,
        remote: &Path,
        options: &PutOptions,
    ) -> Result<()> {
        let data =
            fs::read(local).map_err(|err| RemoteError::from_io(err, local))?;
        if options.create_directories {
            self.ensure_parent(remote)?;
        }
        let previous = self.stat(remote)?;

        self.chan.put_file(&data, remote)?;

        if options.preserve_permissions {
            let metadata = fs::metadata(local)
                .map_err(|err| RemoteError::from_io(err, local))?;
            self.chan.chmod(remote, local_mode(&metadata))?;
            if let Some(previous) = previous {
                self.chan.chown(remote, previous.uid, previous.gid)?;
            }
        }
        Ok(())
    }

    /// Fetch a remote file to a local path, atomically.
    pub fn get(
        &mut self,
        remote: &Path,
        local: &Path,
        options: &GetOptions,
    ) -> Result<()> {
        if options.create_directories {
            if let Some(parent) = local.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|err| {
                        RemoteError::from_io(err, parent)
                    })?;
                }
            }
        }
        self.chan.get_file(remote, local)?;

        if options.preserve_permissions {
            let stat = self.chan.stat(remote)?;
            set_local_mode(local, stat.mode)?;
        }
        Ok(())
    }

    pub fn chmod(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.chan.chmod(path, mode)
    }

    pub fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.chan.chown(path, uid, gid)
    }

    /// MD5 checksum of a remote file, as a hex digest.
    pub fn md5(&mut self, path: &Path) -> Result<String> {
        let data = self.chan.read_file(path)?;
        Ok(md5_hex(&data))
    }

    /// MD5 checksums of multiple remote files, individually; a missing
    /// file maps to `None`.
    pub fn md5_many(
        &mut self,
        paths: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, Option<String>>> {
        let mut digests = BTreeMap::new();
        for path in paths {
            let digest = match self.chan.read_file(path) {
                Ok(data) => Some(md5_hex(&data)),
                Err(RemoteError::NotFound(_)) => None,
                Err(err) => return Err(err),
            };
            digests.insert(path.clone(), digest);
        }
        Ok(digests)
    }

    /// Make the remote directory an exact mirror of the local one.
    pub fn sync_to_remote(
        &mut self,
        local_root: &Path,
        remote_root: &Path,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        sync_tree(&mut self.chan, local_root, remote_root, options)
    }

    /// Close the session, releasing the channel and the underlying
    /// connection resources. Also runs on drop.
    pub fn close(&mut self) {
        self.chan.close();
    }

    fn ensure_parent(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                mkdir_with(
                    &mut self.chan,
                    parent,
                    &MkdirOptions {
                        mode: 0o777,
                        parents: true,
                        exist_ok: true,
                    },
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared mkdir semantics for the shell surface and the sync driver.
pub(crate) fn mkdir_with(
    chan: &mut ReconnectingChannel,
    path: &Path,
    options: &MkdirOptions,
) -> Result<()> {
    match chan.stat(path) {
        Ok(stat) if stat.is_dir() => {
            return if options.exist_ok {
                Ok(())
            } else {
                Err(RemoteError::AlreadyExists(path.to_path_buf()))
            };
        }
        Ok(_) => {
            return Err(RemoteError::Conflict(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        Err(RemoteError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    if options.parents {
        let mut ancestors: Vec<&Path> = path
            .ancestors()
            .skip(1)
            .filter(|ancestor| {
                !ancestor.as_os_str().is_empty()
                    && ancestor.parent().is_some()
            })
            .collect();
        ancestors.reverse();

        for ancestor in ancestors {
            match chan.stat(ancestor) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => {
                    return Err(RemoteError::Conflict(format!(
                        "{} exists and is not a directory",
                        ancestor.display()
                    )));
                }
                Err(RemoteError::NotFound(_)) => {
                    match chan.mkdir(ancestor, options.mode) {
                        Ok(()) => {}
                        // Another writer may have won the race.
                        Err(RemoteError::AlreadyExists(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    } else if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && parent.parent().is_some() {
            match chan.stat(parent) {
                Ok(_) => {}
                Err(RemoteError::NotFound(_)) => {
                    return Err(RemoteError::NotFound(parent.to_path_buf()));
                }
                Err(err) => return Err(err),
            }
        }
    }

    match chan.mkdir(path, options.mode) {
        Ok(()) => Ok(()),
        Err(RemoteError::AlreadyExists(_)) if options.exist_ok => Ok(()),
        Err(err) => Err(err),
    }
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

#[cfg(unix)]
fn set_local_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| RemoteError::from_io(err, path))
}

#[cfg(not(unix))]
fn set_local_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
