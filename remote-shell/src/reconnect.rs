use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use remote_channel::{Channel, FileStat};
use remote_error::{RemoteError, Result};

/// Opens a fresh channel from the original connection parameters.
///
/// Called once at session start and once per reconnect; every invocation
/// must produce a fully authenticated, independent channel.
pub type ChannelOpener = Box<dyn FnMut() -> Result<Box<dyn Channel + Send>> + Send>;

/// Owns the single live channel of a session.
///
/// The handle knows how to re-establish the channel but never retries on
/// its own: [`TransportHandle::ensure_connected`] performs exactly one
/// open attempt per call, leaving retry counting to the wrapper above.
pub struct TransportHandle {
    opener: ChannelOpener,
    channel: Option<Box<dyn Channel + Send>>,
}

impl TransportHandle {
    pub fn new(opener: ChannelOpener) -> Self {
        TransportHandle {
            opener,
            channel: None,
        }
    }

    /// Build a handle around an already-open channel, keeping the opener
    /// for later reconnects.
    pub fn with_channel(
        opener: ChannelOpener,
        channel: Box<dyn Channel + Send>,
    ) -> Self {
        TransportHandle {
            opener,
            channel: Some(channel),
        }
    }

    /// Return a usable channel, opening a new one if the current channel
    /// is absent or has been marked dead.
    ///
    /// A failed open surfaces as [`RemoteError::Connection`]. Replacing
    /// the channel silently drops whatever state the previous one had.
    pub fn ensure_connected(&mut self) -> Result<&mut (dyn Channel + Send)> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => {
                log::debug!("Opening the transport channel");
                (self.opener)().map_err(|err| match err {
                    err @ RemoteError::Connection(_) => err,
                    other => RemoteError::Connection(other.to_string()),
                })?
            }
        };
        Ok(self.channel.insert(channel).as_mut())
    }

    /// Invalidate the current channel without discarding the session
    /// identity; the next [`TransportHandle::ensure_connected`] call will
    /// open a fresh one.
    pub fn mark_dead(&mut self) {
        if self.channel.take().is_some() {
            log::warn!("Transport channel marked dead");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Release the channel and its underlying connection resources.
    pub fn close(&mut self) {
        self.channel = None;
    }
}

/// A [`Channel`] that survives connection loss.
///
/// Every operation runs under a uniform policy: on a failure classified
/// as a connectivity failure the channel is marked dead, re-opened, and
/// the operation retried exactly once; a second connectivity failure is
/// terminal and surfaces as [`RemoteError::Connection`]. Semantic
/// failures (not found, permission denied, already exists) propagate
/// immediately and are never retried.
pub struct ReconnectingChannel {
    handle: TransportHandle,
}

impl ReconnectingChannel {
    pub fn new(opener: ChannelOpener) -> Self {
        ReconnectingChannel {
            handle: TransportHandle::new(opener),
        }
    }

    pub fn with_channel(
        opener: ChannelOpener,
        channel: Box<dyn Channel + Send>,
    ) -> Self {
        ReconnectingChannel {
            handle: TransportHandle::with_channel(opener, channel),
        }
    }

    pub fn handle(&mut self) -> &mut TransportHandle {
        &mut self.handle
    }

    pub fn close(&mut self) {
        self.handle.close();
    }

    fn run<T>(
        &mut self,
        op: &str,
        f: impl Fn(&mut (dyn Channel + Send)) -> Result<T>,
    ) -> Result<T> {
        let channel = self.handle.ensure_connected()?;
        match f(channel) {
            Err(err) if err.is_connectivity() => {
                log::warn!(
                    "{} failed on a connectivity error, retrying once: {}",
                    op,
                    err
                );
                self.handle.mark_dead();
                let channel = self.handle.ensure_connected()?;
                f(channel).map_err(|err| {
                    if err.is_connectivity() {
                        RemoteError::Connection(format!(
                            "{} failed again after a reconnect: {}",
                            op, err
                        ))
                    } else {
                        err
                    }
                })
            }
            outcome => outcome,
        }
    }

    /// Atomically fetch a remote file to a local path.
    ///
    /// The content lands in a temporary sibling of the destination and is
    /// renamed over it; on failure the destination is left untouched and
    /// the temporary is removed.
    pub fn get_file(&mut self, remote: &Path, local: &Path) -> Result<()> {
        let data = self.read_file(remote)?;
        let tmp = tmp_sibling(local)?;
        if let Err(err) = fs::write(&tmp, &data) {
            let _ = fs::remove_file(&tmp);
            return Err(RemoteError::from_io(err, &tmp));
        }
        if let Err(err) = fs::rename(&tmp, local) {
            let _ = fs::remove_file(&tmp);
            return Err(RemoteError::from_io(err, local));
        }
        Ok(())
    }

    /// Atomically write a whole file to a remote path.
    ///
    /// The content goes to a temporary sibling first and is renamed over
    /// the destination, so a reconnect mid-transfer never leaves a
    /// partial file visible there. A retried attempt restarts the whole
    /// file under a fresh temporary name; the temporary of the failed
    /// attempt cannot collide with it and is removed best-effort once the
    /// transfer succeeds.
    pub fn put_file(&mut self, data: &[u8], remote: &Path) -> Result<()> {
        let mut stale_tmp: Option<PathBuf> = None;
        let mut retried = false;
        loop {
            let tmp = tmp_sibling(remote)?;
            let channel = self.handle.ensure_connected()?;
            let outcome = channel
                .write_file(&tmp, data)
                .and_then(|()| channel.rename(&tmp, remote));
            match outcome {
                Ok(()) => {
                    if let Some(stale) = stale_tmp {
                        if let Ok(channel) = self.handle.ensure_connected() {
                            let _ = channel.remove(&stale);
                        }
                    }
                    return Ok(());
                }
                Err(err) if err.is_connectivity() && !retried => {
                    log::warn!(
                        "Transfer to {:?} interrupted, restarting from \
                         scratch: {}",
                        remote,
                        err
                    );
                    retried = true;
                    stale_tmp = Some(tmp);
                    self.handle.mark_dead();
                }
                Err(err) if err.is_connectivity() => {
                    return Err(RemoteError::Connection(format!(
                        "transfer to {} failed again after a reconnect: {}",
                        remote.display(),
                        err
                    )));
                }
                Err(err) => {
                    // The channel is still usable after a semantic
                    // failure; drop the temporary before surfacing it.
                    let _ = channel.remove(&tmp);
                    return Err(err);
                }
            }
        }
    }
}

/// A temporary sibling of `path`: `<name>.<random-suffix>.tmp` in the
/// same directory, so the final rename stays within one filesystem.
fn tmp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        RemoteError::Conflict(format!(
            "destination {} has no file name",
            path.display()
        ))
    })?;
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(10)
        .collect();
    let mut tmp_name = name.to_os_string();
    tmp_name.push(format!(".{}.tmp", suffix));
    Ok(path.with_file_name(tmp_name))
}

impl Channel for ReconnectingChannel {
    fn stat(&mut self, path: &Path) -> Result<FileStat> {
        self.run("stat", |chan| chan.stat(path))
    }

    fn lstat(&mut self, path: &Path) -> Result<FileStat> {
        self.run("lstat", |chan| chan.lstat(path))
    }

    fn list(&mut self, path: &Path) -> Result<Vec<(PathBuf, FileStat)>> {
        self.run("list", |chan| chan.list(path))
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.run("mkdir", |chan| chan.mkdir(path, mode))
    }

    fn rmdir(&mut self, path: &Path) -> Result<()> {
        self.run("rmdir", |chan| chan.rmdir(path))
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.run("remove", |chan| chan.remove(path))
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.run("rename", |chan| chan.rename(from, to))
    }

    fn readlink(&mut self, path: &Path) -> Result<PathBuf> {
        self.run("readlink", |chan| chan.readlink(path))
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.run("symlink", |chan| chan.symlink(target, link))
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.run("chmod", |chan| chan.chmod(path, mode))
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.run("chown", |chan| chan.chown(path, uid, gid))
    }

    fn set_mtime(&mut self, path: &Path, mtime: SystemTime) -> Result<()> {
        self.run("set_mtime", |chan| chan.set_mtime(path, mtime))
    }

    fn read_file(&mut self, path: &Path) -> Result<Vec<u8>> {
        self.run("read", |chan| chan.read_file(path))
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        self.run("write", |chan| chan.write_file(path, data))
    }
}
