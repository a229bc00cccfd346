use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};

use remote_error::{RemoteError, Result};

use crate::channel::{Channel, EntryKind, FileStat};

// SFTP status codes of interest (draft-ietf-secsh-filexfer-02)
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;
const SFTP_FAILURE: i32 = 4;
const SFTP_NO_CONNECTION: i32 = 6;
const SFTP_CONNECTION_LOST: i32 = 7;
const SFTP_FILE_ALREADY_EXISTS: i32 = 11;

/// How to authenticate an SSH session.
#[derive(Clone, Debug)]
pub enum SshAuth {
    Password(String),
    /// Path to a private key file, with an optional passphrase.
    KeyFile {
        key: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

/// A [`Channel`] over an SFTP sub-channel of a live SSH session.
///
/// One instance corresponds to one authenticated session. There is no
/// repair path: after a connectivity failure the whole instance is
/// discarded and a new one is opened from the original connection
/// parameters.
pub struct Ssh2Channel {
    // Kept alive for the lifetime of the SFTP sub-channel; dropping the
    // session tears down the TCP connection.
    _session: Session,
    sftp: Sftp,
}

impl Ssh2Channel {
    /// Dial, handshake, authenticate and open the SFTP sub-channel.
    ///
    /// Performs a single attempt; retry loops live in the caller. When a
    /// timeout is given it bounds both the TCP dial and every subsequent
    /// operation on the session.
    pub fn connect(
        host: &str,
        port: u16,
        username: &str,
        auth: &SshAuth,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let tcp = dial(host, port, timeout)?;

        let mut session = Session::new().map_err(|err| {
            RemoteError::Connection(format!(
                "failed to create an SSH session: {}",
                err
            ))
        })?;
        if let Some(timeout) = timeout {
            session.set_timeout(timeout.as_millis() as u32);
        }
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|err| {
            RemoteError::Connection(format!(
                "SSH handshake with {}:{} failed: {}",
                host, port, err
            ))
        })?;

        match auth {
            SshAuth::Password(password) => {
                session.userauth_password(username, password)
            }
            SshAuth::KeyFile { key, passphrase } => session
                .userauth_pubkey_file(
                    username,
                    None,
                    key,
                    passphrase.as_deref(),
                ),
            SshAuth::Agent => session.userauth_agent(username),
        }
        .map_err(|err| {
            RemoteError::Connection(format!(
                "authentication of {}@{} failed: {}",
                username, host, err
            ))
        })?;

        let sftp = session.sftp().map_err(|err| {
            RemoteError::Connection(format!(
                "failed to open the SFTP sub-channel to {}: {}",
                host, err
            ))
        })?;

        log::debug!("Opened SFTP channel to {}@{}:{}", username, host, port);
        Ok(Ssh2Channel {
            _session: session,
            sftp,
        })
    }
}

fn dial(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let connected = match timeout {
        Some(timeout) => {
            let addr = (host, port)
                .to_socket_addrs()
                .map_err(|err| {
                    RemoteError::Connection(format!(
                        "failed to resolve {}:{}: {}",
                        host, port, err
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    RemoteError::Connection(format!(
                        "no address found for {}:{}",
                        host, port
                    ))
                })?;
            TcpStream::connect_timeout(&addr, timeout)
        }
        None => TcpStream::connect((host, port)),
    };
    connected.map_err(|err| {
        RemoteError::Connection(format!(
            "failed to dial {}:{}: {}",
            host, port, err
        ))
    })
}

fn map_err(err: ssh2::Error, path: &Path) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(code) => match code {
            SFTP_NO_SUCH_FILE => RemoteError::NotFound(path.to_path_buf()),
            SFTP_PERMISSION_DENIED => {
                RemoteError::PermissionDenied(path.to_path_buf())
            }
            SFTP_FILE_ALREADY_EXISTS => {
                RemoteError::AlreadyExists(path.to_path_buf())
            }
            SFTP_NO_CONNECTION | SFTP_CONNECTION_LOST => {
                RemoteError::Disconnected(err.to_string())
            }
            _ => RemoteError::Other(anyhow::anyhow!(
                "SFTP error on {}: {}",
                path.display(),
                err
            )),
        },
        // Session-level errors mean the transport itself is unusable.
        ErrorCode::Session(_) => RemoteError::Disconnected(err.to_string()),
    }
}

fn stat_of(stat: &ssh2::FileStat) -> FileStat {
    let file_type = stat.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    FileStat {
        kind,
        size: stat.size.unwrap_or(0),
        mtime: UNIX_EPOCH + Duration::from_secs(stat.mtime.unwrap_or(0)),
        mode: stat.perm.unwrap_or(0) & 0o7777,
        uid: stat.uid.unwrap_or(0),
        gid: stat.gid.unwrap_or(0),
    }
}

fn unix_seconds(mtime: SystemTime) -> u64 {
    mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn blank_stat() -> ssh2::FileStat {
    ssh2::FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: None,
        atime: None,
        mtime: None,
    }
}

impl Channel for Ssh2Channel {
    fn stat(&mut self, path: &Path) -> Result<FileStat> {
        let stat = self.sftp.stat(path).map_err(|err| map_err(err, path))?;
        Ok(stat_of(&stat))
    }

    fn lstat(&mut self, path: &Path) -> Result<FileStat> {
        let stat = self.sftp.lstat(path).map_err(|err| map_err(err, path))?;
        Ok(stat_of(&stat))
    }

    fn list(&mut self, path: &Path) -> Result<Vec<(PathBuf, FileStat)>> {
        let entries =
            self.sftp.readdir(path).map_err(|err| map_err(err, path))?;
        Ok(entries
            .into_iter()
            .map(|(entry_path, stat)| (entry_path, stat_of(&stat)))
            .collect())
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        match self.sftp.mkdir(path, mode as i32) {
            Ok(()) => Ok(()),
            // Many servers report a mkdir on an existing path as a generic
            // failure instead of FILE_ALREADY_EXISTS; disambiguate.
            Err(err)
                if err.code() == ErrorCode::SFTP(SFTP_FAILURE)
                    && self.sftp.stat(path).is_ok() =>
            {
                Err(RemoteError::AlreadyExists(path.to_path_buf()))
            }
            Err(err) => Err(map_err(err, path)),
        }
    }

    fn rmdir(&mut self, path: &Path) -> Result<()> {
        self.sftp.rmdir(path).map_err(|err| map_err(err, path))
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.sftp.unlink(path).map_err(|err| map_err(err, path))
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.sftp
            .rename(
                from,
                to,
                Some(
                    RenameFlags::OVERWRITE
                        | RenameFlags::ATOMIC
                        | RenameFlags::NATIVE,
                ),
            )
            .map_err(|err| map_err(err, from))
    }

    fn readlink(&mut self, path: &Path) -> Result<PathBuf> {
        self.sftp.readlink(path).map_err(|err| map_err(err, path))
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.sftp
            .symlink(target, link)
            .map_err(|err| map_err(err, link))
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> Result<()> {
        let stat = ssh2::FileStat {
            perm: Some(mode),
            ..blank_stat()
        };
        self.sftp
            .setstat(path, stat)
            .map_err(|err| map_err(err, path))
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        let stat = ssh2::FileStat {
            uid: Some(uid),
            gid: Some(gid),
            ..blank_stat()
        };
        self.sftp
            .setstat(path, stat)
            .map_err(|err| map_err(err, path))
    }

    fn set_mtime(&mut self, path: &Path, mtime: SystemTime) -> Result<()> {
        let seconds = unix_seconds(mtime);
        let stat = ssh2::FileStat {
            atime: Some(seconds),
            mtime: Some(seconds),
            ..blank_stat()
        };
        self.sftp
            .setstat(path, stat)
            .map_err(|err| map_err(err, path))
    }

    fn read_file(&mut self, path: &Path) -> Result<Vec<u8>> {
        let mut file =
            self.sftp.open(path).map_err(|err| map_err(err, path))?;
        let mut data = vec![];
        file.read_to_end(&mut data)
            .map_err(|err| RemoteError::from_io(err, path))?;
        Ok(data)
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = self
            .sftp
            .open_mode(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(|err| map_err(err, path))?;
        file.write_all(data)
            .map_err(|err| RemoteError::from_io(err, path))?;
        file.flush()
            .map_err(|err| RemoteError::from_io(err, path))?;
        Ok(())
    }
}
