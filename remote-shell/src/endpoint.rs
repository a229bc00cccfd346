use std::{thread, time::Duration};

use remote_channel::{Channel, Ssh2Channel, SshAuth};
use remote_error::{RemoteError, Result};

use crate::shell::Shell;

/// Address and credentials of an SSH endpoint.
#[derive(Clone, Debug)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl RemoteEndpoint {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        auth: SshAuth,
    ) -> Self {
        RemoteEndpoint {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Knobs for the initial connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// TCP dial and handshake timeout; `None` blocks indefinitely
    pub connect_timeout: Option<Duration>,
    /// How many attempts to make before giving up
    pub retry_count: u32,
    /// Pause between consecutive attempts
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            connect_timeout: Some(Duration::from_secs(60)),
            retry_count: 12,
            retry_interval: Duration::from_secs(5),
        }
    }
}

fn open_channel(
    endpoint: &RemoteEndpoint,
    timeout: Option<Duration>,
) -> Result<Box<dyn Channel + Send>> {
    let channel = Ssh2Channel::connect(
        &endpoint.host,
        endpoint.port,
        &endpoint.username,
        &endpoint.auth,
        timeout,
    )?;
    Ok(Box::new(channel))
}

/// Open an SSH session, retrying failed attempts.
///
/// The endpoint is also captured as the session's opener, so a later
/// connection loss reconnects to the same address with the same
/// credentials.
pub fn connect_with_retries(
    endpoint: &RemoteEndpoint,
    options: &ConnectOptions,
) -> Result<Shell> {
    let attempts = options.retry_count.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match open_channel(endpoint, options.connect_timeout) {
            Ok(channel) => {
                let opener_endpoint = endpoint.clone();
                let timeout = options.connect_timeout;
                return Ok(Shell::with_channel(
                    Box::new(move || {
                        open_channel(&opener_endpoint, timeout)
                    }),
                    channel,
                ));
            }
            Err(err) => {
                log::warn!(
                    "Connection attempt {}/{} to {}:{} failed: {}",
                    attempt,
                    attempts,
                    endpoint.host,
                    endpoint.port,
                    err
                );
                last_err = Some(err);
                if attempt < attempts {
                    thread::sleep(options.retry_interval);
                }
            }
        }
    }

    let reason = last_err
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no attempt was made".into());
    Err(RemoteError::Connection(format!(
        "could not connect to {}:{} after {} attempts: {}",
        endpoint.host, endpoint.port, attempts, reason
    )))
}
