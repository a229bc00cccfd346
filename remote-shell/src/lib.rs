//! Management of remote machines over a resilient file-transfer channel.
//!
//! The session surface is [`Shell`]: convenience operations (mkdir,
//! read/write helpers, atomic get/put, md5) plus directory
//! synchronization, all routed through a [`ReconnectingChannel`] that
//! transparently re-opens the underlying channel after a connection loss
//! and retries the interrupted operation exactly once.

#[cfg(feature = "ssh2-backend")]
mod endpoint;
mod reconnect;
mod shell;
mod sync;

#[cfg(feature = "ssh2-backend")]
pub use endpoint::{connect_with_retries, ConnectOptions, RemoteEndpoint};
pub use reconnect::{ChannelOpener, ReconnectingChannel, TransportHandle};
pub use shell::{GetOptions, MkdirOptions, PutOptions, Shell, WriteOptions};
pub use sync::{SyncOptions, SyncOutcome, SyncReport};

pub use fs_mirror::DeletePolicy;
pub use remote_channel::{Channel, EntryKind, FileStat};
#[cfg(feature = "ssh2-backend")]
pub use remote_channel::SshAuth;
pub use remote_error::{RemoteError, Result};
