mod channel;
mod local;
#[cfg(feature = "ssh2-backend")]
mod ssh;

pub use channel::{Channel, EntryKind, FileStat};
pub use local::LocalChannel;
#[cfg(feature = "ssh2-backend")]
pub use ssh::{Ssh2Channel, SshAuth};
