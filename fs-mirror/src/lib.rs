mod diff;
mod entry;
mod scan;

pub use diff::{
    diff_trees, DeletePolicy, DiffOp, DiffOptions, TreeDiff, MTIME_TOLERANCE,
};
pub use entry::FileEntry;
pub use scan::{
    md5_hex, scan_local_tree, scan_remote_tree, ChannelDigests, DigestSource,
};
