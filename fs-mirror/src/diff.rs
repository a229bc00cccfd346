use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use remote_channel::EntryKind;
use remote_error::Result;

use crate::{entry::FileEntry, scan::DigestSource};

/// The tolerance when comparing modification times.
///
/// SFTP carries timestamps with one-second granularity, so anything
/// below that is noise.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(1);

/// Whether extraneous remote entries are removed, and when.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum DeletePolicy {
    /// Leave extraneous remote entries in place
    #[default]
    None,
    /// Delete extraneous remote entries before transferring new content
    Before,
    /// Delete extraneous remote entries after transferring new content
    After,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiffOptions {
    pub delete: DeletePolicy,
    /// Mirror local permission bits onto the remote tree
    pub preserve_permissions: bool,
    /// Compare file content by MD5 digest instead of modification time
    pub checksum: bool,
}

/// One planned change needed to mirror the local tree onto the remote.
///
/// Creates and updates carry the local entry snapshot so applying them
/// needs no second scan of the source tree.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum DiffOp {
    Create { path: PathBuf, entry: FileEntry },
    Update { path: PathBuf, entry: FileEntry },
    Delete { path: PathBuf, kind: EntryKind },
}

impl DiffOp {
    pub fn path(&self) -> &Path {
        match self {
            DiffOp::Create { path, .. } => path,
            DiffOp::Update { path, .. } => path,
            DiffOp::Delete { path, .. } => path,
        }
    }
}

/// The result of diffing two trees: the ordered operations plus the
/// paths found identical on both sides.
#[derive(Debug)]
pub struct TreeDiff {
    pub ops: Vec<DiffOp>,
    pub unchanged: Vec<PathBuf>,
}

/// Compute the ordered operation sequence that transforms the remote
/// tree into an exact mirror of the local tree.
///
/// Ordering invariant: creations are emitted parents-before-children and
/// deletions children-before-parents. Writing into a not-yet-created
/// parent and removing a non-empty directory both fail, so the order is
/// mandatory, not cosmetic.
///
/// A path whose kind differs between the two sides is resolved as
/// delete-then-create, never as an update; those deletions (and the
/// deletions of everything beneath a replaced remote directory) are
/// conflicts, not extraneous entries, and are emitted ahead of the
/// transfers under every delete policy.
pub fn diff_trees(
    local: &BTreeMap<PathBuf, FileEntry>,
    remote: &BTreeMap<PathBuf, FileEntry>,
    options: &DiffOptions,
    digests: &mut dyn DigestSource,
) -> Result<TreeDiff> {
    // BTreeMap iteration is ascending by path, which is exactly the
    // parents-before-children order the transfers need.
    let mut transfers = vec![];
    let mut unchanged = vec![];
    let mut conflict_roots: Vec<PathBuf> = vec![];

    for (path, local_entry) in local {
        match remote.get(path) {
            None => transfers.push(DiffOp::Create {
                path: path.clone(),
                entry: local_entry.clone(),
            }),
            Some(remote_entry) if remote_entry.kind != local_entry.kind => {
                log::debug!(
                    "Kind mismatch at {:?}: local {:?}, remote {:?}",
                    path,
                    local_entry.kind,
                    remote_entry.kind
                );
                conflict_roots.push(path.clone());
                transfers.push(DiffOp::Create {
                    path: path.clone(),
                    entry: local_entry.clone(),
                });
            }
            Some(remote_entry) => {
                if entry_changed(
                    path,
                    local_entry,
                    remote_entry,
                    options,
                    digests,
                )? {
                    transfers.push(DiffOp::Update {
                        path: path.clone(),
                        entry: local_entry.clone(),
                    });
                } else {
                    unchanged.push(path.clone());
                }
            }
        }
    }

    let mut forced_deletes = vec![];
    let mut extraneous_deletes = vec![];

    for (path, remote_entry) in remote {
        let delete = DiffOp::Delete {
            path: path.clone(),
            kind: remote_entry.kind,
        };
        match local.get(path) {
            Some(local_entry) if local_entry.kind == remote_entry.kind => {}
            Some(_) => forced_deletes.push(delete),
            None if under_conflict(&conflict_roots, path) => {
                forced_deletes.push(delete)
            }
            None if options.delete != DeletePolicy::None => {
                extraneous_deletes.push(delete)
            }
            None => {}
        }
    }

    // Children before parents
    forced_deletes.sort_by(|a, b| b.path().cmp(a.path()));
    extraneous_deletes.sort_by(|a, b| b.path().cmp(a.path()));

    let ops = match options.delete {
        DeletePolicy::Before => {
            let mut deletes = extraneous_deletes;
            deletes.append(&mut forced_deletes);
            deletes.sort_by(|a, b| b.path().cmp(a.path()));
            deletes.into_iter().chain(transfers).collect()
        }
        DeletePolicy::After => forced_deletes
            .into_iter()
            .chain(transfers)
            .chain(extraneous_deletes)
            .collect(),
        DeletePolicy::None => {
            forced_deletes.into_iter().chain(transfers).collect()
        }
    };

    Ok(TreeDiff { ops, unchanged })
}

fn under_conflict(conflict_roots: &[PathBuf], path: &Path) -> bool {
    conflict_roots
        .iter()
        .any(|root| path != root && path.starts_with(root))
}

fn entry_changed(
    path: &Path,
    local: &FileEntry,
    remote: &FileEntry,
    options: &DiffOptions,
    digests: &mut dyn DigestSource,
) -> Result<bool> {
    let changed = match local.kind {
        // Directories are structural: their existence matters, their
        // content is diffed entry by entry.
        EntryKind::Dir => {
            options.preserve_permissions && local.mode != remote.mode
        }
        EntryKind::Symlink => local.link_target != remote.link_target,
        EntryKind::File => {
            if options.preserve_permissions && local.mode != remote.mode {
                true
            } else if local.size != remote.size {
                true
            } else if options.checksum {
                digests.local_md5(path)? != digests.remote_md5(path)?
            } else {
                mtime_delta(local, remote) > MTIME_TOLERANCE
            }
        }
        EntryKind::Other => {
            log::warn!(
                "Cannot compare non-regular entry {:?}, leaving it alone",
                path
            );
            false
        }
    };
    Ok(changed)
}

fn mtime_delta(local: &FileEntry, remote: &FileEntry) -> Duration {
    match local.mtime.duration_since(remote.mtime) {
        Ok(delta) => delta,
        Err(err) => err.duration(),
    }
}
