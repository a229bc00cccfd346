use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

use fs_mirror::{
    diff_trees, scan_local_tree, scan_remote_tree, ChannelDigests,
    DeletePolicy, DiffOp, DiffOptions,
};
use remote_channel::{Channel, EntryKind};
use remote_error::{RemoteError, Result};

use crate::{
    reconnect::ReconnectingChannel,
    shell::{mkdir_with, MkdirOptions},
};

/// Options for [`crate::Shell::sync_to_remote`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    /// Whether extraneous remote entries are removed, and when
    pub delete: DeletePolicy,
    /// Mirror local permission bits onto the remote tree
    pub preserve_permissions: bool,
    /// Compare file content by MD5 digest instead of modification time
    pub checksum: bool,
}

/// The outcome of one path of a sync run.
#[derive(PartialEq, Eq, Clone, Debug, Serialize)]
pub enum SyncOutcome {
    /// A change was applied for this path
    Applied,
    /// The path was already identical on both sides
    Unchanged,
    /// The planned change failed; the reason is carried verbatim
    Failed(String),
}

/// Per-path outcomes of one sync run.
///
/// A failed run still reports every attempted path, so callers can
/// distinguish "nothing changed" from "partially applied".
#[derive(Default, Debug, Serialize)]
pub struct SyncReport {
    entries: BTreeMap<PathBuf, SyncOutcome>,
}

impl SyncReport {
    fn record(&mut self, path: PathBuf, outcome: SyncOutcome) {
        self.entries.insert(path, outcome);
    }

    pub fn entries(&self) -> &BTreeMap<PathBuf, SyncOutcome> {
        &self.entries
    }

    pub fn outcome(&self, path: impl AsRef<Path>) -> Option<&SyncOutcome> {
        self.entries.get(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if nothing needed to change.
    pub fn all_unchanged(&self) -> bool {
        self.entries
            .values()
            .all(|outcome| *outcome == SyncOutcome::Unchanged)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.entries.iter().filter_map(|(path, outcome)| {
            match outcome {
                SyncOutcome::Failed(reason) => {
                    Some((path.as_path(), reason.as_str()))
                }
                _ => None,
            }
        })
    }
}

/// Apply the ordered diff of the two trees through the reconnecting
/// channel, best-effort.
///
/// A failure on one operation is recorded and does not abort the
/// remaining ones, with two exceptions: a failed directory creation
/// poisons everything scoped under it (attempting those would only
/// produce misleading secondary errors), and a terminal connection
/// failure aborts the run since no further operation can succeed.
pub(crate) fn sync_tree(
    chan: &mut ReconnectingChannel,
    local_root: &Path,
    remote_root: &Path,
    options: &SyncOptions,
) -> Result<SyncReport> {
    log::debug!(
        "Syncing local tree {:?} to remote tree {:?}",
        local_root,
        remote_root
    );

    let local = scan_local_tree(local_root)?;
    mkdir_with(
        chan,
        remote_root,
        &MkdirOptions {
            mode: 0o777,
            parents: true,
            exist_ok: true,
        },
    )?;
    let remote = scan_remote_tree(chan, remote_root)?;

    let diff_options = DiffOptions {
        delete: options.delete,
        preserve_permissions: options.preserve_permissions,
        checksum: options.checksum,
    };
    let tree_diff = {
        let mut digests =
            ChannelDigests::new(local_root, remote_root, chan);
        diff_trees(&local, &remote, &diff_options, &mut digests)?
    };
    log::debug!(
        "Planned {} operations, {} paths unchanged",
        tree_diff.ops.len(),
        tree_diff.unchanged.len()
    );

    let mut report = SyncReport::default();
    for path in tree_diff.unchanged {
        report.record(path, SyncOutcome::Unchanged);
    }

    let mut failed_dirs: Vec<PathBuf> = vec![];
    for op in &tree_diff.ops {
        let path = op.path().to_path_buf();

        if let Some(dir) = failed_dirs
            .iter()
            .find(|dir| path != **dir && path.starts_with(dir))
        {
            report.record(
                path,
                SyncOutcome::Failed(format!(
                    "parent missing: {}",
                    dir.display()
                )),
            );
            continue;
        }

        match apply_op(chan, local_root, remote_root, op, options) {
            Ok(()) => report.record(path, SyncOutcome::Applied),
            Err(err @ RemoteError::Connection(_)) => return Err(err),
            Err(err) => {
                log::warn!("Sync operation on {:?} failed: {}", path, err);
                if let DiffOp::Create { entry, .. } = op {
                    if entry.is_dir() {
                        failed_dirs.push(path.clone());
                    }
                }
                report.record(path, SyncOutcome::Failed(err.to_string()));
            }
        }
    }

    Ok(report)
}

fn apply_op(
    chan: &mut ReconnectingChannel,
    local_root: &Path,
    remote_root: &Path,
    op: &DiffOp,
    options: &SyncOptions,
) -> Result<()> {
    let remote_path = remote_root.join(op.path());
    match op {
        DiffOp::Delete { kind, .. } => {
            if *kind == EntryKind::Dir {
                chan.rmdir(&remote_path)
            } else {
                chan.remove(&remote_path)
            }
        }
        DiffOp::Create { entry, .. } | DiffOp::Update { entry, .. } => {
            let fresh = matches!(op, DiffOp::Create { .. });
            match entry.kind {
                EntryKind::Dir => {
                    if fresh {
                        let mode = if options.preserve_permissions {
                            entry.mode
                        } else {
                            0o755
                        };
                        chan.mkdir(&remote_path, mode)?;
                    }
                    if options.preserve_permissions {
                        // mkdir modes pass through the process umask on
                        // some backends; chmod pins the exact bits.
                        chan.chmod(&remote_path, entry.mode)?;
                    }
                    Ok(())
                }
                EntryKind::Symlink => {
                    let target =
                        entry.link_target.clone().ok_or_else(|| {
                            RemoteError::Conflict(format!(
                                "symlink {} has no target",
                                entry.path.display()
                            ))
                        })?;
                    if !fresh {
                        chan.remove(&remote_path)?;
                    }
                    chan.symlink(&target, &remote_path)
                }
                EntryKind::File => {
                    let source = local_root.join(&entry.path);
                    let data = fs::read(&source).map_err(|err| {
                        RemoteError::from_io(err, &source)
                    })?;
                    chan.put_file(&data, &remote_path)?;
                    if options.preserve_permissions {
                        chan.chmod(&remote_path, entry.mode)?;
                    }
                    // Carry the source mtime so the next scan sees this
                    // path as unchanged.
                    chan.set_mtime(&remote_path, entry.mtime)
                }
                EntryKind::Other => Err(RemoteError::Conflict(format!(
                    "cannot transfer non-regular entry {}",
                    entry.path.display()
                ))),
            }
        }
    }
}
